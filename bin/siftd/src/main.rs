//! chainsift search daemon.
//!
//! One subcommand per tier:
//!
//! ```text
//! siftd indexer       batch-index block files into shard artifacts
//! siftd archive       serve irreversible history from the shard pool
//! siftd live          follow the reversible head
//! siftd forkresolver  resolve undo matches for orphaned blocks
//! siftd router        fan client queries across the tiers
//! ```
//!
//! The daemon wires the tiers against local stores and the in-process
//! mesh; mounting the service traits on a gRPC listener and pointing the
//! stores at S3/GCS is transport glue layered on top.

mod config;
mod mapper;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chainsift_archive::{ArchiveBackend, ArchiveMetrics, IndexPool, Truncator};
use chainsift_core::{SearchResult, ShardModel};
use chainsift_forkresolver::ForkResolver;
use chainsift_index::PreIndexer;
use chainsift_indexer::{Indexer, IndexerConfig, IndexerMetrics, Pipeline};
use chainsift_live::{LiveTail, LiveTailConfig};
use chainsift_mesh::{highest_archive_irr, InMemoryMesh, MeshClient, PeerHandle, SearchPeer, Tier};
use chainsift_router::{InProcessDialer, Router, RouterConfig};
use chainsift_store::{FsStore, Store};
use clap::{Args, Parser, Subcommand};
use prometheus_client::registry::Registry;
use tokio::sync::watch;

use config::SiftConfig;
use mapper::JsonPayloadMapper;

#[derive(Parser)]
#[command(name = "siftd")]
#[command(about = "chainsift search service daemon")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "siftd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Batch-index block files into shard artifacts.
    Indexer(IndexerArgs),
    /// Serve irreversible history from the shard pool.
    Archive,
    /// Follow the reversible head.
    Live,
    /// Resolve undo matches for orphaned blocks.
    Forkresolver,
    /// Fan client queries across the tiers.
    Router,
}

#[derive(Args)]
struct IndexerArgs {
    /// Override the configured start block.
    #[arg(long)]
    start_block: Option<u64>,

    /// Override the configured stop block.
    #[arg(long)]
    stop_block: Option<u64>,
}

fn init_tracing(directive: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Flip the returned watch to `true` on ctrl-c.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = tx.send(true);
        }
    });
    rx
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match SiftConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.log_level);

    let result = match cli.command {
        Commands::Indexer(args) => run_indexer(config, args).await,
        Commands::Archive => run_archive(config).await,
        Commands::Live => run_live(config).await,
        Commands::Forkresolver => run_forkresolver(config).await,
        Commands::Router => run_router(config).await,
    };

    if let Err(err) = result {
        tracing::error!(%err, "siftd terminated with error");
        std::process::exit(1);
    }
}

fn shard_model(config: &SiftConfig) -> SearchResult<ShardModel> {
    ShardModel::new(config.shards.shard_size)
}

async fn run_indexer(config: SiftConfig, args: IndexerArgs) -> SearchResult<()> {
    let model = shard_model(&config)?;
    let indexes_store: Arc<dyn Store> = Arc::new(FsStore::new(&config.store.indexes_path));
    let blocks_store: Arc<dyn Store> = Arc::new(FsStore::new(&config.store.blocks_path));

    let requested_start = args.start_block.unwrap_or(config.indexer.start_block);
    let start_block =
        Indexer::next_base_after(model, indexes_store.as_ref(), requested_start).await?;
    let stop_block = args.stop_block.unwrap_or(config.indexer.stop_block);
    tracing::info!(requested_start, start_block, stop_block, "indexer resuming");

    let mut registry = Registry::default();
    let pipeline = Pipeline::new(
        PreIndexer::new(Arc::new(JsonPayloadMapper)),
        model,
        &config.shards.writable_dir,
        indexes_store,
        config.indexer.enable_upload,
        config.indexer.delete_after_upload,
        config.indexer.upload_threads,
        IndexerMetrics::register(&mut registry),
    );
    let indexer = Indexer::new_batch(
        pipeline,
        model,
        blocks_store,
        IndexerConfig {
            start_block,
            stop_block,
            lookback: config.indexer.lookback,
        },
    )?;

    indexer.run(shutdown_signal()).await?;
    tracing::info!("indexing completed successfully");
    Ok(())
}

async fn run_archive(config: SiftConfig) -> SearchResult<()> {
    let model = shard_model(&config)?;
    let store: Arc<dyn Store> = Arc::new(FsStore::new(&config.store.indexes_path));
    let mesh: Arc<dyn MeshClient> = Arc::new(InMemoryMesh::new());
    let publish_duration = Duration::from_secs(config.mesh.publish_duration_secs);

    let peer = Arc::new(PeerHandle::new(
        SearchPeer::new(
            "localhost:9000",
            Tier::Archive,
            0,
            env!("CARGO_PKG_VERSION"),
            model.shard_size(),
        ),
        Arc::clone(&mesh),
    ));
    peer.republish().await?;

    let irr = highest_archive_irr(&mesh.peers());
    let start_block = model.resolve_start_block(config.archive.start_block, irr)?;
    tracing::info!(
        configured = config.archive.start_block,
        resolved = start_block,
        irr,
        "start block resolved"
    );

    let pool = Arc::new(IndexPool::new(&config.shards.local_dir, model, store));
    pool.clean_on_disk_indexes(start_block, config.archive.stop_block)
        .await?;
    if config.archive.sync_from_store {
        pool.sync_from_storage(
            start_block,
            config.archive.stop_block,
            config.archive.sync_max_shards,
            config.archive.download_threads,
        )
        .await?;
    }
    pool.scan_on_disk_indexes(start_block).await?;
    pool.set_lowest_serveable_block_num(start_block);

    let last_irr = pool.last_read_only_indexed_block();
    let last_irr_id = pool.last_read_only_indexed_block_id();
    peer.locked(|p| {
        p.tail_block = start_block;
        p.irr_block = last_irr;
        p.irr_block_id = last_irr_id.clone();
        p.head_block = last_irr;
        p.moving_tail = config.archive.start_block < 0;
        p.moving_head = config.archive.stop_block == 0;
    })
    .await?;

    let shutdown = shutdown_signal();
    if config.archive.index_polling {
        tokio::spawn(Arc::clone(&pool).poll_remote_indices(
            start_block,
            config.archive.stop_block,
            Duration::from_secs(config.archive.poll_interval_secs),
            shutdown.clone(),
        ));
    }

    let mut registry = Registry::default();
    let metrics = ArchiveMetrics::register(&mut registry);
    metrics.tail_block_number.set(start_block as i64);
    metrics.last_indexed_block.set(last_irr as i64);
    let backend = Arc::new(ArchiveBackend::new(
        Arc::clone(&pool),
        Arc::clone(&peer),
        config.archive.query_threads,
        Duration::from_secs(config.archive.shutdown_delay_secs),
        metrics,
    ));

    if !config.archive.warmup_file.is_empty() {
        warmup(&backend, &config.archive.warmup_file, &pool).await?;
    }

    pool.set_ready();
    peer.locked(|p| p.ready = true).await?;
    tokio::spawn(Arc::clone(&peer).publish_loop(publish_duration, shutdown.clone()));

    if config.archive.start_block < 0 {
        let truncator = Truncator::new(
            Arc::clone(&pool),
            Arc::clone(&peer),
            config.archive.start_block.unsigned_abs(),
            Duration::from_secs(config.archive.poll_interval_secs),
        );
        tokio::spawn(truncator.run(shutdown.clone()));
    }

    tracing::info!(
        tail = start_block,
        irr = last_irr,
        "archive backend serving; mount the backend service on the transport of your choice"
    );
    wait_for_shutdown(shutdown).await;
    backend.shutdown().await;
    Ok(())
}

async fn warmup(
    backend: &ArchiveBackend,
    path: &str,
    pool: &IndexPool,
) -> SearchResult<()> {
    let raw = tokio::fs::read_to_string(path).await?;
    let low = pool.lowest_serveable_block_num();
    let high = pool.last_read_only_indexed_block();
    let started = std::time::Instant::now();
    for query in raw.lines().filter(|l| !l.trim().is_empty()) {
        backend.warmup_with_query(query, low, high).await?;
    }
    tracing::info!(elapsed = ?started.elapsed(), "warmup completed");
    Ok(())
}

async fn run_live(config: SiftConfig) -> SearchResult<()> {
    let model = shard_model(&config)?;
    let blocks_store: Arc<dyn Store> = Arc::new(FsStore::new(&config.store.blocks_path));
    let indexes_store: Arc<dyn Store> = Arc::new(FsStore::new(&config.store.indexes_path));
    let mesh: Arc<dyn MeshClient> = Arc::new(InMemoryMesh::new());

    let peer = Arc::new(PeerHandle::new(
        SearchPeer::new(
            "localhost:9001",
            Tier::Live,
            0,
            env!("CARGO_PKG_VERSION"),
            model.shard_size(),
        ),
        Arc::clone(&mesh),
    ));
    peer.republish().await?;

    let mut shutdown = shutdown_signal();

    // The live tail starts from the archive LIB published in the mesh.
    // Starting from the stream LIB instead is deliberately not supported:
    // it would need a different tail truncator.
    let start = loop {
        if let Some(lib) = chainsift_mesh::mesh_lib(&mesh.peers(), 0) {
            break lib;
        }
        tracing::info!("waiting for an archive peer to appear in the mesh");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    };
    tracing::info!(start_num = start.num, start_id = %start.id, "live start block resolved");

    let preindexer = PreIndexer::new(Arc::new(JsonPayloadMapper));
    let tail = LiveTail::new(
        preindexer.clone(),
        LiveTailConfig {
            truncation_threshold: config.live.truncation_threshold,
            realtime_tolerance: Duration::from_secs(config.live.realtime_tolerance_secs),
            ..Default::default()
        },
        Arc::clone(&peer),
        Arc::clone(&mesh),
    );

    let mut registry = Registry::default();
    let pipeline = Pipeline::new(
        preindexer,
        model,
        &config.shards.writable_dir,
        indexes_store,
        config.indexer.enable_upload,
        config.indexer.delete_after_upload,
        config.indexer.upload_threads,
        IndexerMetrics::register(&mut registry),
    );

    // The live feed sender mounts on the blockstream transport; until it
    // is wired, the joining source follows block files only.
    let (_live_feed, live_rx) = tokio::sync::mpsc::channel(256);
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(256);
    let indexer = Indexer::new_live(pipeline, model, blocks_store, start, live_rx, events_tx)?;

    let tail_task = tokio::spawn(Arc::clone(&tail).run(events_rx, shutdown.clone()));
    let indexer_task = tokio::spawn(indexer.run(shutdown.clone()));

    wait_for_shutdown(shutdown).await;
    let _ = indexer_task.await;
    let _ = tail_task.await;
    Ok(())
}

async fn run_forkresolver(config: SiftConfig) -> SearchResult<()> {
    let blocks_store: Arc<dyn Store> = Arc::new(FsStore::new(&config.store.blocks_path));
    let _resolver = ForkResolver::new(blocks_store, PreIndexer::new(Arc::new(JsonPayloadMapper)));

    tracing::info!("fork resolver ready; mount the service on the transport of your choice");
    wait_for_shutdown(shutdown_signal()).await;
    Ok(())
}

async fn run_router(config: SiftConfig) -> SearchResult<()> {
    let mesh: Arc<dyn MeshClient> = Arc::new(InMemoryMesh::new());
    let dialer = Arc::new(InProcessDialer::new());
    let _router = Router::new(
        mesh,
        dialer,
        Arc::new(NoForkBlockMeta),
        RouterConfig {
            head_delay_tolerance: config.live.head_delay_tolerance,
            publish_duration: Duration::from_secs(config.mesh.publish_duration_secs),
        },
    );

    tracing::info!("router ready; mount the service on the transport of your choice");
    wait_for_shutdown(shutdown_signal()).await;
    Ok(())
}

/// Block-meta stub for deployments without a block-meta service: cursors
/// are trusted as canonical and no fork window is tracked.
struct NoForkBlockMeta;

#[async_trait::async_trait]
impl chainsift_router::BlockMeta for NoForkBlockMeta {
    async fn is_canonical(&self, _num: u64, _id: &str) -> SearchResult<bool> {
        Ok(true)
    }

    async fn forked_refs_back_to_canonical(
        &self,
        _cursor: &chainsift_core::BlockRef,
    ) -> SearchResult<Vec<chainsift_core::BlockRef>> {
        Ok(Vec::new())
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
