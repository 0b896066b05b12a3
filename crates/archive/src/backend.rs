//! The archive backend service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chainsift_core::{Cursor, ParsedQuery, SearchResult};
use chainsift_grpc::{
    search_error_to_status, BackendRequest, BackendService, BackendStream, HeadInfo,
    HeadInfoService, HealthCheck, HealthStatus, SearchMatchMsg,
};
use chainsift_mesh::PeerHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::Status;

use crate::metrics::ArchiveMetrics;
use crate::pool::IndexPool;
use crate::query::ArchiveQueryEngine;

/// Serves boolean queries over the irreversible shard pool.
pub struct ArchiveBackend {
    pool: Arc<IndexPool>,
    engine: ArchiveQueryEngine,
    peer: Arc<PeerHandle>,
    metrics: ArchiveMetrics,
    shutdown_delay: Duration,
    shutting_down: AtomicBool,
}

/// Decrements the active-query gauge when the serving stream drops,
/// whether it completed, failed, or was canceled.
struct ActiveQueryGuard(ArchiveMetrics);

impl Drop for ActiveQueryGuard {
    fn drop(&mut self) {
        self.0.active_query_count.dec();
    }
}

impl ArchiveBackend {
    pub fn new(
        pool: Arc<IndexPool>,
        peer: Arc<PeerHandle>,
        max_query_threads: usize,
        shutdown_delay: Duration,
        metrics: ArchiveMetrics,
    ) -> Self {
        let engine = ArchiveQueryEngine::new(Arc::clone(&pool), max_query_threads);
        Self {
            pool,
            engine,
            peer,
            metrics,
            shutdown_delay,
            shutting_down: AtomicBool::new(false),
        }
    }

    fn validate(req: &BackendRequest) -> Result<(), Status> {
        if req.with_reversible {
            return Err(Status::invalid_argument(
                "archive backend does not support with_reversible",
            ));
        }
        if req.stop_at_virtual_head {
            return Err(Status::invalid_argument(
                "archive backend does not support stop_at_virtual_head",
            ));
        }
        if req.live_marker_interval != 0 {
            return Err(Status::invalid_argument(
                "archive backend does not support a live marker interval",
            ));
        }
        if !req.navigate_from_block_id.is_empty() {
            return Err(Status::invalid_argument(
                "archive backend does not support navigate_from_block_id",
            ));
        }
        if req.navigate_from_block_num != 0 {
            return Err(Status::invalid_argument(
                "archive backend does not support navigate_from_block_num",
            ));
        }
        Ok(())
    }

    /// Parse and execute a query over `[low, high]`, draining the results.
    /// Used to pre-warm the page cache and postings before flipping ready.
    pub async fn warmup_with_query(&self, raw: &str, low: u64, high: u64) -> SearchResult<()> {
        let query = Arc::new(ParsedQuery::parse(raw)?);
        let (mut rx, _trailer) = self.engine.execute(false, low, high, query);
        let mut count = 0usize;
        while let Some(item) = rx.recv().await {
            item?;
            count += 1;
        }
        tracing::debug!(raw, count, "warmup query drained");
        Ok(())
    }

    /// Fields the active mapper indexes, for diagnostics endpoints.
    pub fn pool(&self) -> &Arc<IndexPool> {
        &self.pool
    }

    /// Flip unready, give in-flight requests `shutdown_delay` to drain,
    /// then close the pool.
    pub async fn shutdown(&self) {
        tracing::info!(delay = ?self.shutdown_delay, "archive backend shutting down");
        if let Err(err) = self.peer.locked(|p| p.ready = false).await {
            tracing::error!(%err, "could not publish not-ready peer record");
        }
        self.shutting_down.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.shutdown_delay).await;
        self.pool.close();
        tracing::info!("archive backend shutdown complete");
    }
}

#[async_trait]
impl BackendService for ArchiveBackend {
    async fn stream_matches(&self, req: BackendRequest) -> Result<BackendStream, Status> {
        Self::validate(&req)?;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Status::unavailable("archive backend is shutting down"));
        }

        let query = ParsedQuery::parse(&req.query).map_err(search_error_to_status)?;
        tracing::info!(
            query = %req.query,
            low = req.low_block_num,
            high = req.high_block_num,
            descending = req.descending,
            "starting archive search"
        );

        let peer = self.peer.snapshot();
        let high = if req.high_block_num == 0 {
            peer.irr_block
        } else {
            req.high_block_num
        };
        self.engine
            .check_boundaries(req.low_block_num, high, peer.tail_block, peer.irr_block)
            .map_err(search_error_to_status)?;

        let (rx, last_block_read) =
            self.engine
                .execute(req.descending, req.low_block_num, high, Arc::new(query));

        self.metrics.active_query_count.inc();
        let guard = ActiveQueryGuard(self.metrics.clone());

        let matches = ReceiverStream::new(rx).map(move |item| {
            let _held = &guard;
            let m = item.map_err(search_error_to_status)?;
            let cursor = Cursor::new(m.block_num, &m.block_id, &m.trx_id_prefix)
                .encode()
                .map_err(search_error_to_status)?;
            Ok(SearchMatchMsg::from_match(&m, cursor))
        });

        Ok(BackendStream {
            matches: Box::pin(matches),
            last_block_read,
        })
    }
}

#[async_trait]
impl HeadInfoService for ArchiveBackend {
    async fn head_info(&self) -> Result<HeadInfo, Status> {
        Ok(HeadInfo {
            lib_num: self.pool.last_read_only_indexed_block(),
            lib_id: self.pool.last_read_only_indexed_block_id(),
        })
    }
}

#[async_trait]
impl HealthCheck for ArchiveBackend {
    async fn check(&self) -> HealthStatus {
        if self.pool.is_ready() && !self.shutting_down.load(Ordering::SeqCst) {
            HealthStatus::Serving
        } else {
            HealthStatus::NotServing
        }
    }
}
