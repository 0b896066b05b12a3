//! Pipeline drivers.
//!
//! Batch mode replays block files through an irreversible-only forkable
//! filter and stops at a bound. Live mode seams history with a live feed,
//! keeps every step kind, and fans reversible steps out to the live tail
//! while irreversible steps advance the archival shard exactly as in
//! batch.

use std::sync::Arc;

use chainsift_bstream::{
    BlockSource, BoxedBlockSource, FileSource, ForkStep, Forkable, Gate, GateMode, JoiningSource,
    StepFilter,
};
use chainsift_core::{Block, BlockRef, SearchError, SearchResult, ShardModel};
use chainsift_store::Store;
use tokio::sync::{mpsc, watch};

use crate::pipeline::Pipeline;

/// Block bounds for a pipeline run.
pub struct IndexerConfig {
    pub start_block: u64,
    /// Stop after this block; zero means run forever (live mode).
    pub stop_block: u64,
    /// Blocks fetched before `start_block` in batch mode.
    pub lookback: u64,
}

/// Drives blocks from a source through the forkable filter into the
/// pipeline, with an optional fan-out of reversible steps.
pub struct Indexer {
    model: ShardModel,
    pipeline: Pipeline,
    source: BoxedBlockSource,
    forkable: Forkable,
    /// Applied to raw blocks before the forkable (live resume: exclusive
    /// at the last processed block id).
    raw_gate: Option<Gate>,
    /// Applied to irreversible steps after the forkable (batch: inclusive
    /// at the start block, so lookback blocks are observed but not
    /// indexed).
    step_gate: Option<Gate>,
    /// Live tail sink for `New`/`Undo` steps; absent in batch mode.
    live_events: Option<mpsc::Sender<ForkStep>>,
}

impl Indexer {
    /// Batch pipeline over block files: irreversible steps only, gated
    /// inclusively at the start block.
    pub fn new_batch(
        mut pipeline: Pipeline,
        model: ShardModel,
        blocks_store: Arc<dyn Store>,
        config: IndexerConfig,
    ) -> SearchResult<Self> {
        Self::check_bootstrap(model, config.start_block)?;
        pipeline.bootstrap(config.start_block)?;
        pipeline.set_catch_up_mode();

        let read_from = config.start_block.saturating_sub(config.lookback);
        let mut source = FileSource::new(blocks_store, read_from);
        if config.stop_block != 0 {
            source = source.with_stop_block(config.stop_block);
        }

        Ok(Self {
            model,
            pipeline,
            source: Box::new(source),
            forkable: Forkable::new(BlockRef::new(0, ""), StepFilter::IRREVERSIBLE_ONLY),
            raw_gate: None,
            step_gate: Some(Gate::num(config.start_block, GateMode::Inclusive)),
            live_events: None,
        })
    }

    /// Live pipeline: history seamed with a live feed, every step kind,
    /// resuming exclusively after `last_processed`.
    pub fn new_live(
        mut pipeline: Pipeline,
        model: ShardModel,
        blocks_store: Arc<dyn Store>,
        last_processed: BlockRef,
        live_rx: mpsc::Receiver<Arc<Block>>,
        live_events: mpsc::Sender<ForkStep>,
    ) -> SearchResult<Self> {
        let resume_base = last_processed.num + 1;
        Self::check_bootstrap(model, resume_base)?;
        pipeline.bootstrap(resume_base)?;

        let file = FileSource::new(blocks_store, last_processed.num.max(1));
        let source = JoiningSource::new(Box::new(file), live_rx);

        Ok(Self {
            model,
            pipeline,
            source: Box::new(source),
            forkable: Forkable::new(last_processed.clone(), StepFilter::ALL),
            raw_gate: Some(Gate::id(last_processed.id, GateMode::Exclusive)),
            step_gate: None,
            live_events: Some(live_events),
        })
    }

    fn check_bootstrap(model: ShardModel, start_block: u64) -> SearchResult<()> {
        if !model.is_valid_base(start_block) {
            return Err(SearchError::invalid_argument(format!(
                "indexer only starts RIGHT BEFORE the index boundaries, did you specify an \
                 irreversible block_id with a round number? It says {start_block}"
            )));
        }
        Ok(())
    }

    /// Where to resume indexing given what the shard store already holds:
    /// the first gap in the remote shard chain after `start_block`.
    pub async fn next_base_after(
        model: ShardModel,
        indexes_store: &dyn Store,
        start_block: u64,
    ) -> SearchResult<u64> {
        let remote = indexes_store
            .list_files(&model.store_prefix(), ".tmp", 9_999_999)
            .await
            .map_err(|err| SearchError::internal(format!("listing shard store: {err}")))?;
        Ok(model.next_base_after(start_block, &remote))
    }

    /// Run until the source ends (batch completion) or shutdown flips.
    /// Ends by draining pending uploads in every case.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SearchResult<()> {
        let result = self.pump(&mut shutdown).await;

        tracing::info!("waiting on uploads");
        self.pipeline.wait_on_uploads().await;

        if let Some(err) = self.pipeline.upload_failure() {
            return Err(SearchError::internal(format!(
                "upload failure escalated: {err}"
            )));
        }
        result
    }

    async fn pump(&mut self, shutdown: &mut watch::Receiver<bool>) -> SearchResult<()> {
        loop {
            let block = tokio::select! {
                next = self.source.next_block() => next?,
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("indexer interrupted by shutdown");
                        return Ok(());
                    }
                    continue;
                }
            };
            let Some(block) = block else {
                tracing::info!(
                    last = ?self.pipeline.last_processed(),
                    "block source exhausted, indexing completed"
                );
                self.pipeline.flush_if_complete().await?;
                return Ok(());
            };

            if let Some(gate) = &mut self.raw_gate {
                if !gate.pass(&block) {
                    continue;
                }
            }

            for step in self.forkable.process(block)? {
                match step {
                    ForkStep::Irreversible(b) => {
                        let gated_out = self
                            .step_gate
                            .as_mut()
                            .is_some_and(|gate| !gate.pass(&b));
                        if !gated_out {
                            self.pipeline.process_irreversible(&b).await?;
                        }
                    }
                    reversible => {
                        if let Some(sink) = &self.live_events {
                            if sink.send(reversible).await.is_err() {
                                return Err(SearchError::unavailable(
                                    "live tail went away, stopping indexer",
                                ));
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn shard_model(&self) -> ShardModel {
        self.model
    }
}
