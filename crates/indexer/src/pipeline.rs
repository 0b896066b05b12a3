//! Writable shard assembly.
//!
//! One writable shard is open at a time. Irreversible blocks append to it
//! in order; crossing the range boundary seals the shard — merge into one
//! artifact, fsync under a building name, then hand off for upload. Empty
//! ranges still seal an (empty) artifact so the shard chain stays
//! continuous.

use std::path::PathBuf;
use std::sync::Arc;

use chainsift_core::{Block, BlockRef, SearchError, SearchResult, ShardModel};
use chainsift_index::{encode_shard, PreIndexer, SingleIndex};
use chainsift_store::Store;

use crate::metrics::IndexerMetrics;
use crate::uploader::{UploadJob, Uploader};

struct WritableShard {
    base: u64,
    end: u64,
    indexes: Vec<SingleIndex>,
}

pub struct Pipeline {
    preindexer: PreIndexer,
    model: ShardModel,
    writable_dir: PathBuf,
    uploader: Option<Uploader>,
    current: Option<WritableShard>,
    last_processed: Option<BlockRef>,
    metrics: IndexerMetrics,
    catch_up: bool,
}

impl Pipeline {
    pub fn new(
        preindexer: PreIndexer,
        model: ShardModel,
        writable_dir: impl Into<PathBuf>,
        store: Arc<dyn Store>,
        enable_upload: bool,
        delete_after_upload: bool,
        upload_workers: usize,
        metrics: IndexerMetrics,
    ) -> Self {
        let uploader =
            enable_upload.then(|| Uploader::new(store, upload_workers, delete_after_upload));
        Self {
            preindexer,
            model,
            writable_dir: writable_dir.into(),
            uploader,
            current: None,
            last_processed: None,
            metrics,
            catch_up: false,
        }
    }

    /// Open the first writable shard. `start_block` must sit on a shard
    /// boundary (or be the genesis block 1).
    pub fn bootstrap(&mut self, start_block: u64) -> SearchResult<()> {
        if !self.model.is_valid_base(start_block) {
            return Err(SearchError::invalid_argument(format!(
                "indexer only starts RIGHT BEFORE the index boundaries, did you specify an \
                 irreversible block_id with a round number? It says {start_block}"
            )));
        }
        self.current = Some(WritableShard {
            base: start_block,
            end: self.model.end_of(start_block),
            indexes: Vec::new(),
        });
        tracing::info!(start_block, "pipeline bootstrapped");
        Ok(())
    }

    /// Batch catch-up mode only changes log verbosity; the write path is
    /// identical in both modes.
    pub fn set_catch_up_mode(&mut self) {
        self.catch_up = true;
    }

    pub fn last_processed(&self) -> Option<&BlockRef> {
        self.last_processed.as_ref()
    }

    /// Append one irreversible block, sealing shards as boundaries cross.
    pub async fn process_irreversible(&mut self, block: &Arc<Block>) -> SearchResult<()> {
        if let Some(uploader) = &self.uploader {
            if let Some(err) = uploader.failure() {
                return Err(SearchError::internal(format!(
                    "upload failure escalated: {err}"
                )));
            }
        }

        let current = self
            .current
            .as_ref()
            .ok_or_else(|| SearchError::internal("pipeline used before bootstrap"))?;
        if block.num < current.base {
            return Err(SearchError::internal(format!(
                "irreversible block {} is below the writable shard base {}",
                block.num, current.base
            )));
        }

        while block.num > self.current.as_ref().expect("current shard set").end {
            self.seal_current().await?;
        }

        let index = self.preindexer.preindex(block)?;
        let current = self.current.as_mut().expect("current shard set");
        current.indexes.push(index);
        self.last_processed = Some(block.block_ref());
        self.metrics.last_written_block.set(block.num as i64);
        if !self.catch_up {
            tracing::debug!(num = block.num, id = %block.id, "block indexed");
        }
        Ok(())
    }

    /// Seal the writable shard into its artifact and open the next one.
    async fn seal_current(&mut self) -> SearchResult<()> {
        let shard = self.current.take().expect("seal with no writable shard");
        let next_base = shard.end + 1;

        let artifact = encode_shard(&shard.indexes)
            .map_err(|err| SearchError::internal(format!("merging shard {}: {err}", shard.base)))?;

        tokio::fs::create_dir_all(&self.writable_dir).await?;
        let building_path = self
            .writable_dir
            .join(format!("{}.building", self.model.shard_name(shard.base)));
        let file_contents = artifact;
        tokio::fs::write(&building_path, &file_contents).await?;
        let file = tokio::fs::File::open(&building_path).await?;
        file.sync_all().await?;
        drop(file);

        let final_path = self.writable_dir.join(self.model.shard_name(shard.base));
        tracing::info!(
            base = shard.base,
            end = shard.end,
            blocks = shard.indexes.len(),
            bytes = file_contents.len(),
            "shard sealed"
        );

        match &self.uploader {
            Some(uploader) => {
                uploader
                    .enqueue(UploadJob {
                        base: shard.base,
                        building_path,
                        final_path,
                        remote_name: format!(
                            "{}{}",
                            self.model.store_prefix(),
                            self.model.shard_name(shard.base)
                        ),
                    })
                    .await?;
            }
            None => {
                tokio::fs::rename(&building_path, &final_path).await?;
            }
        }
        self.metrics.sealed_shards.inc();

        self.current = Some(WritableShard {
            base: next_base,
            end: self.model.end_of(next_base),
            indexes: Vec::new(),
        });
        Ok(())
    }

    /// Seal the writable shard if its whole range has been processed.
    /// Called when a bounded batch run reaches its stop block.
    pub async fn flush_if_complete(&mut self) -> SearchResult<()> {
        let complete = match (&self.current, &self.last_processed) {
            (Some(shard), Some(last)) => last.num == shard.end,
            _ => false,
        };
        if complete {
            self.seal_current().await?;
        }
        Ok(())
    }

    /// Shutdown barrier: drain every pending upload.
    pub async fn wait_on_uploads(&self) {
        if let Some(uploader) = &self.uploader {
            uploader.wait_on_uploads().await;
        }
    }

    /// Terminal upload failure, if one happened.
    pub fn upload_failure(&self) -> Option<String> {
        self.uploader.as_ref().and_then(|u| u.failure())
    }
}
