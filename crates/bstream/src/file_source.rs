//! Block files read from the object store.
//!
//! One object per block number under `blocks/`, holding every fork variant
//! seen at that number in arrival order. Numbers are dense on a healthy
//! chain, so a missing object means "not produced yet" (end of history) —
//! unless the caller opts into hard failure, as the fork resolver does.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chainsift_core::{Block, ProtocolTag, SearchError, SearchResult};
use chainsift_store::{Store, StoreError};
use serde::{Deserialize, Serialize};

use crate::source::BlockSource;

pub const BLOCKS_PREFIX: &str = "blocks/";

pub fn blocks_file_name(num: u64) -> String {
    format!("{BLOCKS_PREFIX}{num:010}.json")
}

/// Serialized form of a block inside a block file.
#[derive(Debug, Serialize, Deserialize)]
struct BlockRecord {
    num: u64,
    id: String,
    previous_id: String,
    lib_num: u64,
    timestamp: i64,
    payload: Vec<u8>,
    kind: String,
}

impl From<&Block> for BlockRecord {
    fn from(b: &Block) -> Self {
        Self {
            num: b.num,
            id: b.id.clone(),
            previous_id: b.previous_id.clone(),
            lib_num: b.lib_num,
            timestamp: b.timestamp,
            payload: b.payload.to_vec(),
            kind: b.kind.0.clone(),
        }
    }
}

impl From<BlockRecord> for Block {
    fn from(r: BlockRecord) -> Self {
        Self {
            num: r.num,
            id: r.id,
            previous_id: r.previous_id,
            lib_num: r.lib_num,
            timestamp: r.timestamp,
            payload: Bytes::from(r.payload),
            kind: ProtocolTag::new(r.kind),
        }
    }
}

/// Write one block file; used by ingestion tooling and test fixtures.
pub async fn write_block_file(
    store: &dyn Store,
    num: u64,
    blocks: &[Arc<Block>],
) -> SearchResult<()> {
    let records: Vec<BlockRecord> = blocks.iter().map(|b| BlockRecord::from(b.as_ref())).collect();
    let body = serde_json::to_vec(&records)
        .map_err(|err| SearchError::internal(format!("serializing block file: {err}")))?;
    store
        .put_object(&blocks_file_name(num), Bytes::from(body))
        .await
        .map_err(|err| SearchError::internal(format!("writing block file {num}: {err}")))?;
    Ok(())
}

/// Sequential reader over block files.
pub struct FileSource {
    store: Arc<dyn Store>,
    next_num: u64,
    stop_num: Option<u64>,
    fail_on_missing: bool,
    pending: VecDeque<Arc<Block>>,
}

impl FileSource {
    pub fn new(store: Arc<dyn Store>, start_num: u64) -> Self {
        Self {
            store,
            next_num: start_num,
            stop_num: None,
            fail_on_missing: false,
            pending: VecDeque::new(),
        }
    }

    /// Stop after delivering blocks numbered `stop_num` (inclusive).
    pub fn with_stop_block(mut self, stop_num: u64) -> Self {
        self.stop_num = Some(stop_num);
        self
    }

    /// Turn a missing block file into a hard error instead of end-of-stream.
    pub fn fail_on_missing(mut self) -> Self {
        self.fail_on_missing = true;
        self
    }
}

#[async_trait]
impl BlockSource for FileSource {
    async fn next_block(&mut self) -> SearchResult<Option<Arc<Block>>> {
        loop {
            if let Some(block) = self.pending.pop_front() {
                return Ok(Some(block));
            }
            if let Some(stop) = self.stop_num {
                if self.next_num > stop {
                    return Ok(None);
                }
            }

            let name = blocks_file_name(self.next_num);
            let body = match self.store.get_object(&name).await {
                Ok(body) => body,
                Err(StoreError::NotFound(_)) if !self.fail_on_missing => {
                    tracing::debug!(num = self.next_num, "no more block files, ending stream");
                    return Ok(None);
                }
                Err(StoreError::NotFound(_)) => {
                    return Err(SearchError::not_found(format!(
                        "missing block file for block {}",
                        self.next_num
                    )));
                }
                Err(err) => {
                    return Err(SearchError::internal(format!(
                        "reading block file {name}: {err}"
                    )));
                }
            };

            let records: Vec<BlockRecord> = serde_json::from_slice(&body).map_err(|err| {
                SearchError::internal(format!("undecodable block file {name}: {err}"))
            })?;
            self.pending
                .extend(records.into_iter().map(|r| Arc::new(Block::from(r))));
            self.next_num += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsift_store::MemStore;
    use chainsift_testing::block;

    #[tokio::test]
    async fn reads_blocks_in_order_until_missing_file() {
        let store = Arc::new(MemStore::new());
        write_block_file(store.as_ref(), 1, &[block(1, "aa", "", 0)])
            .await
            .unwrap();
        write_block_file(
            store.as_ref(),
            2,
            &[block(2, "bb", "aa", 1), block(2, "b2", "aa", 1)],
        )
        .await
        .unwrap();

        let mut source = FileSource::new(store, 1);
        let nums: Vec<(u64, String)> = {
            let mut out = Vec::new();
            while let Some(b) = source.next_block().await.unwrap() {
                out.push((b.num, b.id.clone()));
            }
            out
        };
        assert_eq!(
            nums,
            vec![
                (1, "aa".to_string()),
                (2, "bb".to_string()),
                (2, "b2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn stop_block_is_inclusive() {
        let store = Arc::new(MemStore::new());
        for i in 1..=5u64 {
            let prev = if i == 1 {
                String::new()
            } else {
                format!("id{}", i - 1)
            };
            write_block_file(store.as_ref(), i, &[block(i, format!("id{i}"), prev, 0)])
                .await
                .unwrap();
        }

        let mut source = FileSource::new(store, 2).with_stop_block(4);
        let mut nums = Vec::new();
        while let Some(b) = source.next_block().await.unwrap() {
            nums.push(b.num);
        }
        assert_eq!(nums, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn missing_file_can_be_fatal() {
        let store = Arc::new(MemStore::new());
        let mut source = FileSource::new(store, 7).fail_on_missing();
        assert!(matches!(
            source.next_block().await,
            Err(SearchError::NotFound(_))
        ));
    }
}
