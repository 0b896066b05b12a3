//! The fork resolver tier.
//!
//! Given a set of orphaned block refs, recover those blocks from the block
//! files, index each one ephemerally, run the query, and stream the
//! matches back with `undo = true` — descending by block, and within one
//! block in reverse transaction order, so clients can unwind state in the
//! order it was applied.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chainsift_bstream::{BlockSource, FileSource};
use chainsift_core::{Block, Cursor, ParsedQuery, SearchError, SearchResult};
use chainsift_grpc::{
    search_error_to_status, BlockRefMsg, ForkResolveRequest, ForkResolverService, HealthCheck,
    HealthStatus, MatchStream, SearchMatchMsg,
};
use chainsift_index::PreIndexer;
use chainsift_store::Store;
use tonic::Status;

/// How far past the highest requested ref the block-file scan may walk
/// before giving up on the remaining ids.
pub const MAX_LOOKUP_BLOCKS: u64 = 10_000;

pub struct ForkResolver {
    blocks_store: Arc<dyn Store>,
    preindexer: PreIndexer,
}

impl ForkResolver {
    pub fn new(blocks_store: Arc<dyn Store>, preindexer: PreIndexer) -> Self {
        Self {
            blocks_store,
            preindexer,
        }
    }

    /// Fetch the requested blocks, descending by number.
    ///
    /// Returns the LIB to report alongside (one below the lowest ref) or
    /// `NotFound` if any id is not seen within the lookup window.
    async fn get_blocks_descending(
        &self,
        refs: &[BlockRefMsg],
    ) -> SearchResult<(Vec<Arc<Block>>, u64)> {
        let lowest = refs.iter().map(|r| r.block_num).min().unwrap_or(0);
        let highest = refs.iter().map(|r| r.block_num).max().unwrap_or(0);
        let lib_num = lowest.saturating_sub(1);

        let mut wanted: HashSet<&str> = refs.iter().map(|r| r.block_id.as_str()).collect();
        let mut out = Vec::with_capacity(refs.len());

        let mut source = FileSource::new(Arc::clone(&self.blocks_store), lowest).fail_on_missing();
        loop {
            let block = source
                .next_block()
                .await
                .map_err(|err| match err {
                    SearchError::NotFound(_) => SearchError::internal(
                        "cannot run forkresolver on missing block files",
                    ),
                    other => other,
                })?
                .ok_or_else(|| {
                    SearchError::internal("block files ended inside the lookup window")
                })?;

            if block.num > highest + MAX_LOOKUP_BLOCKS {
                return Err(SearchError::not_found(format!(
                    "not found within {MAX_LOOKUP_BLOCKS} blocks"
                )));
            }
            if wanted.remove(block.id.as_str()) {
                out.push(block);
            }
            if wanted.is_empty() {
                break;
            }
        }

        out.sort_by(|a, b| b.num.cmp(&a.num));
        Ok((out, lib_num))
    }
}

#[async_trait]
impl ForkResolverService for ForkResolver {
    async fn stream_undo_matches(&self, req: ForkResolveRequest) -> Result<MatchStream, Status> {
        if req.forked_block_refs.is_empty() {
            return Err(Status::invalid_argument("invalid argument: no refs requested"));
        }
        let query = ParsedQuery::parse(&req.query).map_err(search_error_to_status)?;
        tracing::debug!(
            refs = req.forked_block_refs.len(),
            query = %req.query,
            "resolving forked blocks"
        );

        let (blocks, lib_num) = self
            .get_blocks_descending(&req.forked_block_refs)
            .await
            .map_err(search_error_to_status)?;

        let mut out: Vec<Result<SearchMatchMsg, Status>> = Vec::new();
        for block in blocks {
            let index = self
                .preindexer
                .preindex(&block)
                .map_err(search_error_to_status)?;

            let mut matches = index.run_query(&query);
            matches.reverse();
            for mut m in matches {
                m.undo = true;
                m.irr_block_num = lib_num;
                let cursor = Cursor::new(m.block_num, &m.block_id, &m.trx_id_prefix)
                    .encode()
                    .map_err(search_error_to_status)?;
                out.push(Ok(SearchMatchMsg::from_match(&m, cursor)));
            }
        }

        Ok(Box::pin(futures::stream::iter(out)))
    }
}

#[async_trait]
impl HealthCheck for ForkResolver {
    async fn check(&self) -> HealthStatus {
        // Stateless: serving as soon as the store is wired.
        HealthStatus::Serving
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsift_bstream::write_block_file;
    use chainsift_store::MemStore;
    use chainsift_testing::{block_with_trxs, test_block_id, test_trx_id, trx, TestMapper};
    use futures::StreamExt;

    fn forked_block(num: u64, trx_count: usize) -> Arc<Block> {
        let trxs: Vec<_> = (0..trx_count)
            .map(|i| trx(test_trx_id(num * 100 + i as u64), "account", "alice"))
            .collect();
        block_with_trxs(
            num,
            test_block_id(num, 9),
            test_block_id(num - 1, 9),
            num - 1,
            &trxs,
        )
    }

    async fn resolver_with_blocks(blocks: &[Arc<Block>]) -> ForkResolver {
        let store = Arc::new(MemStore::new());
        for b in blocks {
            write_block_file(store.as_ref(), b.num, std::slice::from_ref(b))
                .await
                .unwrap();
        }
        ForkResolver::new(store, PreIndexer::new(Arc::new(TestMapper)))
    }

    fn refs(blocks: &[Arc<Block>]) -> Vec<BlockRefMsg> {
        blocks
            .iter()
            .map(|b| BlockRefMsg {
                block_num: b.num,
                block_id: b.id.clone(),
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_refs_are_invalid() {
        let resolver = resolver_with_blocks(&[]).await;
        let err = resolver
            .stream_undo_matches(ForkResolveRequest {
                query: "account:alice".into(),
                forked_block_refs: vec![],
            })
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn emits_undo_matches_descending() {
        let blocks = vec![forked_block(500, 2), forked_block(501, 1)];
        let resolver = resolver_with_blocks(&blocks).await;

        let stream = resolver
            .stream_undo_matches(ForkResolveRequest {
                query: "account:alice".into(),
                forked_block_refs: refs(&blocks),
            })
            .await
            .unwrap();
        let msgs: Vec<SearchMatchMsg> = stream
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        // Descending by block; within block 500, reverse trx order.
        let keys: Vec<(u64, u32)> = msgs.iter().map(|m| (m.block_num, m.trx_index)).collect();
        assert_eq!(keys, vec![(501, 0), (500, 1), (500, 0)]);
        assert!(msgs.iter().all(|m| m.undo));
        assert!(msgs.iter().all(|m| m.irr_block_num == 499));

        // Cursors carry the forked block id so the router can resume.
        let cursor = Cursor::decode(&msgs[0].cursor).unwrap();
        assert_eq!(cursor.block_id, test_block_id(501, 9));
    }

    #[tokio::test]
    async fn unknown_ref_inside_window_is_not_found() {
        // Block files cover a long range, but the requested id never
        // appears in them.
        let store = Arc::new(MemStore::new());
        for num in 500..=500 + MAX_LOOKUP_BLOCKS + 1 {
            let canonical = block_with_trxs(
                num,
                test_block_id(num, 0),
                test_block_id(num - 1, 0),
                num - 1,
                &[],
            );
            write_block_file(store.as_ref(), num, &[canonical])
                .await
                .unwrap();
        }
        let resolver = ForkResolver::new(store, PreIndexer::new(Arc::new(TestMapper)));

        let err = resolver
            .stream_undo_matches(ForkResolveRequest {
                query: "account:alice".into(),
                forked_block_refs: vec![BlockRefMsg {
                    block_num: 500,
                    block_id: "deadbeef".into(),
                }],
            })
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), tonic::Code::NotFound);
        assert_eq!(err.message(), "not found within 10000 blocks");
    }

    #[tokio::test]
    async fn missing_block_files_are_internal_errors() {
        let resolver = resolver_with_blocks(&[]).await;
        let err = resolver
            .stream_undo_matches(ForkResolveRequest {
                query: "account:alice".into(),
                forked_block_refs: vec![BlockRefMsg {
                    block_num: 500,
                    block_id: "dead".into(),
                }],
            })
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), tonic::Code::Internal);
        assert!(err.message().contains("missing block files"));
    }
}
