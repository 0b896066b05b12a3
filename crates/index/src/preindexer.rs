//! Block → single-index construction.

use std::sync::Arc;

use chainsift_core::{Block, BlockMapper, SearchResult};

use crate::single::SingleIndex;

/// Builds one [`SingleIndex`] per block through a protocol-specific mapper.
///
/// A mapper failure is surfaced unchanged: a block that cannot be mapped is
/// fatal to whatever pipeline is driving the preindexer, never skipped.
#[derive(Clone)]
pub struct PreIndexer {
    mapper: Arc<dyn BlockMapper>,
}

impl PreIndexer {
    pub fn new(mapper: Arc<dyn BlockMapper>) -> Self {
        Self { mapper }
    }

    pub fn indexed_fields(&self) -> Vec<String> {
        self.mapper.indexed_fields()
    }

    /// Map and index one block. The returned index is owned by the caller.
    pub fn preindex(&self, block: &Block) -> SearchResult<SingleIndex> {
        let documents = self.mapper.map(block)?;
        Ok(SingleIndex::build(
            block.num,
            block.id.clone(),
            block.previous_id.clone(),
            block.lib_num,
            documents,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsift_core::ParsedQuery;
    use chainsift_testing::{block, block_with_trxs, trx, FailingMapper, TestMapper};

    #[test]
    fn preindexes_mapped_documents() {
        let preindexer = PreIndexer::new(Arc::new(TestMapper));
        let blk = block_with_trxs(
            7,
            "aa07",
            "aa06",
            6,
            &[
                trx(chainsift_testing::test_trx_id(1), "account", "alice"),
                trx(chainsift_testing::test_trx_id(2), "account", "bob"),
            ],
        );

        let idx = preindexer.preindex(&blk).unwrap();
        assert_eq!(idx.block_num(), 7);
        assert_eq!(idx.doc_count(), 2);
        let matches = idx.run_query(&ParsedQuery::parse("account:bob").unwrap());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].trx_index, 1);
    }

    #[test]
    fn empty_block_yields_empty_index() {
        let preindexer = PreIndexer::new(Arc::new(TestMapper));
        let idx = preindexer.preindex(&block(3, "cc", "bb", 2)).unwrap();
        assert_eq!(idx.doc_count(), 0);
    }

    #[test]
    fn mapper_failure_is_propagated() {
        let preindexer = PreIndexer::new(Arc::new(FailingMapper));
        assert!(preindexer.preindex(&block(3, "cc", "bb", 2)).is_err());
    }
}
