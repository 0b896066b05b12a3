//! Block-meta collaborator.

use async_trait::async_trait;
use chainsift_core::{BlockRef, SearchResult};

/// Canonical-chain oracle, backed by an external block-meta service.
///
/// The router only needs two answers: is a `(num, id)` pair still on the
/// canonical chain, and if not, which orphaned blocks sit between it and
/// its canonical ancestor (newest first, empty when the block is already
/// outside the tracked fork window).
#[async_trait]
pub trait BlockMeta: Send + Sync {
    async fn is_canonical(&self, block_num: u64, block_id: &str) -> SearchResult<bool>;

    async fn forked_refs_back_to_canonical(
        &self,
        cursor_block: &BlockRef,
    ) -> SearchResult<Vec<BlockRef>>;
}
