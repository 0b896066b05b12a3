//! The block source seam.

use std::sync::Arc;

use async_trait::async_trait;
use chainsift_core::{Block, SearchResult};

/// Pull-based stream of decoded blocks.
///
/// Sources deliver blocks in arrival order; fork variants of the same block
/// number are delivered as separate blocks. `None` means the source is
/// exhausted (a batch file source past its stop block). Live sources never
/// return `None` until shut down.
#[async_trait]
pub trait BlockSource: Send {
    async fn next_block(&mut self) -> SearchResult<Option<Arc<Block>>>;
}

pub type BoxedBlockSource = Box<dyn BlockSource>;

#[async_trait]
impl BlockSource for BoxedBlockSource {
    async fn next_block(&mut self) -> SearchResult<Option<Arc<Block>>> {
        (**self).next_block().await
    }
}

/// A source over an in-memory block list, for tests and replay tooling.
pub struct VecSource {
    blocks: std::vec::IntoIter<Arc<Block>>,
}

impl VecSource {
    pub fn new(blocks: Vec<Arc<Block>>) -> Self {
        Self {
            blocks: blocks.into_iter(),
        }
    }
}

#[async_trait]
impl BlockSource for VecSource {
    async fn next_block(&mut self) -> SearchResult<Option<Arc<Block>>> {
        Ok(self.blocks.next())
    }
}
