//! Protocol-specific block decoding seam.

use crate::error::SearchResult;
use crate::types::{Block, Document};

/// Extracts indexable documents from a decoded block.
///
/// Implementations are protocol-specific and live outside the search core.
/// `map` MUST be deterministic: the same block always yields the same
/// documents, in `trx_index` order. A mapping failure is fatal to whatever
/// pipeline is driving it — blocks are never silently skipped.
pub trait BlockMapper: Send + Sync {
    fn map(&self, block: &Block) -> SearchResult<Vec<Document>>;

    /// The set of fields this mapper can emit, for diagnostics.
    fn indexed_fields(&self) -> Vec<String>;
}
