//! Block, document and match records shared by every tier.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Tag identifying which protocol decoder produced a block.
///
/// The search core never inspects block payloads itself; the tag is only
/// used to pick a [`crate::BlockMapper`] at wiring time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolTag(pub String);

impl ProtocolTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl std::fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A lightweight `(num, id)` reference to a block.
///
/// Ids are lowercase hex strings everywhere inside the service; the cursor
/// codec is the only place that converts to the fixed 32-byte wire form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub num: u64,
    pub id: String,
}

impl BlockRef {
    pub fn new(num: u64, id: impl Into<String>) -> Self {
        Self {
            num,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({})", self.num, self.id)
    }
}

/// A decoded block as delivered by a block source.
///
/// `payload` is opaque to the search core; only the protocol-specific
/// [`crate::BlockMapper`] looks inside.
#[derive(Debug, Clone)]
pub struct Block {
    pub num: u64,
    pub id: String,
    pub previous_id: String,
    /// Last irreversible block number as seen by this block.
    pub lib_num: u64,
    /// Unix timestamp, seconds.
    pub timestamp: i64,
    pub payload: Bytes,
    pub kind: ProtocolTag,
}

impl Block {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.num, self.id.clone())
    }
}

/// A per-transaction record emitted by a [`crate::BlockMapper`].
///
/// `(block_num, trx_index)` is the total order of documents inside a block;
/// `trx_id_prefix` must be at least 8 bytes of the transaction id, hex
/// encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub trx_id_prefix: String,
    pub trx_index: u32,
    /// `(field, term)` pairs, already normalized by the mapper.
    pub terms: Vec<(String, String)>,
}

impl Document {
    pub fn new(trx_id_prefix: impl Into<String>, trx_index: u32) -> Self {
        Self {
            trx_id_prefix: trx_id_prefix.into(),
            trx_index,
            terms: Vec::new(),
        }
    }

    pub fn with_term(mut self, field: impl Into<String>, term: impl Into<String>) -> Self {
        self.terms.push((field.into(), term.into()));
        self
    }
}

/// A single query hit, ready to be enriched and streamed to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub block_num: u64,
    pub block_id: String,
    pub trx_id_prefix: String,
    pub trx_index: u32,
    /// Set when the match belongs to a block that is no longer canonical.
    pub undo: bool,
    /// Highest irreversible block known when the match was produced.
    pub irr_block_num: u64,
}

impl SearchMatch {
    /// Ordering key within one direction of a stream: block, then
    /// transaction index, then id prefix (lexicographic tie-break).
    pub fn sort_key(&self) -> (u64, u32, &str) {
        (self.block_num, self.trx_index, &self.trx_id_prefix)
    }
}
