//! Shared fixtures for chainsift tests.
//!
//! Blocks built here carry their indexable content as a JSON payload that
//! [`TestMapper`] decodes, so any crate can fabricate realistic block
//! streams without a protocol decoder.

use std::sync::Arc;

use bytes::Bytes;
use chainsift_core::{Block, BlockMapper, Document, ProtocolTag, SearchError, SearchResult};
use serde::{Deserialize, Serialize};

/// One transaction inside a test block payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestTrx {
    /// Full transaction id, lowercase hex (64 chars).
    pub id: String,
    /// `(field, term)` pairs.
    pub terms: Vec<(String, String)>,
}

/// Deterministic 64-char hex block id derived from a number and a fork tag.
pub fn test_block_id(num: u64, fork: u8) -> String {
    format!("{num:060x}{fork:04x}")
}

/// Deterministic 64-char hex transaction id.
pub fn test_trx_id(n: u64) -> String {
    format!("{n:064x}")
}

/// A block with no indexable content.
pub fn block(
    num: u64,
    id: impl Into<String>,
    previous_id: impl Into<String>,
    lib_num: u64,
) -> Arc<Block> {
    block_with_trxs(num, id, previous_id, lib_num, &[])
}

/// A block whose payload carries the given transactions.
pub fn block_with_trxs(
    num: u64,
    id: impl Into<String>,
    previous_id: impl Into<String>,
    lib_num: u64,
    trxs: &[TestTrx],
) -> Arc<Block> {
    Arc::new(Block {
        num,
        id: id.into(),
        previous_id: previous_id.into(),
        lib_num,
        timestamp: 1_600_000_000 + num as i64,
        payload: Bytes::from(serde_json::to_vec(trxs).expect("test payload serializes")),
        kind: ProtocolTag::new("test"),
    })
}

/// Shorthand: one transaction with a single `(field, term)` pair.
pub fn trx(id: impl Into<String>, field: &str, term: &str) -> TestTrx {
    TestTrx {
        id: id.into(),
        terms: vec![(field.to_string(), term.to_string())],
    }
}

/// Mapper over the JSON test payload. Deterministic by construction.
#[derive(Debug, Default)]
pub struct TestMapper;

impl BlockMapper for TestMapper {
    fn map(&self, block: &Block) -> SearchResult<Vec<Document>> {
        if block.payload.is_empty() {
            return Ok(Vec::new());
        }
        let trxs: Vec<TestTrx> = serde_json::from_slice(&block.payload)
            .map_err(|err| SearchError::internal(format!("undecodable test payload: {err}")))?;

        Ok(trxs
            .into_iter()
            .enumerate()
            .map(|(i, t)| {
                let mut doc = Document::new(&t.id[..16.min(t.id.len())], i as u32);
                doc.terms = t.terms;
                doc
            })
            .collect())
    }

    fn indexed_fields(&self) -> Vec<String> {
        vec!["account".into(), "action".into(), "data.memo".into()]
    }
}

/// Mapper that always fails, for pipeline error-path tests.
#[derive(Debug, Default)]
pub struct FailingMapper;

impl BlockMapper for FailingMapper {
    fn map(&self, block: &Block) -> SearchResult<Vec<Document>> {
        Err(SearchError::internal(format!(
            "mapper refused block {}",
            block.num
        )))
    }

    fn indexed_fields(&self) -> Vec<String> {
        Vec::new()
    }
}
