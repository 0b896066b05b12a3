//! Default block mapper for payloads that carry pre-extracted documents.
//!
//! Chains with a native decoder plug their own [`BlockMapper`] in at the
//! transport layer; this one handles the generic case where an upstream
//! extractor already reduced each transaction to `(field, term)` pairs and
//! serialized the lot as JSON.

use chainsift_core::{Block, BlockMapper, Document, SearchError, SearchResult};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TrxRecord {
    /// Full transaction id, lowercase hex.
    id: String,
    terms: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct JsonPayloadMapper;

impl BlockMapper for JsonPayloadMapper {
    fn map(&self, block: &Block) -> SearchResult<Vec<Document>> {
        if block.payload.is_empty() {
            return Ok(Vec::new());
        }
        let records: Vec<TrxRecord> = serde_json::from_slice(&block.payload).map_err(|err| {
            SearchError::internal(format!(
                "undecodable document payload in block {}: {err}",
                block.num
            ))
        })?;

        Ok(records
            .into_iter()
            .enumerate()
            .map(|(i, record)| {
                let prefix_len = 16.min(record.id.len());
                let mut doc = Document::new(&record.id[..prefix_len], i as u32);
                doc.terms = record.terms;
                doc
            })
            .collect())
    }

    fn indexed_fields(&self) -> Vec<String> {
        // Open vocabulary: fields are whatever the extractor emitted.
        Vec::new()
    }
}
