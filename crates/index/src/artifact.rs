//! The durable shard artifact.
//!
//! One Avro object container file per sealed shard, carrying every block of
//! the shard range in ascending order. Blocks with no documents still get a
//! record, so an opened shard can prove continuity without consulting its
//! neighbors.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use apache_avro::{from_value, Codec, Reader, Schema, Writer};
use chainsift_core::Document;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::single::SingleIndex;

const SHARD_SCHEMA: &str = r#"
{
  "type": "record",
  "name": "BlockIndexRecord",
  "namespace": "chainsift",
  "fields": [
    {"name": "block_num", "type": "long"},
    {"name": "block_id", "type": "string"},
    {"name": "previous_id", "type": "string"},
    {"name": "lib_num", "type": "long"},
    {"name": "documents", "type": {"type": "array", "items": {
      "type": "record",
      "name": "DocumentRecord",
      "fields": [
        {"name": "trx_id_prefix", "type": "string"},
        {"name": "trx_index", "type": "long"},
        {"name": "terms", "type": {"type": "array", "items": {
          "type": "record",
          "name": "FieldTerm",
          "fields": [
            {"name": "field", "type": "string"},
            {"name": "term", "type": "string"}
          ]
        }}}
      ]
    }}}
  ]
}
"#;

fn schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(|| Schema::parse_str(SHARD_SCHEMA).expect("static shard schema parses"))
}

#[derive(Debug, Error)]
pub enum ShardCodecError {
    #[error("avro codec: {0}")]
    Avro(#[from] apache_avro::Error),

    #[error("malformed shard record: {0}")]
    Malformed(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockIndexRecord {
    block_num: i64,
    block_id: String,
    previous_id: String,
    lib_num: i64,
    documents: Vec<DocumentRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DocumentRecord {
    trx_id_prefix: String,
    trx_index: i64,
    terms: Vec<FieldTerm>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FieldTerm {
    field: String,
    term: String,
}

fn to_record(index: &SingleIndex) -> BlockIndexRecord {
    // Rebuild per-document term lists from the postings. Terms come out in
    // `(field, term)` order, which keeps the artifact deterministic.
    let mut terms_by_doc: BTreeMap<u32, Vec<FieldTerm>> = BTreeMap::new();
    for (field, term, positions) in index.postings() {
        for &pos in positions {
            terms_by_doc.entry(pos).or_default().push(FieldTerm {
                field: field.to_string(),
                term: term.to_string(),
            });
        }
    }
    for terms in terms_by_doc.values_mut() {
        terms.sort_by(|a, b| (&a.field, &a.term).cmp(&(&b.field, &b.term)));
    }

    BlockIndexRecord {
        block_num: index.block_num() as i64,
        block_id: index.block_id().to_string(),
        previous_id: index.previous_id().to_string(),
        lib_num: index.lib_num() as i64,
        documents: index
            .docs()
            .iter()
            .enumerate()
            .map(|(pos, doc)| DocumentRecord {
                trx_id_prefix: doc.trx_id_prefix.clone(),
                trx_index: doc.trx_index as i64,
                terms: terms_by_doc.remove(&(pos as u32)).unwrap_or_default(),
            })
            .collect(),
    }
}

fn from_record(record: BlockIndexRecord) -> Result<SingleIndex, ShardCodecError> {
    let block_num = u64::try_from(record.block_num)
        .map_err(|_| ShardCodecError::Malformed("negative block_num".into()))?;
    let lib_num = u64::try_from(record.lib_num)
        .map_err(|_| ShardCodecError::Malformed("negative lib_num".into()))?;

    let documents = record
        .documents
        .into_iter()
        .map(|doc| {
            let trx_index = u32::try_from(doc.trx_index)
                .map_err(|_| ShardCodecError::Malformed("trx_index out of range".into()))?;
            let mut out = Document::new(doc.trx_id_prefix, trx_index);
            out.terms = doc
                .terms
                .into_iter()
                .map(|ft| (ft.field, ft.term))
                .collect();
            Ok(out)
        })
        .collect::<Result<Vec<_>, ShardCodecError>>()?;

    Ok(SingleIndex::build(
        block_num,
        record.block_id,
        record.previous_id,
        lib_num,
        documents,
    ))
}

/// Serialize single indexes (ascending block order) into one artifact.
pub fn encode_shard(indexes: &[SingleIndex]) -> Result<Vec<u8>, ShardCodecError> {
    let mut writer = Writer::with_codec(schema(), Vec::new(), Codec::Deflate);
    for index in indexes {
        writer.append_ser(to_record(index))?;
    }
    Ok(writer.into_inner()?)
}

/// Deserialize an artifact back into its single indexes.
pub fn decode_shard(bytes: &[u8]) -> Result<Vec<SingleIndex>, ShardCodecError> {
    let reader = Reader::with_schema(schema(), bytes)?;
    let mut out = Vec::new();
    for value in reader {
        let record: BlockIndexRecord = from_value(&value?)?;
        out.push(from_record(record)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsift_core::ParsedQuery;

    fn doc(prefix: &str, index: u32, field: &str, term: &str) -> Document {
        Document::new(prefix, index).with_term(field, term)
    }

    #[test]
    fn encode_decode_round_trip() {
        let indexes = vec![
            SingleIndex::build(
                5000,
                "aa",
                "99",
                4999,
                vec![
                    doc("1111111111111111", 0, "account", "alice"),
                    doc("2222222222222222", 1, "account", "bob"),
                ],
            ),
            SingleIndex::build(5001, "bb", "aa", 5000, vec![]),
            SingleIndex::build(
                5002,
                "cc",
                "bb",
                5001,
                vec![doc("3333333333333333", 0, "action", "transfer")],
            ),
        ];

        let bytes = encode_shard(&indexes).unwrap();
        let decoded = decode_shard(&bytes).unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].block_num(), 5000);
        assert_eq!(decoded[1].doc_count(), 0);
        assert_eq!(decoded[2].block_id(), "cc");

        let q = ParsedQuery::parse("account:bob").unwrap();
        let matches = decoded[0].run_query(&q);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].trx_id_prefix, "2222222222222222");
    }

    #[test]
    fn empty_shard_is_still_a_valid_artifact() {
        let bytes = encode_shard(&[]).unwrap();
        assert!(decode_shard(&bytes).unwrap().is_empty());
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(decode_shard(b"definitely not avro").is_err());
    }
}
