//! Per-block inverted indexes and the shard artifact.
//!
//! A [`SingleIndex`] covers exactly one block and is immutable once built.
//! The [`PreIndexer`] turns decoded blocks into single indexes through a
//! protocol-specific mapper. Sealed shards serialize a contiguous run of
//! single indexes into one Avro object container file — the durable
//! artifact the archive tier downloads and opens as a [`ShardIndex`].

mod artifact;
mod preindexer;
mod shard_index;
mod single;

pub use artifact::{decode_shard, encode_shard, ShardCodecError};
pub use preindexer::PreIndexer;
pub use shard_index::ShardIndex;
pub use single::{DocEntry, SingleIndex};
