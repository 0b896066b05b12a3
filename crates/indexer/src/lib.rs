//! The indexing pipeline.
//!
//! Consumes a fork-aware block stream, preindexes each irreversible block,
//! packs per-block indexes into block-range-aligned writable shards, seals
//! a shard into one artifact at every range boundary, and hands sealed
//! shards to a bounded uploader. Live mode additionally fans reversible
//! steps out to the live tail.

mod indexer;
mod metrics;
mod pipeline;
mod uploader;

pub use indexer::{Indexer, IndexerConfig};
pub use metrics::IndexerMetrics;
pub use pipeline::Pipeline;
pub use uploader::Uploader;
