//! The archive tier: cold, irreversible history.
//!
//! An [`IndexPool`] owns every shard visible to this backend — synced from
//! the object store, opened read-only, evicted when the tail moves. The
//! [`ArchiveQueryEngine`] fans per-shard search tasks across a bounded
//! worker pool while keeping the output stream monotone in block order,
//! and [`ArchiveBackend`] wraps both behind the backend service contract.

mod backend;
mod metrics;
mod pool;
mod query;
mod truncator;

pub use backend::ArchiveBackend;
pub use metrics::ArchiveMetrics;
pub use pool::IndexPool;
pub use query::ArchiveQueryEngine;
pub use truncator::Truncator;
