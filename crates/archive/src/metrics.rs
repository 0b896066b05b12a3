//! Backend gauges.
//!
//! Registered into a caller-owned registry; the scrape endpoint is wired
//! outside the core.

use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, Default)]
pub struct ArchiveMetrics {
    pub active_query_count: Gauge,
    pub tail_block_number: Gauge,
    pub last_indexed_block: Gauge,
}

impl ArchiveMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "active_query_count",
            "Number of archive queries currently streaming",
            metrics.active_query_count.clone(),
        );
        registry.register(
            "tail_block_number",
            "Lowest serveable block of this backend",
            metrics.tail_block_number.clone(),
        );
        registry.register(
            "last_indexed_block",
            "Highest contiguous read-only indexed block",
            metrics.last_indexed_block.clone(),
        );
        metrics
    }
}
