//! Pipeline gauges and counters.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, Default)]
pub struct IndexerMetrics {
    pub last_written_block: Gauge,
    pub sealed_shards: Counter,
}

impl IndexerMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "last_written_block",
            "Highest block appended to the writable shard",
            metrics.last_written_block.clone(),
        );
        registry.register(
            "sealed_shards",
            "Shards sealed into artifacts since start",
            metrics.sealed_shards.clone(),
        );
        metrics
    }
}
