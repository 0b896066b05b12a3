//! Daemon configuration, loaded from a TOML file.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiftConfig {
    /// Tracing filter directive, e.g. `info` or `chainsift_archive=debug`.
    #[serde(default = "SiftConfig::default_log_level")]
    pub log_level: String,

    pub store: StoreConfig,

    pub shards: ShardConfig,

    #[serde(default)]
    pub mesh: MeshConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub indexer: IndexerSection,

    #[serde(default)]
    pub live: LiveConfig,
}

impl SiftConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn load(path: &std::path::Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| format!("reading config {}: {err}", path.display()))?;
        toml::from_str(&raw).map_err(|err| format!("parsing config {}: {err}", path.display()))
    }
}

/// Object store locations. Local paths here; S3/GCS wiring belongs to the
/// transport layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Where durable shard artifacts live.
    pub indexes_path: String,
    /// Where block files live.
    pub blocks_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardConfig {
    pub shard_size: u64,
    /// Local directory for downloaded read-only shards.
    pub local_dir: String,
    /// Scratch directory for writable shards being built.
    #[serde(default = "ShardConfig::default_writable_dir")]
    pub writable_dir: String,
}

impl ShardConfig {
    fn default_writable_dir() -> String {
        "/tmp/chainsift/writable".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    #[serde(default = "MeshConfig::default_publish_duration_secs")]
    pub publish_duration_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            publish_duration_secs: Self::default_publish_duration_secs(),
        }
    }
}

impl MeshConfig {
    const fn default_publish_duration_secs() -> u64 {
        5
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    /// Start block; negative means relative to the mesh's irreversible
    /// head (enables the moving tail).
    #[serde(default)]
    pub start_block: i64,
    /// Stop serving above this block; zero means moving head.
    #[serde(default)]
    pub stop_block: u64,
    #[serde(default = "ArchiveConfig::default_true")]
    pub sync_from_store: bool,
    #[serde(default = "ArchiveConfig::default_sync_max_shards")]
    pub sync_max_shards: usize,
    #[serde(default = "ArchiveConfig::default_download_threads")]
    pub download_threads: usize,
    #[serde(default = "ArchiveConfig::default_query_threads")]
    pub query_threads: usize,
    #[serde(default = "ArchiveConfig::default_true")]
    pub index_polling: bool,
    #[serde(default = "ArchiveConfig::default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "ArchiveConfig::default_shutdown_delay_secs")]
    pub shutdown_delay_secs: u64,
    /// Optional newline-separated warmup query file.
    #[serde(default)]
    pub warmup_file: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            stop_block: 0,
            sync_from_store: true,
            sync_max_shards: Self::default_sync_max_shards(),
            download_threads: Self::default_download_threads(),
            query_threads: Self::default_query_threads(),
            index_polling: true,
            poll_interval_secs: Self::default_poll_interval_secs(),
            shutdown_delay_secs: Self::default_shutdown_delay_secs(),
            warmup_file: String::new(),
        }
    }
}

impl ArchiveConfig {
    const fn default_true() -> bool {
        true
    }

    const fn default_sync_max_shards() -> usize {
        1_000_000
    }

    const fn default_download_threads() -> usize {
        8
    }

    const fn default_query_threads() -> usize {
        8
    }

    const fn default_poll_interval_secs() -> u64 {
        15
    }

    const fn default_shutdown_delay_secs() -> u64 {
        2
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct IndexerSection {
    #[serde(default)]
    pub start_block: u64,
    /// Stop after this block; zero means follow the chain.
    #[serde(default)]
    pub stop_block: u64,
    #[serde(default = "IndexerSection::default_lookback")]
    pub lookback: u64,
    #[serde(default = "IndexerSection::default_enable_upload")]
    pub enable_upload: bool,
    #[serde(default)]
    pub delete_after_upload: bool,
    #[serde(default = "IndexerSection::default_upload_threads")]
    pub upload_threads: usize,
}

impl IndexerSection {
    const fn default_lookback() -> u64 {
        100
    }

    const fn default_enable_upload() -> bool {
        true
    }

    const fn default_upload_threads() -> usize {
        2
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LiveConfig {
    #[serde(default = "LiveConfig::default_truncation_threshold")]
    pub truncation_threshold: usize,
    #[serde(default = "LiveConfig::default_realtime_tolerance_secs")]
    pub realtime_tolerance_secs: u64,
    #[serde(default = "LiveConfig::default_head_delay_tolerance")]
    pub head_delay_tolerance: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            truncation_threshold: Self::default_truncation_threshold(),
            realtime_tolerance_secs: Self::default_realtime_tolerance_secs(),
            head_delay_tolerance: Self::default_head_delay_tolerance(),
        }
    }
}

impl LiveConfig {
    const fn default_truncation_threshold() -> usize {
        1
    }

    const fn default_realtime_tolerance_secs() -> u64 {
        15
    }

    const fn default_head_delay_tolerance() -> u64 {
        12
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let raw = r#"
            [store]
            indexes_path = "/data/shards"
            blocks_path = "/data/blocks"

            [shards]
            shard_size = 5000
            local_dir = "/data/local"
        "#;
        let config: SiftConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.shards.shard_size, 5000);
        assert_eq!(config.archive.query_threads, 8);
        assert_eq!(config.indexer.upload_threads, 2);
        assert_eq!(config.live.truncation_threshold, 1);
        assert_eq!(config.mesh.publish_duration_secs, 5);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"
            typo_field = 1

            [store]
            indexes_path = "/data/shards"
            blocks_path = "/data/blocks"

            [shards]
            shard_size = 5000
            local_dir = "/data/local"
        "#;
        assert!(toml::from_str::<SiftConfig>(raw).is_err());
    }
}
