//! The shard pool.
//!
//! Shard handles are `Arc`s: a range lookup hands out clones, and eviction
//! only removes the pool's own reference — an in-flight query keeps its
//! shard alive until the guard drops, on every exit path.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chainsift_core::{SearchError, SearchResult, ShardModel};
use chainsift_index::ShardIndex;
use chainsift_store::Store;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// How many remote names one listing may return. Far above any real
/// deployment; the store enforces its own paging anyway.
const LIST_LIMIT: usize = 9_999_999;

#[derive(Debug)]
enum ShardEntry {
    Open(Arc<ShardIndex>),
    /// Failed to open; never serves, never advances the indexed pointer.
    Corrupt,
}

#[derive(Default)]
struct PoolState {
    shards: BTreeMap<u64, ShardEntry>,
    lowest_serveable: u64,
    ready: bool,
}

/// Owns every on-disk shard visible to this backend.
pub struct IndexPool {
    model: ShardModel,
    local_dir: PathBuf,
    store: Arc<dyn Store>,
    state: RwLock<PoolState>,
}

impl IndexPool {
    pub fn new(
        local_dir: impl Into<PathBuf>,
        model: ShardModel,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            model,
            local_dir: local_dir.into(),
            store,
            state: RwLock::new(PoolState::default()),
        }
    }

    pub fn shard_model(&self) -> ShardModel {
        self.model
    }

    fn local_path(&self, base: u64) -> PathBuf {
        self.local_dir.join(self.model.shard_name(base))
    }

    fn remote_name(&self, base: u64) -> String {
        format!("{}{}", self.model.store_prefix(), self.model.shard_name(base))
    }

    /// Download remote shards in `[start_block, stop_block]` that are not
    /// yet local. At most `max_count` downloads, `parallelism` in flight.
    /// Idempotent: an existing local file is never re-fetched.
    pub async fn sync_from_storage(
        &self,
        start_block: u64,
        stop_block: u64,
        max_count: usize,
        parallelism: usize,
    ) -> SearchResult<usize> {
        let remote = self
            .store
            .list_files(&self.model.store_prefix(), ".tmp", LIST_LIMIT)
            .await
            .map_err(|err| SearchError::internal(format!("listing shard store: {err}")))?;

        let mut wanted = Vec::new();
        for name in &remote {
            let Some(base) = ShardModel::parse_shard_name(name) else {
                continue;
            };
            if self.model.end_of(base) < start_block {
                continue;
            }
            if stop_block != 0 && base > stop_block {
                continue;
            }
            if tokio::fs::try_exists(self.local_path(base)).await? {
                continue;
            }
            wanted.push(base);
            if wanted.len() == max_count {
                break;
            }
        }

        if wanted.is_empty() {
            return Ok(0);
        }
        tracing::info!(
            count = wanted.len(),
            first = wanted.first(),
            last = wanted.last(),
            parallelism,
            "syncing shards from storage"
        );

        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut tasks = JoinSet::new();
        for base in wanted {
            let store = Arc::clone(&self.store);
            let semaphore = Arc::clone(&semaphore);
            let remote_name = self.remote_name(base);
            let local_path = self.local_path(base);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| SearchError::internal("download semaphore closed"))?;
                let body = store.get_object(&remote_name).await.map_err(|err| {
                    SearchError::internal(format!("downloading {remote_name}: {err}"))
                })?;
                if let Some(parent) = local_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let tmp = local_path.with_extension("avro.tmp");
                tokio::fs::write(&tmp, &body).await?;
                tokio::fs::rename(&tmp, &local_path).await?;
                tracing::debug!(base, bytes = body.len(), "shard downloaded");
                Ok::<_, SearchError>(())
            });
        }

        let mut downloaded = 0usize;
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|err| SearchError::internal(format!("download task: {err}")))??;
            downloaded += 1;
        }
        Ok(downloaded)
    }

    /// Open every on-disk shard whose range reaches `start_block`, verify
    /// name contiguity, and install them as the serving set.
    ///
    /// A shard that fails to open is marked corrupt and skipped — the pool
    /// keeps serving everything below it. A *missing* shard between two
    /// present ones is a hard error: continuity is a promise to routers.
    pub async fn scan_on_disk_indexes(&self, start_block: u64) -> SearchResult<()> {
        let mut bases = self.list_local_bases().await?;
        bases.retain(|&base| self.model.end_of(base) >= start_block);

        for window in bases.windows(2) {
            let expected = self.model.end_of(window[0]) + 1;
            if window[1] != expected {
                return Err(SearchError::internal(format!(
                    "on-disk shard gap: {} is followed by {}, expected {}",
                    window[0], window[1], expected
                )));
            }
        }

        let mut opened = BTreeMap::new();
        for base in bases {
            match self.open_local(base).await {
                Ok(shard) => {
                    opened.insert(base, ShardEntry::Open(Arc::new(shard)));
                }
                Err(err) => {
                    tracing::error!(base, %err, "failed opening shard, marking corrupt");
                    opened.insert(base, ShardEntry::Corrupt);
                }
            }
        }

        let count = opened.len();
        let mut state = self.state.write().expect("pool lock poisoned");
        state.shards = opened;
        drop(state);
        tracing::info!(count, start_block, "on-disk shards scanned");
        Ok(())
    }

    async fn open_local(&self, base: u64) -> SearchResult<ShardIndex> {
        let bytes = tokio::fs::read(self.local_path(base)).await?;
        ShardIndex::open(base, self.model.shard_size(), &bytes)
    }

    async fn list_local_bases(&self) -> SearchResult<Vec<u64>> {
        let mut bases = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.local_dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(bases),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            if let Some(base) = ShardModel::parse_shard_name(&entry.file_name().to_string_lossy())
            {
                bases.push(base);
            }
        }
        bases.sort_unstable();
        Ok(bases)
    }

    /// Delete local shards fully outside `[start_block, stop_block]`
    /// (`stop_block == 0` means unbounded). Partial overlaps are preserved.
    pub async fn clean_on_disk_indexes(
        &self,
        start_block: u64,
        stop_block: u64,
    ) -> SearchResult<usize> {
        let bases = self.list_local_bases().await?;
        let mut removed = 0usize;
        for base in bases {
            let end = self.model.end_of(base);
            let below = end < start_block;
            let above = stop_block != 0 && base > stop_block;
            if !(below || above) {
                continue;
            }
            tokio::fs::remove_file(self.local_path(base)).await?;
            self.state
                .write()
                .expect("pool lock poisoned")
                .shards
                .remove(&base);
            removed += 1;
            tracing::info!(base, "evicted shard outside serving range");
        }
        Ok(removed)
    }

    /// Atomically advance the serving tail. Queries below it fail with
    /// `OutOfRange`.
    pub fn set_lowest_serveable_block_num(&self, block_num: u64) {
        let mut state = self.state.write().expect("pool lock poisoned");
        state.lowest_serveable = block_num;
    }

    pub fn lowest_serveable_block_num(&self) -> u64 {
        self.state.read().expect("pool lock poisoned").lowest_serveable
    }

    pub fn set_ready(&self) {
        self.state.write().expect("pool lock poisoned").ready = true;
    }

    pub fn is_ready(&self) -> bool {
        self.state.read().expect("pool lock poisoned").ready
    }

    /// Highest block covered by the contiguous run of healthy shards
    /// starting at the serving tail. Zero when nothing is open.
    pub fn last_read_only_indexed_block(&self) -> u64 {
        let state = self.state.read().expect("pool lock poisoned");
        let mut last = 0u64;
        let mut expected: Option<u64> = None;
        for (&base, entry) in &state.shards {
            if self.model.end_of(base) < state.lowest_serveable {
                continue;
            }
            if let Some(expected) = expected {
                if base != expected {
                    break;
                }
            }
            match entry {
                ShardEntry::Open(_) => {
                    last = self.model.end_of(base);
                    expected = Some(last + 1);
                }
                ShardEntry::Corrupt => break,
            }
        }
        last
    }

    /// Block id paired with [`Self::last_read_only_indexed_block`]: the id
    /// of the highest block actually present in the healthy run.
    pub fn last_read_only_indexed_block_id(&self) -> String {
        let state = self.state.read().expect("pool lock poisoned");
        let mut last_id = String::new();
        let mut expected: Option<u64> = None;
        for (&base, entry) in &state.shards {
            if self.model.end_of(base) < state.lowest_serveable {
                continue;
            }
            if let Some(expected) = expected {
                if base != expected {
                    break;
                }
            }
            match entry {
                ShardEntry::Open(shard) => {
                    if let Some(block) = shard.last_block() {
                        last_id = block.block_id().to_string();
                    }
                    expected = Some(self.model.end_of(base) + 1);
                }
                ShardEntry::Corrupt => break,
            }
        }
        last_id
    }

    /// Snapshot of open shards overlapping `[lo, hi]`, ascending by base.
    /// The returned handles keep their shards open until dropped.
    pub fn open_shards_by_range(&self, lo: u64, hi: u64) -> Vec<Arc<ShardIndex>> {
        let state = self.state.read().expect("pool lock poisoned");
        state
            .shards
            .iter()
            .filter_map(|(&base, entry)| match entry {
                ShardEntry::Open(shard)
                    if self.model.end_of(base) >= lo && base <= hi =>
                {
                    Some(Arc::clone(shard))
                }
                _ => None,
            })
            .collect()
    }

    /// Periodic reconciler: pull newly-uploaded shards and extend the
    /// contiguous serving run, until shutdown flips.
    pub async fn poll_remote_indices(
        self: Arc<Self>,
        start_block: u64,
        stop_block: u64,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once(start_block, stop_block).await {
                        tracing::warn!(%err, "remote index poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn poll_once(&self, start_block: u64, stop_block: u64) -> SearchResult<()> {
        let synced = self
            .sync_from_storage(start_block, stop_block, LIST_LIMIT, 2)
            .await?;
        let absorbed = self.absorb_new_local_shards().await?;
        if synced > 0 || absorbed > 0 {
            tracing::info!(
                synced,
                absorbed,
                last_indexed = self.last_read_only_indexed_block(),
                "remote indices polled"
            );
        }
        Ok(())
    }

    /// Open local shard files that extend the current contiguous run.
    async fn absorb_new_local_shards(&self) -> SearchResult<usize> {
        let bases = self.list_local_bases().await?;
        let mut absorbed = 0usize;
        for base in bases {
            let already = {
                let state = self.state.read().expect("pool lock poisoned");
                state.shards.contains_key(&base)
            };
            if already {
                continue;
            }
            match self.open_local(base).await {
                Ok(shard) => {
                    let mut state = self.state.write().expect("pool lock poisoned");
                    state.shards.insert(base, ShardEntry::Open(Arc::new(shard)));
                    absorbed += 1;
                }
                Err(err) => {
                    tracing::error!(base, %err, "failed opening polled shard, marking corrupt");
                    let mut state = self.state.write().expect("pool lock poisoned");
                    state.shards.insert(base, ShardEntry::Corrupt);
                }
            }
        }
        Ok(absorbed)
    }

    /// Drop every shard handle the pool owns. In-flight queries finish on
    /// their own clones.
    pub fn close(&self) {
        let mut state = self.state.write().expect("pool lock poisoned");
        let count = state.shards.len();
        state.shards.clear();
        state.ready = false;
        tracing::info!(count, "index pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsift_core::Document;
    use chainsift_index::{encode_shard, SingleIndex};
    use chainsift_store::MemStore;
    use tempfile::TempDir;

    fn model() -> ShardModel {
        ShardModel::new(100).unwrap()
    }

    fn shard_bytes(base: u64, docs_at: &[u64]) -> Vec<u8> {
        let indexes: Vec<SingleIndex> = docs_at
            .iter()
            .map(|&num| {
                SingleIndex::build(
                    num,
                    format!("id{num}"),
                    format!("id{}", num.saturating_sub(1)),
                    num.saturating_sub(1),
                    vec![Document::new("aabbccddeeff0011", 0).with_term("account", "alice")],
                )
            })
            .collect();
        encode_shard(&indexes).unwrap()
    }

    async fn put_remote(store: &MemStore, base: u64, bytes: &[u8]) {
        let name = format!("bigquery-shards-100/{base:010}.avro");
        store
            .put_object(&name, bytes::Bytes::copy_from_slice(bytes))
            .await
            .unwrap();
    }

    async fn pool_with_remote(shards: &[(u64, Vec<u8>)]) -> (TempDir, Arc<MemStore>, IndexPool) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemStore::new());
        for (base, bytes) in shards {
            put_remote(&store, *base, bytes).await;
        }
        let pool = IndexPool::new(dir.path(), model(), Arc::clone(&store) as Arc<dyn Store>);
        (dir, store, pool)
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let (_dir, _store, pool) = pool_with_remote(&[
            (0, shard_bytes(0, &[5])),
            (100, shard_bytes(100, &[150])),
        ])
        .await;

        assert_eq!(pool.sync_from_storage(0, 0, 100, 4).await.unwrap(), 2);
        // Unchanged remote: second run downloads nothing.
        assert_eq!(pool.sync_from_storage(0, 0, 100, 4).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sync_respects_range_and_max_count() {
        let (_dir, _store, pool) = pool_with_remote(&[
            (0, shard_bytes(0, &[5])),
            (100, shard_bytes(100, &[150])),
            (200, shard_bytes(200, &[250])),
        ])
        .await;

        // start_block=100 excludes shard 0; max_count=1 stops after one.
        assert_eq!(pool.sync_from_storage(100, 0, 1, 4).await.unwrap(), 1);
        assert_eq!(pool.sync_from_storage(100, 250, 10, 4).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scan_opens_contiguous_shards_and_tracks_last_indexed() {
        let (_dir, _store, pool) = pool_with_remote(&[
            (0, shard_bytes(0, &[5, 50])),
            (100, shard_bytes(100, &[150])),
        ])
        .await;
        pool.sync_from_storage(0, 0, 100, 4).await.unwrap();
        pool.scan_on_disk_indexes(0).await.unwrap();

        assert_eq!(pool.last_read_only_indexed_block(), 199);
        assert_eq!(pool.last_read_only_indexed_block_id(), "id150");

        let shards = pool.open_shards_by_range(0, 199);
        assert_eq!(shards.len(), 2);
        assert_eq!(pool.open_shards_by_range(120, 130).len(), 1);
    }

    #[tokio::test]
    async fn scan_rejects_gaps() {
        let (_dir, _store, pool) = pool_with_remote(&[
            (0, shard_bytes(0, &[5])),
            (200, shard_bytes(200, &[250])),
        ])
        .await;
        pool.sync_from_storage(0, 0, 100, 4).await.unwrap();

        let err = pool.scan_on_disk_indexes(0).await.unwrap_err();
        assert!(err.to_string().contains("gap"), "got: {err}");
    }

    #[tokio::test]
    async fn corrupt_shard_stops_the_indexed_pointer_but_not_serving() {
        let (dir, _store, pool) = pool_with_remote(&[(0, shard_bytes(0, &[5]))]).await;
        pool.sync_from_storage(0, 0, 100, 4).await.unwrap();
        // Hand-plant a corrupt artifact as the next shard.
        std::fs::write(dir.path().join("0000000100.avro"), b"garbage").unwrap();
        std::fs::write(
            dir.path().join("0000000200.avro"),
            shard_bytes(200, &[250]),
        )
        .unwrap();

        pool.scan_on_disk_indexes(0).await.unwrap();
        // Healthy run ends before the corrupt shard.
        assert_eq!(pool.last_read_only_indexed_block(), 99);
        // The healthy shard past the corruption still serves range lookups.
        assert_eq!(pool.open_shards_by_range(0, 300).len(), 2);
    }

    #[tokio::test]
    async fn clean_preserves_partial_overlaps() {
        let (dir, _store, pool) = pool_with_remote(&[
            (0, shard_bytes(0, &[5])),
            (100, shard_bytes(100, &[150])),
            (200, shard_bytes(200, &[250])),
        ])
        .await;
        pool.sync_from_storage(0, 0, 100, 4).await.unwrap();

        // [150, 0] keeps shard 100 (partial overlap) and everything above.
        let removed = pool.clean_on_disk_indexes(150, 0).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("0000000000.avro").exists());
        assert!(dir.path().join("0000000100.avro").exists());
        assert!(dir.path().join("0000000200.avro").exists());
    }

    #[tokio::test]
    async fn poll_absorbs_newly_uploaded_shards() {
        let (_dir, store, pool) = pool_with_remote(&[(0, shard_bytes(0, &[5]))]).await;
        pool.sync_from_storage(0, 0, 100, 4).await.unwrap();
        pool.scan_on_disk_indexes(0).await.unwrap();
        assert_eq!(pool.last_read_only_indexed_block(), 99);

        put_remote(&store, 100, &shard_bytes(100, &[150])).await;
        pool.poll_once(0, 0).await.unwrap();
        assert_eq!(pool.last_read_only_indexed_block(), 199);
    }

    #[tokio::test]
    async fn lowest_serveable_gates_the_tail() {
        let (_dir, _store, pool) = pool_with_remote(&[(0, shard_bytes(0, &[5]))]).await;
        pool.sync_from_storage(0, 0, 100, 4).await.unwrap();
        pool.scan_on_disk_indexes(0).await.unwrap();

        pool.set_lowest_serveable_block_num(42);
        assert_eq!(pool.lowest_serveable_block_num(), 42);
        // Shard [0,99] still overlaps the serveable range.
        assert_eq!(pool.last_read_only_indexed_block(), 99);
    }
}
