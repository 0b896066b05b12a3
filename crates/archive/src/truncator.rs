//! Moving-tail truncation.
//!
//! Backends started with a relative start block keep a fixed-width window
//! behind the irreversible head: as indexing advances, the tail moves up,
//! shards falling fully below it are evicted, and the moved tail is
//! republished so routers stop sending queries there.

use std::sync::Arc;
use std::time::Duration;

use chainsift_core::SearchResult;
use chainsift_mesh::PeerHandle;

use crate::pool::IndexPool;

pub struct Truncator {
    pool: Arc<IndexPool>,
    peer: Arc<PeerHandle>,
    /// Window width in blocks, from the relative start block.
    block_count: u64,
    interval: Duration,
}

impl Truncator {
    pub fn new(
        pool: Arc<IndexPool>,
        peer: Arc<PeerHandle>,
        block_count: u64,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            peer,
            block_count,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.truncate_once().await {
                        tracing::warn!(%err, "tail truncation failed");
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

    pub async fn truncate_once(&self) -> SearchResult<()> {
        let irr = self.pool.last_read_only_indexed_block();
        let model = self.pool.shard_model();
        let new_tail = model.align(irr.saturating_sub(self.block_count));
        if new_tail <= self.pool.lowest_serveable_block_num() {
            return Ok(());
        }

        tracing::info!(new_tail, irr, window = self.block_count, "moving tail forward");
        self.pool.set_lowest_serveable_block_num(new_tail);
        let evicted = self.pool.clean_on_disk_indexes(new_tail, 0).await?;
        self.peer
            .locked(|p| {
                p.tail_block = new_tail;
                p.moving_tail = true;
            })
            .await?;
        tracing::debug!(evicted, "tail truncation complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsift_core::{Document, ShardModel};
    use chainsift_index::{encode_shard, SingleIndex};
    use chainsift_mesh::{InMemoryMesh, MeshClient, SearchPeer, Tier};
    use chainsift_store::{MemStore, Store};
    use tempfile::TempDir;

    #[tokio::test]
    async fn advances_tail_and_publishes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemStore::new());
        let model = ShardModel::new(100).unwrap();

        for base in [0u64, 100, 200, 300] {
            let idx = SingleIndex::build(
                base + 1,
                format!("id{}", base + 1),
                format!("id{base}"),
                base,
                vec![Document::new("aabbccddeeff0011", 0).with_term("a", "x")],
            );
            store
                .put_object(
                    &format!("bigquery-shards-100/{base:010}.avro"),
                    bytes::Bytes::from(encode_shard(&[idx]).unwrap()),
                )
                .await
                .unwrap();
        }

        let pool = Arc::new(IndexPool::new(
            dir.path(),
            model,
            Arc::clone(&store) as Arc<dyn Store>,
        ));
        pool.sync_from_storage(0, 0, 100, 4).await.unwrap();
        pool.scan_on_disk_indexes(0).await.unwrap();
        assert_eq!(pool.last_read_only_indexed_block(), 399);

        let mesh: Arc<dyn MeshClient> = Arc::new(InMemoryMesh::new());
        let peer = Arc::new(PeerHandle::new(
            SearchPeer::new("archive:9000", Tier::Archive, 0, "v1", 100),
            Arc::clone(&mesh),
        ));

        // Keep a 150-block window behind irr=399: tail moves to align(249)=200.
        let truncator = Truncator::new(
            Arc::clone(&pool),
            peer,
            150,
            Duration::from_secs(3600),
        );
        truncator.truncate_once().await.unwrap();

        assert_eq!(pool.lowest_serveable_block_num(), 200);
        assert!(!dir.path().join("0000000000.avro").exists());
        assert!(!dir.path().join("0000000100.avro").exists());
        assert!(dir.path().join("0000000200.avro").exists());

        let published = &mesh.peers()[0];
        assert_eq!(published.tail_block, 200);
        assert!(published.moving_tail);

        // Second run with no progress is a no-op.
        truncator.truncate_once().await.unwrap();
        assert_eq!(pool.lowest_serveable_block_num(), 200);
    }
}
