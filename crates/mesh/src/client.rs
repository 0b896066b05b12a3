//! Mesh client seam and the owned-peer handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chainsift_core::{SearchError, SearchResult};

use crate::peer::SearchPeer;

/// Publishes this backend's record and lists everyone else's.
///
/// Production deployments back this with a shared registry (etcd or
/// similar); [`InMemoryMesh`] serves tests and single-process wiring.
#[async_trait]
pub trait MeshClient: Send + Sync + 'static {
    async fn publish_now(&self, peer: SearchPeer) -> SearchResult<()>;

    /// Snapshot of all currently-published peers.
    fn peers(&self) -> Vec<SearchPeer>;
}

/// Process-local mesh, keyed by host.
#[derive(Default)]
pub struct InMemoryMesh {
    records: RwLock<HashMap<String, SearchPeer>>,
}

impl InMemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeshClient for InMemoryMesh {
    async fn publish_now(&self, mut peer: SearchPeer) -> SearchResult<()> {
        peer.published_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        tracing::debug!(
            host = %peer.host,
            tier = ?peer.tier,
            tail = peer.tail_block,
            irr = peer.irr_block,
            head = peer.head_block,
            ready = peer.ready,
            "peer published"
        );
        self.records
            .write()
            .map_err(|_| SearchError::internal("mesh registry poisoned"))?
            .insert(peer.host.clone(), peer);
        Ok(())
    }

    fn peers(&self) -> Vec<SearchPeer> {
        self.records
            .read()
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// This backend's own peer record.
///
/// All mutation goes through [`locked`](Self::locked), which republishes
/// the updated snapshot in the same critical section — readers of the mesh
/// never observe a half-updated record.
pub struct PeerHandle {
    peer: Mutex<SearchPeer>,
    mesh: Arc<dyn MeshClient>,
}

impl PeerHandle {
    pub fn new(peer: SearchPeer, mesh: Arc<dyn MeshClient>) -> Self {
        Self {
            peer: Mutex::new(peer),
            mesh,
        }
    }

    pub fn snapshot(&self) -> SearchPeer {
        self.peer.lock().expect("peer lock poisoned").clone()
    }

    /// Mutate the record and republish it.
    pub async fn locked(&self, update: impl FnOnce(&mut SearchPeer)) -> SearchResult<()> {
        let snapshot = {
            let mut peer = self.peer.lock().expect("peer lock poisoned");
            update(&mut peer);
            peer.clone()
        };
        self.mesh.publish_now(snapshot).await
    }

    /// Republish the current record unchanged (heartbeat).
    pub async fn republish(&self) -> SearchResult<()> {
        self.mesh.publish_now(self.snapshot()).await
    }

    /// Heartbeat loop: republish at least every `publish_duration` until
    /// the shutdown signal flips.
    pub async fn publish_loop(
        self: Arc<Self>,
        publish_duration: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(publish_duration);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.republish().await {
                        tracing::warn!(%err, "peer republish failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("publish loop stopping");
                        return;
                    }
                }
            }
        }
    }
}
