//! Backend connection seam.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chainsift_core::{SearchError, SearchResult};
use chainsift_grpc::{BackendService, ForkResolverService};
use chainsift_mesh::SearchPeer;

/// Turns a peer record into a callable service.
///
/// The transport (gRPC channel pool) lives outside the core; the
/// [`InProcessDialer`] backs tests and single-process deployments.
#[async_trait]
pub trait BackendDialer: Send + Sync {
    async fn dial_backend(&self, peer: &SearchPeer) -> SearchResult<Arc<dyn BackendService>>;

    async fn dial_fork_resolver(
        &self,
        peer: &SearchPeer,
    ) -> SearchResult<Arc<dyn ForkResolverService>>;
}

/// Host-keyed registry of in-process services.
#[derive(Default)]
pub struct InProcessDialer {
    backends: RwLock<HashMap<String, Arc<dyn BackendService>>>,
    fork_resolvers: RwLock<HashMap<String, Arc<dyn ForkResolverService>>>,
}

impl InProcessDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_backend(&self, host: impl Into<String>, service: Arc<dyn BackendService>) {
        self.backends
            .write()
            .expect("dialer lock poisoned")
            .insert(host.into(), service);
    }

    pub fn register_fork_resolver(
        &self,
        host: impl Into<String>,
        service: Arc<dyn ForkResolverService>,
    ) {
        self.fork_resolvers
            .write()
            .expect("dialer lock poisoned")
            .insert(host.into(), service);
    }
}

#[async_trait]
impl BackendDialer for InProcessDialer {
    async fn dial_backend(&self, peer: &SearchPeer) -> SearchResult<Arc<dyn BackendService>> {
        self.backends
            .read()
            .expect("dialer lock poisoned")
            .get(&peer.host)
            .cloned()
            .ok_or_else(|| SearchError::unavailable(format!("no route to backend {}", peer.host)))
    }

    async fn dial_fork_resolver(
        &self,
        peer: &SearchPeer,
    ) -> SearchResult<Arc<dyn ForkResolverService>> {
        self.fork_resolvers
            .read()
            .expect("dialer lock poisoned")
            .get(&peer.host)
            .cloned()
            .ok_or_else(|| {
                SearchError::unavailable(format!("no route to fork resolver {}", peer.host))
            })
    }
}
