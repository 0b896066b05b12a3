//! Service traits and stream plumbing.

use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use tonic::Status;

use crate::messages::{BackendRequest, ForkResolveRequest, HeadInfo, RouterRequest, SearchMatchMsg};

/// Server-streaming response of matches.
pub type MatchStream = Pin<Box<dyn Stream<Item = Result<SearchMatchMsg, Status>> + Send + Sync>>;

/// Trailer key reporting the highest block a backend actually read.
pub const LAST_BLOCK_READ_TRAILER: &str = "last-block-read";

/// Shared `last-block-read` trailer value.
///
/// Starts at `-1` (the error value) and is set by the producing engine as
/// shards complete; the consumer reads it after the stream ends to decide
/// where a retry should resume.
#[derive(Debug, Clone)]
pub struct LastBlockRead(Arc<AtomicI64>);

impl Default for LastBlockRead {
    fn default() -> Self {
        Self::new()
    }
}

impl LastBlockRead {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(-1)))
    }

    pub fn set(&self, block_num: u64) {
        self.0.store(block_num as i64, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Decimal trailer value, `-1` on error.
    pub fn trailer_value(&self) -> String {
        self.get().to_string()
    }
}

/// A backend response: the match stream plus its trailer handle.
pub struct BackendStream {
    pub matches: MatchStream,
    pub last_block_read: LastBlockRead,
}

/// Archive and live backends.
#[async_trait]
pub trait BackendService: Send + Sync {
    async fn stream_matches(&self, req: BackendRequest) -> Result<BackendStream, Status>;
}

/// Fork resolver: undo matches for orphaned blocks, descending.
#[async_trait]
pub trait ForkResolverService: Send + Sync {
    async fn stream_undo_matches(&self, req: ForkResolveRequest) -> Result<MatchStream, Status>;
}

/// Client-facing router surface.
#[async_trait]
pub trait RouterService: Send + Sync {
    async fn stream_matches(&self, req: RouterRequest) -> Result<MatchStream, Status>;
}

/// LIB pointers of a backend, polled by the live tier at startup.
#[async_trait]
pub trait HeadInfoService: Send + Sync {
    async fn head_info(&self) -> Result<HeadInfo, Status>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Serving,
    NotServing,
}

/// `SERVING` only after bootstrap completed and the pool/tail is ready.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> HealthStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_block_read_defaults_to_error_value() {
        let trailer = LastBlockRead::new();
        assert_eq!(trailer.trailer_value(), "-1");
        trailer.set(123_456);
        assert_eq!(trailer.trailer_value(), "123456");
    }

    #[test]
    fn trailer_clones_share_state() {
        let trailer = LastBlockRead::new();
        let observer = trailer.clone();
        trailer.set(9);
        assert_eq!(observer.get(), 9);
    }
}
