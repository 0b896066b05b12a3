//! Object store capability.
//!
//! Durable shard artifacts and block files live behind this seam. The
//! service only needs four operations (list/get/put/exists); production
//! deployments point it at S3 or GCS, tests and single-node setups use the
//! filesystem or in-memory implementations shipped here.

mod fs;
mod mem;

pub use fs::FsStore;
pub use mem::MemStore;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Minimal object store surface.
///
/// Names are `/`-separated keys relative to the store root. Listings are
/// returned in lexicographic order — shard names are zero-padded exactly so
/// that this order equals block order.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// List object names starting with `prefix`, skipping any name ending
    /// in `exclude_suffix` (partial uploads), up to `limit` entries.
    async fn list_files(
        &self,
        prefix: &str,
        exclude_suffix: &str,
        limit: usize,
    ) -> StoreResult<Vec<String>>;

    async fn get_object(&self, name: &str) -> StoreResult<Bytes>;

    async fn put_object(&self, name: &str, content: Bytes) -> StoreResult<()>;

    async fn exists(&self, name: &str) -> StoreResult<bool>;
}
