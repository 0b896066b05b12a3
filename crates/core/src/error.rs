//! Shared error taxonomy for every tier.
//!
//! Variants mirror the gRPC status codes the service surfaces; the actual
//! `tonic::Status` conversion lives in `chainsift-grpc` so this crate stays
//! transport-free.

use thiserror::Error;

/// Errors crossing component boundaries anywhere in the service.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Malformed query, unaligned start block, empty fork refs.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested range outside what this peer serves.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Fork refs not in the lookup window, missing block files.
    #[error("not found: {0}")]
    NotFound(String),

    /// No peer covers the range, mesh empty, shutdown in progress.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// I/O, corruption, programmer error.
    #[error("internal: {0}")]
    Internal(String),

    /// Client or parent context canceled.
    #[error("canceled")]
    Canceled,
}

impl SearchError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self::OutOfRange(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a router may retry the request against another peer.
    ///
    /// Only transient server-side failures qualify; argument and range
    /// errors would fail identically anywhere.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::Unavailable(_))
    }
}

impl From<std::io::Error> for SearchError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

pub type SearchResult<T> = Result<T, SearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability() {
        assert!(SearchError::internal("boom").is_retryable());
        assert!(SearchError::unavailable("gone").is_retryable());
        assert!(!SearchError::invalid_argument("bad").is_retryable());
        assert!(!SearchError::out_of_range("low").is_retryable());
        assert!(!SearchError::Canceled.is_retryable());
    }
}
