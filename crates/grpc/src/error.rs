//! Error taxonomy → gRPC status mapping.

use chainsift_core::SearchError;
use tonic::{Code, Status};

/// Map a service error onto its wire status.
///
/// Messages are passed through verbatim — they already name the offending
/// range or identifier and never contain stack content.
pub fn search_error_to_status(err: SearchError) -> Status {
    match &err {
        SearchError::InvalidArgument(msg) => Status::new(Code::InvalidArgument, msg.clone()),
        SearchError::OutOfRange(msg) => Status::new(Code::OutOfRange, msg.clone()),
        SearchError::NotFound(msg) => Status::new(Code::NotFound, msg.clone()),
        SearchError::Unavailable(msg) => Status::new(Code::Unavailable, msg.clone()),
        SearchError::Internal(msg) => Status::new(Code::Internal, msg.clone()),
        SearchError::Canceled => Status::new(Code::Cancelled, "context canceled"),
    }
}

/// Whether a failed backend stream may be retried elsewhere.
pub fn is_retryable_status(status: &Status) -> bool {
    matches!(status.code(), Code::Internal | Code::Unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_one_to_one() {
        assert_eq!(
            search_error_to_status(SearchError::invalid_argument("bad")).code(),
            Code::InvalidArgument
        );
        assert_eq!(
            search_error_to_status(SearchError::out_of_range("low")).code(),
            Code::OutOfRange
        );
        assert_eq!(
            search_error_to_status(SearchError::not_found("gone")).code(),
            Code::NotFound
        );
        assert_eq!(
            search_error_to_status(SearchError::unavailable("down")).code(),
            Code::Unavailable
        );
        assert_eq!(
            search_error_to_status(SearchError::internal("io")).code(),
            Code::Internal
        );
        assert_eq!(
            search_error_to_status(SearchError::Canceled).code(),
            Code::Cancelled
        );
    }

    #[test]
    fn only_server_side_failures_are_retryable() {
        assert!(is_retryable_status(&Status::internal("boom")));
        assert!(is_retryable_status(&Status::unavailable("gone")));
        assert!(!is_retryable_status(&Status::out_of_range("range")));
        assert!(!is_retryable_status(&Status::invalid_argument("bad")));
        assert!(!is_retryable_status(&Status::cancelled("bye")));
    }
}
