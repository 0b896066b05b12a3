//! Service contracts between tiers.
//!
//! Messages and service traits only — transport glue (codegen, listeners,
//! connection pools) stays outside the core per the service's scoping. The
//! traits use `tonic::Status` as their error vocabulary so any tonic server
//! or in-process dialer can wrap them unchanged.

mod error;
mod messages;
mod service;

pub use error::{is_retryable_status, search_error_to_status};
pub use messages::{
    BackendRequest, BlockRefMsg, ForkResolveRequest, HeadInfo, RouterRequest, SearchMatchMsg,
};
pub use service::{
    BackendService, BackendStream, ForkResolverService, HeadInfoService, HealthCheck,
    HealthStatus, LastBlockRead, MatchStream, RouterService, LAST_BLOCK_READ_TRAILER,
};
