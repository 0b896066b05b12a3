//! The router tier.
//!
//! Translates one client query into fan-outs across the responsible
//! backends — archive tiers for irreversible history, the live tier for
//! the head — and stitches their streams into a single ordered sequence.
//! Cursors are validated against the block-meta service; a cursor whose
//! block got forked out first unwinds through the fork resolver.

mod blockmeta;
mod dialer;
mod plan;
mod router;

pub use blockmeta::BlockMeta;
pub use dialer::{BackendDialer, InProcessDialer};
pub use plan::{plan_legs, Leg, RouterConfig};
pub use router::Router;
