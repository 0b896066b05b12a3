//! The published peer record.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chainsift_core::BlockRef;
use serde::{Deserialize, Serialize};

/// Functional role of a backend in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Archive,
    Live,
    ForkResolver,
    Router,
}

impl Tier {
    pub fn is_archive(&self) -> bool {
        matches!(self, Tier::Archive)
    }
}

/// Snapshot of one backend's serviceable state.
///
/// Readers treat records as immutable; the owning backend mutates its copy
/// under [`crate::PeerHandle::locked`] and republishes the whole snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPeer {
    pub host: String,
    pub tier: Tier,
    pub tier_level: u32,
    pub service_version: String,
    /// Lowest serveable block.
    pub tail_block: u64,
    /// Highest serveable block.
    pub head_block: u64,
    pub head_block_id: String,
    /// Highest irreversible indexed block.
    pub irr_block: u64,
    pub irr_block_id: String,
    pub shard_size: u64,
    pub ready: bool,
    /// Whether the tail advances over time (relative start block).
    pub moving_tail: bool,
    /// Whether the head advances over time (no stop block).
    pub moving_head: bool,
    /// Unix milliseconds of the last publish; stamped by the mesh client.
    pub published_at_ms: u64,
}

impl SearchPeer {
    pub fn new(
        host: impl Into<String>,
        tier: Tier,
        tier_level: u32,
        service_version: impl Into<String>,
        shard_size: u64,
    ) -> Self {
        Self {
            host: host.into(),
            tier,
            tier_level,
            service_version: service_version.into(),
            tail_block: 0,
            head_block: 0,
            head_block_id: String::new(),
            irr_block: 0,
            irr_block_id: String::new(),
            shard_size,
            ready: false,
            moving_tail: false,
            moving_head: false,
            published_at_ms: 0,
        }
    }

    pub fn irr_ref(&self) -> BlockRef {
        BlockRef::new(self.irr_block, self.irr_block_id.clone())
    }

    /// Records older than two publish intervals count as unavailable.
    pub fn is_stale(&self, now: SystemTime, publish_duration: Duration) -> bool {
        let now_ms = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        now_ms.saturating_sub(self.published_at_ms) >= 2 * publish_duration.as_millis() as u64
    }

    /// Whether this peer serves `[low, high]` in full.
    ///
    /// Archive peers serve `[tail, irr]`; live peers serve
    /// `[irr - head_delay_tolerance, head]`.
    pub fn serves_range(&self, low: u64, high: u64, head_delay_tolerance: u64) -> bool {
        let (serve_low, serve_high) = match self.tier {
            Tier::Archive => (self.tail_block, self.irr_block),
            Tier::Live => (
                self.irr_block.saturating_sub(head_delay_tolerance),
                self.head_block,
            ),
            Tier::ForkResolver | Tier::Router => return false,
        };
        low >= serve_low && high <= serve_high
    }

    /// Width of the serveable range; routers prefer the narrowest
    /// qualifying peer (locality).
    pub fn range_width(&self) -> u64 {
        match self.tier {
            Tier::Archive => self.irr_block.saturating_sub(self.tail_block),
            Tier::Live => self.head_block.saturating_sub(self.irr_block),
            Tier::ForkResolver | Tier::Router => 0,
        }
    }
}

/// Highest irreversible block published by any archive peer.
pub fn highest_archive_irr(peers: &[SearchPeer]) -> u64 {
    peers
        .iter()
        .filter(|p| p.tier.is_archive())
        .map(|p| p.irr_block)
        .max()
        .unwrap_or(0)
}

/// LIB reference published by ready archive peers at `tier_level`, if any.
pub fn mesh_lib(peers: &[SearchPeer], tier_level: u32) -> Option<BlockRef> {
    peers
        .iter()
        .filter(|p| p.tier.is_archive() && p.ready && p.tier_level == tier_level)
        .max_by_key(|p| p.irr_block)
        .map(|p| p.irr_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive_peer(host: &str, tail: u64, irr: u64, ready: bool) -> SearchPeer {
        let mut p = SearchPeer::new(host, Tier::Archive, 0, "v1", 5000);
        p.tail_block = tail;
        p.irr_block = irr;
        p.irr_block_id = format!("id{irr}");
        p.ready = ready;
        p
    }

    #[test]
    fn archive_serves_tail_to_irr() {
        let p = archive_peer("a:9000", 1000, 50_000, true);
        assert!(p.serves_range(1000, 50_000, 0));
        assert!(p.serves_range(2000, 30_000, 0));
        assert!(!p.serves_range(500, 30_000, 0));
        assert!(!p.serves_range(2000, 50_001, 0));
    }

    #[test]
    fn live_serves_near_head_with_tolerance() {
        let mut p = SearchPeer::new("l:9000", Tier::Live, 0, "v1", 5000);
        p.irr_block = 100;
        p.head_block = 120;
        assert!(p.serves_range(100, 120, 0));
        assert!(p.serves_range(95, 120, 10));
        assert!(!p.serves_range(95, 120, 0));
    }

    #[test]
    fn staleness_is_two_publish_intervals() {
        let mut p = archive_peer("a:9000", 0, 10, true);
        let now = SystemTime::now();
        let now_ms = now
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let publish = Duration::from_secs(5);

        p.published_at_ms = now_ms;
        assert!(!p.is_stale(now, publish));

        p.published_at_ms = now_ms - 9_999;
        assert!(!p.is_stale(now, publish));

        p.published_at_ms = now_ms - 10_000;
        assert!(p.is_stale(now, publish));
    }

    #[test]
    fn mesh_lib_picks_highest_ready_archive() {
        let peers = vec![
            archive_peer("a", 0, 100, true),
            archive_peer("b", 0, 250, true),
            archive_peer("c", 0, 400, false),
        ];
        assert_eq!(mesh_lib(&peers, 0).unwrap().num, 250);
        assert_eq!(highest_archive_irr(&peers), 400);
        assert!(mesh_lib(&peers, 1).is_none());
    }
}
