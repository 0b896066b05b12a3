//! Peer selection and leg planning.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use chainsift_core::{SearchError, SearchResult};
use chainsift_mesh::{SearchPeer, Tier};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Blocks above a live backend's irr pointer a query may still reach.
    pub head_delay_tolerance: u64,
    /// Publish interval of the mesh; twice this is the staleness cutoff.
    pub publish_duration: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            head_delay_tolerance: 12,
            publish_duration: Duration::from_secs(5),
        }
    }
}

/// One backend fan-out of the plan, bounds inclusive.
#[derive(Debug, Clone)]
pub struct Leg {
    pub peer: SearchPeer,
    pub low: u64,
    pub high: u64,
}

/// Peers usable for planning: ready and recently published.
pub fn usable_peers(peers: &[SearchPeer], config: &RouterConfig) -> Vec<SearchPeer> {
    let now = SystemTime::now();
    peers
        .iter()
        .filter(|p| p.ready && !p.is_stale(now, config.publish_duration))
        .cloned()
        .collect()
}

/// Pick the archive peer to serve a leg starting at `low`.
///
/// Among peers whose `[tail, irr]` contains `low`, prefer one covering the
/// whole `[low, high]` with the narrowest range (locality); otherwise take
/// the one reaching furthest.
fn pick_archive(
    peers: &[SearchPeer],
    low: u64,
    high: u64,
    exclude: &HashSet<String>,
) -> Option<SearchPeer> {
    let candidates: Vec<&SearchPeer> = peers
        .iter()
        .filter(|p| {
            p.tier == Tier::Archive
                && !exclude.contains(&p.host)
                && p.tail_block <= low
                && p.irr_block >= low
        })
        .collect();

    let full: Option<&&SearchPeer> = candidates
        .iter()
        .filter(|p| p.irr_block >= high)
        .min_by_key(|p| p.range_width());
    match full {
        Some(peer) => Some((*peer).clone()),
        None => candidates
            .into_iter()
            .max_by_key(|p| p.irr_block)
            .cloned(),
    }
}

fn pick_live(
    peers: &[SearchPeer],
    low: u64,
    high: u64,
    head_delay_tolerance: u64,
) -> Option<SearchPeer> {
    peers
        .iter()
        .filter(|p| p.tier == Tier::Live && p.serves_range(low, high, head_delay_tolerance))
        .min_by_key(|p| p.range_width())
        .cloned()
}

/// Ready fork-resolver peer, if any.
pub fn pick_fork_resolver(peers: &[SearchPeer]) -> Option<SearchPeer> {
    peers.iter().find(|p| p.tier == Tier::ForkResolver).cloned()
}

/// Replacement archive peer for a retried leg.
pub fn pick_retry_peer(
    peers: &[SearchPeer],
    low: u64,
    high: u64,
    exclude: &HashSet<String>,
) -> Option<SearchPeer> {
    pick_archive(peers, low, high, exclude)
}

/// Plan the archive (and optional live) legs covering `[low, high]`
/// ascending. Callers reverse the legs for descending execution.
pub fn plan_legs(
    peers: &[SearchPeer],
    low: u64,
    high: u64,
    with_reversible: bool,
    config: &RouterConfig,
    exclude: &HashSet<String>,
) -> SearchResult<Vec<Leg>> {
    let mut legs = Vec::new();
    let archive_irr = peers
        .iter()
        .filter(|p| p.tier == Tier::Archive)
        .map(|p| p.irr_block)
        .max()
        .unwrap_or(0);
    let archive_high = high.min(archive_irr);

    let mut pos = low;
    while pos <= archive_high {
        let Some(peer) = pick_archive(peers, pos, archive_high, exclude) else {
            break;
        };
        let leg_high = archive_high.min(peer.irr_block);
        legs.push(Leg {
            peer,
            low: pos,
            high: leg_high,
        });
        pos = leg_high + 1;
    }

    if pos <= high {
        if with_reversible {
            if let Some(peer) = pick_live(peers, pos, high, config.head_delay_tolerance) {
                legs.push(Leg {
                    peer,
                    low: pos,
                    high,
                });
                pos = high + 1;
            }
        } else if pos > archive_high && !legs.is_empty() {
            // Irreversible-only queries are satisfied once the archive
            // coverage ends; the remainder simply has no data yet.
            pos = high + 1;
        }
    }

    if legs.is_empty() || pos <= high {
        return Err(SearchError::unavailable(format!(
            "no peer covers the requested range [{low}, {high}]"
        )));
    }
    Ok(legs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(host: &str, tail: u64, irr: u64) -> SearchPeer {
        let mut p = SearchPeer::new(host, Tier::Archive, 0, "v1", 5000);
        p.tail_block = tail;
        p.irr_block = irr;
        p.ready = true;
        p
    }

    fn live(host: &str, irr: u64, head: u64) -> SearchPeer {
        let mut p = SearchPeer::new(host, Tier::Live, 0, "v1", 5000);
        p.irr_block = irr;
        p.head_block = head;
        p.ready = true;
        p
    }

    #[test]
    fn single_archive_leg() {
        let peers = vec![archive("a", 0, 1000)];
        let legs = plan_legs(
            &peers,
            0,
            800,
            false,
            &RouterConfig::default(),
            &HashSet::new(),
        )
        .unwrap();
        assert_eq!(legs.len(), 1);
        assert_eq!((legs[0].low, legs[0].high), (0, 800));
    }

    #[test]
    fn chained_archive_legs() {
        let peers = vec![archive("cold", 0, 1000), archive("warm", 800, 2000)];
        let legs = plan_legs(
            &peers,
            500,
            1800,
            false,
            &RouterConfig::default(),
            &HashSet::new(),
        )
        .unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].peer.host, "cold");
        assert_eq!((legs[0].low, legs[0].high), (500, 1000));
        assert_eq!(legs[1].peer.host, "warm");
        assert_eq!((legs[1].low, legs[1].high), (1001, 1800));
    }

    #[test]
    fn narrower_peer_wins_on_full_coverage() {
        let peers = vec![archive("wide", 0, 10_000), archive("narrow", 400, 1500)];
        let legs = plan_legs(
            &peers,
            500,
            1000,
            false,
            &RouterConfig::default(),
            &HashSet::new(),
        )
        .unwrap();
        assert_eq!(legs[0].peer.host, "narrow");
    }

    #[test]
    fn live_leg_extends_past_archive() {
        let peers = vec![archive("a", 0, 1000), live("l", 1000, 1020)];
        let legs = plan_legs(
            &peers,
            900,
            1015,
            true,
            &RouterConfig::default(),
            &HashSet::new(),
        )
        .unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!((legs[0].low, legs[0].high), (900, 1000));
        assert_eq!(legs[1].peer.tier, Tier::Live);
        assert_eq!((legs[1].low, legs[1].high), (1001, 1015));
    }

    #[test]
    fn uncovered_range_is_unavailable() {
        let peers = vec![archive("a", 0, 1000)];
        let err = plan_legs(
            &peers,
            2_000_000,
            2_000_100,
            false,
            &RouterConfig::default(),
            &HashSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SearchError::Unavailable(_)));
    }

    #[test]
    fn excluded_peer_is_skipped() {
        let peers = vec![archive("a", 0, 1000), archive("b", 0, 1000)];
        let mut exclude = HashSet::new();
        exclude.insert("a".to_string());
        let legs = plan_legs(
            &peers,
            0,
            1000,
            false,
            &RouterConfig::default(),
            &exclude,
        )
        .unwrap();
        assert_eq!(legs[0].peer.host, "b");
    }

    #[test]
    fn irreversible_query_past_archive_coverage_is_truncated() {
        let peers = vec![archive("a", 0, 1000)];
        let legs = plan_legs(
            &peers,
            0,
            5000,
            false,
            &RouterConfig::default(),
            &HashSet::new(),
        )
        .unwrap();
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].high, 1000);
    }
}
