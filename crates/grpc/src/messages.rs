//! Wire messages.

use chainsift_core::SearchMatch;

/// Request against a single backend (archive or live).
///
/// Archive backends accept only `query`, `low_block_num`, `high_block_num`
/// and `descending`; every other field must be zero-valued there.
#[derive(Debug, Clone, Default)]
pub struct BackendRequest {
    pub query: String,
    pub low_block_num: u64,
    pub high_block_num: u64,
    pub descending: bool,
    pub with_reversible: bool,
    pub stop_at_virtual_head: bool,
    /// Seconds between keep-alive markers; zero disables them.
    pub live_marker_interval: u64,
    pub navigate_from_block_id: String,
    pub navigate_from_block_num: u64,
}

/// Request against the router — the client-facing superset.
#[derive(Debug, Clone, Default)]
pub struct RouterRequest {
    pub query: String,
    pub low_block_num: u64,
    pub high_block_num: u64,
    pub descending: bool,
    pub with_reversible: bool,
    pub stop_at_virtual_head: bool,
    pub live_marker_interval: u64,
    /// Opaque resumption token from a previous stream.
    pub cursor: String,
    /// Retry once against another qualifying archive peer on failure.
    pub enable_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRefMsg {
    pub block_num: u64,
    pub block_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ForkResolveRequest {
    pub query: String,
    pub forked_block_refs: Vec<BlockRefMsg>,
}

/// One streamed result.
///
/// `live_marker` messages carry no match payload; they only tell the client
/// the stream is alive while a live backend has nothing to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchMatchMsg {
    pub trx_id_prefix: String,
    pub block_num: u64,
    pub block_id: String,
    pub trx_index: u32,
    /// Encoded resumption cursor positioned at this match.
    pub cursor: String,
    pub irr_block_num: u64,
    pub undo: bool,
    pub live_marker: bool,
}

impl SearchMatchMsg {
    pub fn live_marker(head_block_num: u64) -> Self {
        Self {
            block_num: head_block_num,
            live_marker: true,
            ..Self::default()
        }
    }

    pub fn from_match(m: &SearchMatch, cursor: String) -> Self {
        Self {
            trx_id_prefix: m.trx_id_prefix.clone(),
            block_num: m.block_num,
            block_id: m.block_id.clone(),
            trx_index: m.trx_index,
            cursor,
            irr_block_num: m.irr_block_num,
            undo: m.undo,
            live_marker: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadInfo {
    pub lib_num: u64,
    pub lib_id: String,
}
