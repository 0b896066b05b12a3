//! The reversible tail state machine.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chainsift_bstream::ForkStep;
use chainsift_core::{Cursor, ParsedQuery, SearchMatch, SearchResult};
use chainsift_grpc::{
    search_error_to_status, BackendRequest, BackendService, BackendStream, HealthCheck,
    HealthStatus, LastBlockRead, SearchMatchMsg,
};
use chainsift_index::{PreIndexer, SingleIndex};
use chainsift_mesh::{MeshClient, PeerHandle};
use tokio::sync::{broadcast, mpsc, watch};
use tonic::Status;

/// Dispatcher lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    Initializing,
    Joining,
    Realtime,
    CatchingUp,
    Terminating,
}

/// Published to subscribers whenever a block leaves the canonical chain.
/// `seq` is monotone so clients can order undo events against matches.
#[derive(Debug, Clone)]
pub struct UndoEvent {
    pub seq: u64,
    pub block_num: u64,
    pub block_id: String,
}

#[derive(Debug, Clone)]
pub struct LiveTailConfig {
    /// Archive peers that must cover a block before it leaves the ring.
    pub truncation_threshold: usize,
    /// Longest head drift that still counts as real-time.
    pub realtime_tolerance: Duration,
    /// Retired blocks kept for resuming clients.
    pub undo_log_capacity: usize,
}

impl Default for LiveTailConfig {
    fn default() -> Self {
        Self {
            truncation_threshold: 1,
            realtime_tolerance: Duration::from_secs(15),
            undo_log_capacity: 1024,
        }
    }
}

struct RetiredBlock {
    seq: u64,
    index: Arc<SingleIndex>,
}

struct TailInner {
    state: TailState,
    /// The ring: every reversible block currently indexed, by id.
    indexes: HashMap<String, Arc<SingleIndex>>,
    /// Block number → ids seen at that number (several during a fork).
    num_to_ids: BTreeMap<u64, Vec<String>>,
    /// Ids currently on the canonical chain.
    canonical: HashSet<String>,
    lib_num: u64,
    lib_id: String,
    head_num: u64,
    head_id: String,
    last_block_timestamp: i64,
    undo_log: VecDeque<RetiredBlock>,
    next_seq: u64,
}

/// Fork-aware in-memory tail over the reversible chain segment.
pub struct LiveTail {
    preindexer: PreIndexer,
    config: LiveTailConfig,
    peer: Arc<PeerHandle>,
    mesh: Arc<dyn MeshClient>,
    undo_events: broadcast::Sender<UndoEvent>,
    inner: RwLock<TailInner>,
}

impl LiveTail {
    pub fn new(
        preindexer: PreIndexer,
        config: LiveTailConfig,
        peer: Arc<PeerHandle>,
        mesh: Arc<dyn MeshClient>,
    ) -> Arc<Self> {
        let (undo_events, _) = broadcast::channel(256);
        Arc::new(Self {
            preindexer,
            config,
            peer,
            mesh,
            undo_events,
            inner: RwLock::new(TailInner {
                state: TailState::Initializing,
                indexes: HashMap::new(),
                num_to_ids: BTreeMap::new(),
                canonical: HashSet::new(),
                lib_num: 0,
                lib_id: String::new(),
                head_num: 0,
                head_id: String::new(),
                last_block_timestamp: 0,
                undo_log: VecDeque::new(),
                next_seq: 0,
            }),
        })
    }

    pub fn subscribe_undo(&self) -> broadcast::Receiver<UndoEvent> {
        self.undo_events.subscribe()
    }

    pub fn state(&self) -> TailState {
        self.inner.read().expect("tail lock poisoned").state
    }

    /// Ready once the tail is real-time and the head has moved past the
    /// LIB.
    pub fn is_ready(&self) -> bool {
        let inner = self.inner.read().expect("tail lock poisoned");
        inner.state == TailState::Realtime && inner.head_num > inner.lib_num
    }

    /// Single-threaded dispatcher over the pipeline's step fan-out.
    /// Backpressure flows the other way: a full ring slows the sender.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ForkStep>,
        mut shutdown: watch::Receiver<bool>,
    ) -> SearchResult<()> {
        self.set_state(TailState::Joining);
        loop {
            let step = tokio::select! {
                step = events.recv() => step,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.set_state(TailState::Terminating);
                        return Ok(());
                    }
                    continue;
                }
            };
            let Some(step) = step else {
                tracing::info!("step fan-out closed, live tail terminating");
                self.set_state(TailState::Terminating);
                return Ok(());
            };
            if let Err(err) = self.apply_step(step) {
                self.set_state(TailState::Terminating);
                return Err(err);
            }
            self.truncate_covered();
            self.publish_pointers().await;
        }
    }

    fn set_state(&self, state: TailState) {
        let mut inner = self.inner.write().expect("tail lock poisoned");
        if inner.state != state {
            tracing::info!(from = ?inner.state, to = ?state, "live tail state change");
            inner.state = state;
        }
    }

    /// Apply one fork step. Public so drivers and tests can feed the tail
    /// directly.
    pub fn apply_step(&self, step: ForkStep) -> SearchResult<()> {
        match step {
            ForkStep::New(block) => {
                let index = Arc::new(self.preindexer.preindex(&block)?);
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64;

                let mut inner = self.inner.write().expect("tail lock poisoned");
                inner.indexes.insert(block.id.clone(), index);
                inner
                    .num_to_ids
                    .entry(block.num)
                    .or_default()
                    .push(block.id.clone());
                inner.canonical.insert(block.id.clone());
                inner.head_num = block.num;
                inner.head_id = block.id.clone();
                inner.last_block_timestamp = block.timestamp;

                let drift = now.saturating_sub(block.timestamp);
                let caught_up = drift <= self.config.realtime_tolerance.as_secs() as i64;
                if inner.state != TailState::Terminating {
                    inner.state = if caught_up {
                        TailState::Realtime
                    } else {
                        TailState::CatchingUp
                    };
                }
            }
            ForkStep::Undo(block) => {
                let mut inner = self.inner.write().expect("tail lock poisoned");
                inner.canonical.remove(&block.id);
                let Some(index) = inner.indexes.remove(&block.id) else {
                    tracing::warn!(num = block.num, id = %block.id, "undo for unknown block");
                    return Ok(());
                };
                if let Some(ids) = inner.num_to_ids.get_mut(&block.num) {
                    ids.retain(|id| *id != block.id);
                    if ids.is_empty() {
                        inner.num_to_ids.remove(&block.num);
                    }
                }

                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.undo_log.push_back(RetiredBlock { seq, index });
                if inner.undo_log.len() > self.config.undo_log_capacity {
                    inner.undo_log.pop_front();
                }
                drop(inner);

                tracing::info!(num = block.num, id = %block.id, seq, "block undone");
                let _ = self.undo_events.send(UndoEvent {
                    seq,
                    block_num: block.num,
                    block_id: block.id.clone(),
                });
            }
            ForkStep::Irreversible(block) => {
                let mut inner = self.inner.write().expect("tail lock poisoned");
                if block.num > inner.lib_num {
                    inner.lib_num = block.num;
                    inner.lib_id = block.id.clone();
                }
            }
        }
        Ok(())
    }

    /// Retire ring blocks below the LIB once enough archive peers publish
    /// coverage. Never truncates past what the archive serves, so routers
    /// see no gap between tiers.
    fn truncate_covered(&self) {
        let peers = self.mesh.peers();
        let mut inner = self.inner.write().expect("tail lock poisoned");
        loop {
            let Some((&num, _)) = inner.num_to_ids.first_key_value() else {
                break;
            };
            if num > inner.lib_num {
                break;
            }
            let covering = peers
                .iter()
                .filter(|p| p.tier.is_archive() && p.ready && p.irr_block >= num)
                .count();
            if covering < self.config.truncation_threshold {
                break;
            }
            let ids = inner.num_to_ids.remove(&num).unwrap_or_default();
            for id in ids {
                inner.indexes.remove(&id);
                inner.canonical.remove(&id);
            }
            tracing::debug!(num, covering, "ring block truncated");
        }
    }

    async fn publish_pointers(&self) {
        let (tail, head, head_id, irr, irr_id, ready) = {
            let inner = self.inner.read().expect("tail lock poisoned");
            (
                inner.num_to_ids.keys().next().copied().unwrap_or(0),
                inner.head_num,
                inner.head_id.clone(),
                inner.lib_num,
                inner.lib_id.clone(),
                inner.state == TailState::Realtime && inner.head_num > inner.lib_num,
            )
        };
        let snapshot = self.peer.snapshot();
        if snapshot.head_block == head && snapshot.irr_block == irr && snapshot.ready == ready {
            return;
        }
        if let Err(err) = self
            .peer
            .locked(|p| {
                p.tail_block = tail;
                p.head_block = head;
                p.head_block_id = head_id;
                p.irr_block = irr;
                p.irr_block_id = irr_id;
                p.ready = ready;
            })
            .await
        {
            tracing::warn!(%err, "live peer publish failed");
        }
    }

    /// Ascending scan of the canonical ring.
    fn query_ring(&self, low: u64, high: u64, query: &ParsedQuery) -> (Vec<SearchMatch>, u64) {
        let inner = self.inner.read().expect("tail lock poisoned");
        let mut out = Vec::new();
        let mut last_read = 0u64;
        for (&num, ids) in inner.num_to_ids.range(low..=high) {
            for id in ids {
                if !inner.canonical.contains(id) {
                    continue;
                }
                let Some(index) = inner.indexes.get(id) else {
                    continue;
                };
                let mut matches = index.run_query(query);
                for m in &mut matches {
                    m.irr_block_num = inner.lib_num;
                }
                out.extend(matches);
            }
            last_read = num;
        }
        (out, last_read)
    }

    /// Undo matches for blocks retracted at or above `from_block`, newest
    /// first, each block's matches in reverse transaction order.
    fn query_undo_log(&self, from_block: u64, query: &ParsedQuery) -> Vec<SearchMatch> {
        let inner = self.inner.read().expect("tail lock poisoned");
        let mut out = Vec::new();
        for retired in inner.undo_log.iter().rev() {
            if retired.index.block_num() < from_block {
                continue;
            }
            let mut matches = retired.index.run_query(query);
            matches.reverse();
            for mut m in matches {
                m.undo = true;
                m.irr_block_num = inner.lib_num;
                out.push(m);
            }
        }
        out
    }

    fn is_canonical(&self, block_id: &str) -> bool {
        self.inner
            .read()
            .expect("tail lock poisoned")
            .canonical
            .contains(block_id)
    }
}

fn to_msg(m: &SearchMatch) -> Result<SearchMatchMsg, Status> {
    let cursor = Cursor::new(m.block_num, &m.block_id, &m.trx_id_prefix)
        .encode()
        .map_err(search_error_to_status)?;
    Ok(SearchMatchMsg::from_match(m, cursor))
}

#[async_trait]
impl BackendService for LiveTail {
    async fn stream_matches(&self, req: BackendRequest) -> Result<BackendStream, Status> {
        if req.descending {
            return Err(Status::invalid_argument(
                "live backend serves ascending queries only",
            ));
        }
        let query = ParsedQuery::parse(&req.query).map_err(search_error_to_status)?;

        let (head, lib) = {
            let inner = self.inner.read().expect("tail lock poisoned");
            (inner.head_num, inner.lib_num)
        };
        let high = match (req.high_block_num, req.with_reversible) {
            (0, true) => head,
            (0, false) => lib,
            (explicit, true) => explicit.min(head),
            (explicit, false) => explicit.min(lib),
        };

        let mut out: Vec<SearchMatchMsg> = Vec::new();

        // A resuming client whose block got forked out first unwinds.
        if !req.navigate_from_block_id.is_empty()
            && !self.is_canonical(&req.navigate_from_block_id)
        {
            for m in self.query_undo_log(req.navigate_from_block_num, &query) {
                out.push(to_msg(&m)?);
            }
        }

        let (matches, last_read) = self.query_ring(req.low_block_num, high, &query);
        for m in &matches {
            out.push(to_msg(m)?);
        }

        if req.live_marker_interval != 0 {
            out.push(SearchMatchMsg::live_marker(head));
        }

        let last_block_read = LastBlockRead::new();
        if last_read > 0 {
            last_block_read.set(last_read);
        }

        tracing::debug!(
            query = %req.query,
            low = req.low_block_num,
            high,
            results = out.len(),
            "live tail query served"
        );
        Ok(BackendStream {
            matches: Box::pin(futures::stream::iter(out.into_iter().map(Ok::<_, Status>))),
            last_block_read,
        })
    }
}

#[async_trait]
impl HealthCheck for LiveTail {
    async fn check(&self) -> HealthStatus {
        if self.is_ready() {
            HealthStatus::Serving
        } else {
            HealthStatus::NotServing
        }
    }
}
