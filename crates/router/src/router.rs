//! Fan-out execution.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chainsift_core::{BlockRef, Cursor, ParsedQuery, SearchError};
use chainsift_grpc::{
    is_retryable_status, search_error_to_status, BackendRequest, BackendStream,
    ForkResolveRequest, BlockRefMsg, MatchStream, RouterRequest, RouterService, SearchMatchMsg,
};
use chainsift_mesh::{MeshClient, SearchPeer, Tier};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use crate::blockmeta::BlockMeta;
use crate::dialer::BackendDialer;
use crate::plan::{pick_fork_resolver, pick_retry_peer, plan_legs, usable_peers, Leg, RouterConfig};

pub struct Router {
    mesh: Arc<dyn MeshClient>,
    dialer: Arc<dyn BackendDialer>,
    block_meta: Arc<dyn BlockMeta>,
    config: RouterConfig,
}

/// Everything the background driver needs, resolved up front so planning
/// errors surface on the call instead of mid-stream.
struct Drive {
    legs: Vec<Leg>,
    undo: Option<MatchStream>,
    skip_through: Option<(u64, String)>,
    query: String,
    descending: bool,
    with_reversible: bool,
    live_marker_interval: u64,
    enable_retry: bool,
}

impl Router {
    pub fn new(
        mesh: Arc<dyn MeshClient>,
        dialer: Arc<dyn BackendDialer>,
        block_meta: Arc<dyn BlockMeta>,
        config: RouterConfig,
    ) -> Self {
        Self {
            mesh,
            dialer,
            block_meta,
            config,
        }
    }

    async fn prepare(&self, req: &RouterRequest) -> Result<Drive, Status> {
        ParsedQuery::parse(&req.query).map_err(search_error_to_status)?;
        if req.descending && req.with_reversible {
            return Err(Status::invalid_argument(
                "descending queries cannot include the reversible head",
            ));
        }

        let peers = usable_peers(&self.mesh.peers(), &self.config);

        let mut low = req.low_block_num;
        let mut descending_resume = None;
        let mut undo = None;
        let mut skip_through = None;

        if !req.cursor.is_empty() {
            let cursor = Cursor::decode(&req.cursor).map_err(search_error_to_status)?;
            let canonical = self
                .block_meta
                .is_canonical(cursor.block_num, &cursor.block_id)
                .await
                .map_err(search_error_to_status)?;

            if canonical {
                if req.descending {
                    descending_resume = Some(cursor.block_num);
                } else {
                    low = low.max(cursor.block_num);
                }
                skip_through = Some((cursor.block_num, cursor.trx_id_prefix.clone()));
            } else {
                let refs = self
                    .block_meta
                    .forked_refs_back_to_canonical(&BlockRef::new(
                        cursor.block_num,
                        cursor.block_id.clone(),
                    ))
                    .await
                    .map_err(search_error_to_status)?;
                if refs.is_empty() {
                    // Outside the fork window: nothing to unwind, resume
                    // at the cursor height on the canonical chain.
                    low = low.max(cursor.block_num);
                } else {
                    let fork_peer = pick_fork_resolver(&peers).ok_or_else(|| {
                        Status::unavailable("cursor is forked and no fork resolver is available")
                    })?;
                    let resolver = self
                        .dialer
                        .dial_fork_resolver(&fork_peer)
                        .await
                        .map_err(search_error_to_status)?;
                    let fork_low = refs.iter().map(|r| r.num).min().unwrap_or(cursor.block_num);
                    undo = Some(
                        resolver
                            .stream_undo_matches(ForkResolveRequest {
                                query: req.query.clone(),
                                forked_block_refs: refs
                                    .into_iter()
                                    .map(|r| BlockRefMsg {
                                        block_num: r.num,
                                        block_id: r.id,
                                    })
                                    .collect(),
                            })
                            .await?,
                    );
                    low = low.max(fork_low);
                }
            }
        }

        let archive_irr = peers
            .iter()
            .filter(|p| p.tier == Tier::Archive)
            .map(|p| p.irr_block)
            .max()
            .unwrap_or(0);
        let virtual_head = peers
            .iter()
            .map(|p| p.head_block.max(p.irr_block))
            .max()
            .unwrap_or(0);

        let mut high = if req.high_block_num != 0 {
            req.high_block_num
        } else if req.with_reversible {
            virtual_head
        } else {
            archive_irr
        };
        if req.stop_at_virtual_head {
            high = high.min(virtual_head);
        }
        if let Some(resume) = descending_resume {
            high = high.min(resume);
        }
        if low > high {
            return Err(Status::out_of_range(format!(
                "requested range [{low}, {high}] is empty"
            )));
        }

        let mut legs = plan_legs(
            &peers,
            low,
            high,
            req.with_reversible,
            &self.config,
            &HashSet::new(),
        )
        .map_err(search_error_to_status)?;
        if req.descending {
            legs.reverse();
        }

        Ok(Drive {
            legs,
            undo,
            skip_through,
            query: req.query.clone(),
            descending: req.descending,
            with_reversible: req.with_reversible,
            live_marker_interval: req.live_marker_interval,
            enable_retry: req.enable_retry,
        })
    }
}

#[async_trait]
impl RouterService for Router {
    async fn stream_matches(&self, req: RouterRequest) -> Result<MatchStream, Status> {
        let drive = self.prepare(&req).await?;
        tracing::info!(
            query = %req.query,
            legs = drive.legs.len(),
            descending = drive.descending,
            unwinding = drive.undo.is_some(),
            "router plan ready"
        );

        let (tx, rx) = mpsc::channel::<Result<SearchMatchMsg, Status>>(64);
        let mesh = Arc::clone(&self.mesh);
        let dialer = Arc::clone(&self.dialer);
        let config = self.config.clone();
        tokio::spawn(async move {
            run_drive(drive, mesh, dialer, config, tx).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

async fn run_drive(
    mut drive: Drive,
    mesh: Arc<dyn MeshClient>,
    dialer: Arc<dyn BackendDialer>,
    config: RouterConfig,
    tx: mpsc::Sender<Result<SearchMatchMsg, Status>>,
) {
    // Undo portion first: the client unwinds before it replays.
    if let Some(mut undo) = drive.undo.take() {
        while let Some(item) = undo.next().await {
            if tx.send(item).await.is_err() {
                return;
            }
        }
    }

    for leg in &drive.legs {
        if !run_leg(&drive, leg, &mesh, &dialer, &config, &tx).await {
            return;
        }
    }
}

/// Execute one leg, retrying once on another archive peer when allowed.
/// Returns false when the stream is over (error sent or client gone).
async fn run_leg(
    drive: &Drive,
    leg: &Leg,
    mesh: &Arc<dyn MeshClient>,
    dialer: &Arc<dyn BackendDialer>,
    config: &RouterConfig,
    tx: &mpsc::Sender<Result<SearchMatchMsg, Status>>,
) -> bool {
    let mut peer = leg.peer.clone();
    let mut low = leg.low;
    let mut high = leg.high;
    let mut skip = drive.skip_through.clone();
    let mut retried = false;

    loop {
        let request = BackendRequest {
            query: drive.query.clone(),
            low_block_num: low,
            high_block_num: high,
            descending: drive.descending,
            with_reversible: peer.tier == Tier::Live && drive.with_reversible,
            live_marker_interval: if peer.tier == Tier::Live {
                drive.live_marker_interval
            } else {
                0
            },
            ..Default::default()
        };

        let failure = match open_and_forward(dialer, &peer, request, &mut skip, tx).await {
            Forward::Complete => return true,
            Forward::ClientGone => return false,
            Forward::Failed { status, resume } => {
                // Retries against the live tier would replay non-idempotent
                // ordering; they are forbidden outright.
                let may_retry = drive.enable_retry
                    && !retried
                    && peer.tier.is_archive()
                    && is_retryable_status(&status);
                if !may_retry {
                    let _ = tx.send(Err(status)).await;
                    return false;
                }
                (status, resume)
            }
        };

        let (status, resume) = failure;
        if drive.descending {
            if let Some(read) = resume {
                high = read.saturating_sub(1);
            }
        } else if let Some(read) = resume {
            low = read + 1;
        }
        if low > high {
            return true;
        }

        let mut exclude = HashSet::new();
        exclude.insert(peer.host.clone());
        let peers = usable_peers(&mesh.peers(), config);
        let Some(replacement) = pick_retry_peer(
            &peers,
            if drive.descending { high } else { low },
            high,
            &exclude,
        ) else {
            let _ = tx.send(Err(status)).await;
            return false;
        };
        tracing::info!(
            failed = %peer.host,
            replacement = %replacement.host,
            low,
            high,
            "retrying leg on another archive peer"
        );
        peer = replacement;
        retried = true;
    }
}

enum Forward {
    Complete,
    ClientGone,
    Failed {
        status: Status,
        /// `last-block-read` from the failed backend, if it got anywhere.
        resume: Option<u64>,
    },
}

async fn open_and_forward(
    dialer: &Arc<dyn BackendDialer>,
    peer: &SearchPeer,
    request: BackendRequest,
    skip: &mut Option<(u64, String)>,
    tx: &mpsc::Sender<Result<SearchMatchMsg, Status>>,
) -> Forward {
    let backend = match dialer.dial_backend(peer).await {
        Ok(backend) => backend,
        Err(err) => {
            return Forward::Failed {
                status: search_error_to_status(err),
                resume: None,
            };
        }
    };

    let BackendStream {
        mut matches,
        last_block_read,
    } = match backend.stream_matches(request).await {
        Ok(stream) => stream,
        Err(status) => {
            return Forward::Failed {
                status,
                resume: None,
            };
        }
    };

    while let Some(item) = matches.next().await {
        match item {
            Ok(msg) => {
                if let Some((skip_block, skip_prefix)) = skip {
                    if !msg.live_marker && msg.block_num == *skip_block {
                        let past = msg.trx_id_prefix == *skip_prefix;
                        if past {
                            *skip = None;
                        }
                        continue;
                    }
                    if !msg.live_marker && msg.block_num > *skip_block {
                        *skip = None;
                    }
                }
                if tx.send(Ok(msg)).await.is_err() {
                    return Forward::ClientGone;
                }
            }
            Err(status) => {
                let read = last_block_read.get();
                return Forward::Failed {
                    status,
                    resume: (read >= 0).then_some(read as u64),
                };
            }
        }
    }
    Forward::Complete
}
