//! Fork-aware step reducer.
//!
//! The reducer keeps the reversible segment of the chain (every block above
//! the last irreversible block) as an explicit id-keyed DAG and emits
//! tagged steps as blocks arrive:
//!
//! - `New` — the block extends the canonical head (or is part of a redo
//!   path after a reorg);
//! - `Undo` — a previously-`New` block left the canonical chain, delivered
//!   head-first so consumers can unwind in reverse;
//! - `Irreversible` — the block sank below the advancing LIB, delivered in
//!   ascending order exactly once.
//!
//! The reducer is deterministic and single-threaded; consumers that only
//! care about a subset of steps attach a [`StepFilter`].

use std::collections::HashMap;
use std::sync::Arc;

use chainsift_core::{Block, BlockRef, SearchError, SearchResult};

/// A tagged event over the block stream.
#[derive(Debug, Clone)]
pub enum ForkStep {
    New(Arc<Block>),
    Undo(Arc<Block>),
    Irreversible(Arc<Block>),
}

impl ForkStep {
    pub fn block(&self) -> &Arc<Block> {
        match self {
            ForkStep::New(b) | ForkStep::Undo(b) | ForkStep::Irreversible(b) => b,
        }
    }
}

/// Which step kinds a consumer receives. State transitions inside the
/// reducer are unaffected by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepFilter {
    pub new: bool,
    pub undo: bool,
    pub irreversible: bool,
}

impl StepFilter {
    /// Batch indexing: irreversible steps only.
    pub const IRREVERSIBLE_ONLY: Self = Self {
        new: false,
        undo: false,
        irreversible: true,
    };

    /// Live indexing: reversible head plus irreversible archival steps.
    pub const ALL: Self = Self {
        new: true,
        undo: true,
        irreversible: true,
    };

    fn keeps(&self, step: &ForkStep) -> bool {
        match step {
            ForkStep::New(_) => self.new,
            ForkStep::Undo(_) => self.undo,
            ForkStep::Irreversible(_) => self.irreversible,
        }
    }
}

/// Deterministic fork reducer over incoming blocks.
pub struct Forkable {
    /// Reversible blocks, keyed by id.
    blocks: HashMap<String, Arc<Block>>,
    /// Current canonical head id, once the first block is seen.
    head: Option<String>,
    /// Exclusive LIB: steps are only ever emitted for blocks above it.
    lib: BlockRef,
    filter: StepFilter,
}

impl Forkable {
    /// `exclusive_lib` anchors the reversible segment; the block it names
    /// is never re-emitted. An empty id means "trust the first block".
    pub fn new(exclusive_lib: BlockRef, filter: StepFilter) -> Self {
        Self {
            blocks: HashMap::new(),
            head: None,
            lib: exclusive_lib,
            filter,
        }
    }

    pub fn lib(&self) -> &BlockRef {
        &self.lib
    }

    pub fn head(&self) -> Option<BlockRef> {
        self.head
            .as_ref()
            .and_then(|id| self.blocks.get(id))
            .map(|b| b.block_ref())
    }

    /// Canonical chain from just above LIB to the head, ascending.
    pub fn canonical_chain(&self) -> Vec<BlockRef> {
        let Some(head_id) = &self.head else {
            return Vec::new();
        };
        self.chain_to(head_id)
            .into_iter()
            .map(|b| b.block_ref())
            .collect()
    }

    /// Whether `block_id` sits on the current canonical chain.
    pub fn is_canonical(&self, block_id: &str) -> bool {
        self.canonical_chain().iter().any(|r| r.id == block_id)
    }

    /// Feed one block through the reducer.
    pub fn process(&mut self, block: Arc<Block>) -> SearchResult<Vec<ForkStep>> {
        if block.num <= self.lib.num && !self.lib.id.is_empty() {
            tracing::debug!(num = block.num, id = %block.id, "ignoring block at or below LIB");
            return Ok(Vec::new());
        }
        if self.blocks.contains_key(&block.id) {
            return Ok(Vec::new());
        }

        let linkable = block.previous_id == self.lib.id
            || self.blocks.contains_key(&block.previous_id)
            || (self.lib.id.is_empty() && self.blocks.is_empty());
        if !linkable {
            return Err(SearchError::internal(format!(
                "unlinkable block {} (previous {} unknown)",
                block.block_ref(),
                block.previous_id
            )));
        }

        self.blocks.insert(block.id.clone(), Arc::clone(&block));

        let mut steps = Vec::new();
        match &self.head {
            None => {
                self.head = Some(block.id.clone());
                steps.push(ForkStep::New(Arc::clone(&block)));
            }
            Some(head_id) => {
                let head_num = self.blocks[head_id].num;
                if block.previous_id == *head_id {
                    self.head = Some(block.id.clone());
                    steps.push(ForkStep::New(Arc::clone(&block)));
                } else if block.num > head_num {
                    steps.extend(self.reorg_to(&block));
                } else {
                    tracing::debug!(
                        num = block.num,
                        id = %block.id,
                        head_num,
                        "recorded fork block, head unchanged"
                    );
                }
            }
        }

        steps.extend(self.advance_lib(&block)?);
        Ok(steps.into_iter().filter(|s| self.filter.keeps(s)).collect())
    }

    /// Move the head to `block`, undoing the abandoned branch head-first
    /// and redoing the adopted branch ascending.
    fn reorg_to(&mut self, block: &Arc<Block>) -> Vec<ForkStep> {
        let old_head = self.head.clone().expect("reorg with no head");
        let old_chain = self.chain_to(&old_head);
        let new_chain = self.chain_to(&block.id);

        let common = new_chain
            .iter()
            .map(|b| b.id.as_str())
            .collect::<std::collections::HashSet<_>>();
        let mut steps = Vec::new();

        for abandoned in old_chain.iter().rev() {
            if common.contains(abandoned.id.as_str()) {
                break;
            }
            steps.push(ForkStep::Undo(Arc::clone(abandoned)));
        }

        let old_ids = old_chain
            .iter()
            .map(|b| b.id.as_str())
            .collect::<std::collections::HashSet<_>>();
        for adopted in &new_chain {
            if !old_ids.contains(adopted.id.as_str()) {
                steps.push(ForkStep::New(Arc::clone(adopted)));
            }
        }

        tracing::info!(
            new_head = %block.block_ref(),
            undone = steps.iter().filter(|s| matches!(s, ForkStep::Undo(_))).count(),
            "chain reorganized"
        );
        self.head = Some(block.id.clone());
        steps
    }

    /// Emit irreversible steps when the incoming block announces a higher
    /// LIB, and prune everything that sank below it. Before the first
    /// advancement (empty LIB id) even an equal number counts: a chain
    /// starting at block 0 announces `lib_num == 0` for its own genesis.
    fn advance_lib(&mut self, block: &Arc<Block>) -> SearchResult<Vec<ForkStep>> {
        if block.lib_num <= self.lib.num && !self.lib.id.is_empty() {
            return Ok(Vec::new());
        }
        let Some(head_id) = self.head.clone() else {
            return Ok(Vec::new());
        };

        let chain = self.chain_to(&head_id);
        let mut steps = Vec::new();
        let mut new_lib = self.lib.clone();
        for b in &chain {
            if b.num > block.lib_num {
                break;
            }
            steps.push(ForkStep::Irreversible(Arc::clone(b)));
            new_lib = b.block_ref();
        }

        if new_lib.num > self.lib.num {
            self.lib = new_lib;
            let lib_num = self.lib.num;
            let lib_id = self.lib.id.clone();
            self.blocks
                .retain(|id, b| b.num > lib_num || *id == lib_id);
            tracing::debug!(lib = %self.lib, retained = self.blocks.len(), "LIB advanced");
        }
        Ok(steps)
    }

    /// Walk `previous_id` links from `id` down to (excluding) the LIB,
    /// ascending order.
    fn chain_to(&self, id: &str) -> Vec<Arc<Block>> {
        let mut out = Vec::new();
        let mut cursor = id;
        while cursor != self.lib.id {
            let Some(block) = self.blocks.get(cursor) else {
                break;
            };
            out.push(Arc::clone(block));
            // A genesis block may name itself as its own parent; stop
            // instead of walking in place.
            if block.previous_id == block.id {
                break;
            }
            cursor = &block.previous_id;
        }
        out.reverse();
        out
    }
}
