//! History-plus-live seam.
//!
//! While the file source replays history, live blocks accumulate in a
//! bounded buffer. The seam happens when a file block's id is the parent of
//! a buffered live block: from there on, blocks come from the live feed.
//! Duplicate delivery across the seam is tolerated — the forkable reducer
//! drops blocks it has already seen.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chainsift_core::{Block, SearchResult};
use tokio::sync::mpsc;

use crate::source::{BlockSource, BoxedBlockSource};

/// Live blocks buffered while history replays. Oldest entries are dropped
/// on overflow — the file source will re-cover them.
const LIVE_BUFFER_CAP: usize = 4096;

enum Phase {
    File,
    Live,
}

pub struct JoiningSource {
    file: BoxedBlockSource,
    live_rx: mpsc::Receiver<Arc<Block>>,
    buffer: VecDeque<Arc<Block>>,
    phase: Phase,
}

impl JoiningSource {
    pub fn new(file: BoxedBlockSource, live_rx: mpsc::Receiver<Arc<Block>>) -> Self {
        Self {
            file,
            live_rx,
            buffer: VecDeque::new(),
            phase: Phase::File,
        }
    }

    fn drain_live(&mut self) {
        while let Ok(block) = self.live_rx.try_recv() {
            if self.buffer.len() == LIVE_BUFFER_CAP {
                self.buffer.pop_front();
            }
            self.buffer.push_back(block);
        }
    }

    /// Index of the first buffered block that links onto `id`, if any.
    fn join_point(&self, id: &str) -> Option<usize> {
        self.buffer.iter().position(|b| b.previous_id == id)
    }
}

#[async_trait]
impl BlockSource for JoiningSource {
    async fn next_block(&mut self) -> SearchResult<Option<Arc<Block>>> {
        loop {
            match self.phase {
                Phase::File => {
                    self.drain_live();
                    match self.file.next_block().await? {
                        Some(block) => {
                            if let Some(join) = self.join_point(&block.id) {
                                tracing::info!(
                                    num = block.num,
                                    id = %block.id,
                                    buffered = self.buffer.len() - join,
                                    "joined live stream"
                                );
                                self.buffer.drain(..join);
                                self.phase = Phase::Live;
                            }
                            return Ok(Some(block));
                        }
                        None => {
                            // History exhausted; whatever is buffered (plus
                            // the live feed) is all that remains.
                            tracing::debug!("file source exhausted, switching to live feed");
                            self.phase = Phase::Live;
                        }
                    }
                }
                Phase::Live => {
                    if let Some(block) = self.buffer.pop_front() {
                        return Ok(Some(block));
                    }
                    return Ok(self.live_rx.recv().await);
                }
            }
        }
    }
}
