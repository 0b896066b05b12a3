//! The live tier: queries against the reversible chain head.
//!
//! A single-threaded dispatcher consumes the fork-aware step fan-out from
//! the indexing pipeline and maintains a ring of per-block indexes keyed by
//! block id, with a side map from block number to the ids seen at that
//! number (several during a fork). Undone blocks leave the ring but stay in
//! a bounded undo log so resuming clients can unwind. Blocks sink out of
//! the ring only once enough archive peers cover them.

mod tail;

pub use tail::{LiveTail, LiveTailConfig, TailState, UndoEvent};
