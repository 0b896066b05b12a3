//! Block sources and fork awareness.
//!
//! Everything upstream of the indexing pipeline lives here: the
//! [`BlockSource`] pull seam, a file-backed source over the object store, a
//! joining source that seams history with a live feed, start gates, and the
//! [`Forkable`] reducer that turns a raw block stream into tagged
//! `New`/`Undo`/`Irreversible` steps.
//!
//! The forkable stage is strictly single-threaded: one block in, a
//! deterministic batch of steps out.

mod file_source;
mod forkable;
mod gate;
mod joining;
mod source;

pub use file_source::{blocks_file_name, write_block_file, FileSource, BLOCKS_PREFIX};
pub use forkable::{ForkStep, Forkable, StepFilter};
pub use gate::{Gate, GateMode, GateTarget};
pub use joining::JoiningSource;
pub use source::{BlockSource, BoxedBlockSource, VecSource};
