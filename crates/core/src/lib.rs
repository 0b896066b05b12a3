//! Core data model for the chainsift search service.
//!
//! Everything here is transport- and storage-agnostic: block and document
//! records, block-range shard arithmetic, the resumption cursor codec, the
//! boolean query grammar, and the shared error taxonomy. Heavier concerns
//! (indexes, stores, backends) live in their own crates and depend on this
//! one.

pub mod cursor;
pub mod error;
pub mod mapper;
pub mod query;
pub mod shard;
pub mod types;

pub use cursor::Cursor;
pub use error::{SearchError, SearchResult};
pub use mapper::BlockMapper;
pub use query::ParsedQuery;
pub use shard::ShardModel;
pub use types::{Block, BlockRef, Document, ProtocolTag, SearchMatch};
