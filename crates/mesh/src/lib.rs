//! Peer coordination.
//!
//! Every backend publishes a [`SearchPeer`] record describing the block
//! range it can serve and whether it is ready. Records are
//! eventually-consistent snapshots: consumers never mutate them, and a
//! record that has not been republished for two publish intervals is
//! treated as unavailable.

mod client;
mod peer;

pub use client::{InMemoryMesh, MeshClient, PeerHandle};
pub use peer::{highest_archive_irr, mesh_lib, SearchPeer, Tier};
