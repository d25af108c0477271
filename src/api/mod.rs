//! This mod is meant to hold most of the code for the library's client-facing API.
mod client;
mod options;
mod wiring;

pub use client::RaftNode;
pub use options::RaftOptions;
pub use wiring::try_create_raft_node;
pub use wiring::RaftNodeConfig;
pub use wiring::RaftNodeCreationError;
