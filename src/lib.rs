mod actor;
mod api;
mod commitlog;
mod protocol;
mod replica;
mod router;
mod transport;

pub use api::try_create_raft_node;
pub use api::RaftNode;
pub use api::RaftNodeConfig;
pub use api::RaftNodeCreationError;
pub use api::RaftOptions;
pub use commitlog::Entry;
pub use commitlog::InMemoryLog;
pub use commitlog::Log;
pub use commitlog::Position;
pub use commitlog::StorageError;
pub use protocol::DecodeError;
pub use protocol::PartitionId;
pub use replica::AppendEntryError;
pub use replica::CommitStream;
pub use replica::CommittedEntry;
pub use replica::EntryType;
pub use replica::FileBackend;
pub use replica::JoinError;
pub use replica::LogEntry;
pub use replica::LogId;
pub use replica::MemberJoiningFuture;
pub use replica::PeerAddress;
pub use replica::PersistError;
pub use replica::PersistentState;
pub use replica::PersistentStore;
pub use replica::RaftState;
pub use replica::RaftStateListener;
pub use replica::StateChange;
pub use replica::StateSnapshot;
pub use replica::StateWatcher;
pub use replica::StoreBackend;
pub use replica::Term;
pub use replica::VolatileBackend;
pub use router::MessageRouter;
pub use router::RouterHandle;
pub use transport::InboundFrame;
pub use transport::LocalNetwork;
pub use transport::LocalTransport;
pub use transport::RemoteHandle;
pub use transport::Transport;
pub use transport::TransportError;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
