mod election;
mod local_state;
mod members;
mod peers;
mod replica;
mod replica_api;
mod replication;
mod timers;
mod write_ahead_log;

pub use election::MemberJoiningFuture;
pub use election::RaftState;
pub use election::RaftStateListener;
pub use election::StateChange;
pub use election::StateSnapshot;
pub use election::StateWatcher;
pub use local_state::FileBackend;
pub use local_state::PersistError;
pub use local_state::PersistentState;
pub use local_state::PersistentStore;
pub use local_state::StoreBackend;
pub use local_state::Term;
pub use local_state::VolatileBackend;
pub use peers::LogId;
pub use peers::PeerAddress;
pub use replica_api::AppendEntryError;
pub use replica_api::JoinError;
pub use write_ahead_log::CommitStream;
pub use write_ahead_log::CommittedEntry;
pub use write_ahead_log::EntryType;
pub use write_ahead_log::LogEntry;

pub(crate) use election::state_watch;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaConfig;
pub(crate) use replica_api::ConsensusKind;
pub(crate) use replica_api::ConsensusReply;
pub(crate) use replica_api::MemberJoinReady;
pub(crate) use replica_api::TimerEvent;
pub(crate) use replica_api::TimerKind;
pub(crate) use write_ahead_log::commit_stream;
