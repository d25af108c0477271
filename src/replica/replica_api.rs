use crate::commitlog::StorageError;
use crate::protocol::ConsensusResponse;
use crate::replica::PeerAddress;
use tokio::sync::oneshot;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum AppendEntryError {
    #[error("I'm not leader. Known leader: {leader:?}")]
    NotLeader { leader: Option<PeerAddress> },

    #[error("Failed to write entry to local log: {0}")]
    Storage(#[from] StorageError),

    #[error("Raft node actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("{contact:?} rejected the join. Members known to it: {members:?}")]
    Rejected {
        contact: PeerAddress,
        members: Vec<PeerAddress>,
    },

    #[error("Join request failed: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Malformed join response: {0}")]
    MalformedResponse(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConsensusKind {
    Poll,
    Vote,
}

/// ConsensusReply is the outcome of one Poll or Vote request, reported back to the actor.
#[derive(Debug)]
pub(crate) struct ConsensusReply {
    pub(crate) kind: ConsensusKind,
    // Round of the request. Replies from older rounds are dropped.
    pub(crate) round: u64,
    pub(crate) from: PeerAddress,
    // None if the peer didn't answer or answered garbage.
    pub(crate) response: Option<ConsensusResponse>,
}

/// TimerEvent is a single tick of one of the node's timers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TimerEvent {
    pub(crate) epoch: u64,
    pub(crate) kind: TimerKind,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TimerKind {
    ElectionTimeout,
    Flush,
    Heartbeat(PeerAddress),
}

/// Every listener finished its preparation for a joining member.
#[derive(Debug)]
pub(crate) struct MemberJoinReady {
    pub(crate) epoch: u64,
    pub(crate) member: PeerAddress,
    pub(crate) responder: oneshot::Sender<Bytes>,
}
