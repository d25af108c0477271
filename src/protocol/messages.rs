use crate::commitlog::Position;
use crate::replica::{LogEntry, PeerAddress, Term};

pub type PartitionId = u16;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct AppendRequest {
    pub(crate) partition_id: PartitionId,
    pub(crate) term: Term,
    pub(crate) leader: PeerAddress,
    // "Previous entry" is the entry immediately preceding `entry` in the leader's log.
    pub(crate) previous: Option<(Term, Position)>,
    pub(crate) commit_position: Option<Position>,
    // None means heartbeat.
    pub(crate) entry: Option<LogEntry>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct AppendResponse {
    pub(crate) partition_id: PartitionId,
    pub(crate) term: Term,
    pub(crate) member: PeerAddress,
    pub(crate) succeeded: bool,
    // On success, the position the member has durably written and agrees on. On failure, the
    // position the member offers for the leader to retry from.
    pub(crate) position: Option<Position>,
}

/// Shared shape of Poll and Vote requests.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ConsensusRequest {
    pub(crate) partition_id: PartitionId,
    pub(crate) term: Term,
    pub(crate) candidate: PeerAddress,
    pub(crate) last_entry: Option<(Term, Position)>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ConsensusResponse {
    pub(crate) partition_id: PartitionId,
    pub(crate) term: Term,
    pub(crate) granted: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct JoinRequest {
    pub(crate) partition_id: PartitionId,
    pub(crate) member: PeerAddress,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct JoinResponse {
    pub(crate) partition_id: PartitionId,
    pub(crate) term: Term,
    pub(crate) succeeded: bool,
    pub(crate) members: Vec<PeerAddress>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    AppendRequest(AppendRequest),
    AppendResponse(AppendResponse),
    VoteRequest(ConsensusRequest),
    VoteResponse(ConsensusResponse),
    PollRequest(ConsensusRequest),
    PollResponse(ConsensusResponse),
    JoinRequest(JoinRequest),
    JoinResponse(JoinResponse),
}

impl Message {
    pub(crate) fn partition_id(&self) -> PartitionId {
        match self {
            Message::AppendRequest(m) => m.partition_id,
            Message::AppendResponse(m) => m.partition_id,
            Message::VoteRequest(m) | Message::PollRequest(m) => m.partition_id,
            Message::VoteResponse(m) | Message::PollResponse(m) => m.partition_id,
            Message::JoinRequest(m) => m.partition_id,
            Message::JoinResponse(m) => m.partition_id,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Message::AppendRequest(_) => "AppendRequest",
            Message::AppendResponse(_) => "AppendResponse",
            Message::VoteRequest(_) => "VoteRequest",
            Message::VoteResponse(_) => "VoteResponse",
            Message::PollRequest(_) => "PollRequest",
            Message::PollResponse(_) => "PollResponse",
            Message::JoinRequest(_) => "JoinRequest",
            Message::JoinResponse(_) => "JoinResponse",
        }
    }
}
