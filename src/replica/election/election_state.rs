use crate::actor::WeakActorClient;
use crate::commitlog::Position;
use crate::replica::election::ConsensusRequestController;
use crate::replica::replication::ReplicationController;
use crate::replica::timers::{ElectionTimerHandle, IntervalTimerHandle};
use crate::replica::{PeerAddress, RaftState, TimerEvent, TimerKind};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub(crate) me: PeerAddress,
    pub(crate) election_interval: Duration,
    pub(crate) flush_interval: Duration,
}

/// ElectionState holds what is specific to the node's current role, including the timers that
/// drive it. It decides nothing about terms or logs.
///
/// Every transition starts a new epoch. Timer events carry the epoch they were created in, so
/// events from a previous role are recognizable and dropped.
pub(crate) struct ElectionState {
    state: State,
    epoch: u64,
    next_round: u64,
    config: ElectionConfig,
    actor_client: WeakActorClient,
}

impl ElectionState {
    pub(crate) fn new_follower(config: ElectionConfig, actor_client: WeakActorClient) -> Self {
        let epoch = 0;
        let follower = FollowerState::new(None, &config, &actor_client, epoch);

        ElectionState {
            state: State::Follower(follower),
            epoch,
            next_round: 0,
            config,
            actor_client,
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Epoch the next transition will start. Timers handed to `transition_to_leader()` are
    /// created with it.
    pub(crate) fn next_epoch(&self) -> u64 {
        self.epoch + 1
    }

    /// Id for a new Poll or Vote round.
    pub(crate) fn allocate_round(&mut self) -> u64 {
        self.next_round += 1;
        self.next_round
    }

    /// Each transition returns the previous LeaderState, if we were leader, so the caller can
    /// settle what it still owed.
    pub(crate) fn transition_to_follower(&mut self, leader: Option<PeerAddress>) -> Option<LeaderState> {
        let epoch = self.next_epoch();
        let follower = FollowerState::new(leader, &self.config, &self.actor_client, epoch);
        self.replace(State::Follower(follower))
    }

    pub(crate) fn transition_to_candidate(&mut self, vote: ConsensusRequestController) -> Option<LeaderState> {
        let epoch = self.next_epoch();
        let candidate = CandidateState {
            vote,
            _election_timer: ElectionTimerHandle::spawn_timer_task(
                self.config.election_interval,
                self.actor_client.clone(),
                epoch,
            ),
        };
        self.replace(State::Candidate(candidate))
    }

    pub(crate) fn transition_to_leader(&mut self, leader: LeaderState) -> Option<LeaderState> {
        self.replace(State::Leader(leader))
    }

    pub(crate) fn close(&mut self) -> Option<LeaderState> {
        self.replace(State::Closed)
    }

    fn replace(&mut self, new_state: State) -> Option<LeaderState> {
        self.epoch += 1;
        match std::mem::replace(&mut self.state, new_state) {
            State::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// A closed node reports itself as follower.
    pub(crate) fn current_state(&self) -> RaftState {
        match &self.state {
            State::Leader(_) => RaftState::Leader,
            State::Candidate(_) => RaftState::Candidate,
            State::Follower(_) | State::Closed => RaftState::Follower,
        }
    }

    pub(crate) fn leader(&self) -> Option<&PeerAddress> {
        match &self.state {
            State::Leader(_) => Some(&self.config.me),
            State::Follower(fs) => fs.leader.as_ref(),
            State::Candidate(_) | State::Closed => None,
        }
    }

    pub(crate) fn follower_mut(&mut self) -> Option<&mut FollowerState> {
        match &mut self.state {
            State::Follower(fs) => Some(fs),
            _ => None,
        }
    }

    pub(crate) fn candidate_mut(&mut self) -> Option<&mut CandidateState> {
        match &mut self.state {
            State::Candidate(cs) => Some(cs),
            _ => None,
        }
    }

    pub(crate) fn leader_mut(&mut self) -> Option<&mut LeaderState> {
        match &mut self.state {
            State::Leader(ls) => Some(ls),
            _ => None,
        }
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.election_timer.reset_timeout();
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(_) => write!(f, "Candidate"),
            State::Follower(FollowerState {
                leader: Some(leader), ..
            }) => write!(f, "Follower(Leader={:?})", leader),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
            State::Closed => write!(f, "Closed"),
        }
    }
}

enum State {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
    Closed,
}

pub(crate) struct FollowerState {
    leader: Option<PeerAddress>,
    // Set when the leader contacts us, cleared on every election timeout. Polls are rejected
    // while it's set.
    heard_from_leader: bool,
    poll: Option<ConsensusRequestController>,
    election_timer: ElectionTimerHandle,
    _flush_timer: IntervalTimerHandle,
}

impl FollowerState {
    fn new(leader: Option<PeerAddress>, config: &ElectionConfig, actor_client: &WeakActorClient, epoch: u64) -> Self {
        FollowerState {
            heard_from_leader: leader.is_some(),
            leader,
            poll: None,
            election_timer: ElectionTimerHandle::spawn_timer_task(
                config.election_interval,
                actor_client.clone(),
                epoch,
            ),
            _flush_timer: IntervalTimerHandle::spawn_timer_task(
                config.flush_interval,
                actor_client.clone(),
                TimerEvent {
                    epoch,
                    kind: TimerKind::Flush,
                },
            ),
        }
    }

    pub(crate) fn leader(&self) -> Option<&PeerAddress> {
        self.leader.as_ref()
    }

    /// Returns true if we didn't know this leader yet.
    pub(crate) fn on_leader_contact(&mut self, leader: &PeerAddress) -> bool {
        self.heard_from_leader = true;
        // A poll still in flight must not escalate into a vote against a live leader.
        self.poll = None;
        self.election_timer.reset_timeout();

        if self.leader.as_ref() == Some(leader) {
            false
        } else {
            self.leader = Some(leader.clone());
            true
        }
    }

    pub(crate) fn heard_from_leader(&self) -> bool {
        self.heard_from_leader
    }

    pub(crate) fn forget_leader_contact(&mut self) {
        self.heard_from_leader = false;
    }

    pub(crate) fn start_poll(&mut self, poll: ConsensusRequestController) {
        self.poll = Some(poll);
    }

    pub(crate) fn poll_mut(&mut self) -> Option<&mut ConsensusRequestController> {
        self.poll.as_mut()
    }

    pub(crate) fn end_poll(&mut self) {
        self.poll = None;
    }
}

pub(crate) struct CandidateState {
    vote: ConsensusRequestController,
    _election_timer: ElectionTimerHandle,
}

impl CandidateState {
    pub(crate) fn vote_mut(&mut self) -> &mut ConsensusRequestController {
        &mut self.vote
    }
}

pub(crate) struct LeaderState {
    // Position of the initial entry we wrote as leader. Nothing is committed in our term before
    // it is.
    pub(crate) leader_position: Position,
    pub(crate) replication: HashMap<PeerAddress, ReplicationController>,
    // Member whose join waits on listeners. At most one at a time.
    pub(crate) joining: Option<PeerAddress>,
    // Configuration entry that is written but not yet committed.
    pub(crate) configuring: Option<PendingConfiguration>,
}

impl LeaderState {
    pub(crate) fn new(leader_position: Position, replication: HashMap<PeerAddress, ReplicationController>) -> Self {
        LeaderState {
            leader_position,
            replication,
            joining: None,
            configuring: None,
        }
    }

    pub(crate) fn is_changing_membership(&self) -> bool {
        self.joining.is_some() || self.configuring.is_some()
    }
}

pub(crate) struct PendingConfiguration {
    pub(crate) position: Position,
    pub(crate) member: PeerAddress,
    pub(crate) responder: oneshot::Sender<Bytes>,
}
