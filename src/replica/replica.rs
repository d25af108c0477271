use crate::actor::WeakActorClient;
use crate::commitlog::{Log, Position};
use crate::protocol::{
    self, AppendRequest, AppendResponse, ConsensusRequest, ConsensusResponse, JoinRequest, JoinResponse, Message,
};
use crate::replica::election::{
    ConsensusOutcome, ConsensusRequestController, ElectionConfig, ElectionState, LeaderState, PendingConfiguration,
    StateChangeNotifier,
};
use crate::replica::members::MemberRegistry;
use crate::replica::replication::{ReplicationContext, ReplicationController};
use crate::replica::write_ahead_log::{CommitStreamPublisher, LogAppendBuffer};
use crate::replica::{
    AppendEntryError, ConsensusKind, ConsensusReply, EntryType, LogEntry, LogId, MemberJoinReady, PeerAddress,
    PersistError, PersistentStore, RaftState, RaftStateListener, StateChange, StateSnapshot, Term, TimerEvent,
    TimerKind,
};
use crate::transport::{InboundFrame, Transport};
use bytes::Bytes;
use std::cmp;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Duration;

pub(crate) struct ReplicaConfig<L: Log<LogEntry>> {
    pub(crate) logger: slog::Logger,
    pub(crate) log_id: LogId,
    pub(crate) me: PeerAddress,
    pub(crate) log: L,
    pub(crate) store: PersistentStore,
    // Initial cluster, used only if no membership was persisted yet. Empty for a node that is
    // going to join an existing cluster.
    pub(crate) bootstrap_members: Vec<PeerAddress>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) commit_stream_publisher: CommitStreamPublisher,
    pub(crate) state_notifier: StateChangeNotifier,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) election_interval: Duration,
    pub(crate) flush_interval: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) append_buffer_size: usize,
}

/// Replica is the raft state machine of one node for one partition. Every method runs on the
/// actor task and none of them blocks on the network.
pub(crate) struct Replica<L: Log<LogEntry>> {
    logger: slog::Logger,
    log_id: LogId,
    me: PeerAddress,
    store: PersistentStore,
    members: MemberRegistry,
    log_buffer: LogAppendBuffer<L>,
    election_state: ElectionState,
    commit_publisher: CommitStreamPublisher,
    state_notifier: StateChangeNotifier,
    listeners: Vec<Arc<dyn RaftStateListener>>,
    last_notified: (RaftState, Term),
    transport: Arc<dyn Transport>,
    actor_client: WeakActorClient,
    heartbeat_interval: Duration,
    request_timeout: Duration,
}

impl<L: Log<LogEntry>> Replica<L> {
    pub(crate) fn new(config: ReplicaConfig<L>) -> Result<Self, PersistError> {
        let ReplicaConfig {
            logger,
            log_id,
            me,
            log,
            mut store,
            bootstrap_members,
            transport,
            commit_stream_publisher,
            state_notifier,
            actor_client,
            heartbeat_interval,
            election_interval,
            flush_interval,
            request_timeout,
            append_buffer_size,
        } = config;

        if store.members().is_empty() && !bootstrap_members.is_empty() {
            for member in bootstrap_members.into_iter().chain(std::iter::once(me.clone())) {
                store.add_member(member);
            }
            store.save()?;
        }

        let log_buffer = LogAppendBuffer::new(logger.clone(), log, append_buffer_size);
        let mut members = MemberRegistry::new(logger.clone(), me.clone(), transport.clone());
        members.restore(store.members(), log_buffer.last_written());

        let election_state = ElectionState::new_follower(
            ElectionConfig {
                me: me.clone(),
                election_interval,
                flush_interval,
            },
            actor_client.clone(),
        );

        slog::info!(
            logger,
            "Starting as follower in term {:?} with members {:?}",
            store.term(),
            store.members()
        );

        let mut replica = Replica {
            logger,
            log_id,
            me,
            last_notified: (RaftState::Follower, store.term()),
            store,
            members,
            log_buffer,
            election_state,
            commit_publisher: commit_stream_publisher,
            state_notifier,
            listeners: vec![],
            transport,
            actor_client,
            heartbeat_interval,
            request_timeout,
        };
        replica.publish_committed();

        Ok(replica)
    }

    pub(crate) fn add_listener(&mut self, listener: Arc<dyn RaftStateListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn handle_inbound(&mut self, frame: InboundFrame) {
        let (bytes, responder) = match frame {
            InboundFrame::Message(bytes) => (bytes, None),
            InboundFrame::Request(bytes, responder) => (bytes, Some(responder)),
        };
        let message = match protocol::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                slog::warn!(self.logger, "Dropping undecodable frame: {}", e);
                return;
            }
        };
        if message.partition_id() != self.log_id.partition_id {
            slog::warn!(
                self.logger,
                "Dropping {} for partition {}",
                message.name(),
                message.partition_id()
            );
            return;
        }
        if self.election_state.is_closed() {
            return;
        }

        match (message, responder) {
            (Message::AppendRequest(request), _) => self.handle_append_request(request),
            (Message::AppendResponse(response), _) => self.handle_append_response(response),
            (Message::VoteRequest(request), Some(responder)) => {
                let response = self.handle_vote_request(request);
                let _ = responder.send(protocol::encode(&Message::VoteResponse(response)));
            }
            (Message::PollRequest(request), Some(responder)) => {
                let response = self.handle_poll_request(request);
                let _ = responder.send(protocol::encode(&Message::PollResponse(response)));
            }
            (Message::JoinRequest(request), Some(responder)) => self.handle_join_request(request, responder),
            (message, _) => slog::warn!(self.logger, "Dropping unexpected {}", message.name()),
        }
    }

    /// > If RPC request or response contains term T > currentTerm:
    /// > set currentTerm = T, convert to follower (§5.1)
    ///
    /// Returns true if we stepped down.
    fn may_step_down(&mut self, term: Term, leader: Option<&PeerAddress>) -> bool {
        if term <= self.store.term() {
            return false;
        }

        slog::info!(
            self.logger,
            "Observed term {:?} > our term {:?}. Transitioning to follower.",
            term,
            self.store.term()
        );
        self.store.set_term(term);
        if let Err(e) = self.store.save() {
            // Retried with the next save. No vote is granted until it succeeds.
            slog::error!(self.logger, "Failed to persist term {:?}: {}", term, e);
        }
        self.become_follower(leader.cloned());

        true
    }

    // ------- Follower path -------

    fn handle_append_request(&mut self, request: AppendRequest) {
        self.may_step_down(request.term, Some(&request.leader));

        // 1. Reply false if term < currentTerm (§5.1)
        if request.term < self.store.term() {
            slog::debug!(self.logger, "Rejecting AppendRequest of stale term {:?}", request.term);
            let position = self.log_buffer.last_written_position();
            self.send_append_response(&request.leader, false, position);
            return;
        }

        // > If AppendEntries RPC received from new leader: convert to follower
        if self.election_state.candidate_mut().is_some() {
            self.become_follower(Some(request.leader.clone()));
        }

        let new_leader = match self.election_state.follower_mut() {
            Some(fs) => fs.on_leader_contact(&request.leader),
            None => {
                slog::error!(
                    self.logger,
                    "Got AppendRequest from {:?} while leader of the same term {:?}. Wtf!",
                    request.leader,
                    request.term
                );
                return;
            }
        };
        if new_leader {
            self.notify_state_change();
        }

        let outcome = match &request.entry {
            Some(entry) if request.previous != self.log_buffer.last_buffered() => {
                self.log_buffer.truncate_log(&request, entry)
            }
            entry => self.log_buffer.append_event(&request, entry.as_ref()),
        };

        if let Some(configuration) = &outcome.configuration {
            let tail = self.log_buffer.last_buffered();
            if let Err(e) = self.members.replace_members(configuration, &mut self.store, tail) {
                slog::error!(self.logger, "Failed to persist configuration {:?}: {}", configuration, e);
            }
        }
        if outcome.commit_advanced {
            self.publish_committed();
        }

        self.send_append_response(&request.leader, outcome.succeeded, outcome.position);
    }

    fn send_append_response(&self, leader: &PeerAddress, succeeded: bool, position: Option<Position>) {
        let response = AppendResponse {
            partition_id: self.log_id.partition_id,
            term: self.store.term(),
            member: self.me.clone(),
            succeeded,
            position,
        };

        let remote = self.transport.register_remote_address(leader);
        if !self
            .transport
            .send_message(&remote, protocol::encode(&Message::AppendResponse(response)))
        {
            slog::debug!(self.logger, "Could not send AppendResponse to {:?}", leader);
        }
    }

    fn on_flush_tick(&mut self) {
        let before = self.log_buffer.last_written_position();
        if !self.log_buffer.flush_buffered_events() {
            return;
        }
        let after = self.log_buffer.last_written_position();
        if after == before {
            return;
        }

        self.publish_committed();

        // Let the leader know what became durable without waiting for its next heartbeat.
        // Everything we buffered was chained onto this leader's log, so it's all agreed on.
        let leader = self
            .election_state
            .follower_mut()
            .and_then(|fs| fs.leader().cloned());
        if let Some(leader) = leader {
            self.send_append_response(&leader, true, after);
        }
    }

    fn handle_vote_request(&mut self, request: ConsensusRequest) -> ConsensusResponse {
        self.may_step_down(request.term, None);

        let granted = self.should_grant_vote(&request);
        slog::info!(
            self.logger,
            "Vote for {:?} in term {:?}: granted={}",
            request.candidate,
            request.term,
            granted
        );

        self.consensus_response(granted)
    }

    fn should_grant_vote(&mut self, request: &ConsensusRequest) -> bool {
        // 1. Reply false if term < currentTerm (§5.1)
        if request.term < self.store.term() {
            return false;
        }
        if self.election_state.leader_mut().is_some() {
            return false;
        }

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).
        if let Some(voted_for) = self.store.voted_for() {
            if *voted_for != request.candidate {
                slog::debug!(self.logger, "Already voted for {:?}", voted_for);
                return false;
            }
        }
        if !self.is_candidate_log_gte_mine(request.last_entry) {
            slog::debug!(self.logger, "Candidate log is out of date");
            return false;
        }

        // The vote must be durable before it's handed out.
        self.store.set_voted_for(Some(request.candidate.clone()));
        if let Err(e) = self.store.save() {
            slog::error!(self.logger, "Failed to persist vote: {}", e);
            return false;
        }
        self.election_state.reset_timeout_if_follower();

        true
    }

    /// A poll asks "would you vote for me?" without anybody changing term or vote.
    fn handle_poll_request(&mut self, request: ConsensusRequest) -> ConsensusResponse {
        self.may_step_down(request.term, None);

        let granted = request.term >= self.store.term()
            && self.election_state.current_state() != RaftState::Leader
            && !self
                .election_state
                .follower_mut()
                .map(|fs| fs.heard_from_leader())
                .unwrap_or(false)
            && self.is_candidate_log_gte_mine(request.last_entry);
        slog::debug!(self.logger, "Poll from {:?}: granted={}", request.candidate, granted);

        self.consensus_response(granted)
    }

    fn consensus_response(&self, granted: bool) -> ConsensusResponse {
        ConsensusResponse {
            partition_id: self.log_id.partition_id,
            term: self.store.term(),
            granted,
        }
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Position)>) -> bool {
        is_log_up_to_date(self.log_buffer.last_buffered(), candidate_last_entry)
    }

    // ------- Election -------

    pub(crate) fn handle_timer(&mut self, tick: TimerEvent) {
        if tick.epoch != self.election_state.epoch() {
            slog::trace!(self.logger, "Dropping stale timer event {:?}", tick);
            return;
        }

        match tick.kind {
            TimerKind::ElectionTimeout => self.on_election_timeout(),
            TimerKind::Flush => self.on_flush_tick(),
            TimerKind::Heartbeat(member) => self.on_heartbeat_tick(&member),
        }
    }

    fn on_election_timeout(&mut self) {
        if self.election_state.candidate_mut().is_some() {
            // Back to follower and poll again. A successful poll starts the next election.
            slog::info!(self.logger, "Election timed out");
            self.become_follower(None);
        }
        if self.election_state.follower_mut().is_none() {
            return;
        }
        if !self.is_cluster_member() {
            slog::debug!(self.logger, "Not a cluster member (yet). Not polling.");
            return;
        }

        // Ask first if we could win, so a node that can't doesn't disrupt the cluster with a
        // higher term.
        let round = self.election_state.allocate_round();
        let poll = ConsensusRequestController::open(
            self.logger.clone(),
            ConsensusKind::Poll,
            round,
            self.consensus_request(self.store.term()),
            &self.members,
            &self.transport,
            self.request_timeout,
            &self.actor_client,
        );
        slog::info!(self.logger, "Leader timed out, polling members (round {})", round);

        let outcome = self.election_state.follower_mut().and_then(|fs| {
            fs.forget_leader_contact();
            fs.start_poll(poll);
            fs.poll_mut().and_then(|poll| poll.check())
        });
        if let Some(outcome) = outcome {
            self.on_poll_outcome(outcome);
        }
    }

    fn consensus_request(&self, term: Term) -> ConsensusRequest {
        ConsensusRequest {
            partition_id: self.log_id.partition_id,
            term,
            candidate: self.me.clone(),
            last_entry: self.log_buffer.last_buffered(),
        }
    }

    pub(crate) fn handle_consensus_reply(&mut self, reply: ConsensusReply) {
        // Unreachable or timed out members count towards their failure flag.
        if let Some(member) = self.members.get_mut(&reply.from) {
            match reply.response {
                Some(_) => member.reset_failures(),
                None => member.record_failure(),
            }
        }
        if let Some(response) = &reply.response {
            if self.may_step_down(response.term, None) {
                return;
            }
        }
        let granted = reply.response.as_ref().map(|r| r.granted).unwrap_or(false);

        match reply.kind {
            ConsensusKind::Poll => {
                let outcome = match self.election_state.follower_mut().and_then(|fs| fs.poll_mut()) {
                    Some(poll) if poll.round() == reply.round => poll.on_reply(&reply.from, granted),
                    _ => return,
                };
                if let Some(outcome) = outcome {
                    self.on_poll_outcome(outcome);
                }
            }
            ConsensusKind::Vote => {
                let outcome = match self.election_state.candidate_mut().map(|cs| cs.vote_mut()) {
                    Some(vote) if vote.round() == reply.round => vote.on_reply(&reply.from, granted),
                    _ => return,
                };
                match outcome {
                    Some(ConsensusOutcome::Reached) => self.become_leader(),
                    // Stay candidate, the election timer starts another round.
                    Some(ConsensusOutcome::Failed) => slog::info!(self.logger, "Lost election"),
                    None => {}
                }
            }
        }
    }

    fn on_poll_outcome(&mut self, outcome: ConsensusOutcome) {
        match outcome {
            ConsensusOutcome::Reached => self.become_candidate(),
            ConsensusOutcome::Failed => {
                slog::info!(self.logger, "Poll failed, staying follower");
                if let Some(fs) = self.election_state.follower_mut() {
                    fs.end_poll();
                }
            }
        }
    }

    fn become_follower(&mut self, leader: Option<PeerAddress>) {
        self.log_buffer.flush_buffered_events();
        self.log_buffer.reset();

        if let Some(previous) = self.election_state.transition_to_follower(leader) {
            self.abandon_leadership(previous);
        }
        self.notify_state_change();
    }

    fn become_candidate(&mut self) {
        self.log_buffer.flush_buffered_events();
        self.log_buffer.reset();

        let term = self.store.term().next();
        self.store.set_term(term).set_voted_for(Some(self.me.clone()));
        if let Err(e) = self.store.save() {
            slog::error!(self.logger, "Can't become candidate, failed to persist term {:?}: {}", term, e);
            return;
        }

        let round = self.election_state.allocate_round();
        let vote = ConsensusRequestController::open(
            self.logger.clone(),
            ConsensusKind::Vote,
            round,
            self.consensus_request(term),
            &self.members,
            &self.transport,
            self.request_timeout,
            &self.actor_client,
        );
        if let Some(previous) = self.election_state.transition_to_candidate(vote) {
            self.abandon_leadership(previous);
        }
        self.notify_state_change();

        let outcome = self.election_state.candidate_mut().and_then(|cs| cs.vote_mut().check());
        if outcome == Some(ConsensusOutcome::Reached) {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        self.log_buffer.flush_buffered_events();
        self.log_buffer.reset();
        self.log_buffer.set_writer_open(true);

        let epoch = self.election_state.next_epoch();
        let tail = self.log_buffer.last_written();
        let mut replication = HashMap::with_capacity(self.members.size());
        for member in self.members.iter_mut() {
            let controller = ReplicationController::open(
                self.logger.clone(),
                member,
                self.log_buffer.log(),
                tail,
                self.heartbeat_interval,
                epoch,
                &self.actor_client,
            );
            replication.insert(member.address().clone(), controller);
        }

        let term = self.store.term();
        let leader_position = match self.log_buffer.append_local(term, EntryType::Initialize, Bytes::new()) {
            Ok(position) => position,
            Err(e) => {
                slog::error!(self.logger, "Failed to write initial entry as leader: {}", e);
                self.become_follower(None);
                return;
            }
        };
        self.log_buffer.flush_buffered_events();

        self.election_state
            .transition_to_leader(LeaderState::new(leader_position, replication));
        slog::info!(self.logger, "Became leader of term {:?} at position {:?}", term, leader_position);
        self.notify_state_change();

        self.commit_entries();
    }

    /// Whatever a leader still owed its callers is settled as failed.
    fn abandon_leadership(&mut self, leader_state: LeaderState) {
        if let Some(pending) = leader_state.configuring {
            slog::info!(self.logger, "Lost leadership before {:?} joined", pending.member);
            self.respond_join(pending.responder, false);
        }
    }

    fn is_cluster_member(&self) -> bool {
        self.store.members().contains(&self.me)
    }

    // ------- Leader path -------

    pub(crate) fn append(&mut self, data: Bytes) -> Result<(Term, Position), AppendEntryError> {
        if self.election_state.leader_mut().is_none() {
            return Err(AppendEntryError::NotLeader {
                leader: self.election_state.leader().cloned(),
            });
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        //
        // We respond once it's written locally. The commit stream tells when it's committed.
        let term = self.store.term();
        let position = self.log_buffer.append_local(term, EntryType::Event, data)?;
        self.log_buffer.flush_buffered_events();

        self.replicate_to_all(false);
        self.commit_entries();

        Ok((term, position))
    }

    fn on_heartbeat_tick(&mut self, member: &PeerAddress) {
        if self.election_state.leader_mut().is_none() {
            return;
        }
        // Picks up a flush that failed earlier.
        self.log_buffer.flush_buffered_events();

        if let Some(m) = self.members.get(member) {
            if m.has_failures() {
                slog::debug!(
                    self.logger,
                    "{:?} keeps failing. Last heard from at {:?}",
                    member,
                    m.heartbeat_timestamp()
                );
            }
        }
        self.replicate_to(member, true);
    }

    fn replicate_to_all(&mut self, heartbeat: bool) {
        for member in self.members.list() {
            self.replicate_to(&member, heartbeat);
        }
    }

    fn replicate_to(&mut self, address: &PeerAddress, heartbeat: bool) {
        let leader_state = match self.election_state.leader_mut() {
            Some(ls) => ls,
            None => return,
        };
        let (controller, member) = match (
            leader_state.replication.get_mut(address),
            self.members.get_mut(address),
        ) {
            (Some(controller), Some(member)) => (controller, member),
            _ => return,
        };

        let context = ReplicationContext {
            partition_id: self.log_id.partition_id,
            term: self.store.term(),
            me: &self.me,
            commit_position: self.log_buffer.commit_position(),
            transport: &*self.transport,
        };
        controller.replicate(&context, member, self.log_buffer.log(), heartbeat);
    }

    fn handle_append_response(&mut self, response: AppendResponse) {
        if self.may_step_down(response.term, None) {
            return;
        }
        if response.term < self.store.term() {
            slog::debug!(self.logger, "Dropping AppendResponse of stale term {:?}", response.term);
            return;
        }

        let leader_state = match self.election_state.leader_mut() {
            Some(ls) => ls,
            None => return,
        };
        let advanced = match (
            leader_state.replication.get_mut(&response.member),
            self.members.get_mut(&response.member),
        ) {
            (Some(controller), Some(member)) => controller.on_response(member, &response, self.log_buffer.log()),
            _ => {
                slog::warn!(self.logger, "AppendResponse from unknown member {:?}", response.member);
                return;
            }
        };

        if advanced {
            self.commit_entries();
        }
        self.replicate_to(&response.member, false);
    }

    fn commit_entries(&mut self) {
        let leader_position = match self.election_state.leader_mut() {
            Some(ls) => ls.leader_position,
            None => return,
        };
        let own = match self.log_buffer.last_written_position() {
            Some(position) => position,
            None => return,
        };

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        //
        // Everything from leader_position on was written by us in the current term, so the term
        // check is the same as N >= leader_position.
        let needed = self.members.required_quorum() - 1;
        let quorum = if needed == 0 {
            Some(own)
        } else {
            let matches = self.members.iter().map(|m| m.match_position()).collect();
            quorum_position(matches, needed).map(|position| cmp::min(position, own))
        };

        let commit = match quorum {
            Some(position) if position >= leader_position => position,
            _ => return,
        };
        if !self.log_buffer.advance_commit_position(commit) {
            return;
        }
        slog::debug!(self.logger, "Commit position advanced to {:?}", commit);

        self.publish_committed();
        self.complete_configuration(commit);
    }

    fn publish_committed(&mut self) {
        self.commit_publisher
            .publish_committed(&self.logger, self.log_buffer.log());
    }

    // ------- Membership -------

    fn handle_join_request(&mut self, request: JoinRequest, responder: oneshot::Sender<Bytes>) {
        let member = request.member;
        let already_member = self.store.members().contains(&member);
        let leader_state = match self.election_state.leader_mut() {
            Some(ls) => ls,
            None => {
                slog::debug!(self.logger, "Rejecting join of {:?}, not leader", member);
                self.respond_join(responder, false);
                return;
            }
        };
        if already_member {
            self.respond_join(responder, true);
            return;
        }
        if leader_state.is_changing_membership() {
            slog::info!(self.logger, "Rejecting join of {:?}, another membership change is ongoing", member);
            self.respond_join(responder, false);
            return;
        }

        slog::info!(self.logger, "{:?} asks to join", member);
        leader_state.joining = Some(member.clone());
        let preparations: Vec<_> = self
            .listeners
            .iter()
            .filter_map(|listener| listener.on_member_joining(&member))
            .collect();

        let ready = MemberJoinReady {
            epoch: self.election_state.epoch(),
            member,
            responder,
        };
        let actor_client = self.actor_client.clone();
        tokio::task::spawn(async move {
            for preparation in preparations {
                preparation.await;
            }
            actor_client.member_join_ready(ready).await;
        });
    }

    pub(crate) fn handle_member_join_ready(&mut self, ready: MemberJoinReady) {
        let MemberJoinReady {
            epoch,
            member,
            responder,
        } = ready;
        let current_epoch = self.election_state.epoch();
        let leader_state = match self.election_state.leader_mut() {
            Some(ls) if epoch == current_epoch => ls,
            _ => {
                slog::info!(self.logger, "No longer the leader {:?} asked to join", member);
                self.respond_join(responder, false);
                return;
            }
        };
        leader_state.joining = None;

        let mut configuration = self.store.members().to_vec();
        configuration.push(member.clone());

        let term = self.store.term();
        let position = match self.log_buffer.append_local(
            term,
            EntryType::Configuration,
            LogEntry::encode_members(&configuration),
        ) {
            Ok(position) => position,
            Err(e) => {
                slog::warn!(self.logger, "Failed to write configuration entry: {}", e);
                self.respond_join(responder, false);
                return;
            }
        };
        self.log_buffer.flush_buffered_events();

        let tail = self.log_buffer.last_written();
        if let Err(e) = self.members.add_member(&member, &mut self.store, tail) {
            slog::error!(self.logger, "Failed to persist new member {:?}: {}", member, e);
        }
        if let Some(new_member) = self.members.get_mut(&member) {
            let controller = ReplicationController::open(
                self.logger.clone(),
                new_member,
                self.log_buffer.log(),
                tail,
                self.heartbeat_interval,
                current_epoch,
                &self.actor_client,
            );
            leader_state.replication.insert(member.clone(), controller);
        }
        leader_state.configuring = Some(PendingConfiguration {
            position,
            member,
            responder,
        });

        self.replicate_to_all(false);
        self.commit_entries();
    }

    fn complete_configuration(&mut self, commit: Position) {
        let pending = match self.election_state.leader_mut() {
            Some(ls) if ls.configuring.as_ref().map(|c| c.position <= commit).unwrap_or(false) => {
                ls.configuring.take()
            }
            _ => None,
        };
        if let Some(pending) = pending {
            slog::info!(self.logger, "{:?} joined the cluster", pending.member);
            self.respond_join(pending.responder, true);
        }
    }

    fn respond_join(&self, responder: oneshot::Sender<Bytes>, succeeded: bool) {
        let response = JoinResponse {
            partition_id: self.log_id.partition_id,
            term: self.store.term(),
            succeeded,
            members: self.store.members().to_vec(),
        };
        let _ = responder.send(protocol::encode(&Message::JoinResponse(response)));
    }

    // ------- Lifecycle -------

    fn notify_state_change(&mut self) {
        let state = self.election_state.current_state();
        let term = self.store.term();
        self.state_notifier.notify_new_state(StateSnapshot {
            state,
            term,
            leader: self.election_state.leader().cloned(),
        });

        if self.last_notified == (state, term) {
            return;
        }
        self.last_notified = (state, term);
        slog::info!(self.logger, "Now {:?} in term {:?}", self.election_state, term);

        let change = StateChange {
            partition_id: self.log_id.partition_id,
            topic: self.log_id.topic.clone(),
            address: self.me.clone(),
            new_state: state,
            term,
        };
        for listener in &self.listeners {
            listener.on_state_change(&change);
        }
    }

    /// Flushes what's buffered and stops every timer and outstanding request. Idempotent.
    pub(crate) fn close(&mut self) {
        if self.election_state.is_closed() {
            return;
        }

        self.log_buffer.flush_buffered_events();
        if let Some(previous) = self.election_state.close() {
            self.abandon_leadership(previous);
        }
        self.log_buffer.set_writer_open(false);
        slog::info!(self.logger, "Closed raft node");
    }
}

/// > Raft determines which of two logs is more up-to-date
/// > by comparing the index and term of the last entries in the
/// > logs. If the logs have last entries with different terms, then
/// > the log with the later term is more up-to-date. If the logs
/// > end with the same term, then whichever log is longer is
/// > more up-to-date.
fn is_log_up_to_date(mine: Option<(Term, Position)>, candidate: Option<(Term, Position)>) -> bool {
    match (mine, candidate) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some((my_term, my_position)), Some((candidate_term, candidate_position))) => {
            if candidate_term != my_term {
                return candidate_term > my_term;
            }
            candidate_position >= my_position
        }
    }
}

/// Highest position matched by at least `needed` peers. This node isn't part of `peer_matches`.
fn quorum_position(mut peer_matches: Vec<Option<Position>>, needed: usize) -> Option<Position> {
    // Highest first. None sorts lowest.
    peer_matches.sort_by(|a, b| b.cmp(a));

    peer_matches.get(needed.checked_sub(1)?).copied().flatten()
}
