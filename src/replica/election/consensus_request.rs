use crate::actor::WeakActorClient;
use crate::protocol::{self, ConsensusRequest, ConsensusResponse, Message};
use crate::replica::members::MemberRegistry;
use crate::replica::{ConsensusKind, ConsensusReply, PeerAddress};
use crate::transport::Transport;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ConsensusOutcome {
    Reached,
    Failed,
}

impl ConsensusKind {
    fn request(self, request: ConsensusRequest) -> Message {
        match self {
            ConsensusKind::Poll => Message::PollRequest(request),
            ConsensusKind::Vote => Message::VoteRequest(request),
        }
    }

    fn response(self, message: Message) -> Option<ConsensusResponse> {
        match (self, message) {
            (ConsensusKind::Poll, Message::PollResponse(response)) => Some(response),
            (ConsensusKind::Vote, Message::VoteResponse(response)) => Some(response),
            _ => None,
        }
    }
}

/// ConsensusRequestController runs one round of Poll or Vote requests. Every member is asked
/// concurrently and the replies come back to the actor as `ConsensusReply` events. We always
/// count as having granted our own request. The outcome is reported exactly once.
pub(crate) struct ConsensusRequestController {
    logger: slog::Logger,
    kind: ConsensusKind,
    round: u64,
    required_quorum: usize,
    granted: HashSet<PeerAddress>,
    awaiting: HashSet<PeerAddress>,
    decided: bool,
    requests: Vec<JoinHandle<()>>,
}

impl ConsensusRequestController {
    pub(crate) fn open(
        logger: slog::Logger,
        kind: ConsensusKind,
        round: u64,
        request: ConsensusRequest,
        members: &MemberRegistry,
        transport: &Arc<dyn Transport>,
        timeout: Duration,
        actor_client: &WeakActorClient,
    ) -> Self {
        let awaiting = members.iter().map(|m| m.address().clone()).collect();
        let mut controller = Self::new(logger, kind, round, members.required_quorum(), awaiting);

        let frame = protocol::encode(&kind.request(request));
        for member in members.iter() {
            let logger = controller.logger.clone();
            let transport = transport.clone();
            let actor_client = actor_client.clone();
            let remote = member.remote().clone();
            let frame = frame.clone();

            controller.requests.push(tokio::task::spawn(async move {
                let response = match transport.send_request(&remote, frame, timeout).await {
                    Ok(reply) => match protocol::decode(&reply) {
                        Ok(message) => kind.response(message),
                        Err(e) => {
                            slog::warn!(logger, "Undecodable {:?} reply from {:?}: {}", kind, remote, e);
                            None
                        }
                    },
                    Err(e) => {
                        slog::debug!(logger, "{:?} request to {:?} failed: {}", kind, remote, e);
                        None
                    }
                };

                let reply = ConsensusReply {
                    kind,
                    round,
                    from: remote.address().clone(),
                    response,
                };
                actor_client.consensus_reply(reply).await;
            }));
        }

        controller
    }

    fn new(
        logger: slog::Logger,
        kind: ConsensusKind,
        round: u64,
        required_quorum: usize,
        awaiting: HashSet<PeerAddress>,
    ) -> Self {
        ConsensusRequestController {
            logger,
            kind,
            round,
            required_quorum,
            granted: HashSet::new(),
            awaiting,
            decided: false,
            requests: vec![],
        }
    }

    pub(crate) fn round(&self) -> u64 {
        self.round
    }

    /// Evaluate without a new reply. A single node cluster reaches consensus right away.
    pub(crate) fn check(&mut self) -> Option<ConsensusOutcome> {
        if self.decided {
            return None;
        }

        // +1 for our own vote
        let granted = self.granted.len() + 1;
        let outcome = if granted >= self.required_quorum {
            ConsensusOutcome::Reached
        } else if granted + self.awaiting.len() < self.required_quorum {
            ConsensusOutcome::Failed
        } else {
            return None;
        };

        slog::debug!(
            self.logger,
            "{:?} round {} {:?} with {}/{} granted",
            self.kind,
            self.round,
            outcome,
            granted,
            self.required_quorum
        );
        self.decided = true;
        Some(outcome)
    }

    /// Duplicate replies and replies from non-members are ignored.
    pub(crate) fn on_reply(&mut self, from: &PeerAddress, granted: bool) -> Option<ConsensusOutcome> {
        if self.decided || !self.awaiting.remove(from) {
            return None;
        }
        if granted {
            self.granted.insert(from.clone());
        }

        self.check()
    }
}

impl Drop for ConsensusRequestController {
    fn drop(&mut self) {
        for request in &self.requests {
            request.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::replica::{PersistentStore, Term};
    use crate::transport::{InboundFrame, LocalNetwork};

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn address(port: u16) -> PeerAddress {
        PeerAddress::new("localhost", port)
    }

    fn controller(required_quorum: usize, peers: &[u16]) -> ConsensusRequestController {
        let awaiting = peers.iter().map(|p| address(*p)).collect();
        ConsensusRequestController::new(logger(), ConsensusKind::Vote, 1, required_quorum, awaiting)
    }

    #[test]
    fn single_node_reaches_consensus_immediately() {
        let mut controller = controller(1, &[]);

        assert_eq!(controller.check(), Some(ConsensusOutcome::Reached));
        assert_eq!(controller.check(), None);
    }

    #[test]
    fn reached_once_quorum_granted() {
        let mut controller = controller(3, &[2, 3, 4, 5]);
        assert_eq!(controller.check(), None);

        assert_eq!(controller.on_reply(&address(2), true), None);
        // duplicate doesn't count twice
        assert_eq!(controller.on_reply(&address(2), true), None);
        assert_eq!(controller.on_reply(&address(3), false), None);
        assert_eq!(controller.on_reply(&address(4), true), Some(ConsensusOutcome::Reached));

        // decided already
        assert_eq!(controller.on_reply(&address(5), true), None);
    }

    #[test]
    fn failed_once_quorum_unreachable() {
        let mut controller = controller(2, &[2, 3]);

        assert_eq!(controller.on_reply(&address(9), true), None);
        assert_eq!(controller.on_reply(&address(2), false), None);
        assert_eq!(controller.on_reply(&address(3), false), Some(ConsensusOutcome::Failed));
        assert_eq!(controller.check(), None);
    }

    #[tokio::test]
    async fn requests_every_member_and_reports_replies() {
        // -- setup --
        let network = LocalNetwork::new(10);
        let (transport, _my_inbound) = network.bind(address(1));
        let (_peer, mut peer_inbound) = network.bind(address(2));
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let mut store = PersistentStore::volatile(logger());
        let mut members = MemberRegistry::new(logger(), address(1), transport.clone());
        members.add_member(&address(2), &mut store, None).unwrap();
        members.add_member(&address(3), &mut store, None).unwrap();

        let (actor_client, mut actor_rx) = ActorClient::new(10);
        let request = ConsensusRequest {
            partition_id: 7,
            term: Term::new(4),
            candidate: address(1),
            last_entry: None,
        };

        // -- execute --
        let _controller = ConsensusRequestController::open(
            logger(),
            ConsensusKind::Poll,
            12,
            request.clone(),
            &members,
            &transport,
            Duration::from_secs(5),
            &actor_client.weak(),
        );

        match peer_inbound.recv().await {
            Some(InboundFrame::Request(frame, responder)) => {
                assert_eq!(protocol::decode(&frame), Ok(Message::PollRequest(request)));
                let response = ConsensusResponse {
                    partition_id: 7,
                    term: Term::new(4),
                    granted: true,
                };
                responder.send(protocol::encode(&Message::PollResponse(response))).unwrap();
            }
            other => panic!("Unexpected frame {:?}", other),
        }

        // -- verify --
        // Both members report back, one of them unreachable.
        let mut replies = vec![];
        for _ in 0..2 {
            match actor_rx.recv().await {
                Some(Event::ConsensusReply(reply)) => replies.push(reply),
                other => panic!("Unexpected event {:?}", other),
            }
        }
        replies.sort_by(|a, b| a.from.cmp(&b.from));

        assert_eq!(replies[0].from, address(2));
        assert_eq!(replies[0].round, 12);
        assert_eq!(replies[0].kind, ConsensusKind::Poll);
        assert!(replies[0].response.as_ref().unwrap().granted);
        assert_eq!(replies[1].from, address(3));
        assert!(replies[1].response.is_none());
    }
}
