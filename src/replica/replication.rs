use crate::actor::WeakActorClient;
use crate::commitlog::{Log, Position};
use crate::protocol::{self, AppendRequest, AppendResponse, Message, PartitionId};
use crate::replica::members::RaftMember;
use crate::replica::timers::IntervalTimerHandle;
use crate::replica::write_ahead_log::LogReader;
use crate::replica::{LogEntry, PeerAddress, Term, TimerEvent, TimerKind};
use crate::transport::Transport;
use tokio::time::Duration;

/// Everything an AppendRequest carries besides the member specific bits.
pub(crate) struct ReplicationContext<'a> {
    pub(crate) partition_id: PartitionId,
    pub(crate) term: Term,
    pub(crate) me: &'a PeerAddress,
    pub(crate) commit_position: Option<Position>,
    pub(crate) transport: &'a dyn Transport,
}

/// ReplicationController streams the leader's log to a single member. The member's cursor
/// (`previous`) lives on `RaftMember` and advances optimistically as entries are sent. A rejection
/// moves it back to whatever position the member offers.
pub(crate) struct ReplicationController {
    logger: slog::Logger,
    reader: LogReader,
    heartbeat: IntervalTimerHandle,
}

impl ReplicationController {
    /// Replication resumes after the member's old match position if it's still in our log, and
    /// at our tail otherwise.
    pub(crate) fn open<L: Log<LogEntry>>(
        logger: slog::Logger,
        member: &mut RaftMember,
        log: &L,
        tail: Option<(Term, Position)>,
        heartbeat_interval: Duration,
        epoch: u64,
        actor_client: &WeakActorClient,
    ) -> Self {
        let hint = member
            .take_match_position()
            .filter(|hint| Some(*hint) <= tail.map(|(_, p)| p))
            .and_then(|hint| log.read(hint).ok().flatten());
        let previous = match hint {
            Some(entry) => Some(entry.id()),
            None => tail,
        };

        member.take_pending_entry();
        member.reset_failures();
        member.set_previous(previous);

        let mut reader = LogReader::new();
        reader.seek(log, Position::next_after(previous.map(|(_, p)| p)));

        let heartbeat = IntervalTimerHandle::spawn_timer_task(
            heartbeat_interval,
            actor_client.clone(),
            TimerEvent {
                epoch,
                kind: TimerKind::Heartbeat(member.address().clone()),
            },
        );

        ReplicationController {
            logger: logger.new(slog::o!("Peer" => member.address().to_string())),
            reader,
            heartbeat,
        }
    }

    /// Send every entry the member hasn't been sent yet. If there is none and `heartbeat` is set,
    /// send an empty AppendRequest instead. Stops at the first send the transport refuses.
    pub(crate) fn replicate<L: Log<LogEntry>>(
        &mut self,
        context: &ReplicationContext<'_>,
        member: &mut RaftMember,
        log: &L,
        heartbeat: bool,
    ) {
        let mut sent_any = false;
        loop {
            let entry = match self.next_entry(member, log) {
                Some(entry) => entry,
                None => break,
            };

            let id = entry.id();
            if let Err(entry) = self.send(context, member, Some(entry)) {
                if let Some(entry) = entry {
                    member.set_pending_entry(entry);
                }
                return;
            }
            member.set_previous(Some(id));
            sent_any = true;
        }

        if !sent_any && heartbeat {
            let _ = self.send(context, member, None);
        }
    }

    fn next_entry<L: Log<LogEntry>>(&mut self, member: &mut RaftMember, log: &L) -> Option<LogEntry> {
        if let Some(entry) = member.take_pending_entry() {
            return Some(entry);
        }
        if !self.reader.has_next(log) {
            return None;
        }

        match self.reader.next(log) {
            Ok(entry) => entry,
            Err(e) => {
                slog::warn!(self.logger, "Failed to read next entry for replication: {}", e);
                None
            }
        }
    }

    // Hands the entry back if the transport didn't take the request.
    fn send(
        &mut self,
        context: &ReplicationContext<'_>,
        member: &mut RaftMember,
        entry: Option<LogEntry>,
    ) -> Result<(), Option<LogEntry>> {
        let request = AppendRequest {
            partition_id: context.partition_id,
            term: context.term,
            leader: context.me.clone(),
            previous: member.previous(),
            commit_position: context.commit_position,
            entry,
        };
        let frame = protocol::encode(&Message::AppendRequest(request.clone()));

        if context.transport.send_message(member.remote(), frame) {
            self.heartbeat.reset();
            Ok(())
        } else {
            member.record_failure();
            if member.has_failures() {
                slog::debug!(self.logger, "Member keeps refusing AppendRequests");
            }
            Err(request.entry)
        }
    }

    /// Apply an AppendResponse from the member. Returns true if its match position moved, which
    /// may allow the commit position to advance.
    pub(crate) fn on_response<L: Log<LogEntry>>(
        &mut self,
        member: &mut RaftMember,
        response: &AppendResponse,
        log: &L,
    ) -> bool {
        member.reset_failures();
        member.touch_heartbeat();

        if response.succeeded {
            return match response.position {
                Some(position) => member.advance_match_position(position),
                None => false,
            };
        }

        slog::debug!(self.logger, "Append rejected, member offers {:?}", response.position);
        self.reseek(member, response.position, log);
        false
    }

    /// Move the cursor to `offer`, the last entry the member claims to have. Entries past it are
    /// sent again.
    fn reseek<L: Log<LogEntry>>(&mut self, member: &mut RaftMember, offer: Option<Position>, log: &L) {
        member.take_pending_entry();

        let previous = match offer {
            None => None,
            Some(position) => match log.read(position) {
                Ok(Some(entry)) => Some(entry.id()),
                // Offer is beyond our log, resume from our tail.
                Ok(None) => log
                    .last_position()
                    .and_then(|last| log.read(last).ok().flatten())
                    .map(|entry| entry.id()),
                Err(e) => {
                    slog::warn!(self.logger, "Failed to read entry {:?} while reseeking: {}", position, e);
                    return;
                }
            },
        };

        member.set_previous(previous);
        self.reader.seek(log, Position::next_after(previous.map(|(_, p)| p)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::commitlog::InMemoryLog;
    use crate::replica::members::MemberRegistry;
    use crate::replica::{EntryType, PersistentStore};
    use crate::transport::{InboundFrame, LocalNetwork, LocalTransport};
    use bytes::{Bytes, BytesMut};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn address(port: u16) -> PeerAddress {
        PeerAddress::new("localhost", port)
    }

    fn log_with_terms(terms: &[u64]) -> InMemoryLog<LogEntry> {
        let mut log = InMemoryLog::create();
        for (i, term) in terms.iter().enumerate() {
            let entry = LogEntry::new(
                Position::new(i as u64 + 1),
                Term::new(*term),
                EntryType::Event,
                Bytes::from_static(b"x"),
            );
            let mut buf = BytesMut::new();
            entry.encode(&mut buf);
            log.append(&buf).unwrap();
        }
        log
    }

    struct Fixture {
        transport: Arc<LocalTransport>,
        member_inbound: mpsc::Receiver<InboundFrame>,
        members: MemberRegistry,
        actor_client: ActorClient,
        _actor_rx: mpsc::Receiver<crate::actor::Event>,
    }

    fn fixture(queue_size: usize) -> Fixture {
        let network = LocalNetwork::new(queue_size);
        let (transport, _) = network.bind(address(1));
        let (_, member_inbound) = network.bind(address(2));
        let transport = Arc::new(transport);
        let mut members = MemberRegistry::new(logger(), address(1), transport.clone());
        let mut store = PersistentStore::volatile(logger());
        members.add_member(&address(2), &mut store, None).unwrap();
        let (actor_client, actor_rx) = ActorClient::new(100);

        Fixture {
            transport,
            member_inbound,
            members,
            actor_client,
            _actor_rx: actor_rx,
        }
    }

    fn context<'a>(me: &'a PeerAddress, transport: &'a dyn Transport) -> ReplicationContext<'a> {
        ReplicationContext {
            partition_id: 1,
            term: Term::new(3),
            me,
            commit_position: Some(Position::new(1)),
            transport,
        }
    }

    fn received(inbound: &mut mpsc::Receiver<InboundFrame>) -> Vec<AppendRequest> {
        let mut requests = vec![];
        while let Ok(frame) = inbound.try_recv() {
            match protocol::decode(frame.bytes()) {
                Ok(Message::AppendRequest(request)) => requests.push(request),
                other => panic!("Unexpected message {:?}", other),
            }
        }
        requests
    }

    fn response(succeeded: bool, position: Option<u64>) -> AppendResponse {
        AppendResponse {
            partition_id: 1,
            term: Term::new(3),
            member: address(2),
            succeeded,
            position: position.map(Position::new),
        }
    }

    #[tokio::test]
    async fn streams_new_entries_then_heartbeats() {
        // -- setup --
        let mut f = fixture(10);
        let mut log = log_with_terms(&[1, 1]);
        let tail = Some((Term::new(1), Position::new(2)));
        let me = address(1);
        let member = f.members.get_mut(&address(2)).unwrap();
        let mut controller = ReplicationController::open(
            logger(),
            member,
            &log,
            tail,
            Duration::from_secs(60),
            1,
            &f.actor_client.weak(),
        );

        // -- execute --
        let more = log_with_terms(&[1, 1, 3, 3]);
        for p in 3..=4 {
            let entry = more.read(Position::new(p)).unwrap().unwrap();
            let mut buf = BytesMut::new();
            entry.encode(&mut buf);
            log.append(&buf).unwrap();
        }
        controller.replicate(&context(&me, &*f.transport), member, &log, false);

        // -- verify --
        let requests = received(&mut f.member_inbound);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].previous, tail);
        assert_eq!(requests[0].entry.as_ref().unwrap().position(), Position::new(3));
        assert_eq!(requests[1].previous, Some((Term::new(3), Position::new(3))));
        assert_eq!(requests[1].commit_position, Some(Position::new(1)));
        assert_eq!(member.previous(), Some((Term::new(3), Position::new(4))));

        // Nothing new, so only a heartbeat goes out, and only if asked for.
        controller.replicate(&context(&me, &*f.transport), member, &log, false);
        assert!(received(&mut f.member_inbound).is_empty());
        controller.replicate(&context(&me, &*f.transport), member, &log, true);
        let requests = received(&mut f.member_inbound);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].entry, None);
        assert_eq!(requests[0].previous, Some((Term::new(3), Position::new(4))));
    }

    #[tokio::test]
    async fn rejection_reseeks_to_offer() {
        // -- setup --
        let mut f = fixture(10);
        let log = log_with_terms(&[1, 2, 2, 3]);
        let tail = Some((Term::new(3), Position::new(4)));
        let me = address(1);
        let member = f.members.get_mut(&address(2)).unwrap();
        let mut controller = ReplicationController::open(
            logger(),
            member,
            &log,
            tail,
            Duration::from_secs(60),
            1,
            &f.actor_client.weak(),
        );

        // -- execute --
        assert!(!controller.on_response(member, &response(false, Some(1)), &log));
        controller.replicate(&context(&me, &*f.transport), member, &log, false);

        // -- verify --
        let requests = received(&mut f.member_inbound);
        let positions: Vec<u64> = requests
            .iter()
            .map(|r| r.entry.as_ref().unwrap().position().as_u64())
            .collect();
        assert_eq!(positions, vec![2, 3, 4]);
        assert_eq!(requests[0].previous, Some((Term::new(1), Position::new(1))));

        // Rejected with nothing to offer, start over from the beginning.
        controller.on_response(member, &response(false, None), &log);
        assert_eq!(member.previous(), None);
        controller.replicate(&context(&me, &*f.transport), member, &log, false);
        assert_eq!(received(&mut f.member_inbound).len(), 4);
    }

    #[tokio::test]
    async fn success_advances_match_position() {
        let mut f = fixture(10);
        let log = log_with_terms(&[1, 1, 1]);
        let member = f.members.get_mut(&address(2)).unwrap();
        let mut controller = ReplicationController::open(
            logger(),
            member,
            &log,
            Some((Term::new(1), Position::new(3))),
            Duration::from_secs(60),
            1,
            &f.actor_client.weak(),
        );

        assert!(controller.on_response(member, &response(true, Some(2)), &log));
        assert!(!controller.on_response(member, &response(true, Some(1)), &log));
        assert!(!controller.on_response(member, &response(true, None), &log));
        assert_eq!(member.match_position(), Some(Position::new(2)));
        assert!(member.heartbeat_timestamp().is_some());
    }

    #[tokio::test]
    async fn refused_entry_is_retried_first() {
        // -- setup --
        // Queue holds a single frame, the second send is refused.
        let mut f = fixture(1);
        let log = log_with_terms(&[1, 1, 1]);
        let me = address(1);
        let member = f.members.get_mut(&address(2)).unwrap();
        let mut controller = ReplicationController::open(
            logger(),
            member,
            &log,
            None,
            Duration::from_secs(60),
            1,
            &f.actor_client.weak(),
        );

        // -- execute --
        controller.replicate(&context(&me, &*f.transport), member, &log, false);
        let first = received(&mut f.member_inbound);
        controller.replicate(&context(&me, &*f.transport), member, &log, false);
        let second = received(&mut f.member_inbound);
        controller.replicate(&context(&me, &*f.transport), member, &log, false);
        let third = received(&mut f.member_inbound);

        // -- verify --
        let position = |requests: &[AppendRequest]| requests[0].entry.as_ref().unwrap().position().as_u64();
        assert_eq!((first.len(), position(&first)), (1, 1));
        assert_eq!((second.len(), position(&second)), (1, 2));
        assert_eq!((third.len(), position(&third)), (1, 3));
    }

    #[tokio::test]
    async fn resumes_after_old_match_position() {
        let mut f = fixture(10);
        let log = log_with_terms(&[1, 1, 2]);
        let member = f.members.get_mut(&address(2)).unwrap();
        member.advance_match_position(Position::new(2));

        let _controller = ReplicationController::open(
            logger(),
            member,
            &log,
            Some((Term::new(2), Position::new(3))),
            Duration::from_secs(60),
            1,
            &f.actor_client.weak(),
        );

        assert_eq!(member.previous(), Some((Term::new(1), Position::new(2))));
        assert_eq!(member.match_position(), None);
    }
}
