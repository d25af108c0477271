use crate::commitlog::Position;
use crate::replica::{LogEntry, PeerAddress, PersistError, PersistentStore, Term};
use crate::transport::{RemoteHandle, Transport};
use chrono::{DateTime, Utc};
use std::sync::Arc;

// Consecutive failed sends before a member is flagged.
pub(crate) const FAILURE_THRESHOLD: u32 = 3;

/// RaftMember is everything this node tracks about one other node of the cluster.
pub(crate) struct RaftMember {
    address: PeerAddress,
    remote: RemoteHandle,
    // > index of highest log entry known to be replicated on server
    // Only meaningful while we are leader.
    match_position: Option<Position>,
    // Replication cursor: the entry the next AppendRequest to this member chains onto.
    previous: Option<(Term, Position)>,
    heartbeat_timestamp: Option<DateTime<Utc>>,
    failures: u32,
    // Entry that could not be sent due to backpressure. Goes out before anything else.
    pending_buffered_entry: Option<LogEntry>,
}

impl RaftMember {
    fn new(address: PeerAddress, remote: RemoteHandle, log_tail: Option<(Term, Position)>) -> Self {
        RaftMember {
            address,
            remote,
            match_position: None,
            previous: log_tail,
            heartbeat_timestamp: None,
            failures: 0,
            pending_buffered_entry: None,
        }
    }

    pub(crate) fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub(crate) fn remote(&self) -> &RemoteHandle {
        &self.remote
    }

    pub(crate) fn match_position(&self) -> Option<Position> {
        self.match_position
    }

    /// Match position only ratchets forward. Returns true if it moved.
    pub(crate) fn advance_match_position(&mut self, position: Position) -> bool {
        if Some(position) > self.match_position {
            self.match_position = Some(position);
            true
        } else {
            false
        }
    }

    /// A new leadership term can't count acknowledgements from an earlier one. The old value is
    /// handed back as a hint for where replication can resume.
    pub(crate) fn take_match_position(&mut self) -> Option<Position> {
        self.match_position.take()
    }

    pub(crate) fn previous(&self) -> Option<(Term, Position)> {
        self.previous
    }

    pub(crate) fn set_previous(&mut self, previous: Option<(Term, Position)>) {
        self.previous = previous;
    }

    pub(crate) fn heartbeat_timestamp(&self) -> Option<DateTime<Utc>> {
        self.heartbeat_timestamp
    }

    pub(crate) fn touch_heartbeat(&mut self) {
        self.heartbeat_timestamp = Some(Utc::now());
    }

    pub(crate) fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub(crate) fn reset_failures(&mut self) {
        self.failures = 0;
    }

    pub(crate) fn has_failures(&self) -> bool {
        self.failures >= FAILURE_THRESHOLD
    }

    pub(crate) fn take_pending_entry(&mut self) -> Option<LogEntry> {
        self.pending_buffered_entry.take()
    }

    pub(crate) fn set_pending_entry(&mut self, entry: LogEntry) {
        self.pending_buffered_entry = Some(entry);
    }
}

/// MemberRegistry knows the other nodes of the cluster, never this node itself, and does the
/// quorum arithmetic. Membership changes are persisted through `PersistentStore`.
pub(crate) struct MemberRegistry {
    logger: slog::Logger,
    me: PeerAddress,
    members: Vec<RaftMember>,
    transport: Arc<dyn Transport>,
}

impl MemberRegistry {
    pub(crate) fn new(logger: slog::Logger, me: PeerAddress, transport: Arc<dyn Transport>) -> Self {
        MemberRegistry {
            logger,
            me,
            members: vec![],
            transport,
        }
    }

    /// Rebuild from persisted membership, e.g. on startup. Nothing is written.
    pub(crate) fn restore(&mut self, persisted: &[PeerAddress], log_tail: Option<(Term, Position)>) {
        self.members.clear();
        for address in persisted {
            self.track(address, log_tail);
        }
    }

    /// Returns false if `address` is this node or already known.
    pub(crate) fn add_member(
        &mut self,
        address: &PeerAddress,
        store: &mut PersistentStore,
        log_tail: Option<(Term, Position)>,
    ) -> Result<bool, PersistError> {
        if !self.track(address, log_tail) {
            return Ok(false);
        }
        slog::info!(self.logger, "Added member {:?}", address);

        store.add_member(address.clone()).save()?;
        Ok(true)
    }

    /// Replace all members with `addresses`, kept in the order given. The persisted membership
    /// is replaced as well, and unlike the registry it includes this node.
    pub(crate) fn replace_members(
        &mut self,
        addresses: &[PeerAddress],
        store: &mut PersistentStore,
        log_tail: Option<(Term, Position)>,
    ) -> Result<(), PersistError> {
        self.members.clear();
        store.clear_members();
        for address in addresses {
            self.track(address, log_tail);
            store.add_member(address.clone());
        }
        slog::info!(self.logger, "Replaced members with {:?}", addresses);

        store.save()
    }

    fn track(&mut self, address: &PeerAddress, log_tail: Option<(Term, Position)>) -> bool {
        if *address == self.me || self.get(address).is_some() {
            return false;
        }

        let remote = self.transport.register_remote_address(address);
        self.members.push(RaftMember::new(address.clone(), remote, log_tail));
        true
    }

    /// Number of affirmative votes, counting this node's own, needed to win an election or
    /// commit an entry.
    pub(crate) fn required_quorum(&self) -> usize {
        (self.members.len() + 1) / 2 + 1
    }

    pub(crate) fn size(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn list(&self) -> Vec<PeerAddress> {
        self.members.iter().map(|m| m.address.clone()).collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &RaftMember> {
        self.members.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut RaftMember> {
        self.members.iter_mut()
    }

    pub(crate) fn get(&self, address: &PeerAddress) -> Option<&RaftMember> {
        self.members.iter().find(|m| m.address == *address)
    }

    pub(crate) fn get_mut(&mut self, address: &PeerAddress) -> Option<&mut RaftMember> {
        self.members.iter_mut().find(|m| m.address == *address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalNetwork;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn address(port: u16) -> PeerAddress {
        PeerAddress::new("localhost", port)
    }

    fn registry() -> MemberRegistry {
        let (transport, _inbound) = LocalNetwork::new(1).bind(address(1));
        MemberRegistry::new(logger(), address(1), Arc::new(transport))
    }

    #[test]
    fn required_quorum() {
        fn run(expected: usize, other_members: u16) {
            let mut registry = registry();
            let mut store = PersistentStore::volatile(logger());
            for port in 0..other_members {
                registry.add_member(&address(100 + port), &mut store, None).unwrap();
            }
            assert_eq!(registry.required_quorum(), expected, "other members: {}", other_members);
        }

        run(1, 0);
        run(2, 1);
        run(2, 2);
        run(3, 3);
        run(3, 4);
        run(4, 5);
    }

    #[test]
    fn add_member_skips_self_and_duplicates() {
        let mut registry = registry();
        let mut store = PersistentStore::volatile(logger());

        assert!(!registry.add_member(&address(1), &mut store, None).unwrap());
        assert!(registry.add_member(&address(2), &mut store, None).unwrap());
        assert!(!registry.add_member(&address(2), &mut store, None).unwrap());

        assert_eq!(registry.list(), vec![address(2)]);
        assert_eq!(store.members(), &[address(2)]);
    }

    #[test]
    fn new_member_cursor_starts_at_log_tail() {
        let mut registry = registry();
        let mut store = PersistentStore::volatile(logger());
        let tail = Some((Term::new(2), Position::new(7)));

        registry.add_member(&address(2), &mut store, tail).unwrap();

        let member = registry.get(&address(2)).unwrap();
        assert_eq!(member.previous(), tail);
        assert_eq!(member.match_position(), None);
        assert!(!member.has_failures());
    }

    #[test]
    fn replace_members_keeps_order_and_persists_self() {
        let mut registry = registry();
        let mut store = PersistentStore::volatile(logger());
        registry.add_member(&address(9), &mut store, None).unwrap();

        registry
            .replace_members(&[address(3), address(1), address(2)], &mut store, None)
            .unwrap();

        assert_eq!(registry.list(), vec![address(3), address(2)]);
        assert_eq!(store.members(), &[address(3), address(1), address(2)]);
    }

    #[test]
    fn match_position_is_monotonic() {
        let mut registry = registry();
        let mut store = PersistentStore::volatile(logger());
        registry.add_member(&address(2), &mut store, None).unwrap();
        let member = registry.get_mut(&address(2)).unwrap();

        assert!(member.advance_match_position(Position::new(5)));
        assert!(!member.advance_match_position(Position::new(3)));
        assert_eq!(member.match_position(), Some(Position::new(5)));

        assert_eq!(member.take_match_position(), Some(Position::new(5)));
        assert_eq!(member.match_position(), None);
    }

    #[test]
    fn repeated_failures_flag_member() {
        let mut registry = registry();
        let mut store = PersistentStore::volatile(logger());
        registry.add_member(&address(2), &mut store, None).unwrap();
        let member = registry.get_mut(&address(2)).unwrap();

        for _ in 0..FAILURE_THRESHOLD {
            assert!(!member.has_failures());
            member.record_failure();
        }
        assert!(member.has_failures());

        member.reset_failures();
        assert!(!member.has_failures());
        assert_eq!(registry.size(), 1);
    }
}
