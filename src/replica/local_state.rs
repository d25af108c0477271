use crate::protocol::{self, DecodeError};
use crate::replica::peers::PeerAddress;
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn next(&self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The slice of node state that raft requires to survive restarts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PersistentState {
    pub term: Term,
    pub voted_for: Option<PeerAddress>,
    pub members: Vec<PeerAddress>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("interrupted while waiting for local state to become durable")]
    Interrupted,
    #[error("corrupt local state: {0}")]
    Corrupt(#[from] DecodeError),
    #[error("local state I/O failure: {0}")]
    Io(io::Error),
}

impl From<io::Error> for PersistError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::Interrupted {
            PersistError::Interrupted
        } else {
            PersistError::Io(e)
        }
    }
}

/// StoreBackend is where `PersistentStore` makes its state durable.
pub trait StoreBackend: Send + 'static {
    fn load(&mut self) -> Result<Option<PersistentState>, PersistError>;

    /// Must not return until `state` is durable.
    fn persist(&mut self, state: &PersistentState) -> Result<(), PersistError>;
}

/// Keeps "durable" state in RAM. State survives node restarts within one process only, when the
/// backend is reused.
#[derive(Default)]
pub struct VolatileBackend {
    saved: Option<PersistentState>,
}

impl VolatileBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for VolatileBackend {
    fn load(&mut self) -> Result<Option<PersistentState>, PersistError> {
        Ok(self.saved.clone())
    }

    fn persist(&mut self, state: &PersistentState) -> Result<(), PersistError> {
        self.saved.replace(state.clone());
        Ok(())
    }
}

/// Byte representation of the state file:
///
/// ```text
/// +---+-----------+---+---------------+-------+------------------...
/// |Vrs| Term (8)  |Vtd| Voted for ... | Count | Members ...
/// +---+-----------+---+---------------+-------+------------------...
/// ```
///
/// * `Vtd` - 1 if a `Voted for` address follows, else 0
/// * addresses are `host len (u16) | host | port (u16)`
///
/// Writes go to a sibling temp file which is fsync'd and renamed over the state file.
pub struct FileBackend {
    path: PathBuf,
}

const STATE_FILE_FORMAT_VERSION: u8 = 1;

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileBackend { path: path.into() }
    }

    fn encode(state: &PersistentState) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(STATE_FILE_FORMAT_VERSION);
        buf.put_u64_le(state.term.as_u64());
        match &state.voted_for {
            Some(address) => {
                buf.put_u8(1);
                protocol::put_address(&mut buf, address);
            }
            None => buf.put_u8(0),
        }
        protocol::put_addresses(&mut buf, &state.members);
        buf
    }

    fn decode(mut buf: &[u8]) -> Result<PersistentState, DecodeError> {
        let version = protocol::get_u8(&mut buf)?;
        if version != STATE_FILE_FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let term = protocol::get_term(&mut buf)?;
        let voted_for = match protocol::get_u8(&mut buf)? {
            0 => None,
            _ => Some(protocol::get_address(&mut buf)?),
        };
        let members = protocol::get_addresses(&mut buf)?;

        Ok(PersistentState {
            term,
            voted_for,
            members,
        })
    }
}

impl StoreBackend for FileBackend {
    fn load(&mut self) -> Result<Option<PersistentState>, PersistError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(Self::decode(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&mut self, state: &PersistentState) -> Result<(), PersistError> {
        let tmp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&Self::encode(state))?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// PersistentStore is used whenever raft requires that something is persisted to guarantee
/// safety: current term, vote, and cluster membership.
///
/// Mutations are buffered in memory and chainable. `save()` is the only durability boundary, and
/// it blocks the caller until the backend reports the state durable.
pub struct PersistentStore {
    logger: slog::Logger,
    state: PersistentState,
    backend: Box<dyn StoreBackend>,
    dirty: bool,
}

impl PersistentStore {
    pub fn open(logger: slog::Logger, mut backend: impl StoreBackend) -> Result<Self, PersistError> {
        let state = backend.load()?.unwrap_or_default();
        slog::info!(logger, "Loaded local state: {:?}", state);

        Ok(PersistentStore {
            logger,
            state,
            backend: Box::new(backend),
            dirty: false,
        })
    }

    pub fn volatile(logger: slog::Logger) -> Self {
        PersistentStore {
            logger,
            state: PersistentState::default(),
            backend: Box::new(VolatileBackend::new()),
            dirty: false,
        }
    }

    pub fn term(&self) -> Term {
        self.state.term
    }

    /// Set current term to `term` iff it is larger than current term. Moving to a new term
    /// forgets the vote of the old one.
    pub fn set_term(&mut self, term: Term) -> &mut Self {
        if term <= self.state.term {
            slog::warn!(
                self.logger,
                "Ignoring term {:?}, not larger than current term {:?}",
                term,
                self.state.term
            );
            return self;
        }

        self.state.term = term;
        self.state.voted_for = None;
        self.dirty = true;
        self
    }

    pub fn voted_for(&self) -> Option<&PeerAddress> {
        self.state.voted_for.as_ref()
    }

    pub fn set_voted_for(&mut self, voted_for: Option<PeerAddress>) -> &mut Self {
        if self.state.voted_for != voted_for {
            self.state.voted_for = voted_for;
            self.dirty = true;
        }
        self
    }

    pub fn members(&self) -> &[PeerAddress] {
        &self.state.members
    }

    pub fn add_member(&mut self, member: PeerAddress) -> &mut Self {
        if !self.state.members.contains(&member) {
            self.state.members.push(member);
            self.dirty = true;
        }
        self
    }

    pub fn clear_members(&mut self) -> &mut Self {
        if !self.state.members.is_empty() {
            self.state.members.clear();
            self.dirty = true;
        }
        self
    }

    /// Blocks until all buffered mutations are durable. A failed save keeps the mutations
    /// buffered, so the next `save()` retries them.
    pub fn save(&mut self) -> Result<(), PersistError> {
        if !self.dirty {
            return Ok(());
        }

        match self.backend.persist(&self.state) {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(PersistError::Interrupted) => {
                slog::warn!(self.logger, "Interrupted while saving local state. Will retry on next save.");
                Err(PersistError::Interrupted)
            }
            Err(e) => {
                slog::error!(self.logger, "Failed to save local state: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn peer(port: u16) -> PeerAddress {
        PeerAddress::new("localhost", port)
    }

    #[test]
    fn set_term_never_decreases() {
        let mut store = PersistentStore::volatile(logger());
        store.set_term(Term::new(5)).set_voted_for(Some(peer(1)));

        store.set_term(Term::new(5));
        assert_eq!(store.term(), Term::new(5));
        assert_eq!(store.voted_for(), Some(&peer(1)));

        store.set_term(Term::new(3));
        assert_eq!(store.term(), Term::new(5));
        assert_eq!(store.voted_for(), Some(&peer(1)));
    }

    #[test]
    fn set_term_clears_vote() {
        let mut store = PersistentStore::volatile(logger());
        store.set_term(Term::new(1)).set_voted_for(Some(peer(1)));

        store.set_term(Term::new(2));

        assert_eq!(store.term(), Term::new(2));
        assert_eq!(store.voted_for(), None);
    }

    #[test]
    fn members_are_deduplicated() {
        let mut store = PersistentStore::volatile(logger());
        store.add_member(peer(1)).add_member(peer(2)).add_member(peer(1));
        assert_eq!(store.members(), &[peer(1), peer(2)]);

        store.clear_members();
        assert!(store.members().is_empty());
    }

    /// Shares its saved state with the test, and fails on demand.
    #[derive(Clone, Default)]
    struct RecordingBackend {
        saved: Arc<Mutex<Vec<PersistentState>>>,
        fail_with_interrupt: Arc<AtomicUsize>,
    }

    impl StoreBackend for RecordingBackend {
        fn load(&mut self) -> Result<Option<PersistentState>, PersistError> {
            Ok(self.saved.lock().unwrap().last().cloned())
        }

        fn persist(&mut self, state: &PersistentState) -> Result<(), PersistError> {
            if self.fail_with_interrupt.load(Ordering::SeqCst) > 0 {
                self.fail_with_interrupt.fetch_sub(1, Ordering::SeqCst);
                return Err(io::Error::from(io::ErrorKind::Interrupted).into());
            }
            self.saved.lock().unwrap().push(state.clone());
            Ok(())
        }
    }

    #[test]
    fn save_only_when_dirty_and_retry_after_interrupt() {
        let backend = RecordingBackend::default();
        let mut store = PersistentStore::open(logger(), backend.clone()).unwrap();

        store.save().unwrap();
        assert!(backend.saved.lock().unwrap().is_empty());

        backend.fail_with_interrupt.store(1, Ordering::SeqCst);
        store.set_term(Term::new(2));
        assert!(matches!(store.save(), Err(PersistError::Interrupted)));
        assert!(backend.saved.lock().unwrap().is_empty());

        store.save().unwrap();
        let saved = backend.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].term, Term::new(2));
    }

    #[test]
    fn file_backend_survives_reopen() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "partition-raft-state-{}-{}-{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.f"),
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));

        {
            let mut store = PersistentStore::open(logger(), FileBackend::new(path.clone())).unwrap();
            assert_eq!(store.term(), Term::new(0));
            store
                .set_term(Term::new(7))
                .set_voted_for(Some(peer(2)))
                .add_member(peer(1))
                .add_member(peer(2));
            store.save().unwrap();
        }

        let store = PersistentStore::open(logger(), FileBackend::new(path.clone())).unwrap();
        assert_eq!(store.term(), Term::new(7));
        assert_eq!(store.voted_for(), Some(&peer(2)));
        assert_eq!(store.members(), &[peer(1), peer(2)]);

        let _ = fs::remove_file(path);
    }
}
