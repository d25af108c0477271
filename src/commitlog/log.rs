use std::{fmt, io};

/// Position identifies an entry in a partition's log; i.e. a log entry's position.
///
/// Positions start from 1. There is never an entry at 0, which lets the wire and entry formats
/// use 0 to encode "no entry".
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Position(u64);

impl Position {
    pub fn new(position: u64) -> Self {
        assert_ne!(position, 0);
        Position(position)
    }

    pub fn start_position() -> Self {
        Position(1)
    }

    /// Decode a position from its on-wire representation where 0 means "no entry".
    pub fn from_wire(value: u64) -> Option<Self> {
        if value == 0 {
            None
        } else {
            Some(Position(value))
        }
    }

    pub fn to_wire(position: Option<Position>) -> u64 {
        position.map(|p| p.0).unwrap_or(0)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, delta: u64) -> Position {
        Position(self.0 + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Position> {
        self.0.checked_sub(delta).and_then(Position::from_wire)
    }

    /// The position right after `position`, or the start position when the log is empty.
    pub fn next_after(position: Option<Position>) -> Position {
        position.map(|p| p.plus(1)).unwrap_or_else(Position::start_position)
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// This node is not the current writer of the log.
    #[error("log writer is closed")]
    WriterClosed,
    #[error("block does not extend the log: expected position {expected}, got {actual}")]
    NonContiguous { expected: Position, actual: Position },
    #[error("malformed block: {0}")]
    Malformed(String),
    #[error("log I/O failure")]
    Io(#[from] io::Error),
}

/// Log is the append only storage engine underneath a raft partition.
///
/// Writes happen in blocks. A block is one or more encoded entries laid out back to back, and a
/// block is appended atomically: either every entry in it becomes readable, or none does.
pub trait Log<E: Entry>: Send + 'static {
    /// append() writes a block and returns the position of the last entry in the block.
    fn append(&mut self, block: &[u8]) -> Result<Position, StorageError>;

    /// Read log entry at specified position.
    fn read(&self, position: Position) -> Result<Option<E>, StorageError>;

    fn first_position(&self) -> Option<Position>;

    fn last_position(&self) -> Option<Position>;

    /// Deletes the entry at `position` and everything after it.
    fn truncate(&mut self, position: Position) -> Result<(), StorageError>;

    fn commit_position(&self) -> Option<Position>;

    fn set_commit_position(&mut self, position: Position);
}

pub trait Entry: Clone + Send + 'static {
    type Error: fmt::Display;

    fn position(&self) -> Position;

    /// Decode one entry from the front of `buf`, advancing it past the entry.
    fn decode_frame(buf: &mut &[u8]) -> Result<Self, Self::Error>;
}
