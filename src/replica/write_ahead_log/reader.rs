use crate::commitlog::{Log, Position, StorageError};
use crate::replica::LogEntry;

/// LogReader is a cursor over a `Log`. It does not borrow the log; every call is handed the log
/// it reads from, so a reader can live next to the writer inside the same actor.
#[derive(Debug, Clone)]
pub(crate) struct LogReader {
    next: Position,
}

impl LogReader {
    pub(crate) fn new() -> Self {
        LogReader {
            next: Position::start_position(),
        }
    }

    /// Position the reader so that `next()` returns the entry at `position`. Seeking past the end
    /// is allowed; the reader then picks up entries once they are appended. Returns whether the
    /// entry currently exists.
    pub(crate) fn seek<L: Log<LogEntry>>(&mut self, log: &L, position: Position) -> bool {
        self.next = position;
        match (log.first_position(), log.last_position()) {
            (Some(first), Some(last)) => first <= position && position <= last,
            _ => false,
        }
    }

    pub(crate) fn has_next<L: Log<LogEntry>>(&self, log: &L) -> bool {
        log.last_position().map(|last| self.next <= last).unwrap_or(false)
    }

    pub(crate) fn next<L: Log<LogEntry>>(&mut self, log: &L) -> Result<Option<LogEntry>, StorageError> {
        let entry = log.read(self.next)?;
        if entry.is_some() {
            self.next = self.next.plus(1);
        }
        Ok(entry)
    }
}
