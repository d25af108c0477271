use crate::commitlog::{Log, Position, StorageError};
use crate::protocol::AppendRequest;
use crate::replica::{EntryType, LogEntry, PeerAddress, Term};
use bytes::{Bytes, BytesMut};
use std::cmp;

/// What a follower tells the leader after an append attempt.
#[derive(Debug, PartialEq)]
pub(crate) struct AppendOutcome {
    pub(crate) succeeded: bool,
    // Success: durably written position the follower agrees on with the leader.
    // Failure: position the follower offers for the leader to retry from.
    pub(crate) position: Option<Position>,
    // Member list of an accepted configuration entry.
    pub(crate) configuration: Option<Vec<PeerAddress>>,
    pub(crate) commit_advanced: bool,
}

/// LogAppendBuffer coalesces log entries into one physical write to the log.
///
/// Note: An entry has 2 local states here:
/// 1. Buffered - accepted and chained onto the tail, only present in `buffer`
/// 2. Written - flushed to the log in a block, readable by replication
///
/// The buffered tail always extends the written tail contiguously.
pub(crate) struct LogAppendBuffer<L: Log<LogEntry>> {
    logger: slog::Logger,
    log: L,
    buffer: BytesMut,
    capacity: usize,
    last_written: Option<(Term, Position)>,
    last_buffered: Option<(Term, Position)>,
    // Open while this node is leader and writes its own entries. Truncation is not allowed then.
    writer_open: bool,
}

impl<L: Log<LogEntry>> LogAppendBuffer<L> {
    pub(crate) fn new(logger: slog::Logger, log: L, capacity: usize) -> Self {
        let mut append_buffer = LogAppendBuffer {
            logger,
            log,
            buffer: BytesMut::with_capacity(capacity),
            capacity,
            last_written: None,
            last_buffered: None,
            writer_open: false,
        };
        append_buffer.reset();

        append_buffer
    }

    pub(crate) fn log(&self) -> &L {
        &self.log
    }

    pub(crate) fn last_written(&self) -> Option<(Term, Position)> {
        self.last_written
    }

    pub(crate) fn last_written_position(&self) -> Option<Position> {
        self.last_written.map(|(_, p)| p)
    }

    pub(crate) fn last_buffered(&self) -> Option<(Term, Position)> {
        self.last_buffered
    }

    fn last_buffered_position(&self) -> Option<Position> {
        self.last_buffered.map(|(_, p)| p)
    }

    pub(crate) fn commit_position(&self) -> Option<Position> {
        self.log.commit_position()
    }

    /// Returns true if the commit position moved forward.
    pub(crate) fn advance_commit_position(&mut self, position: Position) -> bool {
        if Some(position) > self.log.commit_position() {
            self.log.set_commit_position(position);
            true
        } else {
            false
        }
    }

    pub(crate) fn set_writer_open(&mut self, open: bool) {
        self.writer_open = open;
    }

    /// Re-derive the tail from what the log actually holds. Anything still buffered is dropped,
    /// so callers flush first if they care about it.
    pub(crate) fn reset(&mut self) {
        if !self.buffer.is_empty() {
            slog::warn!(self.logger, "Dropping {} unflushed bytes on reset", self.buffer.len());
        }
        self.buffer.clear();
        self.writer_open = false;

        let last = match self.log.last_position() {
            Some(position) => match self.log.read(position) {
                Ok(Some(entry)) => Some(entry.id()),
                Ok(None) => {
                    slog::error!(self.logger, "Log reports last position {} but has no entry there. Wtf!", position);
                    None
                }
                Err(e) => {
                    slog::error!(self.logger, "Failed to read last log entry at {}: {}", position, e);
                    None
                }
            },
            None => None,
        };
        self.last_written = last;
        self.last_buffered = last;
    }

    /// Writes the buffer to the log as one block. Failure leaves the buffer intact so the next
    /// flush retries it.
    pub(crate) fn flush_buffered_events(&mut self) -> bool {
        match self.try_flush() {
            Ok(()) => true,
            Err(e) => {
                slog::warn!(self.logger, "Failed to flush buffered entries: {}", e);
                false
            }
        }
    }

    fn try_flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let written = self.log.append(&self.buffer)?;
        debug_assert_eq!(Some(written), self.last_buffered_position());
        self.last_written = self.last_buffered;
        self.buffer.clear();

        Ok(())
    }

    fn buffer_entry(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        let len = entry.encoded_len();
        if self.buffer.len() + len > self.capacity {
            self.try_flush()?;
            if len > self.capacity {
                slog::debug!(self.logger, "Growing append buffer from {} to {} bytes", self.capacity, len);
                self.capacity = len;
            }
        }

        self.buffer.reserve(len);
        entry.encode(&mut self.buffer);
        self.last_buffered = Some(entry.id());

        Ok(())
    }

    /// Leader path: chain a new entry of our own onto the tail.
    pub(crate) fn append_local(&mut self, term: Term, entry_type: EntryType, data: Bytes) -> Result<Position, StorageError> {
        if !self.writer_open {
            return Err(StorageError::WriterClosed);
        }

        let position = Position::next_after(self.last_buffered_position());
        self.buffer_entry(&LogEntry::new(position, term, entry_type, data))?;

        Ok(position)
    }

    /// Follower path: apply an AppendRequest whose previous entry is our buffered tail, or a
    /// heartbeat (`entry` is None).
    pub(crate) fn append_event(&mut self, request: &AppendRequest, entry: Option<&LogEntry>) -> AppendOutcome {
        let entry = match entry {
            Some(entry) => entry,
            None => return self.check_heartbeat(request),
        };

        if request.previous != self.last_buffered {
            slog::warn!(
                self.logger,
                "Dropping entry {:?}, its previous entry {:?} doesn't match our tail {:?}",
                entry.position,
                request.previous,
                self.last_buffered
            );
            return self.reject(self.last_written_position());
        }
        let previous_term = request.previous.map(|(t, _)| t).unwrap_or_default();
        if entry.position != Position::next_after(self.last_buffered_position()) || entry.term < previous_term {
            slog::warn!(
                self.logger,
                "Dropping entry ({:?}, {:?}), it doesn't extend our tail {:?}",
                entry.term,
                entry.position,
                self.last_buffered
            );
            return self.reject(self.last_written_position());
        }

        if let Err(e) = self.buffer_entry(entry) {
            slog::warn!(self.logger, "Could not make room for entry {:?}: {}", entry.position, e);
            return self.reject(self.last_buffered_position());
        }

        let configuration = match entry.entry_type {
            EntryType::Configuration => match entry.members() {
                Ok(members) => Some(members),
                Err(e) => {
                    slog::error!(self.logger, "Unreadable configuration entry at {:?}: {}", entry.position, e);
                    None
                }
            },
            _ => None,
        };

        let mut outcome = self.accept(request, Some(entry.position));
        outcome.configuration = configuration;
        outcome
    }

    fn check_heartbeat(&mut self, request: &AppendRequest) -> AppendOutcome {
        let (term, position) = match request.previous {
            Some(previous) => previous,
            // An empty prefix is a prefix of every log.
            None => return self.accept(request, None),
        };

        match self.term_at(position) {
            Ok(Some(local_term)) if local_term == term => self.accept(request, Some(position)),
            Ok(Some(local_term)) => {
                slog::info!(
                    self.logger,
                    "Leader's previous entry at {:?} has term {:?}, ours has {:?}",
                    position,
                    term,
                    local_term
                );
                self.reject(position.checked_minus(1))
            }
            Ok(None) => self.reject(self.last_written_position()),
            Err(e) => {
                slog::warn!(self.logger, "Failed to read entry at {:?}: {}", position, e);
                self.reject(self.last_written_position())
            }
        }
    }

    /// Used when the leader's previous entry is not our buffered tail. Either our log has a
    /// conflicting suffix which gets truncated, or the leader has to probe further back.
    pub(crate) fn truncate_log(&mut self, request: &AppendRequest, entry: &LogEntry) -> AppendOutcome {
        let previous_position = request.previous.map(|(_, p)| p);

        if previous_position > self.last_buffered_position() {
            slog::info!(
                self.logger,
                "Leader's previous entry {:?} is beyond our tail {:?}",
                request.previous,
                self.last_buffered
            );
            return self.reject(self.last_written_position());
        }
        if self.writer_open {
            slog::warn!(self.logger, "Refusing to truncate while our log writer is open");
            return self.reject(self.last_written_position());
        }
        if let Some(commit_position) = self.log.commit_position() {
            if previous_position < Some(commit_position) {
                slog::warn!(
                    self.logger,
                    "Refusing to truncate at {:?}, below commit position {:?}",
                    previous_position,
                    commit_position
                );
                return self.reject(Some(commit_position));
            }
        }
        if entry.position != Position::next_after(previous_position) {
            slog::warn!(
                self.logger,
                "Entry {:?} does not follow its previous entry {:?}",
                entry.position,
                request.previous
            );
            return self.reject(self.last_written_position());
        }
        // Everything below must be in the log so it can be located and truncated.
        if !self.flush_buffered_events() {
            return self.reject(self.last_written_position());
        }

        if let Some((term, position)) = request.previous {
            match self.log.read(position) {
                Ok(Some(existing)) if existing.term == term => {}
                Ok(Some(existing)) => {
                    slog::info!(
                        self.logger,
                        "Conflict at {:?}: leader has term {:?}, we have {:?}",
                        position,
                        term,
                        existing.term
                    );
                    return self.reject(position.checked_minus(1));
                }
                Ok(None) => return self.reject(self.last_written_position()),
                Err(e) => {
                    slog::warn!(self.logger, "Failed to read entry at {:?}: {}", position, e);
                    return self.reject(self.last_written_position());
                }
            }
        }

        match self.log.read(entry.position) {
            Ok(Some(existing)) if existing == *entry => {
                slog::debug!(self.logger, "Already have entry {:?}", entry.position);
                return self.accept(request, Some(entry.position));
            }
            Ok(_) => {}
            Err(e) => {
                slog::warn!(self.logger, "Failed to read entry at {:?}: {}", entry.position, e);
                return self.reject(self.last_written_position());
            }
        }

        if let Err(e) = self.log.truncate(entry.position) {
            slog::warn!(self.logger, "Failed to truncate log at {:?}: {}", entry.position, e);
            return self.reject(self.last_written_position());
        }
        slog::info!(self.logger, "Truncated log from position {:?}", entry.position);
        self.last_written = request.previous;
        self.last_buffered = request.previous;

        self.append_event(request, Some(entry))
    }

    fn term_at(&self, position: Position) -> Result<Option<Term>, StorageError> {
        if let Some((term, last)) = self.last_buffered {
            if last == position {
                return Ok(Some(term));
            }
        }
        if Some(position) <= self.last_written_position() {
            return Ok(self.log.read(position)?.map(|e| e.term));
        }

        // Only buffered so far, look through the buffer.
        let mut buf = &self.buffer[..];
        while !buf.is_empty() {
            let entry = LogEntry::decode(&mut buf).map_err(|e| StorageError::Malformed(e.to_string()))?;
            if entry.position == position {
                return Ok(Some(entry.term));
            }
        }
        Ok(None)
    }

    fn accept(&mut self, request: &AppendRequest, accepted: Option<Position>) -> AppendOutcome {
        let mut commit_advanced = false;
        if let (Some(commit), Some(accepted)) = (request.commit_position, accepted) {
            commit_advanced = self.advance_commit_position(cmp::min(commit, accepted));
        }

        AppendOutcome {
            succeeded: true,
            // Only vouch for what is durable and known to agree with the leader.
            position: cmp::min(self.last_written_position(), accepted),
            configuration: None,
            commit_advanced,
        }
    }

    fn reject(&self, offer: Option<Position>) -> AppendOutcome {
        AppendOutcome {
            succeeded: false,
            position: offer,
            configuration: None,
            commit_advanced: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn log_mut(&mut self) -> &mut L {
        &mut self.log
    }
}
