use crate::commitlog::{Log, Position};
use crate::replica::{EntryType, LogEntry, Term};
use bytes::Bytes;
use std::cmp;
use tokio::sync::mpsc;

pub(crate) struct CommitStreamPublisher {
    sender: mpsc::UnboundedSender<CommittedEntry>,
    // Last position handed to the stream. Every entry up to here was committed and durable.
    last_published: Option<Position>,
}

/// CommitStream yields committed application entries in log order.
pub struct CommitStream {
    receiver: mpsc::UnboundedReceiver<CommittedEntry>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommittedEntry {
    pub term: Term,
    pub position: Position,
    pub data: Bytes,
}

pub(crate) fn new() -> (CommitStreamPublisher, CommitStream) {
    let (tx, rx) = mpsc::unbounded_channel();

    let publisher = CommitStreamPublisher {
        sender: tx,
        last_published: None,
    };
    let stream = CommitStream { receiver: rx };

    (publisher, stream)
}

impl CommitStreamPublisher {
    /// Publish every entry that is both committed and durably written locally, and that hasn't
    /// been published yet. Only `Event` entries reach the stream; raft's own entries are skipped.
    pub(crate) fn publish_committed<L: Log<LogEntry>>(&mut self, logger: &slog::Logger, log: &L) {
        let upper = match (log.commit_position(), log.last_position()) {
            (Some(commit), Some(last)) => cmp::min(commit, last),
            _ => return,
        };

        while self.last_published < Some(upper) {
            let position = Position::next_after(self.last_published);
            let entry = match log.read(position) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    slog::warn!(logger, "Committed entry {:?} is missing from the log", position);
                    return;
                }
                Err(e) => {
                    slog::warn!(logger, "Failed to read committed entry {:?}: {}", position, e);
                    return;
                }
            };

            if entry.entry_type() == EntryType::Event {
                self.notify_commit(logger, entry);
            }
            self.last_published = Some(position);
        }
    }

    fn notify_commit(&self, logger: &slog::Logger, entry: LogEntry) {
        let committed_entry = CommittedEntry {
            term: entry.term(),
            position: entry.position(),
            data: entry.data().clone(),
        };

        if self.sender.send(committed_entry).is_err() {
            slog::debug!(logger, "CommitStream has disconnected.");
        }
    }
}

impl CommitStream {
    /// Returns None once the node has shut down and every committed entry was received.
    pub async fn recv(&mut self) -> Option<CommittedEntry> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::InMemoryLog;
    use bytes::BytesMut;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn append(log: &mut InMemoryLog<LogEntry>, entries: &[(u64, EntryType, &'static [u8])]) {
        let mut block = BytesMut::new();
        let mut position = Position::next_after(log.last_position());
        for (term, entry_type, data) in entries {
            LogEntry::new(position, Term::new(*term), *entry_type, Bytes::from_static(data)).encode(&mut block);
            position = position.plus(1);
        }
        log.append(&block).unwrap();
    }

    #[tokio::test]
    async fn publishes_committed_events_in_order() {
        let (mut publisher, mut stream) = new();
        let mut log = InMemoryLog::create();
        append(
            &mut log,
            &[
                (1, EntryType::Initialize, b""),
                (1, EntryType::Event, b"a"),
                (1, EntryType::Event, b"b"),
            ],
        );

        // Nothing committed yet
        publisher.publish_committed(&logger(), &log);

        log.set_commit_position(Position::new(2));
        publisher.publish_committed(&logger(), &log);
        // Publishing again is a no-op
        publisher.publish_committed(&logger(), &log);

        log.set_commit_position(Position::new(3));
        publisher.publish_committed(&logger(), &log);
        drop(publisher);

        let first = stream.recv().await.unwrap();
        assert_eq!(first.position, Position::new(2));
        assert_eq!(first.data, Bytes::from_static(b"a"));
        let second = stream.recv().await.unwrap();
        assert_eq!(second.position, Position::new(3));
        assert_eq!(second.term, Term::new(1));
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn commit_beyond_local_log_waits_for_entries() {
        let (mut publisher, mut stream) = new();
        let mut log = InMemoryLog::create();
        append(&mut log, &[(1, EntryType::Event, b"a")]);
        log.set_commit_position(Position::new(3));

        publisher.publish_committed(&logger(), &log);
        append(&mut log, &[(1, EntryType::Event, b"b")]);
        publisher.publish_committed(&logger(), &log);
        drop(publisher);

        assert_eq!(stream.recv().await.unwrap().position, Position::new(1));
        assert_eq!(stream.recv().await.unwrap().position, Position::new(2));
        assert_eq!(stream.recv().await, None);
    }
}
