//! This module is a raft-specific layer over the generic commit log: the entry format raft writes,
//! the buffer that batches those writes, a cursor for replication, and the stream of committed
//! entries handed to the application.

mod append_buffer;
mod commit_stream;
mod log_entry;
mod reader;

pub(crate) use append_buffer::AppendOutcome;
pub(crate) use append_buffer::LogAppendBuffer;
pub(crate) use commit_stream::CommitStreamPublisher;
pub(crate) use reader::LogReader;

pub use commit_stream::CommitStream;
pub use commit_stream::CommittedEntry;
pub use log_entry::EntryType;
pub use log_entry::LogEntry;

pub(crate) fn commit_stream() -> (CommitStreamPublisher, CommitStream) {
    commit_stream::new()
}
