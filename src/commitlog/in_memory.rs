use crate::commitlog::{Entry, Log, Position, StorageError};

// Durability is modeled, not provided. Good enough for tests and for running a cluster inside
// one process.
pub struct InMemoryLog<E: Entry> {
    entries: Vec<E>,
    commit_position: Option<Position>,
    writable: bool,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Self {
        InMemoryLog {
            entries: vec![],
            commit_position: None,
            writable: true,
        }
    }

    /// A closed log rejects appends with `StorageError::WriterClosed`, like a storage engine
    /// would when another node took over as the authoritative writer.
    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    fn vec_index(position: Position) -> usize {
        // Entries are contiguous from the start position.
        (position.as_u64() - 1) as usize
    }

    fn next_position(&self) -> Position {
        Position::next_after(self.last_position())
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, block: &[u8]) -> Result<Position, StorageError> {
        if !self.writable {
            return Err(StorageError::WriterClosed);
        }

        let mut remaining = block;
        let mut expected = self.next_position();
        let mut decoded = Vec::new();
        while !remaining.is_empty() {
            let entry = E::decode_frame(&mut remaining).map_err(|e| StorageError::Malformed(e.to_string()))?;
            if entry.position() != expected {
                return Err(StorageError::NonContiguous {
                    expected,
                    actual: entry.position(),
                });
            }
            expected = expected.plus(1);
            decoded.push(entry);
        }

        let last = match decoded.last() {
            Some(entry) => entry.position(),
            None => return Err(StorageError::Malformed("empty block".to_string())),
        };
        self.entries.extend(decoded);

        Ok(last)
    }

    fn read(&self, position: Position) -> Result<Option<E>, StorageError> {
        Ok(self.entries.get(Self::vec_index(position)).cloned())
    }

    fn first_position(&self) -> Option<Position> {
        self.entries.first().map(|e| e.position())
    }

    fn last_position(&self) -> Option<Position> {
        self.entries.last().map(|e| e.position())
    }

    fn truncate(&mut self, position: Position) -> Result<(), StorageError> {
        if !self.writable {
            return Err(StorageError::WriterClosed);
        }
        self.entries.truncate(Self::vec_index(position));
        Ok(())
    }

    fn commit_position(&self) -> Option<Position> {
        self.commit_position
    }

    fn set_commit_position(&mut self, position: Position) {
        self.commit_position = Some(position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal frame: 8 byte little endian position, then 1 byte of data.
    #[derive(Clone, Debug, PartialEq)]
    struct TestEntry(u64, u8);

    impl Entry for TestEntry {
        type Error = &'static str;

        fn position(&self) -> Position {
            Position::new(self.0)
        }

        fn decode_frame(buf: &mut &[u8]) -> Result<Self, Self::Error> {
            if buf.len() < 9 {
                return Err("short frame");
            }
            let mut position = [0u8; 8];
            position.copy_from_slice(&buf[..8]);
            let entry = TestEntry(u64::from_le_bytes(position), buf[8]);
            *buf = &buf[9..];
            Ok(entry)
        }
    }

    fn block(entries: &[TestEntry]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for e in entries {
            bytes.extend_from_slice(&e.0.to_le_bytes());
            bytes.push(e.1);
        }
        bytes
    }

    #[test]
    fn append_block_read_truncate() {
        let mut log = InMemoryLog::<TestEntry>::create();
        assert_eq!(log.last_position(), None);

        let last = log
            .append(&block(&[TestEntry(1, 10), TestEntry(2, 20), TestEntry(3, 30)]))
            .unwrap();
        assert_eq!(last, Position::new(3));
        assert_eq!(log.first_position(), Some(Position::new(1)));
        assert_eq!(log.read(Position::new(2)).unwrap(), Some(TestEntry(2, 20)));
        assert_eq!(log.read(Position::new(4)).unwrap(), None);

        log.truncate(Position::new(2)).unwrap();
        assert_eq!(log.last_position(), Some(Position::new(1)));
        assert_eq!(log.read(Position::new(2)).unwrap(), None);

        log.append(&block(&[TestEntry(2, 21)])).unwrap();
        assert_eq!(log.read(Position::new(2)).unwrap(), Some(TestEntry(2, 21)));
    }

    #[test]
    fn rejects_gaps_atomically() {
        let mut log = InMemoryLog::<TestEntry>::create();
        let result = log.append(&block(&[TestEntry(1, 10), TestEntry(3, 30)]));

        assert!(matches!(result, Err(StorageError::NonContiguous { .. })));
        assert_eq!(log.last_position(), None);
    }

    #[test]
    fn closed_writer() {
        let mut log = InMemoryLog::<TestEntry>::create();
        log.set_writable(false);

        assert!(matches!(
            log.append(&block(&[TestEntry(1, 10)])),
            Err(StorageError::WriterClosed)
        ));
    }
}
