use crate::commitlog::{self, Position};
use crate::protocol::{self, DecodeError};
use crate::replica::{PeerAddress, Term};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Byte representation:
///
/// ```text
/// |       |       |                 1                       2       |
/// | 0 | 1 | 2 ... 9 | 0 ... 7 | 8 | 9 | 0 | 1 | 2 ...             |
/// +---+---+---------+---------+---------------+-------------...---+
/// |Vrs|Typ|Position |  Term   | Length (u32)  | Data          ... |
/// +---+---+---------+---------+---------------+-------------...---+
/// ```
///
/// * `Vrs` - version of the serialized entry
/// * `Typ` - entry type, see `EntryType`
/// * `Position` - position of this entry in the partition's log
/// * `Term` - raft leadership term when this entry was created
/// * `Length` - size of `Data`. Needed because entries are coalesced into blocks.
/// * `Data` - payload; app data for events, member list for configuration entries
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub(crate) position: Position,
    pub(crate) term: Term,
    pub(crate) entry_type: EntryType,
    pub(crate) data: Bytes,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryType {
    Event,
    /// First entry a leader writes in its term.
    Initialize,
    /// Carries the full member list of the cluster.
    Configuration,
}

const LOG_ENTRY_FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 1 + 8 + 8 + 4;

impl LogEntry {
    pub(crate) fn new(position: Position, term: Term, entry_type: EntryType, data: Bytes) -> Self {
        LogEntry {
            position,
            term,
            entry_type,
            data,
        }
    }

    pub(crate) fn configuration(position: Position, term: Term, members: &[PeerAddress]) -> Self {
        Self::new(position, term, EntryType::Configuration, Self::encode_members(members))
    }

    pub(crate) fn encode_members(members: &[PeerAddress]) -> Bytes {
        let mut data = BytesMut::new();
        protocol::put_addresses(&mut data, members);
        data.freeze()
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub(crate) fn id(&self) -> (Term, Position) {
        (self.term, self.position)
    }

    /// Member list of a configuration entry.
    pub(crate) fn members(&self) -> Result<Vec<PeerAddress>, DecodeError> {
        let mut data = self.data.clone();
        protocol::get_addresses(&mut data)
    }

    pub(crate) fn encoded_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(LOG_ENTRY_FORMAT_VERSION);
        buf.put_u8(match self.entry_type {
            EntryType::Event => 0,
            EntryType::Initialize => 1,
            EntryType::Configuration => 2,
        });
        buf.put_u64_le(self.position.as_u64());
        buf.put_u64_le(self.term.as_u64());
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    pub(crate) fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
        let version = protocol::get_u8(buf)?;
        if version != LOG_ENTRY_FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let entry_type = match protocol::get_u8(buf)? {
            0 => EntryType::Event,
            1 => EntryType::Initialize,
            2 => EntryType::Configuration,
            unknown => return Err(DecodeError::UnknownEntryType(unknown)),
        };
        let position = Position::from_wire(protocol::get_u64(buf)?).ok_or(DecodeError::ZeroPosition)?;
        let term = protocol::get_term(buf)?;
        let len = protocol::get_u32(buf)? as usize;
        let data = protocol::get_bytes(buf, len)?;

        Ok(LogEntry {
            position,
            term,
            entry_type,
            data,
        })
    }
}

impl commitlog::Entry for LogEntry {
    type Error = DecodeError;

    fn position(&self) -> Position {
        self.position
    }

    fn decode_frame(buf: &mut &[u8]) -> Result<Self, Self::Error> {
        Self::decode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesced_frames_decode_in_order() {
        let first = LogEntry::new(Position::new(4), Term::new(2), EntryType::Event, Bytes::from_static(b"a"));
        let second = LogEntry::configuration(
            Position::new(5),
            Term::new(2),
            &[PeerAddress::new("a", 1), PeerAddress::new("b", 2)],
        );

        let mut block = BytesMut::new();
        first.encode(&mut block);
        second.encode(&mut block);
        assert_eq!(block.len(), first.encoded_len() + second.encoded_len());

        let mut buf = &block[..];
        assert_eq!(LogEntry::decode(&mut buf).unwrap(), first);
        let decoded = LogEntry::decode(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(decoded.entry_type(), EntryType::Configuration);
        assert_eq!(
            decoded.members().unwrap(),
            vec![PeerAddress::new("a", 1), PeerAddress::new("b", 2)]
        );
    }

    #[test]
    fn truncated_payload() {
        let entry = LogEntry::new(Position::new(1), Term::new(1), EntryType::Event, Bytes::from_static(b"abc"));
        let mut block = BytesMut::new();
        entry.encode(&mut block);

        let mut buf = &block[..block.len() - 2];
        assert_eq!(LogEntry::decode(&mut buf), Err(DecodeError::Truncated { needed: 2 }));
    }
}
