use crate::commitlog::Position;
use crate::protocol::messages::*;
use crate::replica::{LogEntry, PeerAddress, Term};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Every message starts with a fixed header:
///
/// ```text
/// | 0 | 1 | 2 | 3 | 4 ...
/// +---+---+---+---+------...
/// |Vrs|Typ| Part. | Body ...
/// +---+---+-------+------...
/// ```
///
/// * `Vrs` - version of the serialized message
/// * `Typ` - message type
/// * `Part.` - partition id (u16 LE). The router reads it without decoding the rest.
const PROTOCOL_VERSION: u8 = 1;
pub(crate) const PARTITION_ID_OFFSET: usize = 2;
const HEADER_LEN: usize = 4;

const APPEND_REQUEST: u8 = 1;
const APPEND_RESPONSE: u8 = 2;
const VOTE_REQUEST: u8 = 3;
const VOTE_RESPONSE: u8 = 4;
const POLL_REQUEST: u8 = 5;
const POLL_RESPONSE: u8 = 6;
const JOIN_REQUEST: u8 = 7;
const JOIN_RESPONSE: u8 = 8;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame truncated, {needed} more bytes needed")]
    Truncated { needed: usize },
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unknown log entry type {0}")]
    UnknownEntryType(u8),
    #[error("peer address is not valid utf-8")]
    InvalidAddress,
    #[error("log entry has reserved position 0")]
    ZeroPosition,
}

pub(crate) fn read_partition_id(frame: &[u8]) -> Option<PartitionId> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    let offset = PARTITION_ID_OFFSET;
    Some(u16::from_le_bytes([frame[offset], frame[offset + 1]]))
}

pub(crate) fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    let message_type = match message {
        Message::AppendRequest(_) => APPEND_REQUEST,
        Message::AppendResponse(_) => APPEND_RESPONSE,
        Message::VoteRequest(_) => VOTE_REQUEST,
        Message::VoteResponse(_) => VOTE_RESPONSE,
        Message::PollRequest(_) => POLL_REQUEST,
        Message::PollResponse(_) => POLL_RESPONSE,
        Message::JoinRequest(_) => JOIN_REQUEST,
        Message::JoinResponse(_) => JOIN_RESPONSE,
    };
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(message_type);
    buf.put_u16_le(message.partition_id());

    match message {
        Message::AppendRequest(m) => {
            buf.put_u64_le(m.term.as_u64());
            put_address(&mut buf, &m.leader);
            put_entry_id(&mut buf, m.previous);
            buf.put_u64_le(Position::to_wire(m.commit_position));
            match &m.entry {
                Some(entry) => {
                    buf.put_u8(1);
                    entry.encode(&mut buf);
                }
                None => buf.put_u8(0),
            }
        }
        Message::AppendResponse(m) => {
            buf.put_u64_le(m.term.as_u64());
            put_address(&mut buf, &m.member);
            buf.put_u8(m.succeeded as u8);
            buf.put_u64_le(Position::to_wire(m.position));
        }
        Message::VoteRequest(m) | Message::PollRequest(m) => {
            buf.put_u64_le(m.term.as_u64());
            put_address(&mut buf, &m.candidate);
            put_entry_id(&mut buf, m.last_entry);
        }
        Message::VoteResponse(m) | Message::PollResponse(m) => {
            buf.put_u64_le(m.term.as_u64());
            buf.put_u8(m.granted as u8);
        }
        Message::JoinRequest(m) => {
            put_address(&mut buf, &m.member);
        }
        Message::JoinResponse(m) => {
            buf.put_u64_le(m.term.as_u64());
            buf.put_u8(m.succeeded as u8);
            put_addresses(&mut buf, &m.members);
        }
    }

    buf.freeze()
}

pub(crate) fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    let mut buf = frame;
    let version = get_u8(&mut buf)?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let message_type = get_u8(&mut buf)?;
    let partition_id = get_u16(&mut buf)?;

    let message = match message_type {
        APPEND_REQUEST => {
            let term = get_term(&mut buf)?;
            let leader = get_address(&mut buf)?;
            let previous = get_entry_id(&mut buf)?;
            let commit_position = Position::from_wire(get_u64(&mut buf)?);
            let entry = match get_u8(&mut buf)? {
                0 => None,
                _ => Some(LogEntry::decode(&mut buf)?),
            };
            Message::AppendRequest(AppendRequest {
                partition_id,
                term,
                leader,
                previous,
                commit_position,
                entry,
            })
        }
        APPEND_RESPONSE => Message::AppendResponse(AppendResponse {
            partition_id,
            term: get_term(&mut buf)?,
            member: get_address(&mut buf)?,
            succeeded: get_u8(&mut buf)? != 0,
            position: Position::from_wire(get_u64(&mut buf)?),
        }),
        VOTE_REQUEST | POLL_REQUEST => {
            let request = ConsensusRequest {
                partition_id,
                term: get_term(&mut buf)?,
                candidate: get_address(&mut buf)?,
                last_entry: get_entry_id(&mut buf)?,
            };
            if message_type == VOTE_REQUEST {
                Message::VoteRequest(request)
            } else {
                Message::PollRequest(request)
            }
        }
        VOTE_RESPONSE | POLL_RESPONSE => {
            let response = ConsensusResponse {
                partition_id,
                term: get_term(&mut buf)?,
                granted: get_u8(&mut buf)? != 0,
            };
            if message_type == VOTE_RESPONSE {
                Message::VoteResponse(response)
            } else {
                Message::PollResponse(response)
            }
        }
        JOIN_REQUEST => Message::JoinRequest(JoinRequest {
            partition_id,
            member: get_address(&mut buf)?,
        }),
        JOIN_RESPONSE => Message::JoinResponse(JoinResponse {
            partition_id,
            term: get_term(&mut buf)?,
            succeeded: get_u8(&mut buf)? != 0,
            members: get_addresses(&mut buf)?,
        }),
        unknown => return Err(DecodeError::UnknownMessageType(unknown)),
    };

    Ok(message)
}

// ------- Field helpers, shared with the log entry and state file formats --------

fn ensure<B: Buf>(buf: &B, len: usize) -> Result<(), DecodeError> {
    if buf.remaining() < len {
        Err(DecodeError::Truncated {
            needed: len - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

pub(crate) fn get_u8<B: Buf>(buf: &mut B) -> Result<u8, DecodeError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u16<B: Buf>(buf: &mut B) -> Result<u16, DecodeError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub(crate) fn get_u32<B: Buf>(buf: &mut B) -> Result<u32, DecodeError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn get_u64<B: Buf>(buf: &mut B) -> Result<u64, DecodeError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub(crate) fn get_bytes<B: Buf>(buf: &mut B, len: usize) -> Result<Bytes, DecodeError> {
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

pub(crate) fn get_term<B: Buf>(buf: &mut B) -> Result<Term, DecodeError> {
    get_u64(buf).map(Term::new)
}

pub(crate) fn put_address<B: BufMut>(buf: &mut B, address: &PeerAddress) {
    buf.put_u16_le(address.host().len() as u16);
    buf.put_slice(address.host().as_bytes());
    buf.put_u16_le(address.port());
}

pub(crate) fn get_address<B: Buf>(buf: &mut B) -> Result<PeerAddress, DecodeError> {
    let host_len = get_u16(buf)? as usize;
    let host = get_bytes(buf, host_len)?;
    let host = String::from_utf8(host.to_vec()).map_err(|_| DecodeError::InvalidAddress)?;
    let port = get_u16(buf)?;
    Ok(PeerAddress::new(host, port))
}

pub(crate) fn put_addresses<B: BufMut>(buf: &mut B, addresses: &[PeerAddress]) {
    buf.put_u16_le(addresses.len() as u16);
    for address in addresses {
        put_address(buf, address);
    }
}

pub(crate) fn get_addresses<B: Buf>(buf: &mut B) -> Result<Vec<PeerAddress>, DecodeError> {
    let count = get_u16(buf)? as usize;
    let mut addresses = Vec::with_capacity(count);
    for _ in 0..count {
        addresses.push(get_address(buf)?);
    }
    Ok(addresses)
}

fn put_entry_id<B: BufMut>(buf: &mut B, entry_id: Option<(Term, Position)>) {
    match entry_id {
        Some((term, position)) => {
            buf.put_u64_le(position.as_u64());
            buf.put_u64_le(term.as_u64());
        }
        None => {
            buf.put_u64_le(0);
            buf.put_u64_le(0);
        }
    }
}

fn get_entry_id<B: Buf>(buf: &mut B) -> Result<Option<(Term, Position)>, DecodeError> {
    let position = Position::from_wire(get_u64(buf)?);
    let term = get_term(buf)?;
    Ok(position.map(|p| (term, p)))
}
