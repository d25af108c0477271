//! Wire format of the messages raft nodes exchange.
mod codec;
mod messages;

pub use codec::DecodeError;
pub use messages::PartitionId;

pub(crate) use codec::{decode, encode, read_partition_id};
pub(crate) use codec::{get_address, get_addresses, get_bytes, get_term, get_u32, get_u64, get_u8};
pub(crate) use codec::{put_address, put_addresses};
pub(crate) use messages::*;
