use crate::protocol::PartitionId;
use std::fmt;

/// PeerAddress is the network identity of a raft node. Votes, membership and replication
/// progress are all keyed by it.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        PeerAddress {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// LogId names the replicated log partition a node is responsible for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogId {
    pub topic: String,
    pub partition_id: PartitionId,
}
