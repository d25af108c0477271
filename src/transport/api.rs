use crate::replica::PeerAddress;
use bytes::Bytes;
use std::fmt;
use tokio::sync::oneshot;
use tokio::time::Duration;

/// RemoteHandle is what a transport hands out for a registered address. Sends go through it so a
/// transport can cache connection state per remote.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RemoteHandle {
    address: PeerAddress,
}

impl RemoteHandle {
    pub fn new(address: PeerAddress) -> Self {
        RemoteHandle { address }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Remote({:?})", self.address)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TransportError {
    #[error("remote {0:?} is unreachable")]
    Unreachable(PeerAddress),
    #[error("request to {0:?} timed out")]
    Timeout(PeerAddress),
    #[error("outbound queue to {0:?} is full")]
    Backpressure(PeerAddress),
}

/// A frame as it arrives off the network, before anyone looked at it.
pub enum InboundFrame {
    /// One-way message.
    Message(Bytes),
    /// Request whose response must be sent through the responder.
    Request(Bytes, oneshot::Sender<Bytes>),
}

impl InboundFrame {
    pub(crate) fn bytes(&self) -> &Bytes {
        match self {
            InboundFrame::Message(bytes) => bytes,
            InboundFrame::Request(bytes, _) => bytes,
        }
    }
}

impl fmt::Debug for InboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundFrame::Message(bytes) => write!(f, "Message({} bytes)", bytes.len()),
            InboundFrame::Request(bytes, _) => write!(f, "Request({} bytes)", bytes.len()),
        }
    }
}

/// Transport moves encoded frames between raft nodes.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    fn register_remote_address(&self, address: &PeerAddress) -> RemoteHandle;

    /// Fire and forget. Returns false if the frame could not be enqueued, in which case the caller
    /// decides whether to retry or drop it.
    fn send_message(&self, remote: &RemoteHandle, frame: Bytes) -> bool;

    async fn send_request(&self, remote: &RemoteHandle, frame: Bytes, timeout: Duration) -> Result<Bytes, TransportError>;
}
