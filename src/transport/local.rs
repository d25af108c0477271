use crate::replica::PeerAddress;
use crate::transport::{InboundFrame, RemoteHandle, Transport, TransportError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

/// LocalNetwork connects transports living in the same process. Every bound address gets a
/// bounded inbound queue. Addresses can be cut off from the network to simulate partitions.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<Mutex<NetworkState>>,
    queue_size: usize,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PeerAddress, mpsc::Sender<InboundFrame>>,
    disconnected: Vec<PeerAddress>,
}

impl LocalNetwork {
    pub fn new(queue_size: usize) -> Self {
        LocalNetwork {
            inner: Arc::new(Mutex::new(NetworkState::default())),
            queue_size,
        }
    }

    /// Binding an address again replaces the previous endpoint, like a restarted process would.
    pub fn bind(&self, address: PeerAddress) -> (LocalTransport, mpsc::Receiver<InboundFrame>) {
        let (tx, rx) = mpsc::channel(self.queue_size);
        self.state().endpoints.insert(address.clone(), tx);

        let transport = LocalTransport {
            network: self.clone(),
            address,
        };

        (transport, rx)
    }

    /// Frames to or from `address` are lost until it reconnects.
    pub fn disconnect(&self, address: &PeerAddress) {
        let mut state = self.state();
        if !state.disconnected.contains(address) {
            state.disconnected.push(address.clone());
        }
    }

    pub fn reconnect(&self, address: &PeerAddress) {
        self.state().disconnected.retain(|a| a != address);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.inner.lock().expect("LocalNetwork mutex guard poison")
    }

    fn route(&self, from: &PeerAddress, to: &PeerAddress) -> Result<mpsc::Sender<InboundFrame>, TransportError> {
        let state = self.state();
        if state.disconnected.contains(from) || state.disconnected.contains(to) {
            return Err(TransportError::Unreachable(to.clone()));
        }
        state
            .endpoints
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.clone()))
    }
}

/// The `Transport` of one bound address on a `LocalNetwork`.
pub struct LocalTransport {
    network: LocalNetwork,
    address: PeerAddress,
}

impl LocalTransport {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn deliver(&self, to: &PeerAddress, frame: InboundFrame) -> Result<(), TransportError> {
        let inbound = self.network.route(&self.address, to)?;
        inbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure(to.clone()),
            mpsc::error::TrySendError::Closed(_) => TransportError::Unreachable(to.clone()),
        })
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    fn register_remote_address(&self, address: &PeerAddress) -> RemoteHandle {
        RemoteHandle::new(address.clone())
    }

    fn send_message(&self, remote: &RemoteHandle, frame: Bytes) -> bool {
        self.deliver(remote.address(), InboundFrame::Message(frame)).is_ok()
    }

    async fn send_request(&self, remote: &RemoteHandle, frame: Bytes, timeout: Duration) -> Result<Bytes, TransportError> {
        let to = remote.address();
        let (tx, rx) = oneshot::channel();
        self.deliver(to, InboundFrame::Request(frame, tx))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                // The response travels back over the same network.
                self.network.route(to, &self.address)?;
                Ok(response)
            }
            // Responder dropped without answering
            Ok(Err(_)) => Err(TransportError::Unreachable(to.clone())),
            Err(_) => Err(TransportError::Timeout(to.clone())),
        }
    }
}
