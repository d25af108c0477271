use crate::actor::{DeliveryError, WeakActorClient};
use crate::protocol::{self, PartitionId};
use crate::transport::InboundFrame;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

enum RouterCommand {
    Register(PartitionId, WeakActorClient),
    Remove(PartitionId),
}

/// MessageRouter hands every inbound frame of one endpoint to the raft node of the frame's
/// partition. It only reads the header, decoding is left to the node.
///
/// The routing table is owned by the receive loop. Nodes are added and removed through
/// `RouterHandle`, whose commands are applied before the next frame is dispatched.
pub struct MessageRouter {
    logger: slog::Logger,
    routes: HashMap<PartitionId, WeakActorClient>,
    commands: mpsc::UnboundedReceiver<RouterCommand>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct RouterHandle {
    commands: mpsc::UnboundedSender<RouterCommand>,
    shutdown: CancellationToken,
}

impl MessageRouter {
    pub fn new(logger: slog::Logger) -> (Self, RouterHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let router = MessageRouter {
            logger,
            routes: HashMap::new(),
            commands: rx,
            shutdown: shutdown.clone(),
        };
        let handle = RouterHandle { commands: tx, shutdown };

        (router, handle)
    }

    /// Creates a router for `inbound` and runs it on a new task.
    pub fn spawn(logger: slog::Logger, inbound: mpsc::Receiver<InboundFrame>) -> RouterHandle {
        let (router, handle) = MessageRouter::new(logger);
        tokio::spawn(router.run(inbound));
        handle
    }

    /// Runs until the endpoint closes or `RouterHandle::shutdown()` is called.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<InboundFrame>) {
        slog::info!(self.logger, "Message router started");
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => {
                        self.apply_commands();
                        self.dispatch(frame);
                    }
                    None => break,
                },
            }
        }

        slog::info!(self.logger, "Message router has exited");
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                RouterCommand::Register(partition_id, node) => {
                    slog::debug!(self.logger, "Routing partition {} to a new node", partition_id);
                    self.routes.insert(partition_id, node);
                }
                RouterCommand::Remove(partition_id) => {
                    slog::debug!(self.logger, "No longer routing partition {}", partition_id);
                    self.routes.remove(&partition_id);
                }
            }
        }
    }

    fn dispatch(&mut self, frame: InboundFrame) {
        let partition_id = match protocol::read_partition_id(frame.bytes()) {
            Some(partition_id) => partition_id,
            None => {
                slog::warn!(self.logger, "Dropping frame too short for a header: {:?}", frame);
                return;
            }
        };
        let node = match self.routes.get(&partition_id) {
            Some(node) => node,
            None => {
                slog::warn!(self.logger, "Dropping frame for unknown partition {}", partition_id);
                return;
            }
        };

        match node.try_deliver(frame) {
            Ok(()) => {}
            // Raft retries whatever got lost here.
            Err(DeliveryError::Full) => {
                slog::warn!(self.logger, "Node of partition {} is overloaded, dropping frame", partition_id);
            }
            Err(DeliveryError::Closed) => {
                slog::info!(self.logger, "Node of partition {} has exited, removing route", partition_id);
                self.routes.remove(&partition_id);
            }
        }
    }
}

impl RouterHandle {
    pub(crate) fn register(&self, partition_id: PartitionId, node: WeakActorClient) -> bool {
        self.commands
            .send(RouterCommand::Register(partition_id, node))
            .is_ok()
    }

    pub(crate) fn remove(&self, partition_id: PartitionId) {
        let _ = self.commands.send(RouterCommand::Remove(partition_id));
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::protocol::{AppendRequest, Message};
    use crate::replica::{PeerAddress, Term};
    use bytes::Bytes;
    use tokio::time::{timeout, Duration};

    fn heartbeat(partition_id: PartitionId) -> InboundFrame {
        let request = AppendRequest {
            partition_id,
            term: Term::new(1),
            leader: PeerAddress::new("localhost", 1),
            previous: None,
            commit_position: None,
            entry: None,
        };
        InboundFrame::Message(protocol::encode(&Message::AppendRequest(request)))
    }

    fn test_router() -> (MessageRouter, RouterHandle) {
        MessageRouter::new(slog::Logger::root(slog::Discard, slog::o!()))
    }

    async fn assert_inbound(rx: &mut mpsc::Receiver<Event>, partition_id: PartitionId) {
        match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Event::Inbound(frame))) => {
                assert_eq!(protocol::read_partition_id(frame.bytes()), Some(partition_id));
            }
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn frames_reach_the_node_of_their_partition() {
        // -- setup --
        let (mut router, handle) = test_router();
        let (client_1, mut rx_1) = ActorClient::new(10);
        let (client_2, mut rx_2) = ActorClient::new(10);
        handle.register(1, client_1.weak());
        handle.register(2, client_2.weak());

        // -- execute --
        router.apply_commands();
        router.dispatch(heartbeat(2));
        router.dispatch(heartbeat(1));
        router.dispatch(heartbeat(3));

        // -- verify --
        assert_inbound(&mut rx_1, 1).await;
        assert_inbound(&mut rx_2, 2).await;
        assert!(rx_1.try_recv().is_err());
        assert!(rx_2.try_recv().is_err());
    }

    #[tokio::test]
    async fn removed_partition_is_dropped() {
        let (mut router, handle) = test_router();
        let (client, mut rx) = ActorClient::new(10);
        handle.register(1, client.weak());
        handle.remove(1);

        router.apply_commands();
        router.dispatch(heartbeat(1));

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn garbage_and_overload_do_not_break_routing() {
        // -- setup --
        let (mut router, handle) = test_router();
        let (client, mut rx) = ActorClient::new(1);
        handle.register(1, client.weak());
        router.apply_commands();

        // -- execute --
        router.dispatch(InboundFrame::Message(Bytes::from_static(b"\x01")));
        router.dispatch(heartbeat(1));
        // Queue of one is full now
        router.dispatch(heartbeat(1));

        // -- verify --
        assert_inbound(&mut rx, 1).await;
        assert!(rx.try_recv().is_err());

        router.dispatch(heartbeat(1));
        assert_inbound(&mut rx, 1).await;
    }

    #[tokio::test]
    async fn exited_node_is_removed() {
        let (mut router, handle) = test_router();
        let (client, rx) = ActorClient::new(10);
        handle.register(1, client.weak());
        router.apply_commands();
        drop(client);
        drop(rx);

        router.dispatch(heartbeat(1));

        assert!(router.routes.is_empty());
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        // -- setup --
        let (router, handle) = test_router();
        let (client, mut rx) = ActorClient::new(10);
        let (tx, inbound) = mpsc::channel(10);
        handle.register(7, client.weak());
        let task = tokio::spawn(router.run(inbound));

        // -- execute & verify --
        tx.send(heartbeat(7)).await.unwrap();
        assert_inbound(&mut rx, 7).await;

        handle.shutdown();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
