use crate::actor::ActorClient;
use crate::commitlog::Position;
use crate::protocol::{self, JoinRequest, Message};
use crate::replica::{
    AppendEntryError, CommitStream, JoinError, LogId, PeerAddress, RaftStateListener, StateWatcher, Term,
};
use crate::router::RouterHandle;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::Duration;

/// RaftNode is the application's handle on the raft node of one partition.
pub struct RaftNode {
    logger: slog::Logger,
    log_id: LogId,
    address: PeerAddress,
    actor_client: ActorClient,
    router: RouterHandle,
    transport: Arc<dyn Transport>,
    join_timeout: Duration,
    commit_stream: Option<CommitStream>,
    state_watcher: StateWatcher,
}

impl RaftNode {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        logger: slog::Logger,
        log_id: LogId,
        address: PeerAddress,
        actor_client: ActorClient,
        router: RouterHandle,
        transport: Arc<dyn Transport>,
        join_timeout: Duration,
        commit_stream: CommitStream,
        state_watcher: StateWatcher,
    ) -> Self {
        RaftNode {
            logger,
            log_id,
            address,
            actor_client,
            router,
            transport,
            join_timeout,
            commit_stream: Some(commit_stream),
            state_watcher,
        }
    }

    pub fn log_id(&self) -> &LogId {
        &self.log_id
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Appends `data` to the replicated log. Only the leader accepts entries. The returned position
    /// is written locally, the commit stream tells once it's committed.
    pub async fn append(&self, data: Bytes) -> Result<(Term, Position), AppendEntryError> {
        self.actor_client.append(data).await
    }

    /// Asks `contact` to add this node to its cluster. Only the leader accepts. Returns the members
    /// `contact` knows of when it accepted.
    pub async fn join(&self, contact: &PeerAddress) -> Result<Vec<PeerAddress>, JoinError> {
        let request = Message::JoinRequest(JoinRequest {
            partition_id: self.log_id.partition_id,
            member: self.address.clone(),
        });
        let remote = self.transport.register_remote_address(contact);

        slog::info!(self.logger, "Asking {:?} to join its cluster", contact);
        let frame = self
            .transport
            .send_request(&remote, protocol::encode(&request), self.join_timeout)
            .await?;

        match protocol::decode(&frame) {
            Ok(Message::JoinResponse(response)) if response.succeeded => Ok(response.members),
            Ok(Message::JoinResponse(response)) => Err(JoinError::Rejected {
                contact: contact.clone(),
                members: response.members,
            }),
            Ok(other) => Err(JoinError::MalformedResponse(format!("unexpected {}", other.name()))),
            Err(e) => Err(JoinError::MalformedResponse(e.to_string())),
        }
    }

    /// Returns false if the node is closed.
    pub async fn add_listener(&self, listener: Arc<dyn RaftStateListener>) -> bool {
        self.actor_client.add_listener(listener).await
    }

    pub fn state_watcher(&self) -> StateWatcher {
        self.state_watcher.clone()
    }

    /// The commit stream can be taken once.
    pub fn take_commit_stream(&mut self) -> Option<CommitStream> {
        self.commit_stream.take()
    }

    /// Unregisters the node from its router and closes it. Buffered entries are written and every
    /// timer and outstanding request is stopped before this returns.
    pub async fn close(&self) {
        self.router.remove(self.log_id.partition_id);
        self.actor_client.close().await;
        slog::info!(self.logger, "Raft node closed");
    }
}
