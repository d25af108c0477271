use crate::actor::{ActorClient, ReplicaActor};
use crate::api::client::RaftNode;
use crate::api::options::RaftOptionsValidated;
use crate::commitlog::Log;
use crate::protocol::PartitionId;
use crate::replica::{
    self, LogEntry, LogId, PeerAddress, PersistError, PersistentStore, RaftState, Replica, ReplicaConfig,
    StateSnapshot,
};
use crate::router::RouterHandle;
use crate::transport::Transport;
use crate::RaftOptions;
use std::convert::TryFrom;
use std::sync::Arc;

// Inbound frames are dropped, not queued, beyond this.
const ACTOR_QUEUE_SIZE: usize = 256;

pub struct RaftNodeConfig {
    pub logger: slog::Logger,
    pub topic: String,
    pub partition_id: PartitionId,
    /// Address this node is reachable at. Must be the address `transport` is bound to.
    pub address: PeerAddress,
    /// Initial cluster, used only if `store` has no membership yet. Leave it empty on a node
    /// that is going to `join()` an existing cluster.
    pub bootstrap_members: Vec<PeerAddress>,
    pub options: RaftOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftNodeCreationError {
    #[error("Illegal options for configuring raft node: {0}")]
    IllegalOptions(String),
    #[error("Failed to persist initial state: {0}")]
    Persistence(#[from] PersistError),
}

/// Creates the raft node of one partition and starts it as follower. Inbound frames for the
/// partition reach the node once it is registered with `router`.
///
/// Must be called from within a tokio runtime.
pub fn try_create_raft_node<L: Log<LogEntry>>(
    config: RaftNodeConfig,
    storage: L,
    store: PersistentStore,
    transport: Arc<dyn Transport>,
    router: &RouterHandle,
) -> Result<RaftNode, RaftNodeCreationError> {
    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| RaftNodeCreationError::IllegalOptions(e.to_string()))?;

    let logger = config
        .logger
        .new(slog::o!("Partition" => config.partition_id, "Member" => config.address.to_string()));
    let log_id = LogId {
        topic: config.topic,
        partition_id: config.partition_id,
    };

    let (actor_client, actor_queue_rx) = ActorClient::new(ACTOR_QUEUE_SIZE);
    let (commit_stream_publisher, commit_stream) = replica::commit_stream();
    let (state_notifier, state_watcher) = replica::state_watch(StateSnapshot {
        state: RaftState::Follower,
        term: store.term(),
        leader: None,
    });

    let replica = Replica::new(ReplicaConfig {
        logger: logger.clone(),
        log_id: log_id.clone(),
        me: config.address.clone(),
        log: storage,
        store,
        bootstrap_members: config.bootstrap_members,
        transport: transport.clone(),
        commit_stream_publisher,
        state_notifier,
        actor_client: actor_client.weak(),
        heartbeat_interval: options.heartbeat_interval,
        election_interval: options.election_interval,
        flush_interval: options.flush_interval,
        request_timeout: options.request_timeout,
        append_buffer_size: options.append_buffer_capacity,
    })?;

    let replica_actor = ReplicaActor::new(logger.clone(), actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    if !router.register(log_id.partition_id, actor_client.weak()) {
        slog::warn!(logger, "Message router has exited, node won't receive anything");
    }

    Ok(RaftNode::new(
        logger,
        log_id,
        config.address,
        actor_client,
        router.clone(),
        transport,
        options.join_timeout,
        commit_stream,
        state_watcher,
    ))
}
