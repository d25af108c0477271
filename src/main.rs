use bytes::Bytes;
use partition_raft::{
    try_create_raft_node, InMemoryLog, LocalNetwork, LogEntry, MessageRouter, PeerAddress, PersistentStore, RaftNode,
    RaftNodeConfig, RaftOptions, RaftState, RouterHandle,
};
use slog::Drain;
use std::error::Error;
use std::sync::Arc;
use tokio::time::Duration;

const NUM_MEMBERS: u16 = 3;
const NUM_ENTRIES: usize = 5;

/// Runs a cluster of in-process nodes, appends a few entries through the leader and prints them
/// as each node sees them committed.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let logger = create_root_logger_for_stdout();
    let network = LocalNetwork::new(1024);
    let members: Vec<_> = (1..=NUM_MEMBERS)
        .map(|i| PeerAddress::new("localhost", 7000 + i))
        .collect();

    let mut nodes: Vec<(RaftNode, RouterHandle)> = Vec::with_capacity(members.len());
    for address in &members {
        let (transport, inbound) = network.bind(address.clone());
        let router = MessageRouter::spawn(logger.clone(), inbound);
        let node = try_create_raft_node(
            RaftNodeConfig {
                logger: logger.clone(),
                topic: "demo".to_string(),
                partition_id: 0,
                address: address.clone(),
                bootstrap_members: members.clone(),
                options: RaftOptions::default(),
            },
            InMemoryLog::<LogEntry>::create(),
            PersistentStore::volatile(logger.clone()),
            Arc::new(transport),
            &router,
        )?;
        nodes.push((node, router));
    }

    let mut watcher = nodes[0].0.state_watcher();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(10),
        watcher.wait_until(|s| s.leader.is_some() && s.state != RaftState::Candidate),
    )
    .await?
    .ok_or("Node exited before electing a leader")?;
    let leader = snapshot.leader.ok_or("No leader")?;
    slog::info!(logger, "{:?} is leader of term {:?}", leader, snapshot.term);

    let leader_node = nodes
        .iter()
        .map(|(node, _)| node)
        .find(|node| *node.address() == leader)
        .ok_or("Leader isn't one of ours")?;
    for i in 0..NUM_ENTRIES {
        let (term, position) = leader_node.append(Bytes::from(format!("entry-{}", i))).await?;
        slog::info!(logger, "Appended entry-{} at {:?} in term {:?}", i, position, term);
    }

    for (node, _) in nodes.iter_mut() {
        let mut commit_stream = node.take_commit_stream().ok_or("Commit stream taken already")?;
        for _ in 0..NUM_ENTRIES {
            let committed = tokio::time::timeout(Duration::from_secs(5), commit_stream.recv())
                .await?
                .ok_or("Node exited")?;
            slog::info!(
                logger,
                "{:?} committed {:?} at {:?}",
                node.address(),
                String::from_utf8_lossy(&committed.data),
                committed.position
            );
        }
    }

    for (node, router) in &nodes {
        node.close().await;
        router.shutdown();
    }

    Ok(())
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
