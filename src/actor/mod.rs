use crate::commitlog::{Log, Position};
use crate::replica::{
    AppendEntryError, ConsensusReply, LogEntry, MemberJoinReady, RaftStateListener, Replica, Term, TimerEvent,
};
use crate::transport::InboundFrame;
use bytes::Bytes;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

// Disk interaction is synchronous, on the actor task.
pub(crate) enum Event {
    // Leader: AppendResponse, Vote/Poll/Join requests.
    // Follower: AppendRequest, Vote/Poll requests. Join is rejected.
    // Candidate: Vote/Poll requests. AppendRequest of the current term makes us follower.
    Inbound(InboundFrame),

    // Follower: count poll replies, become candidate on quorum.
    // Candidate: count vote replies, become leader on quorum.
    // Leader: discard, unless it carries a higher term.
    ConsensusReply(ConsensusReply),

    // Election timeout, flush tick, or per-member heartbeat. Dropped if from an older state.
    Timer(TimerEvent),

    // Leader: write entry, replicate. Others: redirect.
    Append(Bytes, Callback<(Term, Position), AppendEntryError>),

    // Leader: append configuration entry for the member, if still leader of the same term.
    MemberJoinReady(MemberJoinReady),

    AddListener(Arc<dyn RaftStateListener>),

    Close(oneshot::Sender<()>),
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Inbound(frame) => write!(f, "Inbound({:?})", frame),
            Event::ConsensusReply(reply) => write!(f, "{:?}", reply),
            Event::Timer(tick) => write!(f, "{:?}", tick),
            Event::Append(data, _) => write!(f, "Append({} bytes)", data.len()),
            Event::MemberJoinReady(ready) => write!(f, "MemberJoinReady({:?})", ready.member),
            Event::AddListener(_) => write!(f, "AddListener"),
            Event::Close(_) => write!(f, "Close"),
        }
    }
}

pub(crate) struct Callback<O, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O, E: Error> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DeliveryError {
    #[error("actor queue is full")]
    Full,
    #[error("actor has exited")]
    Closed,
}

#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn append(&self, data: Bytes) -> Result<(Term, Position), AppendEntryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Event::Append(data, Callback(tx)))
            .await
            .map_err(|_| AppendEntryError::ActorExited)?;

        rx.await.map_err(|_| AppendEntryError::ActorExited)?
    }

    pub(crate) async fn add_listener(&self, listener: Arc<dyn RaftStateListener>) -> bool {
        self.sender.send(Event::AddListener(listener)).await.is_ok()
    }

    /// Resolves once the actor has closed the node. Closing an exited actor is a no-op.
    pub(crate) async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Event::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// WeakActorClient doesn't keep the actor alive. Timers, router and background tasks hold this.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    /// Returns false if the actor is gone.
    pub(crate) async fn timer_event(&self, event: TimerEvent) -> bool {
        self.send(Event::Timer(event)).await
    }

    pub(crate) async fn consensus_reply(&self, reply: ConsensusReply) -> bool {
        self.send(Event::ConsensusReply(reply)).await
    }

    pub(crate) async fn member_join_ready(&self, ready: MemberJoinReady) -> bool {
        self.send(Event::MemberJoinReady(ready)).await
    }

    /// Non-blocking delivery for callers that must never wait on a busy actor.
    pub(crate) fn try_deliver(&self, frame: InboundFrame) -> Result<(), DeliveryError> {
        let sender = self.sender.upgrade().ok_or(DeliveryError::Closed)?;
        sender.try_send(Event::Inbound(frame)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    async fn send(&self, event: Event) -> bool {
        match self.sender.upgrade() {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }
}

/// ReplicaActor is raft node logic in actor model.
pub(crate) struct ReplicaActor<L: Log<LogEntry>> {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: Replica<L>,
}

impl<L: Log<LogEntry>> ReplicaActor<L> {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: Replica<L>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            slog::trace!(self.logger, "Event: {:?}", event);
            if !self.handle_event(event) {
                break;
            }
        }

        // No-op if closed already, otherwise all clients dropped without closing.
        self.replica.close();
        slog::info!(self.logger, "Raft node event loop has exited");
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and come back as an event to this actor. Returns false once the node is closed.
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Inbound(frame) => self.replica.handle_inbound(frame),
            Event::ConsensusReply(reply) => self.replica.handle_consensus_reply(reply),
            Event::Timer(tick) => self.replica.handle_timer(tick),
            Event::Append(data, callback) => callback.send(self.replica.append(data)),
            Event::MemberJoinReady(ready) => self.replica.handle_member_join_ready(ready),
            Event::AddListener(listener) => self.replica.add_listener(listener),
            Event::Close(done) => {
                self.replica.close();
                let _ = done.send(());
                return false;
            }
        }

        true
    }
}
