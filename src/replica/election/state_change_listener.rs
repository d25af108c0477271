use crate::protocol::PartitionId;
use crate::replica::{PeerAddress, Term};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::watch;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RaftState {
    Follower,
    Candidate,
    Leader,
}

/// StateChange is handed to every `RaftStateListener` after the node changes state or term.
#[derive(Clone, Debug, PartialEq)]
pub struct StateChange {
    pub partition_id: PartitionId,
    pub topic: String,
    pub address: PeerAddress,
    pub new_state: RaftState,
    pub term: Term,
}

pub type MemberJoiningFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// RaftStateListener is invoked on the node's actor task, so it must not block.
pub trait RaftStateListener: Send + Sync + 'static {
    fn on_state_change(&self, change: &StateChange);

    /// Called on the leader when `member` asks to join. If a future is returned, the member is
    /// only added to the cluster after it resolves.
    fn on_member_joining(&self, _member: &PeerAddress) -> Option<MemberJoiningFuture> {
        None
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StateSnapshot {
    pub state: RaftState,
    pub term: Term,
    // Ourselves while leader.
    pub leader: Option<PeerAddress>,
}

pub(crate) fn new(initial_state: StateSnapshot) -> (StateChangeNotifier, StateWatcher) {
    let (snd, rcv) = watch::channel(initial_state);

    (StateChangeNotifier { snd }, StateWatcher { rcv })
}

pub(crate) struct StateChangeNotifier {
    snd: watch::Sender<StateSnapshot>,
}

impl StateChangeNotifier {
    /// Returns false if nothing changed.
    pub(crate) fn notify_new_state(&self, new_state: StateSnapshot) -> bool {
        self.snd.send_if_modified(|current| {
            if *current == new_state {
                false
            } else {
                *current = new_state;
                true
            }
        })
    }
}

/// StateWatcher follows the node's state without registering a `RaftStateListener`.
#[derive(Clone)]
pub struct StateWatcher {
    rcv: watch::Receiver<StateSnapshot>,
}

impl StateWatcher {
    pub fn current(&self) -> StateSnapshot {
        self.rcv.borrow().clone()
    }

    /// Waits for the next change. None once the node is gone.
    pub async fn next(&mut self) -> Option<StateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    /// Waits until the state satisfies `predicate`, which may already be the case.
    pub async fn wait_until(&mut self, mut predicate: impl FnMut(&StateSnapshot) -> bool) -> Option<StateSnapshot> {
        loop {
            let current = self.current();
            if predicate(&current) {
                return Some(current);
            }
            self.rcv.changed().await.ok()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(state: RaftState, term: u64) -> StateSnapshot {
        StateSnapshot {
            state,
            term: Term::new(term),
            leader: None,
        }
    }

    #[tokio::test]
    async fn watcher_sees_changes_only() {
        let (notifier, mut watcher) = new(snapshot(RaftState::Follower, 0));

        assert!(!notifier.notify_new_state(snapshot(RaftState::Follower, 0)));
        assert!(notifier.notify_new_state(snapshot(RaftState::Candidate, 1)));

        assert_eq!(watcher.next().await, Some(snapshot(RaftState::Candidate, 1)));

        drop(notifier);
        assert_eq!(watcher.next().await, None);
    }

    #[tokio::test]
    async fn wait_until_returns_immediately_if_satisfied() {
        let (notifier, mut watcher) = new(snapshot(RaftState::Leader, 3));

        let found = watcher.wait_until(|s| s.state == RaftState::Leader).await;
        assert_eq!(found, Some(snapshot(RaftState::Leader, 3)));

        drop(notifier);
        assert_eq!(watcher.wait_until(|s| s.state == RaftState::Follower).await, None);
    }
}
