mod consensus_request;
mod election_state;
mod state_change_listener;

pub(crate) use consensus_request::ConsensusOutcome;
pub(crate) use consensus_request::ConsensusRequestController;
pub(crate) use election_state::ElectionConfig;
pub(crate) use election_state::ElectionState;
pub(crate) use election_state::LeaderState;
pub(crate) use election_state::PendingConfiguration;
pub(crate) use state_change_listener::StateChangeNotifier;

pub use state_change_listener::MemberJoiningFuture;
pub use state_change_listener::RaftState;
pub use state_change_listener::RaftStateListener;
pub use state_change_listener::StateChange;
pub use state_change_listener::StateSnapshot;
pub use state_change_listener::StateWatcher;

pub(crate) fn state_watch(initial_state: StateSnapshot) -> (StateChangeNotifier, StateWatcher) {
    state_change_listener::new(initial_state)
}
