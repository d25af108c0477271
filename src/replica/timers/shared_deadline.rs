use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// SharedDeadline is the hand-off between a timer handle, which pushes deadlines back, and its
/// task, which takes the latest one before going to sleep.
#[derive(Clone, Default)]
pub(super) struct SharedDeadline {
    next: Arc<Mutex<Option<Instant>>>,
}

impl SharedDeadline {
    pub(super) fn set(&self, deadline: Instant) {
        self.next
            .lock()
            .expect("SharedDeadline.set() mutex guard poison")
            .replace(deadline);
    }

    /// None means nobody pushed the deadline since the task last took it.
    pub(super) fn take(&self) -> Option<Instant> {
        self.next.lock().expect("SharedDeadline.take() mutex guard poison").take()
    }
}
