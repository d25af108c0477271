#[cfg(test)]
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Clock is what timer tasks sleep on. Tests swap in `ManualClock` to step time by hand.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) fn manual_clock() -> (ManualClock, ManualClockController) {
    let start = Instant::now();
    let (tx, rx) = watch::channel(start);

    (ManualClock { now: rx }, ManualClockController { now: tx, start })
}

/// Time only moves when the paired `ManualClockController` advances it.
#[cfg(test)]
#[derive(Clone)]
pub(crate) struct ManualClock {
    now: watch::Receiver<Instant>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        loop {
            let now = *self.now.borrow();
            if now >= deadline {
                return;
            }
            if self.now.changed().await.is_err() {
                // Controller is gone, time stands still forever.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) struct ManualClockController {
    now: watch::Sender<Instant>,
    start: Instant,
}

#[cfg(test)]
impl ManualClockController {
    pub(crate) fn elapsed(&self) -> Duration {
        *self.now.borrow() - self.start
    }

    /// Sleepers wake once `now` is at or past their deadline, so advancing by a big leap wakes
    /// them late rather than once per missed deadline.
    pub(crate) fn advance(&mut self, duration: Duration) {
        let next = *self.now.borrow() + duration;
        let _ = self.now.send(next);
    }
}
