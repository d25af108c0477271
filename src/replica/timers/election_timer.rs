use crate::actor::WeakActorClient;
use crate::replica::timers::shared_deadline::SharedDeadline;
use crate::replica::timers::time::{Clock, RealClock};
use crate::replica::{TimerEvent, TimerKind};
use rand::Rng;
use std::ops::RangeInclusive;
use tokio::time::{Duration, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};

/// ElectionTimerHandle owns a task that fires `ElectionTimeout` unless it keeps getting reset.
/// Dropping the handle stops the task.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    deadline: SharedDeadline,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
    _stop_on_drop: DropGuard,
}

struct ElectionTimerTask<C: Clock> {
    deadline: SharedDeadline,
    actor_client: WeakActorClient,
    event: TimerEvent,
    clock: C,
    stopped: CancellationToken,
    // Wait between repeated timeouts while nobody resets us, so the actor isn't flooded while it
    // polls or runs an election.
    retry_backoff: Duration,
}

impl ElectionTimerHandle {
    /// Timeouts are drawn uniformly from `[election_interval, 2 * election_interval]`.
    pub(crate) fn spawn_timer_task(election_interval: Duration, actor_client: WeakActorClient, epoch: u64) -> Self {
        let (task, handle) = ElectionTimerTask::new(
            election_interval,
            election_interval * 2,
            actor_client,
            epoch,
            RealClock,
        );
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> ElectionTimerHandle<C> {
    pub(crate) fn reset_timeout(&self) {
        self.deadline.set(self.random_deadline());
    }

    fn random_deadline(&self) -> Instant {
        let timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.clock.now() + timeout
    }
}

impl<C: Clock> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
        epoch: u64,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let deadline = SharedDeadline::default();
        let stopped = CancellationToken::new();

        let task = ElectionTimerTask {
            deadline: deadline.clone(),
            actor_client,
            event: TimerEvent {
                epoch,
                kind: TimerKind::ElectionTimeout,
            },
            clock: clock.clone(),
            stopped: stopped.clone(),
            retry_backoff: min_timeout,
        };
        let handle = ElectionTimerHandle {
            deadline,
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock,
            _stop_on_drop: stopped.drop_guard(),
        };

        // The task must find a deadline when it starts, otherwise it fires right away.
        handle.reset_timeout();

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.deadline.take() {
                Some(deadline) => {
                    // Somebody reset us since the last wake up. Sleep until the new deadline.
                    tokio::select! {
                        _ = self.stopped.cancelled() => return,
                        _ = self.clock.sleep_until(deadline) => {}
                    }
                }
                None => {
                    // Slept through the whole timeout without a reset.
                    if self.stopped.is_cancelled() || !self.actor_client.timer_event(self.event.clone()).await {
                        return;
                    }
                    tokio::select! {
                        _ = self.stopped.cancelled() => return,
                        _ = self.clock.sleep(self.retry_backoff) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::timers::test_utils::TestUtilActor;
    use crate::replica::timers::time;

    fn timeout_event(epoch: u64) -> TimerEvent {
        TimerEvent {
            epoch,
            kind: TimerKind::ElectionTimeout,
        }
    }

    #[tokio::test]
    async fn reset_postpones_timeout() {
        // -- setup --
        let timeout = Duration::from_millis(100);
        let (actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, mut clock_controller) = time::manual_clock();

        // Not testing jitter, so min == max.
        let (task, handle) = ElectionTimerTask::new(timeout, timeout, actor_client.weak(), 3, clock);
        tokio::task::spawn(task.run());

        // -- execute & verify --
        actor.assert_no_event().await;

        // Keep resetting at half the timeout, T=2.5 afterwards
        for _ in 0..5 {
            clock_controller.advance(timeout / 2);
            handle.reset_timeout();
        }
        actor.assert_no_event().await;
        assert_eq!(clock_controller.elapsed(), timeout * 5 / 2);

        // Last reset at T=2.5, so nothing fires before T=3.5
        let one_ns = Duration::from_nanos(1);
        clock_controller.advance(timeout - one_ns);
        actor.assert_no_event().await;

        clock_controller.advance(one_ns);
        actor.assert_timer_event(timeout_event(3)).await;
    }

    #[tokio::test]
    async fn keeps_firing_until_reset() {
        // -- setup --
        let timeout = Duration::from_millis(100);
        let (actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, mut clock_controller) = time::manual_clock();

        let (task, handle) = ElectionTimerTask::new(timeout, timeout, actor_client.weak(), 1, clock);
        tokio::task::spawn(task.run());

        // -- execute & verify --
        clock_controller.advance(timeout);
        actor.assert_timer_event(timeout_event(1)).await;

        // Nobody reset us, so the timeout repeats after the backoff.
        clock_controller.advance(timeout);
        actor.assert_timer_event(timeout_event(1)).await;

        // Reset is still honoured after timeouts fired
        handle.reset_timeout();
        clock_controller.advance(timeout / 2);
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn drop_stops_task() {
        // -- setup --
        let timeout = Duration::from_millis(100);
        let (actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, mut clock_controller) = time::manual_clock();

        let (task, handle) = ElectionTimerTask::new(timeout, timeout, actor_client.weak(), 1, clock);
        let join_handle = tokio::task::spawn(task.run());

        // -- execute --
        drop(handle);

        // -- verify --
        clock_controller.advance(timeout * 2);
        join_handle.await.unwrap();
        actor.assert_no_event().await;
    }
}
