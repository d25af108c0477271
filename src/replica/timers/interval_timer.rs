use crate::actor::WeakActorClient;
use crate::replica::timers::shared_deadline::SharedDeadline;
use crate::replica::timers::time::{Clock, RealClock};
use crate::replica::TimerEvent;
use tokio::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};

/// IntervalTimerHandle owns a task that delivers its event once per interval. Resetting pushes
/// the next tick a full interval out, e.g. after a heartbeat was sent for another reason.
/// Dropping the handle stops the task.
pub(crate) struct IntervalTimerHandle<C: Clock = RealClock> {
    next_tick: SharedDeadline,
    interval: Duration,
    clock: C,
    _stop_on_drop: DropGuard,
}

struct IntervalTimerTask<C: Clock> {
    next_tick: SharedDeadline,
    interval: Duration,
    actor_client: WeakActorClient,
    event: TimerEvent,
    clock: C,
    stopped: CancellationToken,
}

impl IntervalTimerHandle {
    pub(crate) fn spawn_timer_task(interval: Duration, actor_client: WeakActorClient, event: TimerEvent) -> Self {
        let (task, handle) = IntervalTimerTask::new(interval, actor_client, event, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> IntervalTimerHandle<C> {
    pub(crate) fn reset(&self) {
        self.next_tick.set(self.clock.now() + self.interval);
    }
}

impl<C: Clock> IntervalTimerTask<C> {
    fn new(
        interval: Duration,
        actor_client: WeakActorClient,
        event: TimerEvent,
        clock: C,
    ) -> (Self, IntervalTimerHandle<C>) {
        let next_tick = SharedDeadline::default();
        let stopped = CancellationToken::new();

        let task = IntervalTimerTask {
            next_tick: next_tick.clone(),
            interval,
            actor_client,
            event,
            clock: clock.clone(),
            stopped: stopped.clone(),
        };
        let handle = IntervalTimerHandle {
            next_tick,
            interval,
            clock,
            _stop_on_drop: stopped.drop_guard(),
        };

        (task, handle)
    }

    async fn run(mut self) {
        // No deadline is set initially, so the first tick goes out right away. A new leader wants
        // to reach every member ASAP.
        loop {
            match self.next_tick.take() {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.stopped.cancelled() => return,
                        _ = self.clock.sleep_until(deadline) => {}
                    }
                }
                None => {
                    if self.stopped.is_cancelled() || !self.actor_client.timer_event(self.event.clone()).await {
                        return;
                    }
                    self.next_tick.set(self.clock.now() + self.interval);
                }
            }
        }
    }
}
