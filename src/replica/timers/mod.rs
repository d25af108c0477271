mod election_timer;
mod interval_timer;
mod shared_deadline;
mod time;

#[cfg(test)]
mod test_utils;

pub(crate) use election_timer::ElectionTimerHandle;
pub(crate) use interval_timer::IntervalTimerHandle;
