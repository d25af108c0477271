use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs of a raft node. Unset fields take their default.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    /// How often a leader contacts each follower when it has nothing to replicate.
    pub heartbeat_interval: Option<Duration>,
    /// Lower bound of the randomized election timeout. The upper bound is twice this.
    pub election_interval: Option<Duration>,
    /// How often a follower writes what it buffered to its log.
    pub flush_interval: Option<Duration>,
    /// Timeout of Poll and Vote requests.
    pub request_timeout: Option<Duration>,
    /// Timeout of a join, including the time listeners take to prepare for the new member.
    pub join_timeout: Option<Duration>,
    /// Initial byte capacity of the buffer of not yet written entries.
    pub append_buffer_capacity: Option<usize>,
}

#[derive(Clone, Debug)]
pub(crate) struct RaftOptionsValidated {
    pub(crate) heartbeat_interval: Duration,
    pub(crate) election_interval: Duration,
    pub(crate) flush_interval: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) join_timeout: Duration,
    pub(crate) append_buffer_capacity: usize,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.heartbeat_interval >= self.election_interval {
            return Err("Election interval must be greater than leader's heartbeat interval");
        }
        if self.request_timeout >= self.election_interval {
            return Err("Request timeout must be less than the election interval");
        }
        if self.flush_interval == Duration::from_millis(0) {
            return Err("Flush interval must be greater than zero");
        }
        if self.join_timeout == Duration::from_millis(0) {
            return Err("Join timeout must be greater than zero");
        }
        if self.append_buffer_capacity == 0 {
            return Err("Append buffer capacity must be greater than zero");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            heartbeat_interval: options.heartbeat_interval.unwrap_or(Duration::from_millis(100)),
            election_interval: options.election_interval.unwrap_or(Duration::from_millis(500)),
            flush_interval: options.flush_interval.unwrap_or(Duration::from_millis(10)),
            request_timeout: options.request_timeout.unwrap_or(Duration::from_millis(300)),
            join_timeout: options.join_timeout.unwrap_or(Duration::from_secs(5)),
            append_buffer_capacity: options.append_buffer_capacity.unwrap_or(32 * 1024),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();

        assert_eq!(options.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(options.election_interval, Duration::from_millis(500));
        assert_eq!(options.flush_interval, Duration::from_millis(10));
        assert_eq!(options.request_timeout, Duration::from_millis(300));
        assert_eq!(options.join_timeout, Duration::from_secs(5));
        assert_eq!(options.append_buffer_capacity, 32 * 1024);
    }

    #[test]
    fn illegal_options_are_rejected() {
        fn assert_illegal(options: RaftOptions) {
            assert!(RaftOptionsValidated::try_from(options).is_err());
        }

        assert_illegal(RaftOptions {
            heartbeat_interval: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        assert_illegal(RaftOptions {
            election_interval: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        assert_illegal(RaftOptions {
            flush_interval: Some(Duration::from_millis(0)),
            ..Default::default()
        });
        assert_illegal(RaftOptions {
            join_timeout: Some(Duration::from_millis(0)),
            ..Default::default()
        });
        assert_illegal(RaftOptions {
            append_buffer_capacity: Some(0),
            ..Default::default()
        });
    }

    #[test]
    fn overrides_are_kept() {
        let options = RaftOptionsValidated::try_from(RaftOptions {
            heartbeat_interval: Some(Duration::from_millis(20)),
            election_interval: Some(Duration::from_millis(150)),
            request_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(options.heartbeat_interval, Duration::from_millis(20));
        assert_eq!(options.election_interval, Duration::from_millis(150));
        assert_eq!(options.request_timeout, Duration::from_millis(50));
    }
}
