//! Channel error types.

use std::time::Duration;
use thiserror::Error;

/// Errors returned when enqueueing onto a duplex channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel was closed locally or its pump terminated
    #[error("channel closed")]
    Closed,
}

/// In-flight sessions did not drain within the bound
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("timeout waiting for {remaining} session(s) to drain after {waited:?}")]
pub struct DrainTimeout {
    /// Sessions still open when the bound expired
    pub remaining: usize,
    /// How long we waited
    pub waited: Duration,
}

/// Shortest accepted TTL, idle timeout or keepalive period
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Longest accepted TTL, idle timeout or keepalive period
pub const MAX_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Rejected session or socket settings
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration outside the accepted range
    #[error("{name} must be between {min:?} and {max:?}, got {value:?}")]
    OutOfRange {
        name: &'static str,
        value: Duration,
        min: Duration,
        max: Duration,
    },

    /// An empty queue
    #[error("{name} must be at least 1")]
    ZeroCapacity { name: &'static str },
}

/// Accept `value` if it lies within [`MIN_PERIOD`, `MAX_PERIOD`]
pub fn check_period(name: &'static str, value: Duration) -> Result<Duration, ConfigError> {
    if (MIN_PERIOD..=MAX_PERIOD).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            min: MIN_PERIOD,
            max: MAX_PERIOD,
        })
    }
}

/// Refresh interval for a timeout: 9/10 of it, kept inside the accepted range
pub(crate) fn nine_tenths(timeout: Duration) -> Duration {
    (timeout - timeout / 10).clamp(MIN_PERIOD, MAX_PERIOD)
}
