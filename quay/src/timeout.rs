//! Timeouts for blocking queue operations.

use std::time::Duration;

use minstant::Instant;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

impl Timeout {
    /// Starts the clock for this timeout.
    #[must_use]
    pub fn start(self) -> Deadline {
        match self {
            Self::Infinite => Deadline(None),
            Self::Duration(d) => Deadline(Instant::now().checked_add(d)),
        }
    }
}

/// A started [`Timeout`].
///
/// `None` inside means "never expires" (also used when the duration
/// overflows the clock).
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never expires.
    pub const NEVER: Self = Self(None);

    /// Time left before expiry, `None` if the deadline never expires.
    ///
    /// Returns `Some(Duration::ZERO)` once expired.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| {
            at.checked_duration_since(Instant::now())
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Remaining time clamped to `slice`, for waits that must wake periodically.
    #[must_use]
    pub fn slice(&self, slice: Duration) -> Duration {
        self.remaining().map_or(slice, |left| left.min(slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_never_expires() {
        let deadline = Timeout::Infinite.start();
        assert!(!deadline.expired());
        assert_eq!(deadline.remaining(), None);
        assert_eq!(deadline.slice(Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[test]
    fn zero_duration_is_expired() {
        let deadline = Timeout::from(Duration::ZERO).start();
        assert!(deadline.expired());
    }

    #[test]
    fn remaining_is_bounded_by_duration() {
        let deadline = Timeout::from(Duration::from_secs(10)).start();
        let left = deadline.remaining().unwrap();
        assert!(left <= Duration::from_secs(10));
        assert!(left > Duration::from_secs(9));
        assert_eq!(deadline.slice(Duration::from_millis(3)), Duration::from_millis(3));
    }
}
