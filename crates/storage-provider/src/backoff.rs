//! Provides backoff timing control for retried work such as CSI calls and
//! status-update redelivery.
use std::time::Duration;

/// Determines how long to back off before performing a retry.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Resets the strategy after a success.
    fn reset(&mut self);
    /// Gets how long to wait before retrying.
    fn next_duration(&mut self) -> Duration;
    /// Waits the prescribed amount of time (as per `next_duration`).
    async fn wait(&mut self) {
        tokio::time::sleep(self.next_duration()).await
    }
}

/// A `BackoffStrategy` in which the durations increase exponentially
/// until hitting a cap.
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    cap: Duration,
    last_duration: Duration,
}

impl Default for ExponentialBackoffStrategy {
    /// Gets a backoff strategy with the status-update redelivery defaults.
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(300))
    }
}

impl ExponentialBackoffStrategy {
    pub fn new(base_duration: Duration, cap: Duration) -> Self {
        Self {
            base_duration,
            cap,
            last_duration: Duration::from_secs(0),
        }
    }

    fn capped_next_duration(&self) -> Duration {
        let next_duration = if self.last_duration == Duration::from_secs(0) {
            self.base_duration
        } else {
            self.last_duration * 2
        };

        if next_duration > self.cap {
            self.cap
        } else {
            next_duration
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.last_duration = Duration::from_secs(0);
    }

    fn next_duration(&mut self) -> Duration {
        let next_duration = self.capped_next_duration();
        self.last_duration = next_duration;
        next_duration
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_doubles_each_time() {
        let mut backoff = ExponentialBackoffStrategy::default();
        assert_eq!(backoff.next_duration(), Duration::from_secs(10));
        assert_eq!(backoff.next_duration(), Duration::from_secs(20));
        assert_eq!(backoff.next_duration(), Duration::from_secs(40));
        assert_eq!(backoff.next_duration(), Duration::from_secs(80));
    }

    #[test]
    fn after_reset_next_backoff_is_base() {
        let mut backoff = ExponentialBackoffStrategy::new(
            Duration::from_secs(1),
            Duration::from_secs(120),
        );
        assert_eq!(backoff.next_duration(), Duration::from_secs(1));
        assert_eq!(backoff.next_duration(), Duration::from_secs(2));
        backoff.reset();
        assert_eq!(backoff.next_duration(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_is_capped() {
        let mut backoff = ExponentialBackoffStrategy::new(
            Duration::from_secs(1),
            Duration::from_secs(4),
        );
        assert_eq!(backoff.next_duration(), Duration::from_secs(1));
        assert_eq!(backoff.next_duration(), Duration::from_secs(2));
        assert_eq!(backoff.next_duration(), Duration::from_secs(4));
        assert_eq!(backoff.next_duration(), Duration::from_secs(4));
    }
}
