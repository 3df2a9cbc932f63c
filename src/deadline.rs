use std::time::Duration;
use tokio::time::Instant;

/// Absolute end of the current invocation. Every blocking wait in the engine
/// goes through [`Deadline::sleep`] so work stops when the window closes.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self { at: instant }
    }

    pub fn within(window: Duration) -> Self {
        Self {
            at: Instant::now() + window,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Sleep for `duration`, bounded by the deadline. Returns `true` when the
    /// full duration elapsed and `false` when the deadline cut the sleep short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.expired() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = tokio::time::sleep_until(self.at) => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_before_deadline() {
        let deadline = Deadline::within(Duration::from_secs(10));

        assert!(deadline.sleep(Duration::from_secs(1)).await);
        assert!(!deadline.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short_by_deadline() {
        let deadline = Deadline::within(Duration::from_secs(2));

        assert!(!deadline.sleep(Duration::from_secs(30)).await);
        assert!(deadline.expired());
        assert!(!deadline.sleep(Duration::from_millis(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down() {
        let deadline = Deadline::within(Duration::from_secs(8));
        tokio::time::advance(Duration::from_secs(3)).await;

        let remaining = deadline.remaining();
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining >= Duration::from_secs(4));
    }
}
