use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Spacing between dependent requests against a rate-limited provider
///
/// A request scheduled after `last` may not start before `last + spacing`.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    spacing: Duration,
}

impl Pacer {
    pub fn new(spacing: Duration) -> Self {
        Self { spacing }
    }

    pub fn next_slot(&self, last: Instant) -> Instant {
        last + self.spacing
    }

    /// Suspends the calling task until the next slot. Dropping the future cancels the wait.
    pub async fn wait_for_slot(&self, last: Instant) {
        let slot = self.next_slot(last);
        let now = Instant::now();

        if slot > now {
            tracing::info!(
                "Waiting {:.1}s to respect the indicator provider rate limit",
                (slot - now).as_secs_f64()
            );
            sleep_until(slot).await;
        }
    }
}
