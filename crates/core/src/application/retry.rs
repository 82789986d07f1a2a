// Retry logic for conversion/delivery attempts
use crate::domain::{clamp_priority, QueueItem, LOWEST_PRIORITY};
use std::time::Duration;
use tracing::{info, warn};

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the item pending again after this delay
    Retry(Duration),
    /// Attempt budget exhausted, item has failed permanently
    Failed,
}

/// Retry policy
///
/// Determines if an item should be retried based on:
/// - Attempts already made (counted by `mark_processing`)
/// - The item's `max_attempts`
/// - Exponential backoff from a base delay, capped at `max_delay`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    demote_priority: bool,
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Arguments
    /// * `base_delay` - Delay before the first retry
    /// * `max_delay` - Upper bound for any single delay
    ///
    /// # Example
    /// ```text
    /// let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(300));
    /// ```
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            demote_priority: false,
        }
    }

    /// Lower the priority of retried items by one step
    pub fn with_demotion(mut self, demote: bool) -> Self {
        self.demote_priority = demote;
        self
    }

    /// Determine if an item should be retried
    ///
    /// Backoff formula:
    /// delay = base_delay * 2^(attempts - 1) * (1.0 ± 0.1), capped at max_delay
    pub fn should_retry(&self, item: &QueueItem) -> RetryDecision {
        if !item.can_retry() {
            warn!(
                item_id = %item.id,
                attempts = %item.attempts,
                max_attempts = %item.max_attempts,
                "Max retry attempts reached"
            );
            return RetryDecision::Failed;
        }

        let exponent = item.attempts.saturating_sub(1).min(30) as i32;
        let base_ms = self.base_delay.as_millis() as f64 * 2f64.powi(exponent);

        // Item id as seed: deterministic ±10% jitter per item
        let jitter_seed = item.id.chars().map(|c| c as u32).sum::<u32>();
        let jitter_factor = 0.9 + ((jitter_seed % 21) as f64 / 100.0); // 0.9 to 1.1

        let delay_ms = (base_ms * jitter_factor).min(self.max_delay.as_millis() as f64);
        let delay = Duration::from_millis(delay_ms as u64);

        info!(
            item_id = %item.id,
            attempt = %item.attempts,
            max_attempts = %item.max_attempts,
            delay_ms = %delay.as_millis(),
            "Scheduling retry"
        );

        RetryDecision::Retry(delay)
    }

    /// Prepare an item for retry
    ///
    /// Back to pending, optionally one priority step lower
    pub fn prepare_for_retry(&self, item: &mut QueueItem) {
        if self.demote_priority && item.priority < LOWEST_PRIORITY {
            item.priority = clamp_priority(item.priority as i64 + 1);
        }
        item.reset_to_pending();

        info!(
            item_id = %item.id,
            attempt = %item.attempts,
            priority = %item.priority,
            "Item prepared for retry"
        );
    }
}
