//! Backoff policies.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for (re)connecting a failover primary.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 5
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

/// Backoff for a feeder whose endpoint went away.
///
/// - Min delay: 250ms
/// - Max delay: 30s
/// - Max attempts: 20
/// - Jitter enabled
pub fn feeder_backoff() -> ExponentialBuilder {
    feeder_backoff_with(Duration::from_secs(30), 20)
}

/// Feeder backoff with a configured ceiling and attempt budget.
pub fn feeder_backoff_with(max_delay: Duration, max_times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250).min(max_delay))
        .with_max_delay(max_delay)
        .with_max_times(max_times)
        .with_jitter()
}
