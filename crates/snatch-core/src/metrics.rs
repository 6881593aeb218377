use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Snatch-specific counters and histogram, registered into the daemon's
/// shared Prometheus registry at startup and shared with `SnatchEngine` so
/// the retry loop can record attempts/successes/rejections as they happen.
pub struct SnatchMetrics {
    pub launch_attempts_total: Counter,
    pub launch_successes_total: Counter,
    pub capacity_rejections_total: Counter,
    pub quota_refusals_total: Counter,
    pub attempts_to_success: Histogram,
}

impl SnatchMetrics {
    pub fn new(registry: &mut Registry) -> Arc<SnatchMetrics> {
        let launch_attempts_total = Counter::default();
        let launch_successes_total = Counter::default();
        let capacity_rejections_total = Counter::default();
        let quota_refusals_total = Counter::default();
        let attempts_to_success = Histogram::new([1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 34.0].into_iter());

        registry.register(
            "snatch_launch_attempts",
            "Total launch attempts issued by the retry loop",
            launch_attempts_total.clone(),
        );
        registry.register(
            "snatch_launch_successes",
            "Total snatch tasks that reached success",
            launch_successes_total.clone(),
        );
        registry.register(
            "snatch_capacity_rejections",
            "Total attempts classified as capacity/rate-limited",
            capacity_rejections_total.clone(),
        );
        registry.register(
            "snatch_quota_refusals",
            "Total launch requests refused by the pre-flight Micro-shape quota check",
            quota_refusals_total.clone(),
        );
        registry.register(
            "snatch_attempts_to_success",
            "Distribution of attempt_count at the moment a snatch succeeds",
            attempts_to_success.clone(),
        );

        Arc::new(SnatchMetrics {
            launch_attempts_total,
            launch_successes_total,
            capacity_rejections_total,
            quota_refusals_total,
            attempts_to_success,
        })
    }
}
