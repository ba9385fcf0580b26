//! Prometheus instruments emitted by the policy
//!
//! The four scheduler metrics are recorded once per rebuild, labeled by the
//! channel target and the locality the policy serves. `WRR_UPDATES` counts
//! accepted resolver updates per target.

use std::sync::LazyLock;

use prometheus::{
    HistogramVec, IntCounterVec, Opts, exponential_buckets, histogram_opts,
    register_histogram_vec, register_int_counter_vec,
};

const NAMESPACE: &str = "lb_wrr";

fn register_int_counter_vec(name: &str, description: &str, label_names: &[&str]) -> IntCounterVec {
    let opts = Opts::new(name, description).namespace(NAMESPACE);
    register_int_counter_vec!(opts, label_names).expect("counter can be created")
}

fn register_histogram_vec(
    name: &str,
    description: &str,
    label_names: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let opts = histogram_opts!(name, description, buckets).namespace(NAMESPACE);
    register_histogram_vec!(opts, label_names).expect("histogram can be created")
}

/// Scheduler rebuilds that had too few endpoints with usable weights and
/// fell back to round-robin behavior.
pub static RR_FALLBACK: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec(
        "rr_fallback",
        "Number of scheduler updates with insufficient usable endpoint weights",
        &["target", "locality"],
    )
});

/// Endpoints per rebuild whose weight was unusable because no report has
/// arrived yet or the blackout period is still running.
pub static ENDPOINT_WEIGHT_NOT_YET_USABLE: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec(
        "endpoint_weight_not_yet_usable",
        "Number of endpoints per scheduler update without usable weight information",
        &["target", "locality"],
    )
});

/// Endpoints per rebuild whose latest report was older than the expiration
/// period.
pub static ENDPOINT_WEIGHT_STALE: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec(
        "endpoint_weight_stale",
        "Number of endpoints per scheduler update whose weight was older than the expiration period",
        &["target", "locality"],
    )
});

/// One sample per endpoint per rebuild; endpoints without usable weights
/// sample as 0.
pub static ENDPOINT_WEIGHTS: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec(
        "endpoint_weights",
        "Endpoint weight observed at each scheduler update",
        &["target", "locality"],
        exponential_buckets(1.0, 2.0, 20).expect("buckets can be created"),
    )
});

/// Resolver updates carrying a valid address list.
pub static WRR_UPDATES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec(
        "updates",
        "Number of accepted weighted_round_robin policy updates",
        &["target"],
    )
});
