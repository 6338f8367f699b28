//! Prometheus metrics for settlement activity.
//!
//! This module provides metrics for:
//! - Event creation and resolution
//! - Mint and redemption counts and volumes
//! - Reporter polling and failures
//! - Per-operation latency

use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::debug;

use crate::registry::Outcome;

// === Metric Name Constants ===

/// Operation latency metric name.
pub const METRIC_OP_LATENCY: &str = "escrow_op_latency_ms";
/// Events created counter metric name.
pub const METRIC_EVENTS_CREATED: &str = "events_created_total";
/// Resolutions counter metric name.
pub const METRIC_RESOLUTIONS: &str = "resolutions_total";
/// Mints counter metric name.
pub const METRIC_MINTS: &str = "mints_total";
/// Minted collateral units counter metric name.
pub const METRIC_MINTED_UNITS: &str = "minted_units_total";
/// Paying redemptions counter metric name.
pub const METRIC_REDEMPTIONS: &str = "redemptions_total";
/// Redeemed collateral units counter metric name.
pub const METRIC_REDEEMED_UNITS: &str = "redeemed_units_total";
/// Reporter polls counter metric name.
pub const METRIC_REPORTER_POLLS: &str = "reporter_polls_total";
/// Reporter failures counter metric name.
pub const METRIC_REPORTER_FAILURES: &str = "reporter_failures_total";
/// Conservation violations counter metric name.
pub const METRIC_CONSERVATION_VIOLATIONS: &str = "conservation_violations_total";

/// Install the Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    init_metrics();
    Ok(handle)
}

/// Initialize all metric descriptions.
/// Call this once at startup to register metrics with descriptions.
pub fn init_metrics() {
    describe_histogram!(
        METRIC_OP_LATENCY,
        "Registry and engine operation latency in milliseconds"
    );

    describe_counter!(METRIC_EVENTS_CREATED, "Total number of events created");
    describe_counter!(METRIC_RESOLUTIONS, "Total number of events resolved");
    describe_counter!(METRIC_MINTS, "Total number of successful mints");
    describe_counter!(METRIC_MINTED_UNITS, "Collateral units deposited by mints");
    describe_counter!(METRIC_REDEMPTIONS, "Total number of paying redemptions");
    describe_counter!(METRIC_REDEEMED_UNITS, "Collateral units paid out by redemptions");
    describe_counter!(METRIC_REPORTER_POLLS, "Total number of reporter polls");
    describe_counter!(
        METRIC_REPORTER_FAILURES,
        "Reporter resolution attempts that failed"
    );
    describe_counter!(
        METRIC_CONSERVATION_VIOLATIONS,
        "Conservation invariant violations detected (should stay zero)"
    );

    debug!("Metrics initialized");
}

/// Increment events created counter.
pub fn inc_events_created() {
    counter!(METRIC_EVENTS_CREATED).increment(1);
}

/// Increment resolutions counter, labelled by outcome.
pub fn inc_resolutions(outcome: Outcome) {
    counter!(METRIC_RESOLUTIONS, "outcome" => outcome.to_string()).increment(1);
}

/// Record a successful mint.
pub fn record_mint(units: u64) {
    counter!(METRIC_MINTS).increment(1);
    counter!(METRIC_MINTED_UNITS).increment(units);
}

/// Record a paying redemption.
pub fn record_redemption(units: u64) {
    counter!(METRIC_REDEMPTIONS).increment(1);
    counter!(METRIC_REDEEMED_UNITS).increment(units);
}

/// Increment reporter polls counter.
pub fn inc_reporter_polls() {
    counter!(METRIC_REPORTER_POLLS).increment(1);
}

/// Increment reporter failures counter.
pub fn inc_reporter_failures() {
    counter!(METRIC_REPORTER_FAILURES).increment(1);
}

/// Increment conservation violations counter.
pub fn inc_conservation_violations() {
    counter!(METRIC_CONSERVATION_VIOLATIONS).increment(1);
}

/// RAII guard for timing operations.
/// Automatically records latency when dropped.
pub struct LatencyTimer {
    start: Instant,
    op: &'static str,
}

impl LatencyTimer {
    /// Create a new latency timer for the given operation.
    pub fn new(op: &'static str) -> Self {
        Self {
            start: Instant::now(),
            op,
        }
    }

    /// Get elapsed time in milliseconds (without recording).
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(METRIC_OP_LATENCY, "op" => self.op).record(self.elapsed_ms());
    }
}

/// Create a latency timer for a registry or engine operation.
pub fn timer_op(op: &'static str) -> LatencyTimer {
    LatencyTimer::new(op)
}
