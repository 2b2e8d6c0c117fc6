//! A concrete implementation of the metrics sinks using the Prometheus crate.

use crate::sinks::*;
use once_cell::sync::OnceCell;
use prometheus::{
    exponential_buckets, register_gauge, register_histogram, register_histogram_vec,
    register_int_counter_vec, Gauge, Histogram, HistogramVec, IntCounterVec,
};

// --- Metric Statics ---
// We use OnceCell to hold the metric collectors. They will be initialized
// exactly once by the `install` function.

static AUDIT_APPEND_DURATION_SECONDS: OnceCell<Histogram> = OnceCell::new();
static AUDIT_APPENDS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static AUDIT_APPEND_FAILURES_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static AUDIT_CHAIN_VERIFICATIONS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static CHECK_DURATION_SECONDS: OnceCell<Histogram> = OnceCell::new();
static CHECK_DECISIONS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static POLICY_EVALUATION_ERRORS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static POLICY_CACHE_REFRESHES_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static CANARY_SAMPLES_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static CANARY_ROLLBACKS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static CONSUMER_EVENTS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static CONSUMER_LAG_SECONDS: OnceCell<Gauge> = OnceCell::new();
static MULTISIG_TRANSITIONS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static MULTISIG_APPROVAL_FAILURES_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static PROMOTIONS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static SIGNER_OPERATIONS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static SIGNER_PROBE_FAILURES_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static SIGNER_READY: OnceCell<Gauge> = OnceCell::new();
static GATEWAY_REQUESTS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static GATEWAY_REQUEST_DURATION_SECONDS: OnceCell<HistogramVec> = OnceCell::new();
static ERRORS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();

#[derive(Debug, Clone, Copy)]
pub struct PrometheusSink;

/// Helper macro to reduce boilerplate for getting a metric from OnceCell.
/// This will panic if `install()` has not been called, which is intentional
/// as it indicates a critical application setup error.
macro_rules! get_metric {
    ($metric:ident) => {
        $metric
            .get()
            .expect("Prometheus sink not initialized. Call telemetry::prometheus::install() first.")
    };
}

impl AuditMetricsSink for PrometheusSink {
    fn observe_append_duration(&self, duration_secs: f64) {
        get_metric!(AUDIT_APPEND_DURATION_SECONDS).observe(duration_secs);
    }
    fn inc_appends_total(&self, result: &str) {
        get_metric!(AUDIT_APPENDS_TOTAL)
            .with_label_values(&[result])
            .inc();
    }
    fn inc_append_failures(&self, reason: &'static str) {
        get_metric!(AUDIT_APPEND_FAILURES_TOTAL)
            .with_label_values(&[reason])
            .inc();
    }
    fn inc_chain_verifications(&self, outcome: &str) {
        get_metric!(AUDIT_CHAIN_VERIFICATIONS_TOTAL)
            .with_label_values(&[outcome])
            .inc();
    }
}

impl PolicyMetricsSink for PrometheusSink {
    fn observe_check_duration(&self, duration_secs: f64) {
        get_metric!(CHECK_DURATION_SECONDS).observe(duration_secs);
    }
    fn inc_check_decisions(&self, outcome: &str) {
        get_metric!(CHECK_DECISIONS_TOTAL)
            .with_label_values(&[outcome])
            .inc();
    }
    fn inc_evaluation_errors(&self) {
        get_metric!(POLICY_EVALUATION_ERRORS_TOTAL)
            .with_label_values(&["evaluator"])
            .inc();
    }
    fn inc_cache_refreshes(&self) {
        get_metric!(POLICY_CACHE_REFRESHES_TOTAL)
            .with_label_values(&["registry"])
            .inc();
    }
}

impl CanaryMetricsSink for PrometheusSink {
    fn inc_samples(&self, policy: &str, outcome: &str) {
        get_metric!(CANARY_SAMPLES_TOTAL)
            .with_label_values(&[policy, outcome])
            .inc();
    }
    fn inc_rollbacks(&self, policy: &str) {
        get_metric!(CANARY_ROLLBACKS_TOTAL)
            .with_label_values(&[policy])
            .inc();
    }
}

impl ConsumerMetricsSink for PrometheusSink {
    fn inc_events_processed(&self, result: &str) {
        get_metric!(CONSUMER_EVENTS_TOTAL)
            .with_label_values(&[result])
            .inc();
    }
    fn set_lag_seconds(&self, lag: f64) {
        get_metric!(CONSUMER_LAG_SECONDS).set(lag);
    }
}

impl MultisigMetricsSink for PrometheusSink {
    fn inc_manifest_transitions(&self, state: &str) {
        get_metric!(MULTISIG_TRANSITIONS_TOTAL)
            .with_label_values(&[state])
            .inc();
    }
    fn inc_approval_failures(&self, reason: &'static str) {
        get_metric!(MULTISIG_APPROVAL_FAILURES_TOTAL)
            .with_label_values(&[reason])
            .inc();
    }
}

impl PromotionMetricsSink for PrometheusSink {
    fn inc_promotions(&self, status: &str) {
        get_metric!(PROMOTIONS_TOTAL)
            .with_label_values(&[status])
            .inc();
    }
}

impl SignerMetricsSink for PrometheusSink {
    fn inc_sign_operations(&self, result: &str) {
        get_metric!(SIGNER_OPERATIONS_TOTAL)
            .with_label_values(&[result])
            .inc();
    }
    fn inc_probe_failures(&self, kid: &str) {
        get_metric!(SIGNER_PROBE_FAILURES_TOTAL)
            .with_label_values(&[kid])
            .inc();
    }
    fn set_signer_ready(&self, ready: bool) {
        get_metric!(SIGNER_READY).set(if ready { 1.0 } else { 0.0 });
    }
}

impl GatewayMetricsSink for PrometheusSink {
    fn observe_request_duration(&self, route: &str, duration_secs: f64) {
        get_metric!(GATEWAY_REQUEST_DURATION_SECONDS)
            .with_label_values(&[route])
            .observe(duration_secs);
    }
    fn inc_requests_total(&self, route: &str, status_code: u16) {
        get_metric!(GATEWAY_REQUESTS_TOTAL)
            .with_label_values(&[route, &status_code.to_string()])
            .inc();
    }
}

impl ErrorMetricsSink for PrometheusSink {
    fn inc_error(&self, kind: &'static str, variant: &'static str) {
        get_metric!(ERRORS_TOTAL)
            .with_label_values(&[kind, variant])
            .inc();
    }
}

/// Initializes all Prometheus metrics collectors and returns a static reference to the sink.
/// This function must be called only once at application startup.
#[allow(clippy::expect_used)]
pub fn install() -> Result<&'static dyn MetricsSink, prometheus::Error> {
    AUDIT_APPEND_DURATION_SECONDS
        .set(register_histogram!(
            "sentinel_audit_append_duration_seconds",
            "Latency of one audit append, including retries.",
            exponential_buckets(0.0005, 2.0, 15)?
        )?)
        .expect("static already initialized");
    AUDIT_APPENDS_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_audit_appends_total",
            "Total audit append calls.",
            &["result"]
        )?)
        .expect("static already initialized");
    AUDIT_APPEND_FAILURES_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_audit_append_failures_total",
            "Total failed audit appends after retry exhaustion.",
            &["reason"]
        )?)
        .expect("static already initialized");
    AUDIT_CHAIN_VERIFICATIONS_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_audit_chain_verifications_total",
            "Total full-chain verification runs.",
            &["outcome"]
        )?)
        .expect("static already initialized");
    CHECK_DURATION_SECONDS
        .set(register_histogram!(
            "sentinel_check_duration_seconds",
            "Latency of the synchronous policy check path.",
            exponential_buckets(0.0001, 2.0, 16)?
        )?)
        .expect("static already initialized");
    CHECK_DECISIONS_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_check_decisions_total",
            "Total check decisions by outcome.",
            &["outcome"]
        )?)
        .expect("static already initialized");
    POLICY_EVALUATION_ERRORS_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_policy_evaluation_errors_total",
            "Total evaluator errors treated as non-matches.",
            &["source"]
        )?)
        .expect("static already initialized");
    POLICY_CACHE_REFRESHES_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_policy_cache_refreshes_total",
            "Total policy cache refreshes.",
            &["cache"]
        )?)
        .expect("static already initialized");
    CANARY_SAMPLES_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_canary_samples_total",
            "Total canary decisions recorded.",
            &["policy", "outcome"]
        )?)
        .expect("static already initialized");
    CANARY_ROLLBACKS_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_canary_rollbacks_total",
            "Total automated canary rollbacks.",
            &["policy"]
        )?)
        .expect("static already initialized");
    CONSUMER_EVENTS_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_consumer_events_total",
            "Total audit events processed by the stream consumer.",
            &["result"]
        )?)
        .expect("static already initialized");
    CONSUMER_LAG_SECONDS
        .set(register_gauge!(
            "sentinel_consumer_lag_seconds",
            "Consumer lag behind the chain head."
        )?)
        .expect("static already initialized");
    MULTISIG_TRANSITIONS_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_multisig_transitions_total",
            "Total upgrade manifest state transitions.",
            &["state"]
        )?)
        .expect("static already initialized");
    MULTISIG_APPROVAL_FAILURES_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_multisig_approval_failures_total",
            "Total rejected manifest approvals.",
            &["reason"]
        )?)
        .expect("static already initialized");
    PROMOTIONS_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_promotions_total",
            "Total promotions by terminal status.",
            &["status"]
        )?)
        .expect("static already initialized");
    SIGNER_OPERATIONS_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_signer_operations_total",
            "Total digest sign operations.",
            &["result"]
        )?)
        .expect("static already initialized");
    SIGNER_PROBE_FAILURES_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_signer_probe_failures_total",
            "Total signer readiness probe failures.",
            &["kid"]
        )?)
        .expect("static already initialized");
    SIGNER_READY
        .set(register_gauge!(
            "sentinel_signer_ready",
            "Whether a signing backend is currently ready (1) or degraded (0)."
        )?)
        .expect("static already initialized");
    GATEWAY_REQUESTS_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_gateway_requests_total",
            "Total gateway HTTP requests.",
            &["route", "status"]
        )?)
        .expect("static already initialized");
    GATEWAY_REQUEST_DURATION_SECONDS
        .set(register_histogram_vec!(
            "sentinel_gateway_request_duration_seconds",
            "Latency of gateway HTTP requests.",
            &["route"],
            exponential_buckets(0.001, 2.0, 15)?
        )?)
        .expect("static already initialized");
    ERRORS_TOTAL
        .set(register_int_counter_vec!(
            "sentinel_errors_total",
            "Total number of errors, categorized by type and variant.",
            &["kind", "variant"]
        )?)
        .expect("static already initialized");

    static SINK: PrometheusSink = PrometheusSink;
    Ok(&SINK)
}
