//! Defines abstract traits for metrics reporting, decoupling core logic from the backend.

use once_cell::sync::OnceCell;

// --- Static Sink Access ---

/// A no-op sink for use in tests or when telemetry is disabled.
#[derive(Debug, Clone, Copy)]
pub struct NopSink;

/// A lazily-initialized static reference to the global `MetricsSink` implementation.
pub static SINK: OnceCell<&'static dyn MetricsSink> = OnceCell::new();
static NOP_SINK: NopSink = NopSink;

/// Returns a static reference to the configured audit metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn audit_metrics() -> &'static dyn AuditMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured policy metrics sink.
pub fn policy_metrics() -> &'static dyn PolicyMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured canary metrics sink.
pub fn canary_metrics() -> &'static dyn CanaryMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured consumer metrics sink.
pub fn consumer_metrics() -> &'static dyn ConsumerMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured multisig metrics sink.
pub fn multisig_metrics() -> &'static dyn MultisigMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured promotion metrics sink.
pub fn promotion_metrics() -> &'static dyn PromotionMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured signer metrics sink.
pub fn signer_metrics() -> &'static dyn SignerMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured gateway metrics sink.
pub fn gateway_metrics() -> &'static dyn GatewayMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured error metrics sink.
pub fn error_metrics() -> &'static dyn ErrorMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

// --- Trait Definitions ---

/// A sink for metrics related to the audit chain.
pub trait AuditMetricsSink: Send + Sync + std::fmt::Debug {
    /// Observes the latency of one append attempt, including retries.
    fn observe_append_duration(&self, duration_secs: f64);
    /// Increments the append counter, labeled by result (`ok`, `dedup`, `skipped`, `error`).
    fn inc_appends_total(&self, result: &str);
    /// Increments the append failure counter, labeled by reason.
    fn inc_append_failures(&self, reason: &'static str);
    /// Increments the counter of chain verification runs, labeled by outcome.
    fn inc_chain_verifications(&self, outcome: &str);
}
impl AuditMetricsSink for NopSink {
    fn observe_append_duration(&self, _duration_secs: f64) {}
    fn inc_appends_total(&self, _result: &str) {}
    fn inc_append_failures(&self, _reason: &'static str) {}
    fn inc_chain_verifications(&self, _outcome: &str) {}
}

/// A sink for metrics related to policy evaluation and the check path.
pub trait PolicyMetricsSink: Send + Sync + std::fmt::Debug {
    /// Observes the latency of a synchronous check call.
    fn observe_check_duration(&self, duration_secs: f64);
    /// Increments the decision counter, labeled by outcome (`allow`, `deny`, `default_allow`).
    fn inc_check_decisions(&self, outcome: &str);
    /// Increments the evaluator error counter. Errors are conservative non-matches.
    fn inc_evaluation_errors(&self);
    /// Increments the policy cache refresh counter.
    fn inc_cache_refreshes(&self);
}
impl PolicyMetricsSink for NopSink {
    fn observe_check_duration(&self, _duration_secs: f64) {}
    fn inc_check_decisions(&self, _outcome: &str) {}
    fn inc_evaluation_errors(&self) {}
    fn inc_cache_refreshes(&self) {}
}

/// A sink for metrics related to canary sampling and rollback.
pub trait CanaryMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the sample counter, labeled by policy and outcome.
    fn inc_samples(&self, policy: &str, outcome: &str);
    /// Increments the rollback counter, labeled by policy.
    fn inc_rollbacks(&self, policy: &str);
}
impl CanaryMetricsSink for NopSink {
    fn inc_samples(&self, _policy: &str, _outcome: &str) {}
    fn inc_rollbacks(&self, _policy: &str) {}
}

/// A sink for metrics related to the async event consumer.
pub trait ConsumerMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the processed-event counter, labeled by result (`ok`, `skipped`, `error`).
    fn inc_events_processed(&self, result: &str);
    /// Sets the gauge for the consumer's lag behind the chain head, in seconds.
    fn set_lag_seconds(&self, lag: f64);
}
impl ConsumerMetricsSink for NopSink {
    fn inc_events_processed(&self, _result: &str) {}
    fn set_lag_seconds(&self, _lag: f64) {}
}

/// A sink for metrics related to the multisig controller.
pub trait MultisigMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the transition counter, labeled by resulting state.
    fn inc_manifest_transitions(&self, state: &str);
    /// Increments the approval failure counter, labeled by reason.
    fn inc_approval_failures(&self, reason: &'static str);
}
impl MultisigMetricsSink for NopSink {
    fn inc_manifest_transitions(&self, _state: &str) {}
    fn inc_approval_failures(&self, _reason: &'static str) {}
}

/// A sink for metrics related to promotions.
pub trait PromotionMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the promotion counter, labeled by terminal status.
    fn inc_promotions(&self, status: &str);
}
impl PromotionMetricsSink for NopSink {
    fn inc_promotions(&self, _status: &str) {}
}

/// A sink for metrics related to the signer plane.
pub trait SignerMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the sign-operation counter, labeled by result.
    fn inc_sign_operations(&self, result: &str);
    /// Increments the probe failure counter, labeled by backend kid.
    fn inc_probe_failures(&self, kid: &str);
    /// Sets the readiness gauge (1 ready, 0 degraded).
    fn set_signer_ready(&self, ready: bool);
}
impl SignerMetricsSink for NopSink {
    fn inc_sign_operations(&self, _result: &str) {}
    fn inc_probe_failures(&self, _kid: &str) {}
    fn set_signer_ready(&self, _ready: bool) {}
}

/// A sink for metrics related to the public HTTP gateway.
pub trait GatewayMetricsSink: Send + Sync + std::fmt::Debug {
    /// Observes the latency of a gateway request, labeled by route.
    fn observe_request_duration(&self, route: &str, duration_secs: f64);
    /// Increments a counter for total gateway requests, labeled by route and status code.
    fn inc_requests_total(&self, route: &str, status_code: u16);
}
impl GatewayMetricsSink for NopSink {
    fn observe_request_duration(&self, _route: &str, _duration_secs: f64) {}
    fn inc_requests_total(&self, _route: &str, _status_code: u16) {}
}

/// A sink for recording structured error metrics.
pub trait ErrorMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments a counter for a specific error, categorized by its kind and variant.
    fn inc_error(&self, kind: &'static str, variant: &'static str);
}
impl ErrorMetricsSink for NopSink {
    fn inc_error(&self, _kind: &'static str, _variant: &'static str) {}
}

/// A unified sink that implements all domain-specific traits, providing a single
/// point of implementation for metrics backends like Prometheus.
pub trait MetricsSink:
    AuditMetricsSink
    + PolicyMetricsSink
    + CanaryMetricsSink
    + ConsumerMetricsSink
    + MultisigMetricsSink
    + PromotionMetricsSink
    + SignerMetricsSink
    + GatewayMetricsSink
    + ErrorMetricsSink
{
}

// Blanket implementation to allow any type that implements all sub-traits
// to be used as a `MetricsSink`.
impl<T> MetricsSink for T where
    T: AuditMetricsSink
        + PolicyMetricsSink
        + CanaryMetricsSink
        + ConsumerMetricsSink
        + MultisigMetricsSink
        + PromotionMetricsSink
        + SignerMetricsSink
        + GatewayMetricsSink
        + ErrorMetricsSink
{
}
