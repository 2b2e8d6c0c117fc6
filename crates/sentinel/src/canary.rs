//! Canary sampling and the automated rollback detector.
//!
//! Sampling is deterministic per `(policy, request)` so repeated
//! evaluations of the same event enforce identically. Each canary policy
//! owns a bounded ring buffer of observations; when the window fills and
//! the enforced-deny ratio crosses the threshold, the policy is deprecated
//! exactly once and the detector enters a cooldown.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sentinel_chain::AuditChain;
use sentinel_crypto::hash::sha256;
use sentinel_telemetry::canary_metrics;
use sentinel_types::audit::EVENT_CANARY_ROLLBACK;
use sentinel_types::config::CanaryConfig;
use sentinel_types::error::PolicyError;
use sentinel_types::policy::{CanarySample, Policy, PolicyState};
use serde_json::json;

use crate::registry::PolicyRegistry;

struct Window {
    samples: VecDeque<CanarySample>,
    cooldown_until: Option<Instant>,
}

impl Window {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            cooldown_until: None,
        }
    }
}

pub struct CanaryController {
    config: CanaryConfig,
    windows: DashMap<String, Window>,
}

impl CanaryController {
    pub fn new(config: CanaryConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Deterministic sampling: hash `(policy.id, request_id)` modulo 100
    /// against the policy's canary percentage.
    pub fn should_apply(&self, policy: &Policy, request_id: &str) -> bool {
        let preimage = [policy.id.as_bytes(), b"\x00", request_id.as_bytes()].concat();
        let digest = sha256(&preimage);
        let bucket = u64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]) % 100;
        bucket < u64::from(policy.canary_percent())
    }

    /// Records one observation. Returns `true` when this observation
    /// tripped the rollback detector: the window was full, the
    /// enforced-deny ratio reached the threshold, and the policy is not in
    /// cooldown. The caller performs the actual deprecation.
    pub fn record(&self, policy_id: &str, sample: CanarySample) -> bool {
        let outcome = match (sample.enforced, sample.allowed) {
            (true, false) => "enforced_deny",
            (true, true) => "enforced_allow",
            (false, _) => "observed",
        };
        canary_metrics().inc_samples(policy_id, outcome);

        let mut window = self
            .windows
            .entry(policy_id.to_string())
            .or_insert_with(Window::new);

        window.samples.push_back(sample);
        while window.samples.len() > self.config.window {
            window.samples.pop_front();
        }

        if window.samples.len() < self.config.window {
            return false;
        }
        if let Some(until) = window.cooldown_until {
            if until > Instant::now() {
                return false;
            }
        }

        let failures = window
            .samples
            .iter()
            .filter(|s| s.enforced && !s.allowed)
            .count();
        let ratio = failures as f64 / self.config.window as f64;
        if ratio < self.config.threshold {
            return false;
        }

        // Tripped. Clear the window and arm the cooldown so the rollback
        // fires exactly once.
        window.samples.clear();
        window.cooldown_until = Some(Instant::now() + Duration::from_secs(self.config.cooldown_secs));
        true
    }

    /// Whether further rollbacks for this policy are currently suppressed.
    pub fn in_cooldown(&self, policy_id: &str) -> bool {
        self.windows
            .get(policy_id)
            .and_then(|w| w.cooldown_until)
            .map(|until| until > Instant::now())
            .unwrap_or(false)
    }

    /// Current window aggregate for the inspection endpoint.
    pub fn window_stats(&self, policy_id: &str) -> CanaryWindowStats {
        match self.windows.get(policy_id) {
            None => CanaryWindowStats::default(),
            Some(w) => {
                let failures = w
                    .samples
                    .iter()
                    .filter(|s| s.enforced && !s.allowed)
                    .count();
                CanaryWindowStats {
                    samples: w.samples.len(),
                    window: self.config.window,
                    failure_ratio: if w.samples.is_empty() {
                        0.0
                    } else {
                        failures as f64 / w.samples.len() as f64
                    },
                    in_cooldown: w
                        .cooldown_until
                        .map(|until| until > Instant::now())
                        .unwrap_or(false),
                }
            }
        }
    }

    /// Applies a tripped rollback: deprecates the policy and appends the
    /// `policy.canary.rollback` audit event. The registry transition and
    /// the audit record both carry the failure context.
    pub async fn execute_rollback(
        &self,
        registry: &PolicyRegistry,
        chain: &AuditChain,
        policy: &Policy,
        reason: &str,
    ) -> Result<(), PolicyError> {
        let (rolled_back, _) =
            registry.transition(&policy.id, PolicyState::Deprecated, "canary-controller")?;
        canary_metrics().inc_rollbacks(&policy.name);
        tracing::warn!(
            target: "sentinel",
            policy = %policy.name,
            version = policy.version,
            reason,
            "canary rollback executed"
        );

        chain
            .append(
                EVENT_CANARY_ROLLBACK,
                json!({
                    "policy_id": rolled_back.id,
                    "policy_name": rolled_back.name,
                    "policy_version": rolled_back.version,
                    "reason": reason,
                    "window": self.config.window,
                    "threshold": self.config.threshold,
                }),
            )
            .await
            .map_err(|e| PolicyError::Backend(format!("rollback audit append failed: {}", e)))?;
        Ok(())
    }
}

/// Aggregate view of one policy's canary window.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CanaryWindowStats {
    pub samples: usize,
    pub window: usize,
    pub failure_ratio: f64,
    pub in_cooldown: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sentinel_types::policy::{Effect, PolicyMetadata, RuleNode, Severity};
    use serde_json::json;

    fn canary_policy(id: &str, percent: u8) -> Policy {
        Policy {
            id: id.into(),
            name: format!("policy-{}", id),
            version: 1,
            severity: Severity::Medium,
            rule: RuleNode::from_value(&json!(true)).unwrap(),
            metadata: PolicyMetadata {
                effect: Some(Effect::Deny),
                canary_percent: Some(percent),
                ..Default::default()
            },
            state: PolicyState::Canary,
            created_by: "t".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn config(window: usize, threshold: f64) -> CanaryConfig {
        CanaryConfig {
            window,
            threshold,
            cooldown_secs: 600,
        }
    }

    fn sample(enforced: bool, allowed: bool) -> CanarySample {
        CanarySample {
            enforced,
            allowed,
            effect: if allowed { Effect::Allow } else { Effect::Deny },
        }
    }

    #[test]
    fn sampling_is_deterministic() {
        let ctl = CanaryController::new(config(50, 0.3));
        let policy = canary_policy("p-1", 40);
        for req in ["r-1", "r-2", "r-3", "r-4"] {
            let first = ctl.should_apply(&policy, req);
            for _ in 0..10 {
                assert_eq!(ctl.should_apply(&policy, req), first);
            }
        }
    }

    #[test]
    fn full_percent_always_applies() {
        let ctl = CanaryController::new(config(50, 0.3));
        let policy = canary_policy("p-1", 100);
        for i in 0..100 {
            assert!(ctl.should_apply(&policy, &format!("req-{}", i)));
        }
    }

    #[test]
    fn sampling_rate_tracks_percent() {
        let ctl = CanaryController::new(config(50, 0.3));
        let policy = canary_policy("p-rate", 25);
        let hits = (0..2000)
            .filter(|i| ctl.should_apply(&policy, &format!("req-{}", i)))
            .count();
        // 25% ± a generous tolerance for hash dispersion.
        assert!((400..=600).contains(&hits), "hits = {}", hits);
    }

    #[test]
    fn rollback_fires_once_at_threshold() {
        let ctl = CanaryController::new(config(3, 0.5));
        // enforced-deny, enforced-allow, enforced-deny -> 2/3 >= 0.5
        assert!(!ctl.record("p-1", sample(true, false)));
        assert!(!ctl.record("p-1", sample(true, true)));
        assert!(ctl.record("p-1", sample(true, false)));
        assert!(ctl.in_cooldown("p-1"));

        // Cooldown suppresses the next trip even with a failing window.
        assert!(!ctl.record("p-1", sample(true, false)));
        assert!(!ctl.record("p-1", sample(true, false)));
        assert!(!ctl.record("p-1", sample(true, false)));
    }

    #[test]
    fn below_threshold_does_not_trip() {
        let ctl = CanaryController::new(config(4, 0.75));
        assert!(!ctl.record("p-1", sample(true, false)));
        assert!(!ctl.record("p-1", sample(true, true)));
        assert!(!ctl.record("p-1", sample(true, false)));
        // 2/4 = 0.5 < 0.75
        assert!(!ctl.record("p-1", sample(true, true)));
    }

    #[test]
    fn non_enforced_samples_do_not_count_as_failures() {
        let ctl = CanaryController::new(config(3, 0.5));
        assert!(!ctl.record("p-1", sample(false, false)));
        assert!(!ctl.record("p-1", sample(false, false)));
        assert!(!ctl.record("p-1", sample(true, false)));
        let stats = ctl.window_stats("p-1");
        assert_eq!(stats.samples, 3);
        assert!(stats.failure_ratio < 0.5);
    }

    #[test]
    fn windows_are_per_policy() {
        let ctl = CanaryController::new(config(2, 0.5));
        assert!(!ctl.record("a", sample(true, false)));
        assert!(!ctl.record("b", sample(true, false)));
        // Each policy needs its own full window.
        assert!(ctl.record("a", sample(true, false)));
        assert!(!ctl.in_cooldown("b"));
    }
}
