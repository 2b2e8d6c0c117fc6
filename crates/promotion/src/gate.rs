//! The sentinel gate in front of every promotion.
//!
//! Production wires the gate to the live CheckService; tests and small
//! deployments use the static client, which hard-codes the two policies
//! the promotion path is exercised with: a pool denylist and a capacity
//! delta ceiling, plus the minimum evaluation score.

use std::sync::Arc;

use async_trait::async_trait;
use sentinel_policy::{CheckRequest, CheckService};
use sentinel_types::error::PromotionError;
use sentinel_types::promotion::PromotionRequest;
use serde::Serialize;
use serde_json::json;

/// The sentinel verdict for one promotion.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<u32>,
}

impl GateDecision {
    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            policy_id: None,
            policy_version: None,
        }
    }
}

#[async_trait]
pub trait PromotionGate: Send + Sync {
    async fn evaluate(
        &self,
        req: &PromotionRequest,
        trace_id: &str,
    ) -> Result<GateDecision, PromotionError>;
}

/// Gate backed by the live check path.
pub struct CheckServiceGate {
    check: Arc<CheckService>,
    min_score: f64,
}

impl CheckServiceGate {
    pub fn new(check: Arc<CheckService>, min_score: f64) -> Self {
        Self { check, min_score }
    }
}

#[async_trait]
impl PromotionGate for CheckServiceGate {
    async fn evaluate(
        &self,
        req: &PromotionRequest,
        trace_id: &str,
    ) -> Result<GateDecision, PromotionError> {
        if req.score < self.min_score {
            return Ok(GateDecision::deny(format!(
                "score {} below minimum {}",
                req.score, self.min_score
            )));
        }
        let response = self
            .check
            .check(CheckRequest {
                action: "artifact.promote".into(),
                actor: json!({"id": "promotion-orchestrator"}),
                resource: json!({
                    "artifact_ref": req.artifact_ref,
                    "environment": req.environment,
                    "pool": req.pool,
                    "delta": req.delta,
                }),
                context: json!({"evaluation": req.evaluation}),
                request_id: Some(trace_id.to_string()),
            })
            .await
            .map_err(|e| PromotionError::Backend(e.to_string()))?;
        Ok(GateDecision {
            allowed: response.allowed,
            reason: response.reason,
            policy_id: response.policy_id,
            policy_version: response.policy_version,
        })
    }
}

/// Static sentinel client: `deny-pool(p)` and `max-delta(d)` plus the
/// minimum score.
pub struct StaticSentinel {
    pub min_score: f64,
    pub deny_pools: Vec<String>,
    pub max_delta: u64,
}

impl StaticSentinel {
    pub fn new(min_score: f64) -> Self {
        Self {
            min_score,
            deny_pools: Vec::new(),
            max_delta: u64::MAX,
        }
    }

    pub fn with_deny_pools(mut self, pools: Vec<String>) -> Self {
        self.deny_pools = pools;
        self
    }

    pub fn with_max_delta(mut self, max_delta: u64) -> Self {
        self.max_delta = max_delta;
        self
    }
}

#[async_trait]
impl PromotionGate for StaticSentinel {
    async fn evaluate(
        &self,
        req: &PromotionRequest,
        _trace_id: &str,
    ) -> Result<GateDecision, PromotionError> {
        if self.deny_pools.iter().any(|p| p == &req.pool) {
            return Ok(GateDecision::deny(format!(
                "pool '{}' is denylisted",
                req.pool
            )));
        }
        if req.delta > self.max_delta {
            return Ok(GateDecision::deny(format!(
                "requested delta {} exceeds limit {}",
                req.delta, self.max_delta
            )));
        }
        if req.score < self.min_score {
            return Ok(GateDecision::deny(format!(
                "score {} below minimum {}",
                req.score, self.min_score
            )));
        }
        Ok(GateDecision {
            allowed: true,
            reason: "static sentinel allowed".into(),
            policy_id: None,
            policy_version: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn request(pool: &str, delta: u64, score: f64) -> PromotionRequest {
        PromotionRequest {
            artifact_ref: "model:test@sha256:abc".into(),
            environment: "production".into(),
            pool: pool.into(),
            delta,
            score,
            reason: "eval passed".into(),
            evaluation: Value::Null,
            idempotency_key: "k".into(),
        }
    }

    #[tokio::test]
    async fn static_sentinel_denies_pool() {
        let gate = StaticSentinel::new(0.5).with_deny_pools(vec!["gpu-restricted".into()]);
        let d = gate
            .evaluate(&request("gpu-restricted", 1, 0.9), "t")
            .await
            .unwrap();
        assert!(!d.allowed);
        assert!(d.reason.contains("denylisted"));
    }

    #[tokio::test]
    async fn static_sentinel_caps_delta() {
        let gate = StaticSentinel::new(0.5).with_max_delta(8);
        let d = gate.evaluate(&request("gpu-a", 9, 0.9), "t").await.unwrap();
        assert!(!d.allowed);
        assert!(d.reason.contains("exceeds limit"));
        assert!(gate.evaluate(&request("gpu-a", 8, 0.9), "t").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn static_sentinel_enforces_min_score() {
        let gate = StaticSentinel::new(0.8);
        let d = gate.evaluate(&request("gpu-a", 1, 0.5), "t").await.unwrap();
        assert!(!d.allowed);
        assert!(d.reason.contains("below minimum"));
    }
}
