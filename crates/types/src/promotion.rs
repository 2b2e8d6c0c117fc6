//! Artifact promotion records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal-monotonic promotion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    Pending,
    Accepted,
    Failed,
}

impl PromotionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PromotionStatus::Pending)
    }
}

/// A candidate promotion submitted by the eval engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionRequest {
    /// The artifact being promoted, e.g. `model:classifier@sha256:...`.
    pub artifact_ref: String,
    /// Target environment, e.g. `production`.
    pub environment: String,
    /// Capacity pool the allocation should come from.
    pub pool: String,
    /// Requested capacity delta.
    #[serde(default)]
    pub delta: u64,
    /// Aggregate evaluation score in [0, 1].
    pub score: f64,
    pub reason: String,
    /// Raw evaluation detail (per-metric scores etc.).
    #[serde(default)]
    pub evaluation: Value,
    /// Caller-supplied key collapsing repeat requests to one effect.
    pub idempotency_key: String,
}

/// A persisted promotion and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Promotion {
    pub id: String,
    pub artifact_ref: String,
    pub reason: String,
    pub score: f64,
    pub status: PromotionStatus,
    #[serde(default)]
    pub evaluation: Value,
    /// The sentinel verdict recorded for this promotion, if one was made.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentinel_decision: Option<Value>,
    pub idempotency_key: String,
    /// Audit event recorded for the terminal transition. Audit rows never
    /// reference promotions; this edge keeps the reference graph acyclic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminality() {
        assert!(!PromotionStatus::Pending.is_terminal());
        assert!(PromotionStatus::Accepted.is_terminal());
        assert!(PromotionStatus::Failed.is_terminal());
    }
}
