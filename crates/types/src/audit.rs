//! Audit-chain record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type emitted for every policy decision produced by the stream consumer.
pub const EVENT_POLICY_DECISION: &str = "policy.decision";
/// Event type emitted for decisions on `simulating` policies (never enforced).
pub const EVENT_POLICY_SIMULATION: &str = "policy.simulation";
/// Event type emitted whenever a policy row is created or mutated.
pub const EVENT_POLICY_UPDATED: &str = "policy.updated";
/// Event type emitted when the canary controller deprecates a policy.
pub const EVENT_CANARY_ROLLBACK: &str = "policy.canary.rollback";
/// Event type emitted when an upgrade manifest is submitted.
pub const EVENT_UPGRADE_SUBMITTED: &str = "upgrade.submitted";
/// Event type emitted for each verified manifest approval.
pub const EVENT_UPGRADE_APPROVED: &str = "upgrade.approved";
/// Event type emitted when a manifest reaches the `applied` state.
pub const EVENT_UPGRADE_APPLIED: &str = "upgrade.applied";
/// Event type emitted when a manifest is rejected.
pub const EVENT_UPGRADE_REJECTED: &str = "upgrade.rejected";
/// Event type emitted when an applied manifest is rolled back by a successor.
pub const EVENT_UPGRADE_ROLLED_BACK: &str = "upgrade.rolled_back";
/// Event type emitted when a promotion is denied or its allocation fails.
pub const EVENT_PROMOTION_FAILED: &str = "promotion.failed";
/// Event type emitted when a promotion is accepted and capacity reserved.
pub const EVENT_PROMOTION_ACCEPTED: &str = "promotion.accepted";

/// Receipt id returned for events the retention policy chose not to persist.
pub const SKIPPED_EVENT_ID: &str = "skipped";

/// A single record in the tamper-evident audit chain.
///
/// `hash` covers `(event_type, canonical(payload), prev_hash, ts)`;
/// `prev_hash` is the hash of the immediately preceding committed event,
/// absent only for the genesis record. Rows are never mutated after
/// commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    /// Unique event id (UUID v4).
    pub id: String,
    /// Dotted event type, e.g. `policy.decision`.
    pub event_type: String,
    /// Structured event payload.
    pub payload: Value,
    /// Hash of the previous committed event (lowercase hex), `None` for genesis.
    pub prev_hash: Option<String>,
    /// SHA-256 over the canonical preimage (lowercase hex). Unique across the chain.
    pub hash: String,
    /// Signature over the hash digest, base64.
    pub signature: String,
    /// Key id of the backend that produced `signature`.
    pub signer_kid: String,
    /// Commit timestamp.
    pub ts: DateTime<Utc>,
    /// Optional link to the manifest signature that authorized this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_signature_id: Option<String>,
    /// Physical retention horizon; rows are kept at least until this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_expires_at: Option<DateTime<Utc>>,
}

/// The result of an `append` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppendReceipt {
    pub id: String,
    /// Lowercase hex content hash of the committed (or pre-existing) row.
    pub hash: String,
    pub ts: DateTime<Utc>,
    /// True when an identical event already existed and no row was written.
    pub deduplicated: bool,
}

impl AppendReceipt {
    /// Receipt for an event the retention policy skipped. Nothing was persisted.
    pub fn skipped(ts: DateTime<Utc>) -> Self {
        Self {
            id: SKIPPED_EVENT_ID.to_string(),
            hash: String::new(),
            ts,
            deduplicated: false,
        }
    }

    pub fn was_skipped(&self) -> bool {
        self.id == SKIPPED_EVENT_ID
    }
}

/// Filter for `search` over the chain. Results come back in commit order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventQuery {
    /// Lower bound (inclusive) on the event timestamp.
    #[serde(default)]
    pub time_min: Option<DateTime<Utc>>,
    /// Restrict to a single event type.
    #[serde(default)]
    pub event_type: Option<String>,
    /// Maximum number of rows to return.
    #[serde(default = "default_query_limit")]
    pub limit: usize,
}

fn default_query_limit() -> usize {
    100
}

/// Formats an evidence reference linking a decision back to its source event.
pub fn evidence_ref(event_id: &str) -> String {
    format!("audit:{}", event_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_receipt_round_trips() {
        let r = AppendReceipt::skipped(Utc::now());
        assert!(r.was_skipped());
        assert!(r.hash.is_empty());
        assert!(!r.deduplicated);
    }

    #[test]
    fn evidence_ref_format() {
        assert_eq!(evidence_ref("abc"), "audit:abc");
    }
}
