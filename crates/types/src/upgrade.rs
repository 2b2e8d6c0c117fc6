//! Multisig upgrade manifests and approvals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an upgrade manifest targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeTarget {
    /// Activate a policy version in the registry.
    Policy,
    /// Release / promote an artifact.
    Artifact,
    /// System-level change (e.g. signer removal).
    System,
}

/// Manifest lifecycle. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeState {
    Pending,
    Approved,
    Applied,
    Rejected,
    RolledBack,
}

impl UpgradeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpgradeState::Rejected | UpgradeState::RolledBack
        )
    }

    pub fn can_transition_to(self, next: UpgradeState) -> bool {
        use UpgradeState::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Applied)
                | (Approved, Rejected)
                | (Applied, RolledBack)
        )
    }
}

/// One collected approval. Unique per `(upgrade_id, approver_id)`; the
/// signature covers the canonical bytes of the manifest payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestApproval {
    pub upgrade_id: String,
    pub approver_id: String,
    /// Base64 signature over `canonical(payload)`.
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub approved_at: DateTime<Utc>,
}

/// An N-of-M upgrade manifest. Validity is the vector of independent
/// approver signatures, not a threshold-cryptography aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeManifest {
    pub id: String,
    pub target: UpgradeTarget,
    /// The change being authorized; the byte string signed by approvers is
    /// `canonical(payload)`.
    pub payload: Value,
    pub required_approvals: u32,
    /// Approver ids authorized to sign this manifest.
    pub threshold_set: Vec<String>,
    pub state: UpgradeState,
    #[serde(default)]
    pub approvals: Vec<ManifestApproval>,
    /// Audit events recorded for this manifest, in order.
    #[serde(default)]
    pub audit_event_ids: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_by: Option<String>,
    /// For rollback manifests: the applied manifest this one supersedes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolls_back: Option<String>,
}

/// Default approval quorum for new manifests.
pub fn default_required_approvals() -> u32 {
    3
}

impl UpgradeManifest {
    pub fn has_approval_from(&self, approver_id: &str) -> bool {
        self.approvals.iter().any(|a| a.approver_id == approver_id)
    }

    pub fn is_authorized_approver(&self, approver_id: &str) -> bool {
        self.threshold_set.iter().any(|a| a == approver_id)
    }

    pub fn quorum_met(&self) -> bool {
        self.approvals.len() as u32 >= self.required_approvals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(required: u32) -> UpgradeManifest {
        UpgradeManifest {
            id: "u-1".into(),
            target: UpgradeTarget::Policy,
            payload: json!({"policy_id": "p-1"}),
            required_approvals: required,
            threshold_set: vec!["sec-1".into(), "sec-2".into(), "sec-3".into()],
            state: UpgradeState::Pending,
            approvals: vec![],
            audit_event_ids: vec![],
            submitted_at: Utc::now(),
            applied_at: None,
            applied_by: None,
            rolls_back: None,
        }
    }

    #[test]
    fn state_machine_transitions() {
        use UpgradeState::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Applied));
        assert!(Applied.can_transition_to(RolledBack));
        assert!(!Applied.can_transition_to(Pending));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(Rejected.is_terminal());
        assert!(RolledBack.is_terminal());
        assert!(!Applied.is_terminal());
    }

    #[test]
    fn quorum_counts_approvals() {
        let mut m = manifest(2);
        assert!(!m.quorum_met());
        m.approvals.push(ManifestApproval {
            upgrade_id: "u-1".into(),
            approver_id: "sec-1".into(),
            signature: "sig".into(),
            notes: None,
            approved_at: Utc::now(),
        });
        assert!(!m.quorum_met());
        assert!(m.has_approval_from("sec-1"));
        assert!(m.is_authorized_approver("sec-2"));
        assert!(!m.is_authorized_approver("mallory"));
    }
}
