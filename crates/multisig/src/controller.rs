//! The upgrade manifest controller.
//!
//! ```text
//!             submit
//!   (absent) -------> pending
//!   pending --approve (signature verified)--> pending   [below quorum]
//!   pending --approve (final)----------------> approved
//!   approved --apply (all sigs verify)-------> applied
//!   pending/approved --reject----------------> rejected
//!   applied  --rollback (new manifest)-------> rolled_back
//! ```
//!
//! Every transition is recorded in the audit chain; the apply path
//! propagates an audit failure instead of proceeding unaudited.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use sentinel_chain::AuditChain;
use sentinel_crypto::ApproverKeyRegistry;
use sentinel_telemetry::multisig_metrics;
use sentinel_types::audit::{
    EVENT_UPGRADE_APPLIED, EVENT_UPGRADE_APPROVED, EVENT_UPGRADE_REJECTED,
    EVENT_UPGRADE_ROLLED_BACK, EVENT_UPGRADE_SUBMITTED,
};
use sentinel_types::codec;
use sentinel_types::error::UpgradeError;
use sentinel_types::upgrade::{
    default_required_approvals, ManifestApproval, UpgradeManifest, UpgradeState, UpgradeTarget,
};
use serde_json::{json, Value};

const UPGRADES: TableDefinition<&str, &[u8]> = TableDefinition::new("UPGRADES");

fn be(e: impl std::fmt::Display) -> UpgradeError {
    UpgradeError::Backend(e.to_string())
}

/// A new manifest submission.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SubmitUpgrade {
    pub target: UpgradeTarget,
    pub payload: Value,
    #[serde(default = "default_required_approvals")]
    pub required_approvals: u32,
    pub threshold_set: Vec<String>,
    /// For rollback manifests: the applied manifest being superseded.
    #[serde(default)]
    pub rolls_back: Option<String>,
}

/// Applies the authorized change when a manifest reaches quorum. The node
/// wires an executor that dispatches on the manifest target (policy
/// activation, artifact release, signer removal).
#[async_trait]
pub trait UpgradeExecutor: Send + Sync {
    async fn execute(&self, manifest: &UpgradeManifest) -> Result<(), UpgradeError>;
}

/// Executor that applies nothing. Used by tests and by deployments whose
/// apply side-effects run out-of-band.
pub struct NoopExecutor;

#[async_trait]
impl UpgradeExecutor for NoopExecutor {
    async fn execute(&self, _manifest: &UpgradeManifest) -> Result<(), UpgradeError> {
        Ok(())
    }
}

pub struct MultisigController {
    db: Arc<Database>,
    keys: Arc<ApproverKeyRegistry>,
    chain: AuditChain,
    executor: Arc<dyn UpgradeExecutor>,
}

impl MultisigController {
    pub fn new(
        db: Arc<Database>,
        keys: Arc<ApproverKeyRegistry>,
        chain: AuditChain,
        executor: Arc<dyn UpgradeExecutor>,
    ) -> Result<Self, UpgradeError> {
        let txn = db.begin_write().map_err(be)?;
        {
            txn.open_table(UPGRADES).map_err(be)?;
        }
        txn.commit().map_err(be)?;
        Ok(Self {
            db,
            keys,
            chain,
            executor,
        })
    }

    /// Submits a manifest in `pending` state and records
    /// `upgrade.submitted`.
    pub async fn submit(&self, submit: SubmitUpgrade) -> Result<UpgradeManifest, UpgradeError> {
        if submit.threshold_set.is_empty() {
            return Err(UpgradeError::InvalidManifest(
                "threshold set must not be empty".into(),
            ));
        }
        if submit.required_approvals == 0 {
            return Err(UpgradeError::InvalidManifest(
                "required approvals must be at least 1".into(),
            ));
        }
        if submit.required_approvals as usize > submit.threshold_set.len() {
            return Err(UpgradeError::InvalidManifest(format!(
                "required approvals {} exceeds threshold set size {}",
                submit.required_approvals,
                submit.threshold_set.len()
            )));
        }
        if let Some(rolled) = &submit.rolls_back {
            let target = self.get(rolled)?;
            if target.state != UpgradeState::Applied {
                return Err(UpgradeError::InvalidManifest(format!(
                    "manifest {} is not applied and cannot be rolled back",
                    rolled
                )));
            }
        }

        let mut manifest = UpgradeManifest {
            id: uuid::Uuid::new_v4().to_string(),
            target: submit.target,
            payload: submit.payload,
            required_approvals: submit.required_approvals,
            threshold_set: submit.threshold_set,
            state: UpgradeState::Pending,
            approvals: Vec::new(),
            audit_event_ids: Vec::new(),
            submitted_at: Utc::now(),
            applied_at: None,
            applied_by: None,
            rolls_back: submit.rolls_back,
        };

        let receipt = self
            .chain
            .append(
                EVENT_UPGRADE_SUBMITTED,
                json!({
                    "upgrade_id": manifest.id,
                    "target": manifest.target,
                    "required_approvals": manifest.required_approvals,
                    "threshold_set": manifest.threshold_set,
                }),
            )
            .await
            .map_err(|e| UpgradeError::Audit(e.to_string()))?;
        manifest.audit_event_ids.push(receipt.id);

        self.store(&manifest)?;
        multisig_metrics().inc_manifest_transitions("pending");
        tracing::info!(target: "multisig", upgrade_id = %manifest.id, "upgrade manifest submitted");
        Ok(manifest)
    }

    /// Records one approval. The signature must verify over
    /// `canonical(payload)` against the approver's registered key.
    pub async fn approve(
        &self,
        upgrade_id: &str,
        approver_id: &str,
        signature_b64: &str,
        notes: Option<String>,
    ) -> Result<UpgradeManifest, UpgradeError> {
        let mut manifest = self.get(upgrade_id)?;
        if manifest.state != UpgradeState::Pending {
            multisig_metrics().inc_approval_failures("wrong_state");
            return Err(UpgradeError::InvalidTransition {
                from: manifest.state,
                to: UpgradeState::Pending,
            });
        }
        if !manifest.is_authorized_approver(approver_id) {
            multisig_metrics().inc_approval_failures("unauthorized");
            return Err(UpgradeError::UnauthorizedApprover(approver_id.to_string()));
        }
        if manifest.has_approval_from(approver_id) {
            multisig_metrics().inc_approval_failures("duplicate");
            return Err(UpgradeError::DuplicateApproval {
                upgrade_id: upgrade_id.to_string(),
                approver_id: approver_id.to_string(),
            });
        }

        let message = codec::to_canonical_json(&manifest.payload)
            .map_err(UpgradeError::Serialization)?;
        let verified = self
            .keys
            .verify(approver_id, &message, signature_b64)
            .map_err(|e| UpgradeError::SignatureInvalid {
                approver_id: approver_id.to_string(),
                reason: e.to_string(),
            })?;
        if !verified {
            multisig_metrics().inc_approval_failures("bad_signature");
            return Err(UpgradeError::SignatureInvalid {
                approver_id: approver_id.to_string(),
                reason: "signature does not verify over canonical payload".into(),
            });
        }

        manifest.approvals.push(ManifestApproval {
            upgrade_id: upgrade_id.to_string(),
            approver_id: approver_id.to_string(),
            signature: signature_b64.to_string(),
            notes,
            approved_at: Utc::now(),
        });
        if manifest.quorum_met() {
            manifest.state = UpgradeState::Approved;
            multisig_metrics().inc_manifest_transitions("approved");
        }

        let receipt = self
            .chain
            .append(
                EVENT_UPGRADE_APPROVED,
                json!({
                    "upgrade_id": manifest.id,
                    "approver_id": approver_id,
                    "approvals": manifest.approvals.len(),
                    "required": manifest.required_approvals,
                }),
            )
            .await
            .map_err(|e| UpgradeError::Audit(e.to_string()))?;
        manifest.audit_event_ids.push(receipt.id);

        self.store(&manifest)?;
        tracing::info!(
            target: "multisig",
            upgrade_id = %manifest.id,
            approver = approver_id,
            approvals = manifest.approvals.len(),
            "manifest approval recorded"
        );
        Ok(manifest)
    }

    /// Applies an approved manifest. Every recorded signature is
    /// re-verified; any failure is fatal and blocks apply.
    pub async fn apply(
        &self,
        upgrade_id: &str,
        applied_by: &str,
    ) -> Result<UpgradeManifest, UpgradeError> {
        let mut manifest = self.get(upgrade_id)?;
        match manifest.state {
            UpgradeState::Approved => {}
            UpgradeState::Pending => {
                return Err(UpgradeError::InsufficientApprovals {
                    have: manifest.approvals.len() as u32,
                    need: manifest.required_approvals,
                });
            }
            other => {
                return Err(UpgradeError::Terminal {
                    id: manifest.id,
                    state: other,
                });
            }
        }
        if !manifest.quorum_met() {
            return Err(UpgradeError::InsufficientApprovals {
                have: manifest.approvals.len() as u32,
                need: manifest.required_approvals,
            });
        }

        let message = codec::to_canonical_json(&manifest.payload)
            .map_err(UpgradeError::Serialization)?;
        for approval in &manifest.approvals {
            let ok = self
                .keys
                .verify(&approval.approver_id, &message, &approval.signature)
                .map_err(|e| UpgradeError::SignatureInvalid {
                    approver_id: approval.approver_id.clone(),
                    reason: e.to_string(),
                })?;
            if !ok {
                return Err(UpgradeError::SignatureInvalid {
                    approver_id: approval.approver_id.clone(),
                    reason: "recorded signature failed re-verification at apply".into(),
                });
            }
        }

        self.executor.execute(&manifest).await?;

        manifest.state = UpgradeState::Applied;
        manifest.applied_at = Some(Utc::now());
        manifest.applied_by = Some(applied_by.to_string());

        let receipt = self
            .chain
            .append(
                EVENT_UPGRADE_APPLIED,
                json!({
                    "upgrade_id": manifest.id,
                    "target": manifest.target,
                    "applied_by": applied_by,
                    "approvals": manifest
                        .approvals
                        .iter()
                        .map(|a| a.approver_id.clone())
                        .collect::<Vec<_>>(),
                }),
            )
            .await
            .map_err(|e| UpgradeError::Audit(e.to_string()))?;
        manifest.audit_event_ids.push(receipt.id);

        self.store(&manifest)?;
        multisig_metrics().inc_manifest_transitions("applied");
        tracing::info!(target: "multisig", upgrade_id = %manifest.id, "manifest applied");

        // A rollback manifest supersedes its target on apply.
        if let Some(rolled_id) = manifest.rolls_back.clone() {
            self.mark_rolled_back(&rolled_id, &manifest.id).await?;
        }
        Ok(manifest)
    }

    /// Rejects a pending or approved manifest. Terminal.
    pub async fn reject(
        &self,
        upgrade_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<UpgradeManifest, UpgradeError> {
        let mut manifest = self.get(upgrade_id)?;
        if !matches!(
            manifest.state,
            UpgradeState::Pending | UpgradeState::Approved
        ) {
            return Err(UpgradeError::Terminal {
                id: manifest.id,
                state: manifest.state,
            });
        }
        manifest.state = UpgradeState::Rejected;

        let receipt = self
            .chain
            .append(
                EVENT_UPGRADE_REJECTED,
                json!({
                    "upgrade_id": manifest.id,
                    "actor": actor,
                    "reason": reason,
                }),
            )
            .await
            .map_err(|e| UpgradeError::Audit(e.to_string()))?;
        manifest.audit_event_ids.push(receipt.id);

        self.store(&manifest)?;
        multisig_metrics().inc_manifest_transitions("rejected");
        Ok(manifest)
    }

    async fn mark_rolled_back(
        &self,
        rolled_id: &str,
        by_manifest: &str,
    ) -> Result<(), UpgradeError> {
        let mut rolled = self.get(rolled_id)?;
        if rolled.state != UpgradeState::Applied {
            return Err(UpgradeError::InvalidTransition {
                from: rolled.state,
                to: UpgradeState::RolledBack,
            });
        }
        rolled.state = UpgradeState::RolledBack;

        let receipt = self
            .chain
            .append(
                EVENT_UPGRADE_ROLLED_BACK,
                json!({
                    "upgrade_id": rolled.id,
                    "rolled_back_by": by_manifest,
                }),
            )
            .await
            .map_err(|e| UpgradeError::Audit(e.to_string()))?;
        rolled.audit_event_ids.push(receipt.id);

        self.store(&rolled)?;
        multisig_metrics().inc_manifest_transitions("rolled_back");
        tracing::warn!(
            target: "multisig",
            upgrade_id = %rolled.id,
            by = by_manifest,
            "applied manifest rolled back"
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<UpgradeManifest, UpgradeError> {
        let txn = self.db.begin_read().map_err(be)?;
        let table = txn.open_table(UPGRADES).map_err(be)?;
        let row = table
            .get(id)
            .map_err(be)?
            .ok_or_else(|| UpgradeError::NotFound(id.to_string()))?;
        serde_json::from_slice(row.value())
            .map_err(|e| UpgradeError::Serialization(e.to_string()))
    }

    pub fn list(&self) -> Result<Vec<UpgradeManifest>, UpgradeError> {
        let txn = self.db.begin_read().map_err(be)?;
        let table = txn.open_table(UPGRADES).map_err(be)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(be)? {
            let (_, row) = item.map_err(be)?;
            out.push(
                serde_json::from_slice(row.value())
                    .map_err(|e| UpgradeError::Serialization(e.to_string()))?,
            );
        }
        Ok(out)
    }

    fn store(&self, manifest: &UpgradeManifest) -> Result<(), UpgradeError> {
        let row =
            serde_json::to_vec(manifest).map_err(|e| UpgradeError::Serialization(e.to_string()))?;
        let txn = self.db.begin_write().map_err(be)?;
        {
            let mut table = txn.open_table(UPGRADES).map_err(be)?;
            table.insert(manifest.id.as_str(), row.as_slice()).map_err(be)?;
        }
        txn.commit().map_err(be)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use sentinel_chain::RetentionPolicy;
    use sentinel_crypto::keys::{generate_keypair, sign_b64};
    use sentinel_crypto::{LocalDevSigner, SignerRegistry};
    use sentinel_types::audit::EventQuery;
    use sentinel_types::config::Environment;
    use std::collections::BTreeMap;

    struct Harness {
        controller: MultisigController,
        chain: AuditChain,
        keys: BTreeMap<String, SigningKey>,
    }

    async fn harness(dir: &tempfile::TempDir, approvers: &[&str]) -> Harness {
        let db = Arc::new(redb::Database::create(dir.path().join("upgrades.redb")).unwrap());
        let signer =
            LocalDevSigner::new("dev-test", b"0123456789abcdef", Environment::Development)
                .unwrap();
        let registry = Arc::new(SignerRegistry::new(vec![Arc::new(signer)]));
        registry.probe().await;
        let chain = AuditChain::new(db.clone(), registry, RetentionPolicy::default()).unwrap();

        let key_registry = Arc::new(ApproverKeyRegistry::new());
        let mut keys = BTreeMap::new();
        for approver in approvers {
            let (sk, vk) = generate_keypair();
            key_registry.register(approver, vk.as_bytes()).unwrap();
            keys.insert(approver.to_string(), sk);
        }

        let controller = MultisigController::new(
            db,
            key_registry,
            chain.clone(),
            Arc::new(NoopExecutor),
        )
        .unwrap();
        Harness {
            controller,
            chain,
            keys,
        }
    }

    fn approvers5() -> Vec<&'static str> {
        vec!["sec-1", "sec-2", "sec-3", "sec-4", "sec-5"]
    }

    fn submit_3_of_5() -> SubmitUpgrade {
        SubmitUpgrade {
            target: UpgradeTarget::Policy,
            payload: json!({"policy": "deny-burst", "version": 4}),
            required_approvals: 3,
            threshold_set: approvers5().into_iter().map(String::from).collect(),
            rolls_back: None,
        }
    }

    fn sign_payload(h: &Harness, approver: &str, payload: &Value) -> String {
        let message = codec::to_canonical_json(payload).unwrap();
        sign_b64(&h.keys[approver], &message)
    }

    #[tokio::test]
    async fn three_of_five_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(&dir, &approvers5()).await;

        let manifest = h.controller.submit(submit_3_of_5()).await.unwrap();
        assert_eq!(manifest.state, UpgradeState::Pending);

        for approver in ["sec-1", "sec-2"] {
            let sig = sign_payload(&h, approver, &manifest.payload);
            let m = h
                .controller
                .approve(&manifest.id, approver, &sig, None)
                .await
                .unwrap();
            assert_eq!(m.state, UpgradeState::Pending);
        }

        // Apply before the third approval: 400-class insufficient_approvals.
        let err = h.controller.apply(&manifest.id, "ops").await.unwrap_err();
        assert!(matches!(
            err,
            UpgradeError::InsufficientApprovals { have: 2, need: 3 }
        ));

        let sig = sign_payload(&h, "sec-3", &manifest.payload);
        let m = h
            .controller
            .approve(&manifest.id, "sec-3", &sig, Some("lgtm".into()))
            .await
            .unwrap();
        assert_eq!(m.state, UpgradeState::Approved);

        let applied = h.controller.apply(&manifest.id, "ops").await.unwrap();
        assert_eq!(applied.state, UpgradeState::Applied);
        assert_eq!(applied.applied_by.as_deref(), Some("ops"));
        assert_eq!(applied.approvals.len(), 3);

        // Audit trail: 1 submitted + 3 approved + 1 applied.
        let approved = h
            .chain
            .search(&EventQuery {
                time_min: None,
                event_type: Some(EVENT_UPGRADE_APPROVED.into()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(approved.len(), 3);
        let applied_events = h
            .chain
            .search(&EventQuery {
                time_min: None,
                event_type: Some(EVENT_UPGRADE_APPLIED.into()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(applied_events.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_approval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(&dir, &approvers5()).await;
        let manifest = h.controller.submit(submit_3_of_5()).await.unwrap();

        let sig = sign_payload(&h, "sec-1", &manifest.payload);
        h.controller
            .approve(&manifest.id, "sec-1", &sig, None)
            .await
            .unwrap();
        let err = h
            .controller
            .approve(&manifest.id, "sec-1", &sig, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpgradeError::DuplicateApproval { .. }));
    }

    #[tokio::test]
    async fn unauthorized_approver_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(&dir, &approvers5()).await;
        let manifest = h.controller.submit(submit_3_of_5()).await.unwrap();

        let err = h
            .controller
            .approve(&manifest.id, "mallory", "c2ln", None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpgradeError::UnauthorizedApprover(_)));
    }

    #[tokio::test]
    async fn signature_over_wrong_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(&dir, &approvers5()).await;
        let manifest = h.controller.submit(submit_3_of_5()).await.unwrap();

        let sig = sign_payload(&h, "sec-1", &json!({"different": "payload"}));
        let err = h
            .controller
            .approve(&manifest.id, "sec-1", &sig, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpgradeError::SignatureInvalid { .. }));
    }

    #[tokio::test]
    async fn terminal_manifests_are_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(&dir, &approvers5()).await;
        let manifest = h.controller.submit(submit_3_of_5()).await.unwrap();

        h.controller
            .reject(&manifest.id, "ops", "superseded")
            .await
            .unwrap();

        let sig = sign_payload(&h, "sec-1", &manifest.payload);
        assert!(h
            .controller
            .approve(&manifest.id, "sec-1", &sig, None)
            .await
            .is_err());
        assert!(matches!(
            h.controller.apply(&manifest.id, "ops").await.unwrap_err(),
            UpgradeError::Terminal { .. }
        ));
        assert!(h
            .controller
            .reject(&manifest.id, "ops", "again")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn rollback_requires_new_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(&dir, &approvers5()).await;

        // Apply an original 1-of-5 manifest.
        let original = h
            .controller
            .submit(SubmitUpgrade {
                required_approvals: 1,
                ..submit_3_of_5()
            })
            .await
            .unwrap();
        let sig = sign_payload(&h, "sec-1", &original.payload);
        h.controller
            .approve(&original.id, "sec-1", &sig, None)
            .await
            .unwrap();
        h.controller.apply(&original.id, "ops").await.unwrap();

        // A fresh manifest targeting the same entity performs the rollback.
        let rollback = h
            .controller
            .submit(SubmitUpgrade {
                target: UpgradeTarget::Policy,
                payload: json!({"revert": original.payload.clone()}),
                required_approvals: 1,
                threshold_set: approvers5().into_iter().map(String::from).collect(),
                rolls_back: Some(original.id.clone()),
            })
            .await
            .unwrap();
        let sig = sign_payload(&h, "sec-2", &rollback.payload);
        h.controller
            .approve(&rollback.id, "sec-2", &sig, None)
            .await
            .unwrap();
        h.controller.apply(&rollback.id, "ops").await.unwrap();

        assert_eq!(
            h.controller.get(&original.id).unwrap().state,
            UpgradeState::RolledBack
        );
        let rolled_events = h
            .chain
            .search(&EventQuery {
                time_min: None,
                event_type: Some(EVENT_UPGRADE_ROLLED_BACK.into()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(rolled_events.len(), 1);
    }
}
