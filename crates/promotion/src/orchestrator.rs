//! The promotion orchestrator.
//!
//! For each candidate: idempotency check, a pending row, the sentinel
//! gate, the allocator call, and a terminal status with the audit record.
//! Promotion rows reference audit events by id and never the other way
//! around, keeping the reference graph a DAG.

use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use sentinel_chain::AuditChain;
use sentinel_telemetry::promotion_metrics;
use sentinel_types::audit::{EVENT_PROMOTION_ACCEPTED, EVENT_PROMOTION_FAILED};
use sentinel_types::error::PromotionError;
use sentinel_types::promotion::{Promotion, PromotionRequest, PromotionStatus};
use serde_json::json;

use crate::allocator::{AllocationRequest, ResourceAllocator};
use crate::gate::PromotionGate;

const PROMOTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("PROMOTIONS");
const BY_KEY: TableDefinition<&str, &str> = TableDefinition::new("PROMOTION_BY_KEY");

fn be(e: impl std::fmt::Display) -> PromotionError {
    PromotionError::Backend(e.to_string())
}

pub struct PromotionOrchestrator {
    db: Arc<Database>,
    gate: Arc<dyn PromotionGate>,
    allocator: Arc<dyn ResourceAllocator>,
    chain: AuditChain,
}

impl PromotionOrchestrator {
    pub fn new(
        db: Arc<Database>,
        gate: Arc<dyn PromotionGate>,
        allocator: Arc<dyn ResourceAllocator>,
        chain: AuditChain,
    ) -> Result<Self, PromotionError> {
        let txn = db.begin_write().map_err(be)?;
        {
            txn.open_table(PROMOTIONS).map_err(be)?;
            txn.open_table(BY_KEY).map_err(be)?;
        }
        txn.commit().map_err(be)?;
        Ok(Self {
            db,
            gate,
            allocator,
            chain,
        })
    }

    /// Runs one promotion to a terminal status. A repeat call with the
    /// same idempotency key returns the stored record without side
    /// effects.
    pub async fn promote(&self, req: PromotionRequest) -> Result<Promotion, PromotionError> {
        if req.artifact_ref.is_empty() {
            return Err(PromotionError::Invalid("artifact_ref is required".into()));
        }
        if req.idempotency_key.is_empty() {
            return Err(PromotionError::Invalid("idempotency_key is required".into()));
        }
        if !(0.0..=1.0).contains(&req.score) {
            return Err(PromotionError::Invalid(format!(
                "score {} outside [0, 1]",
                req.score
            )));
        }

        if let Some(existing) = self.get_by_key(&req.idempotency_key)? {
            tracing::debug!(
                target: "promotion",
                key = %req.idempotency_key,
                id = %existing.id,
                "idempotent replay returned stored promotion"
            );
            return Ok(existing);
        }

        let trace_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut promotion = Promotion {
            id: uuid::Uuid::new_v4().to_string(),
            artifact_ref: req.artifact_ref.clone(),
            reason: req.reason.clone(),
            score: req.score,
            status: PromotionStatus::Pending,
            evaluation: req.evaluation.clone(),
            sentinel_decision: None,
            idempotency_key: req.idempotency_key.clone(),
            event_id: None,
            created_at: now,
            updated_at: now,
        };
        // Persist the pending row; the key index insert races against
        // concurrent replays, and the loser returns the winner's record.
        if !self.try_insert_pending(&promotion)? {
            if let Some(existing) = self.get_by_key(&req.idempotency_key)? {
                return Ok(existing);
            }
            return Err(PromotionError::Backend(
                "idempotency index contention".into(),
            ));
        }

        let decision = self.gate.evaluate(&req, &trace_id).await?;
        promotion.sentinel_decision = Some(serde_json::to_value(&decision)?);

        if !decision.allowed {
            return self
                .finish_failed(promotion, &trace_id, &decision.reason)
                .await;
        }

        let allocation = self
            .allocator
            .allocate(&AllocationRequest {
                artifact_ref: req.artifact_ref.clone(),
                environment: req.environment.clone(),
                pool: req.pool.clone(),
                delta: req.delta,
                trace_id: trace_id.clone(),
            })
            .await;

        match allocation {
            Ok(response) => {
                promotion.status = PromotionStatus::Accepted;
                promotion.updated_at = Utc::now();
                let receipt = self
                    .chain
                    .append(
                        EVENT_PROMOTION_ACCEPTED,
                        json!({
                            "promotion_id": promotion.id,
                            "artifact_ref": promotion.artifact_ref,
                            "allocation_id": response.allocation_id,
                            "pool": response.pool,
                            "score": promotion.score,
                            "trace_id": trace_id,
                        }),
                    )
                    .await
                    .map_err(|e| PromotionError::Audit(e.to_string()))?;
                promotion.event_id = Some(receipt.id);
                self.store(&promotion)?;
                promotion_metrics().inc_promotions("accepted");
                tracing::info!(
                    target: "promotion",
                    id = %promotion.id,
                    artifact = %promotion.artifact_ref,
                    trace_id = %trace_id,
                    "promotion accepted"
                );
                Ok(promotion)
            }
            Err(e) => {
                self.finish_failed(promotion, &trace_id, &format!("allocation failed: {}", e))
                    .await
            }
        }
    }

    async fn finish_failed(
        &self,
        mut promotion: Promotion,
        trace_id: &str,
        reason: &str,
    ) -> Result<Promotion, PromotionError> {
        promotion.status = PromotionStatus::Failed;
        promotion.updated_at = Utc::now();
        let receipt = self
            .chain
            .append(
                EVENT_PROMOTION_FAILED,
                json!({
                    "promotion_id": promotion.id,
                    "artifact_ref": promotion.artifact_ref,
                    "reason": reason,
                    "sentinel_decision": promotion.sentinel_decision,
                    "score": promotion.score,
                    "trace_id": trace_id,
                }),
            )
            .await
            .map_err(|e| PromotionError::Audit(e.to_string()))?;
        promotion.event_id = Some(receipt.id);
        self.store(&promotion)?;
        promotion_metrics().inc_promotions("failed");
        tracing::warn!(
            target: "promotion",
            id = %promotion.id,
            artifact = %promotion.artifact_ref,
            reason,
            trace_id,
            "promotion failed"
        );
        Ok(promotion)
    }

    pub fn get(&self, id: &str) -> Result<Promotion, PromotionError> {
        let txn = self.db.begin_read().map_err(be)?;
        let table = txn.open_table(PROMOTIONS).map_err(be)?;
        let row = table
            .get(id)
            .map_err(be)?
            .ok_or_else(|| PromotionError::NotFound(id.to_string()))?;
        serde_json::from_slice(row.value()).map_err(Into::into)
    }

    pub fn get_by_key(&self, key: &str) -> Result<Option<Promotion>, PromotionError> {
        let txn = self.db.begin_read().map_err(be)?;
        let by_key = txn.open_table(BY_KEY).map_err(be)?;
        let Some(id_guard) = by_key.get(key).map_err(be)? else {
            return Ok(None);
        };
        let id = id_guard.value().to_string();
        drop(id_guard);
        drop(by_key);
        let table = txn.open_table(PROMOTIONS).map_err(be)?;
        let result = match table.get(id.as_str()).map_err(be)? {
            Some(row) => Ok(Some(serde_json::from_slice(row.value())?)),
            None => Ok(None),
        };
        result
    }

    /// Inserts the pending row iff the idempotency key is unclaimed.
    fn try_insert_pending(&self, promotion: &Promotion) -> Result<bool, PromotionError> {
        let row = serde_json::to_vec(promotion)?;
        let txn = self.db.begin_write().map_err(be)?;
        let inserted = {
            let mut by_key = txn.open_table(BY_KEY).map_err(be)?;
            if by_key
                .get(promotion.idempotency_key.as_str())
                .map_err(be)?
                .is_some()
            {
                false
            } else {
                by_key
                    .insert(promotion.idempotency_key.as_str(), promotion.id.as_str())
                    .map_err(be)?;
                let mut table = txn.open_table(PROMOTIONS).map_err(be)?;
                table
                    .insert(promotion.id.as_str(), row.as_slice())
                    .map_err(be)?;
                true
            }
        };
        txn.commit().map_err(be)?;
        Ok(inserted)
    }

    fn store(&self, promotion: &Promotion) -> Result<(), PromotionError> {
        let row = serde_json::to_vec(promotion)?;
        let txn = self.db.begin_write().map_err(be)?;
        {
            let mut table = txn.open_table(PROMOTIONS).map_err(be)?;
            table
                .insert(promotion.id.as_str(), row.as_slice())
                .map_err(be)?;
        }
        txn.commit().map_err(be)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::StaticAllocator;
    use crate::gate::StaticSentinel;
    use sentinel_chain::RetentionPolicy;
    use sentinel_crypto::{LocalDevSigner, SignerRegistry};
    use sentinel_types::audit::EventQuery;
    use sentinel_types::config::Environment;
    use serde_json::Value;

    struct Harness {
        orchestrator: PromotionOrchestrator,
        allocator: Arc<StaticAllocator>,
        chain: AuditChain,
    }

    async fn harness(dir: &tempfile::TempDir, gate: StaticSentinel) -> Harness {
        let db = Arc::new(redb::Database::create(dir.path().join("promotions.redb")).unwrap());
        let signer =
            LocalDevSigner::new("dev-test", b"0123456789abcdef", Environment::Development)
                .unwrap();
        let registry = Arc::new(SignerRegistry::new(vec![Arc::new(signer)]));
        registry.probe().await;
        let chain = AuditChain::new(db.clone(), registry, RetentionPolicy::default()).unwrap();
        let allocator = Arc::new(StaticAllocator::new());
        let orchestrator = PromotionOrchestrator::new(
            db,
            Arc::new(gate),
            allocator.clone(),
            chain.clone(),
        )
        .unwrap();
        Harness {
            orchestrator,
            allocator,
            chain,
        }
    }

    fn request(key: &str, score: f64) -> PromotionRequest {
        PromotionRequest {
            artifact_ref: "model:classifier@sha256:abc".into(),
            environment: "production".into(),
            pool: "gpu-a".into(),
            delta: 2,
            score,
            reason: "eval run 42".into(),
            evaluation: json!({"quality": score}),
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn low_score_fails_without_allocator_call() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(&dir, StaticSentinel::new(0.8)).await;

        let promotion = h.orchestrator.promote(request("k-1", 0.5)).await.unwrap();
        assert_eq!(promotion.status, PromotionStatus::Failed);
        let decision = promotion.sentinel_decision.as_ref().unwrap();
        assert_eq!(decision["allowed"], Value::Bool(false));
        assert!(h.allocator.calls().is_empty(), "allocator must not be called");

        let failed_events = h
            .chain
            .search(&EventQuery {
                time_min: None,
                event_type: Some(EVENT_PROMOTION_FAILED.into()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(failed_events.len(), 1);
        assert_eq!(
            failed_events[0].payload["promotion_id"],
            json!(promotion.id)
        );
        assert_eq!(promotion.event_id.as_deref(), Some(failed_events[0].id.as_str()));
    }

    #[tokio::test]
    async fn passing_promotion_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(&dir, StaticSentinel::new(0.8)).await;

        let promotion = h.orchestrator.promote(request("k-1", 0.95)).await.unwrap();
        assert_eq!(promotion.status, PromotionStatus::Accepted);
        assert_eq!(h.allocator.calls().len(), 1);
        assert_eq!(h.allocator.calls()[0].pool, "gpu-a");
        assert!(promotion.event_id.is_some());
    }

    #[tokio::test]
    async fn idempotency_key_collapses_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(&dir, StaticSentinel::new(0.8)).await;

        let first = h.orchestrator.promote(request("k-1", 0.95)).await.unwrap();
        let second = h.orchestrator.promote(request("k-1", 0.95)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, second.status);
        // One allocation, one audit event: no repeated side effects.
        assert_eq!(h.allocator.calls().len(), 1);
        let accepted = h
            .chain
            .search(&EventQuery {
                time_min: None,
                event_type: Some(EVENT_PROMOTION_ACCEPTED.into()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(accepted.len(), 1);
    }

    #[tokio::test]
    async fn allocator_failure_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(redb::Database::create(dir.path().join("promotions.redb")).unwrap());
        let signer =
            LocalDevSigner::new("dev-test", b"0123456789abcdef", Environment::Development)
                .unwrap();
        let registry = Arc::new(SignerRegistry::new(vec![Arc::new(signer)]));
        registry.probe().await;
        let chain = AuditChain::new(db.clone(), registry, RetentionPolicy::default()).unwrap();
        let orchestrator = PromotionOrchestrator::new(
            db,
            Arc::new(StaticSentinel::new(0.5)),
            Arc::new(StaticAllocator::failing()),
            chain.clone(),
        )
        .unwrap();

        let promotion = orchestrator.promote(request("k-1", 0.9)).await.unwrap();
        assert_eq!(promotion.status, PromotionStatus::Failed);
        let failed = chain
            .search(&EventQuery {
                time_min: None,
                event_type: Some(EVENT_PROMOTION_FAILED.into()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].payload["reason"]
            .as_str()
            .unwrap()
            .contains("allocation failed"));
    }

    #[tokio::test]
    async fn pool_denylist_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            &dir,
            StaticSentinel::new(0.5).with_deny_pools(vec!["gpu-a".into()]),
        )
        .await;
        let promotion = h.orchestrator.promote(request("k-1", 0.9)).await.unwrap();
        assert_eq!(promotion.status, PromotionStatus::Failed);
        assert!(h.allocator.calls().is_empty());
    }
}
