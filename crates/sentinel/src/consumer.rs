//! The asynchronous audit-stream consumer.
//!
//! One logical stream (a bus partition, or the polling fallback over the
//! chain's search endpoint) feeds a bounded channel; a processing task
//! drains it in source order, evaluating the enforceable policies for each
//! event and appending `policy.decision` records. Decision rows reuse the
//! source event's timestamp, so replays deduplicate in the chain and
//! at-least-once delivery upstream becomes effectively-once audit.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sentinel_chain::AuditChain;
use sentinel_telemetry::consumer_metrics;
use sentinel_types::audit::{
    evidence_ref, AuditEvent, EventQuery, EVENT_CANARY_ROLLBACK, EVENT_POLICY_DECISION,
    EVENT_POLICY_SIMULATION, EVENT_POLICY_UPDATED,
};
use sentinel_types::config::ConsumerConfig;
use sentinel_types::error::PolicyError;
use sentinel_types::policy::{CanarySample, Effect, EvaluationContext, PolicyState};
use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::canary::CanaryController;
use crate::eval;
use crate::registry::PolicyRegistry;

/// A source of audit events in timestamp order. The polling implementor
/// below reads the chain directly; a durable-bus consumer implements the
/// same contract over a partition.
#[async_trait]
pub trait AuditStream: Send {
    async fn next_batch(&mut self) -> Result<Vec<AuditEvent>, PolicyError>;
}

/// Polls the chain's search endpoint from the last seen timestamp.
pub struct PollingStream {
    chain: AuditChain,
    batch_size: usize,
    frontier: Option<DateTime<Utc>>,
    /// Ids already delivered at the frontier timestamp, to make the
    /// inclusive time_min bound exact.
    seen_at_frontier: HashSet<String>,
}

impl PollingStream {
    pub fn new(chain: AuditChain, batch_size: usize) -> Self {
        Self {
            chain,
            batch_size,
            frontier: None,
            seen_at_frontier: HashSet::new(),
        }
    }
}

#[async_trait]
impl AuditStream for PollingStream {
    async fn next_batch(&mut self) -> Result<Vec<AuditEvent>, PolicyError> {
        let query = EventQuery {
            time_min: self.frontier,
            event_type: None,
            limit: self.batch_size,
        };
        let events = self
            .chain
            .search(&query)
            .map_err(|e| PolicyError::Backend(e.to_string()))?;

        let mut fresh = Vec::new();
        for event in events {
            if Some(event.ts) == self.frontier && self.seen_at_frontier.contains(&event.id) {
                continue;
            }
            match self.frontier {
                Some(f) if event.ts > f => {
                    self.frontier = Some(event.ts);
                    self.seen_at_frontier.clear();
                }
                None => {
                    self.frontier = Some(event.ts);
                    self.seen_at_frontier.clear();
                }
                _ => {}
            }
            self.seen_at_frontier.insert(event.id.clone());
            fresh.push(event);
        }
        Ok(fresh)
    }
}

pub struct EventConsumer {
    registry: Arc<PolicyRegistry>,
    canary: Arc<CanaryController>,
    chain: AuditChain,
    config: ConsumerConfig,
}

impl EventConsumer {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        canary: Arc<CanaryController>,
        chain: AuditChain,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            registry,
            canary,
            chain,
            config,
        }
    }

    /// Runs the consumer until the shutdown channel flips. The puller and
    /// the processor are separate tasks joined by a bounded channel, so a
    /// slow processor backpressures the puller instead of buffering
    /// without bound.
    pub async fn run<S: AuditStream + 'static>(
        self,
        mut stream: S,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(self.config.channel_capacity);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut puller_shutdown = shutdown.clone();

        let puller = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = puller_shutdown.changed() => break,
                    batch = stream.next_batch() => match batch {
                        Ok(events) => {
                            if events.is_empty() {
                                tokio::time::sleep(poll_interval).await;
                                continue;
                            }
                            for event in events {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(target: "consumer", error = %e, "stream poll failed");
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                maybe_event = rx.recv() => match maybe_event {
                    Some(event) => {
                        let lag = (Utc::now() - event.ts).num_milliseconds().max(0) as f64 / 1000.0;
                        consumer_metrics().set_lag_seconds(lag);
                        match self.handle_event(&event).await {
                            Ok(true) => consumer_metrics().inc_events_processed("ok"),
                            Ok(false) => consumer_metrics().inc_events_processed("skipped"),
                            Err(e) => {
                                // A failing event is skipped, not retried:
                                // blocking the stream on one poison event
                                // starves every policy behind it.
                                consumer_metrics().inc_events_processed("error");
                                tracing::error!(
                                    target: "consumer",
                                    event_id = %event.id,
                                    error = %e,
                                    "event handler failed; skipping"
                                );
                            }
                        }
                    }
                    None => break,
                }
            }
        }
        puller.abort();
    }

    /// Processes one source event. Returns `false` for events the
    /// consumer ignores (its own outputs and rollback records).
    pub async fn handle_event(&self, event: &AuditEvent) -> Result<bool, PolicyError> {
        // Never evaluate the consumer's own outputs; that would feed the
        // stream back into itself.
        if matches!(
            event.event_type.as_str(),
            EVENT_POLICY_DECISION | EVENT_POLICY_SIMULATION | EVENT_CANARY_ROLLBACK
        ) {
            return Ok(false);
        }
        if event.event_type == EVENT_POLICY_UPDATED {
            self.registry.invalidate_cache();
            return Ok(false);
        }

        let ctx = EvaluationContext::from_audit_event(event);

        // Simulating policies observe the stream without enforcement.
        for policy in self.registry.list(Some(PolicyState::Simulating))? {
            let decision = eval::evaluate(&policy, &ctx);
            if decision.matched {
                self.append_decision(EVENT_POLICY_SIMULATION, &policy.id, policy.version, &decision.explanation, decision.effect, event)
                    .await;
            }
        }

        let policies = self.registry.enforceable()?;
        for policy in policies.iter() {
            let decision = eval::evaluate(policy, &ctx);
            if !decision.matched {
                continue;
            }

            let allowed = decision.effect == Effect::Allow;
            let enforced = match policy.state {
                PolicyState::Active => true,
                PolicyState::Canary => self.canary.should_apply(policy, &ctx.request_id),
                _ => false,
            };

            self.append_decision(
                EVENT_POLICY_DECISION,
                &policy.id,
                policy.version,
                &decision.explanation,
                decision.effect,
                event,
            )
            .await;

            if policy.state == PolicyState::Canary {
                let tripped = self.canary.record(
                    &policy.id,
                    CanarySample {
                        enforced,
                        allowed,
                        effect: decision.effect,
                    },
                );
                if tripped {
                    self.canary
                        .execute_rollback(
                            &self.registry,
                            &self.chain,
                            policy,
                            "enforced-deny ratio crossed rollback threshold",
                        )
                        .await?;
                }
            }
        }
        Ok(true)
    }

    /// Appends a decision record. Best-effort inside the stream handler:
    /// a failed append is logged and counted, never fatal. The decision
    /// reuses the source event's timestamp so redelivery deduplicates.
    async fn append_decision(
        &self,
        event_type: &str,
        policy_id: &str,
        policy_version: u32,
        rationale: &str,
        effect: Effect,
        source: &AuditEvent,
    ) {
        let payload = json!({
            "policyId": policy_id,
            "policyVersion": policy_version,
            "decision": match effect { Effect::Allow => "allow", Effect::Deny => "deny" },
            "rationale": rationale,
            "evidence_refs": [evidence_ref(&source.id)],
        });
        if let Err(e) = self
            .chain
            .append_with_timestamp(event_type, payload, source.ts)
            .await
        {
            tracing::error!(
                target: "consumer",
                source_id = %source.id,
                error = %e,
                "failed to append decision event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{draft, test_registry};
    use sentinel_chain::RetentionPolicy;
    use sentinel_crypto::{LocalDevSigner, SignerRegistry};
    use sentinel_types::config::{CanaryConfig, Environment};
    use sentinel_types::policy::Severity;

    async fn test_chain(dir: &tempfile::TempDir) -> AuditChain {
        let db = Arc::new(redb::Database::create(dir.path().join("audit.redb")).unwrap());
        let signer =
            LocalDevSigner::new("dev-test", b"0123456789abcdef", Environment::Development)
                .unwrap();
        let registry = Arc::new(SignerRegistry::new(vec![Arc::new(signer)]));
        registry.probe().await;
        AuditChain::new(db, registry, RetentionPolicy::default()).unwrap()
    }

    fn consumer(
        registry: Arc<PolicyRegistry>,
        chain: AuditChain,
    ) -> EventConsumer {
        EventConsumer::new(
            registry,
            Arc::new(CanaryController::new(CanaryConfig::default())),
            chain,
            ConsumerConfig::default(),
        )
    }

    #[tokio::test]
    async fn emits_decision_with_evidence_ref() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(test_registry(&dir));
        let chain = test_chain(&dir).await;

        // Active deny policy on the literal action from the scenario.
        let mut new = draft("deny-kernel-async", 1, Severity::Medium);
        new.rule = sentinel_types::policy::RuleNode::from_value(
            &json!({"==": [{"var": "action"}, "kernel.async.event"]}),
        )
        .unwrap();
        let p = registry.create(new, "t").unwrap();
        registry.transition(&p.id, PolicyState::Simulating, "t").unwrap();
        registry.transition(&p.id, PolicyState::Canary, "t").unwrap();
        registry.transition(&p.id, PolicyState::Active, "t").unwrap();

        let receipt = chain
            .append("kernel.async.event", json!({"action": "kernel.async.event"}))
            .await
            .unwrap();
        let source = chain.get(&receipt.id).unwrap();

        let consumer = consumer(registry, chain.clone());
        assert!(consumer.handle_event(&source).await.unwrap());

        let decisions = chain
            .search(&EventQuery {
                time_min: None,
                event_type: Some(EVENT_POLICY_DECISION.into()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(decisions.len(), 1);
        let d = &decisions[0];
        assert_eq!(d.payload["decision"], json!("deny"));
        assert_eq!(d.payload["policyId"], json!(p.id));
        assert_eq!(
            d.payload["evidence_refs"],
            json!([format!("audit:{}", source.id)])
        );
    }

    #[tokio::test]
    async fn redelivery_is_effectively_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(test_registry(&dir));
        let chain = test_chain(&dir).await;

        let mut new = draft("deny-x", 1, Severity::Medium);
        new.rule =
            sentinel_types::policy::RuleNode::from_value(&json!({"==": [{"var": "action"}, "x"]}))
                .unwrap();
        let p = registry.create(new, "t").unwrap();
        registry.transition(&p.id, PolicyState::Simulating, "t").unwrap();
        registry.transition(&p.id, PolicyState::Canary, "t").unwrap();
        registry.transition(&p.id, PolicyState::Active, "t").unwrap();

        let receipt = chain.append("x", json!({"action": "x"})).await.unwrap();
        let source = chain.get(&receipt.id).unwrap();

        let consumer = consumer(registry, chain.clone());
        consumer.handle_event(&source).await.unwrap();
        // Simulated at-least-once delivery: the same event arrives again.
        consumer.handle_event(&source).await.unwrap();

        let decisions = chain
            .search(&EventQuery {
                time_min: None,
                event_type: Some(EVENT_POLICY_DECISION.into()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(decisions.len(), 1, "chain dedup collapses the replay");
    }

    #[tokio::test]
    async fn own_outputs_are_not_reprocessed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(test_registry(&dir));
        let chain = test_chain(&dir).await;
        let consumer = consumer(registry, chain.clone());

        let receipt = chain
            .append(EVENT_POLICY_DECISION, json!({"decision": "deny"}))
            .await
            .unwrap();
        let event = chain.get(&receipt.id).unwrap();
        assert!(!consumer.handle_event(&event).await.unwrap());
    }

    #[tokio::test]
    async fn policy_updated_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(test_registry(&dir));
        let chain = test_chain(&dir).await;
        let consumer = consumer(registry, chain.clone());

        let receipt = chain
            .append(EVENT_POLICY_UPDATED, json!({"policy_id": "p-1"}))
            .await
            .unwrap();
        let event = chain.get(&receipt.id).unwrap();
        assert!(!consumer.handle_event(&event).await.unwrap());
    }

    #[tokio::test]
    async fn polling_stream_advances_frontier_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(test_registry(&dir));
        let _ = registry;
        let chain = test_chain(&dir).await;

        for i in 0..3 {
            chain.append("evt", json!({"i": i})).await.unwrap();
        }

        let mut stream = PollingStream::new(chain.clone(), 100);
        let first = stream.next_batch().await.unwrap();
        assert_eq!(first.len(), 3);

        // No new events: the next poll must not redeliver.
        let second = stream.next_batch().await.unwrap();
        assert!(second.is_empty());

        chain.append("evt", json!({"i": 3})).await.unwrap();
        let third = stream.next_batch().await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].payload["i"], json!(3));
    }
}
