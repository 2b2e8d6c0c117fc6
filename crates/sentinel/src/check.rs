//! The synchronous check path.
//!
//! Evaluates a request against the enforceable policy set in deterministic
//! order (ascending severity, then name, then version); the first
//! enforced match wins and no match defaults to allow. Canary policies
//! gate on the deterministic sampler and feed the rollback detector.

use std::sync::Arc;

use sentinel_chain::AuditChain;
use sentinel_telemetry::{policy_metrics, time::CheckTimer};
use sentinel_types::error::PolicyError;
use sentinel_types::policy::{CanarySample, Effect, EvaluationContext, PolicyState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canary::CanaryController;
use crate::eval;
use crate::registry::PolicyRegistry;

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRequest {
    pub action: String,
    #[serde(default)]
    pub actor: Value,
    #[serde(default)]
    pub resource: Value,
    #[serde(default)]
    pub context: Value,
    /// Optional idempotent request id; generated when absent. Canary
    /// sampling keys on it.
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckResponse {
    pub allowed: bool,
    #[serde(rename = "policyId")]
    pub policy_id: Option<String>,
    pub reason: String,
    #[serde(rename = "policyVersion")]
    pub policy_version: Option<u32>,
}

pub struct CheckService {
    registry: Arc<PolicyRegistry>,
    canary: Arc<CanaryController>,
    chain: AuditChain,
}

impl CheckService {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        canary: Arc<CanaryController>,
        chain: AuditChain,
    ) -> Self {
        Self {
            registry,
            canary,
            chain,
        }
    }

    pub async fn check(&self, req: CheckRequest) -> Result<CheckResponse, PolicyError> {
        let _timer = CheckTimer::new(policy_metrics());
        let request_id = req
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let ctx = EvaluationContext {
            action: req.action,
            actor: req.actor,
            resource: req.resource,
            context: req.context,
            request_id,
        };

        let policies = self.registry.enforceable()?;
        for policy in policies.iter() {
            let decision = eval::evaluate(policy, &ctx);
            if !decision.matched {
                continue;
            }

            let allowed = decision.effect == Effect::Allow;
            if policy.state == PolicyState::Canary {
                let enforced = self.canary.should_apply(policy, &ctx.request_id);
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
                    // The policy is deprecated as of this decision; the
                    // current request falls through to later policies.
                    continue;
                }
                if !enforced {
                    // Sampled out: observed, not enforced.
                    continue;
                }
            }

            policy_metrics().inc_check_decisions(if allowed { "allow" } else { "deny" });
            return Ok(CheckResponse {
                allowed,
                policy_id: Some(policy.id.clone()),
                reason: decision.explanation,
                policy_version: Some(policy.version),
            });
        }

        policy_metrics().inc_check_decisions("default_allow");
        Ok(CheckResponse {
            allowed: true,
            policy_id: None,
            reason: "no policy matched; default allow".into(),
            policy_version: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{draft, test_registry};
    use sentinel_chain::RetentionPolicy;
    use sentinel_crypto::{LocalDevSigner, SignerRegistry};
    use sentinel_types::config::{CanaryConfig, Environment};
    use sentinel_types::policy::{PolicyMetadata, RuleNode, Severity};
    use serde_json::json;

    async fn test_chain(dir: &tempfile::TempDir) -> AuditChain {
        let db = Arc::new(
            redb::Database::create(dir.path().join("audit.redb")).unwrap(),
        );
        let signer = LocalDevSigner::new(
            "dev-test",
            b"0123456789abcdef",
            Environment::Development,
        )
        .unwrap();
        let registry = Arc::new(SignerRegistry::new(vec![Arc::new(signer)]));
        registry.probe().await;
        AuditChain::new(db, registry, RetentionPolicy::default()).unwrap()
    }

    fn activate(registry: &PolicyRegistry, id: &str) {
        registry.transition(id, PolicyState::Simulating, "t").unwrap();
        registry.transition(id, PolicyState::Canary, "t").unwrap();
        registry.transition(id, PolicyState::Active, "t").unwrap();
    }

    fn service(
        registry: Arc<PolicyRegistry>,
        chain: AuditChain,
        canary: CanaryConfig,
    ) -> CheckService {
        CheckService::new(registry, Arc::new(CanaryController::new(canary)), chain)
    }

    fn request(action: &str) -> CheckRequest {
        CheckRequest {
            action: action.into(),
            actor: json!({"id": "svc-1"}),
            resource: Value::Null,
            context: Value::Null,
            request_id: Some("req-fixed".into()),
        }
    }

    #[tokio::test]
    async fn no_match_defaults_to_allow() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(test_registry(&dir));
        let chain = test_chain(&dir).await;
        let svc = service(registry, chain, CanaryConfig::default());

        let resp = svc.check(request("anything")).await.unwrap();
        assert!(resp.allowed);
        assert!(resp.policy_id.is_none());
    }

    #[tokio::test]
    async fn first_match_in_severity_order_wins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(test_registry(&dir));
        let chain = test_chain(&dir).await;

        // Two matching policies; the LOW one must win over CRITICAL.
        let mut low = draft("allow-low", 1, Severity::Low);
        low.rule = RuleNode::from_value(&json!({"==": [{"var": "action"}, "x"]})).unwrap();
        low.metadata = PolicyMetadata {
            effect: Some(Effect::Allow),
            ..Default::default()
        };
        let low = registry.create(low, "t").unwrap();
        activate(&registry, &low.id);

        let mut critical = draft("deny-critical", 1, Severity::Critical);
        critical.rule = RuleNode::from_value(&json!({"==": [{"var": "action"}, "x"]})).unwrap();
        let critical = registry.create(critical, "t").unwrap();
        activate(&registry, &critical.id);

        let svc = service(registry, chain, CanaryConfig::default());
        let resp = svc.check(request("x")).await.unwrap();
        assert!(resp.allowed);
        assert_eq!(resp.policy_id, Some(low.id));
    }

    #[tokio::test]
    async fn deny_policy_denies() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(test_registry(&dir));
        let chain = test_chain(&dir).await;

        let p = registry.create(draft("deny-x", 1, Severity::High), "t").unwrap();
        activate(&registry, &p.id);

        let svc = service(registry, chain, CanaryConfig::default());
        let resp = svc.check(request("x")).await.unwrap();
        assert!(!resp.allowed);
        assert_eq!(resp.policy_id, Some(p.id));
        assert_eq!(resp.policy_version, Some(1));
    }

    #[tokio::test]
    async fn canary_gates_on_sampler() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(test_registry(&dir));
        let chain = test_chain(&dir).await;

        let mut new = draft("canary-deny", 1, Severity::Medium);
        new.metadata.canary_percent = Some(100);
        let p = registry.create(new, "t").unwrap();
        registry.transition(&p.id, PolicyState::Simulating, "t").unwrap();
        registry.transition(&p.id, PolicyState::Canary, "t").unwrap();

        let svc = service(registry, chain, CanaryConfig::default());
        // 100% canary always enforces.
        let resp = svc.check(request("x")).await.unwrap();
        assert!(!resp.allowed);
        assert_eq!(resp.policy_id, Some(p.id));
    }
}
