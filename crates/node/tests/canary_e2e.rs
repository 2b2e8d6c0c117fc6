//! Canary rollback scenario: window 3, threshold 0.5, observations
//! [enforced-deny, enforced-allow, enforced-deny] must deprecate the
//! policy and emit exactly one rollback audit event.

use sentinel_node::bootstrap;
use sentinel_policy::registry::NewPolicy;
use sentinel_policy::CanaryController;
use sentinel_types::audit::{EventQuery, EVENT_CANARY_ROLLBACK};
use sentinel_types::config::{CanaryConfig, LocalSignerConfig, NodeConfig};
use sentinel_types::policy::{
    CanarySample, Effect, PolicyMetadata, PolicyState, RuleNode, Severity,
};
use serde_json::json;

#[tokio::test]
async fn rollback_fires_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = NodeConfig::default();
    config.database_path = dir
        .path()
        .join("sentinel.redb")
        .to_string_lossy()
        .into_owned();
    config.signers.local_dev = Some(LocalSignerConfig {
        key_id: "dev-e2e".into(),
        secret_hex: hex::encode(b"sentinel-e2e-secret-key"),
    });
    config.canary = CanaryConfig {
        window: 3,
        threshold: 0.5,
        cooldown_secs: 600,
    };
    let components = bootstrap::init(config).await.unwrap();
    let controller = CanaryController::new(components.config.canary);

    let policy = components
        .registry
        .create(
            NewPolicy {
                name: "canary-under-test".into(),
                version: 1,
                severity: Severity::Medium,
                rule: RuleNode::from_value(&json!({"==": [1, 1]})).unwrap(),
                metadata: PolicyMetadata {
                    effect: Some(Effect::Deny),
                    canary_percent: Some(50),
                    ..Default::default()
                },
            },
            "e2e",
        )
        .unwrap();
    components
        .registry
        .transition(&policy.id, PolicyState::Simulating, "e2e")
        .unwrap();
    let (policy, _) = components
        .registry
        .transition(&policy.id, PolicyState::Canary, "e2e")
        .unwrap();

    let observations = [
        (true, false), // enforced-deny
        (true, true),  // enforced-allow
        (true, false), // enforced-deny -> 2/3 >= 0.5
    ];
    let mut tripped_count = 0;
    for (enforced, allowed) in observations {
        let tripped = controller.record(
            &policy.id,
            CanarySample {
                enforced,
                allowed,
                effect: if allowed { Effect::Allow } else { Effect::Deny },
            },
        );
        if tripped {
            controller
                .execute_rollback(
                    &components.registry,
                    &components.chain,
                    &policy,
                    "enforced-deny ratio crossed rollback threshold",
                )
                .await
                .unwrap();
            tripped_count += 1;
        }
    }
    assert_eq!(tripped_count, 1);

    // Policy is deprecated and exactly one rollback event exists.
    assert_eq!(
        components.registry.get(&policy.id).unwrap().state,
        PolicyState::Deprecated
    );
    let rollbacks = components
        .chain
        .search(&EventQuery {
            time_min: None,
            event_type: Some(EVENT_CANARY_ROLLBACK.into()),
            limit: 10,
        })
        .unwrap();
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].payload["policy_id"], json!(policy.id));

    // Further failing windows inside the cooldown stay suppressed.
    for _ in 0..3 {
        let tripped = controller.record(
            &policy.id,
            CanarySample {
                enforced: true,
                allowed: false,
                effect: Effect::Deny,
            },
        );
        assert!(!tripped);
    }
}
