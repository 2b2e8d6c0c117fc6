//! Latency budget: with 50 policies loaded, the synchronous check path
//! sustains P95 < 200 ms across at least 30 samples.

mod common;

use sentinel_policy::registry::NewPolicy;
use sentinel_policy::CheckRequest;
use sentinel_types::policy::{Effect, PolicyMetadata, PolicyState, RuleNode, Severity};
use serde_json::json;
use std::time::Instant;

#[tokio::test]
async fn check_p95_under_budget_with_50_policies() {
    let dir = tempfile::tempdir().unwrap();
    let components = common::dev_components(&dir).await;

    for i in 0..50 {
        let policy = components
            .registry
            .create(
                NewPolicy {
                    name: format!("bench-policy-{:02}", i),
                    version: 1,
                    severity: Severity::Medium,
                    rule: RuleNode::from_value(&json!({"and": [
                        {"==": [{"var": "action"}, format!("bench.action.{}", i)]},
                        {">": [{"var": "resource.delta"}, 10]},
                        {"regex": [{"var": "actor.id"}, "^svc-"]}
                    ]}))
                    .unwrap(),
                    metadata: PolicyMetadata {
                        effect: Some(Effect::Deny),
                        ..Default::default()
                    },
                },
                "bench",
            )
            .unwrap();
        components
            .registry
            .transition(&policy.id, PolicyState::Simulating, "bench")
            .unwrap();
        components
            .registry
            .transition(&policy.id, PolicyState::Canary, "bench")
            .unwrap();
        components
            .registry
            .transition(&policy.id, PolicyState::Active, "bench")
            .unwrap();
    }

    // Warm the policy cache.
    components
        .check
        .check(CheckRequest {
            action: "warmup".into(),
            actor: json!({"id": "svc-bench"}),
            resource: json!({"delta": 1}),
            context: json!(null),
            request_id: Some("warmup".into()),
        })
        .await
        .unwrap();

    let samples = 40;
    let mut durations = Vec::with_capacity(samples);
    for i in 0..samples {
        let started = Instant::now();
        let resp = components
            .check
            .check(CheckRequest {
                action: "no.such.action".into(),
                actor: json!({"id": "svc-bench"}),
                resource: json!({"delta": 42}),
                context: json!(null),
                request_id: Some(format!("bench-{}", i)),
            })
            .await
            .unwrap();
        durations.push(started.elapsed());
        assert!(resp.allowed, "no policy matches; default allow");
    }

    durations.sort();
    let p95 = durations[(samples as f64 * 0.95) as usize - 1];
    assert!(
        p95.as_millis() < 200,
        "P95 {}ms exceeds the 200ms budget",
        p95.as_millis()
    );
}
