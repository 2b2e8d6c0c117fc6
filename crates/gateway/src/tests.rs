use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use sentinel_chain::{AuditChain, RetentionPolicy};
use sentinel_crypto::keys::{generate_keypair, sign_b64};
use sentinel_crypto::{ApproverKeyRegistry, LocalDevSigner, SignerRegistry};
use sentinel_multisig::{MultisigController, NoopExecutor};
use sentinel_policy::{CanaryController, CheckService, PolicyRegistry};
use sentinel_promotion::{PromotionOrchestrator, StaticAllocator, StaticSentinel};
use sentinel_types::codec;
use sentinel_types::config::{CanaryConfig, Environment};
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::{build_router, GatewayState, IdempotencyStore};

struct TestApp {
    router: Router,
    approver_key: ed25519_dalek::SigningKey,
}

async fn test_app(dir: &tempfile::TempDir) -> TestApp {
    let db = Arc::new(redb::Database::create(dir.path().join("gateway.redb")).unwrap());
    let signer =
        LocalDevSigner::new("dev-test", b"0123456789abcdef", Environment::Development).unwrap();
    let signers = Arc::new(SignerRegistry::new(vec![Arc::new(signer)]));
    signers.probe().await;
    let chain = AuditChain::new(db.clone(), signers.clone(), RetentionPolicy::default()).unwrap();

    let registry = Arc::new(
        PolicyRegistry::new(db.clone())
            .unwrap()
            .with_cache_ttl(std::time::Duration::from_millis(0)),
    );
    let canary = Arc::new(CanaryController::new(CanaryConfig::default()));
    let check = Arc::new(CheckService::new(
        registry.clone(),
        canary.clone(),
        chain.clone(),
    ));

    let keys = Arc::new(ApproverKeyRegistry::new());
    let (sk, vk) = generate_keypair();
    keys.register("sec-1", vk.as_bytes()).unwrap();
    let multisig = Arc::new(
        MultisigController::new(db.clone(), keys, chain.clone(), Arc::new(NoopExecutor)).unwrap(),
    );

    let promotions = Arc::new(
        PromotionOrchestrator::new(
            db.clone(),
            Arc::new(StaticSentinel::new(0.8)),
            Arc::new(StaticAllocator::new()),
            chain.clone(),
        )
        .unwrap(),
    );

    let state = Arc::new(GatewayState {
        check,
        registry,
        canary,
        multisig,
        promotions,
        chain,
        signers,
        idempotency: IdempotencyStore::new(db).unwrap(),
    });
    TestApp {
        router: build_router(state),
        approver_key: sk,
    }
}

fn post(uri: &str, roles: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(roles) = roles {
        builder = builder.header("x-sentinel-roles", roles);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, roles: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(roles) = roles {
        builder = builder.header("x-sentinel-roles", roles);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn missing_roles_header_is_401() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;
    let resp = app
        .router
        .oneshot(post("/check", None, json!({"action": "x"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], json!("UNAUTHENTICATED"));
}

#[tokio::test]
async fn wrong_role_is_403() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;
    let resp = app
        .router
        .oneshot(post("/policy", Some("checker"), json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn check_returns_default_allow() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;
    let resp = app
        .router
        .oneshot(post(
            "/check",
            Some("checker"),
            json!({"action": "anything", "actor": {"id": "svc"}}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["allowed"], json!(true));
    assert!(body["policyId"].is_null());
}

#[tokio::test]
async fn malformed_check_body_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;
    let req = Request::builder()
        .method("POST")
        .uri("/check")
        .header("content-type", "application/json")
        .header("x-sentinel-roles", "checker")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = app.router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], json!("INVALID_REQUEST"));
}

#[tokio::test]
async fn policy_crud_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;

    let create = post(
        "/policy",
        Some("policy-admin"),
        json!({
            "name": "deny-async",
            "version": 1,
            "severity": "MEDIUM",
            "rule": {"==": [{"var": "action"}, "kernel.async.event"]},
            "metadata": {"effect": "deny"}
        }),
    );
    let resp = app.router.clone().oneshot(create).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let created = body_json(resp).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["state"], json!("draft"));

    let resp = app
        .router
        .clone()
        .oneshot(get(&format!("/policy/{}", id), Some("auditor")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Duplicate (name, version) conflicts.
    let dup = post(
        "/policy",
        Some("policy-admin"),
        json!({
            "name": "deny-async",
            "version": 1,
            "severity": "LOW",
            "rule": {"==": [1, 1]},
            "metadata": {"effect": "deny"}
        }),
    );
    let resp = app.router.clone().oneshot(dup).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // History is recorded.
    let resp = app
        .router
        .oneshot(get(&format!("/policy/{}/history", id), Some("policy-admin")))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["history"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn upgrade_premature_apply_is_400_insufficient_approvals() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;

    let payload = json!({"activate": "policy-x"});
    let resp = app
        .router
        .clone()
        .oneshot(post(
            "/upgrade",
            Some("upgrade-admin"),
            json!({
                "target": "policy",
                "payload": payload,
                "required_approvals": 2,
                "threshold_set": ["sec-1", "sec-2", "sec-3"]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    let upgrade_id = body["upgradeId"].as_str().unwrap().to_string();
    assert_eq!(body["state"], json!("pending"));

    let message = codec::to_canonical_json(&payload).unwrap();
    let sig = sign_b64(&app.approver_key, &message);
    let resp = app
        .router
        .clone()
        .oneshot(post(
            &format!("/upgrade/{}/approve", upgrade_id),
            Some("approver"),
            json!({"approver_id": "sec-1", "signature": sig}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .router
        .oneshot(post(
            &format!("/upgrade/{}/apply", upgrade_id),
            Some("upgrade-admin"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], json!("insufficient_approvals"));
}

#[tokio::test]
async fn audit_append_requires_writer_role_and_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;

    let resp = app
        .router
        .clone()
        .oneshot(post(
            "/audit",
            Some("auditor"),
            json!({"event_type": "test.event", "payload": {"k": "v"}}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app
        .router
        .clone()
        .oneshot(post(
            "/audit",
            Some("audit-writer"),
            json!({"event_type": "test.event", "payload": {"k": "v"}}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let receipt = body_json(resp).await;
    let id = receipt["id"].as_str().unwrap().to_string();

    let resp = app
        .router
        .oneshot(get(&format!("/audit/{}", id), Some("auditor")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let event = body_json(resp).await;
    assert_eq!(event["event_type"], json!("test.event"));
    assert!(!event["signature"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn idempotency_key_replays_stored_response() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;

    let make_req = || {
        let mut req = post(
            "/audit",
            Some("audit-writer"),
            json!({"event_type": "idem.event", "payload": {"n": 1}}),
        );
        req.headers_mut()
            .insert("x-idempotency-key", "key-123".parse().unwrap());
        req
    };

    let first = app.router.clone().oneshot(make_req()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().get("x-idempotent-replay").is_none());
    let first_body = body_json(first).await;

    let second = app.router.oneshot(make_req()).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(
        second.headers().get("x-idempotent-replay").unwrap(),
        "true"
    );
    let second_body = body_json(second).await;
    assert_eq!(first_body, second_body);
}

#[tokio::test]
async fn ready_reports_ok_with_dev_signer() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;
    let resp = app.router.oneshot(get("/ready", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], json!("ready"));
    assert_eq!(body["chain_consistent"], json!(true));
}

#[tokio::test]
async fn promotion_denied_below_min_score() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;
    let resp = app
        .router
        .oneshot(post(
            "/promotion",
            Some("promoter"),
            json!({
                "artifact_ref": "model:m@sha256:1",
                "environment": "production",
                "pool": "gpu-a",
                "delta": 1,
                "score": 0.5,
                "reason": "eval",
                "evaluation": {"quality": 0.5},
                "idempotency_key": "promo-1"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], json!("failed"));
    assert_eq!(body["sentinel_decision"]["allowed"], json!(false));
}
