//! Route handlers. Thin: parse, authorize, call the owning subsystem, map
//! errors to the wire envelope.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::HeaderMap,
    response::Json,
};
use sentinel_multisig::SubmitUpgrade;
use sentinel_policy::{registry::NewPolicy, CheckRequest, CheckResponse};
use sentinel_types::audit::{EventQuery, EVENT_POLICY_UPDATED};
use sentinel_types::policy::{Policy, PolicyMetadata, PolicyState, RuleNode, Severity};
use sentinel_types::promotion::PromotionRequest;
use sentinel_types::rbac::Role;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::rbac::{actor_from_headers, require, require_any, roles_from_headers};
use crate::{AppError, GatewayState};

fn bad_json(rejection: JsonRejection) -> AppError {
    AppError::bad_request("INVALID_REQUEST", rejection.body_text())
}

/// Best-effort `policy.updated` notification. Registry writes must not
/// fail because the audit chain is momentarily unhappy; the TTL cache
/// converges regardless.
async fn notify_policy_updated(state: &GatewayState, policy_id: &str, op: &str) {
    if let Err(e) = state
        .chain
        .append(
            EVENT_POLICY_UPDATED,
            json!({"policy_id": policy_id, "op": op}),
        )
        .await
    {
        tracing::warn!(
            target: "gateway",
            policy_id,
            error = %e,
            "policy.updated audit append failed"
        );
    }
}

// --- Check ---

pub async fn check(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Result<Json<CheckRequest>, JsonRejection>,
) -> Result<Json<CheckResponse>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require_any(&roles, &[Role::Checker, Role::PolicyAdmin])?;
    let Json(req) = body.map_err(bad_json)?;
    let response = state.check.check(req).await?;
    Ok(Json(response))
}

// --- Policy CRUD ---

#[derive(Deserialize)]
pub struct CreatePolicyBody {
    name: String,
    version: u32,
    severity: Severity,
    rule: RuleNode,
    #[serde(default)]
    metadata: PolicyMetadata,
}

pub async fn create_policy(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Result<Json<CreatePolicyBody>, JsonRejection>,
) -> Result<Json<Policy>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require(&roles, Role::PolicyAdmin)?;
    let Json(body) = body.map_err(bad_json)?;
    let policy = state.registry.create(
        NewPolicy {
            name: body.name,
            version: body.version,
            severity: body.severity,
            rule: body.rule,
            metadata: body.metadata,
        },
        &actor_from_headers(&headers),
    )?;
    notify_policy_updated(&state, &policy.id, "created").await;
    Ok(Json(policy))
}

#[derive(Deserialize)]
pub struct ListPoliciesParams {
    #[serde(default)]
    state: Option<PolicyState>,
}

pub async fn list_policies(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(params): Query<ListPoliciesParams>,
) -> Result<Json<Vec<Policy>>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require_any(&roles, &[Role::PolicyAdmin, Role::Auditor])?;
    Ok(Json(state.registry.list(params.state)?))
}

pub async fn get_policy(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Policy>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require_any(&roles, &[Role::PolicyAdmin, Role::Auditor])?;
    Ok(Json(state.registry.get(&id)?))
}

#[derive(Deserialize)]
pub struct UpdatePolicyBody {
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    rule: Option<RuleNode>,
    #[serde(default)]
    metadata: Option<PolicyMetadata>,
}

pub async fn update_policy(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<UpdatePolicyBody>, JsonRejection>,
) -> Result<Json<Policy>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require(&roles, Role::PolicyAdmin)?;
    let Json(body) = body.map_err(bad_json)?;
    let policy = state.registry.update(
        &id,
        body.severity,
        body.rule,
        body.metadata,
        &actor_from_headers(&headers),
    )?;
    notify_policy_updated(&state, &policy.id, "updated").await;
    Ok(Json(policy))
}

#[derive(Deserialize)]
pub struct TransitionBody {
    state: PolicyState,
}

pub async fn transition_policy(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<TransitionBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require(&roles, Role::PolicyAdmin)?;
    let Json(body) = body.map_err(bad_json)?;
    let (policy, superseded) =
        state
            .registry
            .transition(&id, body.state, &actor_from_headers(&headers))?;
    notify_policy_updated(&state, &policy.id, "transition").await;
    for old in &superseded {
        notify_policy_updated(&state, &old.id, "superseded").await;
    }
    Ok(Json(json!({"policy": policy, "superseded": superseded})))
}

pub async fn policy_history(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require_any(&roles, &[Role::PolicyAdmin, Role::Auditor])?;
    let history = state.registry.history(&id)?;
    Ok(Json(json!({"policy_id": id, "history": history})))
}

pub async fn policy_canary(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require_any(&roles, &[Role::PolicyAdmin, Role::Auditor])?;
    // 404 for unknown policies, stats otherwise.
    let _ = state.registry.get(&id)?;
    Ok(Json(serde_json::to_value(state.canary.window_stats(&id)).map_err(
        |e| AppError::Internal(anyhow::anyhow!(e)),
    )?))
}

// --- Upgrades ---

pub async fn submit_upgrade(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Result<Json<SubmitUpgrade>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require(&roles, Role::UpgradeAdmin)?;
    let Json(submit) = body.map_err(bad_json)?;
    let manifest = state.multisig.submit(submit).await?;
    Ok(Json(json!({"upgradeId": manifest.id, "state": manifest.state})))
}

#[derive(Deserialize)]
pub struct ApproveBody {
    approver_id: String,
    signature: String,
    #[serde(default)]
    notes: Option<String>,
}

pub async fn approve_upgrade(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<ApproveBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require(&roles, Role::Approver)?;
    let Json(body) = body.map_err(bad_json)?;
    let manifest = state
        .multisig
        .approve(&id, &body.approver_id, &body.signature, body.notes)
        .await?;
    Ok(Json(json!({
        "upgradeId": manifest.id,
        "state": manifest.state,
        "approvals": manifest.approvals.len(),
        "required": manifest.required_approvals,
    })))
}

pub async fn apply_upgrade(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require(&roles, Role::UpgradeAdmin)?;
    let manifest = state
        .multisig
        .apply(&id, &actor_from_headers(&headers))
        .await?;
    Ok(Json(json!({
        "upgradeId": manifest.id,
        "state": manifest.state,
        "appliedAt": manifest.applied_at,
    })))
}

pub async fn get_upgrade(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require_any(
        &roles,
        &[Role::UpgradeAdmin, Role::Approver, Role::Auditor],
    )?;
    let manifest = state.multisig.get(&id)?;
    Ok(Json(serde_json::to_value(manifest).map_err(|e| {
        AppError::Internal(anyhow::anyhow!(e))
    })?))
}

// --- Promotions ---

pub async fn submit_promotion(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Result<Json<PromotionRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require(&roles, Role::Promoter)?;
    let Json(req) = body.map_err(bad_json)?;
    let promotion = state.promotions.promote(req).await?;
    Ok(Json(serde_json::to_value(promotion).map_err(|e| {
        AppError::Internal(anyhow::anyhow!(e))
    })?))
}

pub async fn get_promotion(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require_any(&roles, &[Role::Promoter, Role::Auditor])?;
    let promotion = state.promotions.get(&id)?;
    Ok(Json(serde_json::to_value(promotion).map_err(|e| {
        AppError::Internal(anyhow::anyhow!(e))
    })?))
}

// --- Audit ---

#[derive(Deserialize)]
pub struct AppendAuditBody {
    event_type: String,
    payload: Value,
}

pub async fn append_audit(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Result<Json<AppendAuditBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require(&roles, Role::AuditWriter)?;
    let Json(body) = body.map_err(bad_json)?;
    if body.event_type.is_empty() {
        return Err(AppError::bad_request(
            "INVALID_REQUEST",
            "event_type is required",
        ));
    }
    let receipt = state.chain.append(&body.event_type, body.payload).await?;
    Ok(Json(serde_json::to_value(receipt).map_err(|e| {
        AppError::Internal(anyhow::anyhow!(e))
    })?))
}

pub async fn get_audit(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require_any(&roles, &[Role::Auditor, Role::PolicyAdmin])?;
    let event = state.chain.get(&id)?;
    Ok(Json(serde_json::to_value(event).map_err(|e| {
        AppError::Internal(anyhow::anyhow!(e))
    })?))
}

pub async fn search_audit(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Result<Json<EventQuery>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let roles = roles_from_headers(&headers)?;
    require_any(&roles, &[Role::Auditor, Role::PolicyAdmin])?;
    let Json(query) = body.map_err(bad_json)?;
    let events = state.chain.search(&query)?;
    let count = events.len();
    Ok(Json(json!({"events": events, "count": count})))
}

// --- Signers / ops ---

pub async fn list_signers(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(json!({"signers": state.signers.records()})))
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn ready(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<Value>, AppError> {
    let signer = state.signers.readiness().await;
    let chain_consistent = state.chain.is_consistent();
    let ready = signer.is_ready() && chain_consistent;
    let body = json!({
        "status": if ready { "ready" } else { "degraded" },
        "signer": signer,
        "chain_consistent": chain_consistent,
    });
    if ready {
        Ok(Json(body))
    } else {
        Err(AppError::Unavailable {
            code: "DEGRADED",
            message: body.to_string(),
        })
    }
}

pub async fn metrics() -> (
    [(axum::http::HeaderName, String); 1],
    axum::body::Bytes,
) {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buf = Vec::with_capacity(1 << 20);
    if let Err(e) = prometheus::Encoder::encode(&encoder, &metric_families, &mut buf) {
        tracing::error!(error=%e, "Failed to encode prometheus metrics");
    }
    (
        [(
            axum::http::header::CONTENT_TYPE,
            prometheus::Encoder::format_type(&encoder).to_string(),
        )],
        buf.into(),
    )
}
