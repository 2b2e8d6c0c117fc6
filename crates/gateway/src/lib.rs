#![forbid(unsafe_code)]

//! # Sentinel Gateway
//!
//! The public HTTP surface: the synchronous check path, policy CRUD, the
//! multisig upgrade endpoints, promotions, audit reads and the internal
//! append, plus health/readiness/metrics. Requests are authorized by the
//! roles a front door injects in `x-sentinel-roles`; write endpoints
//! honor `x-idempotency-key` for at-most-once semantics.

mod handlers;
mod idempotency;
mod limiter;
mod rbac;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Body,
    error_handling::HandleErrorLayer,
    extract::MatchedPath,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use ipnetwork::IpNetwork;
use sentinel_chain::AuditChain;
use sentinel_crypto::SignerRegistry;
use sentinel_multisig::MultisigController;
use sentinel_policy::{CanaryController, CheckService, PolicyRegistry};
use sentinel_promotion::PromotionOrchestrator;
use sentinel_telemetry::gateway_metrics;
use sentinel_types::config::GatewayConfig;
use sentinel_types::error::{
    AuditError, ErrorCode, PolicyError, PromotionError, UpgradeError,
};
use tokio::sync::watch;
use tower::{
    limit::ConcurrencyLimitLayer, load_shed::LoadShedLayer, timeout::TimeoutLayer, BoxError,
    ServiceBuilder,
};
use tower_http::{catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

pub use idempotency::IdempotencyStore;

// --- Error Handling ---

pub enum AppError {
    BadRequest {
        code: &'static str,
        message: String,
    },
    Unauthorized,
    Forbidden(String),
    NotFound(String),
    Conflict {
        code: &'static str,
        message: String,
    },
    Unavailable {
        code: &'static str,
        message: String,
    },
    Internal(anyhow::Error),
}

impl AppError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        AppError::BadRequest {
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHENTICATED",
                "missing role header".to_string(),
            ),
            AppError::Forbidden(role) => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                format!("operation requires role '{}'", role),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            AppError::Conflict { code, message } => (StatusCode::CONFLICT, code, message),
            AppError::Unavailable { code, message } => {
                (StatusCode::SERVICE_UNAVAILABLE, code, message)
            }
            AppError::Internal(e) => {
                tracing::error!(target: "gateway", "Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal server error".to_string(),
                )
            }
        };
        (
            status,
            Json(serde_json::json!({ "error": {"code": code, "message": message} })),
        )
            .into_response()
    }
}

impl From<PolicyError> for AppError {
    fn from(e: PolicyError) -> Self {
        let message = e.to_string();
        match &e {
            PolicyError::NotFound(_) => AppError::NotFound(message),
            PolicyError::DuplicateVersion { .. } => AppError::Conflict {
                code: e.code(),
                message,
            },
            PolicyError::InvalidTransition { .. }
            | PolicyError::EffectRequired(_)
            | PolicyError::InvalidRule(_) => AppError::BadRequest {
                code: e.code(),
                message,
            },
            PolicyError::Forbidden(role) => AppError::Forbidden(role.clone()),
            _ => AppError::Internal(anyhow::anyhow!(message)),
        }
    }
}

impl From<UpgradeError> for AppError {
    fn from(e: UpgradeError) -> Self {
        let message = e.to_string();
        match &e {
            UpgradeError::NotFound(_) => AppError::NotFound(message),
            UpgradeError::InsufficientApprovals { .. } => AppError::BadRequest {
                code: e.code(),
                message,
            },
            UpgradeError::UnauthorizedApprover(id) => AppError::Forbidden(format!(
                "approver '{}' is not in the threshold set",
                id
            )),
            UpgradeError::DuplicateApproval { .. } => AppError::Conflict {
                code: e.code(),
                message,
            },
            UpgradeError::SignatureInvalid { .. }
            | UpgradeError::InvalidManifest(_)
            | UpgradeError::InvalidTransition { .. }
            | UpgradeError::Terminal { .. } => AppError::BadRequest {
                code: e.code(),
                message,
            },
            _ => AppError::Internal(anyhow::anyhow!(message)),
        }
    }
}

impl From<AuditError> for AppError {
    fn from(e: AuditError) -> Self {
        let message = e.to_string();
        match &e {
            AuditError::NotFound(_) => AppError::NotFound(message),
            AuditError::AppendsBlocked
            | AuditError::ChainInconsistent(_)
            | AuditError::SignerUnavailable(_) => AppError::Unavailable {
                code: e.code(),
                message,
            },
            AuditError::Serialization(_) => AppError::BadRequest {
                code: e.code(),
                message,
            },
            _ => AppError::Internal(anyhow::anyhow!(message)),
        }
    }
}

impl From<PromotionError> for AppError {
    fn from(e: PromotionError) -> Self {
        let message = e.to_string();
        match &e {
            PromotionError::NotFound(_) => AppError::NotFound(message),
            PromotionError::Invalid(_) => AppError::BadRequest {
                code: e.code(),
                message,
            },
            _ => AppError::Internal(anyhow::anyhow!(message)),
        }
    }
}

// --- Shared State ---

pub struct GatewayState {
    pub check: Arc<CheckService>,
    pub registry: Arc<PolicyRegistry>,
    pub canary: Arc<CanaryController>,
    pub multisig: Arc<MultisigController>,
    pub promotions: Arc<PromotionOrchestrator>,
    pub chain: AuditChain,
    pub signers: Arc<SignerRegistry>,
    pub idempotency: IdempotencyStore,
}

// --- Router ---

async fn map_middleware_error(err: BoxError) -> impl IntoResponse {
    if err.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(serde_json::json!({
                "error": { "code": "TIMEOUT", "message": "request timed out" }
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": { "code": "OVERLOADED", "message": err.to_string() }
            })),
        )
    }
}

async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = std::time::Instant::now();
    let resp = next.run(req).await;
    gateway_metrics().observe_request_duration(&route, started.elapsed().as_secs_f64());
    gateway_metrics().inc_requests_total(&route, resp.status().as_u16());
    resp
}

pub fn build_router(state: Arc<GatewayState>) -> Router {
    // Write endpoints honoring x-idempotency-key.
    let idempotent_writes = Router::new()
        .route("/upgrade", post(handlers::submit_upgrade))
        .route("/upgrade/:id/approve", post(handlers::approve_upgrade))
        .route("/upgrade/:id/apply", post(handlers::apply_upgrade))
        .route("/promotion", post(handlers::submit_promotion))
        .route("/audit", post(handlers::append_audit))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            idempotency::idempotency_middleware,
        ));

    Router::new()
        .route("/check", post(handlers::check))
        .route(
            "/policy",
            get(handlers::list_policies).post(handlers::create_policy),
        )
        .route(
            "/policy/:id",
            get(handlers::get_policy).put(handlers::update_policy),
        )
        .route("/policy/:id/state", post(handlers::transition_policy))
        .route("/policy/:id/history", get(handlers::policy_history))
        .route("/policy/:id/canary", get(handlers::policy_canary))
        .route("/upgrade/:id", get(handlers::get_upgrade))
        .route("/promotion/:id", get(handlers::get_promotion))
        .route("/audit/:id", get(handlers::get_audit))
        .route("/audit/search", post(handlers::search_audit))
        .route("/signers", get(handlers::list_signers))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .merge(idempotent_writes)
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

pub async fn run_server(
    config: GatewayConfig,
    state: Arc<GatewayState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let cidrs: Arc<Vec<IpNetwork>> = Arc::new(
        config
            .trusted_proxies
            .iter()
            .filter_map(|s| IpNetwork::from_str(s).ok())
            .collect(),
    );
    let rate_limiter = limiter::IpLimiter::new(config.rps, config.burst, cidrs);

    let app = build_router(state)
        .route_layer(middleware::from_fn_with_state(
            rate_limiter,
            limiter::rate_limit_middleware,
        ))
        // Apply layers. The order is important: `HandleErrorLayer` must
        // wrap the fallible layers to make the service infallible.
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(map_middleware_error))
                .layer(LoadShedLayer::new())
                .layer(ConcurrencyLimitLayer::new(128))
                .layer(TimeoutLayer::new(Duration::from_secs(
                    config.request_timeout_secs,
                ))),
        )
        // These layers are infallible and can be applied outside the
        // error-handling wrapper.
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.body_limit_kb * 1024));

    let addr: SocketAddr = config.listen_addr.parse()?;
    tracing::info!(target: "gateway", "Sentinel gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_rx.changed().await.ok();
        tracing::info!(target: "gateway", "shutting down gracefully");
    });

    if let Err(e) = server.await {
        tracing::error!(target = "gateway", error = %e, "server error");
    }
    Ok(())
}

#[cfg(test)]
mod tests;
