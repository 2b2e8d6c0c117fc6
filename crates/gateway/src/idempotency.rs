//! At-most-once semantics for write endpoints.
//!
//! Callers attach `x-idempotency-key`; the first response under a key is
//! stored and replayed for every repeat, including a repeat whose body
//! diverged from the original (the stored response is authoritative).

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use sentinel_crypto::hash::sha256_hex;
use serde::{Deserialize, Serialize};

use crate::{AppError, GatewayState};

const IDEMPOTENCY: TableDefinition<&str, &[u8]> = TableDefinition::new("IDEMPOTENCY");

const KEY_HEADER: &str = "x-idempotency-key";
const REPLAY_HEADER: &str = "x-idempotent-replay";
const MAX_BODY_BYTES: usize = 1 << 20;
const DEFAULT_TTL_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize)]
struct StoredResponse {
    request_hash: String,
    response_status: u16,
    response_body: Vec<u8>,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct IdempotencyStore {
    db: Arc<Database>,
}

impl IdempotencyStore {
    pub fn new(db: Arc<Database>) -> Result<Self, anyhow::Error> {
        let txn = db.begin_write()?;
        {
            txn.open_table(IDEMPOTENCY)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    /// Returns the stored response for a key, dropping expired rows.
    fn lookup(&self, key: &str) -> Option<StoredResponse> {
        let txn = self.db.begin_read().ok()?;
        let table = txn.open_table(IDEMPOTENCY).ok()?;
        let row = table.get(key).ok()??;
        let stored: StoredResponse = serde_json::from_slice(row.value()).ok()?;
        if stored.expires_at <= Utc::now() {
            drop(row);
            drop(table);
            drop(txn);
            self.remove(key);
            return None;
        }
        Some(stored)
    }

    fn store(&self, key: &str, stored: &StoredResponse) {
        let Ok(row) = serde_json::to_vec(stored) else {
            return;
        };
        let Ok(txn) = self.db.begin_write() else {
            return;
        };
        let ok = {
            match txn.open_table(IDEMPOTENCY) {
                Ok(mut table) => table.insert(key, row.as_slice()).is_ok(),
                Err(_) => false,
            }
        };
        if ok {
            let _ = txn.commit();
        }
    }

    fn remove(&self, key: &str) {
        let Ok(txn) = self.db.begin_write() else {
            return;
        };
        let ok = {
            match txn.open_table(IDEMPOTENCY) {
                Ok(mut table) => table.remove(key).is_ok(),
                Err(_) => false,
            }
        };
        if ok {
            let _ = txn.commit();
        }
    }
}

/// Buffers the request, replays a stored response when the key was seen,
/// and records the fresh response otherwise. Divergent-body reuse of a key
/// also returns the stored response; the replay header tells the caller.
pub async fn idempotency_middleware(
    State(state): State<Arc<GatewayState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if req.method() != Method::POST {
        return next.run(req).await;
    }
    let Some(key) = req
        .headers()
        .get(KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
    else {
        return next.run(req).await;
    };

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => {
            return AppError::bad_request("INVALID_REQUEST", "request body unreadable")
                .into_response()
        }
    };
    let request_hash = sha256_hex(&bytes);

    if let Some(stored) = state.idempotency.lookup(&key) {
        if stored.request_hash != request_hash {
            tracing::warn!(
                target: "gateway",
                key = %key,
                "idempotency key reused with divergent body; returning stored response"
            );
        }
        let status =
            StatusCode::from_u16(stored.response_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .header(REPLAY_HEADER, "true")
            .body(Body::from(stored.response_body))
            .unwrap_or_else(|_| status.into_response());
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    let resp = next.run(req).await;

    let (resp_parts, resp_body) = resp.into_parts();
    let resp_bytes = match axum::body::to_bytes(resp_body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    // 5xx responses are not memoized: the caller is expected to retry and
    // deserves a fresh attempt.
    if !resp_parts.status.is_server_error() {
        state.idempotency.store(
            &key,
            &StoredResponse {
                request_hash,
                response_status: resp_parts.status.as_u16(),
                response_body: resp_bytes.to_vec(),
                expires_at: Utc::now() + Duration::hours(DEFAULT_TTL_HOURS),
            },
        );
    }
    Response::from_parts(resp_parts, Body::from(resp_bytes))
}
