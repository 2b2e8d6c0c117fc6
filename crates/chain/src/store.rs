//! The append-only audit event store.
//!
//! ---- Table layout (single redb database, shared with the other
//! subsystems) ----
//!
//! * `AUDIT_EVENTS`   seq (u64)            -> event row (JSON bytes)
//! * `AUDIT_BY_ID`    event id             -> seq
//! * `AUDIT_BY_HASH`  chain hash (hex)     -> seq
//! * `AUDIT_BY_CONTENT` content hash (hex) -> seq
//! * `AUDIT_BY_TS`    [ts_ms be64][seq be64] -> seq
//! * `AUDIT_META`     "TAIL"               -> (seq, chain hash) JSON
//!
//! The chain hash covers `(event_type, canonical(payload), prev_hash,
//! ts)`. Deduplication keys on the content hash (the same triple without
//! `prev_hash`), so identical events racing for the tail collapse to one
//! row no matter which of them wins the commit order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use sentinel_crypto::hash::{digest_from_hex, sha256};
use sentinel_crypto::SignerRegistry;
use sentinel_telemetry::{audit_metrics, signer_metrics};
use sentinel_types::audit::{AppendReceipt, AuditEvent, EventQuery};
use sentinel_types::codec;
use sentinel_types::error::AuditError;
use serde_json::Value;

use crate::retention::RetentionPolicy;

const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("AUDIT_EVENTS");
const BY_ID: TableDefinition<&str, u64> = TableDefinition::new("AUDIT_BY_ID");
const BY_HASH: TableDefinition<&str, u64> = TableDefinition::new("AUDIT_BY_HASH");
const BY_CONTENT: TableDefinition<&str, u64> = TableDefinition::new("AUDIT_BY_CONTENT");
const BY_TS: TableDefinition<&[u8], u64> = TableDefinition::new("AUDIT_BY_TS");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("AUDIT_META");

const TAIL_KEY: &str = "TAIL";
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 25;

fn be(e: impl std::fmt::Display) -> AuditError {
    AuditError::Backend(e.to_string())
}

fn transient(e: impl std::fmt::Display) -> AuditError {
    AuditError::Transient(e.to_string())
}

fn ts_key(ts_ms: u64, seq: u64) -> Vec<u8> {
    [ts_ms.to_be_bytes().as_slice(), seq.to_be_bytes().as_slice()].concat()
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The audit chain. Cheap to clone; all clones share the database and
/// consistency flag.
#[derive(Clone)]
pub struct AuditChain {
    db: Arc<Database>,
    signer: Arc<SignerRegistry>,
    retention: RetentionPolicy,
    max_attempts: u32,
    consistency_ok: Arc<AtomicBool>,
}

impl AuditChain {
    /// Wraps an open database, creating the audit tables if absent.
    pub fn new(
        db: Arc<Database>,
        signer: Arc<SignerRegistry>,
        retention: RetentionPolicy,
    ) -> Result<Self, AuditError> {
        // Ensure tables exist so later read transactions never hit a
        // missing-table error.
        let txn = db.begin_write().map_err(be)?;
        {
            txn.open_table(EVENTS).map_err(be)?;
            txn.open_table(BY_ID).map_err(be)?;
            txn.open_table(BY_HASH).map_err(be)?;
            txn.open_table(BY_CONTENT).map_err(be)?;
            txn.open_table(BY_TS).map_err(be)?;
            txn.open_table(META).map_err(be)?;
        }
        txn.commit().map_err(be)?;
        Ok(Self {
            db,
            signer,
            retention,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            consistency_ok: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Appends an event, stamping the current time.
    pub async fn append(
        &self,
        event_type: &str,
        payload: Value,
    ) -> Result<AppendReceipt, AuditError> {
        self.append_with_timestamp(event_type, payload, Utc::now())
            .await
    }

    /// Appends an event with a caller-held timestamp. Two calls with the
    /// same `(event_type, payload, ts)` commit exactly one row.
    pub async fn append_with_timestamp(
        &self,
        event_type: &str,
        payload: Value,
        ts: DateTime<Utc>,
    ) -> Result<AppendReceipt, AuditError> {
        let started = Instant::now();
        let result = self.append_inner(event_type, payload, ts).await;
        audit_metrics().observe_append_duration(started.elapsed().as_secs_f64());
        match &result {
            Ok(r) if r.was_skipped() => audit_metrics().inc_appends_total("skipped"),
            Ok(r) if r.deduplicated => audit_metrics().inc_appends_total("dedup"),
            Ok(_) => audit_metrics().inc_appends_total("ok"),
            Err(_) => audit_metrics().inc_appends_total("error"),
        }
        result
    }

    async fn append_inner(
        &self,
        event_type: &str,
        payload: Value,
        ts: DateTime<Utc>,
    ) -> Result<AppendReceipt, AuditError> {
        if !self.consistency_ok.load(Ordering::SeqCst) {
            return Err(AuditError::AppendsBlocked);
        }

        let decision = self.retention.decide(event_type, ts);
        if !decision.keep {
            return Ok(AppendReceipt::skipped(ts));
        }

        let canonical =
            codec::to_canonical_json(&payload).map_err(AuditError::Serialization)?;
        let ts_str = format_ts(&ts);
        let content_hash = hex::encode(sha256(&codec::event_preimage(
            event_type, &canonical, None, &ts_str,
        )));

        let mut attempt = 1u32;
        loop {
            match self
                .try_append_once(
                    event_type,
                    &payload,
                    &canonical,
                    &content_hash,
                    ts,
                    &ts_str,
                    decision.expires_at,
                )
                .await
            {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = Duration::from_millis(backoff_ms(attempt));
                    tracing::debug!(
                        target: "audit",
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "transient append failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    audit_metrics().inc_append_failures("retry_exhausted");
                    return Err(AuditError::RetryExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                Err(e) => {
                    audit_metrics().inc_append_failures(match &e {
                        AuditError::SignerUnavailable(_) => "signer",
                        AuditError::Serialization(_) => "serialization",
                        _ => "backend",
                    });
                    return Err(e);
                }
            }
        }
    }

    /// One append attempt. The signer round-trip happens with no storage
    /// lock held; the write transaction re-validates the tail before
    /// inserting and fails transiently on a lost race.
    #[allow(clippy::too_many_arguments)]
    async fn try_append_once(
        &self,
        event_type: &str,
        payload: &Value,
        canonical: &[u8],
        content_hash: &str,
        ts: DateTime<Utc>,
        ts_str: &str,
        retention_expires_at: Option<DateTime<Utc>>,
    ) -> Result<AppendReceipt, AuditError> {
        // 1. Snapshot the tail and check idempotency.
        let tail = self.read_tail()?;
        if let Some(existing) = self.lookup_by_content(content_hash)? {
            return Ok(AppendReceipt {
                id: existing.id,
                hash: existing.hash,
                ts: existing.ts,
                deduplicated: true,
            });
        }

        let prev_hash = tail.as_ref().map(|(_, h)| h.clone());
        let chain_hash = hex::encode(sha256(&codec::event_preimage(
            event_type,
            canonical,
            prev_hash.as_deref(),
            ts_str,
        )));

        // 2. Sign the chain hash. A failure aborts the attempt before any
        // storage mutation, so no unsigned row can ever exist.
        let digest = digest_from_hex(&chain_hash)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;
        let bundle = match self.signer.sign(&digest).await {
            Ok(b) => {
                signer_metrics().inc_sign_operations("ok");
                b
            }
            Err(e) => {
                signer_metrics().inc_sign_operations("error");
                return Err(AuditError::SignerUnavailable(e.to_string()));
            }
        };

        let event = AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
            prev_hash: prev_hash.clone(),
            hash: chain_hash.clone(),
            signature: bundle.signature_b64(),
            signer_kid: bundle.signer_kid,
            ts,
            manifest_signature_id: None,
            retention_expires_at,
        };
        let row = serde_json::to_vec(&event)?;
        let seq = tail.as_ref().map(|(s, _)| s + 1).unwrap_or(0);

        // 3. Commit under the single writer, re-validating the snapshot.
        let txn = self.db.begin_write().map_err(transient)?;
        {
            let mut meta = txn.open_table(META).map_err(be)?;
            let current_tail: Option<(u64, String)> = match meta.get(TAIL_KEY).map_err(be)? {
                Some(guard) => Some(serde_json::from_slice(guard.value())?),
                None => None,
            };
            if current_tail != tail {
                // Another writer advanced the chain between the snapshot
                // and this transaction. Retry from the top.
                return Err(transient("tail moved during append"));
            }

            let mut by_content = txn.open_table(BY_CONTENT).map_err(be)?;
            if by_content.get(content_hash).map_err(be)?.is_some() {
                // Identical event won the race; the retry path returns it.
                return Err(transient("duplicate content committed concurrently"));
            }
            by_content.insert(content_hash, seq).map_err(be)?;

            let mut events = txn.open_table(EVENTS).map_err(be)?;
            events.insert(seq, row.as_slice()).map_err(be)?;

            let mut by_id = txn.open_table(BY_ID).map_err(be)?;
            by_id.insert(event.id.as_str(), seq).map_err(be)?;

            let mut by_hash = txn.open_table(BY_HASH).map_err(be)?;
            by_hash.insert(chain_hash.as_str(), seq).map_err(be)?;

            let mut by_ts = txn.open_table(BY_TS).map_err(be)?;
            by_ts
                .insert(ts_key(ts.timestamp_millis() as u64, seq).as_slice(), seq)
                .map_err(be)?;

            let tail_value = serde_json::to_vec(&(seq, &chain_hash))?;
            meta.insert(TAIL_KEY, tail_value.as_slice()).map_err(be)?;
        }
        txn.commit().map_err(transient)?;

        tracing::debug!(
            target: "audit",
            event_type,
            seq,
            hash = %chain_hash,
            "audit event committed"
        );
        Ok(AppendReceipt {
            id: event.id,
            hash: chain_hash,
            ts,
            deduplicated: false,
        })
    }

    fn read_tail(&self) -> Result<Option<(u64, String)>, AuditError> {
        let txn = self.db.begin_read().map_err(be)?;
        let meta = txn.open_table(META).map_err(be)?;
        let result = match meta.get(TAIL_KEY).map_err(be)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        };
        result
    }

    fn lookup_by_content(&self, content_hash: &str) -> Result<Option<AuditEvent>, AuditError> {
        let txn = self.db.begin_read().map_err(be)?;
        let by_content = txn.open_table(BY_CONTENT).map_err(be)?;
        let Some(seq_guard) = by_content.get(content_hash).map_err(be)? else {
            return Ok(None);
        };
        let seq = seq_guard.value();
        let events = txn.open_table(EVENTS).map_err(be)?;
        let result = match events.get(seq).map_err(be)? {
            Some(row) => Ok(Some(serde_json::from_slice(row.value())?)),
            None => Ok(None),
        };
        result
    }

    /// Fetches an event by id.
    pub fn get(&self, id: &str) -> Result<AuditEvent, AuditError> {
        let txn = self.db.begin_read().map_err(be)?;
        let by_id = txn.open_table(BY_ID).map_err(be)?;
        let Some(seq_guard) = by_id.get(id).map_err(be)? else {
            return Err(AuditError::NotFound(id.to_string()));
        };
        let seq = seq_guard.value();
        let events = txn.open_table(EVENTS).map_err(be)?;
        let row = events
            .get(seq)
            .map_err(be)?
            .ok_or_else(|| AuditError::NotFound(id.to_string()))?;
        Ok(serde_json::from_slice(row.value())?)
    }

    /// Searches the chain in commit order.
    pub fn search(&self, query: &EventQuery) -> Result<Vec<AuditEvent>, AuditError> {
        let txn = self.db.begin_read().map_err(be)?;
        let events = txn.open_table(EVENTS).map_err(be)?;
        let mut out = Vec::new();

        match query.time_min {
            Some(time_min) => {
                let by_ts = txn.open_table(BY_TS).map_err(be)?;
                let start = ts_key(time_min.timestamp_millis().max(0) as u64, 0);
                for item in by_ts.range(start.as_slice()..).map_err(be)? {
                    let (_, seq_guard) = item.map_err(be)?;
                    let seq = seq_guard.value();
                    let Some(row) = events.get(seq).map_err(be)? else {
                        continue;
                    };
                    let event: AuditEvent = serde_json::from_slice(row.value())?;
                    if event.ts < time_min {
                        continue;
                    }
                    if let Some(et) = &query.event_type {
                        if &event.event_type != et {
                            continue;
                        }
                    }
                    out.push(event);
                    if out.len() >= query.limit {
                        break;
                    }
                }
            }
            None => {
                for item in events.iter().map_err(be)? {
                    let (_, row) = item.map_err(be)?;
                    let event: AuditEvent = serde_json::from_slice(row.value())?;
                    if let Some(et) = &query.event_type {
                        if &event.event_type != et {
                            continue;
                        }
                    }
                    out.push(event);
                    if out.len() >= query.limit {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Walks every committed event in sequence order. Used by the verifier.
    pub(crate) fn walk(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let txn = self.db.begin_read().map_err(be)?;
        let events = txn.open_table(EVENTS).map_err(be)?;
        let mut out = Vec::new();
        for item in events.iter().map_err(be)? {
            let (_, row) = item.map_err(be)?;
            out.push(serde_json::from_slice(row.value())?);
        }
        Ok(out)
    }

    /// Deletes rows whose retention horizon has passed. Returns the count
    /// removed. Index entries are dropped alongside; chain linkage of the
    /// surviving suffix is unaffected because `prev_hash` values are
    /// copied into rows at commit time.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, AuditError> {
        let expired: Vec<(u64, AuditEvent)> = {
            let txn = self.db.begin_read().map_err(be)?;
            let events = txn.open_table(EVENTS).map_err(be)?;
            let mut found = Vec::new();
            for item in events.iter().map_err(be)? {
                let (seq_guard, row) = item.map_err(be)?;
                let event: AuditEvent = serde_json::from_slice(row.value())?;
                if matches!(event.retention_expires_at, Some(at) if at <= now) {
                    found.push((seq_guard.value(), event));
                }
            }
            found
        };
        if expired.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write().map_err(transient)?;
        {
            let mut events = txn.open_table(EVENTS).map_err(be)?;
            let mut by_id = txn.open_table(BY_ID).map_err(be)?;
            let mut by_hash = txn.open_table(BY_HASH).map_err(be)?;
            let mut by_content = txn.open_table(BY_CONTENT).map_err(be)?;
            let mut by_ts = txn.open_table(BY_TS).map_err(be)?;
            for (seq, event) in &expired {
                events.remove(*seq).map_err(be)?;
                by_id.remove(event.id.as_str()).map_err(be)?;
                by_hash.remove(event.hash.as_str()).map_err(be)?;
                let canonical = codec::to_canonical_json(&event.payload)
                    .map_err(AuditError::Serialization)?;
                let content_hash = hex::encode(sha256(&codec::event_preimage(
                    &event.event_type,
                    &canonical,
                    None,
                    &format_ts(&event.ts),
                )));
                by_content.remove(content_hash.as_str()).map_err(be)?;
                by_ts
                    .remove(ts_key(event.ts.timestamp_millis() as u64, *seq).as_slice())
                    .map_err(be)?;
            }
        }
        txn.commit().map_err(transient)?;
        Ok(expired.len())
    }

    /// Current head `(seq, hash)`, if any event has been committed.
    pub fn head(&self) -> Result<Option<(u64, String)>, AuditError> {
        self.read_tail()
    }

    /// Whether the chain passed (or has not yet failed) verification.
    /// `false` blocks appends and degrades `/ready`.
    pub fn is_consistent(&self) -> bool {
        self.consistency_ok.load(Ordering::SeqCst)
    }

    pub(crate) fn flag_inconsistent(&self) {
        self.consistency_ok.store(false, Ordering::SeqCst);
    }

    /// Operator action after resolving a verification failure.
    pub fn clear_consistency_flag(&self) {
        self.consistency_ok.store(true, Ordering::SeqCst);
    }

    pub(crate) fn signer(&self) -> &SignerRegistry {
        &self.signer
    }
}

fn backoff_ms(attempt: u32) -> u64 {
    BACKOFF_BASE_MS << (attempt - 1).min(6)
}
