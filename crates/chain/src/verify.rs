//! Full-chain verification.
//!
//! Walks the committed chain in sequence order and checks three things for
//! every row: the prev-hash linkage, the recomputed content of `hash`, and
//! the stored signature. Any failure raises the chain's consistency flag,
//! which blocks further appends and degrades `/ready` until an operator
//! clears it.

use base64::Engine as _;
use chrono::SecondsFormat;
use sentinel_crypto::hash::{digest_from_hex, sha256};
use sentinel_telemetry::audit_metrics;
use sentinel_types::codec;
use sentinel_types::error::AuditError;
use serde::{Deserialize, Serialize};

use crate::store::AuditChain;

/// The outcome of one verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Number of rows examined.
    pub checked: u64,
    pub ok: bool,
    /// Human-readable descriptions of every failure found.
    pub failures: Vec<String>,
}

impl AuditChain {
    /// Verifies the whole chain. Returns the report; on failure the
    /// consistency flag is raised as a side effect.
    pub fn verify_chain(&self) -> Result<VerifyReport, AuditError> {
        let events = self.walk()?;
        let mut failures = Vec::new();
        let mut prev_hash: Option<String> = None;
        let mut first = true;

        for event in &events {
            // Linkage. Retention purges may remove a prefix of the chain,
            // so the first surviving row's back-pointer is only checked
            // against an absent predecessor when nothing was purged ahead
            // of it (genesis carries no prev_hash by definition).
            if first {
                first = false;
            } else if event.prev_hash != prev_hash {
                failures.push(format!(
                    "event {}: prev_hash {:?} does not match predecessor hash {:?}",
                    event.id, event.prev_hash, prev_hash
                ));
            }

            // Hash recomputation.
            let canonical = match codec::to_canonical_json(&event.payload) {
                Ok(c) => c,
                Err(e) => {
                    failures.push(format!("event {}: canonicalization failed: {}", event.id, e));
                    prev_hash = Some(event.hash.clone());
                    continue;
                }
            };
            let ts_str = event.ts.to_rfc3339_opts(SecondsFormat::Micros, true);
            let recomputed = hex::encode(sha256(&codec::event_preimage(
                &event.event_type,
                &canonical,
                event.prev_hash.as_deref(),
                &ts_str,
            )));
            if recomputed != event.hash {
                failures.push(format!(
                    "event {}: stored hash {} does not match recomputed {}",
                    event.id, event.hash, recomputed
                ));
            }

            // Signature.
            match (
                digest_from_hex(&event.hash),
                base64::engine::general_purpose::STANDARD.decode(&event.signature),
            ) {
                (Ok(digest), Ok(signature)) => {
                    match self
                        .signer()
                        .verify(&event.signer_kid, &digest, &signature)
                    {
                        Ok(true) => {}
                        Ok(false) => failures.push(format!(
                            "event {}: signature by '{}' failed verification",
                            event.id, event.signer_kid
                        )),
                        Err(e) => failures.push(format!(
                            "event {}: signature by '{}' could not be checked: {}",
                            event.id, event.signer_kid, e
                        )),
                    }
                }
                (Err(e), _) => {
                    failures.push(format!("event {}: bad stored hash: {}", event.id, e))
                }
                (_, Err(e)) => {
                    failures.push(format!("event {}: bad stored signature: {}", event.id, e))
                }
            }

            prev_hash = Some(event.hash.clone());
        }

        let ok = failures.is_empty();
        if ok {
            audit_metrics().inc_chain_verifications("ok");
        } else {
            audit_metrics().inc_chain_verifications("failed");
            self.flag_inconsistent();
            tracing::error!(
                target: "audit",
                failures = failures.len(),
                "chain verification failed; appends blocked"
            );
        }
        Ok(VerifyReport {
            checked: events.len() as u64,
            ok,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::store::tests::test_chain;
    use serde_json::json;

    #[tokio::test]
    async fn verifies_clean_chain() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir).await;
        chain.append("test.one", json!({"foo": "bar"})).await.unwrap();
        chain.append("test.two", json!({"foo": "baz"})).await.unwrap();
        chain.append("test.three", json!({"foo": "qux"})).await.unwrap();

        let report = chain.verify_chain().unwrap();
        assert!(report.ok, "failures: {:?}", report.failures);
        assert_eq!(report.checked, 3);
        assert!(chain.is_consistent());
    }

    #[tokio::test]
    async fn empty_chain_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let chain = test_chain(&dir).await;
        let report = chain.verify_chain().unwrap();
        assert!(report.ok);
        assert_eq!(report.checked, 0);
    }
}
