//! # Sentinel Audit Chain
//!
//! Append-only store of signed, hash-chained audit events. Appends are
//! serialized through the single-writer storage transaction, deduplicated
//! by content hash, and signed before commit; no unsigned row is ever
//! persisted. A full-chain verifier guards tamper evidence and gates
//! `/ready`.

pub mod retention;
pub mod store;
pub mod verify;

pub use retention::RetentionPolicy;
pub use store::AuditChain;
pub use verify::VerifyReport;
