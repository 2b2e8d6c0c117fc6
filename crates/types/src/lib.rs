//! # Sentinel Types
//!
//! Core data structures shared across the Sentinel control plane: audit
//! events, policies and their rule language, upgrade manifests, promotions,
//! the canonical codec, and the domain error types. This crate sits at the
//! bottom of the dependency graph and stays free of I/O.

pub mod audit;
pub mod codec;
pub mod config;
pub mod error;
pub mod policy;
pub mod promotion;
pub mod rbac;
pub mod upgrade;

pub use audit::{AppendReceipt, AuditEvent, EventQuery};
pub use policy::{
    Decision, Effect, EvaluationContext, Policy, PolicyMetadata, PolicyState, RuleNode, Severity,
};
pub use promotion::{Promotion, PromotionRequest, PromotionStatus};
pub use upgrade::{ManifestApproval, UpgradeManifest, UpgradeState, UpgradeTarget};
