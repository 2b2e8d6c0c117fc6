//! Core error types for the Sentinel control plane.

use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors raised by the audit chain.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The requested event does not exist.
    #[error("Audit event not found: {0}")]
    NotFound(String),
    /// An error occurred in the storage backend.
    #[error("Audit backend error: {0}")]
    Backend(String),
    /// A transient backend fault (connection, timeout, lock contention).
    /// Eligible for retry with backoff.
    #[error("Transient audit backend error: {0}")]
    Transient(String),
    /// Canonical encoding of the payload failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The signer refused or failed to sign the event hash.
    #[error("Signer unavailable: {0}")]
    SignerUnavailable(String),
    /// Chain verification found a broken link or forged row. Appends are
    /// blocked until an operator clears the flag.
    #[error("Audit chain inconsistent: {0}")]
    ChainInconsistent(String),
    /// An append was attempted while the consistency flag is raised.
    #[error("Appends are blocked pending consistency resolution")]
    AppendsBlocked,
    /// All retry attempts were exhausted.
    #[error("Append failed after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Description of the final failure.
        last: String,
    },
}

impl AuditError {
    /// Whether the failing operation may be retried from the top.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuditError::Transient(_))
    }
}

impl ErrorCode for AuditError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "AUDIT_EVENT_NOT_FOUND",
            Self::Backend(_) => "AUDIT_BACKEND_ERROR",
            Self::Transient(_) => "AUDIT_BACKEND_TRANSIENT",
            Self::Serialization(_) => "AUDIT_SERIALIZATION_ERROR",
            Self::SignerUnavailable(_) => "AUDIT_SIGNER_UNAVAILABLE",
            Self::ChainInconsistent(_) => "AUDIT_CHAIN_INCONSISTENT",
            Self::AppendsBlocked => "AUDIT_APPENDS_BLOCKED",
            Self::RetryExhausted { .. } => "AUDIT_RETRY_EXHAUSTED",
        }
    }
}

/// Errors raised by the policy registry and evaluator.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The policy id does not exist.
    #[error("Policy not found: {0}")]
    NotFound(String),
    /// `(name, version)` already exists.
    #[error("Policy '{name}' version {version} already exists")]
    DuplicateVersion {
        /// The policy name.
        name: String,
        /// The conflicting version.
        version: u32,
    },
    /// The requested state transition is not allowed.
    #[error("Invalid policy state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state.
        from: crate::policy::PolicyState,
        /// Requested state.
        to: crate::policy::PolicyState,
    },
    /// Activation requires an explicit `metadata.effect`.
    #[error("Policy '{0}' cannot be activated without an explicit effect")]
    EffectRequired(String),
    /// The rule tree failed to parse or validate.
    #[error("Invalid rule: {0}")]
    InvalidRule(String),
    /// The evaluator hit an unexpected condition. The decision path treats
    /// this as a non-match.
    #[error("Evaluation error: {0}")]
    Evaluation(String),
    /// Backend storage error.
    #[error("Policy backend error: {0}")]
    Backend(String),
    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The caller lacks the role required for this operation.
    #[error("Operation requires role '{0}'")]
    Forbidden(String),
}

impl ErrorCode for PolicyError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "POLICY_NOT_FOUND",
            Self::DuplicateVersion { .. } => "POLICY_DUPLICATE_VERSION",
            Self::InvalidTransition { .. } => "POLICY_INVALID_TRANSITION",
            Self::EffectRequired(_) => "POLICY_EFFECT_REQUIRED",
            Self::InvalidRule(_) => "POLICY_INVALID_RULE",
            Self::Evaluation(_) => "POLICY_EVALUATION_ERROR",
            Self::Backend(_) => "POLICY_BACKEND_ERROR",
            Self::Serialization(_) => "POLICY_SERIALIZATION_ERROR",
            Self::Forbidden(_) => "POLICY_FORBIDDEN",
        }
    }
}

/// Errors raised by the multisig upgrade controller.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The manifest id does not exist.
    #[error("Upgrade manifest not found: {0}")]
    NotFound(String),
    /// The approver is not in the manifest's threshold set.
    #[error("Approver '{0}' is not authorized for this manifest")]
    UnauthorizedApprover(String),
    /// The `(upgrade_id, approver_id)` pair already approved.
    #[error("Approver '{approver_id}' already approved manifest {upgrade_id}")]
    DuplicateApproval {
        /// The manifest.
        upgrade_id: String,
        /// The repeating approver.
        approver_id: String,
    },
    /// Apply requested before the quorum was reached.
    #[error("Insufficient approvals: have {have}, need {need}")]
    InsufficientApprovals {
        /// Approvals currently recorded.
        have: u32,
        /// Approvals required by the manifest.
        need: u32,
    },
    /// A recorded signature failed verification. Fatal: blocks apply.
    #[error("Approval signature from '{approver_id}' failed verification: {reason}")]
    SignatureInvalid {
        /// The approver whose signature failed.
        approver_id: String,
        /// Verifier detail.
        reason: String,
    },
    /// The manifest is in a terminal state and cannot be mutated.
    #[error("Manifest {id} is immutable in state {state:?}")]
    Terminal {
        /// The manifest.
        id: String,
        /// Its terminal state.
        state: crate::upgrade::UpgradeState,
    },
    /// The requested transition is not allowed by the state machine.
    #[error("Invalid manifest transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state.
        from: crate::upgrade::UpgradeState,
        /// Requested state.
        to: crate::upgrade::UpgradeState,
    },
    /// The manifest payload or threshold set is malformed.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
    /// Backend storage error.
    #[error("Upgrade backend error: {0}")]
    Backend(String),
    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The required audit record could not be written; apply paths
    /// propagate this instead of proceeding unaudited.
    #[error("Audit append failed: {0}")]
    Audit(String),
}

impl ErrorCode for UpgradeError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "UPGRADE_NOT_FOUND",
            Self::UnauthorizedApprover(_) => "UPGRADE_UNAUTHORIZED_APPROVER",
            Self::DuplicateApproval { .. } => "UPGRADE_DUPLICATE_APPROVAL",
            Self::InsufficientApprovals { .. } => "insufficient_approvals",
            Self::SignatureInvalid { .. } => "UPGRADE_SIGNATURE_INVALID",
            Self::Terminal { .. } => "UPGRADE_MANIFEST_IMMUTABLE",
            Self::InvalidTransition { .. } => "UPGRADE_INVALID_TRANSITION",
            Self::InvalidManifest(_) => "UPGRADE_INVALID_MANIFEST",
            Self::Backend(_) => "UPGRADE_BACKEND_ERROR",
            Self::Serialization(_) => "UPGRADE_SERIALIZATION_ERROR",
            Self::Audit(_) => "UPGRADE_AUDIT_FAILED",
        }
    }
}

/// Errors raised by the promotion orchestrator.
#[derive(Debug, Error)]
pub enum PromotionError {
    /// The promotion id does not exist.
    #[error("Promotion not found: {0}")]
    NotFound(String),
    /// The resource allocator refused or failed the reservation.
    #[error("Allocation failed: {0}")]
    AllocatorFailed(String),
    /// The request was malformed.
    #[error("Invalid promotion request: {0}")]
    Invalid(String),
    /// Backend storage error.
    #[error("Promotion backend error: {0}")]
    Backend(String),
    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The required audit record could not be written.
    #[error("Audit append failed: {0}")]
    Audit(String),
}

impl ErrorCode for PromotionError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "PROMOTION_NOT_FOUND",
            Self::AllocatorFailed(_) => "PROMOTION_ALLOCATION_FAILED",
            Self::Invalid(_) => "PROMOTION_INVALID_REQUEST",
            Self::Backend(_) => "PROMOTION_BACKEND_ERROR",
            Self::Serialization(_) => "PROMOTION_SERIALIZATION_ERROR",
            Self::Audit(_) => "PROMOTION_AUDIT_FAILED",
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config: {0}")]
    Io(String),
    /// The configuration failed to parse.
    #[error("Failed to parse config: {0}")]
    Parse(String),
    /// A value failed validation.
    #[error("Invalid config value: {0}")]
    Invalid(String),
    /// A production startup guard rejected the environment.
    #[error("Production guard violated: {0}")]
    ProductionGuard(String),
}

impl ErrorCode for ConfigError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "CONFIG_IO_ERROR",
            Self::Parse(_) => "CONFIG_PARSE_ERROR",
            Self::Invalid(_) => "CONFIG_INVALID_VALUE",
            Self::ProductionGuard(_) => "CONFIG_PRODUCTION_GUARD",
        }
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        AuditError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for PolicyError {
    fn from(e: serde_json::Error) -> Self {
        PolicyError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for UpgradeError {
    fn from(e: serde_json::Error) -> Self {
        UpgradeError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for PromotionError {
    fn from(e: serde_json::Error) -> Self {
        PromotionError::Serialization(e.to_string())
    }
}

impl From<String> for PolicyError {
    fn from(s: String) -> Self {
        PolicyError::Serialization(s)
    }
}
