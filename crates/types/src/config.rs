//! Configuration structures for the Sentinel node.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_true() -> bool {
    true
}

/// The deployment environment, selected by config or `SENTINEL_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn from_env_var(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Production),
            other => Err(ConfigError::Invalid(format!(
                "Unknown environment '{}'",
                other
            ))),
        }
    }
}

/// Top-level node configuration (`sentinel.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub environment: Environment,
    /// Path of the embedded database file.
    #[serde(default = "default_db_path")]
    pub database_path: String,
    /// Approver verification keys for the multisig plane.
    #[serde(default)]
    pub approvers: Vec<ApproverConfig>,
    #[serde(default)]
    pub signers: SignerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub canary: CanaryConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub promotion: PromotionConfig,
}

fn default_db_path() -> String {
    "sentinel.redb".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            database_path: default_db_path(),
            approvers: Vec::new(),
            signers: SignerConfig::default(),
            gateway: GatewayConfig::default(),
            telemetry: TelemetryConfig::default(),
            canary: CanaryConfig::default(),
            consumer: ConsumerConfig::default(),
            retention: RetentionConfig::default(),
            promotion: PromotionConfig::default(),
        }
    }
}

/// Signer backend configuration. Backends are probed in declaration
/// order; the first that answers is selected.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignerConfig {
    /// Require an asymmetric backend to pass its probe at startup.
    /// Implied by `environment = production`; also forced by
    /// `REQUIRE_KMS=true`.
    #[serde(default)]
    pub require_kms: bool,
    #[serde(default)]
    pub kms: Option<KmsSignerConfig>,
    #[serde(default)]
    pub proxy: Option<ProxySignerConfig>,
    /// Enable the HMAC dev signer. Refused in production.
    #[serde(default)]
    pub local_dev: Option<LocalSignerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsSignerConfig {
    /// Base URL of the KMS-compatible signing endpoint.
    pub endpoint: String,
    /// Key id to sign with.
    pub key_id: String,
    /// Request deadline in milliseconds.
    #[serde(default = "default_signer_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySignerConfig {
    /// Base URL of the signing proxy.
    pub endpoint: String,
    /// Key id advertised by the proxy.
    pub key_id: String,
    /// API key presented in `x-api-key`. mTLS termination is the
    /// deployment's responsibility.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_signer_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSignerConfig {
    pub key_id: String,
    /// Hex-encoded HMAC key material.
    pub secret_hex: String,
}

fn default_signer_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_rps")]
    pub rps: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_body_limit_kb")]
    pub body_limit_kb: usize,
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Request timeout for the whole router stack, seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            rps: default_rps(),
            burst: default_burst(),
            body_limit_kb: default_body_limit_kb(),
            trusted_proxies: Vec::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_rps() -> u32 {
    50
}
fn default_burst() -> u32 {
    100
}
fn default_body_limit_kb() -> usize {
    256
}
fn default_request_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Address of the ops HTTP server (`/metrics`, `/healthz`, `/readyz`).
    #[serde(default = "default_telemetry_addr")]
    pub listen_addr: String,
    #[serde(default = "default_true")]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_telemetry_addr(),
            json_logs: true,
        }
    }
}

fn default_telemetry_addr() -> String {
    "127.0.0.1:9090".to_string()
}

/// Canary rollback detector parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CanaryConfig {
    #[serde(default = "default_canary_window")]
    pub window: usize,
    /// Failure-rate threshold in [0, 1] triggering rollback.
    #[serde(default = "default_canary_threshold")]
    pub threshold: f64,
    #[serde(default = "default_canary_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            window: default_canary_window(),
            threshold: default_canary_threshold(),
            cooldown_secs: default_canary_cooldown_secs(),
        }
    }
}

fn default_canary_window() -> usize {
    50
}
fn default_canary_threshold() -> f64 {
    0.3
}
fn default_canary_cooldown_secs() -> u64 {
    600
}

/// Async event consumer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Poll interval against the chain search endpoint, milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Worker pool size.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded channel capacity between the puller and the workers.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Batch size per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Consumer group id used when a durable bus feeds the stream.
    #[serde(default = "default_group_id")]
    pub group_id: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            workers: default_workers(),
            channel_capacity: default_channel_capacity(),
            batch_size: default_batch_size(),
            group_id: default_group_id(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_workers() -> usize {
    4
}
fn default_channel_capacity() -> usize {
    256
}
fn default_batch_size() -> usize {
    100
}
fn default_group_id() -> String {
    "sentinel-consumer".to_string()
}

/// Promotion orchestration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionConfig {
    /// Minimum evaluation score a promotion must carry.
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    /// Resource allocator endpoint. Absent in development, where the
    /// in-memory allocator double is wired instead.
    #[serde(default)]
    pub allocator_endpoint: Option<String>,
    #[serde(default = "default_allocator_timeout_ms")]
    pub allocator_timeout_ms: u64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            allocator_endpoint: None,
            allocator_timeout_ms: default_allocator_timeout_ms(),
        }
    }
}

fn default_min_score() -> f64 {
    0.8
}
fn default_allocator_timeout_ms() -> u64 {
    3_000
}

/// One multisig approver's published verification key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproverConfig {
    pub id: String,
    /// Base64 Ed25519 public key.
    pub public_key: String,
}

/// Per-event-type retention sampling rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionRule {
    /// Event type this rule applies to, or `*` for the default.
    pub event_type: String,
    #[serde(default = "default_true")]
    pub keep: bool,
    /// Physical retention in days; `None` keeps forever.
    #[serde(default)]
    pub retention_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetentionConfig {
    #[serde(default)]
    pub rules: Vec<RetentionRule>,
}

impl NodeConfig {
    /// Applies environment-variable overrides. `SENTINEL_ENV`,
    /// `SENTINEL_DB`, and `REQUIRE_KMS` take precedence over the file.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(env) = std::env::var("SENTINEL_ENV") {
            self.environment = Environment::from_env_var(&env)?;
        }
        if let Ok(db) = std::env::var("SENTINEL_DB") {
            self.database_path = db;
        }
        if let Ok(v) = std::env::var("REQUIRE_KMS") {
            if v.eq_ignore_ascii_case("true") || v == "1" {
                self.signers.require_kms = true;
            }
        }
        Ok(())
    }

    /// Startup guards. Called once before any component is wired.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let production = self.environment.is_production();

        // DEV_SKIP_MTLS is a local-loop escape hatch only.
        if production {
            if let Ok(v) = std::env::var("DEV_SKIP_MTLS") {
                if v.eq_ignore_ascii_case("true") || v == "1" {
                    return Err(ConfigError::ProductionGuard(
                        "DEV_SKIP_MTLS=true is not permitted in production".into(),
                    ));
                }
            }
        }

        if production && self.signers.kms.is_none() && self.signers.proxy.is_none() {
            return Err(ConfigError::ProductionGuard(
                "production requires an asymmetric signer backend (kms or proxy)".into(),
            ));
        }

        if production && self.signers.local_dev.is_some() {
            return Err(ConfigError::ProductionGuard(
                "the local dev signer must not be configured in production".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.canary.threshold) {
            return Err(ConfigError::Invalid(format!(
                "canary.threshold must be in [0, 1], got {}",
                self.canary.threshold
            )));
        }
        if self.canary.window == 0 {
            return Err(ConfigError::Invalid("canary.window must be > 0".into()));
        }

        Ok(())
    }

    /// Whether an asymmetric signer probe must succeed before serving.
    pub fn kms_required(&self) -> bool {
        self.signers.require_kms || self.environment.is_production()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let cfg: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.environment, Environment::Development);
        assert_eq!(cfg.canary.window, 50);
        assert!((cfg.canary.threshold - 0.3).abs() < f64::EPSILON);
        assert_eq!(cfg.consumer.workers, 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn production_requires_asymmetric_signer() {
        let cfg: NodeConfig = toml::from_str(r#"environment = "production""#).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ProductionGuard(_))
        ));
    }

    #[test]
    fn production_rejects_local_dev_signer() {
        let cfg: NodeConfig = toml::from_str(
            r#"
environment = "production"

[signers.kms]
endpoint = "https://kms.internal"
key_id = "prod-key"

[signers.local_dev]
key_id = "dev"
secret_hex = "00ff"
"#,
        )
        .unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ProductionGuard(_))
        ));
    }

    #[test]
    fn kms_required_follows_env_and_flag() {
        let mut cfg = NodeConfig::default();
        assert!(!cfg.kms_required());
        cfg.signers.require_kms = true;
        assert!(cfg.kms_required());
        cfg.signers.require_kms = false;
        cfg.environment = Environment::Production;
        assert!(cfg.kms_required());
    }
}
