//! Component construction and the serve loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use redb::Database;
use sentinel_chain::{AuditChain, RetentionPolicy};
use sentinel_crypto::signer::kms::KmsSigner;
use sentinel_crypto::{
    ApproverKeyRegistry, LocalDevSigner, ProxySigner, SignerBackend, SignerRegistry,
};
use sentinel_gateway::{GatewayState, IdempotencyStore};
use sentinel_multisig::{MultisigController, UpgradeExecutor};
use sentinel_policy::{
    CanaryController, CheckService, EventConsumer, PolicyRegistry, PollingStream,
};
use sentinel_promotion::{
    CheckServiceGate, HttpAllocator, PromotionOrchestrator, ResourceAllocator, StaticAllocator,
};
use sentinel_telemetry::signer_metrics;
use sentinel_types::config::NodeConfig;
use sentinel_types::error::UpgradeError;
use sentinel_types::policy::PolicyState;
use sentinel_types::upgrade::{UpgradeManifest, UpgradeTarget};
use tokio::sync::watch;

/// Everything a serving node (or an integration test) needs.
pub struct Components {
    pub config: NodeConfig,
    pub db: Arc<Database>,
    pub signers: Arc<SignerRegistry>,
    pub chain: AuditChain,
    pub registry: Arc<PolicyRegistry>,
    pub canary: Arc<CanaryController>,
    pub check: Arc<CheckService>,
    pub multisig: Arc<MultisigController>,
    pub promotions: Arc<PromotionOrchestrator>,
    pub state: Arc<GatewayState>,
}

/// Dispatches applied manifests onto the subsystems they target.
struct ManifestExecutor {
    registry: Arc<PolicyRegistry>,
}

#[async_trait]
impl UpgradeExecutor for ManifestExecutor {
    async fn execute(&self, manifest: &UpgradeManifest) -> Result<(), UpgradeError> {
        match manifest.target {
            UpgradeTarget::Policy => {
                let policy_id = manifest
                    .payload
                    .get("policy_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        UpgradeError::InvalidManifest(
                            "policy manifest payload requires 'policy_id'".into(),
                        )
                    })?;
                let policy = self
                    .registry
                    .get(policy_id)
                    .map_err(|e| UpgradeError::InvalidManifest(e.to_string()))?;
                // A re-driven apply after a partial failure finds the
                // policy already active; that is success, not an error.
                if policy.state == PolicyState::Active {
                    return Ok(());
                }
                self.registry
                    .transition(policy_id, PolicyState::Active, "multisig")
                    .map_err(|e| UpgradeError::InvalidManifest(e.to_string()))?;
                Ok(())
            }
            // Artifact releases are executed by the promotion plane once
            // the manifest is applied; signer-set changes are operated
            // out-of-band. The applied manifest itself is the record.
            UpgradeTarget::Artifact | UpgradeTarget::System => Ok(()),
        }
    }
}

/// Builds the signer backends in probe order: KMS, proxy, local dev.
pub fn build_signer_backends(config: &NodeConfig) -> Result<Vec<Arc<dyn SignerBackend>>> {
    let mut backends: Vec<Arc<dyn SignerBackend>> = Vec::new();
    if let Some(kms) = &config.signers.kms {
        backends.push(Arc::new(KmsSigner::new(
            &kms.endpoint,
            &kms.key_id,
            Duration::from_millis(kms.timeout_ms),
        )?));
    }
    if let Some(proxy) = &config.signers.proxy {
        backends.push(Arc::new(ProxySigner::new(
            &proxy.endpoint,
            &proxy.key_id,
            proxy.api_key.as_deref(),
            Duration::from_millis(proxy.timeout_ms),
        )?));
    }
    if let Some(local) = &config.signers.local_dev {
        let secret = hex::decode(&local.secret_hex).context("local signer secret_hex")?;
        backends.push(Arc::new(LocalDevSigner::new(
            &local.key_id,
            &secret,
            config.environment,
        )?));
    }
    if backends.is_empty() {
        return Err(anyhow!("no signer backends configured"));
    }
    Ok(backends)
}

/// Validates the config, probes signers, and wires every subsystem.
/// A failed startup guard surfaces as an error; `main` exits non-zero.
pub async fn init(mut config: NodeConfig) -> Result<Components> {
    config.apply_env_overrides()?;
    config.validate()?;

    let db = Arc::new(
        Database::create(&config.database_path)
            .with_context(|| format!("open database {}", config.database_path))?,
    );

    let signers = Arc::new(SignerRegistry::new(build_signer_backends(&config)?));
    let readiness = signers
        .startup(config.kms_required())
        .await
        .context("signer startup probe")?;
    signer_metrics().set_signer_ready(readiness.is_ready());

    let chain = AuditChain::new(
        db.clone(),
        signers.clone(),
        RetentionPolicy::new(config.retention.clone()),
    )?;

    let registry = Arc::new(PolicyRegistry::new(db.clone())?);
    let canary = Arc::new(CanaryController::new(config.canary));
    let check = Arc::new(CheckService::new(
        registry.clone(),
        canary.clone(),
        chain.clone(),
    ));

    let approver_keys = Arc::new(ApproverKeyRegistry::new());
    for approver in &config.approvers {
        let pk = base64::engine::general_purpose::STANDARD
            .decode(&approver.public_key)
            .with_context(|| format!("approver '{}' public key", approver.id))?;
        approver_keys
            .register(&approver.id, &pk)
            .with_context(|| format!("approver '{}'", approver.id))?;
    }
    let multisig = Arc::new(MultisigController::new(
        db.clone(),
        approver_keys,
        chain.clone(),
        Arc::new(ManifestExecutor {
            registry: registry.clone(),
        }),
    )?);

    let allocator: Arc<dyn ResourceAllocator> = match &config.promotion.allocator_endpoint {
        Some(endpoint) => Arc::new(HttpAllocator::new(
            endpoint,
            Duration::from_millis(config.promotion.allocator_timeout_ms),
        )?),
        None => Arc::new(StaticAllocator::new()),
    };
    let promotions = Arc::new(PromotionOrchestrator::new(
        db.clone(),
        Arc::new(CheckServiceGate::new(
            check.clone(),
            config.promotion.min_score,
        )),
        allocator,
        chain.clone(),
    )?);

    let state = Arc::new(GatewayState {
        check: check.clone(),
        registry: registry.clone(),
        canary: canary.clone(),
        multisig: multisig.clone(),
        promotions: promotions.clone(),
        chain: chain.clone(),
        signers: signers.clone(),
        idempotency: IdempotencyStore::new(db.clone())?,
    });

    Ok(Components {
        config,
        db,
        signers,
        chain,
        registry,
        canary,
        check,
        multisig,
        promotions,
        state,
    })
}

/// Serves until ctrl-c: gateway, ops endpoint, stream consumer, and the
/// readiness refresher.
pub async fn run(components: Components) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = watch::channel(true);

    let telemetry_addr: std::net::SocketAddr = components
        .config
        .telemetry
        .listen_addr
        .parse()
        .context("telemetry listen_addr")?;
    let telemetry = tokio::spawn(sentinel_telemetry::http::run_server(
        telemetry_addr,
        ready_rx,
        shutdown_rx.clone(),
    ));

    let consumer = EventConsumer::new(
        components.registry.clone(),
        components.canary.clone(),
        components.chain.clone(),
        components.config.consumer.clone(),
    );
    let stream = PollingStream::new(
        components.chain.clone(),
        components.config.consumer.batch_size,
    );
    let consumer_task = tokio::spawn(consumer.run(stream, shutdown_rx.clone()));

    // Readiness refresher: a signer that stops answering or a chain that
    // fails verification demotes /readyz until resolved.
    let signers = components.signers.clone();
    let chain = components.chain.clone();
    let mut refresher_shutdown = shutdown_rx.clone();
    let refresher = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = refresher_shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs(15)) => {
                    let readiness = signers.probe().await;
                    signer_metrics().set_signer_ready(readiness.is_ready());
                    let _ = ready_tx.send(readiness.is_ready() && chain.is_consistent());
                }
            }
        }
    });

    let gateway = tokio::spawn(sentinel_gateway::run_server(
        components.config.gateway.clone(),
        components.state.clone(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.ok();
    tracing::info!(target: "node", "shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(gateway, consumer_task, telemetry, refresher);
    Ok(())
}
