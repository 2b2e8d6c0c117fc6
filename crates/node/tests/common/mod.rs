use sentinel_node::bootstrap::{self, Components};
use sentinel_types::config::{LocalSignerConfig, NodeConfig};

/// Builds a full component stack against a scratch database with the dev
/// signer.
pub async fn dev_components(dir: &tempfile::TempDir) -> Components {
    let mut config = NodeConfig::default();
    config.database_path = dir
        .path()
        .join("sentinel.redb")
        .to_string_lossy()
        .into_owned();
    config.signers.local_dev = Some(LocalSignerConfig {
        key_id: "dev-e2e".into(),
        secret_hex: hex::encode(b"sentinel-e2e-secret-key"),
    });
    bootstrap::init(config).await.expect("bootstrap")
}
