use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sentinel_node::bootstrap;
use sentinel_types::config::NodeConfig;

#[derive(Parser)]
#[command(name = "sentinel-node", about = "Sentinel trust-and-control plane node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the gateway, ops endpoints, and the stream consumer.
    Run {
        #[arg(long, default_value = "sentinel.toml")]
        config: PathBuf,
    },
    /// Walk the audit chain and verify linkage, hashes, and signatures.
    VerifyChain {
        #[arg(long, default_value = "sentinel.toml")]
        config: PathBuf,
    },
    /// Write a default configuration file.
    InitConfig {
        #[arg(long, default_value = "sentinel.toml")]
        path: PathBuf,
    },
}

fn load_config(path: &PathBuf) -> Result<NodeConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
}

async fn execute(cli: Cli) -> Result<bool> {
    match cli.command {
        Command::Run { config } => {
            let config = load_config(&config)?;
            if config.telemetry.json_logs {
                sentinel_telemetry::init::init_tracing()?;
            } else {
                sentinel_telemetry::init::init_tracing_pretty()?;
            }
            sentinel_telemetry::prometheus::install()
                .map_err(|e| anyhow::anyhow!("metrics install failed: {}", e))?;
            let components = bootstrap::init(config).await?;
            bootstrap::run(components).await?;
            Ok(true)
        }
        Command::VerifyChain { config } => {
            let config = load_config(&config)?;
            sentinel_telemetry::init::init_tracing_pretty()?;
            let components = bootstrap::init(config).await?;
            let report = components.chain.verify_chain()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.ok)
        }
        Command::InitConfig { path } => {
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            let default = NodeConfig::default();
            std::fs::write(&path, toml::to_string_pretty(&default)?)
                .with_context(|| format!("write {}", path.display()))?;
            println!("wrote {}", path.display());
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
