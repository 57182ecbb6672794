use anyhow::Context;
use clap::Parser;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use aviary::config::Settings;
use aviary::controlplane::ControlPlane;
use aviary::core::driver::FakeConnector;

#[derive(Parser)]
#[command(name = "aviaryd", about = "VM fleet control-plane daemon")]
struct Cli {
    /// Override the state directory from configuration.
    #[arg(long)]
    state_dir: Option<std::path::PathBuf>,

    /// Hypervisor endpoints to register at startup, as name=uri pairs.
    #[arg(long = "host", value_name = "NAME=URI")]
    hosts: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::new().context("loading configuration")?;
    if let Some(state_dir) = cli.state_dir {
        settings.state_dir = state_dir;
    }
    info!(state_dir = %settings.state_dir.display(), "Starting aviary control plane");

    // Only the in-process fake backend ships with the core; real drivers
    // plug in through the Connector trait.
    if settings.driver.backend != "fake" {
        anyhow::bail!("unknown driver backend: {}", settings.driver.backend);
    }
    let plane = ControlPlane::build(&settings, Arc::new(FakeConnector::new()))
        .context("building control plane")?;

    for entry in &cli.hosts {
        let (name, uri) = entry
            .split_once('=')
            .with_context(|| format!("invalid --host entry: {entry}"))?;
        let host = plane
            .registry
            .add_host(uri, name, BTreeMap::new())
            .await
            .with_context(|| format!("registering host {name}"))?;
        info!(host_id = %host.id, name = %host.name, uri = %host.uri, "Registered host");
    }

    // Single-host setups get the configured default endpoint automatically.
    if cli.hosts.is_empty() && plane.registry.list().await.is_empty() {
        let mut labels = BTreeMap::new();
        labels.insert("auto".to_string(), "true".to_string());
        let host = plane
            .registry
            .add_host(&settings.driver.default_uri, "localhost", labels)
            .await
            .context("registering default host")?;
        info!(host_id = %host.id, uri = %host.uri, "Registered default host");
    }

    info!("Control plane ready");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    plane.shutdown().await;
    Ok(())
}
