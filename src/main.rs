//! capup - lifecycle status and version upgrades for Cluster API managed clusters.
//!
//! Classifies every cluster into a single lifecycle phase, detects stalled
//! create and upgrade operations, and upgrades a cluster to a release with
//! template rotation, control-plane and worker rollouts, and add-on updates.

mod addons;
mod capi;
mod config;
mod error;
mod k8s;
mod lifecycle;
mod notify;
mod poll;
mod release;
mod snapshot;
mod telemetry;
mod template;
mod upgrade;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use prometheus_client::registry::Registry;
use tracing::{debug, error, info};

use addons::render::DirectoryRenderer;
use config::{BUILD_DATE, COMMIT, Cli, Command, LogFormat, StatusArgs, UpgradeArgs, VERSION, WatchArgs};
use k8s::client::{KubeResourceClient, workload_client};
use lifecycle::ClusterSummary;
use notify::{Notifier, SlackNotifier};
use release::catalog::ReleaseCatalog;
use telemetry::health::HealthState;
use telemetry::metrics::Metrics;
use upgrade::Upgrader;
use watch::Watcher;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli.log_level, cli.log_format) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    debug!(
        "Starting capup v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing subscriber. `RUST_LOG` takes precedence over `--log-level`.
fn init_tracing(log_level: &str, format: LogFormat) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    let builder = fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let client = KubeResourceClient::connect(cli.kubeconfig.as_deref(), cli.context.as_deref()).await?;
    info!("Connected to management cluster");

    match cli.command {
        Command::Status(args) => status(&client, &args).await,
        Command::Upgrade(args) => upgrade(&client, &args).await,
        Command::Watch(args) => watch(&client, &args).await,
    }
}

async fn status(client: &KubeResourceClient, args: &StatusArgs) -> Result<()> {
    let now = Utc::now();
    let snapshots = snapshot::collect(client, &args.scope()).await?;
    println!(
        "{:<24} {:<16} {:<14} {:<8} {:<8} VERSION",
        "NAME", "NAMESPACE", "PHASE", "CP", "WORKERS"
    );
    snapshots
        .iter()
        .filter(|s| args.cluster.as_deref().is_none_or(|name| s.name() == name))
        .map(|s| ClusterSummary::from_snapshot(s, now))
        .for_each(|summary| println!("{summary}"));
    Ok(())
}

/// Spawn the metrics server on `port` in the background.
fn spawn_metrics_server(port: u16, registry: Arc<Registry>) {
    tokio::spawn(async move {
        if let Err(e) = telemetry::metrics::serve(port, registry).await {
            error!("Metrics server failed: {}", e);
        }
    });
}

async fn upgrade(management: &KubeResourceClient, args: &UpgradeArgs) -> Result<()> {
    let request = args.request();
    let catalog = ReleaseCatalog::load(&args.catalog)?;
    let renderer = DirectoryRenderer::new(&args.addons_dir);

    let mut registry = Registry::default();
    let metrics = Metrics::new(&mut registry);
    if let Some(port) = args.metrics_port {
        spawn_metrics_server(port, Arc::new(registry));
    }

    let workload = if request.is_management {
        management.clone()
    } else {
        workload_client(management, &request.cluster, &request.namespace).await?
    };

    Upgrader::new(management, &workload, &catalog, &renderer)
        .with_metrics(&metrics)
        .upgrade_cluster(&request)
        .await?;

    info!(
        cluster = %request.cluster,
        namespace = %request.namespace,
        release = %request.release,
        "Upgrade complete"
    );
    Ok(())
}

async fn watch(client: &KubeResourceClient, args: &WatchArgs) -> Result<()> {
    let mut registry = Registry::default();
    let metrics = Metrics::new(&mut registry);
    spawn_metrics_server(args.metrics_port, Arc::new(registry));

    let health = HealthState::new();
    let health_state = health.clone();
    let health_port = args.health_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::health::serve(health_port, health_state).await {
            error!("Health server failed: {}", e);
        }
    });

    let slack = args.slack_webhook_url().map(|url| {
        info!("Slack notifications enabled");
        SlackNotifier::new(url.to_string())
    });

    info!(interval = args.interval, "Starting cluster watch");
    Watcher::new(
        client,
        args.scope(),
        &metrics,
        slack.as_ref().map(|s| s as &dyn Notifier),
        health,
    )
    .run(Duration::from_secs(args.interval))
    .await;

    Ok(())
}
