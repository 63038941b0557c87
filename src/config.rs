//! CLI configuration and argument parsing.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::k8s::ListScope;
use crate::upgrade::context::{OsOptions, UpgradeRequest};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Lifecycle status and version upgrades for Cluster API managed clusters.
#[derive(Parser, Debug, Clone)]
#[command(name = "capup")]
#[command(about = "Lifecycle status and version upgrades for Cluster API managed clusters")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Cli {
    /// Kubeconfig of the management cluster
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "CAPUP_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the lifecycle phase of every cluster
    Status(StatusArgs),
    /// Upgrade one cluster to a release
    Upgrade(Box<UpgradeArgs>),
    /// Classify clusters periodically and alert on stalls
    Watch(WatchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Only clusters in this namespace
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Only the cluster with this name
    #[arg(short, long)]
    pub cluster: Option<String>,
}

impl StatusArgs {
    pub fn scope(&self) -> ListScope {
        ListScope::in_namespace(self.namespace.as_deref())
    }
}

#[derive(Args, Debug, Clone)]
pub struct UpgradeArgs {
    /// Cluster to upgrade
    #[arg(short, long)]
    pub cluster: String,

    /// Namespace of the cluster object
    #[arg(short, long, default_value = "default")]
    pub namespace: String,

    /// Target release (e.g., v1.21.2+vmware.1)
    #[arg(short, long)]
    pub release: String,

    /// Release catalog file
    #[arg(long)]
    pub catalog: PathBuf,

    /// The cluster is the management cluster itself
    #[arg(long, default_value = "false")]
    pub management: bool,

    /// Product edition; `community` skips the standard package repository
    #[arg(long, default_value = "enterprise")]
    pub edition: String,

    /// Leave add-ons at their current version
    #[arg(long, default_value = "false")]
    pub skip_addon_upgrade: bool,

    /// Directory holding one `<addon>.yaml` template per add-on
    #[arg(long, default_value = "addons")]
    pub addons_dir: PathBuf,

    /// OS name for new machine images
    #[arg(long)]
    pub os_name: Option<String>,

    /// OS version for new machine images
    #[arg(long)]
    pub os_version: Option<String>,

    /// OS architecture for new machine images
    #[arg(long)]
    pub os_arch: Option<String>,

    /// AWS region used to select the machine image
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Serve upgrade metrics on this port while the upgrade runs
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

impl UpgradeArgs {
    pub fn request(&self) -> UpgradeRequest {
        UpgradeRequest {
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            release: self.release.clone(),
            is_management: self.management,
            edition: self.edition.clone(),
            skip_addon_upgrade: self.skip_addon_upgrade,
            os: OsOptions {
                name: self.os_name.clone(),
                version: self.os_version.clone(),
                arch: self.os_arch.clone(),
            },
            region: self.region.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    /// Only clusters in this namespace
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Seconds between classification passes
    #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: u64,

    #[arg(long, default_value = "8080")]
    pub health_port: u16,

    #[arg(long, default_value = "8081")]
    pub metrics_port: u16,

    /// Slack incoming webhook for stall alerts
    #[arg(long, env = "SLACK_WEBHOOK_URL", hide_env_values = true)]
    pub slack_webhook_url: Option<String>,
}

impl WatchArgs {
    pub fn scope(&self) -> ListScope {
        ListScope::in_namespace(self.namespace.as_deref())
    }

    /// Webhook URL, ignoring an empty value.
    pub fn slack_webhook_url(&self) -> Option<&str> {
        self.slack_webhook_url.as_deref().filter(|url| !url.is_empty())
    }
}
