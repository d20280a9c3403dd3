//! Operator configuration from command-line flags and environment

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

pub const DEFAULT_SYNAPSE_IMAGE: &str = "matrixdotorg/synapse:v1.60.0";
pub const DEFAULT_HEISENBRIDGE_IMAGE: &str = "hif1/heisenbridge:1.13";
pub const DEFAULT_SYNAPSE_CLUSTER_ROLE: &str = "system:openshift:scc:anyuid";

#[derive(Parser, Debug)]
#[command(name = "synapse-operator", version, about = "Kubernetes operator for Matrix Synapse")]
pub struct Cli {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the controller and the admission webhook
    Run(RunArgs),
    /// Print the Synapse CustomResourceDefinition as YAML
    Crd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Only watch Synapse resources in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    #[command(flatten)]
    pub operator: OperatorConfig,

    #[command(flatten)]
    pub webhook: WebhookConfig,
}

/// Settings consumed by the resource templates.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Image used for the homeserver Deployment
    #[arg(long, env = "SYNAPSE_IMAGE", default_value = DEFAULT_SYNAPSE_IMAGE)]
    pub synapse_image: String,

    /// Image used for the Heisenbridge Deployment
    #[arg(long, env = "HEISENBRIDGE_IMAGE", default_value = DEFAULT_HEISENBRIDGE_IMAGE)]
    pub heisenbridge_image: String,

    /// ClusterRole bound to each homeserver ServiceAccount
    #[arg(long, env = "SYNAPSE_CLUSTER_ROLE", default_value = DEFAULT_SYNAPSE_CLUSTER_ROLE)]
    pub synapse_cluster_role: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            synapse_image: DEFAULT_SYNAPSE_IMAGE.to_string(),
            heisenbridge_image: DEFAULT_HEISENBRIDGE_IMAGE.to_string(),
            synapse_cluster_role: DEFAULT_SYNAPSE_CLUSTER_ROLE.to_string(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct WebhookConfig {
    /// Do not start the admission webhook server
    #[arg(long, env = "DISABLE_WEBHOOK")]
    pub disable_webhook: bool,

    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    pub webhook_addr: SocketAddr,

    #[arg(
        long,
        env = "WEBHOOK_TLS_CERT",
        default_value = "/tmp/k8s-webhook-server/serving-certs/tls.crt"
    )]
    pub webhook_cert: PathBuf,

    #[arg(
        long,
        env = "WEBHOOK_TLS_KEY",
        default_value = "/tmp/k8s-webhook-server/serving-certs/tls.key"
    )]
    pub webhook_key: PathBuf,
}
