//! Synapse Operator Entry Point
//!
//! Starts the Kubernetes controller and the admission webhook server.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube::CustomResourceExt;
use synapse_operator::{
    config::{Cli, Command, LogFormat, RunArgs},
    controller,
    crd::Synapse,
};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&Synapse::crd())?);
            Ok(())
        }
        Command::Run(args) => {
            init_tracing(cli.log_format);
            run(args).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    info!(
        "Starting Synapse Operator v{} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_SHA"),
        env!("BUILD_DATE")
    );

    // Initialize Kubernetes client
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");
    match &args.namespace {
        Some(ns) => info!("Watching namespace: {}", ns),
        None => info!("Watching all namespaces"),
    }

    // Start the admission webhook unless disabled
    #[cfg(feature = "admission-webhook")]
    {
        if args.webhook.disable_webhook {
            info!("Admission webhook disabled");
        } else {
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
            let webhook = args.webhook.clone();
            tokio::spawn(async move {
                if let Err(e) = synapse_operator::webhook::run_server(webhook).await {
                    tracing::error!("Admission webhook server error: {}", e);
                }
            });
        }
    }

    // Create shared controller state
    let state = Arc::new(controller::ControllerState {
        client,
        config: args.operator,
    });

    controller::run_controller(state, args.namespace)
        .await
        .context("controller failed")?;
    Ok(())
}
