//! Kubeconfig Operator - RBAC-scoped, self-rotating kubeconfigs for ServiceAccounts

mod config;
mod controller_runner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt, ResourceExt};

use kubeconfig_common::crd::Kubeconfig;
use kubeconfig_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use kubeconfig_common::FIELD_MANAGER;

/// Kubeconfig operator - issues kubeconfigs for ServiceAccounts with declared permissions
#[derive(Parser, Debug)]
#[command(name = "kubeconfig-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// PEM file with the cluster CA embedded in generated kubeconfigs
    #[arg(long, env = "KUBECONFIG_OPERATOR_CA_FILE")]
    ca_file: Option<PathBuf>,

    /// Only reconcile Kubeconfigs in this namespace
    #[arg(long, env = "KUBECONFIG_OPERATOR_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Do not install or update the CRD on startup
    #[arg(long, env = "KUBECONFIG_OPERATOR_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,

    /// Log output format (json or text)
    #[arg(
        long,
        value_enum,
        env = "KUBECONFIG_OPERATOR_LOG_FORMAT",
        default_value_t = LogFormat::Json
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Kubeconfig::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli).await,
    }
}

/// Install or update the Kubeconfig CRD
///
/// Server-side apply keeps the installed schema in step with the operator
/// version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = Kubeconfig::crd();
    let name = crd.name_any();

    tracing::info!(crd = %name, "Installing Kubeconfig CRD...");
    crds.patch(&name, &params, &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Kubeconfig CRD: {}", e))?;

    Ok(())
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let kube_config = kube::Config::infer()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load Kubernetes configuration: {}", e))?;
    let ca_data = config::load_ca_bundle(
        cli.ca_file.as_deref(),
        std::path::Path::new(config::SERVICE_ACCOUNT_CA_PATH),
        kube_config.root_cert.as_deref(),
    )?;
    let client = Client::try_from(kube_config)
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if cli.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        ensure_crds_installed(&client).await?;
    }

    tracing::info!("Starting Kubeconfig controller");
    controller_runner::run_kubeconfig_controller(client, ca_data, cli.watch_namespace).await;
    tracing::info!("Controller stopped");

    Ok(())
}
