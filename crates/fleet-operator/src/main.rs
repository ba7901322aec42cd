//! Fleet operator - bare-metal Instance and InstancePool reconciliation

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use fleet_common::config::{
    DEFAULT_BOOTSTRAP_CONFIG_PATH, DEFAULT_CREDENTIAL_SECRET, DEFAULT_INGRESS_NAMESPACE,
    DEFAULT_INGRESS_SERVICE, DEFAULT_INTERFACE, DEFAULT_IPXE_SCRIPT_URL, DEFAULT_ISO_URL,
    DEFAULT_METAL_API_URL, DEFAULT_NAMESPACE, INITIAL_IPXE_SCRIPT_URL,
};
use fleet_common::crd::{Instance, InstancePool};
use fleet_common::kube_utils::{create_client, parse_duration};
use fleet_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use fleet_common::{OperatorConfig, FIELD_MANAGER};

mod controller_runner;

/// Fleet - reconciles bare-metal machines into cluster members
#[derive(Parser, Debug)]
#[command(name = "fleet-operator", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format (json or text)
    #[arg(long, env = "LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Instance and InstancePool controllers (default mode)
    Controller(ControllerArgs),
}

/// Controller settings; every flag can also come from the environment
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Namespace holding the credential secret
    #[arg(long, env = "NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Name of the provisioning credential secret
    #[arg(long, env = "EQUINIX_SECRET", default_value = DEFAULT_CREDENTIAL_SECRET)]
    credential_secret: String,

    /// Provisioning API base URL
    #[arg(long, env = "METAL_API_URL", default_value = DEFAULT_METAL_API_URL)]
    metal_api_url: String,

    /// Cluster join token; read from the bootstrap document when unset
    #[arg(long, env = "TOKEN", hide_env_values = true)]
    join_token: Option<String>,

    /// Bootstrap document carrying the join token
    #[arg(long, env = "BOOTSTRAP_CONFIG", default_value = DEFAULT_BOOTSTRAP_CONFIG_PATH)]
    bootstrap_config: PathBuf,

    /// Installer ISO for new machines
    #[arg(long, env = "ISO_URL", default_value = DEFAULT_ISO_URL)]
    iso_url: String,

    /// iPXE script used when machines are reinstalled
    #[arg(long, env = "IPXE_SCRIPT_URL", default_value = DEFAULT_IPXE_SCRIPT_URL)]
    ipxe_script_url: String,

    /// iPXE script used for the first boot
    #[arg(long, env = "INITIAL_IPXE_SCRIPT_URL", default_value = INITIAL_IPXE_SCRIPT_URL)]
    initial_ipxe_script_url: String,

    /// Management interface when a pool names none
    #[arg(long, env = "DEFAULT_INTERFACE", default_value = DEFAULT_INTERFACE)]
    default_interface: String,

    /// Service exposing the cluster join address
    #[arg(long, env = "INGRESS_SERVICE", default_value = DEFAULT_INGRESS_SERVICE)]
    ingress_service: String,

    /// Namespace of the ingress Service
    #[arg(long, env = "INGRESS_NAMESPACE", default_value = DEFAULT_INGRESS_NAMESPACE)]
    ingress_namespace: String,

    /// Requeue interval while machines are provisioning
    #[arg(long, env = "POLL_INTERVAL", default_value = "2m", value_parser = parse_duration)]
    poll_interval: Duration,

    /// Requeue interval while waiting for machines to join
    #[arg(long, env = "READY_CHECK_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    ready_check_interval: Duration,
}

impl From<ControllerArgs> for OperatorConfig {
    fn from(args: ControllerArgs) -> Self {
        Self {
            namespace: args.namespace,
            credential_secret: args.credential_secret,
            metal_api_url: args.metal_api_url,
            join_token: args.join_token.filter(|t| !t.is_empty()),
            bootstrap_config_path: args.bootstrap_config,
            iso_url: args.iso_url,
            ipxe_script_url: args.ipxe_script_url,
            initial_ipxe_script_url: args.initial_ipxe_script_url,
            default_interface: args.default_interface,
            ingress_service: args.ingress_service,
            ingress_namespace: args.ingress_namespace,
            poll_interval: args.poll_interval,
            ready_check_interval: args.ready_check_interval,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in [Instance::crd(), InstancePool::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(&TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::parse_from(["fleet-operator"]),
    };
    run_controller(OperatorConfig::from(args)).await
}

/// Install the fleet CRDs with server-side apply
///
/// Keeps the stored schemas in step with the running operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Instance::crd(), InstancePool::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("Fleet CRDs installed/updated");
    Ok(())
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!("Fleet controller starting...");
    config.validate()?;

    let client = create_client()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    controller_runner::run(client, config).await?;

    tracing::info!("Fleet controller shutting down");
    Ok(())
}
