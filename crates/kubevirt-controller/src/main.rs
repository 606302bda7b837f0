//! virt-controller - live migration reconciliation for KubeVirt

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::Client;

use kubevirt_common::config::VirtComponent;
use kubevirt_common::telemetry::{init_telemetry, LogHandle, TelemetryConfig};
use kubevirt_common::DEFAULT_KUBEVIRT_NAMESPACE;
use kubevirt_controller::controller_runner::{build_migration_controller, RunnerConfig};
use kubevirt_controller::crds::{ensure_crds_installed, render_yaml};
use kubevirt_migration::gc::DEFAULT_FINALIZED_BUFFER;
use kubevirt_migration::renderer::DEFAULT_LAUNCHER_IMAGE;

/// virt-controller - drives VirtualMachineInstanceMigration objects to completion
#[derive(Parser, Debug)]
#[command(name = "virt-controller", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Clone)]
struct ControllerArgs {
    /// Namespace of the KubeVirt install object
    #[arg(long, env = "KUBEVIRT_NAMESPACE", default_value = DEFAULT_KUBEVIRT_NAMESPACE, global = true)]
    kubevirt_namespace: String,

    /// Requeue interval for migrations without pending work
    #[arg(long, default_value_t = 30, global = true)]
    resync_seconds: u64,

    /// Interval of the finalized migration sweep
    #[arg(long, default_value_t = 60, global = true)]
    gc_interval_seconds: u64,

    /// Finalized migrations kept per cluster
    #[arg(long, default_value_t = DEFAULT_FINALIZED_BUFFER, global = true)]
    finalized_buffer: usize,

    /// Install the owned CRDs before starting
    #[arg(long, global = true)]
    install_crds: bool,

    /// virt-launcher image used for target pods
    #[arg(long, env = "LAUNCHER_IMAGE", default_value = DEFAULT_LAUNCHER_IMAGE, global = true)]
    launcher_image: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the migration controller (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", render_yaml()?);
        return Ok(());
    }

    let install_crds = cli.controller.install_crds;
    let config = runner_config(cli.controller);
    let telemetry = TelemetryConfig::for_component(config.component);
    let default_verbosity = telemetry.verbosity;
    let logs = init_telemetry(telemetry).unwrap_or_else(|e| {
        eprintln!("Failed to initialize telemetry: {e}");
        LogHandle::fixed(default_verbosity)
    });

    match cli.command {
        Some(Commands::Controller) | None => run_controller(config, install_crds, logs).await,
    }
}

fn runner_config(args: ControllerArgs) -> RunnerConfig {
    RunnerConfig {
        component: VirtComponent::VirtController,
        kubevirt_namespace: args.kubevirt_namespace,
        resync_interval: Duration::from_secs(args.resync_seconds),
        gc_interval: Duration::from_secs(args.gc_interval_seconds),
        finalized_buffer: args.finalized_buffer,
        launcher_image: args.launcher_image,
    }
}

async fn run_controller(
    config: RunnerConfig,
    install_crds: bool,
    logs: LogHandle,
) -> anyhow::Result<()> {
    tracing::info!(
        namespace = %config.kubevirt_namespace,
        service = config.component.as_str(),
        "Starting virt-controller migration reconciler"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    if install_crds {
        ensure_crds_installed(&client).await?;
    }

    tracing::info!("Starting controllers:");
    let tasks = build_migration_controller(client, config, logs);

    // The controller task ends on shutdown signal; every other task runs forever
    let _ = futures::future::select_all(tasks).await;

    tracing::info!("virt-controller shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_apply_without_subcommand() {
        let cli = Cli::try_parse_from(["virt-controller"]).unwrap();
        assert!(!cli.crd);
        assert!(cli.command.is_none());
        assert_eq!(cli.controller.resync_seconds, 30);
        assert_eq!(cli.controller.finalized_buffer, DEFAULT_FINALIZED_BUFFER);
        assert!(!cli.controller.install_crds);
    }

    #[test]
    fn runner_runs_as_virt_controller() {
        let cli = Cli::try_parse_from(["virt-controller", "--resync-seconds", "5"]).unwrap();
        let config = runner_config(cli.controller);
        assert_eq!(config.component, VirtComponent::VirtController);
        assert_eq!(
            TelemetryConfig::for_component(config.component).service_name,
            "virt-controller"
        );
        assert_eq!(config.resync_interval, Duration::from_secs(5));
    }

    #[test]
    fn flags_are_accepted_after_subcommand() {
        let cli = Cli::try_parse_from([
            "virt-controller",
            "controller",
            "--finalized-buffer",
            "2",
            "--install-crds",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Controller)));
        assert_eq!(cli.controller.finalized_buffer, 2);
        assert!(cli.controller.install_crds);
    }
}
