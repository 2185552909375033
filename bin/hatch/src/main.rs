//! hatch is a CLI tool to deploy a set of interdependent smart contracts, resuming
//! where the previous run stopped.

mod cli;

use std::{collections::BTreeMap, path::Path, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use cli::{Cli, Commands, DeployArgs, LedgerArgs, OutputFormat};
use hatch_deploy::{
    ArtifactStore, DeploymentPlan, DeploymentReport, HatchConfig, Ledger, Orchestrator,
    OrchestratorOptions, RpcChainClient, ledger_table,
};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match cli.command {
        Commands::Deploy(args) => deploy(args).await,
        Commands::Plan { plan } => Ok(print_plan(&plan)),
        Commands::Status { target, format } => status(&target, format),
    }
}

async fn deploy(args: DeployArgs) -> Result<ExitCode> {
    // Validate the plan before touching the configuration, the ledger or the network.
    let plan = match DeploymentPlan::load_from_file(&args.plan) {
        Ok(plan) => plan,
        Err(err) => {
            let report = DeploymentReport::invalid_plan(err);
            eprintln!("{}", report.outcome);
            return Ok(ExitCode::from(report.exit_code()));
        }
    };

    let config = HatchConfig::load(&args.target.config).context(format!(
        "Failed to load configuration from {}",
        args.target.config.display()
    ))?;
    let (network_name, network) = config.network(args.target.network.as_deref())?;
    let ledger_path = args.target.ledger_path(network_name);
    let artifacts = ArtifactStore::new(args.artifacts.clone().unwrap_or(config.artifacts.clone()));

    tracing::info!(
        plan = %args.plan.display(),
        network = network_name,
        ledger = %ledger_path.display(),
        artifacts = %artifacts.root().display(),
        order = ?plan.topological_order(),
        "Preparing deployment..."
    );

    let client = RpcChainClient::connect(network, artifacts)
        .await
        .context(format!("Failed to connect to network {network_name}"))?;

    let options = OrchestratorOptions {
        confirmation_timeout: args
            .confirmation_timeout
            .map(Duration::from_secs)
            .unwrap_or(network.confirmation_timeout()),
        redeploy: args.redeploy,
        cancel: Some(spawn_ctrl_c_handler()),
    };

    let report = Orchestrator::new(options)
        .deploy_plan(&plan, &ledger_path, &client)
        .await;

    match args.format {
        OutputFormat::Table => println!("{}", report.render_table()),
        OutputFormat::Json => println!("{}", addresses_json(&report)?),
    }

    Ok(ExitCode::from(report.exit_code()))
}

/// Raise the cancellation signal on the first Ctrl+C, exit on the second.
///
/// The executor only checks the signal before submitting a transaction, so a
/// long confirmation wait is only interrupted by the second Ctrl+C. The ledger
/// is durable at that point: the next run picks up the pending transaction.
fn spawn_ctrl_c_handler() -> watch::Receiver<bool> {
    let (cancel_tx, cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("Ctrl+C received, stopping before the next deployment (press again to exit now)");
        let _ = cancel_tx.send(true);

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Exiting immediately");
            std::process::exit(i32::from(hatch_deploy::report::EXIT_CANCELLED));
        }
    });

    cancel_rx
}

fn addresses_json(report: &DeploymentReport) -> Result<String> {
    let addresses: BTreeMap<&str, String> = report
        .addresses()
        .into_iter()
        .map(|(step, address)| (step, address.to_checksum(None)))
        .collect();
    serde_json::to_string_pretty(&addresses).context("Failed to serialize addresses")
}

fn print_plan(path: &Path) -> ExitCode {
    match DeploymentPlan::load_from_file(path) {
        Ok(plan) => {
            println!("Deployment order ({} steps):", plan.len());
            for (i, step) in plan.ordered_steps().enumerate() {
                let depends_on = step.depends_on();
                if depends_on.is_empty() {
                    println!("  {}. {} ({})", i + 1, step.name, step.contract_name());
                } else {
                    println!(
                        "  {}. {} ({}) <- {}",
                        i + 1,
                        step.name,
                        step.contract_name(),
                        depends_on.join(", ")
                    );
                }
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            let report = DeploymentReport::invalid_plan(err);
            eprintln!("{}", report.outcome);
            ExitCode::from(report.exit_code())
        }
    }
}

fn status(target: &LedgerArgs, format: OutputFormat) -> Result<ExitCode> {
    let ledger_path = match &target.ledger {
        Some(path) => path.clone(),
        None => {
            let config = HatchConfig::load(&target.config).context(format!(
                "Failed to load configuration from {}",
                target.config.display()
            ))?;
            let (network_name, _) = config.network(target.network.as_deref())?;
            target.ledger_path(network_name)
        }
    };

    let entries = Ledger::read_snapshot(&ledger_path)
        .context(format!("Failed to read ledger {}", ledger_path.display()))?;

    if entries.is_empty() {
        tracing::info!(path = %ledger_path.display(), "Ledger is empty, nothing deployed yet");
    }

    match format {
        OutputFormat::Table => println!("{}", ledger_table(&entries)),
        OutputFormat::Json => {
            let addresses: BTreeMap<&str, String> = entries
                .iter()
                .filter(|e| e.is_confirmed())
                .filter_map(|e| e.address.map(|a| (e.step.as_str(), a.to_checksum(None))))
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&addresses).context("Failed to serialize addresses")?
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}
