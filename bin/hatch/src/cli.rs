use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use hatch_deploy::CONFIG_FILENAME;
use tracing::level_filters::LevelFilter;

/// Directory holding one ledger per network when no ledger path is given.
pub const DEFAULT_LEDGER_DIR: &str = "deployments";

/// The default plan file.
pub const DEFAULT_PLAN_FILE: &str = "deploy.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum OutputFormat {
    /// Human readable table.
    #[default]
    Table,
    /// JSON object mapping step names to addresses.
    Json,
}

#[derive(Parser)]
#[command(name = "hatch")]
#[command(
    author,
    version,
    about = "Deploy smart contracts in dependency order, resuming where the last run stopped"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "HATCH_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy every step of a plan that is not deployed yet.
    Deploy(DeployArgs),

    /// Validate a plan and print its deployment order.
    Plan {
        /// The deployment plan.
        #[arg(short, long, env = "HATCH_PLAN", default_value = DEFAULT_PLAN_FILE)]
        plan: PathBuf,
    },

    /// Print the content of a deployment ledger.
    Status {
        #[command(flatten)]
        target: LedgerArgs,

        /// Output format.
        #[arg(long, env = "HATCH_FORMAT", default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

/// Which network, and which ledger, a command works on.
#[derive(Debug, Clone, Args)]
pub struct LedgerArgs {
    /// The network to deploy to, as named in the configuration file.
    ///
    /// If not provided, the configured `default_network` is used.
    #[arg(short, long, env = "HATCH_NETWORK")]
    pub network: Option<String>,

    /// Path to the configuration file (or a directory containing `hatch.toml`).
    #[arg(long, alias = "conf", env = "HATCH_CONFIG", default_value = CONFIG_FILENAME)]
    pub config: PathBuf,

    /// Path to the deployment ledger.
    ///
    /// If not provided, the ledger is stored at: ./deployments/<network>.json
    #[arg(long, env = "HATCH_LEDGER")]
    pub ledger: Option<PathBuf>,
}

impl LedgerArgs {
    pub fn ledger_path(&self, network: &str) -> PathBuf {
        self.ledger
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_DIR).join(format!("{network}.json")))
    }
}

#[derive(Debug, Clone, Args)]
pub struct DeployArgs {
    /// The deployment plan.
    #[arg(short, long, env = "HATCH_PLAN", default_value = DEFAULT_PLAN_FILE)]
    pub plan: PathBuf,

    #[command(flatten)]
    pub target: LedgerArgs,

    /// Root of the compiled contract artifacts. Overrides the configuration file.
    #[arg(long, env = "HATCH_ARTIFACTS")]
    pub artifacts: Option<PathBuf>,

    /// Seconds to wait for each deployment to be mined. Overrides the network configuration.
    #[arg(long, env = "HATCH_CONFIRMATION_TIMEOUT")]
    pub confirmation_timeout: Option<u64>,

    /// Redeploy all contracts.
    /// If not provided, the steps already confirmed in the ledger are skipped.
    #[arg(long, env = "HATCH_REDEPLOY", default_value_t = false)]
    pub redeploy: bool,

    /// Output format of the final summary.
    #[arg(long, env = "HATCH_FORMAT", default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}
