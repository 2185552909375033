//! hatch-deploy - Dependency-ordered, resumable smart contract deployments.
//!
//! A [`DeploymentPlan`] lists the contracts to deploy and how their
//! constructor arguments reference each other. The [`Executor`] deploys them in
//! dependency order through a [`ChainClient`], recording every step in a
//! durable [`Ledger`] so that an interrupted run resumes where it stopped
//! instead of deploying confirmed contracts twice.

pub mod client;
pub mod config;
pub mod executor;
pub mod ledger;
pub mod orchestrator;
pub mod plan;
pub mod report;

mod fingerprint;
mod fs;

pub use client::{
    Account, AccountRef, ArtifactStore, ChainClient, ClientError, ConfirmationError,
    ContractArtifact, RpcChainClient, SubmissionError, TxId,
};
pub use config::{CONFIG_FILENAME, ConfigError, HatchConfig, NetworkConfig};
pub use executor::{ExecutionSummary, Executor, ExecutorConfig, ExecutorError};
pub use fingerprint::StepFingerprint;
pub use ledger::{FailureKind, Ledger, LedgerEntry, LedgerError, PriorAttempt, StepStatus};
pub use orchestrator::{Orchestrator, OrchestratorOptions};
pub use plan::{ArgSpec, DeploymentPlan, DeploymentStep, PlanError, StepRef};
pub use report::{DeploymentReport, Outcome, StepReport, ledger_table};
