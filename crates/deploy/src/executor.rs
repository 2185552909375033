//! Deployment executor: walks a plan in dependency order and drives each step
//! through the chain client, recording every transition in the ledger.

use std::{fmt, time::Duration};

use alloy_core::primitives::Address;
use serde_json::Value;
use tokio::sync::watch;

use crate::{
    client::{ChainClient, ConfirmationError, SubmissionError, TxId},
    fingerprint::StepFingerprint,
    ledger::{FailureKind, Ledger, LedgerError},
    plan::{ArgSpec, DeploymentPlan, DeploymentStep},
};

/// Default time to wait for a deployment transaction to be mined.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("step {step} depends on {dependency}, which has no confirmed address")]
    UnresolvedDependency { step: String, dependency: String },

    #[error("step {step} could not be submitted: {source}")]
    Submission {
        step: String,
        source: SubmissionError,
    },

    #[error("step {step} was not confirmed: {source}")]
    Confirmation {
        step: String,
        source: ConfirmationError,
    },

    #[error("cancelled before step {step}")]
    Cancelled { step: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ExecutorError {
    /// The step the run stopped at, if the error is tied to one.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::UnresolvedDependency { step, .. }
            | Self::Submission { step, .. }
            | Self::Confirmation { step, .. }
            | Self::Cancelled { step } => Some(step.as_str()),
            Self::Ledger(LedgerError::InvalidTransition { step, .. }) => Some(step.as_str()),
            Self::Ledger(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub confirmation_timeout: Duration,
    /// Deploy every step again, even the ones already confirmed.
    pub redeploy: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            redeploy: false,
        }
    }
}

/// What a successful run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Steps deployed by this run.
    pub deployed: Vec<String>,
    /// Steps already confirmed by a previous run.
    pub skipped: Vec<String>,
    /// Steps whose transaction from a previous run was found on chain.
    pub recovered: Vec<String>,
}

impl fmt::Display for ExecutionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [
            ("deployed", &self.deployed),
            ("already deployed", &self.skipped),
            ("recovered", &self.recovered),
        ]
        .into_iter()
        .filter(|(_, steps)| !steps.is_empty())
        .map(|(label, steps)| format!("{label}: {}", steps.join(", ")))
        .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// How a step left the executor.
enum StepRun {
    Deployed,
    Recovered,
}

#[derive(Debug, Clone, Default)]
pub struct Executor {
    config: ExecutorConfig,
    cancel: Option<watch::Receiver<bool>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// Stop before the next submission once `cancel` holds `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Deploy every step of `plan` that the ledger does not already hold as
    /// confirmed. Stops at the first failure.
    pub async fn run<C: ChainClient>(
        &self,
        plan: &DeploymentPlan,
        ledger: &mut Ledger,
        client: &C,
    ) -> Result<ExecutionSummary, ExecutorError> {
        let mut summary = ExecutionSummary::default();

        tracing::info!(
            steps = plan.len(),
            redeploy = self.config.redeploy,
            "Starting deployment run..."
        );

        for step in plan.ordered_steps() {
            let fingerprint = StepFingerprint::from_step(step).compute_hash();

            if !self.config.redeploy
                && let Some(entry) = ledger.status_of(&step.name)
                && entry.is_confirmed()
            {
                if entry.fingerprint.as_deref().is_some_and(|f| f != fingerprint) {
                    tracing::warn!(
                        step = %step.name,
                        "Step definition changed since it was deployed, keeping the deployed contract (use --redeploy to deploy it again)"
                    );
                }
                tracing::info!(
                    step = %step.name,
                    address = ?entry.address,
                    "Step already deployed, skipping"
                );
                summary.skipped.push(step.name.clone());
                continue;
            }

            if self.is_cancelled() {
                tracing::warn!(step = %step.name, "Cancellation requested, stopping");
                return Err(ExecutorError::Cancelled {
                    step: step.name.clone(),
                });
            }

            match self.run_step(step, fingerprint, ledger, client).await? {
                StepRun::Deployed => summary.deployed.push(step.name.clone()),
                StepRun::Recovered => summary.recovered.push(step.name.clone()),
            }
        }

        tracing::info!(
            deployed = summary.deployed.len(),
            skipped = summary.skipped.len(),
            recovered = summary.recovered.len(),
            "Deployment run complete"
        );

        Ok(summary)
    }

    async fn run_step<C: ChainClient>(
        &self,
        step: &DeploymentStep,
        fingerprint: String,
        ledger: &mut Ledger,
        client: &C,
    ) -> Result<StepRun, ExecutorError> {
        let name = step.name.as_str();

        // A transaction from a previous run may still land. Never send a
        // second one before its fate is known.
        if let Some(tx) = ledger.status_of(name).and_then(|e| e.in_flight_tx()) {
            tracing::info!(step = name, tx = %tx, "Checking transaction from a previous run...");

            match client
                .await_confirmation(tx, self.config.confirmation_timeout)
                .await
            {
                Ok(address) => {
                    ledger.record_confirmed(name, address)?;
                    tracing::info!(step = name, %address, "Previous transaction confirmed");
                    return Ok(StepRun::Recovered);
                }
                Err(err) if err.is_final() => {
                    tracing::warn!(step = name, error = %err, "Previous transaction failed, deploying again");
                    ledger.record_failed(name, FailureKind::Reverted, err.to_string())?;
                }
                Err(err) => {
                    ledger.record_failed(name, FailureKind::Confirmation, err.to_string())?;
                    return Err(ExecutorError::Confirmation {
                        step: name.to_string(),
                        source: err,
                    });
                }
            }
        }

        // The re-check above may have waited a while.
        if self.is_cancelled() {
            tracing::warn!(step = name, "Cancellation requested, stopping");
            return Err(ExecutorError::Cancelled {
                step: name.to_string(),
            });
        }

        let args = resolve_args(step, ledger)?;

        ledger.record_pending(name, fingerprint)?;

        tracing::info!(
            step = name,
            contract = step.contract_name(),
            args = ?args,
            "Deploying contract..."
        );

        let tx = match client.deploy(step.contract_name(), &args).await {
            Ok(tx) => tx,
            Err(err) => {
                tracing::error!(step = name, error = %err, "Submission failed");
                match err.in_flight_tx() {
                    // Possibly accepted: keep the transaction so the next run
                    // re-checks it instead of sending another one.
                    Some(tx) => {
                        ledger.record_submitted(name, tx)?;
                        ledger.record_failed(name, FailureKind::Confirmation, err.to_string())?;
                    }
                    None => {
                        ledger.record_failed(name, FailureKind::Submission, err.to_string())?
                    }
                }
                return Err(ExecutorError::Submission {
                    step: name.to_string(),
                    source: err,
                });
            }
        };
        ledger.record_submitted(name, tx)?;

        let address = self.confirm(name, tx, ledger, client).await?;
        tracing::info!(step = name, %address, tx = %tx, "Contract deployed");
        Ok(StepRun::Deployed)
    }

    async fn confirm<C: ChainClient>(
        &self,
        step: &str,
        tx: TxId,
        ledger: &mut Ledger,
        client: &C,
    ) -> Result<Address, ExecutorError> {
        match client
            .await_confirmation(tx, self.config.confirmation_timeout)
            .await
        {
            Ok(address) => {
                ledger.record_confirmed(step, address)?;
                Ok(address)
            }
            Err(err) => {
                tracing::error!(step, tx = %tx, error = %err, "Confirmation failed");
                let kind = if err.is_final() {
                    FailureKind::Reverted
                } else {
                    FailureKind::Confirmation
                };
                ledger.record_failed(step, kind, err.to_string())?;
                Err(ExecutorError::Confirmation {
                    step: step.to_string(),
                    source: err,
                })
            }
        }
    }
}

/// Replace every step reference with the confirmed address of its target.
fn resolve_args(step: &DeploymentStep, ledger: &Ledger) -> Result<Vec<Value>, ExecutorError> {
    step.constructor_args
        .iter()
        .map(|arg| match arg {
            ArgSpec::Literal(value) => Ok(value.clone()),
            ArgSpec::StepRef(target) => ledger
                .status_of(&target.step)
                .filter(|e| e.is_confirmed())
                .and_then(|e| e.address)
                .map(|address| Value::String(address.to_checksum(None)))
                .ok_or_else(|| ExecutorError::UnresolvedDependency {
                    step: step.name.clone(),
                    dependency: target.step.clone(),
                }),
        })
        .collect()
}
