//! Entry point of a deployment: plan, ledger and executor in one call.

use std::{path::Path, time::Duration};

use tokio::sync::watch;

use crate::{
    client::ChainClient,
    executor::{
        DEFAULT_CONFIRMATION_TIMEOUT, ExecutionSummary, Executor, ExecutorConfig, ExecutorError,
    },
    ledger::Ledger,
    plan::DeploymentPlan,
    report::{DeploymentReport, Outcome},
};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub confirmation_timeout: Duration,
    /// Deploy every step again, even the ones already confirmed.
    pub redeploy: bool,
    /// Raised (set to `true`) to stop before the next submission.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            redeploy: false,
            cancel: None,
        }
    }
}

/// Runs a deployment plan against a ledger and reports the outcome.
///
/// Every failure ends up in the returned [`DeploymentReport`]; the ledger is
/// never touched beyond the transitions the executor already persisted.
#[derive(Debug, Clone, Default)]
pub struct Orchestrator {
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(options: OrchestratorOptions) -> Self {
        Self { options }
    }

    /// Load the plan at `plan_source` and deploy it.
    ///
    /// An invalid plan is reported before the ledger is opened or the chain
    /// client is called.
    pub async fn deploy_all<C: ChainClient>(
        &self,
        plan_source: &Path,
        ledger_path: &Path,
        client: &C,
    ) -> DeploymentReport {
        let plan = match DeploymentPlan::load_from_file(plan_source) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::error!(path = %plan_source.display(), error = %err, "Invalid deployment plan");
                return DeploymentReport::invalid_plan(err);
            }
        };

        tracing::info!(order = ?plan.topological_order(), "Deployment order resolved");

        self.deploy_plan(&plan, ledger_path, client).await
    }

    /// Deploy an already validated plan.
    pub async fn deploy_plan<C: ChainClient>(
        &self,
        plan: &DeploymentPlan,
        ledger_path: &Path,
        client: &C,
    ) -> DeploymentReport {
        let mut ledger = match Ledger::load(ledger_path) {
            Ok(ledger) => ledger,
            Err(err) => {
                tracing::error!(path = %ledger_path.display(), error = %err, "Failed to open ledger");
                return DeploymentReport::unreached(
                    plan,
                    Outcome::Aborted {
                        reason: err.to_string(),
                    },
                );
            }
        };

        let mut executor = Executor::new(ExecutorConfig {
            confirmation_timeout: self.options.confirmation_timeout,
            redeploy: self.options.redeploy,
        });
        if let Some(cancel) = &self.options.cancel {
            executor = executor.with_cancel(cancel.clone());
        }

        let (outcome, summary) = match executor.run(plan, &mut ledger, client).await {
            Ok(summary) => (Outcome::Completed, summary),
            Err(ExecutorError::Cancelled { step }) => {
                (Outcome::Cancelled { step }, ExecutionSummary::default())
            }
            Err(err @ ExecutorError::Ledger(_)) => (
                Outcome::Aborted {
                    reason: err.to_string(),
                },
                ExecutionSummary::default(),
            ),
            Err(err) => (
                Outcome::StepFailed {
                    step: err.step().unwrap_or_default().to_string(),
                    error: err.to_string(),
                },
                ExecutionSummary::default(),
            ),
        };

        match &outcome {
            Outcome::Completed => tracing::info!("✓ Deployment complete!"),
            outcome => tracing::warn!(%outcome, "Deployment stopped"),
        }

        DeploymentReport::from_ledger(plan, &ledger, outcome).with_summary(summary)
    }
}
