//! Final per-step summary of a deployment run.

use std::{collections::BTreeMap, fmt};

use alloy_core::primitives::Address;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};

use crate::{
    client::TxId,
    executor::ExecutionSummary,
    ledger::{Ledger, LedgerEntry, StepStatus},
    plan::DeploymentPlan,
};

/// Exit code of a run interrupted by the user (128 + SIGINT).
pub const EXIT_CANCELLED: u8 = 130;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every step is confirmed.
    Completed,
    /// The run stopped at `step`.
    StepFailed { step: String, error: String },
    /// The plan was rejected before anything was touched.
    InvalidPlan(String),
    /// Cancellation was requested before `step` was submitted.
    Cancelled { step: String },
    /// The run could not start or stopped for a reason unrelated to a single
    /// step (ledger locked, unreadable or unwritable).
    Aborted { reason: String },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "all steps deployed"),
            Self::StepFailed { step, error } => write!(f, "step {step} failed: {error}"),
            Self::InvalidPlan(error) => write!(f, "invalid plan: {error}"),
            Self::Cancelled { step } => write!(f, "cancelled before step {step}"),
            Self::Aborted { reason } => write!(f, "aborted: {reason}"),
        }
    }
}

/// The state of one step at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: String,
    pub contract: String,
    /// `None` when the step was never reached.
    pub status: Option<StepStatus>,
    pub address: Option<Address>,
    pub tx_id: Option<TxId>,
    pub error: Option<String>,
}

impl StepReport {
    fn from_entry(step: &str, contract: &str, entry: Option<&LedgerEntry>) -> Self {
        Self {
            step: step.to_string(),
            contract: contract.to_string(),
            status: entry.map(|e| e.status),
            address: entry.and_then(|e| e.address),
            tx_id: entry.and_then(|e| e.tx_id.or(e.failed_tx)),
            error: entry.and_then(|e| e.error.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentReport {
    /// One report per step, in deployment order.
    pub steps: Vec<StepReport>,
    /// What this run did. Empty unless the run completed.
    pub summary: ExecutionSummary,
    pub outcome: Outcome,
}

impl DeploymentReport {
    /// A report for a plan that never got built.
    pub fn invalid_plan(error: impl fmt::Display) -> Self {
        Self {
            steps: Vec::new(),
            summary: ExecutionSummary::default(),
            outcome: Outcome::InvalidPlan(error.to_string()),
        }
    }

    /// Report every step of `plan` as the ledger currently records it.
    pub fn from_ledger(plan: &DeploymentPlan, ledger: &Ledger, outcome: Outcome) -> Self {
        let steps = plan
            .ordered_steps()
            .map(|step| {
                StepReport::from_entry(&step.name, step.contract_name(), ledger.status_of(&step.name))
            })
            .collect();
        Self {
            steps,
            summary: ExecutionSummary::default(),
            outcome,
        }
    }

    /// Report every step of `plan` as never reached.
    pub fn unreached(plan: &DeploymentPlan, outcome: Outcome) -> Self {
        let steps = plan
            .ordered_steps()
            .map(|step| StepReport::from_entry(&step.name, step.contract_name(), None))
            .collect();
        Self {
            steps,
            summary: ExecutionSummary::default(),
            outcome,
        }
    }

    pub fn with_summary(mut self, summary: ExecutionSummary) -> Self {
        self.summary = summary;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed
    }

    /// Process exit code: 0 on success, 1 on a failed or aborted run, 2 for an
    /// invalid plan, 130 on cancellation.
    pub fn exit_code(&self) -> u8 {
        match self.outcome {
            Outcome::Completed => 0,
            Outcome::StepFailed { .. } | Outcome::Aborted { .. } => 1,
            Outcome::InvalidPlan(_) => 2,
            Outcome::Cancelled { .. } => EXIT_CANCELLED,
        }
    }

    /// Addresses of the confirmed steps.
    pub fn addresses(&self) -> BTreeMap<&str, Address> {
        self.steps
            .iter()
            .filter(|s| s.status == Some(StepStatus::Confirmed))
            .filter_map(|s| s.address.map(|address| (s.step.as_str(), address)))
            .collect()
    }

    pub fn address_of(&self, step: &str) -> Option<Address> {
        self.steps
            .iter()
            .find(|s| s.step == step)
            .and_then(|s| s.address)
    }

    pub fn render_table(&self) -> String {
        let mut table = new_table(["Step", "Contract", "Status", "Address", "Transaction", "Error"]);
        for step in &self.steps {
            table.add_row(vec![
                step.step.clone(),
                step.contract.clone(),
                step.status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "not reached".to_string()),
                display_or_empty(step.address),
                display_or_empty(step.tx_id),
                step.error.clone().unwrap_or_default(),
            ]);
        }
        if self.summary == ExecutionSummary::default() {
            format!("{table}\n{}", self.outcome)
        } else {
            format!("{table}\n{}\n{}", self.summary, self.outcome)
        }
    }
}

/// Render ledger entries as stored, including the number of attempts.
pub fn ledger_table(entries: &[LedgerEntry]) -> String {
    let mut table = new_table(["Step", "Status", "Address", "Transaction", "Attempts", "Updated"]);
    for entry in entries {
        table.add_row(vec![
            entry.step.clone(),
            match entry.failure_kind {
                Some(kind) => format!("{} ({kind})", entry.status),
                None => entry.status.to_string(),
            },
            display_or_empty(entry.address),
            display_or_empty(entry.tx_id.or(entry.failed_tx)),
            entry.attempts.to_string(),
            entry.updated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ]);
    }
    table.to_string()
}

fn new_table<const N: usize>(header: [&str; N]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn display_or_empty<T: fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: Outcome) -> DeploymentReport {
        DeploymentReport {
            steps: vec![
                StepReport {
                    step: "Token".into(),
                    contract: "StudyTimerToken".into(),
                    status: Some(StepStatus::Confirmed),
                    address: Some(Address::repeat_byte(0xaa)),
                    tx_id: Some(TxId::repeat_byte(0x01)),
                    error: None,
                },
                StepReport {
                    step: "Badge".into(),
                    contract: "StudyBadgeNFT".into(),
                    status: Some(StepStatus::Failed),
                    address: None,
                    tx_id: None,
                    error: Some("transaction rejected: out of gas".into()),
                },
                StepReport {
                    step: "Timer".into(),
                    contract: "DecentralizedStudyTimer".into(),
                    status: None,
                    address: None,
                    tx_id: None,
                    error: None,
                },
            ],
            summary: ExecutionSummary::default(),
            outcome,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(report(Outcome::Completed).exit_code(), 0);
        assert_eq!(
            report(Outcome::StepFailed {
                step: "Badge".into(),
                error: "out of gas".into()
            })
            .exit_code(),
            1
        );
        assert_eq!(
            report(Outcome::Aborted {
                reason: "locked".into()
            })
            .exit_code(),
            1
        );
        assert_eq!(DeploymentReport::invalid_plan("cycle").exit_code(), 2);
        assert_eq!(
            report(Outcome::Cancelled {
                step: "Badge".into()
            })
            .exit_code(),
            130
        );
    }

    #[test]
    fn test_addresses_only_lists_confirmed_steps() {
        let report = report(Outcome::Completed);
        let addresses = report.addresses();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses["Token"], Address::repeat_byte(0xaa));
        assert_eq!(report.address_of("Badge"), None);
    }

    #[test]
    fn test_render_table() {
        let rendered = report(Outcome::StepFailed {
            step: "Badge".into(),
            error: "out of gas".into(),
        })
        .render_table();

        assert!(rendered.contains("StudyBadgeNFT"));
        assert!(rendered.contains("not reached"));
        assert!(rendered.contains("failed"));
        assert!(rendered.ends_with("step Badge failed: out of gas"));
    }

    #[test]
    fn test_render_table_with_summary() {
        let rendered = report(Outcome::Completed)
            .with_summary(ExecutionSummary {
                deployed: vec!["Badge".into(), "Timer".into()],
                skipped: vec!["Token".into()],
                recovered: Vec::new(),
            })
            .render_table();

        assert!(rendered.contains("deployed: Badge, Timer"));
        assert!(rendered.contains("already deployed: Token"));
        assert!(!rendered.contains("recovered:"));
        assert!(rendered.ends_with("all steps deployed"));
    }
}
