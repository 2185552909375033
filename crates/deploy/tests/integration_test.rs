//! Integration tests for hatch-deploy.
//!
//! These tests drive the orchestrator end to end against a scripted in-memory
//! chain client: plan files and ledgers live in temporary directories, every
//! call the client receives is recorded so tests can assert exactly what was
//! (and was not) sent to the chain.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use alloy_core::primitives::{Address, U256, keccak256};
use anyhow::{Context, Result};
use hatch_deploy::{
    ChainClient, ConfirmationError, DeploymentReport, FailureKind, Ledger, Orchestrator,
    OrchestratorOptions, Outcome, StepStatus, SubmissionError, TxId,
};
use serde_json::{Value, json};
use tempdir::TempDir;
use tokio::sync::watch;

const TOKEN: &str = "StudyTimerToken";
const BADGE: &str = "StudyBadgeNFT";
const TIMER: &str = "DecentralizedStudyTimer";

/// The plan of the study timer dapp: the timer takes the token and badge
/// addresses as constructor arguments.
const STUDY_TIMER_PLAN: &str = r#"
[[steps]]
name = "Token"
contract = "StudyTimerToken"

[[steps]]
name = "Badge"
contract = "StudyBadgeNFT"

[[steps]]
name = "Timer"
contract = "DecentralizedStudyTimer"
args = [{ ref = "Token" }, { ref = "Badge" }]
"#;

/// Transaction ids are unique across every client of the test binary.
static NEXT_TX: AtomicU64 = AtomicU64::new(1);

fn next_tx() -> TxId {
    TxId::from(U256::from(NEXT_TX.fetch_add(1, Ordering::SeqCst)))
}

/// What happens to the next deployment of a contract.
#[derive(Debug, Clone)]
enum Script {
    /// Accepted and mined at the given address.
    Deploy(Address),
    /// Accepted and mined at the given address, but the node's answer to the
    /// send was lost.
    Unacknowledged(Address),
    /// Refused at submission.
    Reject(SubmissionError),
    /// Accepted but never confirmed within the timeout.
    Timeout,
    /// Accepted, mined and reverted.
    Revert,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Deploy { contract: String, args: Vec<Value> },
    Confirm(TxId),
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<String, VecDeque<Script>>,
    /// Fate of each transaction, including ones sent by an earlier client.
    receipts: HashMap<TxId, Script>,
    calls: Vec<Call>,
}

/// In-memory [`ChainClient`] following a per-contract script.
///
/// A contract without a script left is deployed at an address derived from
/// its name.
#[derive(Debug, Default)]
struct ScriptedClient {
    state: Mutex<State>,
}

impl ScriptedClient {
    fn new() -> Self {
        Self::default()
    }

    fn script(self, contract: &str, script: Script) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(contract.to_string())
            .or_default()
            .push_back(script);
        self
    }

    /// Decide the fate of a transaction sent before this client existed.
    fn receipt(self, tx: TxId, script: Script) -> Self {
        self.state.lock().unwrap().receipts.insert(tx, script);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Constructor arguments of the first deployment of `contract`.
    fn deploy_args(&self, contract: &str) -> Option<Vec<Value>> {
        self.calls().into_iter().find_map(|call| match call {
            Call::Deploy { contract: c, args } if c == contract => Some(args),
            _ => None,
        })
    }

    fn deployed_contracts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Deploy { contract, .. } => Some(contract),
                Call::Confirm(_) => None,
            })
            .collect()
    }
}

impl ChainClient for ScriptedClient {
    async fn deploy(&self, contract: &str, args: &[Value]) -> Result<TxId, SubmissionError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Deploy {
            contract: contract.to_string(),
            args: args.to_vec(),
        });

        let script = state
            .scripts
            .get_mut(contract)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Script::Deploy(default_address(contract)));

        let script = match script {
            Script::Reject(err) => return Err(err),
            accepted => accepted,
        };

        let tx = next_tx();
        match script {
            Script::Unacknowledged(address) => {
                state.receipts.insert(tx, Script::Deploy(address));
                Err(SubmissionError::Unknown {
                    tx,
                    message: "eth_sendRawTransaction request failed: operation timed out".into(),
                })
            }
            accepted => {
                state.receipts.insert(tx, accepted);
                Ok(tx)
            }
        }
    }

    async fn await_confirmation(
        &self,
        tx: TxId,
        timeout: Duration,
    ) -> Result<Address, ConfirmationError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Confirm(tx));

        match state.receipts.get(&tx) {
            Some(Script::Deploy(address) | Script::Unacknowledged(address)) => Ok(*address),
            Some(Script::Revert) => Err(ConfirmationError::Reverted { tx }),
            Some(Script::Timeout) | None => Err(ConfirmationError::Timeout { tx, timeout }),
            Some(Script::Reject(err)) => Err(ConfirmationError::Transport(err.to_string())),
        }
    }
}

fn default_address(contract: &str) -> Address {
    Address::from_word(keccak256(contract))
}

fn token_address() -> Address {
    Address::repeat_byte(0xaa)
}

fn badge_address() -> Address {
    Address::repeat_byte(0xbb)
}

fn timer_address() -> Address {
    Address::repeat_byte(0xcc)
}

/// The study timer client where every deployment succeeds.
fn study_timer_client() -> ScriptedClient {
    ScriptedClient::new()
        .script(TOKEN, Script::Deploy(token_address()))
        .script(BADGE, Script::Deploy(badge_address()))
        .script(TIMER, Script::Deploy(timer_address()))
}

/// Test setup context: a temporary directory holding the plan and the ledger.
struct TestContext {
    _temp_dir: TempDir,
    plan_path: PathBuf,
    ledger_path: PathBuf,
}

impl TestContext {
    fn new(plan: &str) -> Result<Self> {
        let temp_dir = TempDir::new("hatch-it").context("Failed to create temp dir")?;
        let plan_path = temp_dir.path().join("deploy.toml");
        std::fs::write(&plan_path, plan).context("Failed to write plan")?;
        let ledger_path = temp_dir.path().join("state").join("ledger.json");

        Ok(Self {
            _temp_dir: temp_dir,
            plan_path,
            ledger_path,
        })
    }

    async fn deploy(&self, client: &ScriptedClient) -> DeploymentReport {
        self.deploy_with(OrchestratorOptions::default(), client).await
    }

    async fn deploy_with(
        &self,
        options: OrchestratorOptions,
        client: &ScriptedClient,
    ) -> DeploymentReport {
        Orchestrator::new(options)
            .deploy_all(&self.plan_path, &self.ledger_path, client)
            .await
    }

    fn ledger(&self) -> Result<Ledger> {
        Ledger::load(&self.ledger_path).context("Failed to load ledger")
    }

    fn status(&self, step: &str) -> Result<Option<StepStatus>> {
        Ok(self.ledger()?.status_of(step).map(|e| e.status))
    }
}

/// Initialize tracing for tests (idempotent).
fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

fn checksummed(address: Address) -> Value {
    json!(address.to_checksum(None))
}

#[tokio::test]
async fn test_first_run_deploys_in_dependency_order() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;
    let client = study_timer_client();

    let report = ctx.deploy(&client).await;

    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(client.deployed_contracts(), vec![TOKEN, BADGE, TIMER]);
    assert_eq!(report.address_of("Token"), Some(token_address()));
    assert_eq!(report.address_of("Badge"), Some(badge_address()));
    assert_eq!(report.address_of("Timer"), Some(timer_address()));

    let timer_args = client.deploy_args(TIMER).context("Timer was never deployed")?;
    assert_eq!(
        timer_args,
        vec![checksummed(token_address()), checksummed(badge_address())]
    );
    assert_eq!(report.summary.deployed, vec!["Token", "Badge", "Timer"]);

    let ledger = ctx.ledger()?;
    assert!(["Token", "Badge", "Timer"].iter().all(|step| ledger.is_done(step)));
    Ok(())
}

#[tokio::test]
async fn test_rerun_after_success_sends_nothing() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;
    let first = ctx.deploy(&study_timer_client()).await;
    assert!(first.is_success());

    let client = ScriptedClient::new();
    let second = ctx.deploy(&client).await;

    assert!(second.is_success());
    assert!(client.calls().is_empty());
    assert_eq!(second.addresses(), first.addresses());
    Ok(())
}

#[tokio::test]
async fn test_resume_after_partial_run() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;

    // A previous run confirmed Token and stopped before submitting Badge.
    {
        let mut ledger = ctx.ledger()?;
        ledger.record_pending("Token", "previous".into())?;
        ledger.record_submitted("Token", next_tx())?;
        ledger.record_confirmed("Token", token_address())?;
        ledger.record_pending("Badge", "previous".into())?;
    }

    let client = study_timer_client();
    let report = ctx.deploy(&client).await;

    assert!(report.is_success());
    assert_eq!(client.deployed_contracts(), vec![BADGE, TIMER]);
    assert_eq!(report.address_of("Token"), Some(token_address()));
    assert_eq!(report.summary.skipped, vec!["Token"]);

    // Token was not deployed by this run: its address comes from the ledger.
    let timer_args = client.deploy_args(TIMER).context("Timer was never deployed")?;
    assert_eq!(timer_args[0], checksummed(token_address()));
    assert_eq!(timer_args[1], checksummed(badge_address()));
    Ok(())
}

#[tokio::test]
async fn test_submission_failure_stops_before_dependents() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;
    let client = ScriptedClient::new()
        .script(TOKEN, Script::Deploy(token_address()))
        .script(
            BADGE,
            Script::Reject(SubmissionError::Rejected("out of gas".into())),
        );

    let report = ctx.deploy(&client).await;

    assert_eq!(report.exit_code(), 1);
    assert!(matches!(report.outcome, Outcome::StepFailed { ref step, .. } if step == "Badge"));
    assert_eq!(client.deployed_contracts(), vec![TOKEN, BADGE]);

    let badge = &report.steps[1];
    assert_eq!(badge.status, Some(StepStatus::Failed));
    assert!(badge.error.as_deref().is_some_and(|e| e.contains("out of gas")));
    assert_eq!(report.steps[2].status, None);

    assert_eq!(ctx.status("Token")?, Some(StepStatus::Confirmed));
    assert_eq!(ctx.status("Timer")?, None);
    Ok(())
}

#[tokio::test]
async fn test_retry_after_failure_keeps_history() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;
    let failing = ScriptedClient::new().script(
        BADGE,
        Script::Reject(SubmissionError::Transport("connection reset".into())),
    );
    assert_eq!(ctx.deploy(&failing).await.exit_code(), 1);

    let client = study_timer_client();
    let report = ctx.deploy(&client).await;

    assert!(report.is_success());
    assert_eq!(client.deployed_contracts(), vec![BADGE, TIMER]);

    let ledger = ctx.ledger()?;
    let badge = ledger.status_of("Badge").context("Badge not in ledger")?;
    assert_eq!(badge.status, StepStatus::Confirmed);
    assert_eq!(badge.attempts, 2);
    assert_eq!(badge.history.len(), 1);
    assert_eq!(badge.history[0].status, StepStatus::Failed);
    assert_eq!(badge.history[0].failure_kind, Some(FailureKind::Submission));
    Ok(())
}

#[tokio::test]
async fn test_submitted_step_is_recovered_without_resubmission() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;

    // The previous run stopped between submission and confirmation.
    let in_flight = next_tx();
    {
        let mut ledger = ctx.ledger()?;
        ledger.record_pending("Token", "previous".into())?;
        ledger.record_submitted("Token", in_flight)?;
    }

    let client = study_timer_client().receipt(in_flight, Script::Deploy(token_address()));
    let report = ctx.deploy(&client).await;

    assert!(report.is_success());
    assert_eq!(client.calls()[0], Call::Confirm(in_flight));
    assert_eq!(client.deployed_contracts(), vec![BADGE, TIMER]);
    assert_eq!(report.address_of("Token"), Some(token_address()));
    assert_eq!(report.steps[0].tx_id, Some(in_flight));
    assert_eq!(report.summary.recovered, vec!["Token"]);
    Ok(())
}

#[tokio::test]
async fn test_timed_out_transaction_that_lands_later_is_not_resubmitted() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;
    let slow = ScriptedClient::new()
        .script(TOKEN, Script::Deploy(token_address()))
        .script(BADGE, Script::Timeout);

    let report = ctx.deploy(&slow).await;
    assert_eq!(report.exit_code(), 1);

    let badge_tx = {
        let ledger = ctx.ledger()?;
        let badge = ledger.status_of("Badge").context("Badge not in ledger")?;
        assert_eq!(badge.status, StepStatus::Failed);
        assert_eq!(badge.failure_kind, Some(FailureKind::Confirmation));
        badge.in_flight_tx().context("Badge tx was not kept")?
    };

    // The transaction has been mined since.
    let client = study_timer_client().receipt(badge_tx, Script::Deploy(badge_address()));
    let report = ctx.deploy(&client).await;

    assert!(report.is_success());
    assert_eq!(client.deployed_contracts(), vec![TIMER]);
    assert_eq!(report.address_of("Badge"), Some(badge_address()));

    let ledger = ctx.ledger()?;
    let badge = ledger.status_of("Badge").context("Badge not in ledger")?;
    assert_eq!(badge.attempts, 1);
    assert_eq!(badge.tx_id, Some(badge_tx));
    assert!(badge.error.is_none());
    Ok(())
}

#[tokio::test]
async fn test_unacknowledged_send_is_rechecked_not_resent() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;
    let lost_answer = ScriptedClient::new()
        .script(TOKEN, Script::Deploy(token_address()))
        .script(BADGE, Script::Unacknowledged(badge_address()));

    let report = ctx.deploy(&lost_answer).await;
    assert_eq!(report.exit_code(), 1);
    assert!(matches!(report.outcome, Outcome::StepFailed { ref step, .. } if step == "Badge"));

    let badge_tx = {
        let ledger = ctx.ledger()?;
        let badge = ledger.status_of("Badge").context("Badge not in ledger")?;
        assert_eq!(badge.status, StepStatus::Failed);
        assert_eq!(badge.failure_kind, Some(FailureKind::Confirmation));
        badge.in_flight_tx().context("Badge tx was not kept")?
    };

    // The transaction reached the chain: the rerun finds it instead of
    // deploying Badge a second time.
    let client = study_timer_client().receipt(badge_tx, Script::Deploy(badge_address()));
    let report = ctx.deploy(&client).await;

    assert!(report.is_success());
    assert_eq!(client.calls()[0], Call::Confirm(badge_tx));
    assert_eq!(client.deployed_contracts(), vec![TIMER]);
    assert_eq!(report.address_of("Badge"), Some(badge_address()));
    assert_eq!(report.summary.recovered, vec!["Badge"]);
    Ok(())
}

#[tokio::test]
async fn test_still_pending_transaction_stops_the_run() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;
    let slow = ScriptedClient::new().script(TOKEN, Script::Timeout);
    assert_eq!(ctx.deploy(&slow).await.exit_code(), 1);

    // Still not mined: the rerun waits again and never sends a second transaction.
    let client = ScriptedClient::new();
    let report = ctx.deploy(&client).await;

    assert_eq!(report.exit_code(), 1);
    assert!(client.deployed_contracts().is_empty());
    assert_eq!(client.calls().len(), 1);
    assert_eq!(ctx.status("Token")?, Some(StepStatus::Failed));
    Ok(())
}

#[tokio::test]
async fn test_reverted_transaction_is_resubmitted() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;

    let reverted = next_tx();
    {
        let mut ledger = ctx.ledger()?;
        ledger.record_pending("Token", "previous".into())?;
        ledger.record_submitted("Token", reverted)?;
    }

    let client = study_timer_client().receipt(reverted, Script::Revert);
    let report = ctx.deploy(&client).await;

    assert!(report.is_success());
    assert_eq!(client.deployed_contracts(), vec![TOKEN, BADGE, TIMER]);

    let ledger = ctx.ledger()?;
    let token = ledger.status_of("Token").context("Token not in ledger")?;
    assert_eq!(token.address, Some(token_address()));
    assert_eq!(token.history.len(), 1);
    assert_eq!(token.history[0].failure_kind, Some(FailureKind::Reverted));
    assert_eq!(token.history[0].tx_id, Some(reverted));
    Ok(())
}

#[tokio::test]
async fn test_reverted_deployment_fails_the_step() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;
    let client = ScriptedClient::new().script(TOKEN, Script::Revert);

    let report = ctx.deploy(&client).await;

    assert_eq!(report.exit_code(), 1);
    let ledger = ctx.ledger()?;
    let token = ledger.status_of("Token").context("Token not in ledger")?;
    assert_eq!(token.failure_kind, Some(FailureKind::Reverted));
    // Nothing left to wait for: the next run deploys again.
    assert!(token.in_flight_tx().is_none());
    Ok(())
}

#[tokio::test]
async fn test_cancellation_before_submission() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;
    let (cancel_tx, cancel_rx) = watch::channel(false);
    cancel_tx.send(true)?;

    let client = study_timer_client();
    let report = ctx
        .deploy_with(
            OrchestratorOptions {
                cancel: Some(cancel_rx),
                ..Default::default()
            },
            &client,
        )
        .await;

    assert_eq!(report.exit_code(), 130);
    assert!(matches!(report.outcome, Outcome::Cancelled { ref step } if step == "Token"));
    assert!(client.calls().is_empty());
    assert!(ctx.ledger()?.entries().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cyclic_plan_is_rejected_before_any_activity() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(
        r#"
        [[steps]]
        name = "A"
        args = [{ ref = "B" }]

        [[steps]]
        name = "B"
        args = [{ ref = "A" }]
        "#,
    )?;
    let client = ScriptedClient::new();

    let report = ctx.deploy(&client).await;

    assert_eq!(report.exit_code(), 2);
    assert!(matches!(report.outcome, Outcome::InvalidPlan(ref e) if e.contains("cyclic")));
    assert!(report.steps.is_empty());
    assert!(client.calls().is_empty());
    assert!(!ctx.ledger_path.exists());
    assert!(ctx.ledger_path.parent().is_some_and(|dir| !dir.exists()));
    Ok(())
}

#[tokio::test]
async fn test_locked_ledger_aborts() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;
    let _held = ctx.ledger()?;

    let client = study_timer_client();
    let report = ctx.deploy(&client).await;

    assert!(matches!(report.outcome, Outcome::Aborted { .. }));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.steps.len(), 3);
    assert!(report.steps.iter().all(|s| s.status.is_none()));
    assert!(client.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_redeploy_replaces_confirmed_contracts() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(STUDY_TIMER_PLAN)?;
    assert!(ctx.deploy(&study_timer_client()).await.is_success());

    let new_token = Address::repeat_byte(0x11);
    let client = ScriptedClient::new().script(TOKEN, Script::Deploy(new_token));
    let report = ctx
        .deploy_with(
            OrchestratorOptions {
                redeploy: true,
                ..Default::default()
            },
            &client,
        )
        .await;

    assert!(report.is_success());
    assert_eq!(client.deployed_contracts(), vec![TOKEN, BADGE, TIMER]);
    assert_eq!(report.address_of("Token"), Some(new_token));

    let timer_args = client.deploy_args(TIMER).context("Timer was never deployed")?;
    assert_eq!(timer_args[0], checksummed(new_token));

    let ledger = ctx.ledger()?;
    let token = ledger.status_of("Token").context("Token not in ledger")?;
    assert_eq!(token.history.len(), 1);
    assert_eq!(token.history[0].address, Some(token_address()));
    Ok(())
}

#[tokio::test]
async fn test_literal_arguments_pass_through() -> Result<()> {
    init_test_tracing();
    let ctx = TestContext::new(
        r#"
        [[steps]]
        name = "Vesting"
        args = [3600, "study", true]
        "#,
    )?;
    let client = ScriptedClient::new();

    let report = ctx.deploy(&client).await;

    assert!(report.is_success());
    assert_eq!(
        client.calls()[0],
        Call::Deploy {
            contract: "Vesting".into(),
            args: vec![json!(3600), json!("study"), json!(true)],
        }
    );
    Ok(())
}
