//! Deployment ledger: the durable record of which steps have been deployed.
//!
//! The ledger is a pretty-printed JSON file with one entry per step. Every
//! mutation is persisted before the mutating call returns, and a [`Ledger`]
//! holds an exclusive lock on `<path>.lock` for as long as it is alive, so two
//! runs never write the same ledger.

use std::path::{Path, PathBuf};

use alloy_core::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    client::TxId,
    fs::{FsHandler, LockFile},
};

/// Current on-disk format version.
pub const LEDGER_VERSION: u32 = 1;

/// Errors raised by the [`Ledger`].
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger {} is locked by another run", .path.display())]
    Locked { path: PathBuf },

    #[error("ledger I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger {} is corrupted: {message}", .path.display())]
    Corrupted { path: PathBuf, message: String },

    #[error("ledger {} has unsupported version {version}", .path.display())]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("step `{step}` cannot move from {} to {to}", .from.map(|s| s.to_string()).unwrap_or_else(|| "absent".to_string()))]
    InvalidTransition {
        step: String,
        from: Option<StepStatus>,
        to: StepStatus,
    },
}

/// Lifecycle of a step in the ledger.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

/// Why a step failed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FailureKind {
    /// The chain client refused the transaction. Nothing reached the chain.
    Submission,
    /// The transaction was accepted but not confirmed in time. It may still land.
    Confirmation,
    /// The transaction landed and failed.
    Reverted,
}

/// A finished attempt that was superseded by a later one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorAttempt {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<TxId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// The current state of one step.
///
/// `address` is present iff the step is confirmed, `tx_id` iff it is submitted
/// or confirmed, `error` and `failure_kind` iff it failed. A failed entry keeps
/// the transaction of the failed attempt in `failed_tx`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub step: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<TxId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_tx: Option<TxId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Number of attempts started for this step.
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<PriorAttempt>,
}

impl LedgerEntry {
    fn new(step: &str) -> Self {
        Self {
            step: step.to_string(),
            status: StepStatus::Pending,
            address: None,
            tx_id: None,
            error: None,
            failure_kind: None,
            failed_tx: None,
            fingerprint: None,
            attempts: 0,
            updated_at: Utc::now(),
            history: Vec::new(),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == StepStatus::Confirmed
    }

    /// A transaction that was sent but whose fate is unknown: either the run
    /// stopped while it was pending, or confirmation timed out.
    pub fn in_flight_tx(&self) -> Option<TxId> {
        match (self.status, self.failure_kind) {
            (StepStatus::Submitted, _) => self.tx_id,
            (StepStatus::Failed, Some(FailureKind::Confirmation)) => self.failed_tx,
            _ => None,
        }
    }

    /// Move the finished attempt into the history and clear the current state.
    fn archive(&mut self) {
        self.history.push(PriorAttempt {
            status: self.status,
            tx_id: self.tx_id.take().or(self.failed_tx.take()),
            address: self.address.take(),
            failure_kind: self.failure_kind.take(),
            error: self.error.take(),
            finished_at: self.updated_at,
        });
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    #[serde(default)]
    entries: Vec<LedgerEntry>,
}

/// Exclusive, durable handle on a ledger file.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: Vec<LedgerEntry>,
    lock: LockFile,
}

impl Ledger {
    /// Lock the ledger at `path` and read its entries.
    ///
    /// A missing file is a first run and yields an empty ledger. The file is
    /// only created by the first recorded transition.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let io_err = |source: std::io::Error| LedgerError::Io {
            path: path.clone(),
            source,
        };

        FsHandler::create_parent_dir(&path).map_err(io_err)?;

        let lock_path = FsHandler::sibling(&path, ".lock");
        let lock = FsHandler::try_lock_exclusive(&lock_path)
            .map_err(io_err)?
            .ok_or_else(|| LedgerError::Locked { path: path.clone() })?;

        let entries = Self::read_snapshot(&path)?;

        tracing::info!(
            path = %path.display(),
            entries = entries.len(),
            confirmed = entries.iter().filter(|e| e.is_confirmed()).count(),
            "Ledger loaded"
        );

        Ok(Self {
            path,
            entries,
            lock,
        })
    }

    /// Read the entries of a ledger file without locking it.
    pub fn read_snapshot(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(path).map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let file: LedgerFile =
            serde_json::from_str(&content).map_err(|e| LedgerError::Corrupted {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        if file.version != LEDGER_VERSION {
            return Err(LedgerError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: file.version,
            });
        }

        Ok(file.entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn status_of(&self, step: &str) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.step == step)
    }

    pub fn is_done(&self, step: &str) -> bool {
        self.status_of(step).is_some_and(LedgerEntry::is_confirmed)
    }

    /// Start a new attempt for `step`.
    ///
    /// Creates the entry on first visit. A failed or confirmed entry keeps its
    /// previous attempt in `history`.
    pub fn record_pending(&mut self, step: &str, fingerprint: String) -> Result<(), LedgerError> {
        let mut entry = self
            .status_of(step)
            .cloned()
            .unwrap_or_else(|| LedgerEntry::new(step));

        match entry.status {
            StepStatus::Pending if entry.attempts > 0 => {}
            StepStatus::Pending => entry.attempts = 1,
            StepStatus::Failed | StepStatus::Confirmed => {
                entry.archive();
                entry.attempts += 1;
            }
            StepStatus::Submitted => {
                return Err(LedgerError::InvalidTransition {
                    step: step.to_string(),
                    from: Some(entry.status),
                    to: StepStatus::Pending,
                });
            }
        }

        entry.status = StepStatus::Pending;
        entry.fingerprint = Some(fingerprint);
        entry.updated_at = Utc::now();

        tracing::debug!(step, attempt = entry.attempts, "Ledger: pending");
        self.commit(entry)
    }

    /// The chain client accepted the transaction for `step`.
    pub fn record_submitted(&mut self, step: &str, tx_id: TxId) -> Result<(), LedgerError> {
        let mut entry = self.entry_in(step, StepStatus::Submitted, &[StepStatus::Pending])?;

        entry.status = StepStatus::Submitted;
        entry.tx_id = Some(tx_id);
        entry.updated_at = Utc::now();

        tracing::debug!(step, tx = %tx_id, "Ledger: submitted");
        self.commit(entry)
    }

    /// The transaction for `step` is final and deployed `address`.
    ///
    /// Also accepted on an entry that failed to confirm in time, once its
    /// transaction is found on chain.
    pub fn record_confirmed(&mut self, step: &str, address: Address) -> Result<(), LedgerError> {
        let mut entry = self.entry_in(
            step,
            StepStatus::Confirmed,
            &[StepStatus::Submitted, StepStatus::Failed],
        )?;

        if entry.status == StepStatus::Failed {
            if entry.in_flight_tx().is_none() {
                return Err(LedgerError::InvalidTransition {
                    step: step.to_string(),
                    from: Some(entry.status),
                    to: StepStatus::Confirmed,
                });
            }
            entry.tx_id = entry.failed_tx.take();
            entry.error = None;
            entry.failure_kind = None;
        }

        entry.status = StepStatus::Confirmed;
        entry.address = Some(address);
        entry.updated_at = Utc::now();

        tracing::debug!(step, %address, "Ledger: confirmed");
        self.commit(entry)
    }

    /// The current attempt for `step` failed.
    pub fn record_failed(
        &mut self,
        step: &str,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Result<(), LedgerError> {
        let mut entry = self.entry_in(
            step,
            StepStatus::Failed,
            &[StepStatus::Pending, StepStatus::Submitted, StepStatus::Failed],
        )?;

        match entry.status {
            StepStatus::Failed if entry.in_flight_tx().is_none() => {
                return Err(LedgerError::InvalidTransition {
                    step: step.to_string(),
                    from: Some(entry.status),
                    to: StepStatus::Failed,
                });
            }
            StepStatus::Submitted => entry.failed_tx = entry.tx_id.take(),
            _ => {}
        }

        let error = error.into();
        tracing::debug!(step, %kind, error = %error, "Ledger: failed");

        entry.status = StepStatus::Failed;
        entry.failure_kind = Some(kind);
        entry.error = Some(error);
        entry.updated_at = Utc::now();

        self.commit(entry)
    }

    /// A copy of the entry for `step`, checked to be allowed to move to `to`.
    fn entry_in(
        &self,
        step: &str,
        to: StepStatus,
        allowed: &[StepStatus],
    ) -> Result<LedgerEntry, LedgerError> {
        match self.status_of(step) {
            Some(entry) if allowed.contains(&entry.status) => Ok(entry.clone()),
            entry => Err(LedgerError::InvalidTransition {
                step: step.to_string(),
                from: entry.map(|e| e.status),
                to,
            }),
        }
    }

    /// Persist `entry` in place of the current one for its step. The entries
    /// in memory only change once the file is written.
    fn commit(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let mut entries = self.entries.clone();
        match entries.iter_mut().find(|e| e.step == entry.step) {
            Some(current) => *current = entry,
            None => entries.push(entry),
        }

        self.persist(&entries)?;
        self.entries = entries;
        Ok(())
    }

    fn persist(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        let file = LedgerFile {
            version: LEDGER_VERSION,
            entries: entries.to_vec(),
        };
        let mut json = serde_json::to_string_pretty(&file).map_err(|e| LedgerError::Corrupted {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        json.push('\n');

        FsHandler::write_durable(&self.path, json.as_bytes()).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })
    }
}
