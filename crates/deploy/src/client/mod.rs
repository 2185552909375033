//! Chain client: the interface the executor uses to reach the network.

mod account;
mod artifacts;
mod rpc;
mod transaction;

use std::{future::Future, time::Duration};

use alloy_core::primitives::{Address, B256};
use serde_json::Value;

pub use account::{Account, AccountRef, DEFAULT_PRIVATE_KEY_ENV, LocalAccount};
pub use artifacts::{ArtifactStore, ContractArtifact};
pub use rpc::{RpcChainClient, RpcError};
pub use transaction::{SignedTransaction, deployment_transaction, sign_transaction};

/// Identifier of a submitted transaction.
pub type TxId = B256;

/// A deployment could not be submitted.
///
/// Every variant but [`SubmissionError::Unknown`] means nothing reached the
/// chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    #[error("contract artifact unavailable: {0}")]
    Artifact(String),

    #[error("failed to encode constructor arguments: {0}")]
    Encoding(String),

    #[error("account unavailable: {0}")]
    Account(String),

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// A signed transaction was sent but the node never acknowledged it. It
    /// may have been accepted and can still land.
    #[error("no acknowledgement for transaction {tx}: {message}")]
    Unknown { tx: TxId, message: String },
}

impl SubmissionError {
    /// The transaction that may have reached the chain despite the error.
    pub fn in_flight_tx(&self) -> Option<TxId> {
        match self {
            Self::Unknown { tx, .. } => Some(*tx),
            _ => None,
        }
    }
}

/// A submitted transaction could not be confirmed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfirmationError {
    #[error("transaction {tx} not confirmed within {}s", .timeout.as_secs())]
    Timeout { tx: TxId, timeout: Duration },

    #[error("transaction {tx} reverted")]
    Reverted { tx: TxId },

    #[error("transaction {tx} was confirmed without creating a contract")]
    MissingAddress { tx: TxId },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ConfirmationError {
    /// Whether the transaction has definitely landed and failed.
    ///
    /// A non-final error means the transaction may still be mined later.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Reverted { .. } | Self::MissingAddress { .. })
    }
}

/// Errors raised while setting up a [`RpcChainClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("account unavailable: {0}")]
    Account(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("network reports chain id {actual}, configuration expects {expected}")]
    ChainIdMismatch { expected: u64, actual: u64 },
}

/// Submits contract deployments and waits for their confirmation.
pub trait ChainClient: Send + Sync {
    /// Submit the deployment of `contract` with already resolved constructor
    /// arguments. Returns once the network has accepted the transaction.
    fn deploy(
        &self,
        contract: &str,
        args: &[Value],
    ) -> impl Future<Output = Result<TxId, SubmissionError>> + Send;

    /// Wait until `tx` is final and return the address of the deployed contract.
    fn await_confirmation(
        &self,
        tx: TxId,
        timeout: Duration,
    ) -> impl Future<Output = Result<Address, ConfirmationError>> + Send;
}
