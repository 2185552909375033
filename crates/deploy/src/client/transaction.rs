//! Signed deployment transactions.

use alloy_consensus::{SignableTransaction, TxLegacy};
use alloy_core::primitives::{Bytes, TxKind, U256};
use alloy_eips::eip2718::Encodable2718;
use alloy_signer::SignerSync;

use super::{LocalAccount, SubmissionError, TxId};

/// A transaction signed in this process, ready for `eth_sendRawTransaction`.
///
/// The hash is known before the transaction is sent, so it can be tracked even
/// when the node never answers the send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hash: TxId,
    pub raw: Bytes,
}

/// A legacy (type 0) contract creation with EIP-155 replay protection.
///
/// Every EVM chain accepts this format, including the ones that never
/// enabled EIP-1559.
pub fn deployment_transaction(
    chain_id: u64,
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
    code: Bytes,
) -> TxLegacy {
    TxLegacy {
        chain_id: Some(chain_id),
        nonce,
        gas_price,
        gas_limit,
        to: TxKind::Create,
        value: U256::ZERO,
        input: code,
    }
}

/// Sign `tx` with `account`.
pub fn sign_transaction(
    account: &LocalAccount,
    tx: TxLegacy,
) -> Result<SignedTransaction, SubmissionError> {
    let signature = account
        .signer()
        .sign_hash_sync(&tx.signature_hash())
        .map_err(|e| SubmissionError::Account(format!("failed to sign transaction: {e}")))?;

    let signed = tx.into_signed(signature);
    Ok(SignedTransaction {
        hash: *signed.hash(),
        raw: signed.encoded_2718().into(),
    })
}
