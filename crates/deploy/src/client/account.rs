//! Deployer accounts.

use std::fmt;

use alloy_core::primitives::Address;
use alloy_signer_local::{MnemonicBuilder, PrivateKeySigner, coins_bip39::English};
use serde::{Deserialize, Serialize};

use super::ClientError;

/// Environment variable holding the deployer private key when nothing else is configured.
pub const DEFAULT_PRIVATE_KEY_ENV: &str = "DEPLOYER_PRIVATE_KEY";

/// Where the deployer account comes from.
///
/// Secrets are never stored in configuration files, only the name of the
/// environment variable that holds them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccountRef {
    /// A hex private key read from an environment variable.
    PrivateKeyEnv { env: String },
    /// A BIP-39 phrase read from an environment variable, derived at `index`.
    Mnemonic {
        mnemonic_env: String,
        #[serde(default)]
        index: u32,
    },
    /// An account unlocked on the node itself (Anvil, Hardhat).
    Unlocked { unlocked: Address },
}

impl Default for AccountRef {
    fn default() -> Self {
        Self::PrivateKeyEnv {
            env: DEFAULT_PRIVATE_KEY_ENV.to_string(),
        }
    }
}

impl AccountRef {
    /// Read the referenced secret and build the account.
    pub fn resolve(&self) -> Result<Account, ClientError> {
        match self {
            Self::PrivateKeyEnv { env } => {
                let key = read_env(env)?;
                LocalAccount::from_hex(&key).map(Account::Local)
            }
            Self::Mnemonic {
                mnemonic_env,
                index,
            } => {
                let phrase = read_env(mnemonic_env)?;
                let signer = MnemonicBuilder::<English>::default()
                    .phrase(phrase.trim())
                    .index(*index)
                    .and_then(|builder| builder.build())
                    .map_err(|e| ClientError::Account(format!("invalid mnemonic: {e}")))?;
                Ok(Account::Local(LocalAccount::new(signer)))
            }
            Self::Unlocked { unlocked } => Ok(Account::Unlocked(*unlocked)),
        }
    }
}

fn read_env(name: &str) -> Result<String, ClientError> {
    std::env::var(name)
        .map_err(|_| ClientError::Account(format!("environment variable {name} is not set")))
}

/// The account deployments are sent from.
#[derive(Debug)]
pub enum Account {
    /// Transactions are signed in this process.
    Local(LocalAccount),
    /// Transactions are signed by the node.
    Unlocked(Address),
}

impl Account {
    pub fn address(&self) -> Address {
        match self {
            Self::Local(local) => local.address(),
            Self::Unlocked(address) => *address,
        }
    }
}

/// A secp256k1 key held in memory.
pub struct LocalAccount {
    signer: PrivateKeySigner,
}

impl LocalAccount {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }

    /// Parse a hex private key, with or without `0x`.
    pub fn from_hex(key: &str) -> Result<Self, ClientError> {
        key.trim()
            .parse::<PrivateKeySigner>()
            .map(Self::new)
            .map_err(|e| ClientError::Account(format!("invalid private key: {e}")))
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub(super) fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }
}

impl fmt::Debug for LocalAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAccount")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
