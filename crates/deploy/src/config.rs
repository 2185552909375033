//! Network configuration.
//!
//! Configuration is read from `hatch.toml` and can be overridden with
//! `HATCH_`-prefixed environment variables, nested keys being separated by a
//! double underscore (`HATCH_NETWORKS__TESTNET__URL`).

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::address;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
    value::Value,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::client::AccountRef;

/// The default name for the configuration file.
pub const CONFIG_FILENAME: &str = "hatch.toml";

/// Prefix of the environment variables overriding the configuration file.
pub const ENV_PREFIX: &str = "HATCH_";

const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";
const DEFAULT_CONFIRMATION_TIMEOUT_SECS: u64 = 120;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("unknown network `{name}` (available: {available})")]
    UnknownNetwork { name: String, available: String },

    #[error("no network selected and no `default_network` configured")]
    NoNetwork,
}

/// Connection settings for one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint.
    pub url: Url,
    /// Expected chain id, checked against `eth_chainId` on connect.
    pub chain_id: u64,
    #[serde(default)]
    pub account: AccountRef,
    /// Seconds to wait for a deployment transaction to be mined.
    #[serde(rename = "confirmation_timeout", default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Timeout of a single JSON-RPC request, in seconds.
    #[serde(rename = "request_timeout", default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Fixed gas limit. Estimated with `eth_estimateGas` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
}

fn default_confirmation_timeout() -> u64 {
    DEFAULT_CONFIRMATION_TIMEOUT_SECS
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl NetworkConfig {
    pub fn new(url: Url, chain_id: u64, account: AccountRef) -> Self {
        Self {
            url,
            chain_id,
            account,
            confirmation_timeout_secs: DEFAULT_CONFIRMATION_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            gas_limit: None,
        }
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Top-level configuration: where artifacts live and which networks exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HatchConfig {
    /// Network used when none is given on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_network: Option<String>,
    /// Root of the compiled contract artifacts.
    #[serde(default = "default_artifacts")]
    pub artifacts: PathBuf,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
}

fn default_artifacts() -> PathBuf {
    PathBuf::from(DEFAULT_ARTIFACTS_DIR)
}

/// The networks available without any configuration file.
fn builtin_networks() -> BTreeMap<String, NetworkConfig> {
    let hardhat = NetworkConfig::new(
        Url::parse("http://127.0.0.1:8545").expect("valid url"),
        31337,
        AccountRef::Unlocked {
            unlocked: address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"),
        },
    );
    let testnet = NetworkConfig::new(
        Url::parse("https://rpc.test2.btcs.network").expect("valid url"),
        1114,
        AccountRef::default(),
    );

    BTreeMap::from([
        ("hardhat".to_string(), hardhat),
        ("testnet".to_string(), testnet),
    ])
}

impl Default for HatchConfig {
    fn default() -> Self {
        Self {
            default_network: Some("testnet".to_string()),
            artifacts: default_artifacts(),
            networks: builtin_networks(),
        }
    }
}

impl HatchConfig {
    /// Load the configuration from a TOML file, or from `hatch.toml` inside
    /// `path` if it is a directory, then apply environment overrides.
    ///
    /// A missing file is not an error. Built-in networks are kept unless the
    /// file defines a network with the same name. Environment overrides apply
    /// on top of both, so `HATCH_NETWORKS__TESTNET__CHAIN_ID` alone adjusts the
    /// built-in testnet.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        Self::from_figment(
            Self::with_defaults(Figment::new().merge(Toml::file(&config_path)))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
        .inspect(|config| {
            tracing::debug!(
                path = %config_path.display(),
                networks = ?config.networks.keys().collect::<Vec<_>>(),
                "Configuration loaded"
            );
        })
    }

    /// Parse a configuration from TOML text, without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Self::with_defaults(
            Figment::new().merge(Toml::string(content)),
        ))
    }

    /// Layer `file` over the built-in configuration. A network the file
    /// defines replaces the built-in one of the same name entirely.
    fn with_defaults(file: Figment) -> Figment {
        let mut defaults = Self::default();
        if let Ok(defined) = file.extract_inner::<BTreeMap<String, Value>>("networks") {
            defaults.networks.retain(|name, _| !defined.contains_key(name));
        }
        Figment::from(Serialized::defaults(defaults)).merge(file)
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Select a network by name, falling back to `default_network`.
    pub fn network<'a>(
        &'a self,
        name: Option<&'a str>,
    ) -> Result<(&'a str, &'a NetworkConfig), ConfigError> {
        let name = name
            .or(self.default_network.as_deref())
            .ok_or(ConfigError::NoNetwork)?;

        self.networks
            .get_key_value(name)
            .map(|(name, network)| (name.as_str(), network))
            .ok_or_else(|| ConfigError::UnknownNetwork {
                name: name.to_string(),
                available: self
                    .networks
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}
