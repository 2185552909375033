//! Compiled contract artifacts.
//!
//! Artifacts are the JSON files a Hardhat build writes under
//! `artifacts/contracts/<File>.sol/<Contract>.json`. Only the ABI and the
//! creation bytecode are used.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue},
    json_abi::JsonAbi,
    primitives::Bytes,
};
use serde::Deserialize;
use serde_json::Value;

use super::SubmissionError;

/// A compiled contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractArtifact {
    pub contract_name: String,
    pub abi: JsonAbi,
    pub bytecode: Bytes,
}

impl ContractArtifact {
    /// Creation bytecode followed by the ABI-encoded constructor arguments.
    ///
    /// Each argument is coerced to the Solidity type declared by the
    /// constructor: strings are parsed as-is (`"0x..."` for an address,
    /// `"1000"` for a `uint256`), other JSON values are parsed from their JSON
    /// text.
    pub fn deployment_code(&self, args: &[Value]) -> Result<Bytes, SubmissionError> {
        if self.bytecode.is_empty() {
            return Err(SubmissionError::Artifact(format!(
                "{} has no bytecode (abstract contract or interface?)",
                self.contract_name
            )));
        }

        let inputs = self
            .abi
            .constructor
            .as_ref()
            .map(|constructor| constructor.inputs.as_slice())
            .unwrap_or_default();

        if inputs.len() != args.len() {
            return Err(SubmissionError::Encoding(format!(
                "{} constructor takes {} arguments, got {}",
                self.contract_name,
                inputs.len(),
                args.len()
            )));
        }

        let values = inputs
            .iter()
            .zip(args)
            .map(|(param, arg)| {
                let ty = param.selector_type();
                let sol_type = DynSolType::parse(&ty).map_err(|e| {
                    SubmissionError::Encoding(format!("unsupported type {ty}: {e}"))
                })?;
                let text = match arg {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                sol_type.coerce_str(&text).map_err(|e| {
                    SubmissionError::Encoding(format!(
                        "argument `{}` is not a valid {ty}: {e}",
                        param.name
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut code = self.bytecode.to_vec();
        if !values.is_empty() {
            code.extend(DynSolValue::Tuple(values).abi_encode_params());
        }
        Ok(code.into())
    }
}

/// Looks up artifacts by contract name under a root directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find and parse `<contract>.json` anywhere below the root.
    pub fn find(&self, contract: &str) -> Result<ContractArtifact, SubmissionError> {
        let file_name = format!("{contract}.json");
        let path = find_file(&self.root, &file_name)
            .map_err(|e| {
                SubmissionError::Artifact(format!(
                    "failed to search {}: {e}",
                    self.root.display()
                ))
            })?
            .ok_or_else(|| {
                SubmissionError::Artifact(format!(
                    "no artifact for {contract} under {}",
                    self.root.display()
                ))
            })?;

        let content = fs::read_to_string(&path).map_err(|e| {
            SubmissionError::Artifact(format!("failed to read {}: {e}", path.display()))
        })?;
        let artifact: ContractArtifact = serde_json::from_str(&content).map_err(|e| {
            SubmissionError::Artifact(format!("failed to parse {}: {e}", path.display()))
        })?;

        tracing::debug!(contract, path = %path.display(), "Contract artifact loaded");
        Ok(artifact)
    }
}

/// Depth-first search for `file_name`, visiting entries in name order.
fn find_file(dir: &Path, file_name: &str) -> io::Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if let Some(found) = find_file(&path, file_name)? {
                return Ok(Some(found));
            }
        } else if entry.file_name().to_str() == Some(file_name) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
