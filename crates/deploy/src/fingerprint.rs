use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::plan::{ArgSpec, DeploymentStep};

/// The parts of a step definition that, when changed, make a recorded
/// deployment stale.
///
/// The step name is excluded: it is the ledger key. Arguments are hashed in
/// their unresolved form, so redeploying a dependency does not change the
/// fingerprint of its dependents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFingerprint<'a> {
    pub contract: &'a str,
    pub args: &'a [ArgSpec],
}

impl<'a> StepFingerprint<'a> {
    pub fn from_step(step: &'a DeploymentStep) -> Self {
        Self {
            contract: step.contract_name(),
            args: &step.constructor_args,
        }
    }

    /// Compute a SHA-256 hash of this definition, hex encoded.
    pub fn compute_hash(&self) -> String {
        let json = serde_json::to_string(self)
            .expect("StepFingerprint serialization should never fail");

        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> DeploymentStep {
        DeploymentStep::new("Timer")
            .contract("DecentralizedStudyTimer")
            .arg(ArgSpec::step_ref("Token"))
            .arg(ArgSpec::step_ref("Badge"))
    }

    #[test]
    fn test_hash_determinism() {
        let step = timer();
        let hash1 = StepFingerprint::from_step(&step).compute_hash();
        let hash2 = StepFingerprint::from_step(&step).compute_hash();

        assert_eq!(hash1, hash2, "Hash should be deterministic");
        assert_eq!(hash1.len(), 64, "SHA-256 hash should be 64 hex characters");
    }

    #[test]
    fn test_hash_changes_with_contract() {
        let step = timer();
        let renamed = timer().contract("StudyTimerV2");

        assert_ne!(
            StepFingerprint::from_step(&step).compute_hash(),
            StepFingerprint::from_step(&renamed).compute_hash(),
            "Hash should change when the contract changes"
        );
    }

    #[test]
    fn test_hash_changes_with_args() {
        let step = timer();
        let extra = timer().arg(ArgSpec::literal(3600));

        assert_ne!(
            StepFingerprint::from_step(&step).compute_hash(),
            StepFingerprint::from_step(&extra).compute_hash(),
            "Hash should change when constructor arguments change"
        );
    }

    #[test]
    fn test_hash_ignores_step_name() {
        let step = timer();
        let mut renamed = timer();
        renamed.name = "StudyTimer".to_string();

        assert_eq!(
            StepFingerprint::from_step(&step).compute_hash(),
            StepFingerprint::from_step(&renamed).compute_hash(),
        );
    }
}
