use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consensus::validator_set::ActiveValidatorSet;
use crate::consensus::ConsensusError;
use crate::security::{verify_signature, Signer};
use crate::types::primitives::H256;

const PROPOSAL_DOMAIN: &[u8] = b"reimint/proposal";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    /// Round of the polka that justifies re-proposing a valid block.
    pub pol_round: Option<u32>,
    pub hash: H256,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub signature: Option<Signature>,
}

impl Proposal {
    pub fn new(height: u64, round: u32, pol_round: Option<u32>, hash: H256, timestamp: i64) -> Self {
        Self {
            height,
            round,
            pol_round,
            hash,
            timestamp,
            signature: None,
        }
    }

    pub fn message_to_sign(&self) -> H256 {
        let pol_round = self.pol_round.map_or(-1, i64::from);
        let mut hasher = Sha256::new();
        hasher.update(PROPOSAL_DOMAIN);
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.round.to_be_bytes());
        hasher.update(pol_round.to_be_bytes());
        hasher.update(self.hash.as_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        H256(hasher.finalize().into())
    }

    pub fn sign(&mut self, signer: &Signer) {
        self.signature = Some(signer.sign(&self.message_to_sign()));
    }

    pub fn validate_basic(&self) -> Result<(), ConsensusError> {
        if let Some(pol_round) = self.pol_round {
            if pol_round >= self.round {
                return Err(ConsensusError::InvalidProposal(format!(
                    "POL round {} not below round {}",
                    pol_round, self.round
                )));
            }
        }
        if self.hash.is_zero() {
            return Err(ConsensusError::InvalidProposal("nil block hash".to_string()));
        }
        Ok(())
    }

    /// `validators` must already be advanced to the proposal's round.
    pub fn validate_signature(&self, validators: &ActiveValidatorSet) -> Result<(), ConsensusError> {
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| ConsensusError::InvalidSignature("unsigned proposal".to_string()))?;
        let proposer = validators.proposer();
        if !verify_signature(&proposer.public_key, &self.message_to_sign(), signature) {
            return Err(ConsensusError::InvalidSignature(format!(
                "proposal not signed by proposer {}",
                proposer.address
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::test_utils::{signers, validator_set};
    use assert_matches::assert_matches;

    #[test]
    fn only_the_proposer_signature_is_accepted() {
        let signers = signers(3);
        let set = validator_set(&signers, &[1, 1, 1]);
        let proposer = signers
            .iter()
            .find(|s| s.address() == set.proposer().address)
            .unwrap();
        let other = signers
            .iter()
            .find(|s| s.address() != set.proposer().address)
            .unwrap();

        let mut proposal = Proposal::new(1, 0, None, H256::digest(b"block"), 1_000);
        proposal.sign(proposer);
        assert!(proposal.validate_signature(&set).is_ok());

        proposal.sign(other);
        assert_matches!(
            proposal.validate_signature(&set),
            Err(ConsensusError::InvalidSignature(_))
        );
    }

    #[test]
    fn pol_round_must_precede_round() {
        let proposal = Proposal::new(1, 2, Some(2), H256::digest(b"block"), 0);
        assert_matches!(proposal.validate_basic(), Err(ConsensusError::InvalidProposal(_)));
        let proposal = Proposal::new(1, 2, Some(1), H256::digest(b"block"), 0);
        assert!(proposal.validate_basic().is_ok());
    }
}
