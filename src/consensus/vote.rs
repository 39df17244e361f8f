use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::consensus::validator_set::{ActiveValidatorSet, Validator};
use crate::consensus::vote_set::VoteError;
use crate::security::{verify_signature, Signer, SignerError};
use crate::types::primitives::H256;

const VOTE_DOMAIN: &[u8] = b"reimint/vote";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl VoteType {
    fn as_byte(self) -> u8 {
        match self {
            VoteType::Prevote => 1,
            VoteType::Precommit => 2,
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => f.write_str("prevote"),
            VoteType::Precommit => f.write_str("precommit"),
        }
    }
}

/// Signature scheme of a vote, chosen per height by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteVersion {
    /// Signed with the validator's primary key over a message that includes
    /// the validator index.
    Individual,
    /// Signed with the validator's alternate key over a message shared by
    /// every validator, so a commit can be batch verified.
    Batched,
}

impl VoteVersion {
    fn as_byte(self) -> u8 {
        match self {
            VoteVersion::Individual => 0,
            VoteVersion::Batched => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub chain_id: u64,
    pub vote_type: VoteType,
    pub height: u64,
    pub round: u32,
    /// Zero hash means nil.
    pub hash: H256,
    pub index: u32,
    pub version: VoteVersion,
    pub signature: Option<Signature>,
}

impl Vote {
    pub fn new(
        chain_id: u64,
        vote_type: VoteType,
        height: u64,
        round: u32,
        hash: H256,
        index: u32,
        version: VoteVersion,
    ) -> Self {
        Self {
            chain_id,
            vote_type,
            height,
            round,
            hash,
            index,
            version,
            signature: None,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.hash.is_zero()
    }

    pub fn message_to_sign(&self) -> H256 {
        let mut hasher = Sha256::new();
        hasher.update(VOTE_DOMAIN);
        hasher.update(self.chain_id.to_be_bytes());
        hasher.update([self.vote_type.as_byte()]);
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.round.to_be_bytes());
        hasher.update(self.hash.as_bytes());
        if self.version == VoteVersion::Individual {
            hasher.update(self.index.to_be_bytes());
        }
        hasher.update([self.version.as_byte()]);
        H256(hasher.finalize().into())
    }

    pub fn sign(&mut self, signer: &Signer) -> Result<(), SignerError> {
        let message = self.message_to_sign();
        let signature = match self.version {
            VoteVersion::Individual => signer.sign(&message),
            VoteVersion::Batched => signer.sign_alternate(&message)?,
        };
        self.signature = Some(signature);
        Ok(())
    }

    /// Checks the signature against the validator at `index` and returns it.
    pub fn validate_signature<'a>(
        &self,
        validators: &'a ActiveValidatorSet,
    ) -> Result<&'a Validator, VoteError> {
        let validator = validators
            .get_validator_by_index(self.index as usize)
            .ok_or(VoteError::InvalidIndex(self.index))?;
        let signature = self.signature.as_ref().ok_or(VoteError::MissingSignature)?;
        let key = match self.version {
            VoteVersion::Individual => &validator.public_key,
            VoteVersion::Batched => validator
                .alternate_public_key
                .as_ref()
                .ok_or(VoteError::MissingAlternateKey(validator.address))?,
        };
        if !verify_signature(key, &self.message_to_sign(), signature) {
            return Err(VoteError::InvalidSignature(validator.address));
        }
        Ok(validator)
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = if self.is_nil() {
            "nil".to_string()
        } else {
            format!("{:?}", self.hash)
        };
        write!(
            f,
            "Vote{{{} {}/{} {} idx={}}}",
            self.vote_type, self.height, self.round, target, self.index
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::test_utils::{signers, validator_set};
    use assert_matches::assert_matches;

    #[test]
    fn signed_vote_validates_against_its_index() {
        let signers = signers(3);
        let set = validator_set(&signers, &[1, 1, 1]);
        let mut vote = Vote::new(1, VoteType::Prevote, 5, 0, H256::digest(b"b"), 2, VoteVersion::Individual);
        vote.sign(&signers[2]).unwrap();
        assert_eq!(vote.validate_signature(&set).unwrap().address, signers[2].address());

        // same signature under another index fails
        vote.index = 1;
        assert_matches!(vote.validate_signature(&set), Err(VoteError::InvalidSignature(_)));
    }

    #[test]
    fn index_out_of_range_is_rejected() {
        let signers = signers(1);
        let set = validator_set(&signers, &[1]);
        let mut vote = Vote::new(1, VoteType::Precommit, 1, 0, H256::ZERO, 4, VoteVersion::Individual);
        vote.sign(&signers[0]).unwrap();
        assert_matches!(vote.validate_signature(&set), Err(VoteError::InvalidIndex(4)));
    }

    #[test]
    fn batched_votes_share_a_message_across_validators() {
        let hash = H256::digest(b"block");
        let a = Vote::new(1, VoteType::Precommit, 3, 1, hash, 0, VoteVersion::Batched);
        let b = Vote::new(1, VoteType::Precommit, 3, 1, hash, 1, VoteVersion::Batched);
        assert_eq!(a.message_to_sign(), b.message_to_sign());

        let c = Vote::new(1, VoteType::Precommit, 3, 1, hash, 0, VoteVersion::Individual);
        let d = Vote::new(1, VoteType::Precommit, 3, 1, hash, 1, VoteVersion::Individual);
        assert_ne!(c.message_to_sign(), d.message_to_sign());
    }

    #[test]
    fn batched_vote_uses_alternate_key() {
        let signers = signers(2);
        let set = validator_set(&signers, &[1, 1]);
        let mut vote = Vote::new(1, VoteType::Prevote, 1, 0, H256::ZERO, 1, VoteVersion::Batched);
        vote.sign(&signers[1]).unwrap();
        assert!(vote.validate_signature(&set).is_ok());

        let primary = signers[1].sign(&vote.message_to_sign());
        vote.signature = Some(primary);
        assert_matches!(vote.validate_signature(&set), Err(VoteError::InvalidSignature(_)));
    }
}
