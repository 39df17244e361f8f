use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consensus::evpool::EvidenceError;
use crate::consensus::validator_set::ActiveValidatorSet;
use crate::consensus::vote::Vote;
use crate::types::primitives::H256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Evidence {
    DuplicateVote(DuplicateVoteEvidence),
}

impl Evidence {
    pub fn hash(&self) -> H256 {
        match self {
            Evidence::DuplicateVote(evidence) => evidence.hash(),
        }
    }

    pub fn height(&self) -> u64 {
        match self {
            Evidence::DuplicateVote(evidence) => evidence.height(),
        }
    }

    pub fn verify(&self, validators: &ActiveValidatorSet) -> Result<(), EvidenceError> {
        match self {
            Evidence::DuplicateVote(evidence) => evidence.verify(validators),
        }
    }
}

impl From<DuplicateVoteEvidence> for Evidence {
    fn from(evidence: DuplicateVoteEvidence) -> Self {
        Evidence::DuplicateVote(evidence)
    }
}

/// Two signed votes from one validator for different blocks at the same
/// (height, round, type). `vote_a` always carries the smaller block hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateVoteEvidence {
    vote_a: Vote,
    vote_b: Vote,
}

impl DuplicateVoteEvidence {
    pub fn new(first: Vote, second: Vote) -> Result<Self, EvidenceError> {
        if first.height != second.height
            || first.round != second.round
            || first.vote_type != second.vote_type
            || first.chain_id != second.chain_id
        {
            return Err(EvidenceError::InvalidEvidence(
                "votes are not from the same step".to_string(),
            ));
        }
        if first.index != second.index {
            return Err(EvidenceError::InvalidEvidence(
                "votes are from different validators".to_string(),
            ));
        }
        if first.hash == second.hash {
            return Err(EvidenceError::InvalidEvidence(
                "votes are for the same block".to_string(),
            ));
        }
        if first.signature.is_none() || second.signature.is_none() {
            return Err(EvidenceError::InvalidEvidence("unsigned vote".to_string()));
        }

        let (vote_a, vote_b) = if first.hash < second.hash {
            (first, second)
        } else {
            (second, first)
        };
        Ok(Self { vote_a, vote_b })
    }

    pub fn vote_a(&self) -> &Vote {
        &self.vote_a
    }

    pub fn vote_b(&self) -> &Vote {
        &self.vote_b
    }

    pub fn height(&self) -> u64 {
        self.vote_a.height
    }

    pub fn validator_index(&self) -> u32 {
        self.vote_a.index
    }

    pub fn hash(&self) -> H256 {
        let mut hasher = Sha256::new();
        hasher.update(b"reimint/duplicate-vote");
        for vote in [&self.vote_a, &self.vote_b] {
            hasher.update(vote.message_to_sign().as_bytes());
            if let Some(signature) = &vote.signature {
                hasher.update(signature.to_bytes());
            }
        }
        H256(hasher.finalize().into())
    }

    /// Both votes must verify against the validator they name.
    pub fn verify(&self, validators: &ActiveValidatorSet) -> Result<(), EvidenceError> {
        for vote in [&self.vote_a, &self.vote_b] {
            vote.validate_signature(validators)
                .map_err(|e| EvidenceError::InvalidEvidence(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::test_utils::{signed_vote, signers, validator_set};
    use crate::consensus::vote::VoteType;
    use assert_matches::assert_matches;

    #[test]
    fn evidence_is_canonical_regardless_of_order() {
        let signers = signers(2);
        let a = signed_vote(&signers[1], 1, VoteType::Precommit, 4, 2, H256::digest(b"a"));
        let b = signed_vote(&signers[1], 1, VoteType::Precommit, 4, 2, H256::digest(b"b"));

        let one = DuplicateVoteEvidence::new(a.clone(), b.clone()).unwrap();
        let two = DuplicateVoteEvidence::new(b, a).unwrap();
        assert_eq!(one, two);
        assert_eq!(one.hash(), two.hash());
        assert!(one.vote_a().hash < one.vote_b().hash);
        assert!(one.verify(&validator_set(&signers, &[1, 1])).is_ok());
    }

    #[test]
    fn votes_from_different_validators_are_not_evidence() {
        let signers = signers(2);
        let a = signed_vote(&signers[0], 0, VoteType::Prevote, 4, 0, H256::digest(b"a"));
        let b = signed_vote(&signers[1], 1, VoteType::Prevote, 4, 0, H256::digest(b"b"));
        assert_matches!(
            DuplicateVoteEvidence::new(a, b),
            Err(EvidenceError::InvalidEvidence(_))
        );
    }

    #[test]
    fn same_block_is_not_evidence() {
        let signers = signers(1);
        let a = signed_vote(&signers[0], 0, VoteType::Prevote, 4, 0, H256::digest(b"a"));
        assert_matches!(
            DuplicateVoteEvidence::new(a.clone(), a),
            Err(EvidenceError::InvalidEvidence(_))
        );
    }
}
