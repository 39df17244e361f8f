use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::bit_array::BitArray;
use crate::consensus::proposal::Proposal;
use crate::consensus::validator_set::ActiveValidatorSet;
use crate::consensus::vote::{Vote, VoteType, VoteVersion};
use crate::consensus::vote_set::{quorum_threshold, VoteSet};
use crate::security::verify_signature;
use crate::types::block::BlockHeader;
use crate::types::primitives::{Address, H256};

#[derive(Error, Debug)]
pub enum ExtraDataError {
    #[error("Failed to decode extra data: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Header carries no commit proof")]
    Missing,
    #[error("Commit covers {bits} validators, set has {validators}")]
    SizeMismatch { bits: usize, validators: usize },
    #[error("Commit has {signatures} signatures for {signers} signers")]
    SignatureCountMismatch { signatures: usize, signers: usize },
    #[error("Validator {0} has no alternate key")]
    MissingAlternateKey(Address),
    #[error("Invalid commit signature from index {0}")]
    InvalidSignature(usize),
    #[error("Batch verification of commit failed")]
    InvalidBatch,
    #[error("Commit power {signed} below quorum {quorum}")]
    InsufficientPower { signed: u64, quorum: u64 },
    #[error("Invalid proposal in commit: {0}")]
    InvalidProposal(String),
}

/// Precommit signatures for one block, in validator index order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSignatures {
    pub version: VoteVersion,
    pub bits: BitArray,
    pub signatures: Vec<Signature>,
}

/// Commit proof stored in `BlockHeader::extra_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraData {
    pub commit_round: u32,
    pub pol_round: Option<u32>,
    pub proposal: Option<Proposal>,
    pub precommits: CommitSignatures,
}

impl ExtraData {
    /// Collects the precommits for `hash` out of the commit round's set.
    pub fn from_commit(
        commit_round: u32,
        pol_round: Option<u32>,
        proposal: Option<Proposal>,
        precommits: &VoteSet,
        hash: &H256,
        version: VoteVersion,
    ) -> Self {
        let mut bits = BitArray::new(precommits.size());
        let mut signatures = Vec::new();
        for vote in precommits.votes_for_block(hash) {
            if vote.version != version {
                continue;
            }
            if let Some(signature) = vote.signature {
                bits.set_index(vote.index as usize, true);
                signatures.push(signature);
            }
        }

        Self {
            commit_round,
            pol_round,
            proposal,
            precommits: CommitSignatures {
                version,
                bits,
                signatures,
            },
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ExtraDataError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ExtraDataError> {
        if bytes.is_empty() {
            return Err(ExtraDataError::Missing);
        }
        Ok(bincode::deserialize(bytes)?)
    }

    /// Checks that `header` was committed by a quorum of `validators`.
    pub fn verify(
        chain_id: u64,
        header: &BlockHeader,
        validators: &ActiveValidatorSet,
    ) -> Result<ExtraData, ExtraDataError> {
        let extra = Self::decode(&header.extra_data)?;
        let hash = header.hash();
        let commit = &extra.precommits;

        if commit.bits.len() != validators.len() {
            return Err(ExtraDataError::SizeMismatch {
                bits: commit.bits.len(),
                validators: validators.len(),
            });
        }
        let signers = commit.bits.true_indices();
        if signers.len() != commit.signatures.len() {
            return Err(ExtraDataError::SignatureCountMismatch {
                signatures: commit.signatures.len(),
                signers: signers.len(),
            });
        }

        let mut messages = Vec::with_capacity(signers.len());
        let mut keys: Vec<VerifyingKey> = Vec::with_capacity(signers.len());
        let mut signed_power = 0u64;
        for &index in &signers {
            let validator = validators
                .get_validator_by_index(index)
                .ok_or(ExtraDataError::SizeMismatch {
                    bits: commit.bits.len(),
                    validators: validators.len(),
                })?;
            let key = match commit.version {
                VoteVersion::Individual => validator.public_key,
                VoteVersion::Batched => validator
                    .alternate_public_key
                    .ok_or(ExtraDataError::MissingAlternateKey(validator.address))?,
            };
            let vote = Vote::new(
                chain_id,
                VoteType::Precommit,
                header.height,
                extra.commit_round,
                hash,
                index as u32,
                commit.version,
            );
            messages.push(vote.message_to_sign());
            keys.push(key);
            signed_power += validator.voting_power;
        }

        match commit.version {
            VoteVersion::Individual => {
                for (i, index) in signers.iter().enumerate() {
                    if !verify_signature(&keys[i], &messages[i], &commit.signatures[i]) {
                        return Err(ExtraDataError::InvalidSignature(*index));
                    }
                }
            }
            VoteVersion::Batched => {
                let message_refs: Vec<&[u8]> = messages.iter().map(|m| m.as_bytes()).collect();
                ed25519_dalek::verify_batch(&message_refs, &commit.signatures, &keys)
                    .map_err(|_| ExtraDataError::InvalidBatch)?;
            }
        }

        let quorum = quorum_threshold(validators.total_voting_power());
        if signed_power < quorum {
            return Err(ExtraDataError::InsufficientPower {
                signed: signed_power,
                quorum,
            });
        }

        if let Some(proposal) = &extra.proposal {
            if proposal.height != header.height || proposal.hash != hash {
                return Err(ExtraDataError::InvalidProposal(
                    "proposal does not match header".to_string(),
                ));
            }
            let round_validators = validators.copy_increment_proposer_priority(proposal.round);
            proposal
                .validate_signature(&round_validators)
                .map_err(|e| ExtraDataError::InvalidProposal(e.to_string()))?;
        }

        Ok(extra)
    }
}
