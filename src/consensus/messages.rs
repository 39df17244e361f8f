use serde::{Deserialize, Serialize};

use crate::consensus::bit_array::BitArray;
use crate::consensus::proposal::Proposal;
use crate::consensus::types::RoundStepType;
use crate::consensus::vote::{Vote, VoteType};
use crate::consensus::ConsensusError;
use crate::types::block::Block;
use crate::types::primitives::H256;

/// Upper bound on validator indices and bit array lengths accepted off the wire.
pub const MAX_VALIDATORS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRoundStepMessage {
    pub height: u64,
    pub round: u32,
    pub step: RoundStepType,
    pub seconds_since_start: u64,
    pub last_commit_round: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewValidBlockMessage {
    pub height: u64,
    pub round: u32,
    pub hash: H256,
    pub is_commit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalPolMessage {
    pub height: u64,
    pub pol_round: u32,
    pub pol: BitArray,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasVoteMessage {
    pub height: u64,
    pub round: u32,
    pub vote_type: VoteType,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSetMaj23Message {
    pub height: u64,
    pub round: u32,
    pub vote_type: VoteType,
    pub hash: H256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSetBitsMessage {
    pub height: u64,
    pub round: u32,
    pub vote_type: VoteType,
    pub hash: H256,
    pub votes: BitArray,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    NewRoundStep(NewRoundStepMessage),
    NewValidBlock(NewValidBlockMessage),
    Proposal(Proposal),
    ProposalPol(ProposalPolMessage),
    Vote(Vote),
    HasVote(HasVoteMessage),
    VoteSetMaj23(VoteSetMaj23Message),
    VoteSetBits(VoteSetBitsMessage),
    GetProposalBlock(H256),
    ProposalBlock(Box<Block>),
}

impl ConsensusMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ConsensusError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConsensusError> {
        let message: ConsensusMessage = bincode::deserialize(bytes)?;
        message.validate_basic()?;
        Ok(message)
    }

    /// Bounds checks that need no consensus state.
    pub fn validate_basic(&self) -> Result<(), ConsensusError> {
        match self {
            ConsensusMessage::NewRoundStep(m) => {
                if let Some(last) = m.last_commit_round {
                    if m.height <= 1 && last > 0 {
                        return Err(invalid("last commit round before first height"));
                    }
                }
            }
            ConsensusMessage::Proposal(p) => p.validate_basic()?,
            ConsensusMessage::ProposalPol(m) => check_bits(&m.pol)?,
            ConsensusMessage::Vote(v) => {
                if v.index as usize >= MAX_VALIDATORS {
                    return Err(invalid("validator index out of range"));
                }
                if v.signature.is_none() {
                    return Err(ConsensusError::InvalidVote("unsigned vote".to_string()));
                }
            }
            ConsensusMessage::HasVote(m) => {
                if m.index as usize >= MAX_VALIDATORS {
                    return Err(invalid("validator index out of range"));
                }
            }
            ConsensusMessage::VoteSetBits(m) => check_bits(&m.votes)?,
            ConsensusMessage::NewValidBlock(_)
            | ConsensusMessage::VoteSetMaj23(_)
            | ConsensusMessage::GetProposalBlock(_)
            | ConsensusMessage::ProposalBlock(_) => {}
        }
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusMessage::NewRoundStep(_) => "new_round_step",
            ConsensusMessage::NewValidBlock(_) => "new_valid_block",
            ConsensusMessage::Proposal(_) => "proposal",
            ConsensusMessage::ProposalPol(_) => "proposal_pol",
            ConsensusMessage::Vote(_) => "vote",
            ConsensusMessage::HasVote(_) => "has_vote",
            ConsensusMessage::VoteSetMaj23(_) => "vote_set_maj23",
            ConsensusMessage::VoteSetBits(_) => "vote_set_bits",
            ConsensusMessage::GetProposalBlock(_) => "get_proposal_block",
            ConsensusMessage::ProposalBlock(_) => "proposal_block",
        }
    }
}

fn check_bits(bits: &BitArray) -> Result<(), ConsensusError> {
    if bits.len() > MAX_VALIDATORS {
        return Err(invalid("bit array too long"));
    }
    Ok(())
}

fn invalid(reason: &str) -> ConsensusError {
    ConsensusError::InvalidMessage(reason.to_string())
}
