pub mod backend;
pub mod bit_array;
pub mod engine;
pub mod evpool;
pub mod extra_data;
pub mod height_vote_set;
pub mod messages;
pub mod pending_block;
pub mod proposal;
pub mod protocol;
pub mod state;
pub mod timeout_ticker;
pub mod types;
pub mod validator_set;
pub mod vote;
pub mod vote_set;

#[cfg(test)]
pub(crate) mod test_utils;

pub use backend::{Backend, BackendError, BroadcastTarget, ProcessResult};
pub use engine::ConsensusEngine;
pub use messages::ConsensusMessage;
pub use state::{RoundStateSummary, StateMachineHandle};
pub use types::{PeerId, RoundStepType};
pub use validator_set::{ActiveValidatorSet, Validator};
pub use vote::{Vote, VoteType, VoteVersion};

use thiserror::Error;

use crate::consensus::evpool::EvidenceError;
use crate::consensus::extra_data::ExtraDataError;
use crate::consensus::vote_set::VoteError;
use crate::security::SignerError;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Invalid vote: {0}")]
    InvalidVote(String),
    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Vote error: {0}")]
    Vote(#[from] VoteError),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Evidence error: {0}")]
    Evidence(#[from] EvidenceError),
    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),
    #[error("Extra data error: {0}")]
    ExtraData(#[from] ExtraDataError),
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
}
