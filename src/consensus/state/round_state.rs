use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::consensus::backend::ProcessResult;
use crate::consensus::height_vote_set::HeightVoteSet;
use crate::consensus::proposal::Proposal;
use crate::consensus::types::RoundStepType;
use crate::consensus::validator_set::ActiveValidatorSet;
use crate::types::block::{Block, BlockHeader};
use crate::types::primitives::{Address, H256};

/// A block the backend has executed, with the roots it produced.
#[derive(Debug, Clone)]
pub struct ValidatedBlock {
    pub block: Arc<Block>,
    pub result: ProcessResult,
}

impl ValidatedBlock {
    pub fn new(block: Block, result: ProcessResult) -> Self {
        Self {
            block: Arc::new(block),
            result,
        }
    }

    pub fn hash(&self) -> H256 {
        self.block.hash()
    }
}

/// A block tagged with the round it was locked or marked valid in.
#[derive(Debug, Clone)]
pub struct RoundBlock {
    pub round: u32,
    pub block: ValidatedBlock,
}

impl RoundBlock {
    pub fn hash(&self) -> H256 {
        self.block.hash()
    }
}

#[derive(Debug, Clone)]
pub struct RoundState {
    pub height: u64,
    pub round: u32,
    pub step: RoundStepType,
    pub start_time: DateTime<Utc>,
    pub commit_time: Option<DateTime<Utc>>,
    pub parent: BlockHeader,
    /// Validators advanced to the current round.
    pub validators: Arc<ActiveValidatorSet>,
    pub proposal: Option<Proposal>,
    /// Hash of the block we expect for the proposal or the commit.
    pub proposal_block_hash: Option<H256>,
    pub proposal_block: Option<ValidatedBlock>,
    pub locked: Option<RoundBlock>,
    pub valid: Option<RoundBlock>,
    pub votes: HeightVoteSet,
    pub commit_round: Option<u32>,
    pub last_commit_round: Option<u32>,
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    pub fn new(
        chain_id: u64,
        parent: BlockHeader,
        validators: Arc<ActiveValidatorSet>,
        start_time: DateTime<Utc>,
        last_commit_round: Option<u32>,
    ) -> Self {
        let height = parent.height + 1;
        Self {
            height,
            round: 0,
            step: RoundStepType::NewHeight,
            start_time,
            commit_time: None,
            parent,
            votes: HeightVoteSet::new(chain_id, height, validators.clone()),
            validators,
            proposal: None,
            proposal_block_hash: None,
            proposal_block: None,
            locked: None,
            valid: None,
            commit_round: None,
            last_commit_round,
            triggered_timeout_precommit: false,
        }
    }

    pub fn proposal_block_hash_matches(&self, hash: &H256) -> bool {
        self.proposal_block
            .as_ref()
            .map_or(false, |block| block.hash() == *hash)
    }

    /// First known copy of the block with `hash`.
    pub fn find_block(&self, hash: &H256) -> Option<&ValidatedBlock> {
        [
            self.proposal_block.as_ref(),
            self.locked.as_ref().map(|locked| &locked.block),
            self.valid.as_ref().map(|valid| &valid.block),
        ]
        .into_iter()
        .flatten()
        .find(|block| block.hash() == *hash)
    }

    /// Proposal and its block are present and, for a re-proposal, the POL
    /// round holds a prevote majority.
    pub fn is_proposal_complete(&self) -> bool {
        let proposal = match (&self.proposal, &self.proposal_block) {
            (Some(proposal), Some(_)) => proposal,
            _ => return false,
        };
        match proposal.pol_round {
            None => true,
            Some(pol_round) => self
                .votes
                .prevotes(pol_round)
                .map_or(false, |prevotes| prevotes.has_two_thirds_majority()),
        }
    }

    pub fn summary(&self) -> RoundStateSummary {
        let power = |set: Option<&crate::consensus::vote_set::VoteSet>| set.map_or(0, |s| s.sum());
        RoundStateSummary {
            height: self.height,
            round: self.round,
            step: self.step,
            start_time: self.start_time,
            proposer: Some(self.validators.proposer().address),
            proposal_hash: self.proposal.as_ref().map(|p| p.hash),
            proposal_block_hash: self.proposal_block_hash,
            locked_round: self.locked.as_ref().map(|l| l.round),
            locked_hash: self.locked.as_ref().map(RoundBlock::hash),
            valid_round: self.valid.as_ref().map(|v| v.round),
            valid_hash: self.valid.as_ref().map(RoundBlock::hash),
            commit_round: self.commit_round,
            last_commit_round: self.last_commit_round,
            prevote_power: power(self.votes.prevotes(self.round)),
            precommit_power: power(self.votes.precommits(self.round)),
            total_voting_power: self.validators.total_voting_power(),
        }
    }
}

/// Read-only view of the round state published after every input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoundStateSummary {
    pub height: u64,
    pub round: u32,
    pub step: RoundStepType,
    pub start_time: DateTime<Utc>,
    pub proposer: Option<Address>,
    pub proposal_hash: Option<H256>,
    pub proposal_block_hash: Option<H256>,
    pub locked_round: Option<u32>,
    pub locked_hash: Option<H256>,
    pub valid_round: Option<u32>,
    pub valid_hash: Option<H256>,
    pub commit_round: Option<u32>,
    pub last_commit_round: Option<u32>,
    pub prevote_power: u64,
    pub precommit_power: u64,
    pub total_voting_power: u64,
}
