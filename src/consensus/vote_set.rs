use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::consensus::bit_array::BitArray;
use crate::consensus::types::PeerId;
use crate::consensus::validator_set::ActiveValidatorSet;
use crate::consensus::vote::{Vote, VoteType};
use crate::types::primitives::{Address, H256};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VoteError {
    #[error("Unexpected vote {vote_type} at {height}/{round}")]
    UnexpectedVote {
        height: u64,
        round: u32,
        vote_type: VoteType,
    },
    #[error("Vote for foreign chain {0}")]
    WrongChain(u64),
    #[error("Invalid validator index: {0}")]
    InvalidIndex(u32),
    #[error("Vote is not signed")]
    MissingSignature,
    #[error("Validator {0} has no alternate key")]
    MissingAlternateKey(Address),
    #[error("Invalid signature from {0}")]
    InvalidSignature(Address),
    #[error("Different signature for an identical vote from index {0}")]
    NonDeterministicSignature(u32),
    #[error("Peer {peer} sent a vote from unwanted round {round}")]
    UnwantedRound { peer: PeerId, round: u32 },
    #[error("Peer {0} claimed two different majorities")]
    ConflictingPeerMaj23(PeerId),
    #[error("Round cannot move back from {current} to {requested}")]
    RoundRegression { current: u32, requested: u32 },
}

/// Outcome of a vote that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddVoteResult {
    Added,
    /// Identical vote already present.
    Duplicate,
    /// The validator already voted for another hash. `counted` is true when
    /// the new vote still went into the per-block tally because a peer
    /// claimed a majority for its hash.
    Conflicting { existing: Vote, counted: bool },
}

/// Weighted quorum: more than two thirds of the total power.
pub fn quorum_threshold(total_voting_power: u64) -> u64 {
    ((total_voting_power as u128 * 2 / 3) as u64) + 1
}

#[derive(Debug, Clone)]
struct BlockVotes {
    peer_maj23: bool,
    bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: u64,
}

impl BlockVotes {
    fn new(peer_maj23: bool, size: usize) -> Self {
        Self {
            peer_maj23,
            bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
        }
    }

    fn add_verified_vote(&mut self, vote: Vote, power: u64) {
        let index = vote.index as usize;
        if self.votes[index].is_none() {
            self.bit_array.set_index(index, true);
            self.votes[index] = Some(vote);
            self.sum += power;
        }
    }
}

/// Votes of one (height, round, type).
#[derive(Debug, Clone)]
pub struct VoteSet {
    chain_id: u64,
    height: u64,
    round: u32,
    vote_type: VoteType,
    validators: Arc<ActiveValidatorSet>,
    votes_bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: u64,
    maj23: Option<H256>,
    votes_by_block: HashMap<H256, BlockVotes>,
    peer_maj23s: HashMap<PeerId, H256>,
}

impl VoteSet {
    pub fn new(
        chain_id: u64,
        height: u64,
        round: u32,
        vote_type: VoteType,
        validators: Arc<ActiveValidatorSet>,
    ) -> Self {
        let size = validators.len();
        Self {
            chain_id,
            height,
            round,
            vote_type,
            validators,
            votes_bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
            maj23: None,
            votes_by_block: HashMap::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn validators(&self) -> &ActiveValidatorSet {
        &self.validators
    }

    pub fn add_vote(&mut self, vote: Vote) -> Result<AddVoteResult, VoteError> {
        if vote.height != self.height || vote.round != self.round || vote.vote_type != self.vote_type {
            return Err(VoteError::UnexpectedVote {
                height: vote.height,
                round: vote.round,
                vote_type: vote.vote_type,
            });
        }
        if vote.chain_id != self.chain_id {
            return Err(VoteError::WrongChain(vote.chain_id));
        }

        if let Some(existing) = self.get_vote(vote.index as usize, &vote.hash) {
            if existing.signature == vote.signature {
                return Ok(AddVoteResult::Duplicate);
            }
            return Err(VoteError::NonDeterministicSignature(vote.index));
        }

        let power = vote.validate_signature(&self.validators)?.voting_power;
        Ok(self.add_verified_vote(vote, power))
    }

    fn add_verified_vote(&mut self, vote: Vote, power: u64) -> AddVoteResult {
        let index = vote.index as usize;
        let hash = vote.hash;

        let conflicting = self.votes[index].clone();
        match &conflicting {
            Some(_) => {
                // replace the canonical record only for the majority hash
                if self.maj23 == Some(hash) {
                    self.votes[index] = Some(vote.clone());
                    self.votes_bit_array.set_index(index, true);
                }
            }
            None => {
                self.votes[index] = Some(vote.clone());
                self.votes_bit_array.set_index(index, true);
                self.sum += power;
            }
        }

        if let Some(existing) = &conflicting {
            let claimed = self
                .votes_by_block
                .get(&hash)
                .map_or(false, |block_votes| block_votes.peer_maj23);
            if !claimed {
                return AddVoteResult::Conflicting {
                    existing: existing.clone(),
                    counted: false,
                };
            }
        }

        let quorum = self.quorum();
        let size = self.size();
        let block_votes = self
            .votes_by_block
            .entry(hash)
            .or_insert_with(|| BlockVotes::new(false, size));
        let before = block_votes.sum;
        block_votes.add_verified_vote(vote, power);

        if before < quorum && quorum <= block_votes.sum && self.maj23.is_none() {
            let backfill: Vec<(usize, Vote)> = block_votes
                .votes
                .iter()
                .enumerate()
                .filter_map(|(i, vote)| vote.clone().map(|vote| (i, vote)))
                .collect();
            self.maj23 = Some(hash);
            for (i, vote) in backfill {
                self.votes[i] = Some(vote);
                self.votes_bit_array.set_index(i, true);
            }
        }

        match conflicting {
            Some(existing) => AddVoteResult::Conflicting {
                existing,
                counted: true,
            },
            None => AddVoteResult::Added,
        }
    }

    /// Records that `peer` claims a two-thirds majority for `hash`, so
    /// conflicting votes for it are still tallied.
    pub fn set_peer_maj23(&mut self, peer: PeerId, hash: H256) -> Result<(), VoteError> {
        if let Some(existing) = self.peer_maj23s.get(&peer) {
            if *existing == hash {
                return Ok(());
            }
            return Err(VoteError::ConflictingPeerMaj23(peer));
        }
        self.peer_maj23s.insert(peer, hash);

        let size = self.size();
        self.votes_by_block
            .entry(hash)
            .and_modify(|block_votes| block_votes.peer_maj23 = true)
            .or_insert_with(|| BlockVotes::new(true, size));
        Ok(())
    }

    pub fn get_vote(&self, index: usize, hash: &H256) -> Option<&Vote> {
        if let Some(Some(vote)) = self.votes.get(index) {
            if vote.hash == *hash {
                return Some(vote);
            }
        }
        self.votes_by_block
            .get(hash)
            .and_then(|block_votes| block_votes.votes.get(index))
            .and_then(Option::as_ref)
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index).and_then(Option::as_ref)
    }

    pub fn bit_array(&self) -> &BitArray {
        &self.votes_bit_array
    }

    pub fn bit_array_by_block_hash(&self, hash: &H256) -> Option<&BitArray> {
        self.votes_by_block
            .get(hash)
            .map(|block_votes| &block_votes.bit_array)
    }

    /// Votes for `hash` ordered by validator index.
    pub fn votes_for_block(&self, hash: &H256) -> Vec<Vote> {
        self.votes_by_block
            .get(hash)
            .map(|block_votes| block_votes.votes.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn quorum(&self) -> u64 {
        quorum_threshold(self.validators.total_voting_power())
    }

    /// Latched the first time a hash crosses the quorum; never changes after.
    pub fn maj23(&self) -> Option<H256> {
        self.maj23
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    pub fn has_two_thirds_any(&self) -> bool {
        self.sum >= self.quorum()
    }

    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_voting_power()
    }
}
