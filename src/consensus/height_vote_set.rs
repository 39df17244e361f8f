use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::consensus::types::PeerId;
use crate::consensus::validator_set::ActiveValidatorSet;
use crate::consensus::vote::{Vote, VoteType};
use crate::consensus::vote_set::{AddVoteResult, VoteError, VoteSet};
use crate::types::primitives::H256;

/// A peer may open at most this many rounds beyond our own.
pub const MAX_PEER_CATCHUP_ROUNDS: usize = 2;

#[derive(Debug, Clone)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// Prevote and precommit sets for every round of one height.
#[derive(Debug, Clone)]
pub struct HeightVoteSet {
    chain_id: u64,
    height: u64,
    validators: Arc<ActiveValidatorSet>,
    round: u32,
    round_vote_sets: BTreeMap<u32, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerId, Vec<u32>>,
}

impl HeightVoteSet {
    pub fn new(chain_id: u64, height: u64, validators: Arc<ActiveValidatorSet>) -> Self {
        let mut set = Self {
            chain_id,
            height,
            validators,
            round: 0,
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        set.add_round(0);
        set
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Moves the round cursor forward, creating every missing round up to `round`.
    pub fn set_round(&mut self, round: u32) -> Result<(), VoteError> {
        if round < self.round {
            return Err(VoteError::RoundRegression {
                current: self.round,
                requested: round,
            });
        }
        for r in 0..=round {
            if !self.round_vote_sets.contains_key(&r) {
                self.add_round(r);
            }
        }
        self.round = round;
        Ok(())
    }

    fn add_round(&mut self, round: u32) {
        let prevotes = VoteSet::new(
            self.chain_id,
            self.height,
            round,
            VoteType::Prevote,
            self.validators.clone(),
        );
        let precommits = VoteSet::new(
            self.chain_id,
            self.height,
            round,
            VoteType::Precommit,
            self.validators.clone(),
        );
        self.round_vote_sets.insert(round, RoundVoteSet { prevotes, precommits });
    }

    /// `peer` is `None` for our own votes.
    pub fn add_vote(&mut self, vote: Vote, peer: Option<&PeerId>) -> Result<AddVoteResult, VoteError> {
        if !self.round_vote_sets.contains_key(&vote.round) {
            if let Some(peer) = peer {
                let rounds = self.peer_catchup_rounds.entry(peer.clone()).or_default();
                if rounds.len() >= MAX_PEER_CATCHUP_ROUNDS {
                    return Err(VoteError::UnwantedRound {
                        peer: peer.clone(),
                        round: vote.round,
                    });
                }
                rounds.push(vote.round);
            }
            self.add_round(vote.round);
        }

        match self.vote_set_mut(vote.round, vote.vote_type) {
            Some(vote_set) => vote_set.add_vote(vote),
            None => Err(VoteError::UnexpectedVote {
                height: vote.height,
                round: vote.round,
                vote_type: vote.vote_type,
            }),
        }
    }

    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Prevote)
    }

    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Precommit)
    }

    pub fn vote_set(&self, round: u32, vote_type: VoteType) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|set| match vote_type {
            VoteType::Prevote => &set.prevotes,
            VoteType::Precommit => &set.precommits,
        })
    }

    fn vote_set_mut(&mut self, round: u32, vote_type: VoteType) -> Option<&mut VoteSet> {
        self.round_vote_sets.get_mut(&round).map(|set| match vote_type {
            VoteType::Prevote => &mut set.prevotes,
            VoteType::Precommit => &mut set.precommits,
        })
    }

    /// Highest round up to the cursor holding a two-thirds prevote majority,
    /// nil included.
    pub fn pol_info(&self) -> Option<(u32, H256)> {
        self.round_vote_sets
            .range(..=self.round)
            .rev()
            .find_map(|(round, set)| set.prevotes.maj23().map(|hash| (*round, hash)))
    }

    /// Ignored when the round is unknown.
    pub fn set_peer_maj23(
        &mut self,
        round: u32,
        vote_type: VoteType,
        peer: PeerId,
        hash: H256,
    ) -> Result<(), VoteError> {
        match self.vote_set_mut(round, vote_type) {
            Some(vote_set) => vote_set.set_peer_maj23(peer, hash),
            None => Ok(()),
        }
    }
}
