use crate::consensus::bit_array::BitArray;
use crate::consensus::messages::{
    ConsensusMessage, HasVoteMessage, NewRoundStepMessage, NewValidBlockMessage, ProposalPolMessage,
    VoteSetBitsMessage,
};
use crate::consensus::proposal::Proposal;
use crate::consensus::types::RoundStepType;
use crate::consensus::vote::VoteType;
use crate::types::primitives::H256;

/// What we believe a peer knows. Updated from the peer's announcements and
/// from what our gossip loops sent it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerRoundState {
    pub height: u64,
    /// `None` until the peer announced a round.
    pub round: Option<u32>,
    pub step: RoundStepType,
    pub proposal: bool,
    pub proposal_block_hash: Option<H256>,
    pub proposal_block: bool,
    pub proposal_pol_round: Option<u32>,
    pub proposal_pol: Option<BitArray>,
    pub prevotes: Option<BitArray>,
    pub precommits: Option<BitArray>,
    pub last_commit_round: Option<u32>,
    /// Precommits of a round other than the peer's, sent so it can commit.
    pub catchup_commit_round: Option<u32>,
    pub catchup_commit: Option<BitArray>,
}

impl PeerRoundState {
    fn position(&self) -> (u64, i64, RoundStepType) {
        (self.height, self.round.map_or(-1, i64::from), self.step)
    }

    pub fn apply_new_round_step(&mut self, msg: &NewRoundStepMessage) {
        if (msg.height, i64::from(msg.round), msg.step) <= self.position() {
            return;
        }

        let height_changed = msg.height != self.height;
        let round_changed = self.round != Some(msg.round);
        self.height = msg.height;
        self.round = Some(msg.round);
        self.step = msg.step;

        if height_changed || round_changed {
            self.proposal = false;
            self.proposal_block_hash = None;
            self.proposal_block = false;
            self.proposal_pol_round = None;
            self.proposal_pol = None;
            self.prevotes = None;
            self.precommits = None;
        }
        if height_changed {
            self.last_commit_round = msg.last_commit_round;
            self.catchup_commit_round = None;
            self.catchup_commit = None;
        }
    }

    pub fn apply_new_valid_block(&mut self, msg: &NewValidBlockMessage) {
        if self.height != msg.height {
            return;
        }
        if self.round != Some(msg.round) && !msg.is_commit {
            return;
        }
        if self.proposal_block_hash != Some(msg.hash) {
            self.proposal_block_hash = Some(msg.hash);
            self.proposal_block = false;
        }
    }

    pub fn set_has_proposal(&mut self, proposal: &Proposal) {
        if self.height != proposal.height || self.round != Some(proposal.round) {
            return;
        }
        if self.proposal {
            return;
        }
        self.proposal = true;
        if self.proposal_block_hash.is_none() {
            self.proposal_block_hash = Some(proposal.hash);
            self.proposal_block = false;
        }
        self.proposal_pol_round = proposal.pol_round;
        self.proposal_pol = None;
    }

    pub fn set_has_proposal_block(&mut self, height: u64, hash: &H256) {
        if self.height == height && self.proposal_block_hash == Some(*hash) {
            self.proposal_block = true;
        }
    }

    pub fn apply_proposal_pol(&mut self, msg: &ProposalPolMessage) {
        if self.height != msg.height || self.proposal_pol_round != Some(msg.pol_round) {
            return;
        }
        self.proposal_pol = Some(msg.pol.clone());
    }

    pub fn apply_has_vote(&mut self, msg: &HasVoteMessage) {
        self.set_has_vote(msg.height, msg.round, msg.vote_type, msg.index);
    }

    /// Merges the peer's claimed votes into what we already know it has.
    pub fn apply_vote_set_bits(&mut self, msg: &VoteSetBitsMessage) {
        if let Some(bits) = self.vote_bit_array(msg.height, msg.round, msg.vote_type) {
            let merged = bits.or(&msg.votes);
            bits.update(&merged);
        }
    }

    pub fn set_has_vote(&mut self, height: u64, round: u32, vote_type: VoteType, index: u32) {
        if let Some(bits) = self.vote_bit_array(height, round, vote_type) {
            bits.set_index(index as usize, true);
        }
    }

    pub fn ensure_vote_bit_arrays(&mut self, height: u64, validators: usize) {
        if self.height != height {
            return;
        }
        self.prevotes.get_or_insert_with(|| BitArray::new(validators));
        self.precommits.get_or_insert_with(|| BitArray::new(validators));
        self.proposal_pol.get_or_insert_with(|| BitArray::new(validators));
    }

    pub fn ensure_catchup_commit_round(&mut self, height: u64, round: u32, validators: usize) {
        if self.height != height || self.catchup_commit_round == Some(round) {
            return;
        }
        self.catchup_commit_round = Some(round);
        self.catchup_commit = Some(BitArray::new(validators));
    }

    pub fn vote_bit_array(&mut self, height: u64, round: u32, vote_type: VoteType) -> Option<&mut BitArray> {
        if self.height != height {
            return None;
        }
        if self.round == Some(round) {
            return match vote_type {
                VoteType::Prevote => self.prevotes.as_mut(),
                VoteType::Precommit => self.precommits.as_mut(),
            };
        }
        if vote_type == VoteType::Precommit && self.catchup_commit_round == Some(round) {
            return self.catchup_commit.as_mut();
        }
        if vote_type == VoteType::Prevote && self.proposal_pol_round == Some(round) {
            return self.proposal_pol.as_mut();
        }
        None
    }

    /// Records that we sent `message` to the peer.
    pub fn mark_sent(&mut self, message: &ConsensusMessage) {
        match message {
            ConsensusMessage::Proposal(proposal) => self.set_has_proposal(proposal),
            ConsensusMessage::ProposalBlock(block) => {
                self.set_has_proposal_block(block.height(), &block.hash())
            }
            ConsensusMessage::Vote(vote) => {
                self.set_has_vote(vote.height, vote.round, vote.vote_type, vote.index)
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(height: u64, round: u32, step: RoundStepType) -> NewRoundStepMessage {
        NewRoundStepMessage {
            height,
            round,
            step,
            seconds_since_start: 0,
            last_commit_round: None,
        }
    }

    #[test]
    fn round_step_only_moves_forward() {
        let mut prs = PeerRoundState::default();
        prs.apply_new_round_step(&step(3, 1, RoundStepType::Prevote));
        prs.apply_new_round_step(&step(3, 0, RoundStepType::Commit));
        assert_eq!((prs.height, prs.round, prs.step), (3, Some(1), RoundStepType::Prevote));
    }

    #[test]
    fn new_round_clears_round_knowledge() {
        let mut prs = PeerRoundState::default();
        prs.apply_new_round_step(&step(3, 0, RoundStepType::Propose));
        prs.set_has_proposal(&Proposal::new(3, 0, None, H256::digest(b"b"), 0));
        prs.ensure_vote_bit_arrays(3, 4);
        prs.set_has_vote(3, 0, VoteType::Prevote, 2);
        assert!(prs.proposal);
        assert!(prs.prevotes.as_ref().unwrap().get_index(2));

        prs.apply_new_round_step(&step(3, 1, RoundStepType::NewRound));
        assert!(!prs.proposal);
        assert!(prs.proposal_block_hash.is_none());
        assert!(prs.prevotes.is_none());
    }

    #[test]
    fn votes_outside_known_rounds_are_not_tracked() {
        let mut prs = PeerRoundState::default();
        prs.apply_new_round_step(&step(3, 0, RoundStepType::Prevote));
        prs.ensure_vote_bit_arrays(3, 4);
        prs.set_has_vote(3, 5, VoteType::Prevote, 1);
        prs.set_has_vote(4, 0, VoteType::Prevote, 1);
        assert_eq!(prs.prevotes.as_ref().unwrap().count(), 0);

        prs.ensure_catchup_commit_round(3, 5, 4);
        prs.set_has_vote(3, 5, VoteType::Precommit, 1);
        assert!(prs.catchup_commit.as_ref().unwrap().get_index(1));
    }

    #[test]
    fn proposal_block_is_marked_once_hash_is_known() {
        let mut prs = PeerRoundState::default();
        let hash = H256::digest(b"b");
        prs.apply_new_round_step(&step(2, 0, RoundStepType::Propose));
        prs.set_has_proposal_block(2, &hash);
        assert!(!prs.proposal_block);

        prs.apply_new_valid_block(&NewValidBlockMessage {
            height: 2,
            round: 0,
            hash,
            is_commit: false,
        });
        prs.set_has_proposal_block(2, &hash);
        assert!(prs.proposal_block);
    }

    #[test]
    fn vote_set_bits_are_merged() {
        let mut prs = PeerRoundState::default();
        prs.apply_new_round_step(&step(1, 0, RoundStepType::Prevote));
        prs.ensure_vote_bit_arrays(1, 3);
        prs.set_has_vote(1, 0, VoteType::Precommit, 0);

        let mut claimed = BitArray::new(3);
        claimed.set_index(2, true);
        prs.apply_vote_set_bits(&VoteSetBitsMessage {
            height: 1,
            round: 0,
            vote_type: VoteType::Precommit,
            hash: H256::ZERO,
            votes: claimed,
        });
        assert_eq!(prs.precommits.as_ref().unwrap().true_indices(), vec![0, 2]);
    }
}
