use crate::consensus::messages::{ConsensusMessage, ProposalPolMessage};
use crate::consensus::protocol::PeerRoundState;
use crate::consensus::state::message::{GossipKind, GossipReply};
use crate::consensus::state::StateMachine;
use crate::consensus::types::RoundStepType;
use crate::consensus::vote::Vote;
use crate::consensus::vote_set::VoteSet;

impl StateMachine {
    pub(super) fn gossip(&self, kind: GossipKind, prs: &PeerRoundState) -> GossipReply {
        let mut reply = GossipReply {
            height: self.rs.height,
            validator_count: self.rs.validators.len(),
            ..GossipReply::default()
        };
        // peers on other heights are left to block sync
        if prs.height != self.rs.height {
            return reply;
        }
        match kind {
            GossipKind::Data => self.gossip_data(prs, &mut reply),
            GossipKind::Votes => self.gossip_votes(prs, &mut reply),
        }
        reply
    }

    fn gossip_data(&self, prs: &PeerRoundState, reply: &mut GossipReply) {
        let rs = &self.rs;
        let mut wanted = prs.proposal_block_hash;

        if let Some(proposal) = &rs.proposal {
            if prs.round == Some(rs.round) && !prs.proposal {
                reply.messages.push(ConsensusMessage::Proposal(proposal.clone()));
                if let Some(pol_round) = proposal.pol_round {
                    let pol = rs
                        .votes
                        .prevotes(pol_round)
                        .and_then(|prevotes| prevotes.bit_array_by_block_hash(&proposal.hash));
                    if let Some(pol) = pol {
                        reply.messages.push(ConsensusMessage::ProposalPol(ProposalPolMessage {
                            height: rs.height,
                            pol_round,
                            pol: pol.clone(),
                        }));
                    }
                }
                wanted = wanted.or(Some(proposal.hash));
            }
        }

        if let Some(hash) = wanted {
            if !prs.proposal_block {
                if let Some(block) = rs.find_block(&hash) {
                    reply
                        .messages
                        .push(ConsensusMessage::ProposalBlock(Box::new((*block.block).clone())));
                }
            }
        }
    }

    fn gossip_votes(&self, prs: &PeerRoundState, reply: &mut GossipReply) {
        let rs = &self.rs;
        let mut prs = prs.clone();
        prs.ensure_vote_bit_arrays(rs.height, rs.validators.len());

        // a committed peer round it has not reached gets our commit precommits
        if rs.step == RoundStepType::Commit {
            if let Some(commit_round) = rs.commit_round {
                if prs.round != Some(commit_round) {
                    prs.ensure_catchup_commit_round(rs.height, commit_round, rs.validators.len());
                    if let Some(vote) = rs
                        .votes
                        .precommits(commit_round)
                        .and_then(|set| pick_vote_to_send(set, &mut prs))
                    {
                        reply.catchup_commit_round = Some(commit_round);
                        reply.messages.push(ConsensusMessage::Vote(vote));
                        return;
                    }
                }
            }
        }

        let peer_round = match prs.round {
            Some(round) if round <= rs.round => round,
            _ => return,
        };

        let mut candidates: Vec<&VoteSet> = Vec::new();
        if prs.step <= RoundStepType::Propose {
            if let Some(set) = prs.proposal_pol_round.and_then(|r| rs.votes.prevotes(r)) {
                candidates.push(set);
            }
        }
        if prs.step <= RoundStepType::PrevoteWait {
            candidates.extend(rs.votes.prevotes(peer_round));
        }
        if prs.step <= RoundStepType::PrecommitWait {
            candidates.extend(rs.votes.precommits(peer_round));
        }
        candidates.extend(rs.votes.prevotes(peer_round));
        if let Some(set) = prs.proposal_pol_round.and_then(|r| rs.votes.prevotes(r)) {
            candidates.push(set);
        }

        for set in candidates {
            if let Some(vote) = pick_vote_to_send(set, &mut prs) {
                reply.messages.push(ConsensusMessage::Vote(vote));
                return;
            }
        }
    }
}

/// A random vote from `set` the peer is not known to have.
fn pick_vote_to_send(set: &VoteSet, prs: &mut PeerRoundState) -> Option<Vote> {
    let peer_votes = prs.vote_bit_array(set.height(), set.round(), set.vote_type())?;
    let index = set.bit_array().sub(peer_votes).pick_random()?;
    set.get_by_index(index).cloned()
}
