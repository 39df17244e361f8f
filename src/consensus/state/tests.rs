use super::*;
use crate::consensus::evpool::Evidence;
use crate::consensus::protocol::PeerRoundState;
use crate::consensus::test_utils::{self, signed_vote, validator_set, RecordingBackend, CHAIN_ID};
use crate::types::transaction::Transaction;
use std::time::Duration;

struct Harness {
    machine: StateMachine,
    rx: mpsc::Receiver<StateMachineMessage>,
    backend: Arc<RecordingBackend>,
    signers: Vec<Signer>,
    own: u32,
    status: watch::Receiver<RoundStateSummary>,
}

/// `n` equally weighted validators; the machine signs as validator `own`.
fn harness(n: usize, own: usize) -> Harness {
    harness_with(n, own, ConsensusConfig::default())
}

fn harness_with(n: usize, own: usize, config: ConsensusConfig) -> Harness {
    let signers = test_utils::signers(n);
    let own_signer = Arc::new(test_utils::signers(n).remove(own));
    let validators = validator_set(&signers, &vec![1; n]);
    let parent = BlockHeader::genesis(Utc::now());
    let pending = PendingBlock::new(&parent, own_signer.address(), Utc::now());
    let (tx, rx) = mpsc::channel(64);
    let backend = Arc::new(RecordingBackend::default());
    let (machine, status) = StateMachine::new(
        Arc::new(config),
        CHAIN_ID,
        backend.clone(),
        own_signer,
        StateMachineHandle::new(tx),
        parent,
        validators,
        pending,
    );
    Harness {
        machine,
        rx,
        backend,
        signers,
        own: own as u32,
        status,
    }
}

fn test_block(parent: &BlockHeader, tag: &[u8]) -> ValidatedBlock {
    let mut pending = PendingBlock::new(parent, Default::default(), Utc::now());
    pending
        .append_transactions(vec![Transaction::new("alice".to_string(), 0, tag.to_vec())])
        .unwrap();
    pending.complete(Vec::new()).unwrap();
    let result = ProcessResult {
        state_root: H256::digest(tag),
        receipts_root: H256::ZERO,
    };
    pending.finalize(result.state_root, result.receipts_root).unwrap();
    ValidatedBlock::new(pending.into_block().unwrap(), result)
}

impl Harness {
    fn timeout(&mut self, height: u64, round: u32, step: RoundStepType) {
        self.machine
            .process(StateMachineMessage::Timeout(TimeoutInfo::new(Duration::ZERO, height, round, step)));
    }

    fn peer_vote(&mut self, index: usize, vote_type: VoteType, round: u32, hash: H256) {
        let vote = signed_vote(&self.signers[index], index as u32, vote_type, 1, round, hash);
        self.from_peer(index, ConsensusMessage::Vote(vote));
    }

    fn from_peer(&mut self, index: usize, message: ConsensusMessage) {
        self.machine.process(StateMachineMessage::Consensus {
            peer: Some(PeerId::new(format!("peer{}", index))),
            message,
        });
    }

    /// Next queued message of `kind`; anything else is dropped.
    async fn next_of(&mut self, kind: &str) -> StateMachineMessage {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("no message within 5s")
                .expect("queue closed");
            if message.kind() == kind {
                return message;
            }
        }
    }

    fn own_votes(&self, vote_type: VoteType) -> Vec<Vote> {
        self.backend
            .sent_votes()
            .into_iter()
            .filter(|vote| vote.index == self.own && vote.vote_type == vote_type)
            .collect()
    }

    fn enter_round(&mut self, round: u32, step: RoundStepType) {
        self.machine.rs.round = round;
        self.machine.rs.votes.set_round(round + 1).unwrap();
        self.machine.rs.step = step;
    }
}

/// Index of the validator proposing `round` of height 1 in an equal-power set of `n`.
fn proposer_of(n: usize, round: u32) -> usize {
    let signers = test_utils::signers(n);
    let address = validator_set(&signers, &vec![1; n])
        .copy_increment_proposer_priority(round)
        .proposer()
        .address;
    signers
        .iter()
        .position(|s| s.address() == address)
        .expect("proposer is a member")
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn single_validator_commits_with_verifiable_proof() {
    let mut h = harness(1, 0);
    h.timeout(1, 0, RoundStepType::NewHeight);
    assert_eq!(h.status.borrow().step, RoundStepType::Propose);

    let built = h.next_of("proposal_block_built").await;
    h.machine.process(built);
    assert_eq!(h.machine.rs.step, RoundStepType::Commit);
    assert_eq!(h.machine.rs.commit_round, Some(0));

    let finished = h.next_of("commit_finished").await;
    h.machine.process(finished);

    let committed = h.backend.committed.lock().clone();
    assert_eq!(committed.len(), 1);
    let block = &committed[0];
    assert_eq!(block.height(), 1);
    assert_eq!(Some(block.hash()), h.machine.rs.locked.as_ref().map(RoundBlock::hash));

    let validators = validator_set(&h.signers, &[1]);
    let extra = ExtraData::verify(CHAIN_ID, &block.header, &validators).unwrap();
    assert_eq!(extra.commit_round, 0);
    assert_eq!(extra.precommits.signatures.len(), 1);
    assert_eq!(extra.proposal.map(|p| p.hash), Some(block.hash()));
}

#[tokio::test]
async fn later_polka_for_other_block_unlocks_and_precommits_nil() {
    let mut h = harness(4, 0);
    let locked = test_block(&h.machine.rs.parent, b"x");
    let other = test_block(&h.machine.rs.parent, b"y").hash();
    h.enter_round(3, RoundStepType::Prevote);
    h.machine.rs.locked = Some(RoundBlock {
        round: 2,
        block: locked,
    });

    for index in 1..=3 {
        h.peer_vote(index, VoteType::Prevote, 3, other);
    }
    assert!(h.machine.rs.locked.is_none());
    assert_eq!(h.machine.rs.step, RoundStepType::PrevoteWait);
    assert_eq!(h.machine.rs.proposal_block_hash, Some(other));

    h.timeout(1, 3, RoundStepType::PrevoteWait);
    let precommits = h.own_votes(VoteType::Precommit);
    assert_eq!(precommits.len(), 1);
    assert_eq!(precommits[0].round, 3);
    assert!(precommits[0].is_nil());
}

#[tokio::test]
async fn later_polka_for_locked_block_relocks() {
    let mut h = harness(4, 0);
    let locked = test_block(&h.machine.rs.parent, b"x");
    let hash = locked.hash();
    h.enter_round(3, RoundStepType::Prevote);
    h.machine.rs.locked = Some(RoundBlock {
        round: 2,
        block: locked,
    });

    for index in 1..=3 {
        h.peer_vote(index, VoteType::Prevote, 3, hash);
    }
    h.timeout(1, 3, RoundStepType::PrevoteWait);

    assert_eq!(h.machine.rs.locked.as_ref().map(|l| l.round), Some(3));
    let precommits = h.own_votes(VoteType::Precommit);
    assert_eq!(precommits.len(), 1);
    assert_eq!(precommits[0].hash, hash);
}

#[tokio::test]
async fn assembled_hash_mismatch_is_never_committed() {
    let mut h = harness(4, 0);
    let committed = test_block(&h.machine.rs.parent, b"x");
    let hash = committed.hash();
    for index in 1..=3 {
        h.peer_vote(index, VoteType::Precommit, 0, hash);
    }
    assert_eq!(h.machine.rs.step, RoundStepType::Commit);
    assert_eq!(h.machine.rs.proposal_block_hash, Some(hash));
    assert!(h
        .backend
        .sent("new_valid_block")
        .iter()
        .any(|(m, _)| matches!(m, ConsensusMessage::NewValidBlock(v) if v.is_commit && v.hash == hash)));

    h.machine.rs.proposal_block = Some(test_block(&h.machine.rs.parent, b"y"));
    h.machine.try_finalize_commit(1).unwrap();
    h.machine.finalize_commit(1).unwrap();
    assert!(!h.machine.finalize_dispatched);
    settle().await;
    assert!(h.backend.committed.lock().is_empty());

    // the right block still completes the height
    h.machine.rs.proposal_block = None;
    h.from_peer(1, ConsensusMessage::ProposalBlock(Box::new((*committed.block).clone())));
    let validated = h.next_of("proposal_block_validated").await;
    h.machine.process(validated);
    let finished = h.next_of("commit_finished").await;
    h.machine.process(finished);
    assert_eq!(h.backend.committed.lock().len(), 1);
    assert_eq!(h.backend.committed.lock()[0].hash(), hash);
}

#[tokio::test]
async fn equivocation_becomes_evidence() {
    let mut h = harness(4, 0);
    h.peer_vote(2, VoteType::Prevote, 0, H256::digest(b"a"));
    h.peer_vote(2, VoteType::Prevote, 0, H256::digest(b"b"));
    settle().await;

    let evidence = h.backend.evidence.lock().clone();
    assert_eq!(evidence.len(), 1);
    match &evidence[0] {
        Evidence::DuplicateVote(dup) => {
            assert_eq!(dup.validator_index(), 2);
            assert_eq!(dup.height(), 1);
        }
    }
}

#[tokio::test]
async fn own_equivocation_is_not_reported() {
    let mut h = harness(4, 0);
    h.peer_vote(0, VoteType::Prevote, 0, H256::digest(b"a"));
    h.peer_vote(0, VoteType::Prevote, 0, H256::digest(b"b"));
    settle().await;
    assert!(h.backend.evidence.lock().is_empty());
}

#[tokio::test]
async fn stale_timeouts_are_ignored() {
    let mut h = harness(4, 1);
    h.timeout(1, 0, RoundStepType::NewHeight);
    let step = h.machine.rs.step;
    assert_eq!(step, RoundStepType::Propose);

    h.timeout(0, 5, RoundStepType::Propose);
    h.timeout(1, 0, RoundStepType::NewHeight);
    assert_eq!(h.machine.rs.step, step);
    assert!(h.own_votes(VoteType::Prevote).is_empty());

    h.timeout(1, 0, RoundStepType::Propose);
    assert_eq!(h.machine.rs.step, RoundStepType::Prevote);
}

#[tokio::test]
async fn two_thirds_of_a_later_round_skips_ahead() {
    let mut h = harness(4, 0);
    h.timeout(1, 0, RoundStepType::NewHeight);
    h.peer_vote(1, VoteType::Prevote, 2, H256::digest(b"a"));
    h.peer_vote(2, VoteType::Prevote, 2, H256::digest(b"b"));
    assert_eq!(h.machine.rs.round, 0);

    h.peer_vote(3, VoteType::Prevote, 2, H256::ZERO);
    assert_eq!(h.machine.rs.round, 2);
    assert_eq!(h.status.borrow().round, 2);
}

#[tokio::test]
async fn vote_set_maj23_is_answered_with_bits() {
    let mut h = harness(4, 0);
    let hash = H256::digest(b"a");
    h.peer_vote(1, VoteType::Prevote, 0, hash);
    h.from_peer(
        3,
        ConsensusMessage::VoteSetMaj23(VoteSetMaj23Message {
            height: 1,
            round: 0,
            vote_type: VoteType::Prevote,
            hash,
        }),
    );

    let replies = h.backend.sent("vote_set_bits");
    assert_eq!(replies.len(), 1);
    match &replies[0] {
        (ConsensusMessage::VoteSetBits(bits), BroadcastTarget::To(peer)) => {
            assert_eq!(peer, &PeerId::new("peer3"));
            assert_eq!(bits.votes.true_indices(), vec![1]);
        }
        other => panic!("unexpected reply {:?}", other),
    }
}

#[tokio::test]
async fn wrong_vote_version_is_rejected() {
    let mut h = harness(4, 0);
    let mut vote = Vote::new(
        CHAIN_ID,
        VoteType::Prevote,
        1,
        0,
        H256::digest(b"a"),
        1,
        crate::consensus::vote::VoteVersion::Batched,
    );
    vote.sign(&h.signers[1]).unwrap();
    h.from_peer(1, ConsensusMessage::Vote(vote));
    assert_eq!(h.machine.rs.votes.prevotes(0).map(VoteSet::sum), Some(0));
}

#[tokio::test]
async fn later_round_majority_does_not_reopen_a_decided_height() {
    let mut h = harness(4, 0);
    let block = test_block(&h.machine.rs.parent, b"x");
    let hash = block.hash();
    h.enter_round(0, RoundStepType::Prevote);
    h.machine.rs.proposal_block_hash = Some(hash);
    h.machine.rs.proposal_block = Some(block);

    for index in 1..=3 {
        h.peer_vote(index, VoteType::Prevote, 0, hash);
    }
    h.timeout(1, 0, RoundStepType::PrevoteWait);
    assert_eq!(h.machine.rs.locked.as_ref().map(RoundBlock::hash), Some(hash));

    h.peer_vote(1, VoteType::Precommit, 0, hash);
    h.peer_vote(2, VoteType::Precommit, 0, hash);
    assert_eq!(h.machine.rs.step, RoundStepType::Commit);
    assert_eq!(h.machine.rs.commit_round, Some(0));

    for index in 1..=3 {
        h.peer_vote(index, VoteType::Precommit, 1, hash);
    }
    assert_eq!(h.machine.rs.step, RoundStepType::Commit);
    assert_eq!(h.machine.rs.commit_round, Some(0));
    assert_eq!(h.machine.rs.round, 0);

    let precommits = h.own_votes(VoteType::Precommit);
    assert_eq!(precommits.len(), 1);
    assert_eq!((precommits[0].round, precommits[0].hash), (0, hash));
}

#[tokio::test]
async fn valid_block_is_reproposed_with_its_round() {
    let own = proposer_of(4, 2);
    let mut h = harness(4, own);
    let block = test_block(&h.machine.rs.parent, b"x");
    let hash = block.hash();
    h.enter_round(1, RoundStepType::PrecommitWait);
    let at_round_one = h.machine.rs.validators.copy_increment_proposer_priority(1);
    h.machine.rs.validators = Arc::new(at_round_one);
    h.machine.rs.valid = Some(RoundBlock { round: 1, block });

    h.timeout(1, 1, RoundStepType::PrecommitWait);
    assert_eq!(h.machine.rs.round, 2);

    let proposals = h.backend.sent("proposal");
    assert_eq!(proposals.len(), 1);
    match &proposals[0] {
        (ConsensusMessage::Proposal(proposal), BroadcastTarget::All) => {
            assert_eq!(proposal.round, 2);
            assert_eq!(proposal.pol_round, Some(1));
            assert_eq!(proposal.hash, hash);
        }
        other => panic!("unexpected broadcast {:?}", other),
    }
    let blocks = h.backend.sent("proposal_block");
    assert!(blocks
        .iter()
        .any(|(m, _)| matches!(m, ConsensusMessage::ProposalBlock(b) if b.hash() == hash)));
}

#[tokio::test]
async fn polka_for_held_proposal_block_becomes_valid() {
    let mut h = harness(4, 0);
    let block = test_block(&h.machine.rs.parent, b"x");
    let hash = block.hash();
    h.enter_round(0, RoundStepType::Prevote);
    h.machine.rs.proposal_block_hash = Some(hash);
    h.machine.rs.proposal_block = Some(block);
    assert!(h.machine.rs.valid.is_none());

    for index in 1..=3 {
        h.peer_vote(index, VoteType::Prevote, 0, hash);
    }
    let valid = h.machine.rs.valid.as_ref().map(|v| (v.round, v.hash()));
    assert_eq!(valid, Some((0, hash)));
    assert!(h
        .backend
        .sent("new_valid_block")
        .iter()
        .any(|(m, _)| matches!(m, ConsensusMessage::NewValidBlock(v) if !v.is_commit && v.hash == hash)));
}

#[tokio::test]
async fn empty_round_zero_waits_before_proposing() {
    let own = proposer_of(4, 0);
    let config = ConsensusConfig {
        create_empty_blocks_interval_ms: 50,
        ..ConsensusConfig::default()
    };
    let mut h = harness_with(4, own, config);
    h.timeout(1, 0, RoundStepType::NewHeight);
    assert_eq!(h.machine.rs.step, RoundStepType::NewRound);
    settle().await;
    assert!(h.rx.try_recv().is_err());

    let fired = h.next_of("timeout").await;
    match &fired {
        StateMachineMessage::Timeout(ti) => {
            assert_eq!((ti.height, ti.round, ti.step), (1, 0, RoundStepType::NewRound))
        }
        other => panic!("unexpected message {}", other.kind()),
    }
    h.machine.process(fired);
    assert_eq!(h.machine.rs.step, RoundStepType::Propose);
    let built = h.next_of("proposal_block_built").await;
    h.machine.process(built);
    assert_eq!(h.backend.sent("proposal").len(), 1);
}

#[tokio::test]
async fn proposal_pol_lists_only_voters_for_the_proposed_block() {
    let mut h = harness(4, 0);
    let hash = H256::digest(b"x");
    h.peer_vote(1, VoteType::Prevote, 0, hash);
    h.peer_vote(2, VoteType::Prevote, 0, hash);
    h.peer_vote(3, VoteType::Prevote, 0, H256::ZERO);

    h.enter_round(1, RoundStepType::Propose);
    h.machine.rs.proposal = Some(Proposal::new(1, 1, Some(0), hash, 0));
    let prs = PeerRoundState {
        height: 1,
        round: Some(1),
        step: RoundStepType::Propose,
        ..PeerRoundState::default()
    };

    let reply = h.machine.gossip(GossipKind::Data, &prs);
    let pol = reply.messages.iter().find_map(|m| match m {
        ConsensusMessage::ProposalPol(pol) => Some(pol),
        _ => None,
    });
    let pol = pol.expect("proposal pol is gossiped");
    assert_eq!(pol.pol_round, 0);
    assert_eq!(pol.pol.true_indices(), vec![1, 2]);
}
