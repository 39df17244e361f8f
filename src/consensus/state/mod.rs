//! The Reimint state machine.
//!
//! One task owns the [`RoundState`] and consumes a single queue of peer
//! messages, timeouts and results of spawned backend calls. Our own
//! proposals and votes go through an internal FIFO drained after every
//! input, so they follow exactly the path a peer's message would.

mod gossip;
mod message;
mod round_state;

pub use message::{GossipKind, GossipReply, StateMachineHandle, StateMachineMessage};
pub use round_state::{RoundBlock, RoundState, RoundStateSummary, ValidatedBlock};

use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::ConsensusConfig;
use crate::consensus::backend::{Backend, BackendError, BroadcastTarget, ProcessResult};
use crate::consensus::bit_array::BitArray;
use crate::consensus::evpool::DuplicateVoteEvidence;
use crate::consensus::extra_data::ExtraData;
use crate::consensus::messages::{
    ConsensusMessage, HasVoteMessage, NewRoundStepMessage, NewValidBlockMessage, VoteSetBitsMessage,
    VoteSetMaj23Message,
};
use crate::consensus::pending_block::PendingBlock;
use crate::consensus::proposal::Proposal;
use crate::consensus::timeout_ticker::{TimeoutInfo, TimeoutTicker};
use crate::consensus::types::{PeerId, RoundStepType};
use crate::consensus::validator_set::ActiveValidatorSet;
use crate::consensus::vote::{Vote, VoteType};
use crate::consensus::vote_set::{AddVoteResult, VoteSet};
use crate::consensus::ConsensusError;
use crate::metrics;
use crate::security::Signer;
use crate::types::block::{Block, BlockHeader};
use crate::types::primitives::H256;

pub struct StateMachine {
    config: Arc<ConsensusConfig>,
    chain_id: u64,
    backend: Arc<dyn Backend>,
    signer: Arc<Signer>,
    handle: StateMachineHandle,
    ticker: TimeoutTicker,
    rs: RoundState,
    pending_block: PendingBlock,
    /// Our own proposal block, kept until the matching proposal is set.
    built_block: Option<ValidatedBlock>,
    /// Hash of the block currently in `pre_process_block`.
    validating: Option<H256>,
    finalize_dispatched: bool,
    internal: VecDeque<ConsensusMessage>,
    status: watch::Sender<RoundStateSummary>,
}

impl StateMachine {
    /// Starts at the height after `parent`. Nothing happens until [`run`]
    /// schedules the first round.
    ///
    /// [`run`]: StateMachine::run
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConsensusConfig>,
        chain_id: u64,
        backend: Arc<dyn Backend>,
        signer: Arc<Signer>,
        handle: StateMachineHandle,
        parent: BlockHeader,
        validators: ActiveValidatorSet,
        pending_block: PendingBlock,
    ) -> (Self, watch::Receiver<RoundStateSummary>) {
        let rs = RoundState::new(chain_id, parent, Arc::new(validators), Utc::now(), None);
        let (status, status_rx) = watch::channel(rs.summary());
        let machine = Self {
            config,
            chain_id,
            backend,
            signer,
            ticker: TimeoutTicker::new(handle.clone()),
            handle,
            rs,
            pending_block,
            built_block: None,
            validating: None,
            finalize_dispatched: false,
            internal: VecDeque::new(),
            status,
        };
        (machine, status_rx)
    }

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<StateMachineMessage>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        info!(
            "Consensus state machine started at height {} as {}",
            self.rs.height,
            self.signer.address()
        );
        self.schedule_round_zero();

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                message = rx.recv() => match message {
                    Some(message) => self.process(message),
                    None => break,
                },
            }
        }

        self.ticker.stop();
        rx.close();
        let mut discarded = 0usize;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        info!(
            "Consensus state machine stopped at {}/{}, discarded {} queued messages",
            self.rs.height, self.rs.round, discarded
        );
    }

    /// Handles one input, then everything it queued internally.
    pub fn process(&mut self, message: StateMachineMessage) {
        let kind = message.kind();
        if let Err(e) = self.handle_message(message) {
            log_error(kind, &e);
        }
        while let Some(own) = self.internal.pop_front() {
            let kind = own.kind();
            if let Err(e) = self.handle_consensus_message(None, own) {
                log_error(kind, &e);
            }
        }
        self.publish_status();
    }

    fn handle_message(&mut self, message: StateMachineMessage) -> Result<(), ConsensusError> {
        match message {
            StateMachineMessage::Consensus { peer, message } => self.handle_consensus_message(peer, message),
            StateMachineMessage::Timeout(ti) => self.handle_timeout(ti),
            StateMachineMessage::NewBlockHeader {
                parent,
                validators,
                pending_block,
            } => self.handle_new_block_header(parent, validators, pending_block),
            StateMachineMessage::ProposalBlockBuilt { height, round, result } => {
                self.handle_block_built(height, round, result)
            }
            StateMachineMessage::ProposalBlockValidated { height, block, result } => {
                self.handle_block_validated(height, block, result)
            }
            StateMachineMessage::CommitFinished { height, hash, result } => {
                self.handle_commit_finished(height, hash, result);
                Ok(())
            }
            StateMachineMessage::Gossip {
                kind,
                peer_state,
                reply,
            } => {
                // the peer loop may have gone away
                let _ = reply.send(self.gossip(kind, &peer_state));
                Ok(())
            }
        }
    }

    fn handle_consensus_message(
        &mut self,
        peer: Option<PeerId>,
        message: ConsensusMessage,
    ) -> Result<(), ConsensusError> {
        match message {
            ConsensusMessage::Proposal(proposal) => self.set_proposal(proposal, peer.as_ref()),
            ConsensusMessage::ProposalBlock(block) => self.add_proposal_block(*block),
            ConsensusMessage::Vote(vote) => self.add_vote(vote, peer.as_ref()),
            ConsensusMessage::VoteSetMaj23(msg) => self.handle_vote_set_maj23(msg, peer),
            ConsensusMessage::GetProposalBlock(hash) => {
                self.handle_get_proposal_block(hash, peer);
                Ok(())
            }
            other => {
                debug!("State machine ignores {}", other.kind());
                Ok(())
            }
        }
    }

    // ---- heights and timeouts ----

    fn handle_new_block_header(
        &mut self,
        parent: BlockHeader,
        validators: ActiveValidatorSet,
        pending_block: PendingBlock,
    ) -> Result<(), ConsensusError> {
        let height = parent.height + 1;
        if height <= self.rs.height {
            debug!("Ignoring header for height {}, already at {}", height, self.rs.height);
            return Ok(());
        }
        if pending_block.height() != height || pending_block.parent_hash() != parent.hash() {
            return Err(ConsensusError::InvalidBlock(format!(
                "pending block for height {} does not extend header {}",
                pending_block.height(),
                parent.height
            )));
        }

        let now = Utc::now();
        let last_commit_round = if self.rs.height == parent.height {
            self.rs.commit_round
        } else {
            None
        };
        let start_time = if self.config.skip_timeout_commit {
            now
        } else {
            let commit_timeout =
                chrono::Duration::from_std(self.config.commit_timeout()).unwrap_or_else(|_| chrono::Duration::zero());
            self.rs.commit_time.unwrap_or(now) + commit_timeout
        };

        self.rs = RoundState::new(self.chain_id, parent, Arc::new(validators), start_time, last_commit_round);
        self.pending_block = pending_block;
        self.built_block = None;
        self.validating = None;
        self.finalize_dispatched = false;
        info!("Entering height {}", height);
        self.new_step();
        self.schedule_round_zero();
        Ok(())
    }

    fn schedule_round_zero(&mut self) {
        let wait = (self.rs.start_time - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule_timeout(wait, self.rs.height, 0, RoundStepType::NewHeight);
    }

    fn schedule_timeout(&mut self, duration: Duration, height: u64, round: u32, step: RoundStepType) {
        self.ticker.schedule(TimeoutInfo::new(duration, height, round, step));
    }

    fn handle_timeout(&mut self, ti: TimeoutInfo) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if ti.height != rs.height || ti.round < rs.round || (ti.round == rs.round && ti.step < rs.step) {
            debug!(
                "Ignoring timeout {}/{}/{} at {}/{}/{}",
                ti.height, ti.round, ti.step, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        metrics::record_timeout(ti.step);

        match ti.step {
            RoundStepType::NewHeight => self.enter_new_round(ti.height, 0),
            RoundStepType::NewRound => self.enter_propose(ti.height, ti.round),
            RoundStepType::Propose => self.enter_prevote(ti.height, ti.round),
            RoundStepType::PrevoteWait => self.enter_precommit(ti.height, ti.round),
            RoundStepType::PrecommitWait => {
                self.enter_precommit(ti.height, ti.round)?;
                self.enter_new_round(ti.height, ti.round + 1)
            }
            step => {
                warn!("Unexpected timeout step {}", step);
                Ok(())
            }
        }
    }

    // ---- round steps ----

    fn enter_new_round(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && rs.step != RoundStepType::NewHeight)
            // a decided height only ends with the next block header
            || rs.step == RoundStepType::Commit
        {
            debug!(
                "Skipping new round {}/{} at {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        info!("Entering new round {}/{}", height, round);

        if round > self.rs.round {
            let advanced = self
                .rs
                .validators
                .copy_increment_proposer_priority(round - self.rs.round);
            self.rs.validators = Arc::new(advanced);
        }
        self.rs.round = round;
        self.rs.step = RoundStepType::NewRound;
        if round > 0 {
            // round 0 may already hold a proposal received during NewHeight
            self.rs.proposal = None;
            self.rs.proposal_block_hash = None;
            self.rs.proposal_block = None;
        }
        self.rs.votes.set_round(round + 1)?;
        self.rs.triggered_timeout_precommit = false;
        metrics::record_height_round(height, round);
        self.new_step();

        let wait_for_txs = round == 0 && self.pending_block.transactions().is_empty();
        match self.config.empty_block_interval() {
            Some(interval) if wait_for_txs => {
                self.schedule_timeout(interval, height, round, RoundStepType::NewRound);
                Ok(())
            }
            _ => self.enter_propose(height, round),
        }
    }

    fn enter_propose(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStepType::Propose <= rs.step)
            || rs.step == RoundStepType::Commit
        {
            debug!(
                "Skipping propose {}/{} at {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        info!("Entering propose {}/{}", height, round);

        self.schedule_timeout(self.config.propose_timeout(round), height, round, RoundStepType::Propose);
        self.rs.step = RoundStepType::Propose;
        self.new_step();

        if self.is_proposer() {
            self.decide_proposal(height, round);
        }
        if self.rs.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round)?;
        }
        Ok(())
    }

    fn is_proposer(&self) -> bool {
        self.rs.validators.proposer().address == self.signer.address()
    }

    fn decide_proposal(&mut self, height: u64, round: u32) {
        if let Some(valid) = self.rs.valid.clone() {
            self.publish_proposal(height, round, Some(valid.round), valid.block);
            return;
        }

        let backend = self.backend.clone();
        let handle = self.handle.clone();
        let pending = self.pending_block.clone();
        let max_evidence = self.config.max_evidence_per_block;
        tokio::spawn(async move {
            let result = build_proposal_block(backend.as_ref(), pending, max_evidence).await;
            handle
                .send(StateMachineMessage::ProposalBlockBuilt { height, round, result })
                .await;
        });
    }

    fn handle_block_built(
        &mut self,
        height: u64,
        round: u32,
        result: Result<(Block, ProcessResult), BackendError>,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height || self.rs.round != round || self.rs.step != RoundStepType::Propose {
            debug!("Dropping proposal block built for {}/{}", height, round);
            return Ok(());
        }
        let (block, result) = result?;
        self.publish_proposal(height, round, None, ValidatedBlock::new(block, result));
        Ok(())
    }

    fn publish_proposal(&mut self, height: u64, round: u32, pol_round: Option<u32>, block: ValidatedBlock) {
        let hash = block.hash();
        let mut proposal = Proposal::new(height, round, pol_round, hash, Utc::now().timestamp_millis());
        proposal.sign(&self.signer);
        info!(
            "Proposing block {:?} at {}/{} with {} transactions",
            hash,
            height,
            round,
            block.block.transactions.len()
        );

        self.backend
            .broadcast_message(ConsensusMessage::Proposal(proposal.clone()), BroadcastTarget::All);
        self.backend.broadcast_message(
            ConsensusMessage::ProposalBlock(Box::new((*block.block).clone())),
            BroadcastTarget::All,
        );
        self.built_block = Some(block);
        self.internal.push_back(ConsensusMessage::Proposal(proposal));
    }

    fn enter_prevote(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStepType::Prevote <= rs.step)
            || rs.step == RoundStepType::Commit
        {
            debug!(
                "Skipping prevote {}/{} at {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        info!("Entering prevote {}/{}", height, round);
        self.rs.step = RoundStepType::Prevote;
        self.new_step();

        let hash = if let Some(locked) = &self.rs.locked {
            locked.hash()
        } else if let Some(block) = &self.rs.proposal_block {
            block.hash()
        } else {
            H256::ZERO
        };
        self.sign_add_vote(VoteType::Prevote, hash)
    }

    fn enter_prevote_wait(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStepType::PrevoteWait <= rs.step)
            || rs.step == RoundStepType::Commit
        {
            return Ok(());
        }
        if !rs.votes.prevotes(round).map_or(false, VoteSet::has_two_thirds_any) {
            return Err(ConsensusError::InvariantViolation(format!(
                "prevote wait at {}/{} without two thirds of any prevotes",
                height, round
            )));
        }
        info!("Entering prevote wait {}/{}", height, round);
        self.rs.step = RoundStepType::PrevoteWait;
        self.new_step();
        self.schedule_timeout(
            self.config.prevote_timeout(round),
            height,
            round,
            RoundStepType::PrevoteWait,
        );
        Ok(())
    }

    fn enter_precommit(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStepType::Precommit <= rs.step)
            // our precommit for the decided round must stay the only one
            || rs.step == RoundStepType::Commit
        {
            debug!(
                "Skipping precommit {}/{} at {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        info!("Entering precommit {}/{}", height, round);
        self.rs.step = RoundStepType::Precommit;
        self.new_step();

        let hash = match self.rs.votes.prevotes(round).and_then(VoteSet::maj23) {
            Some(hash) => hash,
            None => {
                debug!("No polka at {}/{}, precommitting nil", height, round);
                return self.sign_add_vote(VoteType::Precommit, H256::ZERO);
            }
        };

        match self.rs.votes.pol_info() {
            Some((pol_round, _)) if pol_round >= round => {}
            _ => {
                return Err(ConsensusError::InvariantViolation(format!(
                    "polka at {}/{} missing from POL info",
                    height, round
                )))
            }
        }

        if hash.is_zero() {
            if self.rs.locked.take().is_some() {
                info!("Unlocking on nil polka at {}/{}", height, round);
            }
            return self.sign_add_vote(VoteType::Precommit, H256::ZERO);
        }

        if let Some(locked) = self.rs.locked.as_mut() {
            if locked.hash() == hash {
                info!("Relocking {:?} at {}/{}", hash, height, round);
                locked.round = round;
                return self.sign_add_vote(VoteType::Precommit, hash);
            }
        }

        if let Some(block) = self.rs.proposal_block.clone().filter(|b| b.hash() == hash) {
            info!("Locking {:?} at {}/{}", hash, height, round);
            self.rs.locked = Some(RoundBlock { round, block });
            return self.sign_add_vote(VoteType::Precommit, hash);
        }

        // polka for a block we do not have
        self.rs.locked = None;
        if self.rs.proposal_block_hash != Some(hash) {
            self.rs.proposal_block = None;
            self.rs.proposal_block_hash = Some(hash);
        }
        self.sign_add_vote(VoteType::Precommit, H256::ZERO)
    }

    fn enter_precommit_wait(&mut self, height: u64, round: u32) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && rs.triggered_timeout_precommit)
            || rs.step == RoundStepType::Commit
        {
            return Ok(());
        }
        if !rs.votes.precommits(round).map_or(false, VoteSet::has_two_thirds_any) {
            return Err(ConsensusError::InvariantViolation(format!(
                "precommit wait at {}/{} without two thirds of any precommits",
                height, round
            )));
        }
        info!("Entering precommit wait {}/{}", height, round);
        self.rs.step = RoundStepType::PrecommitWait;
        self.rs.triggered_timeout_precommit = true;
        self.new_step();
        self.schedule_timeout(
            self.config.precommit_timeout(round),
            height,
            round,
            RoundStepType::PrecommitWait,
        );
        Ok(())
    }

    fn enter_commit(&mut self, height: u64, commit_round: u32) -> Result<(), ConsensusError> {
        if self.rs.height != height || RoundStepType::Commit <= self.rs.step {
            return Ok(());
        }
        let hash = match self.rs.votes.precommits(commit_round).and_then(VoteSet::maj23) {
            Some(hash) if !hash.is_zero() => hash,
            _ => {
                return Err(ConsensusError::InvariantViolation(format!(
                    "commit at {}/{} without a block majority",
                    height, commit_round
                )))
            }
        };
        info!("Entering commit {}/{} for {:?}", height, commit_round, hash);

        self.rs.step = RoundStepType::Commit;
        self.rs.commit_round = Some(commit_round);
        self.rs.commit_time = Some(Utc::now());
        self.new_step();

        let known = self
            .rs
            .find_block(&hash)
            .cloned()
            .or_else(|| self.built_block.clone().filter(|b| b.hash() == hash));
        match known {
            Some(block) => {
                self.rs.proposal_block_hash = Some(hash);
                self.rs.proposal_block = Some(block);
            }
            None => {
                if self.rs.proposal_block_hash != Some(hash) {
                    self.rs.proposal_block = None;
                    self.rs.proposal_block_hash = Some(hash);
                }
                self.backend.broadcast_message(
                    ConsensusMessage::NewValidBlock(NewValidBlockMessage {
                        height,
                        round: commit_round,
                        hash,
                        is_commit: true,
                    }),
                    BroadcastTarget::All,
                );
            }
        }

        self.try_finalize_commit(height)
    }

    fn try_finalize_commit(&mut self, height: u64) -> Result<(), ConsensusError> {
        if self.rs.height != height {
            return Err(ConsensusError::InvariantViolation(format!(
                "finalize for height {} at height {}",
                height, self.rs.height
            )));
        }
        let hash = match self
            .rs
            .commit_round
            .and_then(|round| self.rs.votes.precommits(round))
            .and_then(VoteSet::maj23)
        {
            Some(hash) if !hash.is_zero() => hash,
            _ => return Ok(()),
        };
        if !self.rs.proposal_block_hash_matches(&hash) {
            debug!("Waiting for commit block {:?}", hash);
            return Ok(());
        }
        self.finalize_commit(height)
    }

    fn finalize_commit(&mut self, height: u64) -> Result<(), ConsensusError> {
        if self.rs.height != height || self.rs.step != RoundStepType::Commit || self.finalize_dispatched {
            return Ok(());
        }
        let commit_round = self
            .rs
            .commit_round
            .ok_or_else(|| ConsensusError::InvariantViolation("commit without commit round".to_string()))?;
        let precommits = self
            .rs
            .votes
            .precommits(commit_round)
            .ok_or_else(|| ConsensusError::InvariantViolation("commit round has no precommits".to_string()))?;
        let hash = precommits
            .maj23()
            .ok_or_else(|| ConsensusError::InvariantViolation("commit without majority".to_string()))?;
        let validated = self
            .rs
            .proposal_block
            .clone()
            .ok_or_else(|| ConsensusError::InvariantViolation("commit without block".to_string()))?;

        let proposal = self.rs.proposal.clone().filter(|p| p.hash == hash);
        let pol_round = proposal.as_ref().and_then(|p| p.pol_round);
        let extra = ExtraData::from_commit(
            commit_round,
            pol_round,
            proposal,
            precommits,
            &hash,
            self.backend.vote_version(height),
        );
        let block = (*validated.block).clone().with_extra_data(extra.encode()?);
        if block.hash() != hash {
            warn!(
                "Assembled block {:?} does not match commit {:?} at height {}",
                block.hash(),
                hash,
                height
            );
            return Ok(());
        }

        info!(
            "Finalizing block {:?} at {}/{} with {} signatures",
            hash,
            height,
            commit_round,
            extra.precommits.signatures.len()
        );
        self.finalize_dispatched = true;
        let backend = self.backend.clone();
        let handle = self.handle.clone();
        let result = validated.result;
        tokio::spawn(async move {
            let result = backend.commit_block(block, result).await;
            handle
                .send(StateMachineMessage::CommitFinished { height, hash, result })
                .await;
        });
        Ok(())
    }

    fn handle_commit_finished(&mut self, height: u64, hash: H256, result: Result<(), BackendError>) {
        match result {
            Ok(()) => {
                info!("Committed block {:?} at height {}", hash, height);
                metrics::record_committed_block(height);
            }
            Err(e) => {
                error!("Failed to commit block {:?} at height {}: {}", hash, height, e);
                if height == self.rs.height {
                    self.finalize_dispatched = false;
                }
            }
        }
    }

    // ---- proposals ----

    fn set_proposal(&mut self, proposal: Proposal, peer: Option<&PeerId>) -> Result<(), ConsensusError> {
        if self.rs.proposal.is_some() {
            return Ok(());
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            debug!(
                "Ignoring proposal for {}/{} at {}/{}",
                proposal.height, proposal.round, self.rs.height, self.rs.round
            );
            return Ok(());
        }
        proposal.validate_basic()?;
        proposal.validate_signature(&self.rs.validators)?;

        let hash = proposal.hash;
        info!(
            "Received proposal {:?} at {}/{} (POL round {:?})",
            hash, proposal.height, proposal.round, proposal.pol_round
        );
        self.rs.proposal = Some(proposal);
        if self.rs.proposal_block_hash.is_none() {
            self.rs.proposal_block_hash = Some(hash);
        }
        if self.rs.proposal_block.is_some() || self.rs.proposal_block_hash != Some(hash) {
            return Ok(());
        }

        let known = self
            .rs
            .find_block(&hash)
            .cloned()
            .or_else(|| self.built_block.clone().filter(|b| b.hash() == hash));
        match known {
            Some(block) => self.accept_proposal_block(block),
            None => {
                if let Some(peer) = peer {
                    self.backend.broadcast_message(
                        ConsensusMessage::GetProposalBlock(hash),
                        BroadcastTarget::To(peer.clone()),
                    );
                }
                Ok(())
            }
        }
    }

    fn add_proposal_block(&mut self, block: Block) -> Result<(), ConsensusError> {
        let hash = block.hash();
        let height = block.height();
        if height != self.rs.height || self.rs.proposal_block_hash != Some(hash) {
            debug!("Ignoring unexpected block {:?} at height {}", hash, height);
            return Ok(());
        }
        if self.rs.proposal_block.is_some() || self.validating == Some(hash) {
            return Ok(());
        }
        if block.header.parent_hash != self.rs.parent.hash() {
            return Err(ConsensusError::InvalidBlock(format!(
                "block {:?} does not extend {:?}",
                hash, block.header.parent_hash
            )));
        }
        block
            .validate()
            .map_err(|e| ConsensusError::InvalidBlock(e.to_string()))?;

        self.validating = Some(hash);
        let backend = self.backend.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let result = backend.pre_process_block(&block).await;
            handle
                .send(StateMachineMessage::ProposalBlockValidated { height, block, result })
                .await;
        });
        Ok(())
    }

    fn handle_block_validated(
        &mut self,
        height: u64,
        block: Block,
        result: Result<ProcessResult, BackendError>,
    ) -> Result<(), ConsensusError> {
        let hash = block.hash();
        if self.validating == Some(hash) {
            self.validating = None;
        }
        if height != self.rs.height {
            return Ok(());
        }
        let result = result?;
        if self.rs.proposal_block.is_some() || self.rs.proposal_block_hash != Some(hash) {
            debug!("Dropping validated block {:?}", hash);
            return Ok(());
        }
        self.accept_proposal_block(ValidatedBlock::new(block, result))
    }

    fn accept_proposal_block(&mut self, block: ValidatedBlock) -> Result<(), ConsensusError> {
        let hash = block.hash();
        if self.rs.proposal_block_hash != Some(hash) {
            return Ok(());
        }
        let height = self.rs.height;
        let round = self.rs.round;
        info!("Received complete proposal block {:?} at height {}", hash, height);
        self.rs.proposal_block = Some(block.clone());

        let polka = self.rs.votes.prevotes(round).and_then(VoteSet::maj23);
        if polka == Some(hash) && self.rs.valid.as_ref().map_or(true, |valid| valid.round < round) {
            self.rs.valid = Some(RoundBlock { round, block });
        }

        if self.rs.step <= RoundStepType::Propose && self.rs.is_proposal_complete() {
            self.enter_prevote(height, round)?;
            if polka.is_some() {
                self.enter_precommit(height, round)?;
            }
        } else if self.rs.step == RoundStepType::Commit {
            self.try_finalize_commit(height)?;
        }
        Ok(())
    }

    fn handle_get_proposal_block(&self, hash: H256, peer: Option<PeerId>) {
        let peer = match peer {
            Some(peer) => peer,
            None => return,
        };
        let block = self
            .rs
            .find_block(&hash)
            .or_else(|| self.built_block.as_ref().filter(|b| b.hash() == hash));
        match block {
            Some(block) => self.backend.broadcast_message(
                ConsensusMessage::ProposalBlock(Box::new((*block.block).clone())),
                BroadcastTarget::To(peer),
            ),
            None => debug!("Peer {} asked for unknown block {:?}", peer, hash),
        }
    }

    // ---- votes ----

    fn sign_add_vote(&mut self, vote_type: VoteType, hash: H256) -> Result<(), ConsensusError> {
        let index = match self.rs.validators.get_index_by_address(&self.signer.address()) {
            Some(index) => index as u32,
            None => return Ok(()),
        };
        let mut vote = Vote::new(
            self.chain_id,
            vote_type,
            self.rs.height,
            self.rs.round,
            hash,
            index,
            self.backend.vote_version(self.rs.height),
        );
        vote.sign(&self.signer)?;
        debug!("Signed {}", vote);
        self.backend
            .broadcast_message(ConsensusMessage::Vote(vote.clone()), BroadcastTarget::All);
        self.internal.push_back(ConsensusMessage::Vote(vote));
        Ok(())
    }

    fn add_vote(&mut self, vote: Vote, peer: Option<&PeerId>) -> Result<(), ConsensusError> {
        if vote.height != self.rs.height {
            debug!("Ignoring {} at height {}", vote, self.rs.height);
            return Ok(());
        }
        let expected = self.backend.vote_version(vote.height);
        if vote.version != expected {
            return Err(ConsensusError::InvalidVote(format!(
                "{:?} vote at height {}, expected {:?}",
                vote.version, vote.height, expected
            )));
        }

        let had_majority = self
            .rs
            .votes
            .vote_set(vote.round, vote.vote_type)
            .and_then(VoteSet::maj23)
            .is_some();
        match self.rs.votes.add_vote(vote.clone(), peer)? {
            AddVoteResult::Duplicate => return Ok(()),
            AddVoteResult::Conflicting { existing, counted } => {
                self.report_conflict(existing, vote.clone());
                if !counted {
                    return Ok(());
                }
            }
            AddVoteResult::Added => {}
        }

        let target = match peer {
            Some(peer) => BroadcastTarget::Exclude(peer.clone()),
            None => BroadcastTarget::All,
        };
        self.backend.broadcast_message(
            ConsensusMessage::HasVote(HasVoteMessage {
                height: vote.height,
                round: vote.round,
                vote_type: vote.vote_type,
                index: vote.index,
            }),
            target,
        );
        if !had_majority {
            if let Some(hash) = self
                .rs
                .votes
                .vote_set(vote.round, vote.vote_type)
                .and_then(VoteSet::maj23)
            {
                self.backend.broadcast_message(
                    ConsensusMessage::VoteSetMaj23(VoteSetMaj23Message {
                        height: vote.height,
                        round: vote.round,
                        vote_type: vote.vote_type,
                        hash,
                    }),
                    BroadcastTarget::All,
                );
            }
        }

        match vote.vote_type {
            VoteType::Prevote => self.on_prevote(&vote),
            VoteType::Precommit => self.on_precommit(&vote),
        }
    }

    fn report_conflict(&self, existing: Vote, conflicting: Vote) {
        let own_index = self.rs.validators.get_index_by_address(&self.signer.address());
        if own_index == Some(conflicting.index as usize) {
            error!("Found conflicting vote from ourselves: {} and {}", existing, conflicting);
            return;
        }
        match DuplicateVoteEvidence::new(existing, conflicting) {
            Ok(evidence) => {
                warn!(
                    "Validator index {} equivocated at height {}",
                    evidence.validator_index(),
                    evidence.height()
                );
                let backend = self.backend.clone();
                tokio::spawn(async move {
                    if let Err(e) = backend.add_evidence(evidence.into()).await {
                        warn!("Failed to add duplicate vote evidence: {}", e);
                    }
                });
            }
            Err(e) => warn!("Could not build duplicate vote evidence: {}", e),
        }
    }

    fn on_prevote(&mut self, vote: &Vote) -> Result<(), ConsensusError> {
        let height = self.rs.height;
        let (polka, has_any) = match self.rs.votes.prevotes(vote.round) {
            Some(set) => (set.maj23(), set.has_two_thirds_any()),
            None => return Ok(()),
        };

        if let Some(hash) = polka {
            if let Some(locked) = &self.rs.locked {
                if locked.round < vote.round && vote.round <= self.rs.round && locked.hash() != hash {
                    info!("Unlocking {:?} on polka for {:?} at round {}", locked.hash(), hash, vote.round);
                    self.rs.locked = None;
                }
            }

            let valid_behind = self.rs.valid.as_ref().map_or(true, |valid| valid.round < vote.round);
            if !hash.is_zero() && valid_behind && vote.round == self.rs.round {
                match self.rs.proposal_block.clone().filter(|b| b.hash() == hash) {
                    Some(block) => {
                        debug!("Updating valid block to {:?} at round {}", hash, vote.round);
                        self.rs.valid = Some(RoundBlock {
                            round: vote.round,
                            block,
                        });
                    }
                    None => self.rs.proposal_block = None,
                }
                if self.rs.proposal_block_hash != Some(hash) {
                    self.rs.proposal_block_hash = Some(hash);
                }
                self.backend.broadcast_message(
                    ConsensusMessage::NewValidBlock(NewValidBlockMessage {
                        height,
                        round: self.rs.round,
                        hash,
                        is_commit: self.rs.step == RoundStepType::Commit,
                    }),
                    BroadcastTarget::All,
                );
            }
        }

        if self.rs.round < vote.round && has_any {
            self.enter_new_round(height, vote.round)
        } else if self.rs.round == vote.round && RoundStepType::Prevote <= self.rs.step {
            match polka {
                Some(hash) if self.rs.is_proposal_complete() || hash.is_zero() => {
                    self.enter_precommit(height, vote.round)
                }
                _ if has_any => self.enter_prevote_wait(height, vote.round),
                _ => Ok(()),
            }
        } else {
            let pol_complete = self
                .rs
                .proposal
                .as_ref()
                .map_or(false, |p| p.pol_round == Some(vote.round))
                && self.rs.is_proposal_complete();
            if pol_complete {
                self.enter_prevote(height, self.rs.round)
            } else {
                Ok(())
            }
        }
    }

    fn on_precommit(&mut self, vote: &Vote) -> Result<(), ConsensusError> {
        if self.rs.step == RoundStepType::Commit {
            return Ok(());
        }
        let height = self.rs.height;
        let (majority, has_any) = match self.rs.votes.precommits(vote.round) {
            Some(set) => (set.maj23(), set.has_two_thirds_any()),
            None => return Ok(()),
        };

        if let Some(hash) = majority {
            self.enter_new_round(height, vote.round)?;
            self.enter_precommit(height, vote.round)?;
            if hash.is_zero() {
                self.enter_precommit_wait(height, vote.round)
            } else {
                self.enter_commit(height, vote.round)
            }
        } else if self.rs.round <= vote.round && has_any {
            self.enter_new_round(height, vote.round)?;
            self.enter_precommit_wait(height, vote.round)
        } else {
            Ok(())
        }
    }

    fn handle_vote_set_maj23(
        &mut self,
        msg: VoteSetMaj23Message,
        peer: Option<PeerId>,
    ) -> Result<(), ConsensusError> {
        let peer = match peer {
            Some(peer) => peer,
            None => return Ok(()),
        };
        if msg.height != self.rs.height {
            return Ok(());
        }
        self.rs
            .votes
            .set_peer_maj23(msg.round, msg.vote_type, peer.clone(), msg.hash)?;

        let votes = self
            .rs
            .votes
            .vote_set(msg.round, msg.vote_type)
            .and_then(|set| set.bit_array_by_block_hash(&msg.hash))
            .cloned()
            .unwrap_or_else(|| BitArray::new(self.rs.validators.len()));
        self.backend.broadcast_message(
            ConsensusMessage::VoteSetBits(VoteSetBitsMessage {
                height: msg.height,
                round: msg.round,
                vote_type: msg.vote_type,
                hash: msg.hash,
                votes,
            }),
            BroadcastTarget::To(peer),
        );
        Ok(())
    }

    // ---- status ----

    fn new_step(&mut self) {
        let rs = &self.rs;
        metrics::record_step(rs.step);
        let seconds_since_start = (Utc::now() - rs.start_time).num_seconds().max(0) as u64;
        self.backend.broadcast_message(
            ConsensusMessage::NewRoundStep(NewRoundStepMessage {
                height: rs.height,
                round: rs.round,
                step: rs.step,
                seconds_since_start,
                last_commit_round: rs.last_commit_round,
            }),
            BroadcastTarget::All,
        );
        self.publish_status();
    }

    fn publish_status(&self) {
        let summary = self.rs.summary();
        self.status.send_if_modified(|current| {
            if *current == summary {
                return false;
            }
            *current = summary;
            true
        });
    }
}

async fn build_proposal_block(
    backend: &dyn Backend,
    mut pending: PendingBlock,
    max_evidence: usize,
) -> Result<(Block, ProcessResult), BackendError> {
    let evidence = backend.pick_evidence(pending.height(), max_evidence).await?;
    pending.complete(evidence)?;
    let result = backend.finalize_pending_block(&pending).await?;
    pending.finalize(result.state_root, result.receipts_root)?;
    Ok((pending.into_block()?, result))
}

fn log_error(kind: &str, e: &ConsensusError) {
    match e {
        ConsensusError::InvariantViolation(_) => error!("Handling {} failed: {}", kind, e),
        ConsensusError::Backend(_) | ConsensusError::InvalidBlock(_) => warn!("Handling {} failed: {}", kind, e),
        _ => debug!("Dropped {}: {}", kind, e),
    }
}

#[cfg(test)]
mod tests;
