use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;

use crate::consensus::backend::{Backend, BackendError, BroadcastTarget, ProcessResult};
use crate::consensus::evpool::Evidence;
use crate::consensus::messages::ConsensusMessage;
use crate::consensus::pending_block::PendingBlock;
use crate::consensus::validator_set::{ActiveValidatorSet, Validator};
use crate::consensus::vote::{Vote, VoteType, VoteVersion};
use crate::security::Signer;
use crate::types::block::Block;
use crate::types::primitives::H256;

pub const CHAIN_ID: u64 = 1;

/// Deterministic signers; signer `i` is seeded with `i + 1`.
pub fn signers(n: usize) -> Vec<Signer> {
    (0..n)
        .map(|i| {
            let seed = (i + 1) as u8;
            Signer::new(
                SigningKey::from_bytes(&[seed; 32]),
                Some(SigningKey::from_bytes(&[seed.wrapping_add(128); 32])),
            )
        })
        .collect()
}

/// Validator `i` belongs to `signers[i]`.
pub fn validator_set(signers: &[Signer], powers: &[u64]) -> ActiveValidatorSet {
    let validators = signers
        .iter()
        .zip(powers)
        .map(|(signer, power)| Validator::new(signer.public_key(), signer.alternate_public_key(), *power))
        .collect();
    ActiveValidatorSet::new(validators).unwrap()
}

pub fn signed_vote(
    signer: &Signer,
    index: u32,
    vote_type: VoteType,
    height: u64,
    round: u32,
    hash: H256,
) -> Vote {
    let mut vote = Vote::new(
        CHAIN_ID,
        vote_type,
        height,
        round,
        hash,
        index,
        VoteVersion::Individual,
    );
    vote.sign(signer).unwrap();
    vote
}

/// Backend that executes nothing and records every outbound call.
#[derive(Default)]
pub struct RecordingBackend {
    pub broadcasts: Mutex<Vec<(ConsensusMessage, BroadcastTarget)>>,
    pub committed: Mutex<Vec<Block>>,
    pub evidence: Mutex<Vec<Evidence>>,
    pub picked_evidence: Mutex<Vec<Evidence>>,
}

impl RecordingBackend {
    pub fn sent_votes(&self) -> Vec<Vote> {
        self.broadcasts
            .lock()
            .iter()
            .filter_map(|(message, _)| match message {
                ConsensusMessage::Vote(vote) => Some(vote.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sent(&self, kind: &str) -> Vec<(ConsensusMessage, BroadcastTarget)> {
        self.broadcasts
            .lock()
            .iter()
            .filter(|(message, _)| message.kind() == kind)
            .cloned()
            .collect()
    }
}

fn roots_for(height: u64) -> ProcessResult {
    ProcessResult {
        state_root: H256::digest(&height.to_be_bytes()),
        receipts_root: H256::ZERO,
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn pre_process_block(&self, block: &Block) -> Result<ProcessResult, BackendError> {
        Ok(roots_for(block.height()))
    }

    async fn commit_block(&self, block: Block, _result: ProcessResult) -> Result<(), BackendError> {
        self.committed.lock().push(block);
        Ok(())
    }

    async fn finalize_pending_block(&self, pending: &PendingBlock) -> Result<ProcessResult, BackendError> {
        Ok(roots_for(pending.height()))
    }

    fn broadcast_message(&self, message: ConsensusMessage, target: BroadcastTarget) {
        self.broadcasts.lock().push((message, target));
    }

    async fn pick_evidence(&self, _height: u64, count: usize) -> Result<Vec<Evidence>, BackendError> {
        Ok(self.picked_evidence.lock().iter().take(count).cloned().collect())
    }

    async fn add_evidence(&self, evidence: Evidence) -> Result<(), BackendError> {
        self.evidence.lock().push(evidence);
        Ok(())
    }

    fn vote_version(&self, _height: u64) -> VoteVersion {
        VoteVersion::Individual
    }
}
