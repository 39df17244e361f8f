use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::evpool::{Evidence, EvidenceError};
use crate::consensus::extra_data::ExtraDataError;
use crate::consensus::messages::ConsensusMessage;
use crate::consensus::pending_block::{PendingBlock, PendingBlockError};
use crate::consensus::types::PeerId;
use crate::consensus::vote::VoteVersion;
use crate::types::block::{Block, BlockError};
use crate::types::primitives::H256;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Block rejected: {0}")]
    InvalidBlock(#[from] BlockError),
    #[error("Unknown parent block {0}")]
    UnknownParent(H256),
    #[error("Execution failed: {0}")]
    Execution(String),
    #[error("Pending block error: {0}")]
    PendingBlock(#[from] PendingBlockError),
    #[error("Evidence error: {0}")]
    Evidence(#[from] EvidenceError),
    #[error("Invalid commit proof: {0}")]
    InvalidCommit(#[from] ExtraDataError),
}

/// Outcome of executing a block, handed back to `commit_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub state_root: H256,
    pub receipts_root: H256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastTarget {
    All,
    To(PeerId),
    Exclude(PeerId),
}

/// Chain services the consensus core depends on.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Executes a proposed block without committing it.
    async fn pre_process_block(&self, block: &Block) -> Result<ProcessResult, BackendError>;

    /// Persists a block carrying its commit proof.
    async fn commit_block(&self, block: Block, result: ProcessResult) -> Result<(), BackendError>;

    /// Executes a completed draft to obtain its roots.
    async fn finalize_pending_block(&self, pending: &PendingBlock) -> Result<ProcessResult, BackendError>;

    fn broadcast_message(&self, message: ConsensusMessage, target: BroadcastTarget);

    async fn pick_evidence(&self, height: u64, count: usize) -> Result<Vec<Evidence>, BackendError>;

    async fn add_evidence(&self, evidence: Evidence) -> Result<(), BackendError>;

    fn vote_version(&self, height: u64) -> VoteVersion;
}
