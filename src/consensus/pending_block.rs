use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::consensus::evpool::Evidence;
use crate::types::block::{Block, BlockHeader};
use crate::types::primitives::{Address, H256};
use crate::types::transaction::Transaction;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PendingBlockError {
    #[error("Pending block is {0:?}, expected {1:?}")]
    WrongState(PendingBlockState, PendingBlockState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingBlockState {
    Building,
    Completed,
    Finalized,
}

/// Draft of the next block. Building accepts transactions, Completed freezes
/// the body, Finalized carries the execution roots.
#[derive(Debug, Clone)]
pub struct PendingBlock {
    parent_hash: H256,
    height: u64,
    timestamp: DateTime<Utc>,
    proposer: Address,
    transactions: Vec<Transaction>,
    evidence: Vec<Evidence>,
    roots: Option<(H256, H256)>,
    state: PendingBlockState,
}

impl PendingBlock {
    pub fn new(parent: &BlockHeader, proposer: Address, timestamp: DateTime<Utc>) -> Self {
        Self {
            parent_hash: parent.hash(),
            height: parent.height + 1,
            timestamp,
            proposer,
            transactions: Vec::new(),
            evidence: Vec::new(),
            roots: None,
            state: PendingBlockState::Building,
        }
    }

    pub fn parent_hash(&self) -> H256 {
        self.parent_hash
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn state(&self) -> PendingBlockState {
        self.state
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn append_transactions(&mut self, transactions: Vec<Transaction>) -> Result<(), PendingBlockError> {
        self.expect_state(PendingBlockState::Building)?;
        self.transactions.extend(transactions);
        Ok(())
    }

    /// Freezes the body. Evidence is picked at completion time.
    pub fn complete(&mut self, evidence: Vec<Evidence>) -> Result<(), PendingBlockError> {
        self.expect_state(PendingBlockState::Building)?;
        self.evidence = evidence;
        self.state = PendingBlockState::Completed;
        Ok(())
    }

    pub fn finalize(&mut self, state_root: H256, receipts_root: H256) -> Result<(), PendingBlockError> {
        self.expect_state(PendingBlockState::Completed)?;
        self.roots = Some((state_root, receipts_root));
        self.state = PendingBlockState::Finalized;
        Ok(())
    }

    pub fn into_block(self) -> Result<Block, PendingBlockError> {
        let (state_root, receipts_root) = match (self.state, self.roots) {
            (PendingBlockState::Finalized, Some(roots)) => roots,
            _ => {
                return Err(PendingBlockError::WrongState(
                    self.state,
                    PendingBlockState::Finalized,
                ))
            }
        };

        let header = BlockHeader {
            parent_hash: self.parent_hash,
            height: self.height,
            timestamp: self.timestamp,
            proposer: self.proposer,
            transactions_root: Block::transactions_root(&self.transactions),
            evidence_root: Block::evidence_root(&self.evidence),
            state_root,
            receipts_root,
            extra_data: Vec::new(),
        };
        Ok(Block::new(header, self.transactions, self.evidence))
    }

    fn expect_state(&self, expected: PendingBlockState) -> Result<(), PendingBlockError> {
        if self.state != expected {
            return Err(PendingBlockError::WrongState(self.state, expected));
        }
        Ok(())
    }
}
