use sha2::{Digest, Sha256};

use crate::consensus::backend::ProcessResult;
use crate::consensus::validator_set::ActiveValidatorSet;
use crate::types::block::{calculate_merkle_root, Block, BlockHeader};
use crate::types::primitives::H256;
use crate::types::transaction::Transaction;

/// Committed chain of a development node. The state root is a hash chain
/// over every applied transaction.
pub struct ChainState {
    blocks: Vec<Block>,
    head: BlockHeader,
    /// Validators for the next height, proposer priority included.
    validators: ActiveValidatorSet,
}

impl ChainState {
    pub fn new(genesis: BlockHeader, validators: ActiveValidatorSet) -> Self {
        Self {
            blocks: Vec::new(),
            head: genesis,
            validators,
        }
    }

    pub fn head(&self) -> &BlockHeader {
        &self.head
    }

    pub fn height(&self) -> u64 {
        self.head.height
    }

    pub fn validators(&self) -> &ActiveValidatorSet {
        &self.validators
    }

    pub fn block(&self, height: u64) -> Option<&Block> {
        let index = height.checked_sub(self.blocks.first()?.height())?;
        self.blocks.get(index as usize)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Roots produced by applying `transactions` on top of the head.
    pub fn execute(&self, transactions: &[Transaction]) -> ProcessResult {
        execute(&self.head.state_root, transactions)
    }

    /// Appends a block that extends the head and rotates the proposer.
    pub fn apply(&mut self, block: Block) {
        self.head = block.header.clone();
        self.blocks.push(block);
        self.validators.increment_proposer_priority(1);
    }
}

pub fn execute(parent_state_root: &H256, transactions: &[Transaction]) -> ProcessResult {
    let mut state_root = *parent_state_root;
    let mut receipts = Vec::with_capacity(transactions.len());
    for (index, tx) in transactions.iter().enumerate() {
        let tx_hash = tx.hash();
        let mut hasher = Sha256::new();
        hasher.update(state_root.as_bytes());
        hasher.update(tx_hash.as_bytes());
        state_root = H256(hasher.finalize().into());

        let mut receipt = Sha256::new();
        receipt.update((index as u64).to_le_bytes());
        receipt.update(tx_hash.as_bytes());
        receipt.update(state_root.as_bytes());
        receipts.push(H256(receipt.finalize().into()));
    }

    ProcessResult {
        state_root,
        receipts_root: calculate_merkle_root(&receipts),
    }
}
