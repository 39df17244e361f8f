use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::consensus::pending_block::PendingBlock;
use crate::consensus::state::{StateMachineHandle, StateMachineMessage};
use crate::ledger::chain::DevChain;
use crate::types::block::{Block, BlockHeader};
use crate::types::primitives::Address;
use crate::types::transaction_pool::TransactionPool;

/// Moves consensus to the next height each time the chain commits.
pub struct BlockDriver {
    chain: Arc<DevChain>,
    pool: Arc<Mutex<TransactionPool>>,
    proposer: Address,
    max_transactions: usize,
}

impl BlockDriver {
    pub fn new(
        chain: Arc<DevChain>,
        pool: Arc<Mutex<TransactionPool>>,
        proposer: Address,
        max_transactions: usize,
    ) -> Self {
        Self {
            chain,
            pool,
            proposer,
            max_transactions,
        }
    }

    /// Draft for the height after `parent`, filled from the transaction pool.
    pub fn pending_block(&self, parent: &BlockHeader) -> PendingBlock {
        let mut pending = PendingBlock::new(parent, self.proposer, Utc::now());
        let batch = self.pool.lock().pending_batch(self.max_transactions);
        if let Err(e) = pending.append_transactions(batch) {
            warn!("Could not fill pending block: {}", e);
        }
        pending
    }

    fn on_committed(&self, block: &Block) -> StateMachineMessage {
        self.pool.lock().remove_transactions(&block.transactions);
        StateMachineMessage::NewBlockHeader {
            parent: block.header.clone(),
            validators: self.chain.validators(),
            pending_block: self.pending_block(&block.header),
        }
    }

    pub async fn run(self, handle: StateMachineHandle, mut committed: mpsc::UnboundedReceiver<Block>) {
        while let Some(block) = committed.recv().await {
            let message = self.on_committed(&block);
            if !handle.send(message).await {
                break;
            }
        }
        info!("Block driver stopped at height {}", self.chain.height());
    }
}
