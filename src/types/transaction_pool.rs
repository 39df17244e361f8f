use std::collections::HashMap;

use crate::types::primitives::H256;
use crate::types::transaction::Transaction;

/// Transactions waiting to be packed into a pending block, in arrival order.
#[derive(Default)]
pub struct TransactionPool {
    transactions: HashMap<H256, Transaction>,
    order: Vec<H256>,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the transaction is already pooled.
    pub fn add_transaction(&mut self, transaction: Transaction) -> bool {
        let hash = transaction.hash();
        if self.transactions.contains_key(&hash) {
            return false;
        }
        self.order.push(hash);
        self.transactions.insert(hash, transaction);
        true
    }

    pub fn get_transaction(&self, hash: &H256) -> Option<&Transaction> {
        self.transactions.get(hash)
    }

    pub fn get_all_transactions(&self) -> Vec<&Transaction> {
        self.order
            .iter()
            .filter_map(|hash| self.transactions.get(hash))
            .collect()
    }

    /// Oldest `max` transactions, left in the pool until they are committed.
    pub fn pending_batch(&self, max: usize) -> Vec<Transaction> {
        self.get_all_transactions().into_iter().take(max).cloned().collect()
    }

    pub fn remove_transactions<'a>(&mut self, committed: impl IntoIterator<Item = &'a Transaction>) {
        for tx in committed {
            let hash = tx.hash();
            if self.transactions.remove(&hash).is_some() {
                self.order.retain(|h| *h != hash);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
