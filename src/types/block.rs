use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::consensus::evpool::Evidence;
use crate::types::primitives::{Address, H256};
use crate::types::transaction::Transaction;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlockError {
    #[error("Invalid transactions root: expected {expected}, got {actual}")]
    InvalidTransactionsRoot { expected: H256, actual: H256 },
    #[error("Invalid evidence root: expected {expected}, got {actual}")]
    InvalidEvidenceRoot { expected: H256, actual: H256 },
    #[error("Block timestamp is in the future")]
    FutureTimestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub evidence: Vec<Evidence>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub height: u64,
    pub timestamp: DateTime<Utc>,
    pub proposer: Address,
    pub transactions_root: H256,
    pub evidence_root: H256,
    pub state_root: H256,
    pub receipts_root: H256,
    /// Encoded commit proof. Not covered by the header hash.
    pub extra_data: Vec<u8>,
}

impl Block {
    pub fn new(
        header: BlockHeader,
        transactions: Vec<Transaction>,
        evidence: Vec<Evidence>,
    ) -> Self {
        Self {
            header,
            transactions,
            evidence,
        }
    }

    pub fn hash(&self) -> H256 {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn with_extra_data(mut self, extra_data: Vec<u8>) -> Self {
        self.header.extra_data = extra_data;
        self
    }

    pub fn transactions_root(transactions: &[Transaction]) -> H256 {
        let hashes: Vec<H256> = transactions.iter().map(Transaction::hash).collect();
        calculate_merkle_root(&hashes)
    }

    pub fn evidence_root(evidence: &[Evidence]) -> H256 {
        let hashes: Vec<H256> = evidence.iter().map(Evidence::hash).collect();
        calculate_merkle_root(&hashes)
    }

    /// Structural checks that do not need chain state.
    pub fn validate(&self) -> Result<(), BlockError> {
        let transactions_root = Self::transactions_root(&self.transactions);
        if transactions_root != self.header.transactions_root {
            return Err(BlockError::InvalidTransactionsRoot {
                expected: self.header.transactions_root,
                actual: transactions_root,
            });
        }

        let evidence_root = Self::evidence_root(&self.evidence);
        if evidence_root != self.header.evidence_root {
            return Err(BlockError::InvalidEvidenceRoot {
                expected: self.header.evidence_root,
                actual: evidence_root,
            });
        }

        if self.header.timestamp > Utc::now() + chrono::Duration::seconds(15) {
            return Err(BlockError::FutureTimestamp);
        }

        Ok(())
    }
}

impl BlockHeader {
    pub fn genesis(timestamp: DateTime<Utc>) -> Self {
        Self {
            parent_hash: H256::ZERO,
            height: 0,
            timestamp,
            proposer: Address::default(),
            transactions_root: H256::ZERO,
            evidence_root: H256::ZERO,
            state_root: H256::ZERO,
            receipts_root: H256::ZERO,
            extra_data: Vec::new(),
        }
    }

    /// Hash of every field except `extra_data`, so a block keeps its identity
    /// when the commit proof is attached.
    pub fn hash(&self) -> H256 {
        let mut hasher = Sha256::new();
        hasher.update(self.parent_hash.as_bytes());
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.timestamp.timestamp_millis().to_le_bytes());
        hasher.update(self.proposer.0);
        hasher.update(self.transactions_root.as_bytes());
        hasher.update(self.evidence_root.as_bytes());
        hasher.update(self.state_root.as_bytes());
        hasher.update(self.receipts_root.as_bytes());
        H256(hasher.finalize().into())
    }
}

pub fn calculate_merkle_root(hashes: &[H256]) -> H256 {
    if hashes.is_empty() {
        return H256::ZERO;
    }

    let mut level: Vec<H256> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for chunk in level.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(chunk[0].as_bytes());
            // odd node is paired with itself
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]).as_bytes());
            next.push(H256(hasher.finalize().into()));
        }
        level = next;
    }

    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let transactions = vec![
            Transaction::new("alice".to_string(), 0, vec![1]),
            Transaction::new("bob".to_string(), 0, vec![2]),
            Transaction::new("carol".to_string(), 0, vec![3]),
        ];
        let mut header = BlockHeader::genesis(Utc::now());
        header.height = 1;
        header.transactions_root = Block::transactions_root(&transactions);
        Block::new(header, transactions, Vec::new())
    }

    #[test]
    fn extra_data_does_not_change_hash() {
        let block = sample_block();
        let hash = block.hash();
        let sealed = block.with_extra_data(vec![9, 9, 9]);
        assert_eq!(sealed.hash(), hash);
    }

    #[test]
    fn validate_detects_tampered_transactions() {
        let mut block = sample_block();
        assert_eq!(block.validate(), Ok(()));

        block.transactions.pop();
        assert!(matches!(
            block.validate(),
            Err(BlockError::InvalidTransactionsRoot { .. })
        ));
    }

    #[test]
    fn merkle_root_of_single_hash_pairs_with_itself() {
        let leaf = H256::digest(b"leaf");
        let mut hasher = Sha256::new();
        hasher.update(leaf.as_bytes());
        hasher.update(leaf.as_bytes());
        // a single leaf is returned unchanged, pairing only happens above it
        assert_eq!(calculate_merkle_root(&[leaf]), leaf);
        assert_eq!(
            calculate_merkle_root(&[leaf, leaf]),
            H256(hasher.finalize().into())
        );
    }
}
