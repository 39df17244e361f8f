use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use crate::consensus::evpool::evidence::Evidence;
use crate::consensus::evpool::EvidenceError;
use crate::types::primitives::H256;

/// Durable side of the evidence pool.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn add_pending(&self, evidence: &Evidence) -> Result<(), EvidenceError>;

    async fn remove_pending(&self, evidence: &Evidence) -> Result<(), EvidenceError>;

    async fn add_committed(&self, evidence: &Evidence) -> Result<(), EvidenceError>;

    async fn is_pending(&self, hash: &H256) -> Result<bool, EvidenceError>;

    async fn is_committed(&self, hash: &H256) -> Result<bool, EvidenceError>;

    /// Pending evidence with `from <= height < to`, ordered by height.
    async fn load_pending(
        &self,
        from: u64,
        to: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Evidence>, EvidenceError>;
}

#[derive(Default)]
struct MemoryState {
    pending: BTreeMap<(u64, H256), Evidence>,
    committed: HashMap<H256, u64>,
}

/// In-memory store for development nodes and tests.
#[derive(Default)]
pub struct MemoryEvidenceStore {
    state: Mutex<MemoryState>,
}

impl MemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvidenceStore for MemoryEvidenceStore {
    async fn add_pending(&self, evidence: &Evidence) -> Result<(), EvidenceError> {
        self.state
            .lock()
            .pending
            .insert((evidence.height(), evidence.hash()), evidence.clone());
        Ok(())
    }

    async fn remove_pending(&self, evidence: &Evidence) -> Result<(), EvidenceError> {
        self.state
            .lock()
            .pending
            .remove(&(evidence.height(), evidence.hash()));
        Ok(())
    }

    async fn add_committed(&self, evidence: &Evidence) -> Result<(), EvidenceError> {
        self.state
            .lock()
            .committed
            .insert(evidence.hash(), evidence.height());
        Ok(())
    }

    async fn is_pending(&self, hash: &H256) -> Result<bool, EvidenceError> {
        Ok(self.state.lock().pending.keys().any(|(_, h)| h == hash))
    }

    async fn is_committed(&self, hash: &H256) -> Result<bool, EvidenceError> {
        Ok(self.state.lock().committed.contains_key(hash))
    }

    async fn load_pending(
        &self,
        from: u64,
        to: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Evidence>, EvidenceError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let state = self.state.lock();
        let range = state
            .pending
            .range((from, H256::ZERO)..(to, H256::ZERO))
            .map(|(_, evidence)| evidence.clone());
        Ok(match limit {
            Some(limit) => range.take(limit).collect(),
            None => range.collect(),
        })
    }
}
