pub mod evidence;
pub mod store;

pub use evidence::{DuplicateVoteEvidence, Evidence};
pub use store::{EvidenceStore, MemoryEvidenceStore};

use log::{debug, info, warn};
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;

use crate::config::EvidenceConfig;
use crate::metrics;
use crate::types::primitives::H256;

#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("Invalid evidence: {0}")]
    InvalidEvidence(String),
    #[error("Evidence store error: {0}")]
    Store(String),
    #[error("Invalid evidence pool config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvidenceStatus {
    Pending,
    Committed,
}

/// Pending and committed duplicate-vote evidence. The LRU cache fronts the
/// store for membership checks.
pub struct EvidencePool {
    store: Arc<dyn EvidenceStore>,
    max_age: u64,
    cache: LruCache<H256, EvidenceStatus>,
    /// Last committed height.
    height: u64,
    pruning_height: u64,
}

impl fmt::Debug for EvidencePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvidencePool")
            .field("max_age", &self.max_age)
            .field("cached", &self.cache.len())
            .field("height", &self.height)
            .field("pruning_height", &self.pruning_height)
            .finish_non_exhaustive()
    }
}

impl EvidencePool {
    /// Store errors here are fatal.
    pub async fn init(
        store: Arc<dyn EvidenceStore>,
        config: &EvidenceConfig,
        height: u64,
    ) -> Result<Self, EvidenceError> {
        let capacity = NonZeroUsize::new(config.cache_size)
            .ok_or_else(|| EvidenceError::InvalidConfig("cache_size must be positive".to_string()))?;

        let pending = store.load_pending(0, u64::MAX, None).await?;
        let mut pool = Self {
            store,
            max_age: config.max_age_num_blocks,
            cache: LruCache::new(capacity),
            height,
            pruning_height: 0,
        };
        for evidence in &pending {
            pool.cache.put(evidence.hash(), EvidenceStatus::Pending);
        }
        pool.pruning_height = pool.prune_expired_pending_evidence().await;

        info!(
            "Evidence pool initialized at height {} with {} pending evidence",
            height,
            pending.len()
        );
        Ok(pool)
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Returns false when the evidence is already known, expired, or from a
    /// height consensus has not reached.
    pub async fn add_evidence(&mut self, evidence: Evidence) -> Result<bool, EvidenceError> {
        let hash = evidence.hash();
        if self.is_pending(&hash).await? || self.is_committed(&hash).await? {
            debug!("Evidence {:?} already known", hash);
            return Ok(false);
        }
        if self.is_expired(evidence.height()) {
            debug!("Evidence {:?} at height {} expired", hash, evidence.height());
            return Ok(false);
        }
        if evidence.height() > self.height + 1 {
            debug!("Evidence {:?} from future height {}", hash, evidence.height());
            return Ok(false);
        }

        self.store.add_pending(&evidence).await?;
        self.cache.put(hash, EvidenceStatus::Pending);
        self.pruning_height = self
            .pruning_height
            .min(evidence.height() + self.max_age + 1);
        metrics::record_evidence_added();
        info!("Added evidence {:?} at height {}", hash, evidence.height());
        Ok(true)
    }

    /// Up to `count` pending evidence strictly older than the last committed
    /// block (`height - 1`), oldest first.
    pub async fn pick_evidence(&self, height: u64, count: usize) -> Result<Vec<Evidence>, EvidenceError> {
        if count == 0 || height < 2 {
            return Ok(Vec::new());
        }
        let from = self.height.saturating_sub(self.max_age);
        self.store.load_pending(from, height - 1, Some(count)).await
    }

    /// Marks evidence included in the block at `height` as committed.
    pub async fn update(&mut self, committed: &[Evidence], height: u64) -> Result<(), EvidenceError> {
        for evidence in committed {
            self.store.add_committed(evidence).await?;
            self.store.remove_pending(evidence).await?;
            self.cache.put(evidence.hash(), EvidenceStatus::Committed);
        }

        self.height = self.height.max(height);
        if self.height >= self.pruning_height {
            self.pruning_height = self.prune_expired_pending_evidence().await;
        }
        Ok(())
    }

    pub async fn is_pending(&self, hash: &H256) -> Result<bool, EvidenceError> {
        match self.cache.peek(hash) {
            Some(status) => Ok(*status == EvidenceStatus::Pending),
            None => self.store.is_pending(hash).await,
        }
    }

    pub async fn is_committed(&self, hash: &H256) -> Result<bool, EvidenceError> {
        match self.cache.peek(hash) {
            Some(status) => Ok(*status == EvidenceStatus::Committed),
            None => self.store.is_committed(hash).await,
        }
    }

    pub async fn pending_evidence(&self) -> Result<Vec<Evidence>, EvidenceError> {
        self.store.load_pending(0, u64::MAX, None).await
    }

    fn is_expired(&self, evidence_height: u64) -> bool {
        evidence_height.saturating_add(self.max_age) < self.height
    }

    /// Removes expired pending evidence and returns the next height at which
    /// pruning is due. Store errors are logged.
    async fn prune_expired_pending_evidence(&mut self) -> u64 {
        let cutoff = self.height.saturating_sub(self.max_age);
        match self.store.load_pending(0, cutoff, None).await {
            Ok(expired) => {
                for evidence in expired {
                    if let Err(e) = self.store.remove_pending(&evidence).await {
                        warn!("Failed to prune evidence {:?}: {}", evidence.hash(), e);
                        continue;
                    }
                    self.cache.pop(&evidence.hash());
                    debug!("Pruned expired evidence at height {}", evidence.height());
                }
            }
            Err(e) => warn!("Failed to load expired evidence: {}", e),
        }

        let oldest = match self.store.load_pending(cutoff, u64::MAX, Some(1)).await {
            Ok(remaining) => remaining.first().map(Evidence::height),
            Err(e) => {
                warn!("Failed to load pending evidence: {}", e);
                None
            }
        };
        oldest.unwrap_or(self.height) + self.max_age + 1
    }
}
