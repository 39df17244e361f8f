use async_trait::async_trait;
use log::{debug, info};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::config::GenesisConfig;
use crate::consensus::backend::{Backend, BackendError, BroadcastTarget, ProcessResult};
use crate::consensus::evpool::{Evidence, EvidencePool};
use crate::consensus::extra_data::ExtraData;
use crate::consensus::messages::ConsensusMessage;
use crate::consensus::pending_block::PendingBlock;
use crate::consensus::validator_set::{ActiveValidatorSet, Validator, ValidatorSetError};
use crate::consensus::vote::VoteVersion;
use crate::ledger::state::{self, ChainState};
use crate::security::{public_key_from_hex, SignerError};
use crate::types::block::{Block, BlockHeader};

pub type OutboundMessage = (ConsensusMessage, BroadcastTarget);

#[derive(thiserror::Error, Debug)]
pub enum GenesisError {
    #[error("Invalid genesis key: {0}")]
    Key(#[from] SignerError),
    #[error("Invalid genesis validators: {0}")]
    Validators(#[from] ValidatorSetError),
}

/// Validator set of height 1, in genesis order.
pub fn genesis_validators(genesis: &GenesisConfig) -> Result<ActiveValidatorSet, GenesisError> {
    let validators = genesis
        .validators
        .iter()
        .map(|v| {
            let public_key = public_key_from_hex(&v.public_key)?;
            let alternate = v
                .alternate_public_key
                .as_deref()
                .map(public_key_from_hex)
                .transpose()?;
            Ok(Validator::new(public_key, alternate, v.voting_power))
        })
        .collect::<Result<Vec<_>, GenesisError>>()?;
    Ok(ActiveValidatorSet::new(validators)?)
}

/// In-memory chain behind a development node. Outbound consensus messages
/// and committed blocks leave through channels.
pub struct DevChain {
    chain_id: u64,
    state: RwLock<ChainState>,
    evidence: Arc<Mutex<EvidencePool>>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    committed: mpsc::UnboundedSender<Block>,
    batched_votes_height: Option<u64>,
}

impl DevChain {
    pub fn new(
        chain_id: u64,
        genesis: BlockHeader,
        validators: ActiveValidatorSet,
        evidence: Arc<Mutex<EvidencePool>>,
        batched_votes_height: Option<u64>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<OutboundMessage>,
        mpsc::UnboundedReceiver<Block>,
    ) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (committed, committed_rx) = mpsc::unbounded_channel();
        let chain = Self {
            chain_id,
            state: RwLock::new(ChainState::new(genesis, validators)),
            evidence,
            outbound,
            committed,
            batched_votes_height,
        };
        (chain, outbound_rx, committed_rx)
    }

    pub fn head(&self) -> BlockHeader {
        self.state.read().head().clone()
    }

    pub fn height(&self) -> u64 {
        self.state.read().height()
    }

    /// Validators of the next height.
    pub fn validators(&self) -> ActiveValidatorSet {
        self.state.read().validators().clone()
    }

    pub fn block(&self, height: u64) -> Option<Block> {
        self.state.read().block(height).cloned()
    }

    pub fn evidence_pool(&self) -> Arc<Mutex<EvidencePool>> {
        self.evidence.clone()
    }

    fn check_parent(&self, block: &Block) -> Result<(), BackendError> {
        let head = self.state.read().head().hash();
        if block.header.parent_hash != head {
            return Err(BackendError::UnknownParent(block.header.parent_hash));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for DevChain {
    async fn pre_process_block(&self, block: &Block) -> Result<ProcessResult, BackendError> {
        self.check_parent(block)?;
        block.validate()?;
        let validators = self.validators();
        for evidence in &block.evidence {
            evidence.verify(&validators)?;
        }

        let result = self.state.read().execute(&block.transactions);
        if result.state_root != block.header.state_root || result.receipts_root != block.header.receipts_root {
            return Err(BackendError::Execution(format!(
                "roots of block {:?} do not match execution",
                block.hash()
            )));
        }
        Ok(result)
    }

    async fn commit_block(&self, block: Block, result: ProcessResult) -> Result<(), BackendError> {
        let height = block.height();
        {
            let mut state = self.state.write();
            if block.header.parent_hash != state.head().hash() {
                return Err(BackendError::UnknownParent(block.header.parent_hash));
            }
            ExtraData::verify(self.chain_id, &block.header, state.validators())?;
            if result.state_root != block.header.state_root {
                return Err(BackendError::Execution(format!(
                    "state root mismatch committing height {}",
                    height
                )));
            }
            state.apply(block.clone());
        }

        self.evidence.lock().await.update(&block.evidence, height).await?;
        info!(
            "Chain advanced to height {} ({} transactions)",
            height,
            block.transactions.len()
        );
        if self.committed.send(block).is_err() {
            debug!("No block driver listening for height {}", height);
        }
        Ok(())
    }

    async fn finalize_pending_block(&self, pending: &PendingBlock) -> Result<ProcessResult, BackendError> {
        let head = self.head();
        if pending.parent_hash() != head.hash() {
            return Err(BackendError::UnknownParent(pending.parent_hash()));
        }
        Ok(state::execute(&head.state_root, pending.transactions()))
    }

    fn broadcast_message(&self, message: ConsensusMessage, target: BroadcastTarget) {
        if self.outbound.send((message, target)).is_err() {
            debug!("Outbound channel closed");
        }
    }

    async fn pick_evidence(&self, height: u64, count: usize) -> Result<Vec<Evidence>, BackendError> {
        Ok(self.evidence.lock().await.pick_evidence(height, count).await?)
    }

    async fn add_evidence(&self, evidence: Evidence) -> Result<(), BackendError> {
        evidence.verify(&self.validators())?;
        self.evidence.lock().await.add_evidence(evidence).await?;
        Ok(())
    }

    fn vote_version(&self, height: u64) -> VoteVersion {
        match self.batched_votes_height {
            Some(fork) if height >= fork => VoteVersion::Batched,
            _ => VoteVersion::Individual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvidenceConfig, GenesisValidator};
    use crate::consensus::evpool::MemoryEvidenceStore;
    use crate::consensus::test_utils::{signers, validator_set};
    use crate::types::transaction::Transaction;
    use assert_matches::assert_matches;
    use chrono::Utc;

    async fn chain(batched_from: Option<u64>) -> (DevChain, BlockHeader) {
        let signers = signers(1);
        let genesis = BlockHeader::genesis(Utc::now());
        let pool = EvidencePool::init(Arc::new(MemoryEvidenceStore::new()), &EvidenceConfig::default(), 0)
            .await
            .unwrap();
        let (chain, _outbound, _committed) = DevChain::new(
            1,
            genesis.clone(),
            validator_set(&signers, &[1]),
            Arc::new(Mutex::new(pool)),
            batched_from,
        );
        (chain, genesis)
    }

    async fn finalized(chain: &DevChain, parent: &BlockHeader, txs: Vec<Transaction>) -> Block {
        let mut pending = PendingBlock::new(parent, Default::default(), Utc::now());
        pending.append_transactions(txs).unwrap();
        pending.complete(Vec::new()).unwrap();
        let result = chain.finalize_pending_block(&pending).await.unwrap();
        pending.finalize(result.state_root, result.receipts_root).unwrap();
        pending.into_block().unwrap()
    }

    #[tokio::test]
    async fn finalized_draft_passes_pre_processing() {
        let (chain, genesis) = chain(None).await;
        let block = finalized(&chain, &genesis, vec![Transaction::new("a".to_string(), 1, vec![1])]).await;
        let result = chain.pre_process_block(&block).await.unwrap();
        assert_eq!(result.state_root, block.header.state_root);
    }

    #[tokio::test]
    async fn tampered_roots_are_rejected() {
        let (chain, genesis) = chain(None).await;
        let mut block = finalized(&chain, &genesis, Vec::new()).await;
        block.header.state_root = crate::types::primitives::H256::digest(b"forged");
        assert_matches!(chain.pre_process_block(&block).await, Err(BackendError::Execution(_)));
    }

    #[tokio::test]
    async fn commit_requires_a_proof() {
        let (chain, genesis) = chain(None).await;
        let block = finalized(&chain, &genesis, Vec::new()).await;
        let result = chain.pre_process_block(&block).await.unwrap();
        assert_matches!(
            chain.commit_block(block, result).await,
            Err(BackendError::InvalidCommit(_))
        );
        assert_eq!(chain.height(), 0);
    }

    #[tokio::test]
    async fn vote_version_switches_at_fork_height() {
        let (chain, _) = chain(Some(10)).await;
        assert_eq!(chain.vote_version(9), VoteVersion::Individual);
        assert_eq!(chain.vote_version(10), VoteVersion::Batched);
    }

    #[test]
    fn genesis_validators_parse_hex_keys() {
        let signers = signers(2);
        let genesis = GenesisConfig {
            timestamp: Utc::now(),
            validators: signers
                .iter()
                .map(|s| GenesisValidator {
                    public_key: hex::encode(s.public_key().as_bytes()),
                    alternate_public_key: s.alternate_public_key().map(|k| hex::encode(k.as_bytes())),
                    voting_power: 3,
                })
                .collect(),
        };
        let set = genesis_validators(&genesis).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.total_voting_power(), 6);
        assert_eq!(set.validators()[0].address, signers[0].address());
    }
}
