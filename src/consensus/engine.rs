use log::{info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ConsensusConfig;
use crate::consensus::backend::Backend;
use crate::consensus::pending_block::PendingBlock;
use crate::consensus::protocol::ConsensusProtocol;
use crate::consensus::state::{RoundStateSummary, StateMachine, StateMachineHandle, StateMachineMessage};
use crate::consensus::validator_set::ActiveValidatorSet;
use crate::security::Signer;
use crate::types::block::BlockHeader;

/// A running consensus instance: the state machine task plus the peer
/// protocol feeding it.
pub struct ConsensusEngine {
    handle: StateMachineHandle,
    protocol: Arc<ConsensusProtocol>,
    status: watch::Receiver<RoundStateSummary>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ConsensusEngine {
    /// Spawns the state machine at the height after `parent`.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: Arc<ConsensusConfig>,
        chain_id: u64,
        backend: Arc<dyn Backend>,
        signer: Arc<Signer>,
        parent: BlockHeader,
        validators: ActiveValidatorSet,
        pending_block: PendingBlock,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = StateMachineHandle::new(tx);
        let protocol = Arc::new(ConsensusProtocol::new(
            handle.clone(),
            backend.clone(),
            config.peer_gossip_sleep(),
        ));

        let (machine, status) = StateMachine::new(
            config,
            chain_id,
            backend,
            signer,
            handle.clone(),
            parent,
            validators,
            pending_block,
        );
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(machine.run(rx, shutdown_rx));

        Self {
            handle,
            protocol,
            status,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// Starts the next height once the chain has applied `parent`.
    pub async fn new_block_header(
        &self,
        parent: BlockHeader,
        validators: ActiveValidatorSet,
        pending_block: PendingBlock,
    ) -> bool {
        self.handle
            .send(StateMachineMessage::NewBlockHeader {
                parent,
                validators,
                pending_block,
            })
            .await
    }

    pub fn handle(&self) -> StateMachineHandle {
        self.handle.clone()
    }

    pub fn protocol(&self) -> Arc<ConsensusProtocol> {
        self.protocol.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoundStateSummary> {
        self.status.clone()
    }

    pub fn status(&self) -> RoundStateSummary {
        self.status.borrow().clone()
    }

    /// Stops the state machine and every gossip loop. Queued input is
    /// discarded.
    pub async fn abort(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // the task may already be gone
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Consensus task ended abnormally: {}", e);
            }
        }
        self.protocol.shutdown().await;
        info!("Consensus engine stopped");
    }
}

impl Drop for ConsensusEngine {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
