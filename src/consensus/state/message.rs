use log::warn;
use tokio::sync::{mpsc, oneshot};

use crate::consensus::backend::{BackendError, ProcessResult};
use crate::consensus::messages::ConsensusMessage;
use crate::consensus::pending_block::PendingBlock;
use crate::consensus::protocol::PeerRoundState;
use crate::consensus::timeout_ticker::TimeoutInfo;
use crate::consensus::types::PeerId;
use crate::consensus::validator_set::ActiveValidatorSet;
use crate::metrics;
use crate::types::block::{Block, BlockHeader};
use crate::types::primitives::H256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipKind {
    Data,
    Votes,
}

/// What a peer loop should send, plus what it needs to size the peer's
/// vote bit arrays.
#[derive(Debug, Clone, Default)]
pub struct GossipReply {
    pub height: u64,
    pub validator_count: usize,
    /// Set when the reply carries precommits of our commit round for a peer
    /// in another round.
    pub catchup_commit_round: Option<u32>,
    pub messages: Vec<ConsensusMessage>,
}

/// Everything the state machine reacts to, in arrival order.
#[derive(Debug)]
pub enum StateMachineMessage {
    /// A gossip message from a peer, or our own when `peer` is `None`.
    Consensus {
        peer: Option<PeerId>,
        message: ConsensusMessage,
    },
    Timeout(TimeoutInfo),
    /// The driver moved the chain to `parent`; start the next height.
    NewBlockHeader {
        parent: BlockHeader,
        validators: ActiveValidatorSet,
        pending_block: PendingBlock,
    },
    ProposalBlockBuilt {
        height: u64,
        round: u32,
        result: Result<(Block, ProcessResult), BackendError>,
    },
    ProposalBlockValidated {
        height: u64,
        block: Block,
        result: Result<ProcessResult, BackendError>,
    },
    CommitFinished {
        height: u64,
        hash: H256,
        result: Result<(), BackendError>,
    },
    Gossip {
        kind: GossipKind,
        peer_state: PeerRoundState,
        reply: oneshot::Sender<GossipReply>,
    },
}

/// Producer side of the state machine queue.
#[derive(Debug, Clone)]
pub struct StateMachineHandle {
    sender: mpsc::Sender<StateMachineMessage>,
}

impl StateMachineHandle {
    pub fn new(sender: mpsc::Sender<StateMachineMessage>) -> Self {
        Self { sender }
    }

    /// Never blocks. Sheds the message when the queue is full.
    pub fn push(&self, message: StateMachineMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!("State machine queue full, dropping {}", message.kind());
                metrics::record_dropped_message();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Waits for capacity. Used by internal producers whose messages must
    /// not be lost.
    pub async fn send(&self, message: StateMachineMessage) -> bool {
        self.sender.send(message).await.is_ok()
    }

    pub fn push_consensus_message(&self, peer: PeerId, message: ConsensusMessage) -> bool {
        self.push(StateMachineMessage::Consensus {
            peer: Some(peer),
            message,
        })
    }

    /// `None` when the request was shed or the state machine stopped.
    pub async fn request_gossip(&self, kind: GossipKind, peer_state: PeerRoundState) -> Option<GossipReply> {
        let (reply, response) = oneshot::channel();
        if !self.push(StateMachineMessage::Gossip {
            kind,
            peer_state,
            reply,
        }) {
            return None;
        }
        response.await.ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl StateMachineMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            StateMachineMessage::Consensus { message, .. } => message.kind(),
            StateMachineMessage::Timeout(_) => "timeout",
            StateMachineMessage::NewBlockHeader { .. } => "new_block_header",
            StateMachineMessage::ProposalBlockBuilt { .. } => "proposal_block_built",
            StateMachineMessage::ProposalBlockValidated { .. } => "proposal_block_validated",
            StateMachineMessage::CommitFinished { .. } => "commit_finished",
            StateMachineMessage::Gossip { .. } => "gossip",
        }
    }
}
