mod peer_state;

pub use peer_state::PeerRoundState;

use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::consensus::backend::{Backend, BroadcastTarget};
use crate::consensus::messages::ConsensusMessage;
use crate::consensus::state::{GossipKind, StateMachineHandle};
use crate::consensus::types::PeerId;
use crate::consensus::ConsensusError;

/// A connected peer: its round state and the two gossip loops feeding it.
pub struct ConsensusPeer {
    id: PeerId,
    state: Mutex<PeerRoundState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsensusPeer {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            state: Mutex::new(PeerRoundState::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn round_state(&self) -> PeerRoundState {
        self.state.lock().clone()
    }

    fn abort(&self) -> Vec<JoinHandle<()>> {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        tasks
    }
}

/// Routes peer messages into the state machine and runs per-peer gossip.
pub struct ConsensusProtocol {
    handle: StateMachineHandle,
    backend: Arc<dyn Backend>,
    gossip_sleep: Duration,
    peers: DashMap<PeerId, Arc<ConsensusPeer>>,
}

impl ConsensusProtocol {
    pub fn new(handle: StateMachineHandle, backend: Arc<dyn Backend>, gossip_sleep: Duration) -> Self {
        Self {
            handle,
            backend,
            gossip_sleep,
            peers: DashMap::new(),
        }
    }

    /// Returns false when the peer is already connected.
    pub fn add_peer(&self, id: PeerId) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        let peer = Arc::new(ConsensusPeer::new(id.clone()));
        let tasks = [GossipKind::Data, GossipKind::Votes]
            .into_iter()
            .map(|kind| {
                tokio::spawn(gossip_loop(
                    kind,
                    peer.clone(),
                    self.handle.clone(),
                    self.backend.clone(),
                    self.gossip_sleep,
                ))
            })
            .collect();
        *peer.tasks.lock() = tasks;
        self.peers.insert(id.clone(), peer);
        info!("Consensus peer {} added", id);
        true
    }

    pub fn remove_peer(&self, id: &PeerId) -> bool {
        match self.peers.remove(id) {
            Some((_, peer)) => {
                peer.abort();
                info!("Consensus peer {} removed", id);
                true
            }
            None => false,
        }
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<ConsensusPeer>> {
        self.peers.get(id).map(|peer| peer.value().clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn handle_raw(&self, from: &PeerId, bytes: &[u8]) -> Result<(), ConsensusError> {
        let message = ConsensusMessage::decode(bytes)?;
        self.handle_message(from, message)
    }

    /// Updates the sender's round state and forwards what the state machine
    /// needs. Peer announcements stop here.
    pub fn handle_message(&self, from: &PeerId, message: ConsensusMessage) -> Result<(), ConsensusError> {
        let peer = self
            .peer(from)
            .ok_or_else(|| ConsensusError::UnknownPeer(from.clone()))?;
        message.validate_basic()?;

        let forward = {
            let mut prs = peer.state.lock();
            match &message {
                ConsensusMessage::NewRoundStep(m) => {
                    prs.apply_new_round_step(m);
                    false
                }
                ConsensusMessage::NewValidBlock(m) => {
                    prs.apply_new_valid_block(m);
                    false
                }
                ConsensusMessage::ProposalPol(m) => {
                    prs.apply_proposal_pol(m);
                    false
                }
                ConsensusMessage::HasVote(m) => {
                    prs.apply_has_vote(m);
                    false
                }
                ConsensusMessage::VoteSetBits(m) => {
                    prs.apply_vote_set_bits(m);
                    false
                }
                ConsensusMessage::Proposal(p) => {
                    prs.set_has_proposal(p);
                    true
                }
                ConsensusMessage::ProposalBlock(b) => {
                    prs.set_has_proposal_block(b.height(), &b.hash());
                    true
                }
                ConsensusMessage::Vote(v) => {
                    prs.set_has_vote(v.height, v.round, v.vote_type, v.index);
                    true
                }
                ConsensusMessage::VoteSetMaj23(_) | ConsensusMessage::GetProposalBlock(_) => true,
            }
        };

        if forward {
            self.handle.push_consensus_message(from.clone(), message);
        }
        Ok(())
    }

    /// Stops every gossip loop and waits for them to exit.
    pub async fn shutdown(&self) {
        let mut tasks = Vec::new();
        let ids: Vec<PeerId> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, peer)) = self.peers.remove(&id) {
                tasks.extend(peer.abort());
            }
        }
        join_all(tasks).await;
        debug!("Consensus protocol stopped");
    }
}

async fn gossip_loop(
    kind: GossipKind,
    peer: Arc<ConsensusPeer>,
    handle: StateMachineHandle,
    backend: Arc<dyn Backend>,
    sleep: Duration,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + sleep, sleep);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if handle.is_closed() {
            break;
        }

        let snapshot = peer.round_state();
        let reply = match handle.request_gossip(kind, snapshot).await {
            Some(reply) if !reply.messages.is_empty() => reply,
            _ => continue,
        };

        {
            let mut prs = peer.state.lock();
            prs.ensure_vote_bit_arrays(reply.height, reply.validator_count);
            if let Some(round) = reply.catchup_commit_round {
                prs.ensure_catchup_commit_round(reply.height, round, reply.validator_count);
            }
            for message in &reply.messages {
                prs.mark_sent(message);
            }
        }
        for message in reply.messages {
            backend.broadcast_message(message, BroadcastTarget::To(peer.id.clone()));
        }
    }
    debug!("{:?} gossip for {} stopped", kind, peer.id);
}
