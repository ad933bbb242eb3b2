//! The shared rendezvous record
//!
//! One `RendezvousState` exists per run. It is the only thing participants
//! exchange; every local decision is derived from the last accepted copy.

use chrono::Duration;
use rendezvous_core::{NodeDescriptor, RendezvousError, RendezvousResult, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Phase of a round as seen in the shared state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// Fewer than `min_nodes` participants
    WaitingForQuorum,
    /// Quorum reached, accepting late joiners until the deadline
    LastCall,
    /// Ranks assigned
    Complete,
    /// Run closed for good
    Closed,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundPhase::WaitingForQuorum => "waiting-for-quorum",
            RoundPhase::LastCall => "last-call",
            RoundPhase::Complete => "complete",
            RoundPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Shared state of one rendezvous run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousState {
    /// Current round number
    pub round: u64,
    /// Whether ranks have been assigned for this round
    pub complete: bool,
    /// Last call deadline, set once quorum is reached
    pub deadline: Option<Timestamp>,
    /// Whether the run has been closed
    pub closed: bool,
    /// Participants and their ranks (zero until the round completes)
    pub participants: BTreeMap<NodeDescriptor, usize>,
    /// Nodes waiting for the next round
    pub wait_list: BTreeSet<NodeDescriptor>,
    /// Participants that left this round on their own
    pub departed: BTreeSet<NodeDescriptor>,
    /// Last heartbeat of every live node
    pub last_heartbeats: BTreeMap<NodeDescriptor, Timestamp>,
}

impl RendezvousState {
    /// Empty state of round 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode the state as written to a backend
    pub fn to_bytes(&self) -> RendezvousResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a backend record
    ///
    /// Bytes that do not decode are reported as `StateCorruption`.
    pub fn from_bytes(bytes: &[u8]) -> RendezvousResult<Self> {
        bincode::deserialize(bytes).map_err(|e| RendezvousError::StateCorruption(e.to_string()))
    }

    /// Lifecycle phase derived from the round flags
    pub fn phase(&self) -> RoundPhase {
        if self.closed {
            RoundPhase::Closed
        } else if self.complete {
            RoundPhase::Complete
        } else if self.deadline.is_some() {
            RoundPhase::LastCall
        } else {
            RoundPhase::WaitingForQuorum
        }
    }

    /// Whether `node` is a participant of the current round
    pub fn is_participant(&self, node: &NodeDescriptor) -> bool {
        self.participants.contains_key(node)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Rank of `node` once the round is complete
    pub fn rank_of(&self, node: &NodeDescriptor) -> Option<usize> {
        if !self.complete {
            return None;
        }
        self.participants.get(node).copied()
    }

    /// Participants ordered by rank
    pub fn ranked_participants(&self) -> Vec<(NodeDescriptor, usize)> {
        let mut ranked: Vec<_> = self
            .participants
            .iter()
            .map(|(node, rank)| (node.clone(), *rank))
            .collect();
        ranked.sort_by_key(|(_, rank)| *rank);
        ranked
    }

    /// Assign ranks by ascending canonical descriptor string
    ///
    /// Every participant computes the same assignment from the same state.
    pub fn assign_ranks(&mut self) {
        let mut nodes: Vec<NodeDescriptor> = self.participants.keys().cloned().collect();
        nodes.sort_by_cached_key(|node| node.to_string());

        for (rank, node) in nodes.into_iter().enumerate() {
            self.participants.insert(node, rank);
        }
    }

    /// Nodes whose last heartbeat is older than `margin` at `now`
    pub fn expired_nodes(&self, now: Timestamp, margin: Duration) -> Vec<NodeDescriptor> {
        let expire_time = now.offset(-margin);
        self.last_heartbeats
            .iter()
            .filter(|(_, last_heartbeat)| **last_heartbeat < expire_time)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Drop every trace of `nodes`; returns true if a participant was among them
    pub fn evict(&mut self, nodes: &[NodeDescriptor], min_nodes: usize) -> bool {
        let mut participant_removed = false;

        for node in nodes {
            self.last_heartbeats.remove(node);
            self.wait_list.remove(node);
            if self.participants.remove(node).is_some() {
                participant_removed = true;
            }
        }

        if participant_removed {
            self.after_participant_removed(min_nodes);
        }

        participant_removed
    }

    /// Bookkeeping after the participant set shrank
    ///
    /// A complete round with nobody left moves on to the next round. An
    /// incomplete round that fell below quorum loses its last call deadline.
    pub fn after_participant_removed(&mut self, min_nodes: usize) {
        if self.complete {
            if self.participants.is_empty() {
                self.complete = false;
                self.deadline = None;
                self.departed.clear();
                self.round += 1;
            }
        } else if self.participants.len() < min_nodes {
            self.deadline = None;
        }
    }
}
