//! Local view of the shared state, kept in sync through the backend

use chrono::Duration;
use rendezvous_core::{
    HeartbeatConfig, NodeDescriptor, RendezvousBackend, RendezvousResult, Timestamp, Token,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::record::RendezvousState;

/// Keeps a cached `RendezvousState` and reconciles it with the backend
///
/// Mutations are made to the local copy and flagged with `mark_dirty`; the
/// next `sync` tries to write them with the token of the last read. Whether
/// or not the write wins, the holder ends up with the state the backend
/// accepted.
pub struct BackendStateHolder {
    backend: Arc<dyn RendezvousBackend>,
    min_nodes: usize,
    liveness_margin: Duration,
    state: RendezvousState,
    token: Option<Token>,
    dirty: bool,
    dead_nodes: Vec<NodeDescriptor>,
}

impl BackendStateHolder {
    pub fn new(
        backend: Arc<dyn RendezvousBackend>,
        min_nodes: usize,
        heartbeat: &HeartbeatConfig,
    ) -> Self {
        Self {
            backend,
            min_nodes,
            liveness_margin: heartbeat.liveness_margin(),
            state: RendezvousState::new(),
            token: None,
            dirty: false,
            dead_nodes: Vec::new(),
        }
    }

    pub fn state(&self) -> &RendezvousState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut RendezvousState {
        &mut self.state
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Nodes evicted by the last sync
    pub fn dead_nodes(&self) -> &[NodeDescriptor] {
        &self.dead_nodes
    }

    /// Flag the local state to be written on the next sync
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Reconcile with the backend
    ///
    /// Returns `Some(applied)` if a write was attempted, `None` for a plain
    /// read.
    pub async fn sync(&mut self) -> RendezvousResult<Option<bool>> {
        let (state_bits, token, has_set) = if self.dirty {
            let bits = self.state.to_bytes()?;
            match self.backend.set_state(bits, self.token).await? {
                Some(outcome) => (Some(outcome.state), Some(outcome.token), Some(outcome.applied)),
                None => (None, None, Some(false)),
            }
        } else {
            match self.backend.get_state().await? {
                Some((bits, token)) => (Some(bits), Some(token), None),
                None => (None, None, None),
            }
        };

        self.state = match state_bits {
            Some(bits) => RendezvousState::from_bytes(&bits)?,
            None => RendezvousState::new(),
        };
        self.token = token;
        self.dirty = false;

        match has_set {
            Some(true) => debug!(
                "Wrote rendezvous state of '{}' (round {}, token {:?})",
                self.backend.name(),
                self.state.round,
                self.token
            ),
            Some(false) => debug!(
                "Lost a write race on '{}', continuing from token {:?}",
                self.backend.name(),
                self.token
            ),
            None => {}
        }

        self.sanitize(Timestamp::now());

        Ok(has_set)
    }

    /// Evict nodes whose heartbeat expired
    fn sanitize(&mut self, now: Timestamp) {
        self.dead_nodes = self.state.expired_nodes(now, self.liveness_margin);
        if self.dead_nodes.is_empty() {
            return;
        }

        let names: Vec<String> = self.dead_nodes.iter().map(|n| n.to_string()).collect();
        info!(
            "Evicting {} node(s) with expired heartbeats from round {}: {}",
            names.len(),
            self.state.round,
            names.join(", ")
        );

        self.state.evict(&self.dead_nodes, self.min_nodes);
        self.dirty = true;
    }
}
