//! Distributed operation executor
//!
//! Runs an operation to completion against the shared state: sync, ask the
//! operation for the next action, apply it locally and write it back on the
//! next sync. Lost races simply restart the loop from the winning state.

use rendezvous_core::{
    NodeDescriptor, RendezvousBackend, RendezvousError, RendezvousResult, Timestamp,
};
use rendezvous_state::{BackendStateHolder, RendezvousState};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::op::{RendezvousAction, RendezvousContext, RendezvousOp, RendezvousSettings};

/// Events emitted by the executor once the backend accepted a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousEvent {
    /// Node joined the participants of a round
    Joined(u64, NodeDescriptor),
    /// Node queued for the next round
    WaitListed(u64, NodeDescriptor),
    /// Round reached `min_nodes`; the last call started
    LastCallStarted(u64, Timestamp),
    /// Round completed with the given world size
    Completed(u64, usize),
    /// Node left a round
    Left(u64, NodeDescriptor),
    /// Nodes evicted for missing their heartbeats
    Evicted(u64, Vec<NodeDescriptor>),
    /// Run closed
    Closed,
}

/// Apply `action` for `node` to the local copy of the state
///
/// Returns the event to report once the change is accepted.
pub fn apply_action(
    state: &mut RendezvousState,
    node: &NodeDescriptor,
    action: RendezvousAction,
    settings: &RendezvousSettings,
    now: Timestamp,
) -> Option<RendezvousEvent> {
    match action {
        RendezvousAction::KeepAlive => {
            state.last_heartbeats.insert(node.clone(), now);
            None
        }
        RendezvousAction::AddToParticipants => {
            state.wait_list.remove(node);
            state.departed.remove(node);
            state.participants.entry(node.clone()).or_insert(0);
            state.last_heartbeats.insert(node.clone(), now);

            let count = state.participant_count();
            if count >= settings.max_nodes {
                mark_complete(state);
                Some(RendezvousEvent::Completed(state.round, count))
            } else if count >= settings.min_nodes && state.deadline.is_none() {
                let deadline = now.offset(settings.timeout.last_call());
                state.deadline = Some(deadline);
                Some(RendezvousEvent::LastCallStarted(state.round, deadline))
            } else {
                Some(RendezvousEvent::Joined(state.round, node.clone()))
            }
        }
        RendezvousAction::AddToWaitList => {
            state.wait_list.insert(node.clone());
            state.last_heartbeats.insert(node.clone(), now);
            Some(RendezvousEvent::WaitListed(state.round, node.clone()))
        }
        RendezvousAction::RemoveFromParticipants => {
            let round = state.round;
            state.participants.remove(node);
            state.last_heartbeats.remove(node);
            state.departed.insert(node.clone());
            state.after_participant_removed(settings.min_nodes);
            Some(RendezvousEvent::Left(round, node.clone()))
        }
        RendezvousAction::RemoveFromWaitList => {
            state.wait_list.remove(node);
            state.last_heartbeats.remove(node);
            None
        }
        RendezvousAction::MarkRendezvousComplete => {
            mark_complete(state);
            Some(RendezvousEvent::Completed(
                state.round,
                state.participant_count(),
            ))
        }
        RendezvousAction::MarkRendezvousClosed => {
            state.closed = true;
            Some(RendezvousEvent::Closed)
        }
        RendezvousAction::Sync
        | RendezvousAction::ErrorClosed
        | RendezvousAction::ErrorTimeout
        | RendezvousAction::Finish => None,
    }
}

fn mark_complete(state: &mut RendezvousState) {
    state.complete = true;
    state.deadline = None;
    state.assign_ranks();
}

/// Executes rendezvous operations for one node
pub struct DistributedOpExecutor {
    node: NodeDescriptor,
    settings: RendezvousSettings,
    holder: BackendStateHolder,
    /// Events of the local changes not yet written
    pending_events: Vec<RendezvousEvent>,
    event_tx: Option<mpsc::Sender<RendezvousEvent>>,
}

impl DistributedOpExecutor {
    pub fn new(
        node: NodeDescriptor,
        settings: RendezvousSettings,
        backend: Arc<dyn RendezvousBackend>,
    ) -> Self {
        let holder = BackendStateHolder::new(backend, settings.min_nodes, &settings.heartbeat);
        Self {
            node,
            settings,
            holder,
            pending_events: Vec::new(),
            event_tx: None,
        }
    }

    /// Set event channel
    pub fn set_event_channel(&mut self, tx: mpsc::Sender<RendezvousEvent>) {
        self.event_tx = Some(tx);
    }

    pub fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    pub fn settings(&self) -> &RendezvousSettings {
        &self.settings
    }

    /// Last state seen by this executor
    pub fn state(&self) -> &RendezvousState {
        self.holder.state()
    }

    /// Bring the local view up to date with the backend
    pub async fn sync(&mut self) -> RendezvousResult<&RendezvousState> {
        let has_set = self.holder.sync().await?;
        self.after_sync(has_set);
        Ok(self.holder.state())
    }

    /// Run `op` until it finishes, fails or `deadline` passes
    pub async fn run(&mut self, op: &dyn RendezvousOp, deadline: Instant) -> RendezvousResult<()> {
        loop {
            let has_set = self.holder.sync().await?;
            self.after_sync(has_set);

            let wall_now = Timestamp::now();
            let ctx = RendezvousContext {
                node: &self.node,
                state: self.holder.state(),
                settings: &self.settings,
                now: Instant::now(),
                wall_now,
            };
            let action = op.next_action(&ctx, deadline);
            debug!("{} on {}: next action {}", op.name(), self.node, action);

            match action {
                RendezvousAction::Finish => return Ok(()),
                RendezvousAction::ErrorClosed => {
                    return Err(RendezvousError::Closed(self.settings.run_id.clone()));
                }
                RendezvousAction::ErrorTimeout => {
                    let err = op.timeout_error(&ctx);
                    error!("{} on {} failed: {}", op.name(), self.node, err);
                    return Err(err);
                }
                RendezvousAction::Sync => {
                    tokio::time::sleep(self.settings.heartbeat.poll_interval).await;
                }
                _ => {
                    if let Some(event) = apply_action(
                        self.holder.state_mut(),
                        &self.node,
                        action,
                        &self.settings,
                        wall_now,
                    ) {
                        self.pending_events.push(event);
                    }
                    self.holder.mark_dirty();
                }
            }
        }
    }

    fn after_sync(&mut self, has_set: Option<bool>) {
        match has_set {
            Some(true) => {
                for event in std::mem::take(&mut self.pending_events) {
                    self.log_event(&event);
                    self.emit_event(event);
                }
            }
            // The write lost; changes are derived again from the new state
            Some(false) => self.pending_events.clear(),
            None => {}
        }

        // Eviction is local until the next write is accepted
        if !self.holder.dead_nodes().is_empty() {
            let round = self.holder.state().round;
            self.pending_events.push(RendezvousEvent::Evicted(
                round,
                self.holder.dead_nodes().to_vec(),
            ));
        }
    }

    fn log_event(&self, event: &RendezvousEvent) {
        let run_id = &self.settings.run_id;
        match event {
            RendezvousEvent::Joined(round, node) => {
                info!("{} joined round {} of '{}'", node, round, run_id)
            }
            RendezvousEvent::WaitListed(round, node) => info!(
                "{} added to the wait list of '{}' after round {}",
                node, run_id, round
            ),
            RendezvousEvent::LastCallStarted(round, deadline) => info!(
                "Round {} of '{}' reached {} node(s); last call ends at {}",
                round, run_id, self.settings.min_nodes, deadline
            ),
            RendezvousEvent::Completed(round, world_size) => info!(
                "Round {} of '{}' completed with {} node(s)",
                round, run_id, world_size
            ),
            RendezvousEvent::Left(round, node) => {
                info!("{} left round {} of '{}'", node, round, run_id)
            }
            RendezvousEvent::Evicted(..) => {}
            RendezvousEvent::Closed => info!("Rendezvous '{}' closed", run_id),
        }
    }

    fn emit_event(&self, event: RendezvousEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }
}

/// Create rendezvous event channel
pub fn create_rendezvous_channel() -> (
    mpsc::Sender<RendezvousEvent>,
    mpsc::Receiver<RendezvousEvent>,
) {
    mpsc::channel(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::JoinOp;
    use rendezvous_core::{HeartbeatConfig, RendezvousTimeout};
    use rendezvous_state::MemoryBackend;
    use std::time::Duration;

    fn settings(min_nodes: usize, max_nodes: usize) -> RendezvousSettings {
        RendezvousSettings {
            run_id: "job".into(),
            min_nodes,
            max_nodes,
            timeout: RendezvousTimeout::default(),
            heartbeat: HeartbeatConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        }
    }

    fn node(pid: u32) -> NodeDescriptor {
        NodeDescriptor::new("host", pid, 0)
    }

    #[test]
    fn test_add_is_idempotent() {
        let settings = settings(3, 5);
        let mut state = RendezvousState::new();
        let now = Timestamp::now();

        apply_action(&mut state, &node(1), RendezvousAction::AddToParticipants, &settings, now);
        apply_action(&mut state, &node(1), RendezvousAction::AddToParticipants, &settings, now);
        assert_eq!(state.participant_count(), 1);
        assert!(state.deadline.is_none());
    }

    #[test]
    fn test_quorum_sets_shared_deadline() {
        let settings = settings(2, 5);
        let mut state = RendezvousState::new();
        let now = Timestamp::from_millis(1_000);

        apply_action(&mut state, &node(1), RendezvousAction::AddToParticipants, &settings, now);
        let event =
            apply_action(&mut state, &node(2), RendezvousAction::AddToParticipants, &settings, now);

        let expected = now.offset(settings.timeout.last_call());
        assert_eq!(state.deadline, Some(expected));
        assert_eq!(event, Some(RendezvousEvent::LastCallStarted(0, expected)));

        // A third joiner keeps the deadline of the quorum
        let later = Timestamp::from_millis(5_000);
        apply_action(&mut state, &node(3), RendezvousAction::AddToParticipants, &settings, later);
        assert_eq!(state.deadline, Some(expected));
    }

    #[test]
    fn test_max_nodes_completes_immediately() {
        let settings = settings(1, 2);
        let mut state = RendezvousState::new();
        let now = Timestamp::now();

        apply_action(&mut state, &node(1), RendezvousAction::AddToParticipants, &settings, now);
        let event =
            apply_action(&mut state, &node(2), RendezvousAction::AddToParticipants, &settings, now);

        assert!(state.complete);
        assert!(state.deadline.is_none());
        assert_eq!(event, Some(RendezvousEvent::Completed(0, 2)));
        assert_eq!(state.rank_of(&node(1)), Some(0));
        assert_eq!(state.rank_of(&node(2)), Some(1));
    }

    #[test]
    fn test_removal_below_quorum_clears_deadline() {
        let settings = settings(2, 5);
        let mut state = RendezvousState::new();
        let now = Timestamp::now();

        apply_action(&mut state, &node(1), RendezvousAction::AddToParticipants, &settings, now);
        apply_action(&mut state, &node(2), RendezvousAction::AddToParticipants, &settings, now);
        assert!(state.deadline.is_some());

        apply_action(
            &mut state,
            &node(2),
            RendezvousAction::RemoveFromParticipants,
            &settings,
            now,
        );
        assert!(state.deadline.is_none());
        assert!(state.departed.contains(&node(2)));
    }

    #[tokio::test]
    async fn test_single_node_round() {
        let backend = Arc::new(MemoryBackend::new("job"));
        let mut executor = DistributedOpExecutor::new(node(1), settings(1, 1), backend);
        let (tx, mut rx) = create_rendezvous_channel();
        executor.set_event_channel(tx);

        let deadline = Instant::now() + Duration::from_secs(5);
        executor.run(&JoinOp, deadline).await.unwrap();

        assert!(executor.state().complete);
        assert_eq!(executor.state().rank_of(&node(1)), Some(0));
        assert_eq!(rx.try_recv().unwrap(), RendezvousEvent::Completed(0, 1));
    }

    fn seeded_with_ghost(ghost: &NodeDescriptor) -> RendezvousState {
        let mut state = RendezvousState::new();
        state.participants.insert(ghost.clone(), 0);
        state.last_heartbeats.insert(ghost.clone(), Timestamp::from_millis(0));
        state
    }

    #[tokio::test]
    async fn test_eviction_reported_after_write() {
        let ghost = NodeDescriptor::new("ghost", 1, 0);
        let backend = Arc::new(MemoryBackend::new("job"));
        backend
            .set_state(seeded_with_ghost(&ghost).to_bytes().unwrap(), None)
            .await
            .unwrap();

        let mut executor = DistributedOpExecutor::new(node(1), settings(2, 4), backend.clone());
        let (tx, mut rx) = create_rendezvous_channel();
        executor.set_event_channel(tx);

        // The read evicts locally, nothing is written yet
        executor.sync().await.unwrap();
        assert!(!executor.state().is_participant(&ghost));
        assert!(rx.try_recv().is_err());

        executor.sync().await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), RendezvousEvent::Evicted(0, vec![ghost.clone()]));
        assert!(rx.try_recv().is_err());

        let (bits, _) = backend.get_state().await.unwrap().unwrap();
        assert!(!RendezvousState::from_bytes(&bits).unwrap().is_participant(&ghost));
    }

    #[tokio::test]
    async fn test_eviction_dropped_on_lost_race() {
        let ghost = NodeDescriptor::new("ghost", 1, 0);
        let backend = Arc::new(MemoryBackend::new("job"));
        backend
            .set_state(seeded_with_ghost(&ghost).to_bytes().unwrap(), None)
            .await
            .unwrap();

        let mut executor = DistributedOpExecutor::new(node(1), settings(2, 4), backend.clone());
        let (tx, mut rx) = create_rendezvous_channel();
        executor.set_event_channel(tx);
        executor.sync().await.unwrap();

        // Another node removes the ghost first
        let (_, token) = backend.get_state().await.unwrap().unwrap();
        backend
            .set_state(RendezvousState::new().to_bytes().unwrap(), Some(token))
            .await
            .unwrap();

        executor.sync().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(!executor.state().is_participant(&ghost));
    }
}
