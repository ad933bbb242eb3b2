//! Rendezvous operations
//!
//! An operation looks at the latest accepted state and decides the next
//! step for the local node. Operations never touch the state themselves;
//! the executor applies the chosen action and writes it through the backend.

use rendezvous_core::{
    HeartbeatConfig, NodeDescriptor, RendezvousError, RendezvousTimeout, Timestamp,
};
use rendezvous_state::RendezvousState;
use std::fmt;
use tokio::time::Instant;

/// Run-wide settings shared by every operation of a handler
#[derive(Debug, Clone)]
pub struct RendezvousSettings {
    pub run_id: String,
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub timeout: RendezvousTimeout,
    pub heartbeat: HeartbeatConfig,
}

/// Next step chosen by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousAction {
    KeepAlive,
    AddToParticipants,
    AddToWaitList,
    RemoveFromParticipants,
    RemoveFromWaitList,
    MarkRendezvousComplete,
    MarkRendezvousClosed,
    /// Wait for other nodes and read again
    Sync,
    ErrorClosed,
    ErrorTimeout,
    Finish,
}

impl fmt::Display for RendezvousAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RendezvousAction::KeepAlive => "keep_alive",
            RendezvousAction::AddToParticipants => "add_to_participants",
            RendezvousAction::AddToWaitList => "add_to_wait_list",
            RendezvousAction::RemoveFromParticipants => "remove_from_participants",
            RendezvousAction::RemoveFromWaitList => "remove_from_wait_list",
            RendezvousAction::MarkRendezvousComplete => "mark_rendezvous_complete",
            RendezvousAction::MarkRendezvousClosed => "mark_rendezvous_closed",
            RendezvousAction::Sync => "sync",
            RendezvousAction::ErrorClosed => "error_closed",
            RendezvousAction::ErrorTimeout => "error_timeout",
            RendezvousAction::Finish => "finish",
        };
        f.write_str(name)
    }
}

/// Everything an operation may look at when picking an action
pub struct RendezvousContext<'a> {
    pub node: &'a NodeDescriptor,
    pub state: &'a RendezvousState,
    pub settings: &'a RendezvousSettings,
    /// Monotonic time, compared against the operation deadline
    pub now: Instant,
    /// Wall-clock time, compared against times stored in the shared state
    pub wall_now: Timestamp,
}

impl RendezvousContext<'_> {
    /// True once the local heartbeat is at least one interval old
    pub fn should_keep_alive(&self) -> bool {
        match self.state.last_heartbeats.get(self.node) {
            None => true,
            Some(last_heartbeat) => {
                let interval = chrono::Duration::from_std(self.settings.heartbeat.interval)
                    .unwrap_or(chrono::Duration::MAX);
                *last_heartbeat <= self.wall_now.offset(-interval)
            }
        }
    }
}

/// A step-wise rendezvous operation
pub trait RendezvousOp: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick the next action from the current state
    fn next_action(&self, ctx: &RendezvousContext<'_>, deadline: Instant) -> RendezvousAction;

    /// Error reported when the operation deadline elapses
    fn timeout_error(&self, ctx: &RendezvousContext<'_>) -> RendezvousError {
        RendezvousError::Timeout(format!(
            "The {} operation of rendezvous '{}' did not finish in time.",
            self.name(),
            ctx.settings.run_id
        ))
    }
}

/// Join the current round and wait for it to complete
pub struct JoinOp;

impl RendezvousOp for JoinOp {
    fn name(&self) -> &'static str {
        "join"
    }

    fn next_action(&self, ctx: &RendezvousContext<'_>, deadline: Instant) -> RendezvousAction {
        let state = ctx.state;

        if state.closed {
            return RendezvousAction::ErrorClosed;
        }

        let is_participant = state.is_participant(ctx.node);

        if state.complete && is_participant {
            return RendezvousAction::Finish;
        }

        if ctx.now > deadline {
            return RendezvousAction::ErrorTimeout;
        }

        if state.complete {
            // Late arrivals queue up for the next round
            if state.participant_count() < ctx.settings.max_nodes
                && !state.wait_list.contains(ctx.node)
            {
                return RendezvousAction::AddToWaitList;
            }
        } else if is_participant {
            if state.participant_count() >= ctx.settings.min_nodes {
                if let Some(last_call_deadline) = state.deadline {
                    if last_call_deadline < ctx.wall_now {
                        return RendezvousAction::MarkRendezvousComplete;
                    }
                }
            }
        } else {
            return RendezvousAction::AddToParticipants;
        }

        if ctx.should_keep_alive() {
            return RendezvousAction::KeepAlive;
        }

        RendezvousAction::Sync
    }

    fn timeout_error(&self, ctx: &RendezvousContext<'_>) -> RendezvousError {
        RendezvousError::QuorumTimeout {
            run_id: ctx.settings.run_id.clone(),
            participants: ctx.state.participant_count(),
            min_nodes: ctx.settings.min_nodes,
        }
    }
}

/// Leave the current round or wait list
pub struct ExitOp;

impl RendezvousOp for ExitOp {
    fn name(&self) -> &'static str {
        "exit"
    }

    fn next_action(&self, ctx: &RendezvousContext<'_>, deadline: Instant) -> RendezvousAction {
        let action = if ctx.state.is_participant(ctx.node) {
            RendezvousAction::RemoveFromParticipants
        } else if ctx.state.wait_list.contains(ctx.node) {
            RendezvousAction::RemoveFromWaitList
        } else {
            return RendezvousAction::Finish;
        };

        if ctx.now > deadline {
            return RendezvousAction::ErrorTimeout;
        }
        action
    }
}

/// Close the run for good
pub struct CloseOp;

impl RendezvousOp for CloseOp {
    fn name(&self) -> &'static str {
        "close"
    }

    fn next_action(&self, ctx: &RendezvousContext<'_>, deadline: Instant) -> RendezvousAction {
        if ctx.state.closed {
            RendezvousAction::Finish
        } else if ctx.now > deadline {
            RendezvousAction::ErrorTimeout
        } else {
            RendezvousAction::MarkRendezvousClosed
        }
    }

    fn timeout_error(&self, ctx: &RendezvousContext<'_>) -> RendezvousError {
        RendezvousError::CloseTimeout {
            run_id: ctx.settings.run_id.clone(),
        }
    }
}

/// Refresh the local heartbeat if it is due
pub struct KeepAliveOp;

impl RendezvousOp for KeepAliveOp {
    fn name(&self) -> &'static str {
        "keep_alive"
    }

    fn next_action(&self, ctx: &RendezvousContext<'_>, deadline: Instant) -> RendezvousAction {
        if !ctx.should_keep_alive() {
            RendezvousAction::Finish
        } else if ctx.now > deadline {
            RendezvousAction::ErrorTimeout
        } else {
            RendezvousAction::KeepAlive
        }
    }
}
