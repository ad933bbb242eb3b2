//! Core traits defining rendezvous interfaces
//!
//! These traits define the contracts between the coordination engine and the
//! collaborators it does not own: the CAS backend, the key-value store handed
//! to the consumer of a finished round, and the handler surface itself.

use crate::types::Token;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Result type for rendezvous operations
pub type RendezvousResult<T> = Result<T, crate::error::RendezvousError>;

/// Response of a compare-and-swap write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasOutcome {
    /// State held by the backend after the write attempt
    pub state: Vec<u8>,
    /// Token of that state
    pub token: Token,
    /// Whether the caller's state was the one written
    pub applied: bool,
}

/// Versioned storage of the shared rendezvous state
///
/// A backend holds exactly one record per run. Writes are conditional on the
/// token of the last state the caller read: a write with `None` succeeds iff
/// no record exists yet, a write with `Some(token)` succeeds iff the stored
/// token still equals it. A rejected write is not an error; the backend
/// returns the state that won so the caller can retry against it.
#[async_trait]
pub trait RendezvousBackend: Send + Sync {
    /// Backend name, used for diagnostics and config matching
    fn name(&self) -> &str;

    /// Read the current state and its token, if a record exists
    async fn get_state(&self) -> RendezvousResult<Option<(Vec<u8>, Token)>>;

    /// Write `state` if the stored token matches `token`
    ///
    /// Returns `None` if the record does not exist after the attempt, which
    /// only happens when it was removed out of band.
    async fn set_state(
        &self,
        state: Vec<u8>,
        token: Option<Token>,
    ) -> RendezvousResult<Option<CasOutcome>>;
}

/// Key-value store handed to the consumer of a completed round
#[async_trait]
pub trait Store: Send + Sync {
    async fn set(&self, key: &str, value: Vec<u8>) -> RendezvousResult<()>;

    async fn get(&self, key: &str) -> RendezvousResult<Option<Vec<u8>>>;

    async fn exists(&self, key: &str) -> RendezvousResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Outcome of a completed rendezvous for the local node
#[derive(Clone)]
pub struct RendezvousInfo {
    /// Store scoped to this run and round
    pub store: Arc<dyn Store>,
    /// Rank of the local node
    pub rank: usize,
    /// Number of participants in the round
    pub world_size: usize,
    /// Round number
    pub round: u64,
}

impl fmt::Debug for RendezvousInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousInfo")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("round", &self.round)
            .finish()
    }
}

/// Rendezvous handler surface used by launchers
#[async_trait]
pub trait RendezvousHandler: Send + Sync {
    /// Name of the backend in use
    fn get_backend(&self) -> &str;

    /// Run id of the rendezvous
    fn get_run_id(&self) -> &str;

    /// Enter the next round and wait until it completes
    async fn next_rendezvous(&self) -> RendezvousResult<RendezvousInfo>;

    /// Whether the rendezvous has been closed
    async fn is_closed(&self) -> RendezvousResult<bool>;

    /// Mark the rendezvous as closed
    async fn set_closed(&self) -> RendezvousResult<()>;

    /// Number of nodes waiting for the next round
    async fn num_nodes_waiting(&self) -> RendezvousResult<usize>;

    /// Leave the rendezvous; returns false if leaving failed
    async fn shutdown(&self) -> bool;
}
