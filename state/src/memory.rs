//! In-memory backend and store for tests and single-process jobs

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rendezvous_core::{CasOutcome, RendezvousBackend, RendezvousResult, Store, Token};
use std::sync::Arc;

/// Stored state bits and their token
type VersionedRecord = (Vec<u8>, Token);

/// In-memory CAS backend
///
/// Clones share the same record table, so every participant of an
/// in-process job can hold its own handle. `for_run` opens a handle on a
/// different run in the same table.
#[derive(Clone)]
pub struct MemoryBackend {
    run_id: String,
    records: Arc<DashMap<String, VersionedRecord>>,
}

impl MemoryBackend {
    /// Backend for `run_id` over a fresh, empty table
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            records: Arc::new(DashMap::new()),
        }
    }

    /// Handle on another run backed by the same table
    pub fn for_run(&self, run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            records: self.records.clone(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Number of runs with a record
    pub fn run_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl RendezvousBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_state(&self) -> RendezvousResult<Option<(Vec<u8>, Token)>> {
        Ok(self.records.get(&self.run_id).map(|r| r.value().clone()))
    }

    async fn set_state(
        &self,
        state: Vec<u8>,
        token: Option<Token>,
    ) -> RendezvousResult<Option<CasOutcome>> {
        // The entry guard holds the shard lock, making check and write atomic
        match self.records.entry(self.run_id.clone()) {
            Entry::Occupied(mut entry) => {
                let (current_state, current_token) = entry.get().clone();
                if token == Some(current_token) {
                    let new_token = current_token.next();
                    entry.insert((state.clone(), new_token));
                    Ok(Some(CasOutcome {
                        state,
                        token: new_token,
                        applied: true,
                    }))
                } else {
                    Ok(Some(CasOutcome {
                        state: current_state,
                        token: current_token,
                        applied: false,
                    }))
                }
            }
            Entry::Vacant(entry) => {
                if token.is_some() {
                    return Ok(None);
                }
                let new_token = Token::default().next();
                entry.insert((state.clone(), new_token));
                Ok(Some(CasOutcome {
                    state,
                    token: new_token,
                    applied: true,
                }))
            }
        }
    }
}

/// In-memory key-value store
#[derive(Default)]
pub struct MemoryStore {
    data: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set(&self, key: &str, value: Vec<u8>) -> RendezvousResult<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> RendezvousResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).map(|v| v.value().clone()))
    }
}

/// Shared memory store
pub type SharedMemoryStore = Arc<MemoryStore>;

/// Create a shared memory store
pub fn create_memory_store() -> SharedMemoryStore {
    Arc::new(MemoryStore::new())
}
