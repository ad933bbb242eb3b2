//! Persistent CAS backend using sled database

use async_trait::async_trait;
use rendezvous_core::{CasOutcome, RendezvousBackend, RendezvousError, RendezvousResult, Token};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const RENDEZVOUS_TREE: &str = "rendezvous";

/// Record layout inside the sled tree
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    token: u64,
    state: Vec<u8>,
}

impl StoredRecord {
    fn decode(bytes: &[u8]) -> RendezvousResult<Self> {
        bincode::deserialize(bytes).map_err(|e| RendezvousError::StateCorruption(e.to_string()))
    }

    fn encode(&self) -> RendezvousResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// CAS backend persisting one record per run in a sled tree
///
/// The database is locked to one process; participants of one process share
/// it by cloning the backend or opening further runs with `for_run`.
#[derive(Clone)]
pub struct SledBackend {
    db: Db,
    tree: Tree,
    run_id: String,
}

impl SledBackend {
    /// Open or create the sled database at `path`
    pub fn open<P: AsRef<Path>>(path: P, run_id: impl Into<String>) -> RendezvousResult<Self> {
        let db = sled::open(path).map_err(|e| RendezvousError::StorageError(e.to_string()))?;
        Self::with_db(db, run_id)
    }

    /// Backend for `run_id` over an already open database
    ///
    /// Records live in a dedicated tree, so the database can be shared with
    /// other users.
    pub fn with_db(db: Db, run_id: impl Into<String>) -> RendezvousResult<Self> {
        let tree = db
            .open_tree(RENDEZVOUS_TREE)
            .map_err(|e| RendezvousError::StorageError(e.to_string()))?;

        Ok(Self {
            db,
            tree,
            run_id: run_id.into(),
        })
    }

    /// Handle on another run in the same database
    pub fn for_run(&self, run_id: impl Into<String>) -> Self {
        Self {
            db: self.db.clone(),
            tree: self.tree.clone(),
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run ids with a stored record
    pub fn runs(&self) -> RendezvousResult<Vec<String>> {
        self.tree
            .iter()
            .keys()
            .map(|key| {
                key.map(|k| String::from_utf8_lossy(&k).into_owned())
                    .map_err(|e| RendezvousError::StorageError(e.to_string()))
            })
            .collect()
    }

    fn read(&self) -> RendezvousResult<Option<(sled::IVec, StoredRecord)>> {
        match self
            .tree
            .get(self.run_id.as_bytes())
            .map_err(|e| RendezvousError::StorageError(e.to_string()))?
        {
            Some(raw) => {
                let record = StoredRecord::decode(&raw)?;
                Ok(Some((raw, record)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RendezvousBackend for SledBackend {
    fn name(&self) -> &str {
        "sled"
    }

    async fn get_state(&self) -> RendezvousResult<Option<(Vec<u8>, Token)>> {
        Ok(self
            .read()?
            .map(|(_, record)| (record.state, Token::new(record.token))))
    }

    async fn set_state(
        &self,
        state: Vec<u8>,
        token: Option<Token>,
    ) -> RendezvousResult<Option<CasOutcome>> {
        loop {
            let current = self.read()?;

            let (expected, new_token) = match (&current, token) {
                (None, None) => (None, Token::default().next()),
                (None, Some(_)) => return Ok(None),
                (Some((raw, record)), Some(token)) if record.token == token.0 => {
                    (Some(raw.clone()), token.next())
                }
                (Some((_, record)), _) => {
                    return Ok(Some(CasOutcome {
                        state: record.state.clone(),
                        token: Token::new(record.token),
                        applied: false,
                    }));
                }
            };

            let encoded = StoredRecord {
                token: new_token.0,
                state: state.clone(),
            }
            .encode()?;

            let swapped = self
                .tree
                .compare_and_swap(self.run_id.as_bytes(), expected, Some(encoded))
                .map_err(|e| RendezvousError::StorageError(e.to_string()))?;

            match swapped {
                Ok(()) => {
                    self.tree
                        .flush_async()
                        .await
                        .map_err(|e| RendezvousError::StorageError(e.to_string()))?;
                    return Ok(Some(CasOutcome {
                        state,
                        token: new_token,
                        applied: true,
                    }));
                }
                // The record moved between our read and the swap; re-check the token
                Err(_) => debug!("Record of run '{}' changed during write", self.run_id),
            }
        }
    }
}

/// Shared sled backend
pub type SharedSledBackend = Arc<SledBackend>;

/// Create a shared sled backend
pub fn create_sled_backend<P: AsRef<Path>>(
    path: P,
    run_id: impl Into<String>,
) -> RendezvousResult<SharedSledBackend> {
    Ok(Arc::new(SledBackend::open(path, run_id)?))
}
