//! Store wrappers handed out with a completed round

use async_trait::async_trait;
use rendezvous_core::{RendezvousResult, Store};
use std::sync::Arc;

/// Key prefix for every round store
const ROUND_PREFIX: &str = "rendezvous";

/// Store that namespaces every key under a prefix
pub struct PrefixStore {
    prefix: String,
    inner: Arc<dyn Store>,
}

impl PrefixStore {
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Store>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// Store scoped to one round of one run
    pub fn for_round(inner: Arc<dyn Store>, run_id: &str, round: u64) -> Self {
        Self::new(round_prefix(run_id, round), inner)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl Store for PrefixStore {
    async fn set(&self, key: &str, value: Vec<u8>) -> RendezvousResult<()> {
        self.inner.set(&self.prefixed(key), value).await
    }

    async fn get(&self, key: &str) -> RendezvousResult<Option<Vec<u8>>> {
        self.inner.get(&self.prefixed(key)).await
    }
}

/// Build the key prefix of a round
pub fn round_prefix(run_id: &str, round: u64) -> String {
    format!("{}.{}.{}.", ROUND_PREFIX, run_id, round)
}
