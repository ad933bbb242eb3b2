//! Core types for elastic rendezvous
//!
//! Defines node identity and the small value types embedded in the shared
//! rendezvous state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

/// Host name of this process, resolved once on first use
static LOCAL_FQDN: LazyLock<String> = LazyLock::new(|| {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".into())
});

/// Returns the host name used in node descriptors of this process
pub fn local_fqdn() -> &'static str {
    &LOCAL_FQDN
}

/// Identity of one logical rendezvous participant
///
/// Several participants may live in one process (for example several workers
/// sharing a launcher); `local_id` tells them apart.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub host: String,
    pub pid: u32,
    pub local_id: u64,
}

impl NodeDescriptor {
    pub fn new(host: impl Into<String>, pid: u32, local_id: u64) -> Self {
        Self {
            host: host.into(),
            pid,
            local_id,
        }
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.host, self.pid, self.local_id)
    }
}

impl fmt::Debug for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeDescriptor({})", self)
    }
}

/// Generates unique node descriptors for the current process
#[derive(Debug, Default)]
pub struct NodeDescGenerator {
    local_id: AtomicU64,
}

impl NodeDescGenerator {
    pub const fn new() -> Self {
        Self {
            local_id: AtomicU64::new(0),
        }
    }

    /// Generate the next descriptor; `local_id` increments on every call
    pub fn generate(&self) -> NodeDescriptor {
        let local_id = self.local_id.fetch_add(1, Ordering::Relaxed);
        NodeDescriptor::new(local_fqdn(), std::process::id(), local_id)
    }
}

/// Timestamp in milliseconds since Unix epoch
///
/// Wall-clock time is used for anything written to the shared state so that
/// deadlines mean the same thing to every participant.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis())
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Shift by a signed duration
    pub fn offset(&self, delta: chrono::Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(delta.num_milliseconds()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Version token for compare-and-swap writes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Token(pub u64);

impl Token {
    pub fn new(value: u64) -> Self {
        Token(value)
    }

    pub fn next(&self) -> Token {
        Token(self.0 + 1)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.0)
    }
}
