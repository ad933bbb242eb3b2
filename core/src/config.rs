//! Configuration types for elastic rendezvous

use crate::error::RendezvousError;
use crate::traits::RendezvousResult;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default join timeout in seconds
pub const DEFAULT_JOIN_TIMEOUT_SECS: i64 = 600;

/// Default last call timeout in seconds
pub const DEFAULT_LAST_CALL_TIMEOUT_SECS: i64 = 30;

/// Default close timeout in seconds
pub const DEFAULT_CLOSE_TIMEOUT_SECS: i64 = 30;

/// Render a duration the way configuration errors report it
pub fn format_duration(duration: &Duration) -> String {
    let millis = duration.num_milliseconds();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}

/// Duration budgets governing one rendezvous round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousTimeout {
    join: Duration,
    last_call: Duration,
    close: Duration,
}

impl RendezvousTimeout {
    /// Build a timeout policy; missing durations take their defaults
    pub fn new(
        join: Option<Duration>,
        last_call: Option<Duration>,
        close: Option<Duration>,
    ) -> RendezvousResult<Self> {
        let timeout = Self {
            join: join.unwrap_or_else(|| Duration::seconds(DEFAULT_JOIN_TIMEOUT_SECS)),
            last_call: last_call
                .unwrap_or_else(|| Duration::seconds(DEFAULT_LAST_CALL_TIMEOUT_SECS)),
            close: close.unwrap_or_else(|| Duration::seconds(DEFAULT_CLOSE_TIMEOUT_SECS)),
        };

        for (field, value) in [
            ("join", timeout.join),
            ("last call", timeout.last_call),
            ("close", timeout.close),
        ] {
            if value <= Duration::zero() {
                return Err(RendezvousError::InvalidTimeout {
                    field,
                    value: format_duration(&value),
                });
            }
        }

        Ok(timeout)
    }

    /// Maximum time to wait for the rendezvous to complete
    pub fn join(&self) -> Duration {
        self.join
    }

    /// Grace period after quorum during which more nodes may still join
    pub fn last_call(&self) -> Duration {
        self.last_call
    }

    /// Maximum time allowed to close the rendezvous
    pub fn close(&self) -> Duration {
        self.close
    }
}

impl Default for RendezvousTimeout {
    fn default() -> Self {
        Self {
            join: Duration::seconds(DEFAULT_JOIN_TIMEOUT_SECS),
            last_call: Duration::seconds(DEFAULT_LAST_CALL_TIMEOUT_SECS),
            close: Duration::seconds(DEFAULT_CLOSE_TIMEOUT_SECS),
        }
    }
}

/// Keep-alive cadence and liveness margin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How often a node refreshes its heartbeat
    pub interval: std::time::Duration,

    /// Missed heartbeats tolerated before a node is evicted
    pub max_missed: u32,

    /// Delay between state syncs while waiting on other nodes
    pub poll_interval: std::time::Duration,
}

impl HeartbeatConfig {
    /// Time after its last heartbeat at which a node counts as dead
    pub fn liveness_margin(&self) -> Duration {
        let margin = self.interval.saturating_mul(self.max_missed);
        Duration::from_std(margin).unwrap_or_else(|_| Duration::MAX)
    }

    pub fn validate(&self) -> RendezvousResult<()> {
        if self.interval.is_zero() {
            return Err(RendezvousError::ConfigError(
                "The keep-alive interval must be positive.".into(),
            ));
        }
        if self.max_missed == 0 {
            return Err(RendezvousError::ConfigError(
                "The keep-alive attempt count must be greater than zero.".into(),
            ));
        }
        Ok(())
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(5),
            max_missed: 3,
            poll_interval: std::time::Duration::from_secs(1),
        }
    }
}

/// Generic configuration bag a handler is built from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousParameters {
    /// Name of the rendezvous backend
    pub backend: String,

    /// Backend endpoint, usually `host:port`
    pub endpoint: String,

    /// Scope of every state record of one job
    pub run_id: String,

    /// Minimum number of nodes admitted to a round
    pub min_nodes: i64,

    /// Maximum number of nodes admitted to a round
    pub max_nodes: i64,

    /// Free-form backend and timeout settings
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl RendezvousParameters {
    pub fn new(
        backend: impl Into<String>,
        endpoint: impl Into<String>,
        run_id: impl Into<String>,
        min_nodes: i64,
        max_nodes: i64,
    ) -> RendezvousResult<Self> {
        let backend = backend.into();
        if backend.trim().is_empty() {
            return Err(RendezvousError::ConfigError(
                "The rendezvous backend name must be a non-empty string.".into(),
            ));
        }

        Ok(Self {
            backend,
            endpoint: endpoint.into(),
            run_id: run_id.into(),
            min_nodes,
            max_nodes,
            config: HashMap::new(),
        })
    }

    /// Add a free-form setting
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Raw value of a backend-specific setting
    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    /// Value of `key` parsed as an integer
    ///
    /// Absent keys yield `None`; unparseable values are an `InvalidParameter`.
    pub fn get_as_int(&self, key: &str) -> RendezvousResult<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| RendezvousError::InvalidParameter {
                    key: key.to_string(),
                    value: value.to_string(),
                    expected: "integer",
                }),
        }
    }

    /// Value of `key` parsed as a boolean
    ///
    /// Accepts `1/0`, `true/false`, `t/f`, `yes/no` and `y/n`, case-insensitively.
    pub fn get_as_bool(&self, key: &str) -> RendezvousResult<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "t" | "yes" | "y" => Ok(Some(true)),
                "0" | "false" | "f" | "no" | "n" => Ok(Some(false)),
                _ => Err(RendezvousError::InvalidParameter {
                    key: key.to_string(),
                    value: value.to_string(),
                    expected: "boolean",
                }),
            },
        }
    }
}
