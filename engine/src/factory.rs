//! Handler construction from a configuration bag

use chrono::Duration;
use rendezvous_core::{
    HeartbeatConfig, RendezvousBackend, RendezvousError, RendezvousParameters, RendezvousResult,
    RendezvousTimeout, Store,
};
use std::sync::Arc;
use tracing::warn;

use crate::handler::{DynamicRendezvousHandler, HandlerBuilder};

/// Join timeout in seconds
pub const JOIN_TIMEOUT_KEY: &str = "join_timeout";
/// Last call timeout in seconds
pub const LAST_CALL_TIMEOUT_KEY: &str = "last_call_timeout";
/// Close timeout in seconds
pub const CLOSE_TIMEOUT_KEY: &str = "close_timeout";
/// Keep-alive interval in seconds
pub const KEEP_ALIVE_INTERVAL_KEY: &str = "keep_alive_interval";
/// Missed keep-alives tolerated before eviction
pub const KEEP_ALIVE_MAX_ATTEMPT_KEY: &str = "keep_alive_max_attempt";
/// State poll interval in milliseconds
pub const POLL_INTERVAL_MS_KEY: &str = "poll_interval_ms";

/// Create a `DynamicRendezvousHandler` from `params`
///
/// Timeouts and keep-alive settings are read from `params.config`; absent
/// keys take their defaults and parsed values are validated like any other.
pub fn create_handler(
    store: Arc<dyn Store>,
    backend: Arc<dyn RendezvousBackend>,
    params: &RendezvousParameters,
) -> RendezvousResult<DynamicRendezvousHandler> {
    if params.backend != backend.name() {
        warn!(
            "Rendezvous parameters name backend '{}' but '{}' was supplied",
            params.backend,
            backend.name()
        );
    }

    let timeout = RendezvousTimeout::new(
        seconds(params, JOIN_TIMEOUT_KEY)?,
        seconds(params, LAST_CALL_TIMEOUT_KEY)?,
        seconds(params, CLOSE_TIMEOUT_KEY)?,
    )?;

    HandlerBuilder::new(params.run_id.clone(), store, backend)
        .nodes(params.min_nodes, params.max_nodes)
        .timeout(timeout)
        .heartbeat(heartbeat_config(params)?)
        .build()
}

fn seconds(params: &RendezvousParameters, key: &str) -> RendezvousResult<Option<Duration>> {
    match params.get_as_int(key)? {
        None => Ok(None),
        Some(value) => Duration::try_seconds(value)
            .map(Some)
            .ok_or_else(|| out_of_range(key, value)),
    }
}

fn heartbeat_config(params: &RendezvousParameters) -> RendezvousResult<HeartbeatConfig> {
    let mut heartbeat = HeartbeatConfig::default();

    if let Some(value) = params.get_as_int(KEEP_ALIVE_INTERVAL_KEY)? {
        let secs = u64::try_from(value).map_err(|_| out_of_range(KEEP_ALIVE_INTERVAL_KEY, value))?;
        heartbeat.interval = std::time::Duration::from_secs(secs);
    }
    if let Some(value) = params.get_as_int(KEEP_ALIVE_MAX_ATTEMPT_KEY)? {
        heartbeat.max_missed =
            u32::try_from(value).map_err(|_| out_of_range(KEEP_ALIVE_MAX_ATTEMPT_KEY, value))?;
    }
    if let Some(value) = params.get_as_int(POLL_INTERVAL_MS_KEY)? {
        let millis = u64::try_from(value).map_err(|_| out_of_range(POLL_INTERVAL_MS_KEY, value))?;
        heartbeat.poll_interval = std::time::Duration::from_millis(millis);
    }

    Ok(heartbeat)
}

fn out_of_range(key: &str, value: i64) -> RendezvousError {
    RendezvousError::InvalidParameter {
        key: key.to_string(),
        value: value.to_string(),
        expected: "duration",
    }
}
