//! In-process rendezvous simulation

use rendezvous_core::{
    RendezvousBackend, RendezvousHandler, RendezvousParameters, RendezvousResult, Store,
};
use rendezvous_engine::{
    create_handler, create_rendezvous_channel, RendezvousEvent, CLOSE_TIMEOUT_KEY,
    JOIN_TIMEOUT_KEY, LAST_CALL_TIMEOUT_KEY, POLL_INTERVAL_MS_KEY,
};
use rendezvous_state::{create_memory_store, create_sled_backend, MemoryBackend};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Backend a simulation runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    Memory,
    Sled(PathBuf),
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Sled(_) => "sled",
        }
    }

    /// Open a handle on `run_id`
    pub fn open(&self, run_id: &str) -> RendezvousResult<Arc<dyn RendezvousBackend>> {
        let backend: Arc<dyn RendezvousBackend> = match self {
            BackendKind::Memory => Arc::new(MemoryBackend::new(run_id)),
            BackendKind::Sled(path) => create_sled_backend(path, run_id)?,
        };
        Ok(backend)
    }
}

/// Simulation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub backend: BackendKind,
    pub run_id: String,
    /// Participants started in this process
    pub nodes: usize,
    pub min_nodes: i64,
    pub max_nodes: i64,
    pub join_timeout_secs: Option<i64>,
    pub last_call_timeout_secs: Option<i64>,
    pub close_timeout_secs: Option<i64>,
    pub poll_interval_ms: Option<i64>,
    /// Leave the round once it completed
    pub shutdown: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            run_id: "simulation".into(),
            nodes: 3,
            min_nodes: 2,
            max_nodes: 3,
            join_timeout_secs: None,
            last_call_timeout_secs: Some(1),
            close_timeout_secs: None,
            poll_interval_ms: Some(50),
            shutdown: true,
        }
    }
}

impl SimulationConfig {
    /// Parameters every simulated participant is created from
    pub fn parameters(&self) -> RendezvousResult<RendezvousParameters> {
        let mut params = RendezvousParameters::new(
            self.backend.name(),
            "local",
            self.run_id.clone(),
            self.min_nodes,
            self.max_nodes,
        )?;

        for (key, value) in [
            (JOIN_TIMEOUT_KEY, self.join_timeout_secs),
            (LAST_CALL_TIMEOUT_KEY, self.last_call_timeout_secs),
            (CLOSE_TIMEOUT_KEY, self.close_timeout_secs),
            (POLL_INTERVAL_MS_KEY, self.poll_interval_ms),
        ] {
            if let Some(value) = value {
                params = params.with_config(key, value.to_string());
            }
        }

        Ok(params)
    }
}

/// Outcome of one simulated participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantReport {
    pub node: String,
    pub rank: usize,
    pub world_size: usize,
    pub round: u64,
}

/// Outcome of a simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub run_id: String,
    pub backend: String,
    /// Participants ordered by rank
    pub participants: Vec<ParticipantReport>,
    /// Participants that failed to join, with their error
    pub failures: Vec<String>,
    /// Number of state changes observed through the event channel
    pub events: usize,
}

/// Run `config.nodes` participants until their round completes
pub async fn run_simulation(config: &SimulationConfig) -> anyhow::Result<SimulationReport> {
    let backend = config.backend.open(&config.run_id)?;
    run_simulation_on(config, backend).await
}

/// Like `run_simulation`, against an already opened backend
pub async fn run_simulation_on(
    config: &SimulationConfig,
    backend: Arc<dyn RendezvousBackend>,
) -> anyhow::Result<SimulationReport> {
    let params = config.parameters()?;
    let store: Arc<dyn Store> = create_memory_store();
    let (tx, mut rx) = create_rendezvous_channel();

    info!(
        "Simulating {} node(s) on '{}' backend for run '{}'",
        config.nodes,
        backend.name(),
        config.run_id
    );

    let mut participants = JoinSet::new();
    for _ in 0..config.nodes {
        let handler = create_handler(store.clone(), backend.clone(), &params)?;
        handler.set_event_channel(tx.clone()).await;
        let shutdown = config.shutdown;

        participants.spawn(async move {
            let node = handler.node().to_string();
            let result = handler.next_rendezvous().await;
            if shutdown && result.is_ok() {
                handler.shutdown().await;
            }
            (node, result)
        });
    }
    drop(tx);

    let mut reports = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = participants.join_next().await {
        let (node, result) = joined?;
        match result {
            Ok(info) => reports.push(ParticipantReport {
                node,
                rank: info.rank,
                world_size: info.world_size,
                round: info.round,
            }),
            Err(e) => {
                warn!("{} failed to join: {}", node, e);
                failures.push(format!("{}: {}", node, e));
            }
        }
    }
    reports.sort_by_key(|report| report.rank);

    let mut events = 0;
    while let Ok(event) = rx.try_recv() {
        debug!("Observed {:?}", event);
        if !matches!(event, RendezvousEvent::Evicted(..)) {
            events += 1;
        }
    }

    Ok(SimulationReport {
        run_id: config.run_id.clone(),
        backend: backend.name().to_string(),
        participants: reports,
        failures,
        events,
    })
}
