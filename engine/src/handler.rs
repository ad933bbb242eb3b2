//! Dynamic rendezvous handler

use async_trait::async_trait;
use parking_lot::Mutex;
use rendezvous_core::{
    HeartbeatConfig, NodeDescGenerator, NodeDescriptor, RendezvousBackend, RendezvousError,
    RendezvousHandler, RendezvousInfo, RendezvousResult, RendezvousTimeout, Store,
};
use rendezvous_state::PrefixStore;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::executor::{DistributedOpExecutor, RendezvousEvent};
use crate::op::{CloseOp, ExitOp, JoinOp, KeepAliveOp, RendezvousSettings};

/// Descriptors of every handler created by this process
static NODE_DESC_GENERATOR: NodeDescGenerator = NodeDescGenerator::new();

fn budget(duration: chrono::Duration) -> std::time::Duration {
    duration.to_std().unwrap_or_default()
}

/// Builder for `DynamicRendezvousHandler`
pub struct HandlerBuilder {
    run_id: String,
    store: Arc<dyn Store>,
    backend: Arc<dyn RendezvousBackend>,
    min_nodes: i64,
    max_nodes: i64,
    timeout: Option<RendezvousTimeout>,
    heartbeat: HeartbeatConfig,
    node: Option<NodeDescriptor>,
    event_tx: Option<mpsc::Sender<RendezvousEvent>>,
}

impl HandlerBuilder {
    pub fn new(
        run_id: impl Into<String>,
        store: Arc<dyn Store>,
        backend: Arc<dyn RendezvousBackend>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            store,
            backend,
            min_nodes: 1,
            max_nodes: 1,
            timeout: None,
            heartbeat: HeartbeatConfig::default(),
            node: None,
            event_tx: None,
        }
    }

    /// Bounds of the round size, validated by `build`
    pub fn nodes(mut self, min_nodes: i64, max_nodes: i64) -> Self {
        self.min_nodes = min_nodes;
        self.max_nodes = max_nodes;
        self
    }

    /// Join, last call and close timeouts
    pub fn timeout(mut self, timeout: RendezvousTimeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keep-alive settings, validated by `build`
    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Use a fixed descriptor instead of generating one
    pub fn node(mut self, node: NodeDescriptor) -> Self {
        self.node = Some(node);
        self
    }

    pub fn events(mut self, tx: mpsc::Sender<RendezvousEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn build(self) -> RendezvousResult<DynamicRendezvousHandler> {
        if self.min_nodes < 1 {
            return Err(RendezvousError::InvalidMinNodes(self.min_nodes));
        }
        if self.max_nodes < self.min_nodes {
            return Err(RendezvousError::InvalidMaxNodes {
                min_nodes: self.min_nodes,
                max_nodes: self.max_nodes,
            });
        }
        self.heartbeat.validate()?;

        let min_nodes = usize::try_from(self.min_nodes)
            .map_err(|_| RendezvousError::InvalidMinNodes(self.min_nodes))?;
        let max_nodes = usize::try_from(self.max_nodes).map_err(|_| {
            RendezvousError::InvalidMaxNodes {
                min_nodes: self.min_nodes,
                max_nodes: self.max_nodes,
            }
        })?;

        let settings = RendezvousSettings {
            run_id: self.run_id,
            min_nodes,
            max_nodes,
            timeout: self.timeout.unwrap_or_default(),
            heartbeat: self.heartbeat,
        };
        let node = self.node.unwrap_or_else(|| NODE_DESC_GENERATOR.generate());

        let mut executor =
            DistributedOpExecutor::new(node.clone(), settings.clone(), self.backend.clone());
        if let Some(tx) = self.event_tx {
            executor.set_event_channel(tx);
        }

        debug!(
            "Created rendezvous handler for {} on '{}' ({} to {} nodes, backend '{}')",
            node,
            settings.run_id,
            min_nodes,
            max_nodes,
            self.backend.name()
        );

        Ok(DynamicRendezvousHandler {
            node,
            settings,
            store: self.store,
            backend: self.backend,
            executor: Arc::new(AsyncMutex::new(executor)),
            heartbeat_task: Mutex::new(None),
        })
    }
}

/// Handler that runs the rendezvous protocol over a CAS backend
///
/// All operations of one handler go through one executor behind an async
/// mutex, including the background keep-alive task started after each
/// completed round.
pub struct DynamicRendezvousHandler {
    node: NodeDescriptor,
    settings: RendezvousSettings,
    store: Arc<dyn Store>,
    backend: Arc<dyn RendezvousBackend>,
    executor: Arc<AsyncMutex<DistributedOpExecutor>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl DynamicRendezvousHandler {
    /// Create a handler with default keep-alive settings
    pub fn from_backend(
        run_id: impl Into<String>,
        store: Arc<dyn Store>,
        backend: Arc<dyn RendezvousBackend>,
        min_nodes: i64,
        max_nodes: i64,
        timeout: Option<RendezvousTimeout>,
    ) -> RendezvousResult<Self> {
        let mut builder = HandlerBuilder::new(run_id, store, backend).nodes(min_nodes, max_nodes);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder.build()
    }

    pub fn builder(
        run_id: impl Into<String>,
        store: Arc<dyn Store>,
        backend: Arc<dyn RendezvousBackend>,
    ) -> HandlerBuilder {
        HandlerBuilder::new(run_id, store, backend)
    }

    pub fn run_id(&self) -> &str {
        &self.settings.run_id
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn RendezvousBackend> {
        &self.backend
    }

    pub fn min_nodes(&self) -> usize {
        self.settings.min_nodes
    }

    pub fn max_nodes(&self) -> usize {
        self.settings.max_nodes
    }

    pub fn timeout(&self) -> &RendezvousTimeout {
        &self.settings.timeout
    }

    pub fn heartbeat(&self) -> &HeartbeatConfig {
        &self.settings.heartbeat
    }

    /// Descriptor of the local node
    pub fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    /// Set event channel
    pub async fn set_event_channel(&self, tx: mpsc::Sender<RendezvousEvent>) {
        self.executor.lock().await.set_event_channel(tx);
    }

    fn start_heartbeats(&self) {
        let executor = self.executor.clone();
        let interval = self.settings.heartbeat.interval;
        let node = self.node.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let deadline = Instant::now() + interval;
                let mut executor = executor.lock().await;
                if let Err(e) = executor.run(&KeepAliveOp, deadline).await {
                    warn!("Keep-alive of {} failed: {}", node, e);
                }
            }
        });

        if let Some(previous) = self.heartbeat_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_heartbeats(&self) {
        if let Some(handle) = self.heartbeat_task.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl RendezvousHandler for DynamicRendezvousHandler {
    fn get_backend(&self) -> &str {
        self.backend.name()
    }

    fn get_run_id(&self) -> &str {
        &self.settings.run_id
    }

    async fn next_rendezvous(&self) -> RendezvousResult<RendezvousInfo> {
        self.stop_heartbeats();

        let deadline = Instant::now() + budget(self.settings.timeout.join());
        info!(
            "{} joining rendezvous '{}' on backend '{}'",
            self.node,
            self.settings.run_id,
            self.backend.name()
        );

        let (rank, world_size, round) = {
            let mut executor = self.executor.lock().await;
            executor.run(&ExitOp, deadline).await?;
            executor.run(&JoinOp, deadline).await?;

            let state = executor.state();
            let rank = state
                .rank_of(&self.node)
                .ok_or_else(|| RendezvousError::NotAParticipant(self.node.to_string()))?;
            (rank, state.participant_count(), state.round)
        };

        self.start_heartbeats();

        info!(
            "{} finished round {} of '{}' as rank {} of {}",
            self.node, round, self.settings.run_id, rank, world_size
        );

        let store = PrefixStore::for_round(self.store.clone(), &self.settings.run_id, round);
        debug!("Round store of {} uses prefix '{}'", self.node, store.prefix());
        Ok(RendezvousInfo {
            store: Arc::new(store),
            rank,
            world_size,
            round,
        })
    }

    async fn is_closed(&self) -> RendezvousResult<bool> {
        let mut executor = self.executor.lock().await;
        Ok(executor.sync().await?.closed)
    }

    async fn set_closed(&self) -> RendezvousResult<()> {
        let deadline = Instant::now() + budget(self.settings.timeout.close());
        let mut executor = self.executor.lock().await;
        executor.run(&CloseOp, deadline).await
    }

    async fn num_nodes_waiting(&self) -> RendezvousResult<usize> {
        let mut executor = self.executor.lock().await;
        Ok(executor.sync().await?.wait_list.len())
    }

    async fn shutdown(&self) -> bool {
        self.stop_heartbeats();

        let deadline = Instant::now() + budget(self.settings.timeout.close());
        let mut executor = self.executor.lock().await;
        match executor.run(&ExitOp, deadline).await {
            Ok(()) => {
                info!("{} left rendezvous '{}'", self.node, self.settings.run_id);
                true
            }
            Err(e) => {
                warn!(
                    "{} could not leave rendezvous '{}': {}",
                    self.node, self.settings.run_id, e
                );
                false
            }
        }
    }
}

impl Drop for DynamicRendezvousHandler {
    fn drop(&mut self) {
        self.stop_heartbeats();
    }
}
