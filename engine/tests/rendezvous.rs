//! Multi-participant rendezvous scenarios over in-process backends

use async_trait::async_trait;
use rendezvous_core::{
    CasOutcome, HeartbeatConfig, NodeDescriptor, RendezvousBackend, RendezvousError,
    RendezvousHandler, RendezvousResult, RendezvousTimeout, Store, Timestamp, Token,
};
use rendezvous_engine::{
    apply_action, create_rendezvous_channel, DynamicRendezvousHandler, JoinOp, RendezvousAction,
    RendezvousContext, RendezvousEvent, RendezvousOp, RendezvousSettings,
};
use rendezvous_state::{BackendStateHolder, MemoryBackend, MemoryStore, RendezvousState, SledBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn timeout(join_ms: i64, last_call_ms: i64) -> RendezvousTimeout {
    RendezvousTimeout::new(
        Some(chrono::Duration::milliseconds(join_ms)),
        Some(chrono::Duration::milliseconds(last_call_ms)),
        Some(chrono::Duration::seconds(5)),
    )
    .unwrap()
}

fn fast_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        interval: Duration::from_secs(5),
        max_missed: 3,
        poll_interval: Duration::from_millis(20),
    }
}

fn handler(
    store: &Arc<dyn Store>,
    backend: &Arc<dyn RendezvousBackend>,
    min_nodes: i64,
    max_nodes: i64,
    timeout: RendezvousTimeout,
) -> Arc<DynamicRendezvousHandler> {
    let handler = DynamicRendezvousHandler::builder("job", store.clone(), backend.clone())
        .nodes(min_nodes, max_nodes)
        .timeout(timeout)
        .heartbeat(fast_heartbeat())
        .build()
        .unwrap();
    Arc::new(handler)
}

/// Backend on which every write loses against an empty state
struct LosingBackend;

#[async_trait]
impl RendezvousBackend for LosingBackend {
    fn name(&self) -> &str {
        "losing"
    }

    async fn get_state(&self) -> RendezvousResult<Option<(Vec<u8>, Token)>> {
        Ok(None)
    }

    async fn set_state(
        &self,
        _state: Vec<u8>,
        _token: Option<Token>,
    ) -> RendezvousResult<Option<CasOutcome>> {
        Ok(Some(CasOutcome {
            state: RendezvousState::new().to_bytes()?,
            token: Token::new(1),
            applied: false,
        }))
    }
}

fn memory() -> (Arc<dyn Store>, Arc<dyn RendezvousBackend>) {
    (
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryBackend::new("job")),
    )
}

#[tokio::test]
async fn test_close_times_out_when_writes_never_land() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let backend: Arc<dyn RendezvousBackend> = Arc::new(LosingBackend);
    let close_timeout = RendezvousTimeout::new(
        None,
        None,
        Some(chrono::Duration::milliseconds(300)),
    )
    .unwrap();
    let closer = handler(&store, &backend, 1, 2, close_timeout);

    let started = std::time::Instant::now();
    let err = closer.set_closed().await.unwrap_err();

    assert!(matches!(err, RendezvousError::CloseTimeout { ref run_id } if run_id == "job"));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(!closer.is_closed().await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_nodes_complete_after_last_call() {
    let (store, backend) = memory();
    let handlers: Vec<_> = (0..3)
        .map(|_| handler(&store, &backend, 3, 6, timeout(10_000, 300)))
        .collect();
    let (tx, mut rx) = create_rendezvous_channel();
    for h in &handlers {
        h.set_event_channel(tx.clone()).await;
    }

    let started = std::time::Instant::now();
    let tasks: Vec<_> = handlers
        .iter()
        .cloned()
        .map(|h| tokio::spawn(async move { h.next_rendezvous().await }))
        .collect();

    let mut infos = Vec::new();
    for task in tasks {
        infos.push(task.await.unwrap().unwrap());
    }

    let mut expected: Vec<&NodeDescriptor> = handlers.iter().map(|h| h.node()).collect();
    expected.sort_by_key(|node| node.to_string());

    for (handler, info) in handlers.iter().zip(&infos) {
        assert_eq!(info.world_size, 3);
        assert_eq!(info.round, 0);
        assert_eq!(expected[info.rank], handler.node());
    }

    let mut last_calls = Vec::new();
    let mut completions = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            RendezvousEvent::LastCallStarted(round, deadline) => last_calls.push((round, deadline)),
            RendezvousEvent::Completed(round, world_size) => completions.push((round, world_size)),
            _ => {}
        }
    }

    // The quorum opens the last call once and the round waits it out
    assert_eq!(last_calls.len(), 1);
    let (round, deadline) = last_calls[0];
    assert_eq!(round, 0);
    assert!(Timestamp::now() >= deadline);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(completions, vec![(0, 3)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_nodes_completes_without_last_call() {
    let (store, backend) = memory();
    // A last call this long would fail the test if it were waited out
    let first = handler(&store, &backend, 1, 2, timeout(10_000, 60_000));
    let second = handler(&store, &backend, 1, 2, timeout(10_000, 60_000));

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(first.next_rendezvous(), second.next_rendezvous());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(a.world_size, 2);
    assert_eq!(b.world_size, 2);
    assert_ne!(a.rank, b.rank);
}

#[tokio::test]
async fn test_join_times_out_without_quorum() {
    let (store, backend) = memory();
    let lonely = handler(&store, &backend, 2, 4, timeout(200, 100));

    let err = lonely.next_rendezvous().await.unwrap_err();
    match err {
        RendezvousError::QuorumTimeout {
            run_id,
            participants,
            min_nodes,
        } => {
            assert_eq!(run_id, "job");
            assert_eq!(participants, 1);
            assert_eq!(min_nodes, 2);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_join_after_close_fails_fast() {
    let (store, backend) = memory();
    let closer = handler(&store, &backend, 1, 2, timeout(10_000, 100));
    let joiner = handler(&store, &backend, 1, 2, timeout(10_000, 100));

    assert!(!closer.is_closed().await.unwrap());
    closer.set_closed().await.unwrap();
    assert!(joiner.is_closed().await.unwrap());

    let started = std::time::Instant::now();
    let err = joiner.next_rendezvous().await.unwrap_err();
    assert!(matches!(err, RendezvousError::Closed(_)));
    assert!(started.elapsed() < Duration::from_secs(5));

    // Closing twice is a no-op
    closer.set_closed().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_node_waits_for_next_round() {
    let (store, backend) = memory();
    let first = handler(&store, &backend, 2, 3, timeout(10_000, 100));
    let second = handler(&store, &backend, 2, 3, timeout(10_000, 100));
    let late = handler(&store, &backend, 2, 3, timeout(10_000, 100));

    let (a, b) = tokio::join!(first.next_rendezvous(), second.next_rendezvous());
    assert_eq!(a.unwrap().world_size, 2);
    assert_eq!(b.unwrap().world_size, 2);

    let late_task = {
        let late = late.clone();
        tokio::spawn(async move { late.next_rendezvous().await })
    };

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while first.num_nodes_waiting().await.unwrap() == 0 {
        assert!(std::time::Instant::now() < deadline, "late node never queued");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(first.num_nodes_waiting().await.unwrap(), 1);

    // The current participants re-rendezvous and let the waiting node in
    let (a, b) = tokio::join!(first.next_rendezvous(), second.next_rendezvous());
    let late_info = late_task.await.unwrap().unwrap();
    let (a, b) = (a.unwrap(), b.unwrap());

    for info in [&a, &b, &late_info] {
        assert_eq!(info.round, 1);
        assert_eq!(info.world_size, 3);
    }
    let mut ranks = vec![a.rank, b.rank, late_info.rank];
    ranks.sort();
    assert_eq!(ranks, vec![0, 1, 2]);
    assert_eq!(first.num_nodes_waiting().await.unwrap(), 0);
}

#[tokio::test]
async fn test_round_store_is_scoped_to_round() {
    let (store, backend) = memory();
    let only = handler(&store, &backend, 1, 1, timeout(10_000, 100));

    let info = only.next_rendezvous().await.unwrap();
    info.store.set("master_port", b"29500".to_vec()).await.unwrap();

    assert_eq!(
        store.get("rendezvous.job.0.master_port").await.unwrap(),
        Some(b"29500".to_vec())
    );
    assert!(only.shutdown().await);
}

#[tokio::test]
async fn test_dead_participant_is_evicted() {
    let (store, backend) = memory();

    // Seed a round holding a participant that stopped heartbeating
    let ghost = NodeDescriptor::new("ghost", 1, 0);
    let mut seeded = RendezvousState::new();
    seeded.participants.insert(ghost.clone(), 0);
    seeded.last_heartbeats.insert(ghost.clone(), Timestamp::from_millis(0));
    backend
        .set_state(seeded.to_bytes().unwrap(), None)
        .await
        .unwrap();

    let live = handler(&store, &backend, 2, 4, timeout(300, 100));
    let err = live.next_rendezvous().await.unwrap_err();
    assert!(matches!(
        err,
        RendezvousError::QuorumTimeout {
            participants: 1,
            ..
        }
    ));

    let (bits, _) = backend.get_state().await.unwrap().unwrap();
    let state = RendezvousState::from_bytes(&bits).unwrap();
    assert!(!state.is_participant(&ghost));
    assert!(state.is_participant(live.node()));
    assert!(state.deadline.is_none());
}

#[tokio::test]
async fn test_concurrent_completion_is_arbitrated() {
    let backend: Arc<dyn RendezvousBackend> = Arc::new(MemoryBackend::new("job"));
    let settings = RendezvousSettings {
        run_id: "job".into(),
        min_nodes: 2,
        max_nodes: 4,
        timeout: RendezvousTimeout::default(),
        heartbeat: fast_heartbeat(),
    };
    let nodes = [
        NodeDescriptor::new("host", 1, 0),
        NodeDescriptor::new("host", 2, 0),
    ];

    // Both nodes joined and the last call is already over
    let mut seeded = RendezvousState::new();
    for node in &nodes {
        seeded.participants.insert(node.clone(), 0);
        seeded.last_heartbeats.insert(node.clone(), Timestamp::now());
    }
    seeded.deadline = Some(Timestamp::now().offset(chrono::Duration::seconds(-1)));
    backend
        .set_state(seeded.to_bytes().unwrap(), None)
        .await
        .unwrap();

    let mut holders: Vec<_> = nodes
        .iter()
        .map(|_| BackendStateHolder::new(backend.clone(), 2, &settings.heartbeat))
        .collect();

    for (holder, node) in holders.iter_mut().zip(&nodes) {
        holder.sync().await.unwrap();
        let ctx = RendezvousContext {
            node,
            state: holder.state(),
            settings: &settings,
            now: Instant::now(),
            wall_now: Timestamp::now(),
        };
        let action = JoinOp.next_action(&ctx, Instant::now() + Duration::from_secs(60));
        assert_eq!(action, RendezvousAction::MarkRendezvousComplete);

        apply_action(holder.state_mut(), node, action, &settings, Timestamp::now());
        holder.mark_dirty();
    }

    let mut applied = Vec::new();
    for holder in holders.iter_mut() {
        applied.push(holder.sync().await.unwrap());
    }
    assert_eq!(applied, vec![Some(true), Some(false)]);

    assert_eq!(holders[0].state(), holders[1].state());
    assert_eq!(holders[0].token(), holders[1].token());
    assert!(holders[1].state().complete);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rendezvous_over_sled() {
    let tmp = tempfile::TempDir::new().unwrap();
    let sled = SledBackend::open(tmp.path(), "job").unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    let handlers: Vec<_> = (0..2)
        .map(|_| {
            let backend: Arc<dyn RendezvousBackend> = Arc::new(sled.clone());
            handler(&store, &backend, 2, 2, timeout(10_000, 100))
        })
        .collect();

    let (a, b) = tokio::join!(handlers[0].next_rendezvous(), handlers[1].next_rendezvous());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.world_size, 2);
    assert_ne!(a.rank, b.rank);
    assert_eq!(handlers[0].get_backend(), "sled");
}
