// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use elastic_core::{
    AgentError, MonitorResult, RuntimeError, Supervisor, WorkerEnv, WorkerFailure, WorkerGroup,
    WorkerId, WorkerOutput, WorkerRuntime, WorkerSpec, WorkerState,
};
use elastic_rendezvous::{
    InMemoryStore, KeyValueStore, RendezvousConfig, RendezvousCoordinator, RendezvousError,
    RendezvousHandler, RendezvousOutcome, StoreKeyValueExchange,
};

/// Replays a fixed sequence of monitor observations.
#[derive(Default)]
struct ScriptedRuntime {
    script: Mutex<VecDeque<MonitorResult>>,
    started: Mutex<Vec<Vec<WorkerEnv>>>,
    stops: AtomicU32,
}

impl ScriptedRuntime {
    fn new(script: Vec<MonitorResult>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    fn starts(&self) -> usize {
        self.started.lock().len()
    }

    fn last_envs(&self) -> Vec<WorkerEnv> {
        self.started.lock().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl WorkerRuntime for ScriptedRuntime {
    async fn start_workers(
        &self,
        _group: &WorkerGroup,
        envs: &[WorkerEnv],
    ) -> Result<HashMap<u32, WorkerId>, RuntimeError> {
        let mut started = self.started.lock();
        started.push(envs.to_vec());
        let generation = started.len();
        Ok(envs
            .iter()
            .map(|env| (env.local_rank, WorkerId::new(format!("w{generation}-{}", env.local_rank))))
            .collect())
    }

    async fn stop_workers(&self, _group: &WorkerGroup) -> Result<(), RuntimeError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn monitor_workers(&self, group: &WorkerGroup) -> Result<MonitorResult, RuntimeError> {
        Ok(self.script.lock().pop_front().unwrap_or_else(|| {
            let values = group
                .workers
                .iter()
                .map(|w| (w.global_rank.unwrap_or_default(), WorkerOutput::from(0)))
                .collect();
            MonitorResult::succeeded(values)
        }))
    }
}

/// Hands out a fixed rank over a shared in-memory exchange.
struct FixedRendezvous {
    store: Arc<InMemoryStore>,
    rank: u32,
    world_size: u32,
    waiting: Mutex<VecDeque<u32>>,
    rounds: AtomicU32,
    fail: bool,
    fail_waiting: bool,
}

impl FixedRendezvous {
    fn new(store: Arc<InMemoryStore>, rank: u32, world_size: u32) -> Self {
        Self {
            store,
            rank,
            world_size,
            waiting: Mutex::new(VecDeque::new()),
            rounds: AtomicU32::new(0),
            fail: false,
            fail_waiting: false,
        }
    }

    fn with_waiting(self, waiting: Vec<u32>) -> Self {
        *self.waiting.lock() = waiting.into();
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn failing_waiting(mut self) -> Self {
        self.fail_waiting = true;
        self
    }
}

#[async_trait]
impl RendezvousHandler for FixedRendezvous {
    async fn next_rendezvous(&self) -> Result<RendezvousOutcome, RendezvousError> {
        if self.fail {
            return Err(RendezvousError::Timeout);
        }
        let version = u64::from(self.rounds.fetch_add(1, Ordering::SeqCst)) + 1;
        let kv = StoreKeyValueExchange::open(self.store.clone(), "/job/rdzv/kv").await?;
        Ok(RendezvousOutcome {
            store: Arc::new(kv.with_timeout(Duration::from_secs(5))),
            rank: self.rank,
            world_size: self.world_size,
            version,
        })
    }

    async fn is_closed(&self) -> Result<bool, RendezvousError> {
        Ok(false)
    }

    async fn set_closed(&self) -> Result<(), RendezvousError> {
        Ok(())
    }

    async fn num_nodes_waiting(&self) -> Result<u32, RendezvousError> {
        if self.fail_waiting {
            return Err(RendezvousError::Timeout);
        }
        Ok(self.waiting.lock().pop_front().unwrap_or(0))
    }
}

fn spec(handler: Arc<dyn RendezvousHandler>, nproc: u32, max_restarts: u32) -> WorkerSpec {
    WorkerSpec {
        role: "trainer".to_string(),
        local_world_size: nproc,
        entrypoint: "train".to_string(),
        args: Vec::new(),
        rdzv_handler: handler,
        max_restarts,
        monitor_interval: Duration::from_secs(1),
        master_addr: None,
        master_port: Some(29500),
    }
}

fn failure(local_rank: u32) -> WorkerFailure {
    WorkerFailure {
        local_rank,
        exit_code: Some(1),
        message: "exit status: 1".to_string(),
    }
}

fn failed_on(global_rank: u32) -> MonitorResult {
    MonitorResult::failed(HashMap::from([(global_rank, failure(global_rank))]))
}

#[tokio::test(start_paused = true)]
async fn test_success_returns_outputs_by_global_rank() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FixedRendezvous::new(store, 0, 1));
    let runtime = ScriptedRuntime::new(vec![MonitorResult::new(WorkerState::Healthy)]);

    let mut supervisor = Supervisor::new(spec(handler, 2, 3), runtime.clone()).unwrap();
    let outputs = supervisor.run().await.unwrap();

    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[&0], WorkerOutput::from(0));
    assert_eq!(outputs[&1], WorkerOutput::from(0));
    assert_eq!(supervisor.worker_group().state, WorkerState::Succeeded);
    assert_eq!(supervisor.remaining_restarts(), 3);
    assert_eq!(runtime.starts(), 1);
    assert_eq!(runtime.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failure_consumes_restart_budget() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FixedRendezvous::new(store, 0, 1));
    let runtime = ScriptedRuntime::new(vec![failed_on(0)]);

    let mut supervisor = Supervisor::new(spec(handler.clone(), 1, 2), runtime.clone()).unwrap();
    supervisor.run().await.unwrap();

    assert_eq!(supervisor.remaining_restarts(), 1);
    assert_eq!(supervisor.restart_count(), 1);
    assert_eq!(runtime.starts(), 2);
    assert_eq!(runtime.stops.load(Ordering::SeqCst), 1);
    assert_eq!(handler.rounds.load(Ordering::SeqCst), 2);
    assert_eq!(runtime.last_envs()[0].restart_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_budget_fails_the_group() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FixedRendezvous::new(store, 0, 1));
    let runtime = ScriptedRuntime::new(vec![
        failed_on(0),
        MonitorResult::new(WorkerState::Unhealthy),
        failed_on(0),
    ]);

    let mut supervisor = Supervisor::new(spec(handler, 1, 2), runtime.clone()).unwrap();
    let err = supervisor.run().await.unwrap_err();

    match &err {
        AgentError::WorkerGroupFailure {
            role,
            message,
            failures,
        } => {
            assert_eq!(role, "trainer");
            assert_eq!(message, "exceeded max_restarts=2");
            assert_eq!(failures[&0], failure(0));
        }
        other => panic!("expected a worker group failure, got {other:?}"),
    }
    assert_eq!(err.to_string(), "[trainer] exceeded max_restarts=2");
    assert!(err.worker_failures().is_some());
    assert_eq!(supervisor.remaining_restarts(), 0);
    assert_eq!(supervisor.worker_group().state, WorkerState::Failed);
    assert_eq!(runtime.starts(), 3);
    assert_eq!(runtime.stops.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_zero_restarts_fails_on_first_failure() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FixedRendezvous::new(store, 0, 1));
    let runtime = ScriptedRuntime::new(vec![failed_on(0)]);

    let mut supervisor = Supervisor::new(spec(handler, 1, 0), runtime.clone()).unwrap();
    assert!(matches!(
        supervisor.run().await,
        Err(AgentError::WorkerGroupFailure { .. })
    ));
    assert_eq!(runtime.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_waiting_nodes_restart_without_spending_budget() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FixedRendezvous::new(store, 0, 1).with_waiting(vec![0, 1]));
    let runtime = ScriptedRuntime::new(vec![
        MonitorResult::new(WorkerState::Healthy),
        MonitorResult::new(WorkerState::Healthy),
    ]);

    let mut supervisor = Supervisor::new(spec(handler.clone(), 1, 1), runtime.clone()).unwrap();
    supervisor.run().await.unwrap();

    assert_eq!(supervisor.remaining_restarts(), 1);
    assert_eq!(runtime.starts(), 2);
    assert_eq!(handler.rounds.load(Ordering::SeqCst), 2);
    assert_eq!(runtime.last_envs()[0].restart_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_state_is_fatal() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FixedRendezvous::new(store, 0, 1));
    let runtime = ScriptedRuntime::new(vec![MonitorResult::new(WorkerState::Unknown)]);

    let mut supervisor = Supervisor::new(spec(handler, 1, 3), runtime.clone()).unwrap();
    let err = supervisor.run().await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::UnknownState {
            state: WorkerState::Unknown,
            ..
        }
    ));
    assert_eq!(err.to_string(), "[trainer] Worker group in unknown state");
    assert_eq!(supervisor.remaining_restarts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_rendezvous_failure_leaves_group_unknown() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FixedRendezvous::new(store, 0, 1).failing());
    let runtime = ScriptedRuntime::new(Vec::new());

    let mut supervisor = Supervisor::new(spec(handler, 1, 3), runtime.clone()).unwrap();
    assert!(matches!(
        supervisor.run().await,
        Err(AgentError::Rendezvous(RendezvousError::Timeout))
    ));
    assert_eq!(supervisor.worker_group().state, WorkerState::Unknown);
    assert_eq!(runtime.starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_waiting_count_failure_leaves_group_unknown() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FixedRendezvous::new(store, 0, 1).failing_waiting());
    let runtime = ScriptedRuntime::new(vec![MonitorResult::new(WorkerState::Healthy)]);

    let mut supervisor = Supervisor::new(spec(handler, 1, 3), runtime.clone()).unwrap();
    assert!(matches!(
        supervisor.run().await,
        Err(AgentError::Rendezvous(RendezvousError::Timeout))
    ));
    assert_eq!(supervisor.worker_group().state, WorkerState::Unknown);
    assert_eq!(supervisor.remaining_restarts(), 3);
    assert_eq!(runtime.starts(), 1);
    assert_eq!(runtime.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rank_zero_publishes_shared_endpoint() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FixedRendezvous::new(store.clone(), 0, 2));
    let runtime = ScriptedRuntime::new(vec![MonitorResult::new(WorkerState::Healthy)]);

    let mut supervisor = Supervisor::new(spec(handler, 2, 3), runtime.clone()).unwrap();
    supervisor.run().await.unwrap();

    let host = hostname::get().unwrap().to_string_lossy().into_owned();
    let envs = runtime.last_envs();
    assert_eq!(envs.len(), 2);
    for (local_rank, env) in envs.iter().enumerate() {
        assert_eq!(env.local_rank, local_rank as u32);
        assert_eq!(env.rank, local_rank as u32);
        assert_eq!(env.group_rank, 0);
        assert_eq!(env.local_world_size, 2);
        assert_eq!(env.world_size, 4);
        assert_eq!(env.master_addr, host);
        assert_eq!(env.master_port, 29500);
        assert_eq!(env.max_restarts, 3);
    }

    let kv = StoreKeyValueExchange::open(store, "/job/rdzv/kv").await.unwrap();
    assert_eq!(kv.get("MASTER_PORT").await.unwrap(), b"29500");
}

#[tokio::test(start_paused = true)]
async fn test_configured_master_addr_is_advertised() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FixedRendezvous::new(store.clone(), 0, 1));
    let runtime = ScriptedRuntime::new(vec![MonitorResult::new(WorkerState::Healthy)]);
    let mut spec = spec(handler, 1, 0);
    spec.master_addr = Some("node-0.cluster.internal".to_string());

    let mut supervisor = Supervisor::new(spec, runtime.clone()).unwrap();
    supervisor.run().await.unwrap();

    assert_eq!(runtime.last_envs()[0].master_addr, "node-0.cluster.internal");
    let kv = StoreKeyValueExchange::open(store, "/job/rdzv/kv").await.unwrap();
    assert_eq!(kv.get("MASTER_ADDR").await.unwrap(), b"node-0.cluster.internal");
}

#[tokio::test(start_paused = true)]
async fn test_other_ranks_read_shared_endpoint() {
    let store = Arc::new(InMemoryStore::new());
    let kv = StoreKeyValueExchange::open(store.clone(), "/job/rdzv/kv").await.unwrap();
    kv.set("MASTER_ADDR", b"node-0").await.unwrap();
    kv.set("MASTER_PORT", b"41000").await.unwrap();

    let handler = Arc::new(FixedRendezvous::new(store, 1, 3));
    let runtime = ScriptedRuntime::new(vec![MonitorResult::new(WorkerState::Healthy)]);
    let mut spec = spec(handler, 2, 3);
    spec.master_port = None;

    let mut supervisor = Supervisor::new(spec, runtime.clone()).unwrap();
    let outputs = supervisor.run().await.unwrap();

    let mut ranks: Vec<u32> = outputs.keys().copied().collect();
    ranks.sort();
    assert_eq!(ranks, vec![2, 3]);

    let group = supervisor.worker_group();
    assert_eq!(group.group_rank, Some(1));
    assert_eq!(group.group_world_size, Some(3));
    assert!(group.workers.iter().all(|w| w.id.is_some()));

    for env in runtime.last_envs() {
        assert_eq!(env.master_addr, "node-0");
        assert_eq!(env.master_port, 41000);
        assert_eq!(env.world_size, 6);
        assert_eq!(env.group_rank, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_invalid_spec_is_rejected() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FixedRendezvous::new(store, 0, 1));
    let runtime = ScriptedRuntime::new(Vec::new());

    assert!(matches!(
        Supervisor::new(spec(handler.clone(), 0, 3), runtime.clone()),
        Err(AgentError::InvalidSpec(_))
    ));
    let mut no_interval = spec(handler.clone(), 1, 3);
    no_interval.monitor_interval = Duration::ZERO;
    assert!(matches!(
        Supervisor::new(no_interval, runtime.clone()),
        Err(AgentError::InvalidSpec(_))
    ));
    let mut blank_addr = spec(handler, 1, 3);
    blank_addr.master_addr = Some(String::new());
    assert!(matches!(
        Supervisor::new(blank_addr, runtime),
        Err(AgentError::InvalidSpec(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_runs_against_store_rendezvous() {
    let store = Arc::new(InMemoryStore::new());
    let config = RendezvousConfig::new("job", 1, 1).with_prefix("/elastic/test");
    let coordinator = Arc::new(
        RendezvousCoordinator::connect(store, config)
            .await
            .unwrap(),
    );
    let runtime = ScriptedRuntime::new(vec![failed_on(0)]);

    let mut supervisor = Supervisor::new(spec(coordinator.clone(), 1, 1), runtime.clone()).unwrap();
    supervisor.run().await.unwrap();
    assert_eq!(runtime.starts(), 2);

    coordinator.set_closed().await.unwrap();
    assert!(coordinator.is_closed().await.unwrap());
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_processes_see_their_environment() {
    use elastic_core::LocalProcessRuntime;

    let store = Arc::new(InMemoryStore::new());
    let config = RendezvousConfig::new("local", 1, 1).with_prefix("/elastic/test");
    let coordinator = Arc::new(
        RendezvousCoordinator::connect(store, config)
            .await
            .unwrap(),
    );
    let mut spec = spec(coordinator, 2, 0);
    spec.entrypoint = "sh".to_string();
    spec.args = vec![
        "-c".to_string(),
        "test \"$WORLD_SIZE\" = 2 && test \"$RANK\" = \"$LOCAL_RANK\" && test -n \"$MASTER_ADDR\""
            .to_string(),
    ];
    spec.monitor_interval = Duration::from_millis(100);

    let mut supervisor = Supervisor::new(spec, Arc::new(LocalProcessRuntime::new())).unwrap();
    let outputs = tokio::time::timeout(Duration::from_secs(30), supervisor.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outputs.len(), 2);
    assert!(outputs.values().all(|v| *v == WorkerOutput::from(0)));
}
