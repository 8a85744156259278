// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local Process Runtime
//!
//! Runs each worker as a child process of the agent. The worker id is the
//! OS process id. Children are killed when the runtime is dropped.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::runtime::{RuntimeError, WorkerRuntime};
use crate::domain::worker::{
    MonitorResult, WorkerEnv, WorkerFailure, WorkerGroup, WorkerId, WorkerOutput, WorkerState,
};

struct LocalWorker {
    id: WorkerId,
    global_rank: u32,
    child: Child,
    exit: Option<ExitStatus>,
}

/// Spawns `entrypoint args...` once per local rank.
#[derive(Default)]
pub struct LocalProcessRuntime {
    workers: Mutex<HashMap<u32, LocalWorker>>,
}

impl LocalProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRuntime for LocalProcessRuntime {
    async fn start_workers(
        &self,
        group: &WorkerGroup,
        envs: &[WorkerEnv],
    ) -> Result<HashMap<u32, WorkerId>, RuntimeError> {
        let spec = &group.spec;
        let mut workers = self.workers.lock().await;
        let mut ids = HashMap::with_capacity(envs.len());

        for env in envs {
            let child = Command::new(&spec.entrypoint)
                .args(&spec.args)
                .envs(env.to_env_vars())
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    RuntimeError::SpawnFailed(format!(
                        "{} (local_rank {}): {}",
                        spec.entrypoint, env.local_rank, e
                    ))
                })?;
            let pid = child.id().ok_or_else(|| {
                RuntimeError::SpawnFailed(format!(
                    "local_rank {} exited before its pid was read",
                    env.local_rank
                ))
            })?;
            let id = WorkerId::new(pid.to_string());
            debug!(
                "Started worker local_rank={} rank={} pid={}",
                env.local_rank, env.rank, pid
            );

            ids.insert(env.local_rank, id.clone());
            // Replacing an entry drops (and kills) any leftover child.
            workers.insert(
                env.local_rank,
                LocalWorker {
                    id,
                    global_rank: env.rank,
                    child,
                    exit: None,
                },
            );
        }

        info!("[{}] Started {} local workers", spec.role, ids.len());
        Ok(ids)
    }

    async fn stop_workers(&self, group: &WorkerGroup) -> Result<(), RuntimeError> {
        let mut workers = self.workers.lock().await;
        let mut errors = Vec::new();

        for (local_rank, mut worker) in workers.drain() {
            if worker.exit.is_some() {
                continue;
            }
            if let Err(e) = worker.child.start_kill() {
                // Exited between the last monitor step and now.
                if matches!(worker.child.try_wait(), Ok(Some(_))) {
                    continue;
                }
                errors.push(format!("local_rank {local_rank} pid {}: {e}", worker.id));
                continue;
            }
            if let Err(e) = worker.child.wait().await {
                errors.push(format!("local_rank {local_rank} pid {}: {e}", worker.id));
            }
        }

        if errors.is_empty() {
            debug!("[{}] Stopped local workers", group.spec.role);
            Ok(())
        } else {
            Err(RuntimeError::TerminationFailed(errors.join("; ")))
        }
    }

    async fn monitor_workers(&self, group: &WorkerGroup) -> Result<MonitorResult, RuntimeError> {
        let mut workers = self.workers.lock().await;

        for expected in &group.workers {
            match workers.get(&expected.local_rank) {
                Some(running) if expected.id.as_ref() == Some(&running.id) => {}
                _ => {
                    warn!(
                        "[{}] Worker local_rank={} is not tracked by this runtime",
                        group.spec.role, expected.local_rank
                    );
                    return Ok(MonitorResult::new(WorkerState::Unknown));
                }
            }
        }

        let mut running = false;
        let mut failures = HashMap::new();
        let mut return_values: HashMap<u32, WorkerOutput> = HashMap::new();

        for (local_rank, worker) in workers.iter_mut() {
            if worker.exit.is_none() {
                worker.exit = worker.child.try_wait().map_err(|e| {
                    RuntimeError::MonitorFailed(format!("local_rank {local_rank}: {e}"))
                })?;
            }
            match worker.exit {
                None => running = true,
                Some(status) if status.success() => {
                    return_values.insert(
                        worker.global_rank,
                        WorkerOutput::from(status.code().unwrap_or_default()),
                    );
                }
                Some(status) => {
                    failures.insert(
                        worker.global_rank,
                        WorkerFailure {
                            local_rank: *local_rank,
                            exit_code: status.code(),
                            message: format!("worker pid {} {}", worker.id, status),
                        },
                    );
                }
            }
        }

        if !failures.is_empty() {
            return Ok(MonitorResult::failed(failures));
        }
        if running {
            return Ok(MonitorResult::new(WorkerState::Healthy));
        }
        Ok(MonitorResult::succeeded(return_values))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::worker::WorkerSpec;
    use async_trait::async_trait;
    use elastic_rendezvous::{RendezvousError, RendezvousHandler, RendezvousOutcome};
    use std::sync::Arc;
    use std::time::Duration;

    struct NoRendezvous;

    #[async_trait]
    impl RendezvousHandler for NoRendezvous {
        async fn next_rendezvous(&self) -> Result<RendezvousOutcome, RendezvousError> {
            Err(RendezvousError::Closed)
        }
        async fn is_closed(&self) -> Result<bool, RendezvousError> {
            Ok(true)
        }
        async fn set_closed(&self) -> Result<(), RendezvousError> {
            Ok(())
        }
        async fn num_nodes_waiting(&self) -> Result<u32, RendezvousError> {
            Ok(0)
        }
    }

    fn group(script: &str, nproc: u32) -> WorkerGroup {
        let mut group = WorkerGroup::new(WorkerSpec {
            role: "trainer".to_string(),
            local_world_size: nproc,
            entrypoint: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            rdzv_handler: Arc::new(NoRendezvous),
            max_restarts: 0,
            monitor_interval: Duration::from_millis(50),
            master_addr: None,
            master_port: None,
        });
        for worker in &mut group.workers {
            worker.global_rank = Some(10 + worker.local_rank);
            worker.world_size = Some(20);
        }
        group
    }

    fn envs(group: &WorkerGroup) -> Vec<WorkerEnv> {
        group
            .workers
            .iter()
            .map(|w| WorkerEnv {
                local_rank: w.local_rank,
                rank: w.global_rank.unwrap(),
                group_rank: 5,
                local_world_size: group.spec.local_world_size,
                world_size: 20,
                master_addr: "localhost".to_string(),
                master_port: 29500,
                restart_count: 0,
                max_restarts: 0,
            })
            .collect()
    }

    async fn start(runtime: &LocalProcessRuntime, group: &mut WorkerGroup) {
        let ids = runtime.start_workers(group, &envs(group)).await.unwrap();
        for (local_rank, id) in ids {
            group.workers[local_rank as usize].id = Some(id);
        }
    }

    async fn settle(runtime: &LocalProcessRuntime, group: &WorkerGroup) -> MonitorResult {
        for _ in 0..200 {
            let result = runtime.monitor_workers(group).await.unwrap();
            if result.state != WorkerState::Healthy {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("workers did not finish");
    }

    #[tokio::test]
    async fn test_successful_workers_report_exit_codes_by_global_rank() {
        let runtime = LocalProcessRuntime::new();
        let mut group = group("test \"$RANK\" = $((10 + LOCAL_RANK))", 2);
        start(&runtime, &mut group).await;

        let result = settle(&runtime, &group).await;
        assert_eq!(result.state, WorkerState::Succeeded);
        assert_eq!(result.return_values.len(), 2);
        assert_eq!(result.return_values[&10], WorkerOutput::from(0));
        assert_eq!(result.return_values[&11], WorkerOutput::from(0));
        runtime.stop_workers(&group).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_worker_is_reported() {
        let runtime = LocalProcessRuntime::new();
        let mut group = group("exit $LOCAL_RANK", 2);
        start(&runtime, &mut group).await;

        let result = settle(&runtime, &group).await;
        assert_eq!(result.state, WorkerState::Failed);
        assert_eq!(result.failures.len(), 1);
        let failure = &result.failures[&11];
        assert_eq!(failure.local_rank, 1);
        assert_eq!(failure.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_stop_kills_running_workers() {
        let runtime = LocalProcessRuntime::new();
        let mut group = group("sleep 30", 2);
        start(&runtime, &mut group).await;
        assert_eq!(
            runtime.monitor_workers(&group).await.unwrap().state,
            WorkerState::Healthy
        );

        tokio::time::timeout(Duration::from_secs(5), runtime.stop_workers(&group))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            runtime.monitor_workers(&group).await.unwrap().state,
            WorkerState::Unknown
        );
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runtime = LocalProcessRuntime::new();
        let mut group = group("true", 1);
        group.spec.entrypoint = "/nonexistent/elastic-worker".to_string();
        let result = runtime.start_workers(&group, &envs(&group)).await;
        assert!(matches!(result, Err(RuntimeError::SpawnFailed(_))));
    }
}
