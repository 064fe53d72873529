//! C4: the process pool manager — spec §4.4's full contract: `execute`,
//! `cancel`, `stats`, `shutdown`.

use crate::config::PoolConfig;
use crate::worker_handle::{WorkerHandle, WorkerHandleError};
use chrono::Utc;
use dashmap::DashMap;
use engine_common::model::{OrgScope, RunId, RunTarget, WorkerId};
use engine_common::ErrorKind;
use engine_coordination::HeartbeatRegistry;
use engine_worker::protocol::{RunContext, WorkerEvent, WorkerRequest};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::warn;

/// Why `drive_to_terminal` started escalating a run towards a forced kill.
/// Carried alongside the escalation timestamp so the eventual `terminate`/
/// `kill` grace windows are anchored to when escalation began rather than to
/// the run's original deadline, and so the terminal error is classified by
/// cause instead of always reading as a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscalationReason {
    Deadline,
    Memory,
    Cancelled,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("pool overloaded")]
    Overloaded,
    #[error("worker spawn failed: {0}")]
    SpawnFailed(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub workers_total: usize,
    pub workers_idle: usize,
    pub workers_busy: usize,
    pub queue_depth: usize,
}

/// Terminal outcome of one `execute` call, already classified into the
/// closed `ErrorKind` set where applicable.
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    Result { value: Value, type_tag: String },
    Error { kind: ErrorKind, message: String, traceback: Option<String> },
}

pub struct ProcessPool {
    config: PoolConfig,
    workers: DashMap<WorkerId, Arc<Mutex<WorkerHandle>>>,
    idle: Mutex<VecDeque<WorkerId>>,
    busy_count: AtomicUsize,
    running_runs: DashMap<RunId, WorkerId>,
    /// One `Notify` per in-flight run, so an external `cancel()` can wake the
    /// matching `drive_to_terminal` loop immediately instead of only that
    /// loop's own deadline/memory checks being able to start escalation.
    cancel_signals: DashMap<RunId, Arc<Notify>>,
    overload_since: RwLock<Option<Instant>>,
    heartbeats: Arc<dyn HeartbeatRegistry>,
    pool_id: WorkerId,
}

impl ProcessPool {
    pub fn new(config: PoolConfig, heartbeats: Arc<dyn HeartbeatRegistry>) -> Self {
        Self {
            config,
            workers: DashMap::new(),
            idle: Mutex::new(VecDeque::new()),
            busy_count: AtomicUsize::new(0),
            running_runs: DashMap::new(),
            cancel_signals: DashMap::new(),
            overload_since: RwLock::new(None),
            heartbeats,
            pool_id: WorkerId::new(),
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().await.len();
        let total = self.workers.len();
        PoolStats {
            workers_total: total,
            workers_idle: idle,
            workers_busy: self.busy_count.load(Ordering::SeqCst),
            queue_depth: 0,
        }
    }

    /// Registers the pool and renews at `heartbeat_interval` until
    /// cancelled. Spawned once at startup by the bootstrap crate
    /// (spec §4.4 "Heartbeats").
    pub async fn run_heartbeat_loop(&self) {
        loop {
            if let Err(err) = self
                .heartbeats
                .register(self.pool_id, self.config.heartbeat_interval * 3)
                .await
            {
                warn!(%err, "pool heartbeat registration failed");
            }
            tokio::time::sleep(self.config.heartbeat_interval).await;
        }
    }

    async fn acquire_worker(&self) -> Result<Arc<Mutex<WorkerHandle>>, PoolError> {
        if let Some(worker_id) = self.idle.lock().await.pop_front() {
            if let Some(entry) = self.workers.get(&worker_id) {
                return Ok(Arc::clone(entry.value()));
            }
        }

        if self.workers.len() >= self.config.max_workers {
            self.overload_since.write().await.get_or_insert_with(Instant::now);
            return Err(PoolError::Overloaded);
        }
        *self.overload_since.write().await = None;

        let handle = WorkerHandle::spawn(&self.config.worker_binary_path, &self.config.worker_config_path)
            .map_err(|e| match e {
                WorkerHandleError::SpawnFailed(msg) => PoolError::SpawnFailed(msg),
                WorkerHandleError::Crashed(_) => PoolError::SpawnFailed("crashed before ready".into()),
            })?;
        let worker_id = handle.id;
        let handle = Arc::new(Mutex::new(handle));
        self.workers.insert(worker_id, Arc::clone(&handle));
        Ok(handle)
    }

    async fn release_worker(&self, worker_id: WorkerId, draining: bool) {
        self.busy_count.fetch_sub(1, Ordering::SeqCst);
        if draining {
            self.workers.remove(&worker_id);
        } else {
            self.idle.lock().await.push_back(worker_id);
        }
    }

    /// Runs one assignment end to end (spec §4.4 "Assignment algorithm",
    /// "Timeout enforcement", "Memory enforcement", "Crash recovery").
    #[allow(clippy::too_many_arguments)]
    pub async fn execute<F>(
        &self,
        run_id: RunId,
        org: OrgScope,
        user_id: Option<String>,
        inputs: Value,
        target: RunTarget,
        deadline: Instant,
        memory_limit_bytes: u64,
        mut on_event: F,
    ) -> Result<TerminalEvent, PoolError>
    where
        F: FnMut(WorkerEvent) + Send,
    {
        let handle = self.acquire_worker().await?;
        self.busy_count.fetch_add(1, Ordering::SeqCst);
        let worker_id = handle.lock().await.id;
        self.running_runs.insert(run_id, worker_id);
        let cancel_signal = Arc::new(Notify::new());
        self.cancel_signals.insert(run_id, Arc::clone(&cancel_signal));

        {
            let guard = handle.lock().await;
            guard
                .send(WorkerRequest::Run {
                    run_id,
                    context: RunContext { org, user_id, inputs },
                    target,
                })
                .await;
        }

        let terminal = self
            .drive_to_terminal(
                Arc::clone(&handle),
                deadline,
                memory_limit_bytes,
                &cancel_signal,
                &mut on_event,
            )
            .await;

        self.cancel_signals.remove(&run_id);
        self.running_runs.remove(&run_id);
        let crashed = matches!(terminal, TerminalEvent::Error { kind: ErrorKind::WorkerCrashed, .. });
        self.release_worker(worker_id, crashed).await;

        if self.workers.len() < self.config.min_workers {
            let _ = self.acquire_worker().await;
        }

        Ok(terminal)
    }

    async fn drive_to_terminal<F>(
        &self,
        handle: Arc<Mutex<WorkerHandle>>,
        deadline: Instant,
        memory_limit_bytes: u64,
        cancel_signal: &Notify,
        on_event: &mut F,
    ) -> TerminalEvent
    where
        F: FnMut(WorkerEvent) + Send,
    {
        // Set once escalation starts, whatever the cause, and used as the
        // anchor for the terminate/kill grace windows below instead of the
        // run's original deadline.
        let mut escalation: Option<(EscalationReason, Instant)> = None;
        loop {
            let event = {
                let mut guard = handle.lock().await;
                tokio::select! {
                    event = guard.next_event() => event,
                    _ = tokio::time::sleep_until(deadline), if escalation.is_none() => {
                        escalation = Some((EscalationReason::Deadline, Instant::now()));
                        guard.send(WorkerRequest::Cancel).await;
                        continue;
                    }
                    _ = cancel_signal.notified(), if escalation.is_none() => {
                        escalation = Some((EscalationReason::Cancelled, Instant::now()));
                        guard.send(WorkerRequest::Cancel).await;
                        continue;
                    }
                }
            };

            match event {
                Some(WorkerEvent::Metric { peak_memory_bytes, .. })
                    if peak_memory_bytes > memory_limit_bytes && escalation.is_none() =>
                {
                    escalation = Some((EscalationReason::Memory, Instant::now()));
                    handle.lock().await.send(WorkerRequest::Cancel).await;
                }
                Some(WorkerEvent::Metric { peak_memory_bytes, cpu_seconds }) => {
                    on_event(WorkerEvent::Metric { peak_memory_bytes, cpu_seconds });
                }
                Some(WorkerEvent::Result { value, type_tag }) => {
                    return TerminalEvent::Result { value, type_tag };
                }
                Some(WorkerEvent::Error { kind, message, traceback }) => {
                    return TerminalEvent::Error { kind, message, traceback };
                }
                Some(other) => on_event(other),
                None => {
                    return TerminalEvent::Error {
                        kind: ErrorKind::WorkerCrashed,
                        message: "worker process exited without a terminal event".to_string(),
                        traceback: None,
                    };
                }
            }

            if let Some((reason, escalated_at)) = escalation {
                if Instant::now() >= escalated_at + self.config.terminate_grace {
                    handle.lock().await.terminate();
                }
                if Instant::now() >= escalated_at + self.config.terminate_grace + self.config.kill_grace {
                    handle.lock().await.kill().await;
                    let (kind, message) = match reason {
                        EscalationReason::Deadline => (
                            ErrorKind::Timeout,
                            "run exceeded its deadline and the worker did not cooperate".to_string(),
                        ),
                        EscalationReason::Memory => (
                            ErrorKind::MemoryLimit,
                            "run exceeded its memory limit and the worker did not cooperate".to_string(),
                        ),
                        EscalationReason::Cancelled => (
                            ErrorKind::Cancelled,
                            "run was cancelled and the worker did not cooperate".to_string(),
                        ),
                    };
                    return TerminalEvent::Error { kind, message, traceback: None };
                }
            }
        }
    }

    pub async fn cancel(&self, run_id: RunId, _reason: &str) -> bool {
        if let Some(entry) = self.running_runs.get(&run_id) {
            if let Some(worker) = self.workers.get(entry.value()) {
                worker.lock().await.send(WorkerRequest::Cancel).await;
                if let Some(signal) = self.cancel_signals.get(&run_id) {
                    signal.notify_one();
                }
                return true;
            }
        }
        false
    }

    pub async fn shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && self.busy_count.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for entry in self.workers.iter() {
            let mut guard = entry.value().lock().await;
            guard.send(WorkerRequest::Shutdown).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        for entry in self.workers.iter() {
            entry.value().lock().await.kill().await;
        }
        let _ = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use engine_coordination::heartbeat::HeartbeatError;

    struct NoopHeartbeats;

    #[async_trait]
    impl HeartbeatRegistry for NoopHeartbeats {
        async fn register(&self, _worker_id: WorkerId, _ttl: Duration) -> Result<(), HeartbeatError> {
            Ok(())
        }
        async fn renew(&self, _worker_id: WorkerId, _ttl: Duration) -> Result<(), HeartbeatError> {
            Ok(())
        }
        async fn enumerate(&self) -> Result<Vec<WorkerId>, HeartbeatError> {
            Ok(Vec::new())
        }
    }

    fn pool_with_max_workers(max_workers: usize) -> ProcessPool {
        let config = PoolConfig {
            max_workers,
            ..PoolConfig::default()
        };
        ProcessPool::new(config, Arc::new(NoopHeartbeats))
    }

    #[tokio::test]
    async fn fresh_pool_has_zero_stats() {
        let pool = pool_with_max_workers(8);
        let stats = pool.stats().await;
        assert_eq!(stats.workers_total, 0);
        assert_eq!(stats.workers_idle, 0);
        assert_eq!(stats.workers_busy, 0);
    }

    #[tokio::test]
    async fn acquire_worker_rejects_once_at_capacity_without_spawning() {
        let pool = pool_with_max_workers(0);
        let err = pool.acquire_worker().await.unwrap_err();
        assert!(matches!(err, PoolError::Overloaded));
        // No worker was spawned to hit the limit, so the overload clock
        // started on the very first call.
        assert!(pool.overload_since.read().await.is_some());
    }

    #[tokio::test]
    async fn cancel_unknown_run_returns_false() {
        let pool = pool_with_max_workers(8);
        assert!(!pool.cancel(RunId::new(), "operator requested").await);
    }

    #[tokio::test]
    async fn shutdown_with_no_workers_returns_promptly() {
        let pool = pool_with_max_workers(8);
        tokio::time::timeout(Duration::from_millis(500), pool.shutdown(Duration::from_millis(50)))
            .await
            .expect("shutdown with no workers must not hang");
    }
}
