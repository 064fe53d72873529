//! C5: the execution dispatcher — spec §4.5's queue-to-terminal-status
//! pipeline.

use crate::admission::AdmissionControl;
use crate::mux::{LogMultiplexer, MuxEvent};
use crate::queue::{QueueError, RunQueue};
use chrono::Utc;
use engine_common::model::{OrgScope, ResourceUsage, RunId, RunStatus};
use engine_common::config::RetryConfig;
use engine_common::{EngineError, ErrorKind};
use engine_pool::{PoolError, ProcessPool, TerminalEvent};
use engine_registry::{RunRegistry, RunRegistryError};
use engine_worker::protocol::WorkerEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Registry(#[from] RunRegistryError),
}

pub struct Dispatcher {
    queue: Arc<dyn RunQueue>,
    registry: Arc<RunRegistry>,
    pool: Arc<ProcessPool>,
    mux: Arc<LogMultiplexer>,
    admission: Arc<dyn AdmissionControl>,
    retry: RetryConfig,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn RunQueue>,
        registry: Arc<RunRegistry>,
        pool: Arc<ProcessPool>,
        mux: Arc<LogMultiplexer>,
        admission: Arc<dyn AdmissionControl>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            pool,
            mux,
            admission,
            retry,
        }
    }

    /// Consumes the ready queue until `shutdown` resolves. One loop
    /// iteration processes at most one run to completion; concurrency
    /// across runs comes from running several of these loops (the
    /// bootstrap crate spawns one per configured consumer slot).
    pub async fn run_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.queue.dequeue().await {
                Ok(Some(request)) => self.process_one(request).await,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    warn!(%err, "dequeue failed, backing off");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn process_one(&self, request: crate::queue::RunRequest) {
        let run_id = request.run_id;

        if let Err(err) = self
            .registry
            .create(
                run_id,
                request.org,
                &request.target,
                request.requesting_user_id.as_deref(),
                request.inputs.clone(),
            )
            .await
        {
            error!(%run_id, %err, "failed to create run record");
            return;
        }

        let current = match self.registry.get(run_id).await {
            Ok(run) => run,
            Err(err) => {
                error!(%run_id, %err, "failed to load run record");
                return;
            }
        };
        if current.status.is_terminal() {
            // Already cancelled (or otherwise resolved) while queued.
            return;
        }

        if !self.admission.admit(request.org).await {
            self.requeue_with_backoff(request, ErrorKind::Overloaded).await;
            return;
        }

        if let Err(err) = self.registry.transition_status(run_id, RunStatus::Running).await {
            warn!(%run_id, %err, "could not transition to running, dropping");
            self.admission.release(request.org).await;
            return;
        }

        let tx = self.mux.spawn_run_sink(run_id);
        let usage = Arc::new(Mutex::new(ResourceUsage::default()));
        let usage_for_events = Arc::clone(&usage);
        let sequence_hint = Arc::new(AtomicU64::new(0));

        let on_event = move |event: WorkerEvent| {
            let _ = sequence_hint.fetch_add(1, Ordering::Relaxed);
            match event {
                WorkerEvent::Log { severity, source, message, data, .. } => {
                    let _ = tx.try_send(MuxEvent::Log { severity, source, message, data });
                }
                WorkerEvent::Progress { phase, fields } => {
                    let _ = tx.try_send(MuxEvent::Progress { phase, fields });
                }
                WorkerEvent::Metric { peak_memory_bytes, cpu_seconds } => {
                    if let Ok(mut usage) = usage_for_events.lock() {
                        usage.peak_memory_bytes = usage.peak_memory_bytes.max(peak_memory_bytes);
                        usage.cpu_seconds = usage.cpu_seconds.max(cpu_seconds);
                    }
                }
                WorkerEvent::Result { .. } | WorkerEvent::Error { .. } | WorkerEvent::Exit { .. } => {}
            }
        };

        let deadline = Instant::now() + Duration::from_secs(request.deadline_secs);
        let started_at = Utc::now();

        let outcome = self
            .pool
            .execute(
                run_id,
                request.org,
                request.requesting_user_id.clone(),
                request.inputs.clone(),
                request.target.clone(),
                deadline,
                request.memory_limit_bytes,
                on_event,
            )
            .await;

        self.admission.release(request.org).await;

        let resource_usage = {
            let mut usage = usage.lock().expect("usage mutex poisoned").clone();
            usage.duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
            usage
        };

        match outcome {
            Ok(TerminalEvent::Result { value, .. }) => {
                let _ = self
                    .registry
                    .record_outcome(run_id, RunStatus::Success, Some(value), None, resource_usage)
                    .await;
            }
            Ok(TerminalEvent::Error { kind, message, traceback }) => {
                let status = status_for_error_kind(kind);
                let error = EngineError { kind, message, traceback };
                let _ = self
                    .registry
                    .record_outcome(run_id, status, None, Some(error), resource_usage)
                    .await;
            }
            Err(PoolError::Overloaded) => {
                self.fail_or_retry(request, ErrorKind::Overloaded, "pool overloaded".to_string())
                    .await;
                return;
            }
            Err(PoolError::SpawnFailed(message)) => {
                self.fail_or_retry(request, ErrorKind::WorkerCrashed, message).await;
                return;
            }
        }
    }

    async fn fail_or_retry(&self, request: crate::queue::RunRequest, kind: ErrorKind, message: String) {
        if kind.is_retryable() && request.attempt < self.retry.max_attempts {
            self.requeue_with_backoff(request, kind).await;
            return;
        }

        let error = EngineError::new(ErrorKind::Undeliverable, message);
        let _ = self
            .registry
            .record_outcome(
                request.run_id,
                RunStatus::Failed,
                None,
                Some(error),
                ResourceUsage::default(),
            )
            .await;
    }

    async fn requeue_with_backoff(&self, mut request: crate::queue::RunRequest, kind: ErrorKind) {
        request.attempt += 1;
        if request.attempt > self.retry.max_attempts {
            let error = EngineError::new(
                ErrorKind::Undeliverable,
                format!("exceeded max redeliveries after {kind}"),
            );
            let _ = self
                .registry
                .record_outcome(
                    request.run_id,
                    RunStatus::Failed,
                    None,
                    Some(error),
                    ResourceUsage::default(),
                )
                .await;
            return;
        }

        let delay = self.retry.delay_for_attempt(request.attempt);
        let ready_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        info!(run_id = %request.run_id, attempt = request.attempt, ?delay, "scheduling retry");
        if let Err(err) = self.queue.schedule_retry(request, ready_at).await {
            error!(%err, "failed to schedule retry");
        }
    }

    pub async fn cancel(&self, run_id: RunId, reason: &str) -> Result<RunStatus, DispatcherError> {
        let next = self.registry.cancel_request(run_id, reason).await?;
        if next == RunStatus::Cancelling {
            self.pool.cancel(run_id, reason).await;
        }
        Ok(next)
    }
}

fn status_for_error_kind(kind: ErrorKind) -> RunStatus {
    match kind {
        ErrorKind::Timeout => RunStatus::Timeout,
        ErrorKind::Cancelled => RunStatus::Cancelled,
        _ => RunStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_cancelled_get_their_own_status() {
        assert_eq!(status_for_error_kind(ErrorKind::Timeout), RunStatus::Timeout);
        assert_eq!(status_for_error_kind(ErrorKind::Cancelled), RunStatus::Cancelled);
    }

    #[test]
    fn every_other_error_kind_maps_to_failed() {
        for kind in [
            ErrorKind::WorkerCrashed,
            ErrorKind::Overloaded,
            ErrorKind::Undeliverable,
            ErrorKind::ImportDenied,
        ] {
            assert_eq!(status_for_error_kind(kind), RunStatus::Failed);
        }
    }
}
