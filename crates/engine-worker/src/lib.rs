//! C3: the worker child process. A library crate plus the `engine-worker`
//! binary (`src/bin/main.rs`) that the pool manager (C4) spawns.

pub mod errors;
pub mod import_hook;
pub mod output;
pub mod protocol;
pub mod vm_runtime;

use crate::protocol::{RunContext, WorkerEvent, WorkerRequest};
use engine_common::model::RunTarget;
use engine_store::ModuleStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use vm_runtime::PyWorkerRuntime;

/// Runs one assigned target to completion, emitting events on `events` in
/// the order `Log*`, then `Result`/`Error`, then `Metric` (spec §4.3
/// "Execution step"). `cancelled` is checked cooperatively; true
/// termination on an uncooperative run is the pool manager's job (signal
/// escalation, spec §4.4).
pub async fn execute_run(
    runtime: Arc<PyWorkerRuntime>,
    context: RunContext,
    target: RunTarget,
    events: mpsc::Sender<WorkerEvent>,
    cancelled: Arc<AtomicBool>,
) {
    let started = Instant::now();
    let org = context.org;
    let inputs = context.inputs;

    let outcome = tokio::task::spawn_blocking(move || runtime.run(org, target, inputs))
        .await
        .expect("worker execution task panicked");

    let mut sequence = 0u64;
    if !outcome.stdout.is_empty() {
        sequence += 1;
        let _ = events
            .send(WorkerEvent::Log {
                sequence,
                severity: "info".to_string(),
                source: "stdout".to_string(),
                timestamp: chrono::Utc::now(),
                message: outcome.stdout,
                data: None,
            })
            .await;
    }
    if !outcome.stderr.is_empty() {
        sequence += 1;
        let _ = events
            .send(WorkerEvent::Log {
                sequence,
                severity: "warn".to_string(),
                source: "stderr".to_string(),
                timestamp: chrono::Utc::now(),
                message: outcome.stderr,
                data: None,
            })
            .await;
    }

    if cancelled.load(Ordering::SeqCst) {
        let _ = events
            .send(WorkerEvent::Error {
                kind: engine_common::ErrorKind::Cancelled,
                message: "run was cancelled".to_string(),
                traceback: None,
            })
            .await;
    } else {
        match outcome.error {
            None => {
                let _ = events
                    .send(WorkerEvent::Result {
                        value: outcome.return_value.unwrap_or(serde_json::Value::Null),
                        type_tag: "json".to_string(),
                    })
                    .await;
            }
            Some(err) => {
                let _ = events
                    .send(WorkerEvent::Error {
                        kind: err.kind,
                        message: err.message,
                        traceback: err.traceback,
                    })
                    .await;
            }
        }
    }

    let _ = events
        .send(WorkerEvent::Metric {
            peak_memory_bytes: peak_rss_bytes().unwrap_or(0),
            cpu_seconds: started.elapsed().as_secs_f64(),
        })
        .await;
}

/// Best-effort peak RSS sampling (spec §4.4 "Memory enforcement" — the
/// worker side of periodic self-reporting). Returns `None` on platforms
/// without `/proc`.
pub fn peak_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

pub struct WorkerHandle {
    pub store: Arc<ModuleStore>,
}

/// Builds a long-lived runtime for one worker process.
pub fn build_runtime(store: Arc<ModuleStore>, tokio_handle: tokio::runtime::Handle) -> PyWorkerRuntime {
    PyWorkerRuntime::new(store, tokio_handle)
}

pub use protocol::codec;

/// Convenience re-export so binaries can match on the full request shape.
pub type IncomingRequest = WorkerRequest;
