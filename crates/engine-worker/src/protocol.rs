//! The wire protocol between a pool manager and a worker child process
//! (spec §4.3): length-delimited frames carrying JSON-encoded messages over
//! the child's stdin/stdout pipes.

use engine_common::model::{OrgScope, RunId, RunTarget};
use engine_common::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::codec::LengthDelimitedCodec;

/// The execution context a `Run` request carries: everything the worker
/// needs to resolve and invoke the target without further round trips to
/// the dispatcher (spec §4.3, §4.5 "Resolve context").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub org: OrgScope,
    pub user_id: Option<String>,
    pub inputs: Value,
}

/// Messages the worker accepts from its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRequest {
    Run {
        run_id: RunId,
        context: RunContext,
        target: RunTarget,
    },
    Cancel,
    Shutdown,
}

/// Messages the worker emits back to its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    Log {
        sequence: u64,
        severity: String,
        source: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        message: String,
        data: Option<Value>,
    },
    Progress {
        phase: String,
        fields: HashMap<String, Value>,
    },
    Result {
        value: Value,
        type_tag: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
        traceback: Option<String>,
    },
    Metric {
        peak_memory_bytes: u64,
        cpu_seconds: f64,
    },
    Exit {
        code: i32,
    },
}

/// Shared framing: 4-byte big-endian length prefix, max frame 16 MiB
/// (large payloads are expected to be referenced out-of-band per spec §4.5).
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(16 * 1024 * 1024)
        .length_field_type::<u32>()
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_request_round_trips_through_json() {
        let req = WorkerRequest::Run {
            run_id: RunId::new(),
            context: RunContext {
                org: OrgScope::Global,
                user_id: None,
                inputs: serde_json::json!({"a": 1}),
            },
            target: RunTarget::Module {
                path: "workflows/a".to_string(),
                function_name: "main".to_string(),
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: WorkerRequest = serde_json::from_str(&json).unwrap();
        match back {
            WorkerRequest::Run { target, .. } => {
                assert_eq!(
                    target,
                    RunTarget::Module {
                        path: "workflows/a".to_string(),
                        function_name: "main".to_string(),
                    }
                );
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }
}
