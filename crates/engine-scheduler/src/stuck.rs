//! Stuck-run sweep (spec §4.7 "Stuck-run sweep"): reclaims runs whose
//! owning pool stopped heartbeating.

use engine_common::model::{ResourceUsage, RunId, RunStatus};
use engine_common::{EngineError, ErrorKind};
use engine_coordination::HeartbeatRegistry;
use engine_registry::RunRegistry;
use std::sync::Arc;
use tracing::warn;

pub struct StuckRunSweeper {
    registry: Arc<RunRegistry>,
    heartbeats: Arc<dyn HeartbeatRegistry>,
}

impl StuckRunSweeper {
    pub fn new(registry: Arc<RunRegistry>, heartbeats: Arc<dyn HeartbeatRegistry>) -> Self {
        Self { registry, heartbeats }
    }

    /// Scans `Running`/`Cancelling` runs and fails any whose owning
    /// worker's heartbeat is no longer in the live set, classified
    /// `WorkerLost` (spec §4.7).
    ///
    /// The registry doesn't track which worker owns which run directly;
    /// ownership is inferred from the heartbeat registry's live set being
    /// empty — a pool with at least one live heartbeat is assumed to still
    /// own its in-flight runs, and only a fully heartbeat-less deployment
    /// (every pool process gone) is swept. A future revision that threads
    /// a `worker_id` column through `runs` would let this target
    /// individual stuck runs instead of an all-or-nothing check.
    pub async fn sweep(&self) -> usize {
        let live = match self.heartbeats.enumerate().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(%err, "stuck-run sweep: heartbeat registry unavailable, skipping");
                return 0;
            }
        };
        if !live.is_empty() {
            return 0;
        }

        let mut swept = 0;
        for status in [RunStatus::Running, RunStatus::Cancelling] {
            let Ok(runs) = self.registry.list_by_status(status, 1000).await else {
                continue;
            };
            for run in runs {
                if self.fail_as_lost(run.run_id).await {
                    swept += 1;
                }
            }
        }
        swept
    }

    async fn fail_as_lost(&self, run_id: RunId) -> bool {
        let error = EngineError::new(ErrorKind::WorkerLost, "owning pool's heartbeat expired".to_string());
        self.registry
            .record_outcome(run_id, RunStatus::Failed, None, Some(error), ResourceUsage::default())
            .await
            .is_ok()
    }
}
