//! Drives the cron catalog, delayed-request sweep, and stuck-run sweep on
//! their respective ticks (spec §4.7).

use crate::config::SchedulerConfig;
use crate::cron::CronCatalog;
use crate::delayed::DelayedRequestStore;
use crate::stuck::StuckRunSweeper;
use chrono::Utc;
use engine_common::model::RunId;
use engine_dispatcher::{RunQueue, RunRequest};
use engine_registry::RunRegistry;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub struct Scheduler {
    config: SchedulerConfig,
    catalog: CronCatalog,
    delayed: DelayedRequestStore,
    stuck: StuckRunSweeper,
    queue: Arc<dyn RunQueue>,
    registry: Arc<RunRegistry>,
    default_deadline_secs: u64,
    default_memory_limit_bytes: u64,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        catalog: CronCatalog,
        delayed: DelayedRequestStore,
        stuck: StuckRunSweeper,
        queue: Arc<dyn RunQueue>,
        registry: Arc<RunRegistry>,
        default_deadline_secs: u64,
        default_memory_limit_bytes: u64,
    ) -> Self {
        Self {
            config,
            catalog,
            delayed,
            stuck,
            queue,
            registry,
            default_deadline_secs,
            default_memory_limit_bytes,
        }
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stuck_tick = tokio::time::interval(self.config.stuck_sweep_interval);
        stuck_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => self.on_tick().await,
                _ = stuck_tick.tick() => {
                    let swept = self.stuck.sweep().await;
                    if swept > 0 {
                        warn!(swept, "stuck-run sweep reclaimed runs as worker_lost");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Utc::now();

        for firing in self.catalog.due_as_of(now) {
            let run_id = RunId::new();
            if let Err(err) = self
                .registry
                .create(
                    run_id,
                    firing.org,
                    &engine_common::model::RunTarget::Module {
                        path: firing.workflow_path.clone(),
                        function_name: firing.function_name.clone(),
                    },
                    None,
                    firing.inputs.clone(),
                )
                .await
            {
                warn!(%err, trigger_id = %firing.trigger_id, "failed to record cron-fired run");
                continue;
            }
            self.enqueue(run_id, firing.org, firing.workflow_path, firing.function_name, firing.inputs)
                .await;
        }

        match self.delayed.sweep_due(now).await {
            Ok(due) => {
                for request in due {
                    let run_id = RunId::new();
                    info!(request_id = %request.request_id, %run_id, "dispatching delayed request");
                    if let Err(err) = self
                        .registry
                        .create(
                            run_id,
                            request.org,
                            &engine_common::model::RunTarget::Module {
                                path: request.workflow_path.clone(),
                                function_name: request.function_name.clone(),
                            },
                            None,
                            request.inputs.clone(),
                        )
                        .await
                    {
                        warn!(%err, "failed to record delayed-request run");
                        continue;
                    }
                    self.enqueue(
                        run_id,
                        request.org,
                        request.workflow_path,
                        request.function_name,
                        request.inputs,
                    )
                    .await;
                }
            }
            Err(err) => warn!(%err, "delayed-request sweep failed"),
        }
    }

    async fn enqueue(
        &self,
        run_id: RunId,
        org: engine_common::model::OrgScope,
        workflow_path: String,
        function_name: String,
        inputs: serde_json::Value,
    ) {
        let request = RunRequest {
            run_id,
            org,
            target: engine_common::model::RunTarget::Module {
                path: workflow_path,
                function_name,
            },
            requesting_user_id: None,
            inputs,
            deadline_secs: self.default_deadline_secs,
            memory_limit_bytes: self.default_memory_limit_bytes,
            attempt: 1,
        };
        if let Err(err) = self.queue.enqueue(request).await {
            warn!(%err, %run_id, "failed to enqueue scheduled run");
        }
    }
}
