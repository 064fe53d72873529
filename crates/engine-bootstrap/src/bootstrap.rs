//! Wires C1-C8 together into one running process: config, migrations,
//! every background loop, and graceful shutdown (spec §10 engine-bootstrap).

use crate::config::EngineConfig;
use crate::metrics::Metrics;
use anyhow::Context;
use engine_coordination::heartbeat::RedisHeartbeatRegistry;
use engine_coordination::{HeartbeatRegistry, PubSub};
use engine_dispatcher::{Dispatcher, LogMultiplexer, NoopAdmission, RedisRunQueue, RunQueue};
use engine_pool::ProcessPool;
use engine_registry::{RunLogStore, RunRegistry};
use engine_scheduler::{CronCatalog, DelayedRequestStore, Scheduler, StuckRunSweeper};
use engine_store::cache::RedisModuleCache;
use engine_store::durable::DurableModuleStore;
use engine_store::ModuleStore;
use fred::prelude::{Builder, Client, Config as RedisConfig};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::info;

/// Every long-lived handle the running process holds, assembled once at
/// startup (mirrors the teacher's `Services` struct).
pub struct Engine {
    config: EngineConfig,
    metrics: Arc<Metrics>,
    pool: Arc<ProcessPool>,
    mux: Arc<LogMultiplexer>,
    dispatcher: Arc<Dispatcher>,
    scheduler_handle: Scheduler,
    queue: Arc<dyn RunQueue>,
}

async fn connect_redis(redis_url: &str) -> anyhow::Result<Client> {
    let config = RedisConfig::from_url(redis_url).context("parsing redis url")?;
    let client = Builder::from_config(config).build().context("building redis client")?;
    client.init().await.context("connecting to redis")?;
    Ok(client)
}

impl Engine {
    pub async fn new(config: EngineConfig) -> anyhow::Result<Self> {
        info!("initializing execution engine");

        let pg_pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.store.max_db_connections)
            .connect(&config.store.database_url)
            .await
            .context("connecting to postgres")?;

        let durable = DurableModuleStore::new(pg_pool.clone());
        durable.migrate().await.context("module store migration")?;
        let cache = RedisModuleCache::connect(&config.store.redis_url)
            .await
            .context("connecting module cache")?;
        let store = Arc::new(ModuleStore::new(
            durable,
            Arc::new(cache),
            config.store.cache_ttl,
            config.store.negative_cache_ttl,
        ));
        let _ = store; // held by worker processes, not the dispatcher process directly

        let run_registry = Arc::new(RunRegistry::new(pg_pool.clone()));
        run_registry.migrate().await.context("run registry migration")?;
        let log_store = Arc::new(RunLogStore::new(pg_pool.clone()));

        let redis_client = connect_redis(&config.store.redis_url).await?;
        let heartbeats: Arc<dyn HeartbeatRegistry> =
            Arc::new(RedisHeartbeatRegistry::new(redis_client.clone()));
        let pubsub = Arc::new(PubSub::new(redis_client.clone()));
        let queue: Arc<dyn RunQueue> = Arc::new(RedisRunQueue::new(redis_client.clone()));

        let pool = Arc::new(ProcessPool::new(config.pool.clone(), Arc::clone(&heartbeats)));
        let mux = Arc::new(LogMultiplexer::new(
            Arc::clone(&log_store),
            Arc::clone(&pubsub),
            config.mux.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&run_registry),
            Arc::clone(&pool),
            Arc::clone(&mux),
            Arc::new(NoopAdmission),
            config.retry.clone(),
        ));

        let now = chrono::Utc::now();
        let tick = chrono::Duration::from_std(config.scheduler.tick_interval).unwrap_or_default();
        let cron_catalog = CronCatalog::rebuild(&pg_pool, now, tick)
            .await
            .unwrap_or_else(|_| CronCatalog::empty());
        let delayed = DelayedRequestStore::new(pg_pool.clone());
        let stuck_sweeper = StuckRunSweeper::new(Arc::clone(&run_registry), Arc::clone(&heartbeats));
        let scheduler_handle = Scheduler::new(
            config.scheduler.clone(),
            cron_catalog,
            delayed,
            stuck_sweeper,
            Arc::clone(&queue),
            Arc::clone(&run_registry),
            config.pool.default_deadline.as_secs(),
            config.pool.default_memory_limit_bytes,
        );

        let metrics = Arc::new(Metrics::new());

        Ok(Self {
            config,
            metrics,
            pool,
            mux,
            dispatcher,
            scheduler_handle,
            queue,
        })
    }

    /// Spawns every background loop into `join_set` and returns once they've
    /// all been started; the caller drives shutdown by flipping `shutdown`
    /// to `true` and draining `join_set`.
    pub async fn run(
        self,
        join_set: &mut JoinSet<anyhow::Result<()>>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let Engine {
            config,
            metrics,
            pool,
            mux: _mux,
            dispatcher,
            scheduler_handle,
            queue,
        } = self;

        for _ in 0..config.dispatcher_concurrency.max(1) {
            let dispatcher = Arc::clone(&dispatcher);
            let shutdown = shutdown.clone();
            join_set.spawn(async move {
                dispatcher.run_loop(shutdown).await;
                Ok(())
            });
        }

        let heartbeat_pool = Arc::clone(&pool);
        join_set.spawn(async move {
            heartbeat_pool.run_heartbeat_loop().await;
            Ok(())
        });

        // Once shutdown is requested, let the pool drain in-flight runs for
        // `shutdown_grace` before force-killing whatever's left.
        let drain_pool = Arc::clone(&pool);
        let shutdown_grace = config.shutdown_grace;
        let mut drain_shutdown = shutdown.clone();
        join_set.spawn(async move {
            while !*drain_shutdown.borrow() {
                if drain_shutdown.changed().await.is_err() {
                    return Ok(());
                }
            }
            drain_pool.shutdown(shutdown_grace).await;
            Ok(())
        });

        let scheduler_shutdown = shutdown.clone();
        join_set.spawn(async move {
            scheduler_handle.run(scheduler_shutdown).await;
            Ok(())
        });

        let metrics_for_server = Arc::clone(&metrics);
        let metrics_port = config.metrics_port;
        let metrics_shutdown = shutdown.clone();
        join_set.spawn(async move {
            crate::metrics_server::serve(metrics_for_server, metrics_port, metrics_shutdown).await;
            Ok(())
        });

        let mut sample_shutdown = shutdown.clone();
        join_set.spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = pool.stats().await;
                        metrics.pool_workers_total.set(stats.workers_total as i64);
                        metrics.pool_workers_idle.set(stats.workers_idle as i64);
                        metrics.pool_workers_busy.set(stats.workers_busy as i64);
                        if let Ok(depth) = queue.depth().await {
                            metrics.queue_depth.set(depth as i64);
                        }
                    }
                    _ = sample_shutdown.changed() => {
                        if *sample_shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }
        });
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }
}
