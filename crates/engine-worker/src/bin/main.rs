//! Worker process entry point. Spawned by the pool manager (C4) with a
//! private stdio pipe; speaks the framed protocol in
//! `engine_worker::protocol`.

use engine_common::config::ConfigLoader;
use engine_common::tracing_init::{init_tracing_with_default_env_filter, TracingConfig};
use engine_store::cache::RedisModuleCache;
use engine_store::durable::DurableModuleStore;
use engine_store::{ModuleStore, StoreConfig};
use engine_worker::protocol::{codec, WorkerEvent, WorkerRequest};
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{stdin, stdout};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing_with_default_env_filter(&TracingConfig::local_dev("engine-worker"));

    let config_path = std::env::var("ENGINE_WORKER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("worker.toml"));
    let store_config: StoreConfig = ConfigLoader::new(&config_path)
        .load()
        .unwrap_or_else(|_| StoreConfig::default());

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(store_config.max_db_connections)
        .connect(&store_config.database_url)
        .await?;
    let durable = DurableModuleStore::new(pool);
    let cache = RedisModuleCache::connect(&store_config.redis_url).await?;
    let store = Arc::new(ModuleStore::new(
        durable,
        Arc::new(cache),
        store_config.cache_ttl,
        store_config.negative_cache_ttl,
    ));

    let runtime = Arc::new(engine_worker::build_runtime(
        Arc::clone(&store),
        tokio::runtime::Handle::current(),
    ));

    let mut reader = FramedRead::new(stdin(), codec());
    let mut writer = FramedWrite::new(stdout(), codec());

    let cancelled = Arc::new(AtomicBool::new(false));

    // The active run's join handle and event receiver, if one is in flight.
    // Kept alongside the frame reader in one `select!` so a `Cancel` frame
    // sitting in the pipe is observed mid-run instead of only after the
    // current run's events have fully drained (spec §4.3 cooperative
    // cancellation).
    let mut active: Option<(tokio::task::JoinHandle<()>, mpsc::Receiver<WorkerEvent>)> = None;

    loop {
        tokio::select! {
            frame = reader.next() => {
                let Some(frame) = frame else { break };
                let frame = frame?;
                let request: WorkerRequest = serde_json::from_slice(&frame)?;

                match request {
                    WorkerRequest::Run { context, target, .. } => {
                        cancelled.store(false, Ordering::SeqCst);
                        let (tx, rx) = mpsc::channel::<WorkerEvent>(256);
                        let run_runtime = Arc::clone(&runtime);
                        let run_cancelled = Arc::clone(&cancelled);
                        let execution = tokio::spawn(async move {
                            engine_worker::execute_run(run_runtime, context, target, tx, run_cancelled).await;
                        });
                        active = Some((execution, rx));
                    }
                    WorkerRequest::Cancel => {
                        cancelled.store(true, Ordering::SeqCst);
                    }
                    WorkerRequest::Shutdown => {
                        let bytes = serde_json::to_vec(&WorkerEvent::Exit { code: 0 })?;
                        writer.send(bytes.into()).await?;
                        break;
                    }
                }
            }
            next_event = async {
                match &mut active {
                    Some((_, rx)) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match next_event {
                    Some(event) => {
                        let bytes = serde_json::to_vec(&event)?;
                        writer.send(bytes.into()).await?;
                    }
                    None => {
                        if let Some((execution, _)) = active.take() {
                            execution.await?;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
