// Binary entrypoint for the execution engine process: load config, init
// tracing, wire up the engine, and drive it until shutdown.

use engine_bootstrap::{Engine, EngineConfig};
use engine_common::config::ConfigLoader;
use engine_common::tracing_init::init_tracing_with_default_env_filter;
use std::path::Path;
use tokio::task::JoinSet;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let loader = ConfigLoader::<EngineConfig>::new(Path::new("config/engine.toml"));
    let Some(config) = loader.load_or_dump_config() else {
        return Ok(());
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))
}

async fn async_main(config: EngineConfig) -> anyhow::Result<()> {
    init_tracing_with_default_env_filter(&config.tracing);

    let engine = Engine::new(config).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut join_set = JoinSet::new();
    engine.run(&mut join_set, shutdown_rx).await;

    info!("execution engine running, awaiting shutdown signal");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(%err, "failed to install ctrl-c handler");
            }
            info!("shutdown signal received, stopping background loops");
        }
        result = join_all(&mut join_set) => {
            error!(?result, "a background loop exited before shutdown was requested");
        }
    }

    let _ = shutdown_tx.send(true);
    while join_set.join_next().await.is_some() {}

    info!("execution engine stopped");
    Ok(())
}

/// Resolves as soon as any task in the set finishes, so `async_main` can
/// react to an unexpected early exit instead of waiting for ctrl-c forever.
async fn join_all(join_set: &mut JoinSet<anyhow::Result<()>>) -> Option<anyhow::Result<()>> {
    match join_set.join_next().await {
        Some(Ok(result)) => Some(result),
        Some(Err(join_err)) => Some(Err(join_err.into())),
        None => std::future::pending().await,
    }
}
