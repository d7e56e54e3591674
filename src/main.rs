use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tripwatch::clock::SystemClock;
use tripwatch::config::AppConfig;
use tripwatch::db::{init_pool, run_migrations};
use tripwatch::error::AppError;
use tripwatch::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_logging();

    let config = AppConfig::from_env()?;
    let db = init_pool(&config.database_url).await?;

    if let Err(err) = run_migrations(&db).await {
        error!("migration failed: {err:?}");
        return Err(err);
    }

    let state = AppState::new(config.clone(), db.clone(), Arc::new(SystemClock));

    let (queue, jobs) = mpsc::channel(config.dispatch.queue_capacity);
    let dispatcher = Arc::new(state.dispatcher()?);
    let scheduler = Arc::new(state.scheduler(queue));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch_task = tokio::spawn(dispatcher.run_queue(jobs));
    let monitor_task = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown_tx.send(true).ok();

    if let Err(err) = monitor_task.await {
        error!("monitor task failed: {err}");
    }
    // The scheduler held the last sender, so the queue is now closed and the
    // dispatcher finishes whatever is left.
    match tokio::time::timeout(config.dispatch.drain_timeout, dispatch_task).await {
        Ok(Ok(())) => info!("dispatch queue drained"),
        Ok(Err(err)) => error!("dispatcher task failed: {err}"),
        Err(_) => warn!(
            timeout = ?config.dispatch.drain_timeout,
            "dispatch drain timed out; abandoning remaining sends"
        ),
    }

    db.close().await;
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tripwatch=debug".into());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
