//! Daemon command: runs the scheduler loop, the delivery worker pool and
//! the result handler until interrupted.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chime_scheduler::{
    DeliveryConfig, DeliveryPool, ResultHandler, RetryPolicy, Scheduler, SchedulerConfig,
    TaskStore, WebhookDeliverer,
};
use chime_store::SqliteTaskStore;
use chrono::FixedOffset;
use miette::Result;
use mockable::{Clock, DefaultClock};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub utc_offset: FixedOffset,
    pub poll_interval: Duration,
    pub store_timeout: Duration,
    pub delivery: DeliveryConfig,
    pub retry: RetryPolicy,
}

/// Flip `shutdown_tx` once `signal` fires. If the listener cannot be
/// installed the daemon keeps running: the sender is held forever, as a
/// dropped sender wakes every `changed()` receiver.
async fn shutdown_on_signal<F>(signal: F, shutdown_tx: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
        Err(e) => {
            error!(error = %e, "failed to listen for ctrl-c, running until killed");
            std::future::pending::<()>().await;
            drop(shutdown_tx);
        }
    }
}

/// Run the daemon until ctrl-c.
pub async fn run(config: DaemonConfig) -> Result<()> {
    info!(
        db = %config.db_path.display(),
        utc_offset = %config.utc_offset,
        concurrency = config.delivery.concurrency,
        "starting chime daemon"
    );

    let store: Arc<dyn TaskStore> = Arc::new(
        SqliteTaskStore::open(&config.db_path)
            .map_err(|e| miette::miette!("failed to open task database: {}", e))?,
    );
    let clock: Arc<dyn Clock + Send + Sync> = Arc::new(DefaultClock);
    let deliverer = Arc::new(
        WebhookDeliverer::new(config.delivery.timeout)
            .map_err(|e| miette::miette!("failed to build HTTP client: {}", e))?,
    );

    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
    let (report_tx, report_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(shutdown_on_signal(tokio::signal::ctrl_c(), shutdown_tx));

    let workers = DeliveryPool::new(deliverer, clock.clone(), config.delivery).spawn(
        dispatch_rx,
        report_tx,
        shutdown_rx.clone(),
    );

    let handler = ResultHandler::new(
        store.clone(),
        clock.clone(),
        config.retry,
        config.store_timeout,
        dispatch_tx.clone(),
    );
    let handler_handle = tokio::spawn(handler.run(report_rx));

    let scheduler = Scheduler::new(
        store,
        clock,
        SchedulerConfig {
            poll_interval: config.poll_interval,
            store_timeout: config.store_timeout,
            utc_offset: config.utc_offset,
        },
        dispatch_tx,
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "scheduler task panicked");
    }
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "delivery worker panicked");
        }
    }
    // Ends once every worker has dropped its report sender
    if let Err(e) = handler_handle.await {
        error!(error = %e, "result handler panicked");
    }

    info!("chime daemon stopped");
    Ok(())
}
