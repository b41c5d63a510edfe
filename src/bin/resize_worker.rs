//! Resize Worker - consumes `photos` jobs and writes fixed-size renditions.
//!
//! Runs `RESIZE_WORKER_CONCURRENCY` consumers against the shared SQLite
//! queue plus one reconciler that republishes jobs for originals left
//! unprocessed. Any number of worker processes may share one database.
//!
//! Environment variables:
//! - PHOTO_STORE_STORAGE_DIR: object payload directory (default: ./data/objects)
//! - PHOTO_STORE_DATABASE_URL: SQLite URL shared with the API server
//! - RESIZE_WORKER_CONCURRENCY: consumer tasks (default: 1)
//! - RESIZE_WORKER_MAX_ATTEMPTS: deliveries before dead-lettering (default: 5)
//! - RESIZE_WORKER_LEASE_SECS: job lease (default: 120)
//! - RESIZE_WORKER_JOB_TIMEOUT_SECS: per-job budget (default: 60)
//! - RESIZE_WORKER_POLL_MS: idle poll interval (default: 500)
//! - RESIZE_WORKER_JPEG_QUALITY: rendition JPEG quality (default: 85)
//! - RESIZE_WORKER_RECONCILE_INTERVAL_SECS: sweep interval (default: 300)
//! - RESIZE_WORKER_RECONCILE_GRACE_SECS: age before republishing (default: 600)

use anyhow::Result;
use photo_store::{
    config::WorkerConfig,
    db,
    services::{
        job_queue::{JobQueue, PHOTOS_QUEUE, QueueSettings, SubscribeOptions},
        reconciler::{Reconciler, ReconcilerConfig},
        rendition_processor::{RenditionConfig, RenditionProcessor},
        resize_worker::ResizeWorker,
        storage_service::StorageService,
    },
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const RECONCILE_BATCH_SIZE: i64 = 100;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("Starting Resize Worker");

    let config = WorkerConfig::from_env_and_args()?;
    info!(?config, "Configuration loaded");

    std::fs::create_dir_all(&config.storage_dir)?;
    let db = Arc::new(db::connect(&config.database_url).await?);
    db::run_migrations(&db).await?;

    let storage = StorageService::new(db.clone(), config.storage_dir.clone());
    let queue = JobQueue::new(
        db.clone(),
        QueueSettings {
            max_attempts: config.max_attempts,
            ..QueueSettings::default()
        },
    );
    let processor = Arc::new(RenditionProcessor::new(RenditionConfig {
        jpeg_quality: config.jpeg_quality,
    }));
    let worker = Arc::new(ResizeWorker::new(storage.clone(), processor));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for ctrl+c, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let options = SubscribeOptions {
        lease: config.lease,
        job_timeout: config.job_timeout,
        poll_interval: config.poll_interval,
    };

    let mut consumers = Vec::with_capacity(config.concurrency);
    for consumer_id in 0..config.concurrency {
        let queue = queue.clone();
        let worker = worker.clone();
        let options = options.clone();
        let shutdown = shutdown_rx.clone();
        consumers.push(tokio::spawn(async move {
            if let Err(e) = queue
                .subscribe(PHOTOS_QUEUE, &options, worker.as_ref(), shutdown)
                .await
            {
                error!(consumer_id, error = %e, "Consumer error");
            }
        }));
    }
    info!(consumers = config.concurrency, "Consumers started");

    let reconciler = Reconciler::new(
        storage,
        queue,
        ReconcilerConfig {
            queue: PHOTOS_QUEUE.to_string(),
            grace: config.reconcile_grace,
            batch_size: RECONCILE_BATCH_SIZE,
        },
    );
    let reconcile_interval = config.reconcile_interval;
    let reconcile_shutdown = shutdown_rx.clone();
    let reconcile_handle = tokio::spawn(async move {
        reconciler.run(reconcile_interval, reconcile_shutdown).await;
    });

    for handle in consumers {
        if let Err(e) = handle.await {
            error!(error = %e, "Consumer task panicked");
        }
    }

    info!("Waiting for reconciler to finish");
    if let Err(e) = reconcile_handle.await {
        error!(error = %e, "Reconciler task panicked");
    }

    info!("Resize Worker stopped");
    Ok(())
}
