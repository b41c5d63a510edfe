//! Reconciler - republishes jobs for originals the worker never finished.
//!
//! Upload stores the original before publishing its job, so a failed publish
//! leaves an original with no pending work. A periodic sweep finds originals
//! still lacking a rendition map after a grace period and publishes a job for
//! each, unless one is already queued, in flight, or dead-lettered.

use super::{
    job_queue::{JobQueue, QueueError},
    storage_service::{StorageError, StorageService},
};
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Floor for the sweep period; `tokio::time::interval` rejects zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    pub queue: String,
    /// Minimum age of an unprocessed original before it is republished.
    pub grace: Duration,
    /// Originals examined per query.
    pub batch_size: i64,
}

pub struct Reconciler {
    storage: StorageService,
    queue: JobQueue,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(storage: StorageService, queue: JobQueue, config: ReconcilerConfig) -> Self {
        Self {
            storage,
            queue,
            config,
        }
    }

    /// Run one sweep. Returns how many jobs were published.
    pub async fn sweep(&self) -> Result<usize, ReconcileError> {
        let grace = chrono::Duration::from_std(self.config.grace)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = Utc::now() - grace;

        let candidates = self
            .storage
            .list_unprocessed_photos(cutoff, self.config.batch_size)
            .await?;

        let mut published = 0;
        for photo_id in candidates {
            if let Some(job_id) = self
                .queue
                .publish_unique(&self.config.queue, &photo_id.to_string())
                .await?
            {
                warn!(photo_id = %photo_id, job_id, "republished job for unprocessed photo");
                published += 1;
            }
        }
        Ok(published)
    }

    /// Sweep immediately, then every `interval`, until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            grace_secs = self.config.grace.as_secs(),
            "reconciler started"
        );

        let mut ticker = tokio::time::interval(interval.max(MIN_SWEEP_INTERVAL));
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(0) => {}
                        Ok(count) => info!(published = count, "reconciliation sweep completed"),
                        Err(e) => error!(error = %e, "reconciliation sweep failed, will retry next interval"),
                    }
                }
            }
        }

        info!("reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        models::photo::{ImageType, NewPhoto, RenditionMap},
        services::job_queue::{PHOTOS_QUEUE, QueueSettings},
    };
    use bytes::Bytes;
    use futures::stream;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, StorageService, JobQueue) {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(db::connect(&db::sqlite_url(dir.path())).await.unwrap());
        db::run_migrations(&pool).await.unwrap();
        let storage = StorageService::new(pool.clone(), dir.path().join("objects"));
        let queue = JobQueue::new(pool, QueueSettings::default());
        (dir, storage, queue)
    }

    async fn upload(storage: &StorageService) -> uuid::Uuid {
        let photo = NewPhoto::new(Some("5".into()), None, ImageType::Jpeg).unwrap();
        storage
            .put_photo_stream(
                &photo,
                stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"x"))]),
            )
            .await
            .unwrap()
            .id
    }

    fn reconciler(storage: &StorageService, queue: &JobQueue, grace: Duration) -> Reconciler {
        Reconciler::new(
            storage.clone(),
            queue.clone(),
            ReconcilerConfig {
                queue: PHOTOS_QUEUE.into(),
                grace,
                batch_size: 100,
            },
        )
    }

    #[tokio::test]
    async fn republishes_orphaned_originals_once() {
        let (_dir, storage, queue) = setup().await;
        let orphan = upload(&storage).await;
        let done = upload(&storage).await;
        storage
            .update_renditions(done, &RenditionMap::new())
            .await
            .unwrap();

        let sweeper = reconciler(&storage, &queue, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sweeper.sweep().await.unwrap(), 1);
        assert_eq!(sweeper.sweep().await.unwrap(), 0);

        let delivery = queue
            .reserve(PHOTOS_QUEUE, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, orphan.to_string());
    }

    #[tokio::test]
    async fn leaves_recent_uploads_alone() {
        let (_dir, storage, queue) = setup().await;
        upload(&storage).await;

        let sweeper = reconciler(&storage, &queue, Duration::from_secs(3600));
        assert_eq!(sweeper.sweep().await.unwrap(), 0);
        assert_eq!(queue.depth(PHOTOS_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_interval_runs_and_stops_cleanly() {
        let (_dir, storage, queue) = setup().await;
        let orphan = upload(&storage).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let sweeper = reconciler(&storage, &queue, Duration::ZERO);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { sweeper.run(Duration::ZERO, shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.expect("reconciler task should not panic");

        let delivery = queue
            .reserve(PHOTOS_QUEUE, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, orphan.to_string());
        assert_eq!(queue.depth(PHOTOS_QUEUE).await.unwrap(), 1);
    }
}
