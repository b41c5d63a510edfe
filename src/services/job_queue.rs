//! src/services/job_queue.rs
//!
//! JobQueue - a durable, at-least-once work queue stored in SQLite.
//!
//! A consumer reserves a job under a time-limited lease. The job is finished
//! only by an explicit `ack` carrying the lease token it was delivered with;
//! a consumer that dies mid-job simply lets the lease expire and the job is
//! delivered again. `nack` puts the job back with exponential backoff until
//! `max_attempts` is reached, after which it is dead-lettered.

use crate::models::job::{Delivery, Job, JobStatus};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Name of the queue the photo pipeline publishes to.
pub const PHOTOS_QUEUE: &str = "photos";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue name must not be empty")]
    EmptyQueueName,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Retry policy shared by every consumer of a queue.
#[derive(Clone, Debug)]
pub struct QueueSettings {
    /// Deliveries allowed before a job is dead-lettered.
    pub max_attempts: i64,
    /// Delay before the first retry; doubles on every further attempt.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Consumer loop parameters.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    /// How long a reserved job stays invisible to other consumers.
    pub lease: Duration,
    /// Handler time budget; an overrunning job is nacked.
    pub job_timeout: Duration,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(120),
            job_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// What a handler decided about one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Work is durable; acknowledge.
    Complete,
    /// Transient failure; deliver again later.
    Retry(String),
    /// The job can never succeed; dead-letter it without retrying.
    Discard(String),
}

/// Result of a negative acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { available_at_ms: i64 },
    DeadLettered,
    /// The lease had already expired and the job was handed to someone else.
    LeaseLost,
}

/// Processes deliveries for `JobQueue::subscribe`.
pub trait JobHandler: Send + Sync {
    fn handle(&self, delivery: &Delivery) -> impl Future<Output = JobOutcome> + Send;
}

#[derive(Clone)]
pub struct JobQueue {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    settings: QueueSettings,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn ensure_queue_name(queue: &str) -> QueueResult<()> {
    if queue.trim().is_empty() {
        return Err(QueueError::EmptyQueueName);
    }
    Ok(())
}

impl JobQueue {
    pub fn new(db: Arc<SqlitePool>, settings: QueueSettings) -> Self {
        Self { db, settings }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Backoff before delivery number `attempts + 1`.
    fn backoff(&self, attempts: i64) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
        self.settings
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.settings.max_backoff)
    }

    /// Append a job to `queue`. Returns the job id.
    pub async fn publish(&self, queue: &str, payload: &str) -> QueueResult<i64> {
        ensure_queue_name(queue)?;
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO jobs (queue, payload, status, attempts, available_at_ms, created_at, updated_at)
             VALUES (?, ?, 'ready', 0, ?, ?, ?)
             RETURNING id",
        )
        .bind(queue)
        .bind(payload)
        .bind(now.timestamp_millis())
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;
        debug!(queue, job_id = id, "job published");
        Ok(id)
    }

    /// Publish unless a job with the same payload is already waiting, in
    /// flight, or dead-lettered. Returns the new job id, if one was created.
    pub async fn publish_unique(&self, queue: &str, payload: &str) -> QueueResult<Option<i64>> {
        ensure_queue_name(queue)?;
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO jobs (queue, payload, status, attempts, available_at_ms, created_at, updated_at)
             SELECT ?, ?, 'ready', 0, ?, ?, ?
             WHERE NOT EXISTS (
                 SELECT 1 FROM jobs
                 WHERE queue = ? AND payload = ? AND status IN ('ready', 'leased', 'dead')
             )
             RETURNING id",
        )
        .bind(queue)
        .bind(payload)
        .bind(now.timestamp_millis())
        .bind(now)
        .bind(now)
        .bind(queue)
        .bind(payload)
        .fetch_optional(&*self.db)
        .await?;
        Ok(id)
    }

    /// Lease the oldest available job of `queue`.
    ///
    /// Ready jobs whose backoff has elapsed and leased jobs whose lease has
    /// expired are both eligible; the latter is how a crashed consumer's job
    /// gets redelivered. A job redelivered past `max_attempts` is
    /// dead-lettered instead of handed out.
    pub async fn reserve(&self, queue: &str, lease: Duration) -> QueueResult<Option<Delivery>> {
        ensure_queue_name(queue)?;
        loop {
            let now = now_ms();
            let token = Uuid::new_v4().to_string();
            let delivery = sqlx::query_as::<_, Delivery>(
                "UPDATE jobs
                 SET status = 'leased',
                     attempts = attempts + 1,
                     leased_until_ms = ?,
                     lease_token = ?,
                     updated_at = ?
                 WHERE id = (
                     SELECT id FROM jobs
                     WHERE queue = ?
                       AND ((status = 'ready' AND available_at_ms <= ?)
                         OR (status = 'leased' AND leased_until_ms <= ?))
                     ORDER BY available_at_ms ASC, id ASC
                     LIMIT 1
                 )
                 RETURNING id, queue, payload, attempts, lease_token",
            )
            .bind(now.saturating_add(duration_ms(lease)))
            .bind(&token)
            .bind(Utc::now())
            .bind(queue)
            .bind(now)
            .bind(now)
            .fetch_optional(&*self.db)
            .await?;

            match delivery {
                Some(delivery) if delivery.attempts > self.settings.max_attempts => {
                    warn!(
                        queue,
                        job_id = delivery.job_id,
                        attempts = delivery.attempts,
                        "job exceeded max attempts through expired leases; dead-lettering"
                    );
                    self.discard(&delivery, "lease expired on every attempt")
                        .await?;
                }
                other => return Ok(other),
            }
        }
    }

    /// Acknowledge a delivery. Returns false when the lease was lost, in
    /// which case the job has been or will be delivered again.
    pub async fn ack(&self, delivery: &Delivery) -> QueueResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'done', leased_until_ms = NULL, lease_token = NULL, updated_at = ?
             WHERE id = ? AND status = 'leased' AND lease_token = ?",
        )
        .bind(Utc::now())
        .bind(delivery.job_id)
        .bind(&delivery.lease_token)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Put a delivery back for a later attempt, or dead-letter it once it
    /// has used up its attempts.
    pub async fn nack(&self, delivery: &Delivery, error_msg: &str) -> QueueResult<NackOutcome> {
        if delivery.attempts >= self.settings.max_attempts {
            return Ok(if self.discard(delivery, error_msg).await? {
                NackOutcome::DeadLettered
            } else {
                NackOutcome::LeaseLost
            });
        }

        let available_at_ms = now_ms().saturating_add(duration_ms(self.backoff(delivery.attempts)));
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'ready', available_at_ms = ?, leased_until_ms = NULL,
                 lease_token = NULL, last_error = ?, updated_at = ?
             WHERE id = ? AND status = 'leased' AND lease_token = ?",
        )
        .bind(available_at_ms)
        .bind(error_msg)
        .bind(Utc::now())
        .bind(delivery.job_id)
        .bind(&delivery.lease_token)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(NackOutcome::LeaseLost);
        }
        Ok(NackOutcome::Requeued { available_at_ms })
    }

    /// Dead-letter a delivery immediately. Returns false when the lease was
    /// lost.
    pub async fn discard(&self, delivery: &Delivery, reason: &str) -> QueueResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'dead', leased_until_ms = NULL, lease_token = NULL,
                 last_error = ?, updated_at = ?
             WHERE id = ? AND status = 'leased' AND lease_token = ?",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(delivery.job_id)
        .bind(&delivery.lease_token)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Dead-lettered jobs of `queue`, most recent first.
    pub async fn dead_letters(&self, queue: &str, limit: i64) -> QueueResult<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT id, queue, payload, status, attempts, available_at_ms, leased_until_ms,
                    lease_token, last_error, created_at, updated_at
             FROM jobs
             WHERE queue = ? AND status = ?
             ORDER BY updated_at DESC, id DESC
             LIMIT ?",
        )
        .bind(queue)
        .bind(JobStatus::Dead)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(jobs)
    }

    /// Move a dead-lettered job back to ready with a fresh attempt budget.
    pub async fn requeue_dead(&self, job_id: i64) -> QueueResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'ready', attempts = 0, available_at_ms = ?, updated_at = ?
             WHERE id = ? AND status = 'dead'",
        )
        .bind(now_ms())
        .bind(Utc::now())
        .bind(job_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Jobs of `queue` that are ready or in flight.
    pub async fn depth(&self, queue: &str) -> QueueResult<i64> {
        let depth = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE queue = ? AND status IN ('ready', 'leased')",
        )
        .bind(queue)
        .fetch_one(&*self.db)
        .await?;
        Ok(depth)
    }

    /// Consume `queue` one job at a time until `shutdown` flips to true.
    ///
    /// Each delivery is acknowledged only after the handler reports
    /// `Complete`. Queue errors are logged and the loop keeps going.
    pub async fn subscribe<H>(
        &self,
        queue: &str,
        options: &SubscribeOptions,
        handler: &H,
        mut shutdown: watch::Receiver<bool>,
    ) -> QueueResult<()>
    where
        H: JobHandler,
    {
        ensure_queue_name(queue)?;
        info!(queue, ?options, "consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.reserve(queue, options.lease).await {
                Ok(Some(delivery)) => {
                    self.dispatch(&delivery, options, handler).await;
                    continue;
                }
                Ok(None) => {}
                Err(err) => error!(queue, error = %err, "failed to reserve job"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(options.poll_interval) => {}
            }
        }

        info!(queue, "consumer stopped");
        Ok(())
    }

    async fn dispatch<H>(&self, delivery: &Delivery, options: &SubscribeOptions, handler: &H)
    where
        H: JobHandler,
    {
        debug!(
            job_id = delivery.job_id,
            attempts = delivery.attempts,
            payload = %delivery.payload,
            "job delivered"
        );

        let outcome = match tokio::time::timeout(options.job_timeout, handler.handle(delivery)).await
        {
            Ok(outcome) => outcome,
            Err(_) => JobOutcome::Retry(format!("timed out after {:?}", options.job_timeout)),
        };

        match outcome {
            JobOutcome::Complete => match self.ack(delivery).await {
                Ok(true) => debug!(job_id = delivery.job_id, "job acknowledged"),
                Ok(false) => warn!(
                    job_id = delivery.job_id,
                    "lease expired before ack; job will be redelivered"
                ),
                Err(err) => error!(job_id = delivery.job_id, error = %err, "ack failed"),
            },
            JobOutcome::Retry(reason) => match self.nack(delivery, &reason).await {
                Ok(NackOutcome::Requeued { available_at_ms }) => warn!(
                    job_id = delivery.job_id,
                    attempts = delivery.attempts,
                    available_at_ms,
                    reason = %reason,
                    "job failed; requeued"
                ),
                Ok(NackOutcome::DeadLettered) => error!(
                    job_id = delivery.job_id,
                    attempts = delivery.attempts,
                    reason = %reason,
                    "job failed on final attempt; dead-lettered"
                ),
                Ok(NackOutcome::LeaseLost) => {
                    warn!(job_id = delivery.job_id, "lease expired before nack")
                }
                Err(err) => error!(job_id = delivery.job_id, error = %err, "nack failed"),
            },
            JobOutcome::Discard(reason) => match self.discard(delivery, &reason).await {
                Ok(_) => warn!(job_id = delivery.job_id, reason = %reason, "job discarded"),
                Err(err) => error!(job_id = delivery.job_id, error = %err, "discard failed"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn queue(settings: QueueSettings) -> (TempDir, JobQueue) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect(&db::sqlite_url(dir.path())).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        (dir, JobQueue::new(Arc::new(pool), settings))
    }

    fn immediate_retries(max_attempts: i64) -> QueueSettings {
        QueueSettings {
            max_attempts,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn reserve_and_ack() {
        let (_dir, q) = queue(QueueSettings::default()).await;
        assert!(q.reserve("photos", LEASE).await.unwrap().is_none());

        let id = q.publish("photos", "abc").await.unwrap();
        let delivery = q.reserve("photos", LEASE).await.unwrap().unwrap();
        assert_eq!(delivery.job_id, id);
        assert_eq!(delivery.payload, "abc");
        assert_eq!(delivery.attempts, 1);

        // Leased jobs are invisible to other consumers.
        assert!(q.reserve("photos", LEASE).await.unwrap().is_none());
        assert_eq!(q.depth("photos").await.unwrap(), 1);

        assert!(q.ack(&delivery).await.unwrap());
        assert_eq!(q.depth("photos").await.unwrap(), 0);
        assert!(!q.ack(&delivery).await.unwrap());
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let (_dir, q) = queue(QueueSettings::default()).await;
        q.publish("other", "x").await.unwrap();
        assert!(q.reserve("photos", LEASE).await.unwrap().is_none());
        assert!(matches!(
            q.publish(" ", "x").await,
            Err(QueueError::EmptyQueueName)
        ));
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_stale_ack_rejected() {
        let (_dir, q) = queue(QueueSettings::default()).await;
        q.publish("photos", "abc").await.unwrap();

        let first = q.reserve("photos", Duration::ZERO).await.unwrap().unwrap();
        let second = q.reserve("photos", LEASE).await.unwrap().unwrap();
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(second.attempts, 2);
        assert_ne!(first.lease_token, second.lease_token);

        assert!(!q.ack(&first).await.unwrap());
        assert!(q.ack(&second).await.unwrap());
    }

    #[tokio::test]
    async fn nack_requeues_until_attempts_run_out() {
        let (_dir, q) = queue(immediate_retries(2)).await;
        q.publish("photos", "abc").await.unwrap();

        let first = q.reserve("photos", LEASE).await.unwrap().unwrap();
        assert!(matches!(
            q.nack(&first, "store down").await.unwrap(),
            NackOutcome::Requeued { .. }
        ));

        let second = q.reserve("photos", LEASE).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(
            q.nack(&second, "store still down").await.unwrap(),
            NackOutcome::DeadLettered
        );
        assert!(q.reserve("photos", LEASE).await.unwrap().is_none());

        let dead = q.dead_letters("photos", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].status, JobStatus::Dead);
        assert_eq!(dead[0].last_error.as_deref(), Some("store still down"));
    }

    #[tokio::test]
    async fn nack_applies_backoff() {
        let (_dir, q) = queue(QueueSettings {
            max_attempts: 5,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60),
        })
        .await;
        q.publish("photos", "abc").await.unwrap();
        let delivery = q.reserve("photos", LEASE).await.unwrap().unwrap();
        q.nack(&delivery, "later").await.unwrap();
        assert!(q.reserve("photos", LEASE).await.unwrap().is_none());

        assert_eq!(q.backoff(1), Duration::from_secs(30));
        assert_eq!(q.backoff(2), Duration::from_secs(60));
        assert_eq!(q.backoff(9), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn crash_looping_job_is_dead_lettered_on_redelivery() {
        let (_dir, q) = queue(immediate_retries(2)).await;
        q.publish("photos", "abc").await.unwrap();
        q.reserve("photos", Duration::ZERO).await.unwrap().unwrap();
        q.reserve("photos", Duration::ZERO).await.unwrap().unwrap();

        assert!(q.reserve("photos", LEASE).await.unwrap().is_none());
        assert_eq!(q.dead_letters("photos", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_unique_skips_live_and_dead_jobs() {
        let (_dir, q) = queue(QueueSettings::default()).await;
        assert!(q.publish_unique("photos", "abc").await.unwrap().is_some());
        assert!(q.publish_unique("photos", "abc").await.unwrap().is_none());

        let delivery = q.reserve("photos", LEASE).await.unwrap().unwrap();
        assert!(q.publish_unique("photos", "abc").await.unwrap().is_none());

        q.discard(&delivery, "corrupt image").await.unwrap();
        assert!(q.publish_unique("photos", "abc").await.unwrap().is_none());

        let dead = q.dead_letters("photos", 10).await.unwrap();
        assert!(q.requeue_dead(dead[0].id).await.unwrap());
        let again = q.reserve("photos", LEASE).await.unwrap().unwrap();
        assert_eq!(again.attempts, 1);
        q.ack(&again).await.unwrap();

        assert!(q.publish_unique("photos", "abc").await.unwrap().is_some());
    }

    struct CountingHandler {
        seen: AtomicUsize,
        stop: watch::Sender<bool>,
        outcome: JobOutcome,
    }

    impl JobHandler for CountingHandler {
        async fn handle(&self, _delivery: &Delivery) -> JobOutcome {
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                let _ = self.stop.send(true);
            }
            self.outcome.clone()
        }
    }

    #[tokio::test]
    async fn subscribe_acks_completed_jobs_and_honours_shutdown() {
        let (_dir, q) = queue(QueueSettings::default()).await;
        q.publish("photos", "a").await.unwrap();
        q.publish("photos", "b").await.unwrap();
        q.publish("photos", "c").await.unwrap();

        let (stop, shutdown) = watch::channel(false);
        let handler = CountingHandler {
            seen: AtomicUsize::new(0),
            stop,
            outcome: JobOutcome::Complete,
        };
        let options = SubscribeOptions {
            poll_interval: Duration::from_millis(10),
            ..SubscribeOptions::default()
        };
        q.subscribe("photos", &options, &handler, shutdown)
            .await
            .unwrap();

        assert_eq!(handler.seen.load(Ordering::SeqCst), 2);
        assert_eq!(q.depth("photos").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn subscribe_dead_letters_discarded_jobs() {
        let (_dir, q) = queue(QueueSettings::default()).await;
        q.publish("photos", "a").await.unwrap();
        q.publish("photos", "b").await.unwrap();

        let (stop, shutdown) = watch::channel(false);
        let handler = CountingHandler {
            seen: AtomicUsize::new(0),
            stop,
            outcome: JobOutcome::Discard("unreadable".into()),
        };
        q.subscribe("photos", &SubscribeOptions::default(), &handler, shutdown)
            .await
            .unwrap();

        assert_eq!(q.dead_letters("photos", 10).await.unwrap().len(), 2);
        assert_eq!(q.depth("photos").await.unwrap(), 0);
    }

    struct SlowHandler;

    impl JobHandler for SlowHandler {
        async fn handle(&self, _delivery: &Delivery) -> JobOutcome {
            tokio::time::sleep(Duration::from_secs(5)).await;
            JobOutcome::Complete
        }
    }

    #[tokio::test]
    async fn overrunning_job_is_nacked() {
        let (_dir, q) = queue(QueueSettings::default()).await;
        q.publish("photos", "a").await.unwrap();
        let delivery = q.reserve("photos", LEASE).await.unwrap().unwrap();

        let options = SubscribeOptions {
            job_timeout: Duration::from_millis(20),
            ..SubscribeOptions::default()
        };
        q.dispatch(&delivery, &options, &SlowHandler).await;

        let last_error: Option<String> =
            sqlx::query_scalar("SELECT last_error FROM jobs WHERE id = ?")
                .bind(delivery.job_id)
                .fetch_one(&*q.db)
                .await
                .unwrap();
        assert!(last_error.unwrap().starts_with("timed out"));
    }
}
