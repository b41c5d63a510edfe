//! Queue rows and deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle of a queued job.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be reserved once `available_at_ms` has passed.
    Ready,
    /// Reserved by a consumer until `leased_until_ms`.
    Leased,
    /// Acknowledged.
    Done,
    /// Dead-lettered: discarded as poison or out of attempts.
    Dead,
}

/// A row of the `jobs` table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub payload: String,
    pub status: JobStatus,
    pub attempts: i64,
    pub available_at_ms: i64,
    pub leased_until_ms: Option<i64>,
    pub lease_token: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A job handed to a consumer. Acknowledge it with the same lease token it
/// was delivered under; a redelivered job carries a new token.
#[derive(Clone, FromRow, Debug)]
pub struct Delivery {
    #[sqlx(rename = "id")]
    pub job_id: i64,
    pub queue: String,
    pub payload: String,
    pub attempts: i64,
    pub lease_token: String,
}
