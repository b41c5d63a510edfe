//! Represents a binary object (original or rendition) held by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single stored blob.
///
/// The `StoredObject` struct carries metadata only; the payload bytes live on
/// disk beneath the storage directory, addressed by `id`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Identifier issued by the store on first upload. Stable afterwards.
    pub id: Uuid,

    /// Public filename, unique across the store (e.g. `<id>-640.jpg`).
    pub filename: String,

    /// Content type (MIME type).
    pub content_type: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 checksum of the payload, lowercase hex.
    pub etag: String,

    /// When the object was first written.
    pub created_at: DateTime<Utc>,

    /// When the payload was last overwritten.
    pub updated_at: DateTime<Utc>,
}
