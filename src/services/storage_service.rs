//! src/services/storage_service.rs
//!
//! StorageService - the binary object store behind the photo pipeline.
//! Metadata lives in SQLite; payloads live on disk sharded beneath
//! `base_path/{shard}/{shard}/{id}`. Originals carry a `photos` row with the
//! business reference, caption and, once the resize worker has run, the
//! rendition map.

use crate::models::{
    object::StoredObject,
    photo::{NewPhoto, Photo, RenditionMap, SizeLabel, original_filename, rendition_filename},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut, stream};
use md5::Context;
use sqlx::{SqlitePool, types::Json};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("photo `{0}` not found")]
    PhotoNotFound(Uuid),
    #[error("invalid object filename")]
    InvalidFilename,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectNotFound(_) | StorageError::PhotoNotFound(_)
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Removes a file when dropped unless disarmed first. Covers early returns
/// and futures cancelled between writing a payload and recording it.
struct RemoveOnDrop {
    path: Option<PathBuf>,
}

impl RemoveOnDrop {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed unrecorded payload"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove payload"),
        }
    }
}

const MAX_FILENAME_LEN: usize = 255;

const OBJECT_COLUMNS: &str =
    "id, filename, content_type, size_bytes, etag, created_at, updated_at";
const PHOTO_COLUMNS: &str =
    "id, business_id, caption, content_type, sizes, processed_at, created_at";

/// StorageService provides the object store operations the pipeline needs:
/// - Store an uploaded original together with its photo metadata
/// - Store (or overwrite) a rendition under its deterministic filename
/// - Open a stored object for streaming, by id or by filename
/// - Buffer a whole object into memory
/// - Attach a rendition map to an original in one update
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Reject filenames that could not have been issued by the store.
    fn ensure_filename_safe(&self, filename: &str) -> StorageResult<()> {
        if filename.is_empty() || filename.len() > MAX_FILENAME_LEN {
            return Err(StorageError::InvalidFilename);
        }
        if filename.contains("..") {
            return Err(StorageError::InvalidFilename);
        }
        if filename
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\')
        {
            return Err(StorageError::InvalidFilename);
        }
        Ok(())
    }

    /// Two-level shard identifiers for an object id.
    ///
    /// Uses MD5(id) and returns the first two bytes as lowercase hex.
    fn object_shards(id: Uuid) -> (String, String) {
        let digest = md5::compute(id.as_bytes());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Fully-qualified payload path for an object. Parent directories may
    /// not exist yet.
    fn object_path(&self, id: Uuid) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(id.to_string());
        path
    }

    /// Stream bytes into the payload file for `id`.
    ///
    /// Writes to a temp file, computes MD5 and size on the way, fsyncs, then
    /// renames over the final path. The temp file is removed on every error
    /// and when the returned future is dropped before completion.
    async fn write_payload<S>(&self, id: Uuid, stream: S) -> StorageResult<(i64, String)>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let file_path = self.object_path(id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let tmp_guard = RemoveOnDrop::new(tmp_path.clone());
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() != ErrorKind::AlreadyExists {
                return Err(StorageError::Io(err));
            }
            fs::remove_file(&file_path).await?;
            fs::rename(&tmp_path, &file_path).await?;
        }
        tmp_guard.disarm();

        Ok((size_bytes, format!("{:x}", digest.compute())))
    }

    /// Store an uploaded original and its photo metadata.
    ///
    /// The store issues the identifier. Object and photo rows are inserted in
    /// one transaction; the payload file is removed if that fails.
    pub async fn put_photo_stream<S>(&self, photo: &NewPhoto, stream: S) -> StorageResult<Photo>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let id = Uuid::new_v4();
        let payload_guard = RemoveOnDrop::new(self.object_path(id));
        let (size_bytes, etag) = self.write_payload(id, stream).await?;
        let filename = original_filename(id, photo.image_type);
        let now = Utc::now();

        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO objects (id, filename, content_type, size_bytes, etag, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&filename)
        .bind(photo.image_type.mime())
        .bind(size_bytes)
        .bind(&etag)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, Photo>(&format!(
            "INSERT INTO photos (id, business_id, caption, content_type, sizes, processed_at, created_at)
             VALUES (?, ?, ?, ?, NULL, NULL, ?)
             RETURNING {PHOTO_COLUMNS}"
        ))
        .bind(id)
        .bind(&photo.business_id)
        .bind(photo.caption.as_deref())
        .bind(photo.image_type.mime())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        payload_guard.disarm();
        Ok(row)
    }

    /// Store a rendition under `<original_id>-<size>.jpg`.
    ///
    /// Overwrites any earlier rendition with the same filename and keeps its
    /// identifier, so re-deriving the same photo yields the same ids.
    pub async fn put_rendition(
        &self,
        original_id: Uuid,
        size: SizeLabel,
        data: Bytes,
    ) -> StorageResult<StoredObject> {
        let filename = rendition_filename(original_id, size);
        let (id, payload_guard) = match self.fetch_object_by_filename(&filename).await {
            Ok(existing) => (existing.id, None),
            Err(StorageError::ObjectNotFound(_)) => {
                let id = Uuid::new_v4();
                (id, Some(RemoveOnDrop::new(self.object_path(id))))
            }
            Err(err) => return Err(err),
        };

        let (size_bytes, etag) = self
            .write_payload(id, stream::iter([Ok::<_, io::Error>(data)]))
            .await?;
        let now = Utc::now();

        let upserted = sqlx::query_as::<_, StoredObject>(&format!(
            "INSERT INTO objects (id, filename, content_type, size_bytes, etag, created_at, updated_at)
             VALUES (?, ?, 'image/jpeg', ?, ?, ?, ?)
             ON CONFLICT(filename) DO UPDATE SET
                 size_bytes = excluded.size_bytes,
                 etag = excluded.etag,
                 updated_at = excluded.updated_at
             WHERE objects.id = excluded.id
             RETURNING {OBJECT_COLUMNS}"
        ))
        .bind(id)
        .bind(&filename)
        .bind(size_bytes)
        .bind(&etag)
        .bind(now)
        .bind(now)
        .fetch_optional(&*self.db)
        .await?;

        match upserted {
            Some(object) => {
                if let Some(guard) = payload_guard {
                    guard.disarm();
                }
                Ok(object)
            }
            None => {
                // Another writer registered this filename first; its payload
                // is authoritative and ours is removed with the guard.
                let object = self.fetch_object_by_filename(&filename).await?;
                debug!(
                    filename = %filename,
                    kept = %object.id,
                    dropped = %id,
                    "rendition registered concurrently"
                );
                Ok(object)
            }
        }
    }

    async fn fetch_object(&self, id: Uuid) -> StorageResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StorageError::ObjectNotFound(id.to_string()))
    }

    async fn fetch_object_by_filename(&self, filename: &str) -> StorageResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE filename = ?"
        ))
        .bind(filename)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StorageError::ObjectNotFound(filename.to_string()))
    }

    /// Open the payload file for a known object.
    ///
    /// Returns ObjectNotFound if metadata exists but the physical file is
    /// missing.
    async fn open_payload(&self, object: &StoredObject) -> StorageResult<File> {
        File::open(self.object_path(object.id))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StorageError::ObjectNotFound(object.filename.clone())
                } else {
                    StorageError::Io(err)
                }
            })
    }

    /// Fetch an object for reading by id.
    pub async fn get_object_reader(&self, id: Uuid) -> StorageResult<(StoredObject, File)> {
        let object = self.fetch_object(id).await?;
        let file = self.open_payload(&object).await?;
        Ok((object, file))
    }

    /// Fetch an object for reading by its public filename.
    pub async fn get_object_reader_by_filename(
        &self,
        filename: &str,
    ) -> StorageResult<(StoredObject, File)> {
        self.ensure_filename_safe(filename)?;
        let object = self.fetch_object_by_filename(filename).await?;
        let file = self.open_payload(&object).await?;
        Ok((object, file))
    }

    /// Read a whole object into memory.
    pub async fn read_object_bytes(&self, id: Uuid) -> StorageResult<Bytes> {
        let (object, mut file) = self.get_object_reader(id).await?;
        let mut buf = Vec::with_capacity(object.size_bytes.max(0) as usize);
        file.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Fetch photo metadata by id.
    pub async fn get_photo(&self, id: Uuid) -> StorageResult<Photo> {
        sqlx::query_as::<_, Photo>(&format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE id = ?"))
            .bind(id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(StorageError::PhotoNotFound(id))
    }

    /// All photos of one business, oldest first.
    pub async fn list_photos_for_business(&self, business_id: &str) -> StorageResult<Vec<Photo>> {
        let photos = sqlx::query_as::<_, Photo>(&format!(
            "SELECT {PHOTO_COLUMNS} FROM photos WHERE business_id = ? ORDER BY created_at ASC"
        ))
        .bind(business_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(photos)
    }

    /// Attach the complete rendition map to an original.
    ///
    /// A full overwrite in a single statement; returns false when no photo
    /// with that id exists.
    pub async fn update_renditions(&self, id: Uuid, sizes: &RenditionMap) -> StorageResult<bool> {
        let result = sqlx::query("UPDATE photos SET sizes = ?, processed_at = ? WHERE id = ?")
            .bind(Json(sizes))
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Originals uploaded before `older_than` that have no rendition map yet.
    pub async fn list_unprocessed_photos(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StorageResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM photos
             WHERE processed_at IS NULL AND created_at < ?
             ORDER BY created_at ASC
             LIMIT ?",
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(ids)
    }
}
