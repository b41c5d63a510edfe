//! Resize worker - turns one `photos` job into a complete rendition set.
//!
//! For each job:
//! 1. Read the original into memory
//! 2. Derive every eligible ladder size off the async runtime
//! 3. Store each rendition under its deterministic filename
//! 4. Write the full size map onto the original in one update
//!
//! The queue acknowledges the job only after step 4, so a crash anywhere
//! earlier leads to redelivery. Re-running a job overwrites the same
//! rendition objects and the same map.

use super::{
    job_queue::{JobHandler, JobOutcome},
    rendition_processor::{RenditionError, RenditionProcessor},
    storage_service::{StorageError, StorageService},
};
use crate::models::{
    job::Delivery,
    photo::{RenditionMap, SizeLabel},
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("payload `{0}` is not a photo id")]
    InvalidPayload(String),
    #[error("photo `{0}` no longer exists")]
    PhotoVanished(Uuid),
    #[error("rendition {size} exceeds the {width}x{height} original")]
    Upscaled {
        size: SizeLabel,
        width: u32,
        height: u32,
    },
    #[error(transparent)]
    Rendition(#[from] RenditionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl WorkerError {
    /// Whether running the same job again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Storage(err) => !err.is_not_found(),
            WorkerError::Rendition(RenditionError::Panicked(_)) => true,
            _ => false,
        }
    }

    fn outcome(&self) -> JobOutcome {
        if self.is_retryable() {
            JobOutcome::Retry(self.to_string())
        } else {
            JobOutcome::Discard(self.to_string())
        }
    }
}

pub struct ResizeWorker {
    storage: StorageService,
    processor: Arc<RenditionProcessor>,
}

impl ResizeWorker {
    pub fn new(storage: StorageService, processor: Arc<RenditionProcessor>) -> Self {
        Self { storage, processor }
    }

    /// Derive, store and record the renditions of one photo.
    pub async fn process(&self, photo_id: Uuid) -> Result<RenditionMap, WorkerError> {
        let original = self.storage.read_object_bytes(photo_id).await?;
        let original_len = original.len();

        let derived = self.processor.clone().derive_async(original).await?;

        let mut sizes = RenditionMap::new();
        for rendition in derived.renditions {
            let object = self
                .storage
                .put_rendition(photo_id, rendition.size, rendition.data)
                .await
                .inspect_err(|err| {
                    error!(
                        photo_id = %photo_id,
                        size = %rendition.size,
                        error = %err,
                        "failed to store rendition"
                    )
                })?;
            sizes.insert(rendition.size, object.id);
        }

        sizes
            .check_within(derived.width, derived.height)
            .map_err(|size| WorkerError::Upscaled {
                size,
                width: derived.width,
                height: derived.height,
            })?;

        if !self.storage.update_renditions(photo_id, &sizes).await? {
            return Err(WorkerError::PhotoVanished(photo_id));
        }

        info!(
            photo_id = %photo_id,
            width = derived.width,
            height = derived.height,
            original_bytes = original_len,
            renditions = sizes.len(),
            "renditions recorded"
        );
        Ok(sizes)
    }
}

impl JobHandler for ResizeWorker {
    async fn handle(&self, delivery: &Delivery) -> JobOutcome {
        let result = match Uuid::parse_str(delivery.payload.trim()) {
            Ok(photo_id) => self.process(photo_id).await.map(|_| ()),
            Err(_) => Err(WorkerError::InvalidPayload(delivery.payload.clone())),
        };

        match result {
            Ok(()) => JobOutcome::Complete,
            Err(err) => {
                warn!(
                    job_id = delivery.job_id,
                    attempts = delivery.attempts,
                    retryable = err.is_retryable(),
                    error = %err,
                    "resize job failed"
                );
                err.outcome()
            }
        }
    }
}
