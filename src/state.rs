//! Shared state handed to every HTTP handler.

use crate::services::{job_queue::JobQueue, storage_service::StorageService};
use std::path::PathBuf;

/// Where uploads are spooled and how large they may be.
#[derive(Clone, Debug)]
pub struct UploadSettings {
    pub dir: PathBuf,
    pub max_bytes: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub queue: JobQueue,
    pub uploads: UploadSettings,
}
