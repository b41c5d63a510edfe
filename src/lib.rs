//! Photo upload and retrieval service.
//!
//! The API server (`photo-store`) accepts uploads, stores originals and
//! queues resize jobs. The `resize-worker` binary consumes those jobs and
//! writes fixed-size JPEG renditions back to the same store.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
