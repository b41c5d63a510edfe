//! Defines routes for photo upload, retrieval and media delivery.
//!
//! ## Structure
//! - **Photo endpoints**
//!   - `POST /photos` - multipart upload (`businessid`, `caption`, `image`)
//!   - `GET  /photos/{id}` - metadata plus rendition URLs
//!   - `GET  /businesses/{businessid}/photos` - all photos of one business
//!
//! - **Media endpoints**
//!   - `GET  /media/images/{filename}` - raw bytes of an original or rendition
//!
//! - **Health endpoints**
//!   - `GET  /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        media_handlers::get_media,
        photo_handlers::{create_photo, get_photo, list_business_photos},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Room for the non-image form fields and multipart framing.
const FORM_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Build the router for all endpoints.
///
/// `upload_limit` is the largest accepted image in bytes. The request body
/// limit on `POST /photos` is raised just past it so the upload spool, not
/// the extractor, decides when an image is too large.
pub fn routes(upload_limit: u64) -> Router<AppState> {
    let body_limit = usize::try_from(upload_limit.saturating_add(FORM_OVERHEAD_BYTES))
        .unwrap_or(usize::MAX);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/photos",
            post(create_photo).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/photos/{id}", get(get_photo))
        .route("/businesses/{businessid}/photos", get(list_business_photos))
        .route("/media/images/{filename}", get(get_media))
}

/// Router with state attached, ready to serve.
pub fn app(state: AppState) -> Router {
    let upload_limit = state.uploads.max_bytes;
    routes(upload_limit).with_state(state)
}
