//! Serves stored image bytes under `/media/images/{filename}`.
//! Bodies are streamed from disk, never buffered whole.

use crate::{errors::AppError, models::object::StoredObject, state::AppState};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use tokio_util::io::ReaderStream;

/// `GET /media/images/{filename}`
pub async fn get_media(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let (object, file) = state
        .storage
        .get_object_reader_by_filename(&filename)
        .await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &object);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, object: &StoredObject) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&object.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    let length = object.size_bytes.max(0);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", object.etag)) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&object.updated_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    // A filename maps to one photo id and size for its whole life.
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=86400"),
    );
}
