//! HTTP handlers for photo upload and retrieval.
//!
//! Upload stores the original and publishes a resize job, then returns
//! without waiting for renditions. Retrieval reports whatever renditions
//! exist at that moment.

use crate::{
    errors::AppError,
    models::photo::{ImageType, NewPhoto, Photo, RenditionMap},
    services::{job_queue::PHOTOS_QUEUE, upload_spool::UploadSpool},
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct PhotoLinks {
    pub photo: String,
    pub business: String,
}

impl PhotoLinks {
    fn for_photo(id: Uuid, business_id: &str) -> Self {
        Self {
            photo: format!("/photos/{}", id),
            business: format!("/businesses/{}", business_id),
        }
    }
}

/// Body of `201 Created` for `POST /photos`.
#[derive(Debug, Serialize)]
pub struct CreatedPhoto {
    pub id: Uuid,
    pub links: PhotoLinks,
}

/// Photo metadata as returned by `GET /photos/{id}`.
#[derive(Debug, Serialize)]
pub struct PhotoResponse {
    pub id: Uuid,
    pub businessid: String,
    pub caption: Option<String>,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub sizes: RenditionMap,
    pub processed: bool,
    pub url: BTreeMap<String, String>,
    pub links: PhotoLinks,
}

impl From<Photo> for PhotoResponse {
    fn from(photo: Photo) -> Self {
        Self {
            id: photo.id,
            sizes: photo.renditions(),
            processed: photo.is_processed(),
            url: photo.urls(),
            links: PhotoLinks::for_photo(photo.id, &photo.business_id),
            businessid: photo.business_id,
            caption: photo.caption,
            content_type: photo.content_type,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PhotoList {
    pub photos: Vec<PhotoResponse>,
}

/// `POST /photos` - multipart form with `businessid`, optional `caption`,
/// and an `image` file part (JPEG or PNG).
pub async fn create_photo(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut business_id = None;
    let mut caption = None;
    let mut image: Option<(ImageType, UploadSpool)> = None;

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "businessid" => business_id = Some(field.text().await?),
            "caption" => caption = Some(field.text().await?),
            "image" => {
                if image.is_some() {
                    return Err(AppError::bad_request("exactly one image is accepted"));
                }
                let image_type = field
                    .content_type()
                    .and_then(ImageType::from_mime)
                    .ok_or_else(|| {
                        AppError::bad_request("image must be image/jpeg or image/png")
                    })?;

                let mut spool =
                    UploadSpool::create(&state.uploads.dir, state.uploads.max_bytes).await?;
                while let Some(chunk) = field.chunk().await? {
                    spool.write_chunk(&chunk).await?;
                }
                spool.finish().await?;
                if spool.is_empty() {
                    return Err(AppError::bad_request("image is empty"));
                }
                image = Some((image_type, spool));
            }
            other => debug!(field = %other, "ignoring unknown multipart field"),
        }
    }

    let (image_type, spool) =
        image.ok_or_else(|| AppError::bad_request("image file is required"))?;
    let new_photo = NewPhoto::new(business_id, caption, image_type)?;

    let stream = spool.reader_stream().await?;
    let photo = state.storage.put_photo_stream(&new_photo, stream).await?;

    if let Err(err) = state
        .queue
        .publish(PHOTOS_QUEUE, &photo.id.to_string())
        .await
    {
        // The original is stored; the reconciler republishes its job.
        warn!(photo_id = %photo.id, error = %err, "failed to publish resize job");
    }

    info!(
        photo_id = %photo.id,
        business_id = %photo.business_id,
        bytes = spool.len(),
        content_type = %photo.content_type,
        "photo uploaded"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreatedPhoto {
            id: photo.id,
            links: PhotoLinks::for_photo(photo.id, &photo.business_id),
        }),
    ))
}

/// `GET /photos/{id}`
pub async fn get_photo(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PhotoResponse>, AppError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| AppError::not_found(format!("photo `{}` not found", id)))?;
    let photo = state.storage.get_photo(id).await?;
    Ok(Json(photo.into()))
}

/// `GET /businesses/{businessid}/photos`
pub async fn list_business_photos(
    State(state): State<AppState>,
    Path(business_id): Path<String>,
) -> Result<Json<PhotoList>, AppError> {
    let photos = state
        .storage
        .list_photos_for_business(business_id.trim())
        .await?;
    Ok(Json(PhotoList {
        photos: photos.into_iter().map(PhotoResponse::from).collect(),
    }))
}
