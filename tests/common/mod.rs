#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{self, Request};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use tempfile::TempDir;

use photo_store::db;
use photo_store::services::job_queue::{JobQueue, QueueSettings};
use photo_store::services::storage_service::StorageService;
use photo_store::state::{AppState, UploadSettings};

pub const BOUNDARY: &str = "photo-store-test-boundary";

/// A temp directory holding the database, object payloads and upload spools.
pub struct TestEnv {
    pub dir: TempDir,
    pub state: AppState,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_upload_limit(10 * 1024 * 1024).await
    }

    pub async fn with_upload_limit(max_bytes: u64) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let pool = Arc::new(
            db::connect(&db::sqlite_url(dir.path()))
                .await
                .expect("db should open"),
        );
        db::run_migrations(&pool).await.expect("migrations");

        let state = AppState {
            storage: StorageService::new(pool.clone(), dir.path().join("objects")),
            queue: JobQueue::new(pool, QueueSettings::default()),
            uploads: UploadSettings {
                dir: dir.path().join("uploads"),
                max_bytes,
            },
        };
        Self { dir, state }
    }

    pub fn app(&self) -> axum::Router {
        photo_store::routes::routes::app(self.state.clone())
    }

    pub async fn object_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM objects")
            .fetch_one(&*self.state.storage.db)
            .await
            .expect("count objects")
    }

    pub async fn job_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&*self.state.storage.db)
            .await
            .expect("count jobs")
    }
}

pub fn encode(width: u32, height: u32, format: ImageOutputFormat) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), format)
        .expect("encode test image");
    buf
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageOutputFormat::Png)
}

pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageOutputFormat::Jpeg(90))
}

/// One part of a multipart form.
pub enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        name: &'a str,
        content_type: &'a str,
        data: &'a [u8],
    },
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File {
                name,
                content_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"upload\"\r\n\
                         Content-Type: {}\r\n\r\n",
                        name, content_type
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn upload_request(parts: &[Part<'_>]) -> Request<Body> {
    Request::builder()
        .method(http::Method::POST)
        .uri("/photos")
        .header(
            http::header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .expect("request")
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

pub async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body")
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}
