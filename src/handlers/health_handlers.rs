//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity, disk I/O and
//!   the photos queue

use crate::{services::job_queue::PHOTOS_QUEUE, state::AppState};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Very small liveness probe - always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Performs a best-effort write/read/delete against the storage directory.
/// 3. Counts pending jobs on the photos queue.
///
/// Returns JSON describing each check. HTTP 200 when all checks pass,
/// HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    // 1) SQLite check
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.storage.db)
        .await
    {
        Ok(v) if v == 1 => (true, None::<String>),
        Ok(v) => (false, Some(format!("unexpected result: {}", v))),
        Err(e) => (false, Some(format!("error: {}", e))),
    };

    // 2) Disk write/read/delete check (use a temp file under base_path)
    let disk_check = match fs::create_dir_all(&state.storage.base_path).await {
        Err(e) => (false, Some(format!("could not create storage dir: {}", e))),
        Ok(()) => {
            let tmp_path = state
                .storage
                .base_path
                .join(format!(".readyz-{}", Uuid::new_v4()));
            match fs::write(&tmp_path, b"readyz").await {
                Ok(_) => {
                    let read_back = fs::read(&tmp_path).await;
                    let _ = fs::remove_file(&tmp_path).await; // best-effort cleanup
                    match read_back {
                        Ok(bytes) if bytes == b"readyz" => (true, None::<String>),
                        Ok(_) => (false, Some("file content mismatch".to_string())),
                        Err(e) => (false, Some(format!("could not read tmp file: {}", e))),
                    }
                }
                Err(e) => (false, Some(format!("could not write tmp file: {}", e))),
            }
        }
    };

    // 3) Queue check
    let (queue_check, queue_depth) = match state.queue.depth(PHOTOS_QUEUE).await {
        Ok(depth) => ((true, None::<String>), Some(depth)),
        Err(e) => ((false, Some(format!("error: {}", e))), None),
    };

    let overall_ok = sqlite_check.0 && disk_check.0 && queue_check.0;

    let mut checks = HashMap::new();
    checks.insert(
        "sqlite",
        CheckStatus {
            ok: sqlite_check.0,
            error: sqlite_check.1,
        },
    );
    checks.insert(
        "disk",
        CheckStatus {
            ok: disk_check.0,
            error: disk_check.1,
        },
    );
    checks.insert(
        "queue",
        CheckStatus {
            ok: queue_check.0,
            error: queue_check.1,
        },
    );

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        queue_depth,
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    queue_depth: Option<i64>,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
