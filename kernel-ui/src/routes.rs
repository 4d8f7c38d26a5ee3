//! HTTP route handlers for the kernel API.
//!
//! Kernel calls block (runs are joined for `dispatch_wait`, second requests
//! wait `busy_wait`), so every handler hops onto the blocking pool.

use std::path::PathBuf;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use kernel::io::sync::{ChunkWrite, DEFAULT_CHUNK_SIZE};
use kernel::response::Response as Envelope;
use kernel::status::StatusEnvelope;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/command", post(command))
        .route("/status", get(status))
        .route("/abort", post(abort))
        .route("/sync-file", post(sync_file))
        .route("/file", get(read_file))
}

async fn health() -> &'static str {
    "ok"
}

async fn blocking<F>(task: F) -> Json<Envelope>
where
    F: FnOnce() -> Envelope + Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(response) => Json(response),
        Err(err) => {
            warn!(error = %err, "kernel task failed");
            Json(Envelope::failure(
                "INTERNAL_ERROR",
                format!("kernel task failed: {err}"),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    /// One command line, e.g. `run --force a.py`.
    command: String,
}

/// POST /api/command - execute one kernel command line.
async fn command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> Json<Envelope> {
    debug!(command = %request.command, "command received");
    let kernel = state.kernel.clone();
    blocking(move || kernel.execute(&request.command)).await
}

#[derive(Debug, Default, Deserialize)]
struct StatusQuery {
    since: Option<f64>,
    #[serde(default)]
    force: bool,
}

/// GET /api/status - the polling envelope.
async fn status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusEnvelope>, (StatusCode, Json<Envelope>)> {
    let kernel = state.kernel.clone();
    let result = tokio::task::spawn_blocking(move || kernel.status(query.since, query.force)).await;
    match result {
        Ok(Ok(envelope)) => Ok(Json(envelope)),
        Ok(Err(err)) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Envelope::from_error(&err)),
        )),
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Envelope::failure("INTERNAL_ERROR", err.to_string())),
        )),
    }
}

/// POST /api/abort
async fn abort(State(state): State<AppState>) -> Json<Envelope> {
    let kernel = state.kernel.clone();
    blocking(move || kernel.abort()).await
}

#[derive(Debug, Deserialize)]
struct SyncFileRequest {
    /// Path relative to the project directory.
    path: PathBuf,
    /// Base64 chunk contents.
    chunk: String,
    /// Chunk position; absent replaces the whole file.
    index: Option<usize>,
    chunk_size: Option<usize>,
}

impl SyncFileRequest {
    fn mode(&self) -> ChunkWrite {
        match self.index {
            Some(index) => ChunkWrite::At {
                index,
                chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            },
            None => ChunkWrite::Full,
        }
    }
}

/// POST /api/sync-file - write one chunk of a project file.
async fn sync_file(
    State(state): State<AppState>,
    Json(request): Json<SyncFileRequest>,
) -> Json<Envelope> {
    let kernel = state.kernel.clone();
    blocking(move || kernel.sync_file(&request.path, &request.chunk, request.mode())).await
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    path: PathBuf,
    chunk_size: Option<usize>,
}

/// GET /api/file - a project file as base64 chunks.
async fn read_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Json<Envelope> {
    let kernel = state.kernel.clone();
    let chunk_size = query.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
    blocking(move || kernel.read_file(&query.path, chunk_size)).await
}
