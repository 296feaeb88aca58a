use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::{debug, error};

use crate::errors::RunnerError;
use crate::job::{ArchiveFormat, JobStatus};
use crate::runner::Runner;
use crate::validate::BuildParams;

pub type SharedRunner = Arc<Runner>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub synth_id: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Runner(RunnerError),
    Internal(String),
}

impl From<RunnerError> for ApiError {
    fn from(e: RunnerError) -> Self {
        ApiError::Runner(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Runner(e) => {
                let status = StatusCode::from_u16(e.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if e.is_client_error() {
                    debug!(error = %e, status = status.as_u16(), "request rejected");
                } else if status.is_server_error() {
                    error!(error = %e, "request failed");
                }
                (status, e.to_string())
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"message": message}))).into_response()
    }
}

/// Run a synchronous runner call on the blocking pool.
///
/// The runner touches the filesystem under std locks, so handlers never
/// call it on the async executor directly.
async fn blocking<F, R>(runner: &SharedRunner, f: F) -> Result<R, ApiError>
where
    F: FnOnce(&Runner) -> R + Send + 'static,
    R: Send + 'static,
{
    let runner = Arc::clone(runner);
    tokio::task::spawn_blocking(move || f(&runner))
        .await
        .map_err(|e| {
            error!(error = %e, "runner task panicked");
            ApiError::Internal("Runner task panicked".to_string())
        })
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedRunner> {
    Router::new()
        .route("/v3/tree_of_life/build_tree", post(build_tree))
        .route(
            "/v3/tree_of_life/custom_built_tree_status",
            get(custom_built_tree_status),
        )
        .route(
            "/v3/tree_of_life/list_custom_built_trees",
            get(list_custom_built_trees),
        )
        .route("/v3/tree_of_life/custom_built_tree/{file}", get(custom_built_tree))
        .route("/health", get(health_check))
}

pub fn build_router(runner: SharedRunner) -> Router {
    api_router().with_state(runner)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn build_tree(
    State(runner): State<SharedRunner>,
    body: Bytes,
) -> Result<Json<JobStatus>, ApiError> {
    let params: BuildParams = if body.iter().all(u8::is_ascii_whitespace) {
        BuildParams::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            debug!(error = %e, "malformed build_tree body");
            ApiError::BadRequest(format!("Could not parse request body as JSON: {}", e))
        })?
    };
    let job = blocking(&runner, move |runner| runner.trigger_params(params)).await??;
    Ok(Json(job))
}

async fn custom_built_tree_status(
    State(runner): State<SharedRunner>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<JobStatus>, ApiError> {
    let id = query
        .synth_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(RunnerError::MissingParameter { name: "synth_id" })?;
    let job = blocking(&runner, move |runner| runner.status(id.trim())).await?;
    Ok(Json(job))
}

async fn list_custom_built_trees(
    State(runner): State<SharedRunner>,
) -> Result<Json<BTreeMap<String, JobStatus>>, ApiError> {
    Ok(Json(blocking(&runner, |runner| runner.list()).await?))
}

async fn custom_built_tree(
    State(runner): State<SharedRunner>,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    let (id, ext) = file
        .split_once('.')
        .ok_or_else(|| RunnerError::JobNotFound { id: file.clone() })?;
    let format: ArchiveFormat = ext.parse()?;
    let lookup = id.to_string();
    let path = blocking(&runner, move |runner| runner.archive_path(&lookup, format)).await??;
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        error!(path = %path.display(), error = %e, "failed to read archive");
        RunnerError::JobNotFound { id: id.to_string() }
    })?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.{}\"", id, format.extension()),
            ),
        ],
        bytes,
    )
        .into_response())
}

// ── Tests ─────────────────────────────────────────────────────────────
