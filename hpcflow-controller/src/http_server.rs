use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::eyre::Result;
use futures::{Stream, StreamExt};
use hpcflow::config::RemoteSettings;
use hpcflow::ipc::{
    BatchRequest, BatchResponse, ErrorBody, FileListing, GenomeListing, SubmitRequest, SubmitResponse,
    UploadResponse, OWNER_HEADER,
};
use hpcflow::jobs::events::{
    status_events, EventTiming, SchedulerWatcher, StatusWatcher, StoreWatcher,
};
use hpcflow::jobs::runner::JobRunner;
use hpcflow::jobs::Job;
use hpcflow::log::*;
use hpcflow::remote::files::{
    genome_entries, join_remote, validate_file_name, validate_relative_path, PathError,
};
use hpcflow::remote::slurm;
use serde::{Deserialize, Serialize};

use crate::executor::Submitter;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("cluster request failed: {0}")]
    Remote(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Remote(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<PathError> for ApiError {
    fn from(e: PathError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Largest accepted upload body.
pub const UPLOAD_LIMIT: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerState {
    pub runner: JobRunner,
    pub submitter: Submitter,
    pub timing: EventTiming,
    pub remote: RemoteSettings,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/v1/jobs", post(submit))
        .route("/v1/jobs/:id", get(job_status))
        .route("/v1/jobs/:id/events", get(job_events))
        .route("/v1/jobs/:id/files", get(list_files))
        .route("/v1/jobs/:id/download", get(download))
        .route("/v1/scheduler/jobs", post(submit_batch))
        .route("/v1/scheduler/:id/events", get(scheduler_events))
        .route("/v1/genomes", get(list_genomes))
        .route(
            "/v1/uploads",
            post(upload).layer(DefaultBodyLimit::max(UPLOAD_LIMIT)),
        )
        .with_state(state)
}

pub async fn run_server(port: u16, state: ServerState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("listening on {}", addr);
    axum::Server::bind(&addr)
        .serve(router(state).into_make_service())
        .await
        .map_err(|e| e.into())
}

async fn root() -> &'static str {
    "hpcflow-controller"
}

#[derive(Serialize, Deserialize, Debug)]
struct Health {
    status: String,
    jobs: usize,
}

async fn health(State(state): State<ServerState>) -> Json<Health> {
    Json(Health {
        status: "ok".into(),
        jobs: state.runner.store().job_ids().len(),
    })
}

fn caller(headers: &HeaderMap) -> Option<&str> {
    headers.get(OWNER_HEADER).and_then(|value| value.to_str().ok())
}

/// The job, if it exists and the caller may see it.
fn visible_job(state: &ServerState, job_id: &str, headers: &HeaderMap) -> Result<Job, ApiError> {
    let job = state
        .runner
        .store()
        .get(job_id)
        .ok_or_else(|| ApiError::NotFound(format!("job {} not found", job_id)))?;
    if !job.visible_to(caller(headers)) {
        return Err(ApiError::Forbidden(format!("job {} belongs to someone else", job_id)));
    }
    Ok(job)
}

fn work_dir(job: &Job) -> Result<&str, ApiError> {
    job.work_dir.as_deref().ok_or_else(|| {
        ApiError::BadRequest(format!("job {} has no working directory yet", job.job_id))
    })
}

async fn submit(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(mut request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    if request.target.trim().is_empty() {
        return Err(ApiError::BadRequest("target must not be empty".into()));
    }
    if request.owner.is_none() {
        request.owner = caller(&headers).map(String::from);
    }
    let response = state.submitter.submit(&state.runner, request);
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn job_status(
    State(state): State<ServerState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Job>, ApiError> {
    visible_job(&state, &job_id, &headers).map(Json)
}

fn sse(
    watcher: Arc<dyn StatusWatcher>,
    timing: EventTiming,
) -> Sse<impl Stream<Item = Result<Event, serde_json::Error>>> {
    let events = status_events(watcher, timing).map(|event| Event::default().json_data(event));
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn job_events(
    State(state): State<ServerState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, serde_json::Error>>>, ApiError> {
    visible_job(&state, &job_id, &headers)?;
    let watcher = StoreWatcher::new(state.runner.store().clone(), job_id);
    Ok(sse(Arc::new(watcher), state.timing))
}

async fn scheduler_events(
    State(state): State<ServerState>,
    Path(scheduler_job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, serde_json::Error>>>, ApiError> {
    if !slurm::is_job_id(&scheduler_job_id) {
        return Err(ApiError::BadRequest(format!(
            "{} is not a scheduler job id",
            scheduler_job_id
        )));
    }
    let watcher = SchedulerWatcher::new(state.runner.backend().clone(), scheduler_job_id);
    Ok(sse(Arc::new(watcher), state.timing))
}

#[derive(Deserialize, Debug, Default)]
pub struct FileQuery {
    #[serde(default)]
    path: Option<String>,
}

async fn list_files(
    State(state): State<ServerState>,
    Path(job_id): Path<String>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Result<Json<FileListing>, ApiError> {
    let relative = validate_relative_path(query.path.as_deref().unwrap_or(""))?.to_string();
    let job = visible_job(&state, &job_id, &headers)?;
    let dir = join_remote(work_dir(&job)?, &relative);

    let entries = state
        .runner
        .backend()
        .list_dir(&dir)
        .await
        .map_err(|e| ApiError::Remote(e.to_string()))?;
    Ok(Json(FileListing {
        job_id,
        path: relative,
        entries,
    }))
}

async fn download(
    State(state): State<ServerState>,
    Path(job_id): Path<String>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Result<([(HeaderName, String); 2], Vec<u8>), ApiError> {
    let relative = validate_relative_path(query.path.as_deref().unwrap_or(""))?;
    let filename = match relative.trim_end_matches('/').rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => return Err(ApiError::BadRequest("a file path is required".into())),
    };
    let job = visible_job(&state, &job_id, &headers)?;
    let path = join_remote(work_dir(&job)?, relative);

    let bytes = state
        .runner
        .backend()
        .read_file(&path)
        .await
        .map_err(|e| ApiError::Remote(e.to_string()))?;
    debug!("sending {} ({} bytes)", path, bytes.len());
    Ok((
        [
            (CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename.replace('"', "")),
            ),
        ],
        bytes,
    ))
}

async fn submit_batch(
    State(state): State<ServerState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    if request.script.trim().is_empty() {
        return Err(ApiError::BadRequest("script must not be empty".into()));
    }
    let job_id = state
        .runner
        .backend()
        .submit_batch(&request.script, &request.resources)
        .await
        .map_err(|e| ApiError::Remote(e.to_string()))?;
    info!("submitted batch job {}", job_id);
    Ok(Json(BatchResponse {
        success: true,
        message: format!("Submitted batch job {}", job_id),
        job_id,
    }))
}

async fn list_genomes(
    State(state): State<ServerState>,
    Query(query): Query<FileQuery>,
) -> Result<Json<GenomeListing>, ApiError> {
    let relative = validate_relative_path(query.path.as_deref().unwrap_or(""))?.to_string();
    let dir = join_remote(state.remote.genome_root(), &relative);
    let entries = state
        .runner
        .backend()
        .list_dir(&dir)
        .await
        .map_err(|e| ApiError::Remote(e.to_string()))?;
    Ok(Json(GenomeListing {
        path: relative,
        genomes: genome_entries(entries),
    }))
}

#[derive(Deserialize, Debug, Default)]
pub struct UploadQuery {
    #[serde(default)]
    dir: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

async fn upload(
    State(state): State<ServerState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let relative = validate_relative_path(query.dir.as_deref().unwrap_or(""))?;
    let name = validate_file_name(query.name.as_deref().unwrap_or(""))?;
    let dir = join_remote(state.remote.upload_root(), relative);
    let stored = state
        .runner
        .backend()
        .upload(&dir, name, &body)
        .await
        .map_err(|e| ApiError::Remote(e.to_string()))?;
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            message: format!("uploaded {} bytes", stored.size),
            remote_path: stored.remote_path,
            file_size: stored.size,
        }),
    ))
}
