use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use uuid::Uuid;

use crate::AppState;
use crate::api::sse::build_sse_response;
use crate::domain::{CancelAction, Metadata, Run, RunCreate, RunUser, Thread};
use crate::error::EngineError;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/threads", post(create_thread))
        .route("/threads/{thread_id}", get(get_thread).delete(delete_thread))
        .route("/threads/{thread_id}/runs", post(create_run).get(list_runs))
        .route("/threads/{thread_id}/runs/stream", post(create_and_stream_run))
        .route("/threads/{thread_id}/runs/{run_id}", get(get_run))
        .route("/threads/{thread_id}/runs/{run_id}/cancel", post(cancel_run))
        .route("/threads/{thread_id}/runs/{run_id}/join", get(join_run))
        .route("/threads/{thread_id}/runs/{run_id}/stream", get(stream_run))
        .route("/runs", post(create_stateless_run))
        .route("/runs/stream", post(create_and_stream_stateless_run))
}

/// Identity of the caller, taken from the `x-user-id` and
/// `x-user-permissions` (comma separated) headers.
#[derive(Debug, Clone, Default)]
pub struct Caller(pub Option<RunUser>);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        let Some(identity) = header("x-user-id") else {
            return Ok(Self(None));
        };
        let permissions = header("x-user-permissions")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self(Some(RunUser {
            identity: identity.to_string(),
            permissions,
        })))
    }
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn run_location(run: &Run) -> String {
    format!("/threads/{}/runs/{}", run.thread_id, run.run_id)
}

async fn health(State(state): State<AppState>) -> Result<Json<Value>, EngineError> {
    let stats = state.engine.stats().await?;
    Ok(Json(json!({ "ok": true, "queue": stats })))
}

#[derive(Debug, Default, Deserialize)]
struct CreateThreadRequest {
    #[serde(default)]
    thread_id: Option<Uuid>,
    #[serde(default)]
    metadata: Metadata,
}

/// The body is optional; an empty request creates a thread with a fresh id.
async fn create_thread(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Thread>, EngineError> {
    let req: CreateThreadRequest = if body.is_empty() {
        CreateThreadRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| EngineError::Validation(format!("invalid thread request: {err}")))?
    };
    Ok(Json(
        state
            .engine
            .create_thread(req.thread_id, req.metadata)
            .await?,
    ))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> Result<Json<Thread>, EngineError> {
    Ok(Json(state.engine.get_thread(thread_id).await?))
}

async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> Result<StatusCode, EngineError> {
    state.engine.delete_thread(thread_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit(
    state: &AppState,
    thread_id: Option<Uuid>,
    Caller(user): Caller,
    mut request: RunCreate,
) -> Result<Run, EngineError> {
    if thread_id.is_some() {
        request.thread_id = thread_id;
    }
    request.user = user;
    state.engine.submit(request).await
}

async fn create_run(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    caller: Caller,
    Json(request): Json<RunCreate>,
) -> Result<Json<Run>, EngineError> {
    Ok(Json(submit(&state, Some(thread_id), caller, request).await?))
}

async fn create_stateless_run(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<RunCreate>,
) -> Result<Json<Run>, EngineError> {
    Ok(Json(submit(&state, None, caller, request).await?))
}

async fn create_and_stream_run(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    caller: Caller,
    Json(request): Json<RunCreate>,
) -> Result<Response, EngineError> {
    let run = submit(&state, Some(thread_id), caller, request).await?;
    Ok(stream_response(&state, &run))
}

async fn create_and_stream_stateless_run(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<RunCreate>,
) -> Result<Response, EngineError> {
    let run = submit(&state, None, caller, request).await?;
    Ok(stream_response(&state, &run))
}

fn stream_response(state: &AppState, run: &Run) -> Response {
    let sse = build_sse_response(state.engine.stream(run.run_id, None));
    ([(header::CONTENT_LOCATION, run_location(run))], sse).into_response()
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    10
}

async fn list_runs(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<Run>>, EngineError> {
    Ok(Json(
        state
            .engine
            .list_runs(thread_id, query.limit, query.offset)
            .await?,
    ))
}

async fn get_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Run>, EngineError> {
    Ok(Json(state.engine.get_run(thread_id, run_id).await?))
}

#[derive(Debug, Deserialize)]
struct CancelQuery {
    #[serde(default)]
    action: CancelAction,
    #[serde(default)]
    wait: bool,
}

async fn cancel_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<CancelQuery>,
) -> Result<StatusCode, EngineError> {
    state.engine.get_run(thread_id, run_id).await?;
    state
        .engine
        .cancel(Some(thread_id), &[run_id], query.action)
        .await?;
    if query.wait {
        state.engine.join(thread_id, run_id).await?;
        return Ok(StatusCode::NO_CONTENT);
    }
    Ok(StatusCode::ACCEPTED)
}

async fn join_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, EngineError> {
    Ok(Json(state.engine.join(thread_id, run_id).await?))
}

async fn stream_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    state.engine.get_run(thread_id, run_id).await?;
    let messages = state.engine.stream(run_id, last_event_id(&headers));
    Ok(build_sse_response(messages).into_response())
}
