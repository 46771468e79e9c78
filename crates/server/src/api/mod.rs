use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use directory::{
    delete_thread, find_or_create_thread, list_threads_for_user, mark_thread_read,
    register_user, submit_support_message, thread_history, unread_counts,
};
use serde::Deserialize;
use shared::{
    domain::{ParticipantRole, ThreadId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        MarkReadResponse, MessagePayload, OpenThreadRequest, OpenThreadResponse,
        RegisterUserRequest, RegisterUserResponse, SupportMessageRequest, SupportReceipt,
        ThreadSummary, UnreadCounts,
    },
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::error;

use crate::{gateway::ws_handler, AppState};

pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ThreadListQuery {
    pub user_id: i64,
    pub role: Option<ParticipantRole>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/users", post(http_register_user))
        .route("/threads", post(http_open_thread).get(http_list_threads))
        .route("/threads/unread", get(http_unread_counts))
        .route("/threads/:thread_id/messages", get(http_thread_history))
        .route("/threads/:thread_id/read", post(http_mark_read))
        .route("/threads/:thread_id", delete(http_delete_thread))
        .route("/support", post(http_support_message))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Transport | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

fn parse_thread_id(raw: &str) -> Result<ThreadId, HttpError> {
    raw.parse::<ThreadId>()
        .map_err(|err| http_error(ApiError::validation(err.to_string())))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state
        .directory
        .storage
        .health_check()
        .await
        .map_err(|e| {
            error!(error = %e, "health check failed");
            http_error(ApiError::internal(e.to_string()))
        })?;
    Ok("ok")
}

async fn http_register_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterUserRequest>,
) -> Result<Json<RegisterUserResponse>, HttpError> {
    let user_id = register_user(&state.directory, &req.display_name)
        .await
        .map_err(http_error)?;
    Ok(Json(RegisterUserResponse { user_id }))
}

async fn http_open_thread(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenThreadRequest>,
) -> Result<Json<OpenThreadResponse>, HttpError> {
    let thread_id = find_or_create_thread(&state.directory, req.listing_id, req.renter_id, req.owner_id)
        .await
        .map_err(http_error)?;
    Ok(Json(OpenThreadResponse { thread_id }))
}

async fn http_list_threads(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ThreadListQuery>,
) -> Result<Json<Vec<ThreadSummary>>, HttpError> {
    let threads = list_threads_for_user(&state.directory, UserId(q.user_id), q.role)
        .await
        .map_err(http_error)?;
    Ok(Json(threads))
}

async fn http_unread_counts(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<UnreadCounts>, HttpError> {
    let counts = unread_counts(&state.directory, UserId(q.user_id))
        .await
        .map_err(http_error)?;
    Ok(Json(counts))
}

async fn http_thread_history(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<MessagePayload>>, HttpError> {
    let thread_id = parse_thread_id(&thread_id)?;
    let messages = thread_history(&state.directory, thread_id, UserId(q.user_id))
        .await
        .map_err(http_error)?;
    Ok(Json(messages))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(q): Query<UserQuery>,
) -> Result<Json<MarkReadResponse>, HttpError> {
    let thread_id = parse_thread_id(&thread_id)?;
    let updated = mark_thread_read(&state.directory, thread_id, UserId(q.user_id))
        .await
        .map_err(http_error)?;
    Ok(Json(MarkReadResponse { updated }))
}

async fn http_delete_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, HttpError> {
    let thread_id = parse_thread_id(&thread_id)?;
    delete_thread(&state.directory, thread_id, UserId(q.user_id))
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_support_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SupportMessageRequest>,
) -> Result<Json<SupportReceipt>, HttpError> {
    let receipt = submit_support_message(&state.directory, req.contact, &req.body)
        .await
        .map_err(http_error)?;
    Ok(Json(receipt))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
