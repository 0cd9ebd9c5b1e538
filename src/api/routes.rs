//! REST endpoints for task control and chat history.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use super::{ApiResponse, AppState, error_response};
use crate::error::TaskError;
use crate::key::JobKey;
use crate::tasks::{TaskDescriptor, TaskParams, TaskStatus};

// ── Health ──────────────────────────────────────────────────────────────

pub(super) async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "stream-relay"
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────────

/// Public view of a task descriptor.
#[derive(Debug, Serialize)]
struct TaskView {
    key: JobKey,
    status: TaskStatus,
    error: Option<String>,
    model: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<TaskDescriptor> for TaskView {
    fn from(d: TaskDescriptor) -> Self {
        Self {
            key: d.key,
            status: d.status,
            error: d.error,
            model: d.params.model,
            created_at: d.created_at,
            updated_at: d.updated_at,
            completed_at: d.completed_at,
        }
    }
}

pub(super) fn parse_key(raw: String) -> Result<JobKey, ApiResponse> {
    JobKey::parse(raw).map_err(|e| error_response(StatusCode::BAD_REQUEST, e))
}

pub(super) async fn start_task(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(params): Json<TaskParams>,
) -> ApiResponse {
    let key = match parse_key(key) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let supervisor = &state.supervisor;
    if supervisor.is_running(&key).await {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": format!("Job {key} is already running"), "status": "running"})),
        );
    }

    let started = match params.last_user_message() {
        Some(text) => {
            supervisor
                .start_with_prompt(key.clone(), params, state.executor.clone(), &text)
                .await
        }
        None => supervisor.start(key.clone(), params, state.executor.clone()).await,
    };

    match started {
        Ok(()) => {
            info!(job_key = %key, executor = state.executor.name(), "Task started via API");
            (
                StatusCode::ACCEPTED,
                Json(json!({"key": key, "status": TaskStatus::Running})),
            )
        }
        Err(e @ TaskError::AlreadyRunning { .. }) => error_response(StatusCode::CONFLICT, e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub(super) async fn task_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResponse {
    let key = match parse_key(key) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match state.supervisor.descriptor(&key).await {
        Ok(Some(descriptor)) => (StatusCode::OK, Json(json!(TaskView::from(descriptor)))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"key": key, "status": "unknown"})),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub(super) async fn cancel_task(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResponse {
    let key = match parse_key(key) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match state.supervisor.cancel(&key).await {
        Ok(cancelled) => (
            StatusCode::OK,
            Json(json!({"key": key, "cancelled": cancelled})),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ── Chats ───────────────────────────────────────────────────────────────

pub(super) async fn chat_details(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResponse {
    let key = match parse_key(key) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let history = state.supervisor.history();
    let chat = match history.get_chat(&key).await {
        Ok(chat) => chat,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    let is_running = state.supervisor.is_running(&key).await;
    if chat.is_none() && !is_running {
        return error_response(StatusCode::NOT_FOUND, format!("Chat {key} not found"));
    }

    let messages = match history.list_messages(&key).await {
        Ok(messages) => messages,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    (
        StatusCode::OK,
        Json(json!({
            "key": key,
            "title": chat.as_ref().and_then(|c| c.title.clone()),
            "model": chat.as_ref().and_then(|c| c.model.clone()),
            "messages": messages,
            "is_running": is_running,
        })),
    )
}
