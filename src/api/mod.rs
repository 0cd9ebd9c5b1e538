//! HTTP and WebSocket surface: control routes, stream readers, chat history.

mod routes;
mod stream;

use std::sync::Arc;

use axum::{Json, Router, http::StatusCode, routing::{get, post}};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

use crate::executor::Executor;
use crate::tasks::TaskSupervisor;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<TaskSupervisor>,
    /// Executor used for jobs started over HTTP.
    pub executor: Arc<dyn Executor>,
}

/// Build the router with every route mounted.
pub fn router(supervisor: Arc<TaskSupervisor>, executor: Arc<dyn Executor>) -> Router {
    let state = AppState {
        supervisor,
        executor,
    };

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/tasks/{key}", post(routes::start_task).get(routes::task_status))
        .route("/api/tasks/{key}/cancel", post(routes::cancel_task))
        .route("/api/tasks/{key}/stream", get(stream::sse_handler))
        .route("/ws/tasks/{key}", get(stream::ws_handler))
        .route("/api/chats/{key}", get(routes::chat_details))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiResponse = (StatusCode, Json<Value>);

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> ApiResponse {
    (status, Json(json!({"error": message.to_string()})))
}
