//! Stream readers: Server-Sent Events and WebSocket.
//!
//! Both attach to the job's subscription before answering, so an unknown job
//! is a plain 404 rather than an empty stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, info, warn};

use super::routes::parse_key;
use super::{AppState, error_response};
use crate::cache::{Fragment, Subscription};
use crate::error::CacheError;
use crate::key::JobKey;

/// SSE terminator understood by chat-completion clients.
const SSE_DONE: &str = "[DONE]";

async fn attach(state: &AppState, raw: String) -> Result<(JobKey, Subscription), Response> {
    let key = parse_key(raw).map_err(IntoResponse::into_response)?;
    match state.supervisor.cache().subscribe(&key).await {
        Ok(subscription) => Ok((key, subscription)),
        Err(e @ CacheError::UnknownJob { .. }) => {
            Err(error_response(StatusCode::NOT_FOUND, e).into_response())
        }
        Err(e) => Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, e).into_response()),
    }
}

// ── Server-Sent Events ──────────────────────────────────────────────────

pub(super) async fn sse_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    let (key, subscription) = match attach(&state, key).await {
        Ok(attached) => attached,
        Err(response) => return response,
    };
    debug!(job_key = %key, "SSE reader attached");

    let events = subscription
        .into_stream()
        .map(|fragment| Ok::<_, Infallible>(sse_event(&fragment)));

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

fn sse_event(fragment: &Fragment) -> Event {
    match fragment {
        // SSE fields cannot carry carriage returns.
        Fragment::Chunk { data, .. } => Event::default().data(data.replace('\r', "")),
        Fragment::Error { message, .. } => {
            Event::default().data(json!({"error": message}).to_string())
        }
        Fragment::Done => Event::default().data(SSE_DONE),
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    let (key, subscription) = match attach(&state, key).await {
        Ok(attached) => attached,
        Err(response) => return response,
    };
    info!(job_key = %key, "WebSocket reader connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, key, subscription))
}

async fn handle_socket(mut socket: WebSocket, key: JobKey, mut subscription: Subscription) {
    loop {
        tokio::select! {
            fragment = subscription.next() => {
                let Some(fragment) = fragment else { break };
                let done = fragment.is_done();
                match serde_json::to_string(&fragment) {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!(job_key = %key, "Reader disconnected during send");
                            return;
                        }
                    }
                    Err(e) => warn!(job_key = %key, error = %e, "Could not encode fragment"),
                }
                if done {
                    break;
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(job_key = %key, "WebSocket reader disconnected");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(job_key = %key, error = %e, "WebSocket error");
                        return;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    info!(job_key = %key, "WebSocket stream finished");
}

