//! OpenAI-compatible streaming chat-completion executor.

use std::collections::VecDeque;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt, stream};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::debug;

use super::{Executor, FragmentStream};
use crate::cache::{Aggregator, ChatCompletionAggregator};
use crate::error::ExecutorError;
use crate::key::JobKey;
use crate::tasks::TaskParams;

/// Connection settings for the upstream completion server.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL, with or without a trailing `/v1`.
    pub base_url: String,
    pub api_key: Option<SecretString>,
    /// Timeout for establishing the connection; the stream itself is unbounded.
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234".to_string(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Completion endpoint for a base URL.
pub fn chat_completions_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

/// Proxies a streaming chat completion, yielding each SSE `data:` payload.
pub struct UpstreamExecutor {
    client: reqwest::Client,
    url: String,
    api_key: Option<SecretString>,
}

impl UpstreamExecutor {
    pub fn new(config: UpstreamConfig) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ExecutorError::Request(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: chat_completions_url(&config.base_url),
            api_key: config.api_key,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_body(params: &TaskParams) -> Value {
        let mut body = json!({
            "model": params.model,
            "messages": params.messages,
            "stream": true,
        });
        if let Some(obj) = body.as_object_mut() {
            for (name, value) in &params.options {
                obj.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
        body
    }
}

impl Executor for UpstreamExecutor {
    fn name(&self) -> &str {
        "upstream"
    }

    fn run(&self, key: &JobKey, params: &TaskParams) -> FragmentStream {
        let mut request = self.client.post(&self.url).json(&Self::request_body(params));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }
        debug!(job_key = %key, url = %self.url, model = %params.model, "Opening upstream completion stream");

        let open = async move {
            let response = request
                .send()
                .await
                .map_err(|e| ExecutorError::Request(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ExecutorError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let bytes = response
                .bytes_stream()
                .map_err(|e| ExecutorError::Stream(e.to_string()))
                .boxed();
            Ok(sse_data_lines(bytes))
        };

        stream::once(open).try_flatten().boxed()
    }

    fn aggregator(&self) -> &dyn Aggregator {
        &ChatCompletionAggregator
    }
}

struct SseState<S> {
    bytes: S,
    buf: Vec<u8>,
    ready: VecDeque<String>,
    finished: bool,
}

/// Split a byte stream into SSE `data:` payloads, stopping at `[DONE]`.
fn sse_data_lines<S, B>(bytes: S) -> FragmentStream
where
    S: futures::Stream<Item = Result<B, ExecutorError>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = SseState {
        bytes,
        buf: Vec::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(payload) = state.ready.pop_front() {
                return Some((Ok(payload), state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buf.extend_from_slice(chunk.as_ref());
                    while let Some(pos) = state.buf.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = state.buf.drain(..=pos).collect();
                        if state.take_line(&line) {
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    // A final line without a newline.
                    let rest = std::mem::take(&mut state.buf);
                    state.take_line(&rest);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

impl<S> SseState<S> {
    /// Queue the payload of one line. Returns true once `[DONE]` is seen.
    fn take_line(&mut self, raw: &[u8]) -> bool {
        if self.finished {
            return true;
        }
        let line = String::from_utf8_lossy(raw);
        let Some(payload) = line.trim().strip_prefix("data:") else {
            return false;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            self.finished = true;
            self.buf.clear();
            return true;
        }
        if !payload.is_empty() {
            self.ready.push_back(payload.to_string());
        }
        false
    }
}
