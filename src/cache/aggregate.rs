//! Aggregation of a job's fragments into its final artifact.

use serde_json::Value;

use super::fragment::{FinalArtifact, Fragment};

/// Turns a finished fragment history into the artifact handed to history storage.
///
/// Implementations only see content; `Done` and `Error` fragments carry no
/// content and are never part of an artifact.
pub trait Aggregator: Send + Sync {
    fn aggregate(&self, fragments: &[Fragment]) -> FinalArtifact;
}

/// Concatenates chunk payloads verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatAggregator;

impl Aggregator for ConcatAggregator {
    fn aggregate(&self, fragments: &[Fragment]) -> FinalArtifact {
        let mut artifact = FinalArtifact::default();
        for data in fragments.iter().filter_map(Fragment::content) {
            artifact.content.push_str(data);
            artifact.chunk_count += 1;
        }
        artifact
    }
}

/// Aggregates OpenAI-style `chat.completion.chunk` payloads.
///
/// Content deltas are concatenated. Reasoning deltas are collected separately
/// (research activity events first, model reasoning after) and appended in a
/// `<think>` block. A payload with `__reset_accumulator__` discards everything
/// collected so far; executors emit it when they regenerate an answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatCompletionAggregator;

impl Aggregator for ChatCompletionAggregator {
    fn aggregate(&self, fragments: &[Fragment]) -> FinalArtifact {
        let mut content = String::new();
        let mut activity = String::new();
        let mut reasoning = String::new();
        let mut chunk_count = 0;

        for data in fragments.iter().filter_map(Fragment::content) {
            let payload = data.trim();
            let payload = payload.strip_prefix("data:").unwrap_or(payload).trim();
            if payload.is_empty() || payload == "[DONE]" {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(payload) else {
                continue;
            };

            if matches!(value.get("__reset_accumulator__"), Some(Value::Bool(true))) {
                content.clear();
                activity.clear();
                reasoning.clear();
                chunk_count = 0;
                continue;
            }

            let Some(delta) = value.pointer("/choices/0/delta") else {
                continue;
            };

            let mut contributed = false;
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                content.push_str(text);
                contributed = true;
            }

            let thought = delta
                .get("reasoning_content")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .or_else(|| delta.get("reasoning").and_then(Value::as_str));
            if let Some(thought) = thought.filter(|s| !s.is_empty()) {
                if is_activity_event(thought) {
                    activity.push_str(thought);
                } else {
                    reasoning.push_str(thought);
                }
                contributed = true;
            }

            if contributed {
                chunk_count += 1;
            }
        }

        let mut full_reasoning = activity;
        if !reasoning.is_empty() {
            full_reasoning.push('\n');
            full_reasoning.push_str(&reasoning);
        }

        if !full_reasoning.trim().is_empty() {
            content = format!("{content}\n<think>\n{full_reasoning}\n</think>");
        }

        FinalArtifact {
            content,
            chunk_count,
        }
    }
}

fn is_activity_event(reasoning: &str) -> bool {
    serde_json::from_str::<Value>(reasoning)
        .ok()
        .and_then(|v| v.get("__deep_research_activity__").cloned())
        .is_some_and(|flag| flag.as_bool().unwrap_or(!flag.is_null()))
}
