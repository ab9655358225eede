//! Event classification for completed frames.
//!
//! Payloads intermix generated text (which may itself start with `{`) with
//! control objects. A payload that looks structured is parsed optimistically;
//! if parsing fails the original payload is kept as text.

use serde_json::Value;

use crate::constants::{DATA_MARKER, DONE_SENTINEL, LOG_SNIPPET_CHARS};
use crate::str_utils::snippet;
use crate::types::StreamEvent;

/// Classifies every marker line of `frame`, in order. Nothing after a
/// `Termination` is returned.
pub fn classify_frame(frame: &str) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for line in frame.split('\n') {
        let Some(payload) = extract_payload(line) else {
            continue;
        };
        let event = classify_payload(payload);
        let done = event == StreamEvent::Termination;
        events.push(event);
        if done {
            break;
        }
    }
    events
}

/// Everything after `data:`, minus exactly one separating space if present.
pub fn extract_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(DATA_MARKER)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

pub fn classify_payload(payload: &str) -> StreamEvent {
    if payload.trim() == DONE_SENTINEL {
        return StreamEvent::Termination;
    }

    if !looks_structured(payload) {
        return StreamEvent::TextDelta(payload.to_string());
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(value) => match error_text(&value) {
            Some(message) => StreamEvent::ErrorEvent(message),
            None => {
                tracing::trace!(
                    "[CLASSIFY] Control payload: {}",
                    snippet(payload, LOG_SNIPPET_CHARS)
                );
                StreamEvent::StatusPing
            }
        },
        Err(e) => {
            tracing::debug!(
                "[CLASSIFY] Structured-looking payload is not JSON ({}), keeping as text: {}",
                e,
                snippet(payload, LOG_SNIPPET_CHARS)
            );
            StreamEvent::TextDelta(payload.to_string())
        }
    }
}

fn looks_structured(payload: &str) -> bool {
    matches!(payload.trim_start().chars().next(), Some('{') | Some('['))
}

fn error_text(value: &Value) -> Option<String> {
    match value.get("error")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => match obj.get("message").and_then(|m| m.as_str()) {
            Some(message) => Some(message.to_string()),
            None => Some(Value::Object(obj.clone()).to_string()),
        },
        other => Some(other.to_string()),
    }
}
