//! Agent event stream types.
//!
//! The agent process reports its progress as a stream of tagged events
//! (JSON Lines on its stdout). The variant set is closed; events the
//! daemon does not recognise deserialize to [`AgentEvent::Unknown`] and
//! are logged and ignored by the subscriber.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::HistoryEntry;

/// Characters a tool-result text may carry before truncation.
const TOOL_TEXT_LIMIT: usize = 8000;

/// One event in an agent run's stream.
///
/// Ordering within a run: `AgentStart` precedes all stream events and
/// `AgentEnd` is last. `MessageUpdate` deltas for one assistant message
/// are ordered and monotonic. Tool events for a `call_id` follow
/// start → update* → end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart,
    /// Incremental assistant text.
    MessageUpdate { delta: String },
    /// The current text segment finished.
    TextEnd,
    /// The current assistant message finished.
    MessageEnd,
    ToolStart {
        call_id: String,
        name: String,
        #[serde(default)]
        meta: String,
    },
    ToolUpdate {
        call_id: String,
        #[serde(default)]
        meta: String,
    },
    ToolEnd {
        call_id: String,
        #[serde(default)]
        result: Value,
    },
    /// The model layer started a context compaction.
    AutoCompactionStart,
    /// Compaction finished; when `will_retry` is set the run restarts
    /// transparently and all accumulated buffers are discarded.
    AutoCompactionEnd {
        #[serde(default)]
        will_retry: bool,
    },
    AgentEnd,
    /// The model stream failed mid-run.
    StreamError { message: String },
    /// Anything this daemon does not know about.
    #[serde(other)]
    Unknown,
}

/// Inputs forwarded into a live run (JSON Lines on the agent's stdin).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerInput {
    /// Preempt the model's next turn; the run continues.
    Steer { text: String },
    /// Deliver as the next user turn after the current turn completes.
    Followup { text: String },
}

/// The request handed to the agent as the first stdin line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: String,
    pub session_key: String,
    pub prompt: String,
    /// Last-N conversation window, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Truncate tool text at a char boundary and mark the cut.
fn truncate_tool_text(s: &str) -> String {
    if s.len() <= TOOL_TEXT_LIMIT {
        return s.to_string();
    }
    let cut = crate::run::chunker::floor_char_boundary(s, TOOL_TEXT_LIMIT);
    format!("{}…(truncated)…", &s[..cut])
}

/// Sanitize a tool result before it leaves the process.
///
/// Long strings are truncated; image payloads have their raw bytes
/// replaced by `{bytes, omitted: true}`. The daemon never forwards
/// base64 image data.
pub fn sanitize_tool_result(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_tool_text(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_tool_result).collect()),
        Value::Object(map) => {
            let is_image = map.get("type").and_then(Value::as_str) == Some("image");
            let sanitized = map
                .iter()
                .map(|(k, v)| {
                    if is_image && matches!(k.as_str(), "data" | "bytes" | "source") {
                        let size = match v {
                            Value::String(s) => s.len(),
                            other => other.to_string().len(),
                        };
                        (
                            k.clone(),
                            serde_json::json!({ "bytes": size, "omitted": true }),
                        )
                    } else {
                        (k.clone(), sanitize_tool_result(v))
                    }
                })
                .collect();
            Value::Object(sanitized)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_wire_names_match_stream_vocabulary() {
        let start = serde_json::to_string(&AgentEvent::AgentStart).unwrap();
        assert!(start.contains(r#""type":"agent_start""#));

        let update = serde_json::to_string(&AgentEvent::MessageUpdate {
            delta: "hi".to_string(),
        })
        .unwrap();
        assert!(update.contains(r#""type":"message_update""#));

        let compaction = serde_json::to_string(&AgentEvent::AutoCompactionEnd {
            will_retry: true,
        })
        .unwrap();
        assert!(compaction.contains(r#""type":"auto_compaction_end""#));
    }

    #[test]
    fn unknown_event_types_parse_to_unknown() {
        let evt: AgentEvent =
            serde_json::from_str(r#"{"type":"telemetry_blip","level":3}"#).unwrap();
        assert_eq!(evt, AgentEvent::Unknown);
    }

    #[test]
    fn tool_end_result_defaults_to_null() {
        let evt: AgentEvent = serde_json::from_str(r#"{"type":"tool_end","call_id":"c1"}"#).unwrap();
        assert_eq!(
            evt,
            AgentEvent::ToolEnd {
                call_id: "c1".to_string(),
                result: Value::Null,
            }
        );
    }

    #[test]
    fn sanitize_truncates_long_text() {
        let long = "x".repeat(9000);
        let out = sanitize_tool_result(&json!({ "output": long }));
        let text = out["output"].as_str().unwrap();
        assert!(text.ends_with("…(truncated)…"));
        assert!(text.len() < 9000);
    }

    #[test]
    fn sanitize_keeps_short_text() {
        let out = sanitize_tool_result(&json!({ "output": "small" }));
        assert_eq!(out["output"], "small");
    }

    #[test]
    fn sanitize_strips_image_bytes() {
        let payload = json!({
            "type": "image",
            "media_type": "image/png",
            "data": "aGVsbG8gd29ybGQ="
        });
        let out = sanitize_tool_result(&payload);
        assert_eq!(out["data"]["omitted"], true);
        assert_eq!(out["data"]["bytes"], 16);
        assert_eq!(out["media_type"], "image/png");
    }

    #[test]
    fn sanitize_descends_into_arrays() {
        let payload = json!([{ "type": "image", "data": "abcd" }, { "text": "ok" }]);
        let out = sanitize_tool_result(&payload);
        assert_eq!(out[0]["data"]["omitted"], true);
        assert_eq!(out[1]["text"], "ok");
    }

    #[test]
    fn runner_input_round_trip() {
        let input = RunnerInput::Steer {
            text: "change course".to_string(),
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains(r#""type":"steer""#));
        let parsed: RunnerInput = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, input);
    }
}
