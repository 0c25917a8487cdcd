#![forbid(unsafe_code)]

pub mod command;
pub mod scripted;

pub use command::CommandDispatcher;
pub use scripted::{ScriptedCall, ScriptedDispatcher, ScriptedStep};

use gate_core::{RawWorkerOutput, SessionHandle};
use serde_json::Value;

/// Headless agents wrap the schema-validated report under `structured_output`;
/// hand the engine the report itself.
pub(crate) fn unwrap_structured_output(value: Value) -> RawWorkerOutput {
    match value {
        Value::Object(mut obj) if obj.contains_key("structured_output") => {
            RawWorkerOutput::new(obj.remove("structured_output").unwrap_or(Value::Null))
        }
        other => RawWorkerOutput::new(other),
    }
}

pub(crate) fn extract_session(value: &Value, issued_at_ms: i64) -> Option<SessionHandle> {
    ["session_id", "sessionId"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| SessionHandle::new(id, issued_at_ms))
}
