//! Shared data types for the execution core.
//!
//! These types cross module boundaries (planner -> executor -> classifier ->
//! tracker) and are serialized into CLI output, so their serde shapes are
//! part of the contract.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One planned tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Optional planner-assigned id, echoed back in reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: Value,
    /// Project subdirectory the operation is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

fn empty_args() -> Value {
    Value::Object(serde_json::Map::new())
}

impl OperationRequest {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            id: None,
            tool: tool.into(),
            args,
            context: None,
        }
    }

    pub fn with_context(mut self, subdir: impl Into<String>) -> Self {
        self.context = Some(subdir.into());
        self
    }

    /// The identity used to track retries of this operation.
    pub fn fix_identity(&self) -> FixIdentity {
        FixIdentity::from_request(&self.tool, &self.args)
    }
}

/// Category of an infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraKind {
    /// A subprocess could not be started.
    Spawn,
    /// A language-server exchange failed or timed out.
    Protocol,
    /// The tool returned an error instead of a result.
    Tool,
    /// The tool panicked.
    Panic,
}

/// Normalized result of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        summary: String,
    },
    Failure {
        summary: String,
        detail: String,
    },
    InfrastructureError {
        kind: InfraKind,
        detail: String,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Short text suitable for a planner-facing history line.
    pub fn summary(&self) -> &str {
        match self {
            Self::Success { summary } | Self::Failure { summary, .. } => summary,
            Self::InfrastructureError { detail, .. } => detail,
        }
    }

    /// Detail to append to the history after a failed step.
    pub fn failure_detail(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { detail, .. } | Self::InfrastructureError { detail, .. } => {
                Some(detail)
            }
        }
    }
}

/// Unique id of an interactive task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of an interactive task.
///
/// `Success`, `Error` and `Timeout` are terminal and never change once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Timeout)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of an interactive task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractiveResult {
    pub task_id: TaskId,
    pub label: String,
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Last bytes of output, for failure detail.
    pub output_tail: String,
}

/// Raw tool output before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Json(Value),
    Interactive(InteractiveResult),
}

/// Argument keys that name what an operation acts on, in priority order.
const TARGET_KEYS: &[&str] = &[
    "path",
    "file_path",
    "file_path_in_repo",
    "target",
    "file",
    "command",
];

/// Key for fix-cycle tracking: the tool plus the thing it acts on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FixIdentity {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl FixIdentity {
    pub fn from_request(tool: &str, args: &Value) -> Self {
        let target = TARGET_KEYS
            .iter()
            .find_map(|key| args.get(*key).and_then(target_text));
        Self {
            tool: tool.to_string(),
            target,
        }
    }
}

fn target_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(" "))
            }
        }
        other => Some(other.to_string()),
    }
}

impl fmt::Display for FixIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{}({target})", self.tool),
            None => f.write_str(&self.tool),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fix_identity_prefers_path_over_command() {
        let id = FixIdentity::from_request("edit", &json!({"command": "x", "path": "src/a.rs"}));
        assert_eq!(id.target.as_deref(), Some("src/a.rs"));
    }

    #[test]
    fn fix_identity_joins_argv_commands() {
        let id = FixIdentity::from_request("run_shell", &json!({"command": ["cargo", "test"]}));
        assert_eq!(id.to_string(), "run_shell(cargo test)");
    }

    #[test]
    fn fix_identity_without_target_is_tool_only() {
        let id = FixIdentity::from_request("list", &json!({"path": ""}));
        assert_eq!(id.target, None);
        assert_eq!(id.to_string(), "list");
    }

    #[test]
    fn operation_request_defaults_args() {
        let req: OperationRequest = serde_json::from_str(r#"{"tool":"noop"}"#).expect("parse");
        assert_eq!(req.args, json!({}));
        assert_eq!(req.context, None);
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Error.is_terminal());
        assert!(TaskState::Timeout.is_terminal());
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let outcome = Outcome::InfrastructureError {
            kind: InfraKind::Spawn,
            detail: "missing".to_string(),
        };
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(
            value,
            json!({"outcome": "infrastructure_error", "kind": "spawn", "detail": "missing"})
        );
    }
}
