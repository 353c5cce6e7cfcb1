//! Deterministic classification of raw tool results into [`Outcome`]s.
//!
//! Known result shapes get dedicated handling. Anything else falls back to
//! a conventional error signal check, so classification never fails.

use serde_json::Value;

use crate::core::types::{InteractiveResult, Outcome, RawResult, TaskState};

/// Default cap on rendered summaries.
pub const DEFAULT_SUMMARY_LIMIT_BYTES: usize = 8_000;

/// Classify a raw result using [`DEFAULT_SUMMARY_LIMIT_BYTES`].
pub fn classify(tool: &str, raw: &RawResult) -> Outcome {
    classify_with_limit(tool, raw, DEFAULT_SUMMARY_LIMIT_BYTES)
}

/// Classify a raw result, truncating summary and detail to `limit` bytes.
pub fn classify_with_limit(tool: &str, raw: &RawResult, limit: usize) -> Outcome {
    let outcome = match raw {
        RawResult::Interactive(result) => classify_interactive(result),
        RawResult::Json(value) => match tool {
            "run_shell" if is_shell_shape(value) => classify_shell(value),
            "write_file" if value.get("ok").is_some() => classify_write_file(value),
            "apply_patch" if value.get("ok").is_some() => classify_patch(value),
            _ => classify_fallback(value),
        },
    };
    truncate_outcome(outcome, limit)
}

fn is_shell_shape(value: &Value) -> bool {
    value.get("ok").is_some() && value.get("return_code").is_some()
}

fn classify_shell(value: &Value) -> Outcome {
    let command = str_field(value, "command_executed");
    let stdout = section("Stdout", str_field(value, "stdout"));
    if bool_field(value, "ok") {
        return Outcome::Success {
            summary: format!("Command '{command}' executed successfully.{stdout}"),
        };
    }
    let code = value
        .get("return_code")
        .map_or_else(|| "unknown".to_string(), Value::to_string);
    let stderr = section("Stderr", str_field(value, "stderr"));
    Outcome::Failure {
        summary: format!("Command '{command}' failed with return code {code}."),
        detail: format!("{stderr}{stdout}").trim_start().to_string(),
    }
}

fn classify_write_file(value: &Value) -> Outcome {
    let message = str_field(value, "message").to_string();
    if bool_field(value, "ok") {
        Outcome::Success { summary: message }
    } else {
        Outcome::Failure {
            detail: message.clone(),
            summary: message,
        }
    }
}

fn classify_patch(value: &Value) -> Outcome {
    let message = str_field(value, "message").to_string();
    if bool_field(value, "ok") {
        return Outcome::Success { summary: message };
    }
    let stderr = value
        .get("details")
        .and_then(|d| d.get("stderr"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    let detail = if stderr.is_empty() {
        message.clone()
    } else {
        format!("{message}\nError details:\n{stderr}")
    };
    Outcome::Failure {
        summary: message,
        detail,
    }
}

fn classify_interactive(result: &InteractiveResult) -> Outcome {
    if result.state == TaskState::Success {
        return Outcome::Success {
            summary: format!(
                "Task '{}' completed successfully in {}ms.",
                result.label, result.duration_ms
            ),
        };
    }
    let code = result
        .exit_code
        .map_or_else(|| "none".to_string(), |c| c.to_string());
    Outcome::Failure {
        summary: format!(
            "Task '{}' finished with state {} (exit code {code}).",
            result.label, result.state
        ),
        detail: result.output_tail.clone(),
    }
}

fn classify_fallback(value: &Value) -> Outcome {
    let rendered = render(value);
    if let Some(error) = error_signal(value) {
        return Outcome::Failure {
            summary: error,
            detail: rendered,
        };
    }
    Outcome::Success { summary: rendered }
}

/// Returns a summary when the value carries a conventional error signal.
fn error_signal(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    if let Some(err) = obj.get("error").filter(|e| !e.is_null()) {
        return Some(match err {
            Value::String(s) => s.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| other.to_string(), str::to_string),
        });
    }
    for key in ["ok", "success"] {
        if obj.get(key).and_then(Value::as_bool) == Some(false) {
            let message = obj
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| format!("{key} is false"), str::to_string);
            return Some(message);
        }
    }
    None
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn bool_field(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn section(title: &str, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        String::new()
    } else {
        format!("\n{title}:\n{body}")
    }
}

fn truncate_outcome(outcome: Outcome, limit: usize) -> Outcome {
    match outcome {
        Outcome::Success { summary } => Outcome::Success {
            summary: truncate(summary, limit),
        },
        Outcome::Failure { summary, detail } => Outcome::Failure {
            summary: truncate(summary, limit),
            detail: truncate(detail, limit),
        },
        other @ Outcome::InfrastructureError { .. } => other,
    }
}

/// Truncate to at most `limit` bytes on a char boundary, noting what was cut.
pub fn truncate(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let dropped = text.len() - cut;
    text.truncate(cut);
    text.push_str(&format!("\n[truncated {dropped} bytes]"));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskId;
    use serde_json::json;

    #[test]
    fn shell_success_includes_stdout() {
        let raw = RawResult::Json(json!({
            "ok": true,
            "return_code": 0,
            "stdout": "hello\n",
            "stderr": "",
            "command_executed": "echo hello",
        }));
        assert_eq!(
            classify("run_shell", &raw),
            Outcome::Success {
                summary: "Command 'echo hello' executed successfully.\nStdout:\nhello".to_string()
            }
        );
    }

    #[test]
    fn shell_failure_carries_stderr_then_stdout() {
        let raw = RawResult::Json(json!({
            "ok": false,
            "return_code": 2,
            "stdout": "partial",
            "stderr": "boom",
            "command_executed": "make",
        }));
        let Outcome::Failure { summary, detail } = classify("run_shell", &raw) else {
            panic!("expected failure");
        };
        assert_eq!(summary, "Command 'make' failed with return code 2.");
        assert_eq!(detail, "Stderr:\nboom\nStdout:\npartial");
    }

    #[test]
    fn patch_failure_appends_stderr_details() {
        let raw = RawResult::Json(json!({
            "ok": false,
            "message": "patch rejected",
            "details": {"stderr": "hunk 1 failed\n"},
        }));
        let Outcome::Failure { detail, .. } = classify("apply_patch", &raw) else {
            panic!("expected failure");
        };
        assert_eq!(detail, "patch rejected\nError details:\nhunk 1 failed");
    }

    #[test]
    fn write_file_uses_message() {
        let raw = RawResult::Json(json!({"ok": true, "message": "wrote 3 bytes"}));
        assert_eq!(classify("write_file", &raw).summary(), "wrote 3 bytes");
    }

    #[test]
    fn fallback_error_key_is_failure() {
        let raw = RawResult::Json(json!({"error": {"message": "no such symbol"}}));
        let outcome = classify("lsp_definition", &raw);
        assert!(!outcome.is_success());
        assert_eq!(outcome.summary(), "no such symbol");
    }

    #[test]
    fn fallback_null_error_key_is_success() {
        let raw = RawResult::Json(json!({"error": null, "items": []}));
        assert!(classify("search", &raw).is_success());
    }

    #[test]
    fn fallback_success_false_is_failure() {
        let raw = RawResult::Json(json!({"success": false}));
        assert_eq!(classify("unknown", &raw).summary(), "success is false");
    }

    #[test]
    fn fallback_plain_values_are_success() {
        for value in [json!("text"), json!(3), json!([1, 2]), Value::Null] {
            assert!(classify("anything", &RawResult::Json(value)).is_success());
        }
    }

    #[test]
    fn shell_tool_with_unknown_shape_falls_back() {
        let raw = RawResult::Json(json!({"ok": false}));
        assert!(!classify("run_shell", &raw).is_success());
    }

    #[test]
    fn interactive_timeout_is_failure_with_tail() {
        let raw = RawResult::Interactive(InteractiveResult {
            task_id: TaskId::new(),
            label: "dev server".to_string(),
            state: TaskState::Timeout,
            exit_code: None,
            duration_ms: 1000,
            output_tail: "listening".to_string(),
        });
        assert_eq!(
            classify("run_interactive", &raw),
            Outcome::Failure {
                summary: "Task 'dev server' finished with state timeout (exit code none)."
                    .to_string(),
                detail: "listening".to_string(),
            }
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "ééé".to_string();
        let out = truncate(text, 3);
        assert!(out.starts_with('é'));
        assert!(out.ends_with("[truncated 4 bytes]"));
    }
}
