//! Typed failures that callers branch on.
//!
//! Orchestration code returns `anyhow::Result`; these types travel inside it
//! and are recovered with `downcast_ref` where the distinction matters.

use std::time::Duration;

use thiserror::Error;

/// A subprocess could not be started.
#[derive(Debug, Error)]
pub enum ProcessSpawnError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("executable not found: {program}")]
    NotFound { program: String },

    #[error("failed to spawn {program}: {reason}")]
    Failed { program: String, reason: String },
}

/// A JSON-RPC exchange with a language server failed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("request {method} timed out after {}ms", timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("session closed")]
    SessionClosed,

    #[error("malformed message: {0}")]
    Malformed(String),

    /// The byte stream can no longer be split into messages.
    #[error("lost message framing: {0}")]
    Framing(String),

    #[error("transport: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Spawn(#[from] ProcessSpawnError),
}

/// The executor was asked for something it cannot route.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },
}

/// Interactive task lookups.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("unknown interactive task: {task_id}")]
    UnknownTask { task_id: String },
}
