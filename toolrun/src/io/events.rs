//! Lifecycle events for interactive tasks and the sinks that relay them.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::types::{TaskId, TaskState};

/// Event emitted by the interactive process manager.
///
/// Per task: exactly one `Started`, any number of `Log`, exactly one `Finished`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        task_id: TaskId,
        label: String,
        started_at: DateTime<Utc>,
    },
    Log {
        task_id: TaskId,
        chunk: String,
    },
    Finished {
        task_id: TaskId,
        state: TaskState,
        exit_code: Option<i32>,
        duration_ms: u64,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Started { task_id, .. }
            | Self::Log { task_id, .. }
            | Self::Finished { task_id, .. } => *task_id,
        }
    }
}

/// Receives every event the manager emits. Delivery is best effort.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TaskEvent);
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &TaskEvent) {}
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: &TaskEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            debug!(%err, "event sink write failed");
        }
    }
}

/// Fans events out to broadcast subscribers.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<TaskEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &TaskEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lines_sink_writes_tagged_lines() {
        let sink = JsonLinesSink::new(Vec::new());
        let task_id = TaskId::new();
        sink.emit(&TaskEvent::Log {
            task_id,
            chunk: "hi".to_string(),
        });
        sink.emit(&TaskEvent::Finished {
            task_id,
            state: TaskState::Success,
            exit_code: Some(0),
            duration_ms: 5,
        });
        let text = String::from_utf8(sink.into_inner()).expect("utf8");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "log");
        assert_eq!(lines[1]["state"], "success");
        assert_eq!(lines[1]["task_id"], task_id.to_string());
    }

    #[test]
    fn channel_sink_without_receivers_does_not_panic() {
        let sink = ChannelSink::new(4);
        sink.emit(&TaskEvent::Log {
            task_id: TaskId::new(),
            chunk: String::new(),
        });
        let mut rx = sink.subscribe();
        sink.emit(&TaskEvent::Log {
            task_id: TaskId::new(),
            chunk: "x".to_string(),
        });
        assert!(matches!(rx.try_recv(), Ok(TaskEvent::Log { .. })));
    }
}
