//! Test doubles: scripted planner, canned tools, an in-process language
//! server, and temporary workspaces.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::ProtocolError;
use crate::executor::TaskExecutor;
use crate::io::config::ExecutorConfig;
use crate::io::events::NullSink;
use crate::io::lock;
use crate::io::lsp::{SessionLauncher, SessionManager, SessionTransport};
use crate::io::lsp_codec::{self, read_message, write_message};
use crate::io::pty::{InteractiveManager, SpawnRequest};
use crate::io::tools::{Tool, ToolContext, ToolOutput, ToolRegistry};
use crate::planner::{Planner, PlannerDecision, RunHistory};

/// Planner that replays fixed decisions, then finishes.
pub struct ScriptedPlanner {
    decisions: VecDeque<PlannerDecision>,
    seen: Vec<String>,
}

impl ScriptedPlanner {
    pub fn new(decisions: Vec<PlannerDecision>) -> Self {
        Self {
            decisions: decisions.into(),
            seen: Vec::new(),
        }
    }

    /// Rendered history passed to each `next` call.
    pub fn seen(&self) -> &[String] {
        &self.seen
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn next(&mut self, history: &RunHistory) -> Result<PlannerDecision> {
        self.seen.push(history.render());
        Ok(self
            .decisions
            .pop_front()
            .unwrap_or_else(|| PlannerDecision::Finish {
                summary: "script exhausted".to_string(),
            }))
    }
}

/// One canned tool response.
#[derive(Debug, Clone)]
pub enum StaticResponse {
    Value(Value),
    Error(String),
    Panic(String),
    Interactive(SpawnRequest),
}

/// Tool returning canned responses in order; the last one repeats.
pub struct StaticTool {
    name: String,
    mutates: bool,
    responses: Mutex<VecDeque<StaticResponse>>,
    calls: Mutex<Vec<Value>>,
}

impl StaticTool {
    pub fn new(name: &str, responses: Vec<StaticResponse>) -> Self {
        Self {
            name: name.to_string(),
            mutates: false,
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn mutating(mut self) -> Self {
        self.mutates = true;
        self
    }

    /// Arguments of every call so far.
    pub fn calls(&self) -> Vec<Value> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutates_workspace(&self) -> bool {
        self.mutates
    }

    async fn invoke(&self, _ctx: &ToolContext, args: &Value) -> Result<ToolOutput> {
        lock(&self.calls).push(args.clone());
        let response = {
            let mut responses = lock(&self.responses);
            if responses.len() > 1 {
                responses.pop_front()
            } else {
                responses.front().cloned()
            }
        };
        match response.ok_or_else(|| anyhow!("no scripted response for {}", self.name))? {
            StaticResponse::Value(value) => Ok(ToolOutput::Result(value)),
            StaticResponse::Error(message) => Err(anyhow!(message)),
            StaticResponse::Panic(message) => panic!("{message}"),
            StaticResponse::Interactive(request) => Ok(ToolOutput::Interactive(request)),
        }
    }
}

/// Minimal language server speaking over an in-memory pipe.
///
/// Besides the handshake it understands `test/echo` (optional `delay_ms`),
/// `test/silent` (never answers) and `test/publish` (pushes the given
/// diagnostics), and publishes diagnostics on document sync and file changes.
pub struct FakeLanguageServer;

impl FakeLanguageServer {
    /// Start a server task and return the client end.
    pub fn start() -> SessionTransport {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        tokio::spawn(serve(server_read, server_write));
        SessionTransport {
            reader: Box::new(client_read),
            writer: Box::new(client_write),
            stderr: None,
            child: None,
            kill_target: None,
        }
    }
}

type ServerWriter = Arc<AsyncMutex<WriteHalf<DuplexStream>>>;

async fn serve(reader: ReadHalf<DuplexStream>, writer: WriteHalf<DuplexStream>) {
    let writer: ServerWriter = Arc::new(AsyncMutex::new(writer));
    let mut reader = BufReader::new(reader);
    while let Ok(Some(message)) = read_message(&mut reader).await {
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let id = message.get("id").cloned();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match method.as_str() {
            "initialize" => {
                reply(&writer, id, json!({
                    "capabilities": {"hoverProvider": true, "definitionProvider": true},
                    "serverInfo": {"name": "fake"},
                }))
                .await;
            }
            "test/echo" => {
                let delay = params.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    reply(&writer, id, params).await;
                });
            }
            "test/silent" | "initialized" | "exit" => {}
            "test/publish" => {
                publish(&writer, params.clone()).await;
                reply(&writer, id, Value::Null).await;
            }
            "textDocument/didOpen" | "textDocument/didChange" => {
                let doc = &params["textDocument"];
                let version = doc["version"].as_i64().unwrap_or(0);
                let verb = if method.ends_with("didOpen") { "opened" } else { "changed" };
                publish(&writer, json!({
                    "uri": doc["uri"],
                    "diagnostics": [{"message": format!("{verb} v{version}"), "severity": 1}],
                }))
                .await;
            }
            "workspace/didChangeWatchedFiles" => {
                let changes = params["changes"].as_array().cloned().unwrap_or_default();
                for change in changes {
                    publish(&writer, json!({
                        "uri": change["uri"],
                        "diagnostics": [{"message": "changed", "severity": 2}],
                    }))
                    .await;
                }
            }
            "textDocument/definition" => {
                let location = json!([{
                    "uri": params["textDocument"]["uri"],
                    "range": {"start": params["position"], "end": params["position"]},
                }]);
                reply(&writer, id, location).await;
            }
            "textDocument/hover" => {
                reply(&writer, id, json!({"contents": {"kind": "markdown", "value": "fake hover"}}))
                    .await;
            }
            "shutdown" => reply(&writer, id, Value::Null).await,
            _ => {
                if let Some(id) = id {
                    let error = json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32601, "message": format!("method not found: {method}")},
                    });
                    send(&writer, &error).await;
                }
            }
        }
        if method == "exit" {
            break;
        }
    }
}

async fn reply(writer: &ServerWriter, id: Option<Value>, result: Value) {
    if let Some(id) = id {
        send(writer, &lsp_codec::response(id, result)).await;
    }
}

async fn publish(writer: &ServerWriter, params: Value) {
    send(
        writer,
        &lsp_codec::notification("textDocument/publishDiagnostics", params),
    )
    .await;
}

async fn send(writer: &ServerWriter, message: &Value) {
    let mut writer = writer.lock().await;
    let _ = write_message(&mut *writer, message).await;
}

/// Launcher backed by [`FakeLanguageServer`] that counts launches.
#[derive(Default)]
pub struct InProcessLauncher {
    launches: AtomicUsize,
    delay: Duration,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside `launch`, widening race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionLauncher for InProcessLauncher {
    async fn launch(&self, _workspace: &Path) -> Result<SessionTransport, ProtocolError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(FakeLanguageServer::start())
    }
}

/// Temporary workspace directory, removed on drop.
pub struct TestWorkspace {
    _dir: TempDir,
    root: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp workspace")?;
        let root = dir
            .path()
            .canonicalize()
            .unwrap_or_else(|_| dir.path().to_path_buf());
        Ok(Self { _dir: dir, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `contents` to a workspace-relative path, creating parents.
    pub fn write(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

impl TestWorkspace {
    /// Executor rooted here, with `registry`, a silent PTY manager, and
    /// in-process language servers.
    pub fn executor(&self, registry: ToolRegistry) -> TaskExecutor {
        let config = ExecutorConfig::default();
        let interactive = Arc::new(InteractiveManager::new(
            config.interactive.clone(),
            Arc::new(NullSink),
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::new(InProcessLauncher::new()),
            config.lsp.clone(),
        ));
        TaskExecutor::new(config, self.root.clone(), registry, interactive, sessions)
    }
}
