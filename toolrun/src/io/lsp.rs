//! Protocol session manager: one language server per workspace.
//!
//! A [`Session`] owns the server process, a background reader that routes
//! responses to waiting requests and caches pushed diagnostics, and a task
//! that drains the server's stderr. [`SessionManager`] keys sessions by
//! canonical workspace path and serializes creation per key.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as AsyncMutex, Notify, OnceCell, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{ProcessSpawnError, ProtocolError};
use crate::io::config::LspConfig;
use crate::io::lock;
use crate::io::lsp_codec::{self, Incoming, read_message, write_message};
use crate::io::process::{SignalTarget, resolve_executable, terminate_with_grace};

/// LSP `FileChangeType.Changed`.
const FILE_CHANGED: u8 = 2;

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Waiter = oneshot::Sender<Result<Value, ProtocolError>>;

/// Byte streams to a running server, plus the process behind them if any.
pub struct SessionTransport {
    pub reader: Reader,
    pub writer: Writer,
    pub stderr: Option<Reader>,
    pub child: Option<Child>,
    /// What to signal when the server must be stopped.
    pub kill_target: Option<SignalTarget>,
}

/// Starts language servers.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    /// Check the server can be started at all.
    fn validate(&self) -> Result<(), ProcessSpawnError> {
        Ok(())
    }

    async fn launch(&self, workspace: &Path) -> Result<SessionTransport, ProtocolError>;
}

/// Runs the configured command with stdio pipes, in its own process group.
#[derive(Debug, Clone)]
pub struct StdioLauncher {
    command: Vec<String>,
}

impl StdioLauncher {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    pub fn from_config(config: &LspConfig) -> Self {
        Self::new(config.command.clone())
    }
}

#[async_trait]
impl SessionLauncher for StdioLauncher {
    fn validate(&self) -> Result<(), ProcessSpawnError> {
        let program = self.command.first().ok_or(ProcessSpawnError::EmptyCommand)?;
        resolve_executable(program, None).map(|_| ())
    }

    async fn launch(&self, workspace: &Path) -> Result<SessionTransport, ProtocolError> {
        self.validate()?;
        let (program, args) = self
            .command
            .split_first()
            .ok_or(ProcessSpawnError::EmptyCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ProcessSpawnError::Failed {
            program: program.clone(),
            reason: e.to_string(),
        })?;
        let missing = |stream: &str| ProcessSpawnError::Failed {
            program: program.clone(),
            reason: format!("{stream} was not piped"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let pid = child.id();
        info!(workspace = %workspace.display(), ?pid, %program, "language server started");

        Ok(SessionTransport {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            stderr: Some(Box::new(stderr)),
            child: Some(child),
            kill_target: pid.map(SignalTarget::Group),
        })
    }
}

/// Latest diagnostics for one URI and how many publishes produced them.
#[derive(Debug, Clone, Default)]
struct Published {
    generation: u64,
    diagnostics: Vec<Value>,
}

/// State shared with the background reader.
struct Shared {
    writer: AsyncMutex<Writer>,
    pending: StdMutex<HashMap<i64, Waiter>>,
    diagnostics: StdMutex<HashMap<String, Published>>,
    diagnostics_changed: Notify,
    closed: AtomicBool,
}

impl Shared {
    async fn send(&self, message: &Value) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, message).await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let waiters: Vec<Waiter> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        for tx in waiters {
            let _ = tx.send(Err(ProtocolError::SessionClosed));
        }
        self.diagnostics_changed.notify_waiters();
    }

    fn handle_notification(&self, method: &str, params: Value) {
        match method {
            "textDocument/publishDiagnostics" => {
                let Some(uri) = params.get("uri").and_then(Value::as_str) else {
                    warn!("publishDiagnostics without uri");
                    return;
                };
                let diagnostics = params
                    .get("diagnostics")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                debug!(%uri, count = diagnostics.len(), "diagnostics updated");
                let mut cache = lock(&self.diagnostics);
                let entry = cache.entry(uri.to_string()).or_default();
                entry.generation += 1;
                entry.diagnostics = diagnostics;
                self.diagnostics_changed.notify_waiters();
            }
            "window/logMessage" | "window/showMessage" => {
                let message = params.get("message").and_then(Value::as_str).unwrap_or_default();
                debug!(%message, "server message");
            }
            other => trace!(method = other, "ignoring notification"),
        }
    }
}

/// Reply for requests the server sends us.
fn server_request_reply(method: &str, params: &Value) -> Value {
    match method {
        "workspace/configuration" => {
            let items = params
                .get("items")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            Value::Array(vec![Value::Null; items])
        }
        _ => Value::Null,
    }
}

async fn read_loop(shared: Arc<Shared>, reader: Reader) {
    let mut reader = BufReader::new(reader);
    loop {
        let message = match read_message(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("language server closed its output");
                break;
            }
            Err(ProtocolError::Io(err)) => {
                debug!(%err, "language server transport failed");
                break;
            }
            Err(err @ ProtocolError::Framing(_)) => {
                warn!(%err, "closing language server session");
                break;
            }
            Err(err) => {
                warn!(%err, "skipping malformed message");
                continue;
            }
        };
        match Incoming::parse(message) {
            Ok(Incoming::Response { id, result }) => {
                let waiter = lock(&shared.pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let result =
                            result.map_err(|(code, message)| ProtocolError::Server { code, message });
                        let _ = tx.send(result);
                    }
                    None => debug!(id, "response for unknown or expired request"),
                }
            }
            Ok(Incoming::Notification { method, params }) => {
                shared.handle_notification(&method, params);
            }
            Ok(Incoming::Request { id, method, params }) => {
                debug!(%method, "answering server request");
                let reply = lsp_codec::response(id, server_request_reply(&method, &params));
                // The writer may be blocked on a full stdin; keep draining stdout.
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(err) = shared.send(&reply).await {
                        debug!(%err, "failed to answer server request");
                    }
                });
            }
            Err(err) => warn!(%err, "unrecognized message"),
        }
    }
    shared.close();
}

async fn drain_stderr(stderr: Reader) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "toolrun::lsp::stderr", "{line}");
    }
}

/// One running language server bound to a workspace.
pub struct Session {
    workspace: PathBuf,
    root_uri: String,
    shared: Arc<Shared>,
    next_id: AtomicI64,
    child: AsyncMutex<Option<Child>>,
    kill_target: Option<SignalTarget>,
    capabilities: OnceLock<Value>,
    documents: StdMutex<HashMap<String, i64>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Wire up a transport and start its background readers.
    pub fn start(workspace: PathBuf, transport: SessionTransport) -> Arc<Self> {
        let SessionTransport {
            reader,
            writer,
            stderr,
            child,
            kill_target,
        } = transport;
        let shared = Arc::new(Shared {
            writer: AsyncMutex::new(writer),
            pending: StdMutex::new(HashMap::new()),
            diagnostics: StdMutex::new(HashMap::new()),
            diagnostics_changed: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let mut tasks = vec![tokio::spawn(read_loop(Arc::clone(&shared), reader))];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(drain_stderr(stderr)));
        }
        Arc::new(Self {
            root_uri: file_uri(&workspace),
            workspace,
            shared,
            next_id: AtomicI64::new(1),
            child: AsyncMutex::new(child),
            kill_target,
            capabilities: OnceLock::new(),
            documents: StdMutex::new(HashMap::new()),
            tasks,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Server capabilities from the handshake.
    pub fn capabilities(&self) -> Option<&Value> {
        self.capabilities.get()
    }

    /// Send a request and wait for its response.
    ///
    /// On timeout only this request is abandoned; the session stays usable.
    #[instrument(skip(self, params), fields(workspace = %self.workspace.display()))]
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::SessionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);
        if self.is_closed() {
            lock(&self.shared.pending).remove(&id);
            return Err(ProtocolError::SessionClosed);
        }

        if let Err(err) = self
            .shared
            .send(&lsp_codec::request(id, method, params))
            .await
        {
            lock(&self.shared.pending).remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::SessionClosed),
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                warn!(id, timeout_ms = timeout.as_millis(), "request timed out");
                Err(ProtocolError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::SessionClosed);
        }
        self.shared
            .send(&lsp_codec::notification(method, params))
            .await
    }

    /// `initialize` followed by `initialized`.
    pub async fn initialize(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let name = self
            .workspace
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let params = json!({
            "processId": std::process::id(),
            "rootUri": self.root_uri,
            "rootPath": self.workspace.display().to_string(),
            "workspaceFolders": [{"uri": self.root_uri, "name": name}],
            "capabilities": {
                "textDocument": {
                    "publishDiagnostics": {"relatedInformation": true},
                    "hover": {"contentFormat": ["markdown", "plaintext"]},
                    "definition": {"linkSupport": false},
                    "synchronization": {"didSave": true},
                },
                "workspace": {
                    "configuration": true,
                    "workspaceFolders": true,
                    "didChangeWatchedFiles": {"dynamicRegistration": false},
                },
            },
        });
        let result = self.request("initialize", params, timeout).await?;
        let capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);
        let _ = self.capabilities.set(capabilities);
        self.notify("initialized", json!({})).await?;
        info!(workspace = %self.workspace.display(), "language server initialized");
        Ok(())
    }

    /// Send the document's current text: `didOpen` the first time, `didChange` after.
    pub async fn sync_document(
        &self,
        uri: &str,
        language_id: &str,
        text: String,
    ) -> Result<(), ProtocolError> {
        let version = {
            let mut docs = lock(&self.documents);
            let version = docs.entry(uri.to_string()).or_insert(0);
            *version += 1;
            *version
        };
        if version == 1 {
            self.notify(
                "textDocument/didOpen",
                json!({"textDocument": {
                    "uri": uri,
                    "languageId": language_id,
                    "version": version,
                    "text": text,
                }}),
            )
            .await
        } else {
            self.notify(
                "textDocument/didChange",
                json!({
                    "textDocument": {"uri": uri, "version": version},
                    "contentChanges": [{"text": text}],
                }),
            )
            .await
        }
    }

    /// Latest diagnostics for `uri` (empty if none were pushed).
    pub fn diagnostics(&self, uri: &str) -> Vec<Value> {
        lock(&self.shared.diagnostics)
            .get(uri)
            .map(|p| p.diagnostics.clone())
            .unwrap_or_default()
    }

    pub fn all_diagnostics(&self) -> BTreeMap<String, Vec<Value>> {
        lock(&self.shared.diagnostics)
            .iter()
            .map(|(uri, p)| (uri.clone(), p.diagnostics.clone()))
            .collect()
    }

    /// Number of diagnostics publishes seen for `uri` so far.
    pub fn diagnostics_generation(&self, uri: &str) -> u64 {
        lock(&self.shared.diagnostics)
            .get(uri)
            .map_or(0, |p| p.generation)
    }

    /// Wait for a publish for `uri` newer than generation `seen`.
    ///
    /// On timeout or session close, falls back to whatever is cached.
    pub async fn wait_for_diagnostics(
        &self,
        uri: &str,
        seen: u64,
        timeout: Duration,
    ) -> Option<Vec<Value>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.diagnostics_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let cached = lock(&self.shared.diagnostics).get(uri).cloned();
            if let Some(published) = &cached
                && published.generation > seen
            {
                return cached.map(|p| p.diagnostics);
            }
            if self.is_closed() || tokio::time::timeout_at(deadline, notified).await.is_err() {
                return cached.map(|p| p.diagnostics);
            }
        }
    }

    /// Graceful `shutdown` + `exit`, then SIGTERM and SIGKILL after `deadline`.
    ///
    /// Always leaves the server process reaped.
    #[instrument(skip(self), fields(workspace = %self.workspace.display()))]
    pub async fn shutdown(&self, deadline: Duration) {
        if !self.is_closed() {
            if let Err(err) = self.request("shutdown", Value::Null, deadline).await {
                debug!(%err, "shutdown request failed");
            }
            if let Err(err) = self.notify("exit", Value::Null).await {
                debug!(%err, "exit notification failed");
            }
        }

        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            let status = match self.kill_target {
                Some(target) => terminate_with_grace(target, deadline, child.wait()).await,
                None => {
                    if let Err(err) = child.start_kill() {
                        debug!(%err, "kill language server");
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(status) => info!(code = ?status.code(), "language server exited"),
                Err(err) => warn!(%err, "failed to reap language server"),
            }
        }
        *child = None;
        drop(child);

        for task in &self.tasks {
            task.abort();
        }
        self.shared.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(child) = self.child.get_mut().as_ref()
            && child.id().is_some()
            && let Some(target) = self.kill_target
        {
            target.send(nix::sys::signal::Signal::SIGKILL);
        }
    }
}

/// A document just synced to its server.
pub struct OpenedDocument {
    pub session: Arc<Session>,
    pub uri: String,
    /// Diagnostics generation before the sync; wait past it for fresh results.
    pub generation: u64,
}

impl OpenedDocument {
    /// Diagnostics published in response to this sync, or the cached ones
    /// once `timeout` passes.
    pub async fn fresh_diagnostics(&self, timeout: Duration) -> Vec<Value> {
        self.session
            .wait_for_diagnostics(&self.uri, self.generation, timeout)
            .await
            .unwrap_or_default()
    }
}

/// Registry of sessions keyed by canonical workspace path.
pub struct SessionManager {
    launcher: Arc<dyn SessionLauncher>,
    config: LspConfig,
    sessions: StdMutex<HashMap<PathBuf, Arc<OnceCell<Arc<Session>>>>>,
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn SessionLauncher>, config: LspConfig) -> Self {
        Self {
            launcher,
            config,
            sessions: StdMutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: LspConfig) -> Self {
        Self::new(Arc::new(StdioLauncher::from_config(&config)), config)
    }

    pub fn config(&self) -> &LspConfig {
        &self.config
    }

    /// Fail fast if the server command cannot be started.
    pub fn validate(&self) -> Result<(), ProcessSpawnError> {
        self.launcher.validate()
    }

    /// Return the live session for `workspace`, starting one if needed.
    ///
    /// Concurrent callers for the same workspace share one launch.
    pub async fn get_or_create(&self, workspace: &Path) -> Result<Arc<Session>, ProtocolError> {
        let key = workspace_key(workspace);
        let cell = {
            let mut sessions = lock(&self.sessions);
            let stale = sessions
                .get(&key)
                .and_then(|cell| cell.get())
                .is_some_and(|session| session.is_closed());
            if stale {
                debug!(workspace = %key.display(), "replacing closed session");
                sessions.remove(&key);
            }
            Arc::clone(
                sessions
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };
        let session = Arc::clone(cell.get_or_try_init(|| self.launch(&key)).await?);

        // A shutdown during the launch unregisters the cell; don't leave the
        // late server running beside a replacement.
        let registered = lock(&self.sessions)
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell));
        if !registered {
            debug!(workspace = %key.display(), "session shut down while starting");
            session.shutdown(self.config.shutdown_deadline()).await;
            return Err(ProtocolError::SessionClosed);
        }
        Ok(session)
    }

    async fn launch(&self, workspace: &Path) -> Result<Arc<Session>, ProtocolError> {
        let transport = self.launcher.launch(workspace).await?;
        let session = Session::start(workspace.to_path_buf(), transport);
        if let Err(err) = session.initialize(self.config.initialize_timeout()).await {
            warn!(workspace = %workspace.display(), %err, "language server handshake failed");
            session.shutdown(self.config.shutdown_deadline()).await;
            return Err(err);
        }
        Ok(session)
    }

    /// The live session for `workspace`, without starting one.
    pub fn existing(&self, workspace: &Path) -> Option<Arc<Session>> {
        let key = workspace_key(workspace);
        lock(&self.sessions)
            .get(&key)
            .and_then(|cell| cell.get().cloned())
            .filter(|session| !session.is_closed())
    }

    /// Correlated request; `timeout` defaults to `request_timeout_ms`.
    pub async fn request(
        &self,
        workspace: &Path,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ProtocolError> {
        let session = self.get_or_create(workspace).await?;
        session
            .request(
                method,
                params,
                timeout.unwrap_or_else(|| self.config.request_timeout()),
            )
            .await
    }

    /// Tell a live session that `uri` changed on disk.
    ///
    /// Returns `false` when no session is running for the workspace.
    pub async fn notify_file_changed(
        &self,
        workspace: &Path,
        uri: &str,
    ) -> Result<bool, ProtocolError> {
        let Some(session) = self.existing(workspace) else {
            return Ok(false);
        };
        session
            .notify(
                "workspace/didChangeWatchedFiles",
                json!({"changes": [{"uri": uri, "type": FILE_CHANGED}]}),
            )
            .await?;
        Ok(true)
    }

    /// Read `file` from disk and sync it to the workspace's server.
    pub async fn open_document(
        &self,
        workspace: &Path,
        file: &Path,
    ) -> Result<OpenedDocument, ProtocolError> {
        let session = self.get_or_create(workspace).await?;
        let path = resolve_in(workspace, file);
        let text = tokio::fs::read_to_string(&path).await?;
        let uri = file_uri(&path);
        let generation = session.diagnostics_generation(&uri);
        session
            .sync_document(&uri, language_id(&path), text)
            .await?;
        Ok(OpenedDocument {
            session,
            uri,
            generation,
        })
    }

    /// `textDocument/definition` at a zero-based position.
    pub async fn definition(
        &self,
        workspace: &Path,
        file: &Path,
        line: u32,
        character: u32,
    ) -> Result<Value, ProtocolError> {
        self.position_request(workspace, file, "textDocument/definition", line, character)
            .await
    }

    /// `textDocument/hover` at a zero-based position.
    pub async fn hover(
        &self,
        workspace: &Path,
        file: &Path,
        line: u32,
        character: u32,
    ) -> Result<Value, ProtocolError> {
        self.position_request(workspace, file, "textDocument/hover", line, character)
            .await
    }

    async fn position_request(
        &self,
        workspace: &Path,
        file: &Path,
        method: &str,
        line: u32,
        character: u32,
    ) -> Result<Value, ProtocolError> {
        let OpenedDocument { session, uri, .. } = self.open_document(workspace, file).await?;
        session
            .request(
                method,
                json!({
                    "textDocument": {"uri": uri},
                    "position": {"line": line, "character": character},
                }),
                self.config.request_timeout(),
            )
            .await
    }

    /// Cached diagnostics for one file; empty if no session is running.
    pub fn diagnostics(&self, workspace: &Path, file: &Path) -> Vec<Value> {
        let uri = file_uri(&resolve_in(workspace, file));
        self.existing(workspace)
            .map(|session| session.diagnostics(&uri))
            .unwrap_or_default()
    }

    pub fn all_diagnostics(&self, workspace: &Path) -> BTreeMap<String, Vec<Value>> {
        self.existing(workspace)
            .map(|session| session.all_diagnostics())
            .unwrap_or_default()
    }

    /// Tear down and forget the session, e.g. after a configuration change.
    ///
    /// A no-op when none exists.
    pub async fn invalidate(&self, workspace: &Path) {
        info!(workspace = %workspace.display(), "invalidating language server session");
        self.shutdown(workspace).await;
    }

    /// Stop the workspace's server and remove it. Returns whether one existed.
    pub async fn shutdown(&self, workspace: &Path) -> bool {
        let key = workspace_key(workspace);
        let cell = lock(&self.sessions).remove(&key);
        match cell.and_then(|cell| cell.get().cloned()) {
            Some(session) => {
                session.shutdown(self.config.shutdown_deadline()).await;
                true
            }
            None => false,
        }
    }

    pub async fn restart(&self, workspace: &Path) -> Result<Arc<Session>, ProtocolError> {
        self.shutdown(workspace).await;
        self.get_or_create(workspace).await
    }

    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = lock(&self.sessions)
            .drain()
            .filter_map(|(_, cell)| cell.get().cloned())
            .collect();
        let deadline = self.config.shutdown_deadline();
        futures::future::join_all(sessions.iter().map(|s| s.shutdown(deadline))).await;
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions)
            .values()
            .filter(|cell| cell.get().is_some_and(|s| !s.is_closed()))
            .count()
    }
}

fn workspace_key(workspace: &Path) -> PathBuf {
    workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf())
}

fn resolve_in(workspace: &Path, file: &Path) -> PathBuf {
    let path = if file.is_absolute() {
        file.to_path_buf()
    } else {
        workspace.join(file)
    };
    path.canonicalize().unwrap_or(path)
}

/// `file://` URI for an absolute path.
pub fn file_uri(path: &Path) -> String {
    let mut uri = String::from("file://");
    for byte in path.to_string_lossy().bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'/' | b'-' | b'_' | b'.' | b'~' => {
                uri.push(char::from(byte));
            }
            other => uri.push_str(&format!("%{other:02X}")),
        }
    }
    uri
}

fn language_id(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or_default() {
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "json" => "json",
        "py" => "python",
        "rs" => "rust",
        _ => "plaintext",
    }
}
