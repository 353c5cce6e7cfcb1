//! Interactive process manager: long-running commands on a pseudo-terminal.
//!
//! `spawn` registers the task and returns at once. A monitor task per process
//! forwards output as `log` events, races exit against the timeout, and records
//! exactly one terminal state. The registry lock is only held for map access;
//! waiting happens on per-task watch channels.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{InteractiveResult, TaskId, TaskState};
use crate::error::{ProcessSpawnError, PtyError};
use crate::io::config::InteractiveConfig;
use crate::io::events::{EventSink, TaskEvent};
use crate::io::lock;
use crate::io::process::{OutputTail, SignalTarget, resolve_executable, terminate_with_grace};

/// Largest `log` chunk, in bytes.
pub const MAX_CHUNK_BYTES: usize = 4096;

const READ_BUF_BYTES: usize = 4096;
const OUTPUT_CHANNEL_DEPTH: usize = 64;
/// How long to keep reading after exit before giving up on stragglers.
const DRAIN_WINDOW: Duration = Duration::from_millis(500);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Falls back to the manager's default timeout.
    pub timeout: Option<Duration>,
    /// Falls back to the joined command line.
    pub label: Option<String>,
}

impl SpawnRequest {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            cwd: None,
            env: Vec::new(),
            timeout: None,
            label: None,
        }
    }

    /// Run `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(vec!["sh".to_string(), "-c".to_string(), script.into()])
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Snapshot of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InteractiveTask {
    pub id: TaskId,
    pub label: String,
    pub command: Vec<String>,
    pub state: TaskState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

#[derive(Default)]
struct Subscribers {
    senders: Vec<mpsc::UnboundedSender<TaskEvent>>,
    closed: bool,
}

struct TaskEntry {
    id: TaskId,
    created: Instant,
    snapshot: StdMutex<InteractiveTask>,
    terminal: watch::Sender<Option<InteractiveResult>>,
    subscribers: StdMutex<Subscribers>,
    sink: Arc<dyn EventSink>,
}

impl TaskEntry {
    fn new(
        id: TaskId,
        label: String,
        command: Vec<String>,
        sink: Arc<dyn EventSink>,
        subscriber: Option<mpsc::UnboundedSender<TaskEvent>>,
    ) -> Self {
        let (terminal, _) = watch::channel(None);
        Self {
            id,
            created: Instant::now(),
            snapshot: StdMutex::new(InteractiveTask {
                id,
                label,
                command,
                state: TaskState::Pending,
                pid: None,
                started_at: None,
                finished_at: None,
                exit_code: None,
            }),
            terminal,
            subscribers: StdMutex::new(Subscribers {
                senders: subscriber.into_iter().collect(),
                closed: false,
            }),
            sink,
        }
    }

    fn snapshot(&self) -> InteractiveTask {
        lock(&self.snapshot).clone()
    }

    fn pid(&self) -> Option<u32> {
        lock(&self.snapshot).pid
    }

    fn is_terminal(&self) -> bool {
        self.terminal.borrow().is_some()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = lock(&self.subscribers);
        if !subs.closed {
            subs.senders.push(tx);
        }
        rx
    }

    fn emit(&self, event: TaskEvent, close: bool) {
        {
            let mut subs = lock(&self.subscribers);
            subs.senders.retain(|tx| tx.send(event.clone()).is_ok());
            if close {
                subs.closed = true;
                subs.senders.clear();
            }
        }
        self.sink.emit(&event);
    }

    fn mark_running(&self, pid: Option<u32>) {
        let (label, started_at) = {
            let mut snap = lock(&self.snapshot);
            let now = Utc::now();
            snap.state = TaskState::Running;
            snap.pid = pid;
            snap.started_at = Some(now);
            (snap.label.clone(), now)
        };
        self.emit(
            TaskEvent::Started {
                task_id: self.id,
                label,
                started_at,
            },
            false,
        );
    }

    fn log(&self, chunk: String) {
        self.emit(
            TaskEvent::Log {
                task_id: self.id,
                chunk,
            },
            false,
        );
    }

    /// Record the terminal state. Only the first call has any effect.
    fn finish(&self, state: TaskState, exit_code: Option<i32>, output_tail: String) -> bool {
        let duration_ms = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        let label = lock(&self.snapshot).label.clone();
        let result = InteractiveResult {
            task_id: self.id,
            label,
            state,
            exit_code,
            duration_ms,
            output_tail,
        };
        let won = self.terminal.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result);
            true
        });
        if !won {
            return false;
        }
        {
            let mut snap = lock(&self.snapshot);
            snap.state = state;
            snap.exit_code = exit_code;
            snap.finished_at = Some(Utc::now());
        }
        info!(task_id = %self.id, %state, ?exit_code, duration_ms, "interactive task finished");
        self.emit(
            TaskEvent::Finished {
                task_id: self.id,
                state,
                exit_code,
                duration_ms,
            },
            true,
        );
        true
    }
}

/// Owns every interactive task it spawns.
pub struct InteractiveManager {
    tasks: StdMutex<HashMap<TaskId, Arc<TaskEntry>>>,
    sink: Arc<dyn EventSink>,
    config: InteractiveConfig,
}

impl InteractiveManager {
    pub fn new(config: InteractiveConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            tasks: StdMutex::new(HashMap::new()),
            sink,
            config,
        }
    }

    /// Start `request` on a fresh PTY and return without waiting for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, request: SpawnRequest) -> Result<TaskId, ProcessSpawnError> {
        self.spawn_inner(request, None)
    }

    /// Like [`spawn`](Self::spawn), with a subscription that sees every event
    /// including `started`.
    pub fn spawn_subscribed(
        &self,
        request: SpawnRequest,
    ) -> Result<(TaskId, mpsc::UnboundedReceiver<TaskEvent>), ProcessSpawnError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.spawn_inner(request, Some(tx))?;
        Ok((id, rx))
    }

    #[instrument(skip_all, fields(command = ?request.command))]
    fn spawn_inner(
        &self,
        request: SpawnRequest,
        subscriber: Option<mpsc::UnboundedSender<TaskEvent>>,
    ) -> Result<TaskId, ProcessSpawnError> {
        let program = request
            .command
            .first()
            .cloned()
            .ok_or(ProcessSpawnError::EmptyCommand)?;
        let handle = Handle::try_current().map_err(|err| ProcessSpawnError::Failed {
            program: program.clone(),
            reason: err.to_string(),
        })?;
        resolve_executable(&program, request.cwd.as_deref())?;

        let id = TaskId::new();
        let label = request
            .label
            .clone()
            .unwrap_or_else(|| request.command.join(" "));
        let entry = Arc::new(TaskEntry::new(
            id,
            label,
            request.command.clone(),
            Arc::clone(&self.sink),
            subscriber,
        ));
        lock(&self.tasks).insert(id, Arc::clone(&entry));

        let spawned = match open_and_spawn(&program, &request) {
            Ok(spawned) => spawned,
            Err(err) => {
                warn!(%err, "interactive spawn failed");
                lock(&self.tasks).remove(&id);
                return Err(err);
            }
        };
        let Spawned {
            mut child,
            master,
            reader,
            pid,
        } = spawned;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        if let Err(err) = spawn_reader(reader, output_tx) {
            warn!(%err, "failed to start pty reader");
            if let Err(kill_err) = child.kill() {
                debug!(%kill_err, "kill after reader failure");
            }
            let _ = handle.spawn_blocking(move || child.wait());
            lock(&self.tasks).remove(&id);
            return Err(ProcessSpawnError::Failed {
                program,
                reason: format!("start output reader: {err}"),
            });
        }

        entry.mark_running(pid);
        info!(task_id = %id, ?pid, "interactive task started");

        let (exit_tx, exit_rx) = oneshot::channel();
        handle.spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).ok(),
                Err(err) => {
                    warn!(%err, "wait on pty child failed");
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        let monitor = Monitor {
            entry,
            pgid: pid,
            timeout: request
                .timeout
                .unwrap_or_else(|| self.config.default_timeout()),
            grace: self.config.kill_grace(),
            tail: OutputTail::new(self.config.output_tail_bytes),
        };
        handle.spawn(monitor.run(output_rx, exit_rx, master));
        Ok(id)
    }

    /// Subscribe to every later event of `task_id`.
    ///
    /// The receiver closes after `finished`; for a task that is already
    /// terminal it is closed immediately.
    pub fn subscribe(
        &self,
        task_id: TaskId,
    ) -> Result<mpsc::UnboundedReceiver<TaskEvent>, PtyError> {
        Ok(self.entry(task_id)?.subscribe())
    }

    /// Suspend until the task is terminal and return its cached outcome.
    pub async fn await_completion(&self, task_id: TaskId) -> Result<InteractiveResult, PtyError> {
        let entry = self.entry(task_id)?;
        let mut rx = entry.terminal.subscribe();
        let result = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| unknown(task_id))?
            .clone();
        result.ok_or_else(|| unknown(task_id))
    }

    pub fn task(&self, task_id: TaskId) -> Option<InteractiveTask> {
        lock(&self.tasks).get(&task_id).map(|e| e.snapshot())
    }

    pub fn list(&self) -> Vec<InteractiveTask> {
        let mut tasks: Vec<InteractiveTask> =
            lock(&self.tasks).values().map(|e| e.snapshot()).collect();
        tasks.sort_by_key(|t| t.started_at);
        tasks
    }

    /// Drop a terminal task from the registry. Running tasks are kept.
    pub fn reap(&self, task_id: TaskId) -> Option<InteractiveTask> {
        let mut tasks = lock(&self.tasks);
        if !tasks.get(&task_id)?.is_terminal() {
            return None;
        }
        tasks.remove(&task_id).map(|e| e.snapshot())
    }

    /// Force-kill every running task and wait (bounded) for each to settle.
    pub async fn shutdown_all(&self) {
        let running: Vec<Arc<TaskEntry>> = lock(&self.tasks)
            .values()
            .filter(|e| !e.is_terminal())
            .cloned()
            .collect();
        if running.is_empty() {
            return;
        }
        info!(count = running.len(), "shutting down interactive tasks");
        for entry in &running {
            if let Some(pid) = entry.pid() {
                SignalTarget::Group(pid).send(Signal::SIGKILL);
            }
        }
        let waits = running.iter().map(|entry| {
            let mut rx = entry.terminal.subscribe();
            async move {
                let settled =
                    tokio::time::timeout(SHUTDOWN_WAIT, rx.wait_for(Option::is_some)).await;
                if !matches!(settled, Ok(Ok(_))) {
                    warn!(task_id = %entry.id, "task did not settle after kill");
                    entry.finish(TaskState::Error, None, String::new());
                }
            }
        });
        futures::future::join_all(waits).await;
    }

    fn entry(&self, task_id: TaskId) -> Result<Arc<TaskEntry>, PtyError> {
        lock(&self.tasks)
            .get(&task_id)
            .cloned()
            .ok_or_else(|| unknown(task_id))
    }
}

impl Drop for InteractiveManager {
    fn drop(&mut self) {
        for entry in lock(&self.tasks).values() {
            if entry.is_terminal() {
                continue;
            }
            if let Some(pid) = entry.pid() {
                debug!(task_id = %entry.id, pid, "killing task on manager drop");
                SignalTarget::Group(pid).send(Signal::SIGKILL);
            }
        }
    }
}

fn unknown(task_id: TaskId) -> PtyError {
    PtyError::UnknownTask {
        task_id: task_id.to_string(),
    }
}

struct Spawned {
    child: Box<dyn Child + Send + Sync>,
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    pid: Option<u32>,
}

fn open_and_spawn(program: &str, request: &SpawnRequest) -> Result<Spawned, ProcessSpawnError> {
    let failed = |reason: String| ProcessSpawnError::Failed {
        program: program.to_string(),
        reason,
    };
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| failed(format!("open pty: {e}")))?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(&request.command[1..]);
    if let Some(cwd) = &request.cwd {
        cmd.cwd(cwd);
    }
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| failed(e.to_string()))?;
    // The master only reports EOF once every slave handle is closed.
    drop(pair.slave);

    let reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(e) => {
            if let Err(kill_err) = child.kill() {
                debug!(%kill_err, "kill after reader clone failure");
            }
            let _ = child.wait();
            return Err(failed(format!("clone pty reader: {e}")));
        }
    };
    let pid = child.process_id();
    Ok(Spawned {
        child,
        master: pair.master,
        reader,
        pid,
    })
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Vec<u8>>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || {
            let mut buf = [0u8; READ_BUF_BYTES];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    // EIO once the slave side is gone.
                    Err(err) => {
                        debug!(%err, "pty reader stopped");
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

struct Monitor {
    entry: Arc<TaskEntry>,
    pgid: Option<u32>,
    timeout: Duration,
    grace: Duration,
    tail: OutputTail,
}

impl Monitor {
    async fn run(
        mut self,
        mut output: mpsc::Receiver<Vec<u8>>,
        mut exit: oneshot::Receiver<Option<i32>>,
        master: Box<dyn MasterPty + Send>,
    ) {
        let pgid = self.pgid;
        // Runs if this future is dropped or panics before recording a result.
        let guard = scopeguard::guard(Arc::clone(&self.entry), move |entry| {
            warn!(task_id = %entry.id, "monitor ended early, killing task");
            if let Some(pgid) = pgid {
                SignalTarget::Group(pgid).send(Signal::SIGKILL);
            }
            entry.finish(TaskState::Error, None, String::new());
        });

        let mut chunker = Utf8Chunker::default();
        let mut output_open = true;
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let (state, exit_code) = loop {
            tokio::select! {
                biased;
                () = &mut deadline => {
                    warn!(task_id = %self.entry.id, timeout_ms = self.timeout.as_millis(), "interactive task timed out");
                    let code = match pgid {
                        Some(pgid) => terminate_with_grace(SignalTarget::Group(pgid), self.grace, &mut exit)
                            .await
                            .ok()
                            .flatten(),
                        None => exit_within(&mut exit, self.grace).await,
                    };
                    break (TaskState::Timeout, code);
                }
                code = &mut exit => {
                    let code = code.ok().flatten();
                    let state = if code == Some(0) { TaskState::Success } else { TaskState::Error };
                    break (state, code);
                }
                chunk = output.recv(), if output_open => match chunk {
                    Some(bytes) => self.forward(&mut chunker, &bytes),
                    None => output_open = false,
                },
            }
        };

        let drain_until = tokio::time::Instant::now() + DRAIN_WINDOW;
        while output_open {
            match tokio::time::timeout_at(drain_until, output.recv()).await {
                Ok(Some(bytes)) => self.forward(&mut chunker, &bytes),
                Ok(None) => output_open = false,
                Err(_) => {
                    debug!(task_id = %self.entry.id, "output still open after exit, killing process group");
                    if let Some(pgid) = pgid {
                        SignalTarget::Group(pgid).send(Signal::SIGKILL);
                    }
                    break;
                }
            }
        }
        let rest = chunker.finish();
        if !rest.is_empty() {
            self.tail.push(rest.as_bytes());
            self.entry.log(rest);
        }
        drop(master);

        let entry = scopeguard::ScopeGuard::into_inner(guard);
        entry.finish(state, exit_code, self.tail.text());
    }

    fn forward(&mut self, chunker: &mut Utf8Chunker, bytes: &[u8]) {
        for chunk in chunker.push(bytes) {
            self.tail.push(chunk.as_bytes());
            self.entry.log(chunk);
        }
    }
}

/// Turns raw reads into UTF-8 text chunks of at most [`MAX_CHUNK_BYTES`],
/// carrying incomplete trailing sequences over to the next read.
#[derive(Debug, Default)]
struct Utf8Chunker {
    carry: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(bytes);
        let split = incomplete_suffix_start(&self.carry);
        let ready: Vec<u8> = self.carry.drain(..split).collect();
        if ready.is_empty() {
            return Vec::new();
        }
        split_chunks(&String::from_utf8_lossy(&ready), MAX_CHUNK_BYTES)
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        rest
    }
}

fn incomplete_suffix_start(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(3) {
        let b = buf[len - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let need = match b {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if need > back { len - back } else { len };
    }
    len
}

fn split_chunks(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max {
        let mut cut = max;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Exit code from the waiter thread, or `None` if it stays silent past `bound`.
async fn exit_within(exit: &mut oneshot::Receiver<Option<i32>>, bound: Duration) -> Option<i32> {
    match tokio::time::timeout(bound, exit).await {
        Ok(code) => code.ok().flatten(),
        Err(_) => {
            warn!(bound_ms = bound.as_millis(), "no exit status from unsignalable task");
            None
        }
    }
}
