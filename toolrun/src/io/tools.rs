//! Tool seam: what the executor can dispatch to, plus the built-in tools.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::debug;

use crate::io::config::ExecutorConfig;
use crate::io::lsp::{SessionManager, file_uri};
use crate::io::process::run_command_with_timeout;
use crate::io::pty::SpawnRequest;

/// Argument key the executor fills in for tools that need a project directory.
pub const PROJECT_SUBDIRECTORY_ARG: &str = "project_subdirectory";

/// What a tool hands back to the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// Finished; classify this value.
    Result(Value),
    /// Long-running command to run on a PTY and wait for.
    Interactive(SpawnRequest),
}

/// Everything a tool may touch besides its arguments.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace_root: PathBuf,
    pub project_subdirectory: Option<String>,
    pub sessions: Arc<SessionManager>,
    pub config: Arc<ExecutorConfig>,
}

impl ToolContext {
    /// Workspace root joined with the project subdirectory, if any.
    pub fn project_dir(&self) -> PathBuf {
        project_dir(&self.workspace_root, self.project_subdirectory.as_deref())
    }
}

pub(crate) fn project_dir(root: &Path, subdir: Option<&str>) -> PathBuf {
    match subdir.map(str::trim).filter(|s| !s.is_empty()) {
        Some(subdir) => root.join(subdir),
        None => root.to_path_buf(),
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a successful call may change files in the workspace.
    fn mutates_workspace(&self) -> bool {
        false
    }

    /// Whether the executor should inject `project_subdirectory` into the args.
    fn needs_project_context(&self) -> bool {
        false
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolOutput>;
}

/// Tools by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in tool.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(RunShell);
        registry.register(RunInteractive);
        registry.register(LspDefinition);
        registry.register(LspHover);
        registry.register(GetDiagnostics);
        registry.register(WriteFile);
        registry
    }

    /// Add `tool`, replacing any tool with the same name.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }
}

/// A command given either as one shell line or as argv.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    fn argv(&self) -> Vec<String> {
        match self {
            Self::Line(line) => vec!["sh".to_string(), "-c".to_string(), line.clone()],
            Self::Argv(argv) => argv.clone(),
        }
    }

    fn display(&self) -> String {
        match self {
            Self::Line(line) => line.clone(),
            Self::Argv(argv) => argv.join(" "),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunShellArgs {
    command: CommandSpec,
    timeout_secs: Option<u64>,
}

/// Runs a command to completion and captures its output.
pub struct RunShell;

#[async_trait]
impl Tool for RunShell {
    fn name(&self) -> &str {
        "run_shell"
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolOutput> {
        let args: RunShellArgs =
            serde_json::from_value(args.clone()).context("invalid run_shell arguments")?;
        let argv = args.command.argv();
        let (program, rest) = argv.split_first().context("run_shell command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(rest).current_dir(ctx.project_dir());

        let shell = &ctx.config.shell;
        let timeout = args
            .timeout_secs
            .map_or_else(|| shell.timeout(), Duration::from_secs);
        let output = run_command_with_timeout(
            cmd,
            None,
            timeout,
            ctx.config.interactive.kill_grace(),
            shell.output_limit_bytes,
        )
        .await?;

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        stdout.push_str(&output.stdout_truncated_notice("run_shell"));
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        stderr.push_str(&output.stderr_truncated_notice("run_shell"));
        if output.timed_out {
            stderr.push_str(&format!("\n[timed out after {}s]\n", timeout.as_secs()));
        }
        Ok(ToolOutput::Result(json!({
            "ok": output.status.success() && !output.timed_out,
            "return_code": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
            "command_executed": args.command.display(),
            "timed_out": output.timed_out,
        })))
    }
}

#[derive(Debug, Deserialize)]
struct RunInteractiveArgs {
    command: CommandSpec,
    timeout_secs: Option<u64>,
    label: Option<String>,
}

/// Runs a long-lived command on a PTY, streaming its output.
pub struct RunInteractive;

#[async_trait]
impl Tool for RunInteractive {
    fn name(&self) -> &str {
        "run_interactive"
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolOutput> {
        let args: RunInteractiveArgs =
            serde_json::from_value(args.clone()).context("invalid run_interactive arguments")?;
        let mut request = SpawnRequest::new(args.command.argv()).cwd(ctx.project_dir());
        request.timeout = args.timeout_secs.map(Duration::from_secs);
        request.label = Some(args.label.unwrap_or_else(|| args.command.display()));
        Ok(ToolOutput::Interactive(request))
    }
}

#[derive(Debug, Deserialize)]
struct PositionArgs {
    #[serde(alias = "path")]
    file_path: PathBuf,
    line: u32,
    character: u32,
    project_subdirectory: Option<String>,
}

fn lsp_workspace(ctx: &ToolContext, subdir: Option<&str>) -> PathBuf {
    project_dir(
        &ctx.workspace_root,
        subdir.or(ctx.project_subdirectory.as_deref()),
    )
}

/// Go-to-definition through the workspace's language server.
pub struct LspDefinition;

#[async_trait]
impl Tool for LspDefinition {
    fn name(&self) -> &str {
        "lsp_definition"
    }

    fn needs_project_context(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolOutput> {
        let args: PositionArgs =
            serde_json::from_value(args.clone()).context("invalid lsp_definition arguments")?;
        let workspace = lsp_workspace(ctx, args.project_subdirectory.as_deref());
        let definition = ctx
            .sessions
            .definition(&workspace, &args.file_path, args.line, args.character)
            .await?;
        Ok(ToolOutput::Result(json!({ "definition": definition })))
    }
}

/// Hover information through the workspace's language server.
pub struct LspHover;

#[async_trait]
impl Tool for LspHover {
    fn name(&self) -> &str {
        "lsp_hover"
    }

    fn needs_project_context(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolOutput> {
        let args: PositionArgs =
            serde_json::from_value(args.clone()).context("invalid lsp_hover arguments")?;
        let workspace = lsp_workspace(ctx, args.project_subdirectory.as_deref());
        let hover = ctx
            .sessions
            .hover(&workspace, &args.file_path, args.line, args.character)
            .await?;
        Ok(ToolOutput::Result(json!({ "hover": hover })))
    }
}

#[derive(Debug, Deserialize)]
struct DiagnosticsArgs {
    #[serde(default, alias = "path")]
    file_path: Option<PathBuf>,
    #[serde(default = "default_wait_ms")]
    wait_ms: u64,
    project_subdirectory: Option<String>,
}

fn default_wait_ms() -> u64 {
    2_000
}

/// Diagnostics the language server has pushed for a file or the whole workspace.
pub struct GetDiagnostics;

#[async_trait]
impl Tool for GetDiagnostics {
    fn name(&self) -> &str {
        "get_diagnostics"
    }

    fn needs_project_context(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolOutput> {
        let args: DiagnosticsArgs =
            serde_json::from_value(args.clone()).context("invalid get_diagnostics arguments")?;
        let workspace = lsp_workspace(ctx, args.project_subdirectory.as_deref());

        let Some(file) = args.file_path else {
            ctx.sessions.get_or_create(&workspace).await?;
            let all = ctx.sessions.all_diagnostics(&workspace);
            return Ok(ToolOutput::Result(json!({ "diagnostics": all })));
        };

        let opened = ctx.sessions.open_document(&workspace, &file).await?;
        let diagnostics = opened
            .fresh_diagnostics(Duration::from_millis(args.wait_ms))
            .await;
        debug!(uri = %opened.uri, count = diagnostics.len(), "diagnostics fetched");
        Ok(ToolOutput::Result(json!({
            "file": opened.uri,
            "diagnostics": diagnostics,
        })))
    }
}

#[derive(Debug, Deserialize)]
struct WriteFileArgs {
    #[serde(alias = "path")]
    file_path: PathBuf,
    content: String,
}

/// Writes a file under the project directory, creating parent directories.
pub struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn mutates_workspace(&self) -> bool {
        true
    }

    fn needs_project_context(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<ToolOutput> {
        let args: WriteFileArgs =
            serde_json::from_value(args.clone()).context("invalid write_file arguments")?;
        if args.file_path.is_absolute()
            || args
                .file_path
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            bail!(
                "write_file path must stay inside the project: {}",
                args.file_path.display()
            );
        }
        let path = ctx.project_dir().join(&args.file_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        tokio::fs::write(&path, args.content.as_bytes())
            .await
            .with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), bytes = args.content.len(), "file written");
        Ok(ToolOutput::Result(json!({
            "ok": true,
            "message": format!("wrote {} bytes to {}", args.content.len(), args.file_path.display()),
        })))
    }
}

/// URI of a file named relative to the project directory.
pub(crate) fn changed_file_uri(project: &Path, file: &str) -> String {
    let path = Path::new(file);
    let full = if path.is_absolute() {
        path.to_path_buf()
    } else {
        project.join(path)
    };
    file_uri(&full.canonicalize().unwrap_or(full))
}
