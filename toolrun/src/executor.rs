//! Task executor: dispatch one planned operation, classify it, track retries.
//!
//! One executor serves one run; its fix-cycle tracker lives as long as the run.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::classify_with_limit;
use crate::core::fix_cycle::{FixCycleTracker, FixState};
use crate::core::types::{
    FixIdentity, InfraKind, OperationRequest, Outcome, RawResult, TaskId,
};
use crate::error::{DispatchError, ProcessSpawnError, ProtocolError};
use crate::io::config::ExecutorConfig;
use crate::io::events::EventSink;
use crate::io::lsp::SessionManager;
use crate::io::pty::{InteractiveManager, SpawnRequest};
use crate::io::tools::{
    PROJECT_SUBDIRECTORY_ARG, Tool, ToolContext, ToolOutput, ToolRegistry, changed_file_uri,
    project_dir,
};

/// Argument keys that name a file an operation wrote.
const CHANGED_FILE_KEYS: &[&str] = &["path", "file_path", "file_path_in_repo", "file"];

/// Result of re-running a failed operation after a workspace change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub identity: FixIdentity,
    pub outcome: Outcome,
    pub fix_state: FixState,
}

/// Everything the run loop learns from one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub request: OperationRequest,
    pub identity: FixIdentity,
    pub outcome: Outcome,
    pub fix_state: FixState,
    /// The tool was not invoked because retries were already exhausted.
    pub skipped: bool,
    pub verifications: Vec<VerificationReport>,
    pub interactive_task: Option<TaskId>,
}

impl StepReport {
    pub fn exhausted(&self) -> bool {
        self.fix_state == FixState::Exhausted
    }
}

pub struct TaskExecutor {
    registry: ToolRegistry,
    interactive: Arc<InteractiveManager>,
    sessions: Arc<SessionManager>,
    config: Arc<ExecutorConfig>,
    workspace_root: PathBuf,
    tracker: FixCycleTracker,
}

impl TaskExecutor {
    pub fn new(
        config: ExecutorConfig,
        workspace_root: PathBuf,
        registry: ToolRegistry,
        interactive: Arc<InteractiveManager>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        let tracker = FixCycleTracker::new(config.max_fix_attempts);
        Self {
            registry,
            interactive,
            sessions,
            config: Arc::new(config),
            workspace_root,
            tracker,
        }
    }

    /// Built-in tools, a PTY manager reporting to `sink`, and stdio language servers.
    pub fn from_config(
        config: ExecutorConfig,
        workspace_root: PathBuf,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let interactive = Arc::new(InteractiveManager::new(config.interactive.clone(), sink));
        let sessions = Arc::new(SessionManager::from_config(config.lsp.clone()));
        Self::new(
            config,
            workspace_root,
            ToolRegistry::with_builtins(),
            interactive,
            sessions,
        )
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &FixCycleTracker {
        &self.tracker
    }

    pub fn interactive(&self) -> &Arc<InteractiveManager> {
        &self.interactive
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Forget all retry state, for a fresh run.
    pub fn begin_run(&mut self) {
        self.tracker = FixCycleTracker::new(self.config.max_fix_attempts);
    }

    /// Run one operation.
    ///
    /// Operation failures come back as data in the report. Only a request for
    /// a tool that does not exist is an error.
    #[instrument(skip_all, fields(tool = %request.tool))]
    pub async fn execute(&mut self, request: &OperationRequest) -> Result<StepReport, DispatchError> {
        let identity = request.fix_identity();

        if self.tracker.is_exhausted(&identity) {
            warn!(%identity, "retries exhausted, not invoking");
            let history = self.tracker.failure_history(&identity).join("\n---\n");
            return Ok(StepReport {
                request: request.clone(),
                outcome: Outcome::Failure {
                    summary: format!(
                        "{identity} failed {} times; not retried",
                        self.tracker.attempts(&identity)
                    ),
                    detail: history,
                },
                identity,
                fix_state: FixState::Exhausted,
                skipped: true,
                verifications: Vec::new(),
                interactive_task: None,
            });
        }

        let tool = self
            .registry
            .get(&request.tool)
            .ok_or_else(|| DispatchError::UnknownTool {
                name: request.tool.clone(),
            })?;

        let (outcome, interactive_task) = self.dispatch(tool.as_ref(), request).await;
        let fix_state = self.tracker.record_result(&identity, &outcome, request);
        info!(%identity, success = outcome.is_success(), ?fix_state, "operation classified");

        let mut verifications = Vec::new();
        if outcome.is_success() && tool.mutates_workspace() {
            self.notify_changed(request).await;
            self.tracker.arm_verifications();
            verifications = self.run_verifications(&identity).await;
        }

        Ok(StepReport {
            request: request.clone(),
            identity,
            outcome,
            fix_state,
            skipped: false,
            verifications,
            interactive_task,
        })
    }

    /// Re-run every other failing, non-exhausted operation.
    async fn run_verifications(&mut self, changed: &FixIdentity) -> Vec<VerificationReport> {
        let mut reports = Vec::new();
        for (identity, request) in self.tracker.pending_verifications() {
            if &identity == changed {
                continue;
            }
            let Some(tool) = self.registry.get(&request.tool) else {
                continue;
            };
            debug!(%identity, "re-running verification");
            let (outcome, _) = self.dispatch(tool.as_ref(), &request).await;
            let fix_state = self.tracker.record_verification(&identity, &outcome, &request);
            reports.push(VerificationReport {
                identity,
                outcome,
                fix_state,
            });
        }
        reports
    }

    async fn dispatch(&self, tool: &dyn Tool, request: &OperationRequest) -> (Outcome, Option<TaskId>) {
        let args = self.prepare_args(tool, request);
        let ctx = ToolContext {
            workspace_root: self.workspace_root.clone(),
            project_subdirectory: request.context.clone(),
            sessions: Arc::clone(&self.sessions),
            config: Arc::clone(&self.config),
        };

        let invoked = AssertUnwindSafe(tool.invoke(&ctx, &args))
            .catch_unwind()
            .await;
        let output = match invoked {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(tool = %request.tool, err = %format!("{err:#}"), "tool error");
                return (infrastructure_outcome(&err), None);
            }
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                warn!(tool = %request.tool, %detail, "tool panicked");
                return (
                    Outcome::InfrastructureError {
                        kind: InfraKind::Panic,
                        detail,
                    },
                    None,
                );
            }
        };

        let (raw, task) = match output {
            ToolOutput::Result(value) => (RawResult::Json(value), None),
            ToolOutput::Interactive(spawn) => match self.run_interactive(spawn).await {
                Ok((task_id, raw)) => (raw, Some(task_id)),
                Err(outcome) => return (outcome, None),
            },
        };
        (
            classify_with_limit(&request.tool, &raw, self.config.summary_limit_bytes),
            task,
        )
    }

    /// Spawn on the PTY manager and wait; one suspending call from here.
    async fn run_interactive(&self, spawn: SpawnRequest) -> Result<(TaskId, RawResult), Outcome> {
        let task_id = self.interactive.spawn(spawn).map_err(|err| {
            warn!(%err, "interactive spawn failed");
            Outcome::InfrastructureError {
                kind: InfraKind::Spawn,
                detail: err.to_string(),
            }
        })?;
        let result = self
            .interactive
            .await_completion(task_id)
            .await
            .map_err(|err| Outcome::InfrastructureError {
                kind: InfraKind::Tool,
                detail: err.to_string(),
            })?;
        self.interactive.reap(task_id);
        Ok((task_id, RawResult::Interactive(result)))
    }

    fn prepare_args(&self, tool: &dyn Tool, request: &OperationRequest) -> Value {
        let mut args = request.args.clone();
        if tool.needs_project_context()
            && let (Some(subdir), Value::Object(map)) = (&request.context, &mut args)
        {
            map.entry(PROJECT_SUBDIRECTORY_ARG)
                .or_insert_with(|| Value::String(subdir.clone()));
        }
        args
    }

    async fn notify_changed(&self, request: &OperationRequest) {
        let Some(file) = CHANGED_FILE_KEYS
            .iter()
            .find_map(|key| request.args.get(*key).and_then(Value::as_str))
        else {
            return;
        };
        let project = project_dir(&self.workspace_root, request.context.as_deref());
        let uri = changed_file_uri(&project, file);
        match self.sessions.notify_file_changed(&project, &uri).await {
            Ok(true) => debug!(%uri, "language server notified of change"),
            Ok(false) => {}
            Err(err) => warn!(%uri, %err, "failed to notify language server"),
        }
    }

    /// Stop every interactive task and language server this executor started.
    pub async fn shutdown(&self) {
        self.interactive.shutdown_all().await;
        self.sessions.shutdown_all().await;
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }
}

fn infrastructure_outcome(err: &anyhow::Error) -> Outcome {
    let kind = if err.downcast_ref::<ProcessSpawnError>().is_some() {
        InfraKind::Spawn
    } else if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
        match protocol {
            ProtocolError::Spawn(_) => InfraKind::Spawn,
            _ => InfraKind::Protocol,
        }
    } else {
        InfraKind::Tool
    };
    Outcome::InfrastructureError {
        kind,
        detail: format!("{err:#}"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "tool panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskState;
    use crate::test_support::{StaticResponse, StaticTool, TestWorkspace};
    use serde_json::json;

    fn executor(workspace: &TestWorkspace, tools: Vec<StaticTool>) -> TaskExecutor {
        let mut registry = ToolRegistry::with_builtins();
        for tool in tools {
            registry.register(tool);
        }
        workspace.executor(registry)
    }

    fn failing(name: &str) -> StaticTool {
        StaticTool::new(
            name,
            vec![StaticResponse::Value(json!({"ok": false, "message": "broken"}))],
        )
    }

    #[tokio::test]
    async fn unknown_tool_is_a_dispatch_error() {
        let workspace = TestWorkspace::new().expect("workspace");
        let mut exec = executor(&workspace, Vec::new());
        let err = exec
            .execute(&OperationRequest::new("nope", json!({})))
            .await
            .expect_err("unknown tool");
        assert!(matches!(err, DispatchError::UnknownTool { name } if name == "nope"));
    }

    #[tokio::test]
    async fn tool_error_and_panic_become_infrastructure_errors() {
        let workspace = TestWorkspace::new().expect("workspace");
        let mut exec = executor(
            &workspace,
            vec![
                StaticTool::new("erroring", vec![StaticResponse::Error("disk full".to_string())]),
                StaticTool::new("panicking", vec![StaticResponse::Panic("kaboom".to_string())]),
            ],
        );

        let report = exec
            .execute(&OperationRequest::new("erroring", json!({})))
            .await
            .expect("execute");
        assert_eq!(
            report.outcome,
            Outcome::InfrastructureError {
                kind: InfraKind::Tool,
                detail: "disk full".to_string()
            }
        );
        assert_eq!(report.fix_state, FixState::Failing(1));

        let report = exec
            .execute(&OperationRequest::new("panicking", json!({})))
            .await
            .expect("execute");
        assert_eq!(
            report.outcome,
            Outcome::InfrastructureError {
                kind: InfraKind::Panic,
                detail: "kaboom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn exhausted_identity_is_not_invoked_again() {
        let workspace = TestWorkspace::new().expect("workspace");
        let tool = Arc::new(failing("build"));
        let mut registry = ToolRegistry::new();
        registry.register_arc(Arc::clone(&tool) as Arc<dyn Tool>);
        let mut exec = workspace.executor(registry);

        let request = OperationRequest::new("build", json!({"target": "app"}));
        for expected in [FixState::Failing(1), FixState::Failing(2), FixState::Exhausted] {
            let report = exec.execute(&request).await.expect("execute");
            assert_eq!(report.fix_state, expected);
            assert!(!report.skipped);
        }

        let report = exec.execute(&request).await.expect("execute");
        assert!(report.skipped);
        assert!(report.exhausted());
        assert_eq!(tool.calls().len(), 3);
        let Outcome::Failure { summary, detail } = &report.outcome else {
            panic!("expected failure");
        };
        assert!(summary.contains("failed 3 times"));
        assert_eq!(detail.lines().filter(|line| *line == "broken").count(), 3);
        assert_eq!(exec.tracker().attempts(&request.fix_identity()), 3);
    }

    #[tokio::test]
    async fn successful_mutation_reruns_pending_verification() {
        let workspace = TestWorkspace::new().expect("workspace");
        let build = Arc::new(StaticTool::new(
            "build",
            vec![
                StaticResponse::Value(json!({"ok": false, "message": "type error"})),
                StaticResponse::Value(json!({"ok": true, "message": "built"})),
            ],
        ));
        let edit = Arc::new(
            StaticTool::new("edit", vec![StaticResponse::Value(json!({"ok": true}))]).mutating(),
        );
        let mut registry = ToolRegistry::new();
        registry.register_arc(Arc::clone(&build) as Arc<dyn Tool>);
        registry.register_arc(Arc::clone(&edit) as Arc<dyn Tool>);
        let mut exec = workspace.executor(registry);

        let build_req = OperationRequest::new("build", json!({}));
        let report = exec.execute(&build_req).await.expect("build");
        assert!(!report.outcome.is_success());
        assert!(exec.tracker().needs_verification(&build_req.fix_identity()));

        let report = exec
            .execute(&OperationRequest::new("edit", json!({"path": "src/a.ts"})))
            .await
            .expect("edit");
        assert_eq!(report.verifications.len(), 1);
        assert_eq!(report.verifications[0].identity, build_req.fix_identity());
        assert!(report.verifications[0].outcome.is_success());
        assert_eq!(report.verifications[0].fix_state, FixState::Clean);
        assert!(!exec.tracker().needs_verification(&build_req.fix_identity()));
        assert_eq!(build.calls().len(), 2);
    }

    #[tokio::test]
    async fn failed_verification_is_retried_after_next_mutation() {
        let workspace = TestWorkspace::new().expect("workspace");
        let build = Arc::new(StaticTool::new(
            "build",
            vec![
                StaticResponse::Value(json!({"ok": false, "message": "type error"})),
                StaticResponse::Value(json!({"ok": false, "message": "still broken"})),
                StaticResponse::Value(json!({"ok": true, "message": "built"})),
            ],
        ));
        let edit = Arc::new(
            StaticTool::new("edit", vec![StaticResponse::Value(json!({"ok": true}))]).mutating(),
        );
        let lookup = StaticTool::new("lookup", vec![StaticResponse::Value(json!({"ok": true}))]);
        let mut registry = ToolRegistry::new();
        registry.register_arc(Arc::clone(&build) as Arc<dyn Tool>);
        registry.register_arc(Arc::clone(&edit) as Arc<dyn Tool>);
        registry.register(lookup);
        let mut exec = workspace.executor(registry);
        let build_id = OperationRequest::new("build", json!({})).fix_identity();
        let edit_req = OperationRequest::new("edit", json!({"path": "src/a.ts"}));

        exec.execute(&OperationRequest::new("build", json!({}))).await.expect("build");
        let report = exec.execute(&edit_req).await.expect("first edit");
        assert_eq!(report.verifications[0].fix_state, FixState::Failing(2));
        assert!(!exec.tracker().needs_verification(&build_id));

        let report = exec
            .execute(&OperationRequest::new("lookup", json!({})))
            .await
            .expect("lookup");
        assert!(report.verifications.is_empty());
        assert_eq!(build.calls().len(), 2);

        let report = exec.execute(&edit_req).await.expect("second edit");
        assert_eq!(report.verifications.len(), 1);
        assert_eq!(report.verifications[0].fix_state, FixState::Clean);
        assert_eq!(build.calls().len(), 3);
    }

    #[tokio::test]
    async fn project_context_is_injected_for_code_intelligence_tools() {
        let workspace = TestWorkspace::new().expect("workspace");
        workspace.write("pkg/main.ts", "export const x = 1;\n").expect("write");
        let mut exec = executor(&workspace, Vec::new());
        let request = OperationRequest::new(
            "lsp_definition",
            json!({"file_path": "main.ts", "line": 0, "character": 13}),
        )
        .with_context("pkg");
        let report = exec.execute(&request).await.expect("execute");
        assert!(report.outcome.is_success(), "{:?}", report.outcome);
        assert!(exec.sessions().existing(&workspace.root().join("pkg")).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interactive_commands_suspend_until_finished() {
        let workspace = TestWorkspace::new().expect("workspace");
        let mut exec = executor(&workspace, Vec::new());
        let report = exec
            .execute(&OperationRequest::new(
                "run_interactive",
                json!({"command": "echo building; exit 1", "label": "build"}),
            ))
            .await
            .expect("execute");
        assert!(report.interactive_task.is_some());
        let Outcome::Failure { summary, detail } = &report.outcome else {
            panic!("expected failure, got {:?}", report.outcome);
        };
        assert!(summary.contains(&TaskState::Error.to_string()));
        assert!(summary.contains("exit code 1"));
        assert!(detail.contains("building"));
    }

    #[tokio::test]
    async fn missing_interactive_program_is_spawn_error() {
        let workspace = TestWorkspace::new().expect("workspace");
        let mut exec = executor(&workspace, Vec::new());
        let report = exec
            .execute(&OperationRequest::new(
                "run_interactive",
                json!({"command": ["no-such-binary-for-toolrun"]}),
            ))
            .await
            .expect("execute");
        assert!(matches!(
            report.outcome,
            Outcome::InfrastructureError { kind: InfraKind::Spawn, .. }
        ));
    }

    #[test]
    fn protocol_errors_map_to_protocol_kind() {
        let err = anyhow::Error::new(ProtocolError::SessionClosed).context("hover");
        assert!(matches!(
            infrastructure_outcome(&err),
            Outcome::InfrastructureError { kind: InfraKind::Protocol, .. }
        ));
        let err = anyhow::Error::new(ProtocolError::Spawn(ProcessSpawnError::EmptyCommand));
        assert!(matches!(
            infrastructure_outcome(&err),
            Outcome::InfrastructureError { kind: InfraKind::Spawn, .. }
        ));
    }
}
