//! End-to-end run loop scenarios against canned tools, real PTY tasks, and
//! the in-process language server.

use std::sync::Arc;

use serde_json::json;
use toolrun::core::fix_cycle::FixState;
use toolrun::core::types::{InfraKind, OperationRequest, Outcome};
use toolrun::io::tools::{Tool, ToolRegistry};
use toolrun::looping::{RunConfig, RunStop, run_loop};
use toolrun::planner::PlannerDecision;
use toolrun::test_support::{ScriptedPlanner, StaticResponse, StaticTool, TestWorkspace};

fn op(tool: &str, args: serde_json::Value) -> PlannerDecision {
    PlannerDecision::Operation(OperationRequest::new(tool, args))
}

#[tokio::test]
async fn edit_then_verify_clears_failing_check() {
    let workspace = TestWorkspace::new().expect("workspace");
    workspace.write("src/app.ts", "let x: number = 'a';\n").expect("write");

    let check = Arc::new(StaticTool::new(
        "check",
        vec![
            StaticResponse::Value(json!({"ok": false, "message": "type mismatch in src/app.ts"})),
            StaticResponse::Value(json!({"ok": true, "message": "clean"})),
        ],
    ));
    let edit = Arc::new(
        StaticTool::new("write_file", vec![StaticResponse::Value(json!({"ok": true, "message": "written"}))])
            .mutating(),
    );
    let mut registry = ToolRegistry::new();
    registry.register_arc(Arc::clone(&check) as Arc<dyn Tool>);
    registry.register_arc(Arc::clone(&edit) as Arc<dyn Tool>);
    let mut executor = workspace.executor(registry);

    let mut planner = ScriptedPlanner::new(vec![
        op("check", json!({"target": "app"})),
        op("write_file", json!({"path": "src/app.ts"})),
        PlannerDecision::Finish {
            summary: "fixed".to_string(),
        },
    ]);
    let outcome = run_loop(&mut planner, &mut executor, &RunConfig::default(), |_| {})
        .await
        .expect("run");

    assert_eq!(outcome.steps_executed, 2);
    assert_eq!(
        outcome.stop,
        RunStop::Finished {
            summary: "fixed".to_string()
        }
    );
    let edit_entry = &outcome.history.entries[1];
    assert_eq!(edit_entry.outcome.summary(), "written");
    assert_eq!(edit_entry.verifications.len(), 1);
    assert!(edit_entry.verifications[0].1.is_success());
    assert!(executor.tracker().pending_verifications().is_empty());
    assert_eq!(check.calls().len(), 2);

    // the planner saw the failure detail before choosing the edit
    assert!(planner.seen()[1].contains("type mismatch in src/app.ts"));
    executor.shutdown().await;
}

#[tokio::test]
async fn repeated_failures_exhaust_and_stop_invoking() {
    let workspace = TestWorkspace::new().expect("workspace");
    let flaky = Arc::new(StaticTool::new(
        "deploy",
        vec![StaticResponse::Error("connection refused".to_string())],
    ));
    let mut registry = ToolRegistry::new();
    registry.register_arc(Arc::clone(&flaky) as Arc<dyn Tool>);
    let mut executor = workspace.executor(registry);

    let mut planner = ScriptedPlanner::new(vec![op("deploy", json!({})); 5]);
    let outcome = run_loop(&mut planner, &mut executor, &RunConfig::default(), |_| {})
        .await
        .expect("run");

    assert_eq!(outcome.steps_executed, 5);
    assert_eq!(flaky.calls().len(), 3);
    let states: Vec<FixState> = outcome.history.entries.iter().map(|e| e.fix_state).collect();
    assert_eq!(
        states,
        vec![
            FixState::Failing(1),
            FixState::Failing(2),
            FixState::Exhausted,
            FixState::Exhausted,
            FixState::Exhausted,
        ]
    );
    assert!(matches!(
        outcome.history.entries[0].outcome,
        Outcome::InfrastructureError { kind: InfraKind::Tool, .. }
    ));
    assert!(outcome.history.entries[3].skipped);
    assert_eq!(outcome.exhausted.len(), 1);
    assert!(planner.seen()[3].contains("retries exhausted for deploy"));
}

#[tokio::test]
async fn panicking_tool_does_not_end_the_run() {
    let workspace = TestWorkspace::new().expect("workspace");
    let mut registry = ToolRegistry::new();
    registry.register(StaticTool::new(
        "explode",
        vec![StaticResponse::Panic("index out of bounds".to_string())],
    ));
    registry.register(StaticTool::new(
        "noop",
        vec![StaticResponse::Value(json!({"ok": true}))],
    ));
    let mut executor = workspace.executor(registry);

    let mut planner =
        ScriptedPlanner::new(vec![op("explode", json!({})), op("noop", json!({}))]);
    let outcome = run_loop(&mut planner, &mut executor, &RunConfig::default(), |_| {})
        .await
        .expect("run");

    assert_eq!(outcome.steps_executed, 2);
    assert_eq!(
        outcome.history.entries[0].outcome,
        Outcome::InfrastructureError {
            kind: InfraKind::Panic,
            detail: "index out of bounds".to_string()
        }
    );
    assert!(outcome.history.entries[1].outcome.is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interactive_and_language_server_tools_in_one_run() {
    let workspace = TestWorkspace::new().expect("workspace");
    workspace
        .write("web/src/index.ts", "export const answer = 42;\n")
        .expect("write");
    let mut executor = workspace.executor(ToolRegistry::with_builtins());

    let mut planner = ScriptedPlanner::new(vec![
        PlannerDecision::Operation(
            OperationRequest::new(
                "run_interactive",
                json!({"command": "printf 'compiled\\n'", "label": "compile"}),
            )
            .with_context("web"),
        ),
        PlannerDecision::Operation(
            OperationRequest::new(
                "get_diagnostics",
                json!({"file_path": "src/index.ts", "wait_ms": 2000}),
            )
            .with_context("web"),
        ),
    ]);
    let outcome = run_loop(&mut planner, &mut executor, &RunConfig::default(), |_| {})
        .await
        .expect("run");

    let compile = &outcome.history.entries[0].outcome;
    assert!(compile.summary().starts_with("Task 'compile' completed successfully"));
    assert!(executor.interactive().list().is_empty(), "finished tasks are reaped");

    let diagnostics = &outcome.history.entries[1].outcome;
    assert!(diagnostics.is_success(), "{diagnostics:?}");
    assert!(diagnostics.summary().contains("opened v1"));
    assert_eq!(executor.sessions().session_count(), 1);

    executor.shutdown().await;
    assert_eq!(executor.sessions().session_count(), 0);
}

#[tokio::test]
async fn builtin_write_file_reruns_failing_shell_check() {
    let workspace = TestWorkspace::new().expect("workspace");
    workspace.write("src/app.ts", "broken\n").expect("write");
    let mut executor = workspace.executor(ToolRegistry::with_builtins());

    let check = json!({"command": "grep -q fixed src/app.ts"});
    let mut planner = ScriptedPlanner::new(vec![
        op("run_shell", check.clone()),
        op("write_file", json!({"path": "src/app.ts", "content": "fixed\n"})),
    ]);
    let outcome = run_loop(&mut planner, &mut executor, &RunConfig::default(), |_| {})
        .await
        .expect("run");

    assert_eq!(outcome.steps_executed, 2);
    assert!(!outcome.history.entries[0].outcome.is_success());
    let write = &outcome.history.entries[1];
    assert!(write.outcome.is_success(), "{:?}", write.outcome);
    assert_eq!(write.verifications.len(), 1);
    assert_eq!(write.verifications[0].0.tool, "run_shell");
    assert!(write.verifications[0].1.is_success());
    assert!(executor.tracker().pending_verifications().is_empty());
    assert!(outcome.exhausted.is_empty());
    executor.shutdown().await;
}
