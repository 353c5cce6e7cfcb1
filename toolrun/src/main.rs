//! `toolrun`: run tools, interactive commands, and language-server queries
//! the way the coding-assistant backend does.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use toolrun::core::types::{FixIdentity, TaskState};
use toolrun::executor::TaskExecutor;
use toolrun::exit_codes;
use toolrun::io::config::{CONFIG_PATH, ExecutorConfig, load_config, write_config};
use toolrun::io::events::JsonLinesSink;
use toolrun::io::lsp::SessionManager;
use toolrun::io::plan_file::{PlanFilePlanner, load_plan};
use toolrun::io::pty::{InteractiveManager, SpawnRequest};
use toolrun::logging;
use toolrun::looping::{RunConfig, RunStop, run_loop};

#[derive(Parser)]
#[command(
    name = "toolrun",
    version,
    about = "Execution core for planned tool operations"
)]
struct Cli {
    /// Config file (default: `.toolrun/config.toml` under the working directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.toolrun/config.toml` with defaults.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one command on a PTY, streaming task events as JSON lines.
    Exec {
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Talk to the workspace's language server.
    Lsp {
        #[command(subcommand)]
        command: LspCommand,
    },
    /// Replay a JSON plan through the executor.
    Run {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum LspCommand {
    /// Send one request and print the result.
    Request {
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long)]
        method: String,
        /// JSON params (default `{}`).
        #[arg(long)]
        params: Option<String>,
    },
    /// Open a file and print the diagnostics the server publishes for it.
    Diagnostics {
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value_t = 2_000)]
        wait_ms: u64,
    },
}

/// Last line printed by `toolrun run`.
#[derive(Serialize)]
struct RunSummary<'a> {
    run_id: String,
    steps_executed: u32,
    #[serde(flatten)]
    stop: &'a RunStop,
    exhausted: &'a [FixIdentity],
}

#[tokio::main]
async fn main() {
    logging::init();
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => {
            cmd_init(&config_path(cli.config.as_deref(), &cwd), force)?;
            Ok(exit_codes::OK)
        }
        Command::Exec {
            timeout_secs,
            label,
            cwd: task_cwd,
            command,
        } => {
            let config = load_config(&config_path(cli.config.as_deref(), &cwd))?;
            let mut request = SpawnRequest::new(command).cwd(task_cwd.unwrap_or(cwd));
            request.timeout = timeout_secs.map(Duration::from_secs);
            request.label = label;
            cmd_exec(config, request).await
        }
        Command::Lsp { command } => {
            let config = load_config(&config_path(cli.config.as_deref(), &cwd))?;
            cmd_lsp(config, command).await?;
            Ok(exit_codes::OK)
        }
        Command::Run { plan, workspace } => {
            let workspace = workspace.unwrap_or(cwd);
            let config = load_config(&config_path(cli.config.as_deref(), &workspace))?;
            cmd_run(config, &plan, workspace).await
        }
    }
}

fn config_path(flag: Option<&Path>, base: &Path) -> PathBuf {
    flag.map_or_else(|| base.join(CONFIG_PATH), Path::to_path_buf)
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &ExecutorConfig::default())
}

async fn cmd_exec(config: ExecutorConfig, request: SpawnRequest) -> Result<i32> {
    let sink = Arc::new(JsonLinesSink::new(std::io::stdout()));
    let manager = InteractiveManager::new(config.interactive.clone(), sink);
    let task_id = manager.spawn(request)?;
    let result = manager.await_completion(task_id).await?;
    manager.shutdown_all().await;
    Ok(match result.state {
        TaskState::Success => exit_codes::OK,
        TaskState::Timeout => exit_codes::TASK_TIMEOUT,
        _ => exit_codes::TASK_FAILED,
    })
}

async fn cmd_lsp(config: ExecutorConfig, command: LspCommand) -> Result<()> {
    let sessions = SessionManager::from_config(config.lsp.clone());
    sessions.validate()?;
    let printed = lsp_query(&sessions, command).await;
    sessions.shutdown_all().await;
    let value = printed?;
    println!(
        "{}",
        serde_json::to_string_pretty(&value).context("serialize result")?
    );
    Ok(())
}

async fn lsp_query(sessions: &SessionManager, command: LspCommand) -> Result<Value> {
    match command {
        LspCommand::Request {
            workspace,
            method,
            params,
        } => {
            let params = match params {
                Some(raw) => serde_json::from_str(&raw).context("parse --params as JSON")?,
                None => serde_json::json!({}),
            };
            Ok(sessions
                .request(&workspace, &method, params, None)
                .await
                .with_context(|| format!("{method} request"))?)
        }
        LspCommand::Diagnostics {
            workspace,
            file,
            wait_ms,
        } => {
            let opened = sessions
                .open_document(&workspace, &file)
                .await
                .with_context(|| format!("open {}", file.display()))?;
            let diagnostics = opened
                .fresh_diagnostics(Duration::from_millis(wait_ms))
                .await;
            Ok(serde_json::json!({ "file": opened.uri, "diagnostics": diagnostics }))
        }
    }
}

async fn cmd_run(config: ExecutorConfig, plan_path: &Path, workspace: PathBuf) -> Result<i32> {
    let plan = load_plan(plan_path)?;
    let run_config = RunConfig {
        max_iterations: config.max_iterations,
        goal: plan.goal.clone(),
    };
    let mut planner = PlanFilePlanner::new(plan);
    let sink = Arc::new(JsonLinesSink::new(std::io::stdout()));
    let mut executor = TaskExecutor::from_config(config, workspace, sink);

    let outcome = run_loop(&mut planner, &mut executor, &run_config, |step| {
        match serde_json::to_string(step) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!(%err, "failed to serialize step report"),
        }
    })
    .await;
    executor.shutdown().await;
    let outcome = outcome?;

    let summary = RunSummary {
        run_id: outcome.run_id.to_string(),
        steps_executed: outcome.steps_executed,
        stop: &outcome.stop,
        exhausted: &outcome.exhausted,
    };
    println!(
        "{}",
        serde_json::to_string(&summary).context("serialize run summary")?
    );
    Ok(match outcome.stop {
        RunStop::IterationLimitExceeded { .. } => exit_codes::ITERATION_LIMIT,
        RunStop::Finished { .. } if !outcome.exhausted.is_empty() => exit_codes::TASK_FAILED,
        RunStop::Finished { .. } => exit_codes::OK,
    })
}
