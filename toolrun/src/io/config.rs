//! Executor configuration stored under `.toolrun/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::DEFAULT_MAX_ITERATIONS;
use crate::core::classifier::DEFAULT_SUMMARY_LIMIT_BYTES;
use crate::core::fix_cycle::DEFAULT_MAX_FIX_ATTEMPTS;

/// Default location of the config file, relative to the workspace root.
pub const CONFIG_PATH: &str = ".toolrun/config.toml";

/// Overrides `lsp.command` when set (whitespace separated).
pub const LSP_COMMAND_ENV: &str = "TOOLRUN_LSP_CMD";

/// Executor configuration (TOML).
///
/// Missing fields default to the values in [`Default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Planner/executor round trips allowed per run.
    pub max_iterations: u32,

    /// Failures per operation identity before retries stop.
    pub max_fix_attempts: u32,

    /// Truncate classified summaries beyond this many bytes.
    pub summary_limit_bytes: usize,

    pub interactive: InteractiveConfig,
    pub shell: ShellConfig,
    pub lsp: LspConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InteractiveConfig {
    /// Timeout applied when a spawn request does not carry one.
    pub default_timeout_secs: u64,
    /// Wait between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,
    /// Output retained per task for failure detail.
    pub output_tail_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellConfig {
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LspConfig {
    /// Language server command, spoken to over stdio.
    pub command: Vec<String>,
    pub request_timeout_ms: u64,
    pub initialize_timeout_ms: u64,
    /// How long `shutdown` waits before force-killing the server.
    pub shutdown_deadline_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_fix_attempts: DEFAULT_MAX_FIX_ATTEMPTS,
            summary_limit_bytes: DEFAULT_SUMMARY_LIMIT_BYTES,
            interactive: InteractiveConfig::default(),
            shell: ShellConfig::default(),
            lsp: LspConfig::default(),
        }
    }
}

impl Default for InteractiveConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 600,
            kill_grace_ms: 2_000,
            output_tail_bytes: 16_384,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "typescript-language-server".to_string(),
                "--stdio".to_string(),
            ],
            request_timeout_ms: 10_000,
            initialize_timeout_ms: 30_000,
            shutdown_deadline_ms: 5_000,
        }
    }
}

impl InteractiveConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl ShellConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl LspConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_fix_attempts == 0 {
            return Err(anyhow!("max_fix_attempts must be > 0"));
        }
        if self.summary_limit_bytes == 0 {
            return Err(anyhow!("summary_limit_bytes must be > 0"));
        }
        if self.interactive.default_timeout_secs == 0 {
            return Err(anyhow!("interactive.default_timeout_secs must be > 0"));
        }
        if self.interactive.output_tail_bytes == 0 {
            return Err(anyhow!("interactive.output_tail_bytes must be > 0"));
        }
        if self.shell.timeout_secs == 0 {
            return Err(anyhow!("shell.timeout_secs must be > 0"));
        }
        if self.shell.output_limit_bytes == 0 {
            return Err(anyhow!("shell.output_limit_bytes must be > 0"));
        }
        if self.lsp.command.is_empty() || self.lsp.command[0].trim().is_empty() {
            return Err(anyhow!("lsp.command must be a non-empty array"));
        }
        if self.lsp.request_timeout_ms == 0 || self.lsp.initialize_timeout_ms == 0 {
            return Err(anyhow!("lsp timeouts must be > 0"));
        }
        if self.lsp.shutdown_deadline_ms == 0 {
            return Err(anyhow!("lsp.shutdown_deadline_ms must be > 0"));
        }
        if self.interactive.kill_grace_ms == 0 {
            return Err(anyhow!("interactive.kill_grace_ms must be > 0"));
        }
        Ok(())
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(LSP_COMMAND_ENV) {
            let command: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
            if !command.is_empty() {
                self.lsp.command = command;
            }
        }
    }
}

/// Load config from a TOML file, then apply environment overrides.
///
/// If the file is missing, starts from `ExecutorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ExecutorConfig> {
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        ExecutorConfig::default()
    };
    cfg.apply_env(|key| std::env::var(key).ok());
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ExecutorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
