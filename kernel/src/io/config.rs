//! Kernel configuration stored as `kernel.toml` in the project directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::{WriteRetry, write_atomic};

pub const CONFIG_FILE: &str = "kernel.toml";

/// Kernel configuration (TOML).
///
/// Missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelConfig {
    /// Results root; defaults to `<project>/.results`.
    pub results_dir: Option<PathBuf>,

    /// Where a remote client mirrors the project for synced execution;
    /// reported in project snapshots.
    pub remote_source_dir: Option<PathBuf>,

    /// Attempts for each report/project write before surfacing a failure.
    pub write_retry_count: u32,

    /// Fixed sleep between write attempts.
    pub write_retry_backoff_ms: u64,

    /// Whole-batch attempts for library reloads.
    pub reload_max_attempts: u32,

    pub reload_backoff_ms: u64,

    /// How long a second run request waits on an active run before it is blocked.
    pub busy_wait_ms: u64,

    /// How long dispatch joins a fresh run before answering `running`.
    pub dispatch_wait_ms: u64,

    /// How long `abort` waits for the run to observe the flag.
    pub abort_grace_ms: u64,

    /// Poll interval for abort checks inside child processes.
    pub abort_poll_ms: u64,

    /// Wall-clock limit for a single subprocess step.
    pub step_timeout_secs: u64,

    /// Truncate captured step stdout/stderr beyond this many bytes.
    pub executor_output_limit_bytes: usize,

    /// Interpreter command per source extension (e.g. `py = ["python3"]`).
    pub interpreters: BTreeMap<String, Vec<String>>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let mut interpreters = BTreeMap::new();
        interpreters.insert("py".to_string(), vec!["python3".to_string()]);
        interpreters.insert("sh".to_string(), vec!["sh".to_string()]);
        Self {
            results_dir: None,
            remote_source_dir: None,
            write_retry_count: 3,
            write_retry_backoff_ms: 200,
            reload_max_attempts: 3,
            reload_backoff_ms: 50,
            busy_wait_ms: 250,
            dispatch_wait_ms: 1250,
            abort_grace_ms: 1000,
            abort_poll_ms: 50,
            step_timeout_secs: 60 * 60,
            executor_output_limit_bytes: 1_000_000,
            interpreters,
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.write_retry_count == 0 {
            return Err(anyhow!("write_retry_count must be > 0"));
        }
        if self.reload_max_attempts == 0 {
            return Err(anyhow!("reload_max_attempts must be > 0"));
        }
        if self.abort_poll_ms == 0 {
            return Err(anyhow!("abort_poll_ms must be > 0"));
        }
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("step_timeout_secs must be > 0"));
        }
        if self.executor_output_limit_bytes == 0 {
            return Err(anyhow!("executor_output_limit_bytes must be > 0"));
        }
        for (ext, command) in &self.interpreters {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!("interpreters.{ext} must be a non-empty array"));
            }
        }
        Ok(())
    }

    pub fn write_retry(&self) -> WriteRetry {
        WriteRetry {
            attempts: self.write_retry_count,
            backoff: Duration::from_millis(self.write_retry_backoff_ms),
        }
    }

    pub fn results_path(&self, project_dir: &Path) -> PathBuf {
        match &self.results_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_dir.join(dir),
            None => project_dir.join(".results"),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KernelConfig::default()`.
pub fn load_config(path: &Path) -> Result<KernelConfig> {
    if !path.exists() {
        let cfg = KernelConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KernelConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &KernelConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
