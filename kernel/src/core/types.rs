//! Shared deterministic types for kernel core logic.
//!
//! These types define stable contracts between the runner, the status
//! reporter and the command surface. They must not depend on I/O.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Complete | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Step can be re-run as-is (e.g. interrupted by abort).
    Recoverable,
    /// Step source raised; needs an edit before it can succeed.
    Fatal,
}

/// Error recorded on a step. Absence (`None` on the step) means no error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Recoverable,
            message: message.into(),
        }
    }
}

/// Mode flags injected into every step namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecMode {
    pub is_testing: bool,
    pub is_interactive: bool,
    pub is_single_run: bool,
}

/// Progress indicator for the running step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub fraction: f64,
    pub message: Option<String>,
}

/// Reference to a step by name or zero-based position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepRef {
    Position(usize),
    Name(String),
}

impl StepRef {
    /// Interpret all-digit input as a position, anything else as a name.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<usize>() {
            Ok(position) => StepRef::Position(position),
            Err(_) => StepRef::Name(raw.to_string()),
        }
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepRef::Position(position) => write!(f, "#{position}"),
            StepRef::Name(name) => f.write_str(name),
        }
    }
}

/// Selection policy for a run request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScope {
    /// Execute exactly this step, dirty or not.
    Single(StepRef),
    /// This step and everything after it; clean steps are skipped.
    From(StepRef),
    /// Whole project; clean steps are skipped.
    All,
}

/// A library module currently held by the module registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadedModule {
    /// Dotted module name relative to its library root (`pkg.sub.leaf`).
    pub name: String,
    pub path: PathBuf,
}
