//! Typed failure taxonomy surfaced to callers.
//!
//! Plumbing code returns `anyhow::Result`; these variants ride inside the
//! `anyhow::Error` and are recovered with `downcast_ref` at the command
//! surface so every response carries a stable machine-readable code.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    /// Step source raised while executing.
    #[error("step '{step}' failed: {message}")]
    UserSource { step: String, message: String },

    /// Library modules that never reloaded within the retry bound.
    #[error("library reload failed for: {}", modules.join(", "))]
    Reload { modules: Vec<String> },

    #[error("'{0}' is a reserved cache key")]
    ProtectedKey(String),

    /// A run is active and did not finish within the busy wait.
    #[error("action blocked: {0}")]
    ActionBlocked(String),

    #[error("write {} failed after {attempts} attempts: {message}", path.display())]
    Write {
        path: PathBuf,
        attempts: u32,
        message: String,
    },

    #[error("run aborted")]
    Aborted,

    #[error("no project is open")]
    NoProject,

    #[error("step '{0}' not found")]
    StepNotFound(String),

    /// Step names must be plain file names inside the project directory.
    #[error("invalid step name '{0}'")]
    InvalidStepName(String),

    /// A command line that does not parse.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl KernelError {
    pub fn code(&self) -> &'static str {
        match self {
            KernelError::UserSource { .. } => "USER_SOURCE_ERROR",
            KernelError::Reload { .. } => "RELOAD_FAILED",
            KernelError::ProtectedKey(_) => "PROTECTED_KEY",
            KernelError::ActionBlocked(_) => "ACTION_BLOCKED",
            KernelError::Write { .. } => "WRITE_FAILED",
            KernelError::Aborted => "ABORTED",
            KernelError::NoProject => "NO_PROJECT",
            KernelError::StepNotFound(_) => "STEP_NOT_FOUND",
            KernelError::InvalidStepName(_) => "INVALID_STEP_NAME",
            KernelError::InvalidCommand(_) => "INVALID_COMMAND",
        }
    }
}

/// Machine-readable code for any error, falling back to `INTERNAL_ERROR`.
pub fn error_code(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<KernelError>()
        .map_or("INTERNAL_ERROR", KernelError::code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn code_survives_added_context() {
        let err = Err::<(), _>(KernelError::ActionBlocked("run active".to_string()))
            .context("dispatch run")
            .unwrap_err();
        assert_eq!(error_code(&err), "ACTION_BLOCKED");
    }

    #[test]
    fn untyped_errors_map_to_internal() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(error_code(&err), "INTERNAL_ERROR");
    }

    #[test]
    fn reload_message_lists_modules() {
        let err = KernelError::Reload {
            modules: vec!["pkg.a".to_string(), "pkg.b".to_string()],
        };
        assert_eq!(err.to_string(), "library reload failed for: pkg.a, pkg.b");
    }
}
