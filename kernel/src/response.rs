//! Response envelope returned by every kernel command.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::types::RunStatus;
use crate::error::{KernelError, error_code};
use crate::exit_codes;
use crate::runner::RunOutcome;

pub const OK_CODE: &str = "OK";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub success: bool,
    /// `OK` or a machine-readable error code.
    pub code: String,
    pub message: String,
    /// Full error chain for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub data: Map<String, Value>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            code: OK_CODE.to_string(),
            message: message.into(),
            error: None,
            data: Map::new(),
        }
    }

    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            code: code.to_string(),
            error: Some(message.clone()),
            message,
            data: Map::new(),
        }
    }

    pub fn from_kernel_error(err: &KernelError) -> Self {
        Self::failure(err.code(), err.to_string())
    }

    pub fn from_error(err: &anyhow::Error) -> Self {
        let mut response = Self::failure(error_code(err), err.to_string());
        response.error = Some(format!("{err:#}"));
        response
    }

    /// Envelope for a finished run: successful only when it completed.
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        let mut response = match (&outcome.error, outcome.run_status) {
            (Some(err), _) => Self::from_kernel_error(err),
            (None, RunStatus::Complete) => Self::ok(format!(
                "run complete: {} updated, {} unchanged",
                outcome.executed.len(),
                outcome.skipped.len()
            )),
            (None, RunStatus::Aborted) => Self::from_kernel_error(&KernelError::Aborted),
            (None, _) => Self::failure(
                "USER_SOURCE_ERROR",
                format!("{} steps failed: {}", outcome.failed.len(), outcome.failed.join(", ")),
            ),
        };
        if let Ok(Value::Object(fields)) = serde_json::to_value(outcome) {
            response.data.extend(fields);
        }
        response
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.success
    }

    pub fn exit_code(&self) -> i32 {
        if self.success {
            exit_codes::OK
        } else {
            exit_codes::for_code(Some(&self.code))
        }
    }
}
