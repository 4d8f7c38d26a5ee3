//! Working-set selection for run requests.

use crate::core::types::RunScope;
use crate::error::KernelError;
use crate::notebook::{Project, Step};

/// Positions a run request covers, in execution order.
///
/// Clean steps are included; [`should_execute`] decides whether each one
/// actually runs.
pub fn working_set(project: &Project, scope: &RunScope) -> Result<Vec<usize>, KernelError> {
    match scope {
        RunScope::Single(step) => Ok(vec![project.require_index(step)?]),
        RunScope::From(step) => {
            let start = project.require_index(step)?;
            Ok((start..project.steps().len()).collect())
        }
        RunScope::All => Ok((0..project.steps().len()).collect()),
    }
}

/// Single-step runs always execute; otherwise only dirty steps do unless forced.
pub fn should_execute(step: &Step, scope: &RunScope, force: bool) -> bool {
    matches!(scope, RunScope::Single(_)) || force || step.dirty
}

/// First dirty step in project order.
pub fn first_dirty(project: &Project) -> Option<&Step> {
    project.steps().iter().find(|s| s.dirty)
}
