//! Structural invariants of a project's step list.

use std::collections::HashSet;

use crate::notebook::Project;

/// Check project invariants:
/// - No duplicate step names
/// - Positions are contiguous from zero and match list order
/// - At most one step is running
pub fn validate_invariants(project: &Project) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, step) in project.steps().iter().enumerate() {
        if !seen.insert(step.name()) {
            errors.push(format!("duplicate step name '{}'", step.name()));
        }
        if step.position != index {
            errors.push(format!(
                "{}: position {} does not match order {}",
                step.name(),
                step.position,
                index
            ));
        }
    }

    let running: Vec<&str> = project
        .steps()
        .iter()
        .filter(|s| s.is_running)
        .map(|s| s.name())
        .collect();
    if running.len() > 1 {
        errors.push(format!("multiple running steps: {}", running.join(", ")));
    }

    errors
}
