//! Load and persist `notebook.json` project definitions.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::io::atomic::{WriteRetry, write_with_retry};
use crate::io::clock;
use crate::notebook::{DEFINITION_FILE, Project, ProjectDefinition};

pub fn definition_path(project_dir: &Path) -> PathBuf {
    project_dir.join(DEFINITION_FILE)
}

/// Read a definition; a missing file yields the default (empty) definition.
pub fn load_definition(path: &Path) -> Result<ProjectDefinition> {
    if !path.exists() {
        debug!(path = %path.display(), "definition missing, using default");
        return Ok(ProjectDefinition::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read definition {}", path.display()))?;
    let definition: ProjectDefinition = serde_json::from_str(&contents)
        .with_context(|| format!("parse definition {}", path.display()))?;
    debug!(path = %path.display(), steps = definition.steps.len(), "definition loaded");
    Ok(definition)
}

/// Persist a definition with 2-space indentation and a trailing newline.
pub fn write_definition(path: &Path, definition: &ProjectDefinition, retry: WriteRetry) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(definition).context("serialize definition")?;
    buf.push('\n');
    write_with_retry(path, buf.as_bytes(), retry)
}

/// Open the project in `project_dir`.
pub fn open_project(project_dir: &Path, results_path: &Path) -> Result<Project> {
    let definition = load_definition(&definition_path(project_dir))?;
    Project::from_definition(project_dir, definition, results_path)
        .with_context(|| format!("build project {}", project_dir.display()))
}

pub fn save_project(project: &Project, retry: WriteRetry) -> Result<()> {
    write_definition(&definition_path(&project.directory), &project.definition(), retry)
}

/// Dirty every step whose source changed on disk after its last successful
/// run. Returns the names that flipped (cascade effects excluded).
pub fn mark_modified_sources(project: &mut Project) -> Vec<String> {
    let mut stale = Vec::new();
    for position in 0..project.steps().len() {
        let step = &project.steps()[position];
        let Some(last_modified) = step.last_modified else {
            continue;
        };
        let changed = clock::mtime(&step.source_path).is_some_and(|mtime| mtime >= last_modified);
        if changed && !step.dirty {
            stale.push(step.name().to_string());
            project.mark_dirty(position, true, false);
        }
    }
    stale
}
