//! Results directory consumed by viewers.
//!
//! Layout under the project's output directory:
//!
//! ```text
//! <results>/reports/<uuid>/latest/
//!   project.json          manifest (snapshot + step order)
//!   steps/<name>.json     one artifact per step
//!   files/<name>/...      attachments written by a step
//!   assets/<folder>/...   copies of the project's asset folders
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::io::atomic::{WriteRetry, unchanged, write_with_retry};
use crate::notebook::{Project, ProjectSnapshot, StepData};

pub const MANIFEST_FILE: &str = "project.json";
pub const STEPS_DIR: &str = "steps";
pub const ASSETS_DIR: &str = "assets";
pub const FILES_DIR: &str = "files";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsLayout {
    pub output_dir: PathBuf,
}

impl ResultsLayout {
    pub fn for_project(project: &Project) -> Self {
        Self {
            output_dir: project.output_directory(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE)
    }

    pub fn steps_dir(&self) -> PathBuf {
        self.output_dir.join(STEPS_DIR)
    }

    pub fn step_path(&self, name: &str) -> PathBuf {
        self.steps_dir().join(format!("{name}.json"))
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.output_dir.join(ASSETS_DIR)
    }

    pub fn step_files_dir(&self, name: &str) -> PathBuf {
        self.output_dir.join(FILES_DIR).join(name)
    }
}

/// Project-level manifest.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest<'a> {
    pub project: &'a ProjectSnapshot,
    pub step_order: Vec<&'a str>,
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec_pretty(value).context("serialize results json")?;
    buf.push(b'\n');
    Ok(buf)
}

/// Write a step artifact. Returns `false` when the file already held the
/// same bytes and nothing was written.
#[instrument(skip_all, fields(step = %data.name))]
pub fn write_step(layout: &ResultsLayout, data: &StepData, retry: WriteRetry) -> Result<bool> {
    let path = layout.step_path(&data.name);
    let bytes = to_bytes(data)?;
    if unchanged(&path, &bytes) {
        debug!("step artifact unchanged");
        return Ok(false);
    }
    write_with_retry(&path, &bytes, retry)?;
    debug!(path = %path.display(), "step artifact written");
    Ok(true)
}

pub fn read_step(layout: &ResultsLayout, name: &str) -> Result<Option<StepData>> {
    let path = layout.step_path(name);
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let data: StepData =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(data))
}

/// Content hash recorded in the on-disk artifact, if any.
pub fn written_hash(layout: &ResultsLayout, name: &str) -> Option<String> {
    read_step(layout, name).ok().flatten().map(|d| d.content_hash)
}

/// Remove a step's artifact and its attachments.
pub fn remove_step(layout: &ResultsLayout, name: &str) -> Result<()> {
    let path = layout.step_path(name);
    if path.exists() {
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
    }
    let files = layout.step_files_dir(name);
    if files.exists() {
        fs::remove_dir_all(&files).with_context(|| format!("remove {}", files.display()))?;
    }
    Ok(())
}

/// Empty the step's attachments directory before it executes again.
pub fn reset_step_files(layout: &ResultsLayout, name: &str) -> Result<PathBuf> {
    let dir = layout.step_files_dir(name);
    if dir.exists() {
        fs::remove_dir_all(&dir).with_context(|| format!("clear {}", dir.display()))?;
    }
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(dir)
}

pub fn write_manifest(layout: &ResultsLayout, project: &Project, retry: WriteRetry) -> Result<bool> {
    let snapshot = project.kernel_serialize();
    let manifest = Manifest {
        project: &snapshot,
        step_order: snapshot.steps.iter().map(|s| s.name.as_str()).collect(),
    };
    let path = layout.manifest_path();
    let bytes = to_bytes(&manifest)?;
    if unchanged(&path, &bytes) {
        return Ok(false);
    }
    write_with_retry(&path, &bytes, retry)?;
    Ok(true)
}

/// Copy every asset folder into `<output>/assets/<folder>`.
pub fn copy_assets(layout: &ResultsLayout, asset_dirs: &[PathBuf]) -> Result<usize> {
    let mut copied = 0;
    for dir in asset_dirs {
        if !dir.is_dir() {
            continue;
        }
        let Some(folder) = dir.file_name() else {
            continue;
        };
        let target_root = layout.assets_dir().join(folder);
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .with_context(|| format!("relativize {}", entry.path().display()))?;
            let target = target_root.join(relative);
            copy_file(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::copy(from, to).with_context(|| format!("copy {} to {}", from.display(), to.display()))?;
    Ok(())
}

/// Recreate the output directory from scratch and rewrite every artifact.
#[instrument(skip_all, fields(project = %project.id))]
pub fn refresh(project: &Project, retry: WriteRetry) -> Result<ResultsLayout> {
    let layout = ResultsLayout::for_project(project);
    if layout.output_dir.exists() {
        fs::remove_dir_all(&layout.output_dir)
            .with_context(|| format!("remove {}", layout.output_dir.display()))?;
    }
    fs::create_dir_all(layout.steps_dir())
        .with_context(|| format!("create {}", layout.steps_dir().display()))?;
    for step in project.steps() {
        write_step(&layout, &step.step_data(step.last_modified), retry)?;
    }
    let assets = copy_assets(&layout, &project.asset_directories())?;
    write_manifest(&layout, project, retry)?;
    info!(steps = project.steps().len(), assets, "results refreshed");
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::Fragment;
    use crate::core::types::StepRef;
    use crate::notebook::{ProjectDefinition, StepDefinition};

    fn project_in(dir: &Path) -> Project {
        let definition = ProjectDefinition {
            steps: vec![StepDefinition::named("a.py"), StepDefinition::named("b.md")],
            ..ProjectDefinition::default()
        };
        Project::from_definition(dir, definition, &dir.join(".results")).expect("project")
    }

    /// Verifies a redundant write of an unchanged report leaves the file untouched.
    #[test]
    fn write_step_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut project = project_in(temp.path());
        let layout = ResultsLayout::for_project(&project);
        let step = project.get_step_mut(&StepRef::Position(0)).expect("step");
        step.report.append(Fragment::new("<p>hi</p>"), 1.0);
        let data = step.step_data(Some(2.0));

        assert!(write_step(&layout, &data, WriteRetry::default()).expect("first"));
        let first = fs::read(layout.step_path("a.py")).expect("read");
        assert!(!write_step(&layout, &data, WriteRetry::default()).expect("second"));
        let second = fs::read(layout.step_path("a.py")).expect("read");
        assert_eq!(first, second);
        assert_eq!(written_hash(&layout, "a.py"), Some(data.content_hash));
    }

    #[test]
    fn removing_a_step_drops_its_attachments() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = project_in(temp.path());
        let layout = ResultsLayout::for_project(&project);
        let files = reset_step_files(&layout, "a.py").expect("reset");
        fs::write(files.join("plot.svg"), "<svg/>").expect("attachment");

        let files = reset_step_files(&layout, "a.py").expect("reset again");
        assert!(files.is_dir());
        assert_eq!(fs::read_dir(&files).expect("list").count(), 0);

        remove_step(&layout, "a.py").expect("remove");
        assert!(!files.exists());
    }

    #[test]
    fn refresh_recreates_output_and_copies_assets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = project_in(temp.path());
        fs::create_dir_all(temp.path().join("assets/img")).expect("assets");
        fs::write(temp.path().join("assets/img/logo.svg"), "<svg/>").expect("asset");

        let layout = ResultsLayout::for_project(&project);
        fs::create_dir_all(&layout.output_dir).expect("output");
        fs::write(layout.output_dir.join("stale.txt"), "old").expect("stale");

        let layout = refresh(&project, WriteRetry::default()).expect("refresh");
        assert!(!layout.output_dir.join("stale.txt").exists());
        assert!(layout.step_path("a.py").exists());
        assert!(layout.step_path("b.md").exists());
        assert!(layout.manifest_path().exists());
        assert!(layout.assets_dir().join("assets/img/logo.svg").exists());

        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(layout.manifest_path()).expect("read"))
                .expect("parse");
        assert_eq!(manifest["step_order"], serde_json::json!(["a.py", "b.md"]));
    }
}
