//! Notebook data model: steps, the project that orders them, and the
//! on-disk project definition.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::digest::short_hash;
use crate::core::report::Report;
use crate::core::types::{Progress, RunStatus, StepError, StepRef};
use crate::error::KernelError;

pub const DEFINITION_FILE: &str = "notebook.json";

fn default_library_folders() -> Vec<String> {
    vec!["libs".to_string()]
}

fn default_asset_folders() -> Vec<String> {
    vec!["assets".to_string()]
}

/// Contents of `notebook.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default = "default_library_folders")]
    pub library_folders: Vec<String>,
    #[serde(default = "default_asset_folders")]
    pub asset_folders: Vec<String>,
}

impl Default for ProjectDefinition {
    fn default() -> Self {
        Self {
            id: None,
            title: None,
            steps: Vec::new(),
            library_folders: default_library_folders(),
            asset_folders: default_asset_folders(),
        }
    }
}

/// Reject names that are not a single plain file name, so step sources
/// and artifacts always stay inside the project and results directories.
pub fn validate_step_name(name: &str) -> Result<(), KernelError> {
    let mut components = Path::new(name).components();
    let plain = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !plain || name.contains(['/', '\\']) {
        return Err(KernelError::InvalidStepName(name.to_string()));
    }
    Ok(())
}

/// One entry of the definition's `steps` list.
///
/// Written as a bare file name unless it carries extra attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StepEntry", into = "StepEntry")]
pub struct StepDefinition {
    pub name: String,
    pub title: Option<String>,
    pub extra: Map<String, Value>,
}

impl StepDefinition {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            extra: Map::new(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StepEntry {
    Name(String),
    Full {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl From<StepEntry> for StepDefinition {
    fn from(entry: StepEntry) -> Self {
        match entry {
            StepEntry::Name(name) => StepDefinition::named(name),
            StepEntry::Full { name, title, extra } => StepDefinition { name, title, extra },
        }
    }
}

impl From<StepDefinition> for StepEntry {
    fn from(def: StepDefinition) -> Self {
        if def.title.is_none() && def.extra.is_empty() {
            StepEntry::Name(def.name)
        } else {
            StepEntry::Full {
                name: def.name,
                title: def.title,
                extra: def.extra,
            }
        }
    }
}

/// Compact per-step status used in listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub name: String,
    pub dirty: bool,
    pub run: bool,
    pub error: bool,
    pub last_modified: Option<f64>,
    pub last_display_update: Option<f64>,
}

/// Serialized step artifact written to the results directory.
///
/// Contains no run flags so redundant writes of an unchanged report are
/// byte-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    pub name: String,
    pub uuid: String,
    pub position: usize,
    pub title: Option<String>,
    pub has_error: bool,
    pub error: Option<StepError>,
    pub body: Vec<String>,
    pub includes: Vec<String>,
    pub files: Vec<String>,
    pub stdout: String,
    pub last_modified: Option<f64>,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub definition: StepDefinition,
    pub position: usize,
    pub source_path: PathBuf,
    pub dirty: bool,
    pub is_running: bool,
    /// Epoch seconds of the last successful run.
    pub last_modified: Option<f64>,
    pub report: Report,
    pub error: Option<StepError>,
    pub test_locals: Option<Map<String, Value>>,
    pub progress: Progress,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
}

impl Step {
    pub fn new(definition: StepDefinition, position: usize, source_directory: &Path) -> Self {
        let source_path = source_directory.join(&definition.name);
        Self {
            definition,
            position,
            source_path,
            dirty: true,
            is_running: false,
            last_modified: None,
            report: Report::default(),
            error: None,
            test_locals: None,
            progress: Progress::default(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn uuid(&self) -> String {
        short_hash(&self.source_path.to_string_lossy())
    }

    /// Lowercased source extension used to pick an executor.
    pub fn extension(&self) -> String {
        self.source_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default()
    }

    pub fn elapsed(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).max(0.0)),
            _ => None,
        }
    }

    /// Latest of display update and successful run times.
    pub fn last_update(&self) -> Option<f64> {
        match (self.report.last_update_time, self.last_modified) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn status(&self) -> StepStatus {
        StepStatus {
            name: self.name().to_string(),
            dirty: self.dirty,
            run: self.is_running,
            error: self.error.is_some(),
            last_modified: self.last_modified,
            last_display_update: self.report.last_update_time,
        }
    }

    /// Artifact for the current report, stamped with `last_modified`.
    pub fn step_data(&self, last_modified: Option<f64>) -> StepData {
        StepData {
            name: self.name().to_string(),
            uuid: self.uuid(),
            position: self.position,
            title: self.definition.title.clone(),
            has_error: self.error.is_some(),
            error: self.error.clone(),
            body: self.report.body.clone(),
            includes: self.report.includes.clone(),
            files: self.report.files.clone(),
            stdout: self.report.stdout.clone(),
            last_modified,
            content_hash: self.report.content_hash(),
        }
    }

    fn summary(&self) -> StepSummary {
        StepSummary {
            name: self.name().to_string(),
            title: self.definition.title.clone(),
            uuid: self.uuid(),
            position: self.position,
            dirty: self.dirty,
            run: self.is_running,
            error: self.error.clone(),
            last_modified: self.last_modified,
            progress: self.progress.clone(),
            elapsed: self.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StopCondition {
    pub aborted: bool,
    pub halt: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    pub name: String,
    pub title: Option<String>,
    pub uuid: String,
    pub position: usize,
    pub dirty: bool,
    pub run: bool,
    pub error: Option<StepError>,
    pub last_modified: Option<f64>,
    pub progress: Progress,
    pub elapsed: Option<f64>,
}

/// Side-effect-free snapshot handed to viewers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectSnapshot {
    pub id: String,
    pub uuid: String,
    pub title: Option<String>,
    pub source_directory: String,
    pub remote_source_directory: Option<String>,
    pub output_directory: String,
    pub run_status: RunStatus,
    pub current_step: Option<String>,
    pub stop_condition: StopCondition,
    pub last_modified: Option<f64>,
    pub steps: Vec<StepSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: String,
    pub title: Option<String>,
    pub uuid: String,
    pub directory: PathBuf,
    pub library_folders: Vec<String>,
    pub asset_folders: Vec<String>,
    pub results_path: PathBuf,
    pub remote_source_directory: Option<PathBuf>,
    pub current_step: Option<String>,
    pub run_status: RunStatus,
    pub stop_condition: StopCondition,
    pub last_modified: Option<f64>,
    steps: Vec<Step>,
}

impl Project {
    /// Build a project from its definition; every step starts dirty.
    pub fn from_definition(
        directory: &Path,
        definition: ProjectDefinition,
        results_path: &Path,
    ) -> Result<Self> {
        let id = match definition.id {
            Some(id) => id,
            None => directory
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string()),
        };
        let mut project = Self {
            id,
            title: definition.title,
            uuid: short_hash(&directory.to_string_lossy()),
            directory: directory.to_path_buf(),
            library_folders: definition.library_folders,
            asset_folders: definition.asset_folders,
            results_path: results_path.to_path_buf(),
            remote_source_directory: None,
            current_step: None,
            run_status: RunStatus::Pending,
            stop_condition: StopCondition::default(),
            last_modified: None,
            steps: Vec::new(),
        };
        for step in definition.steps {
            project.add_step(step, None)?;
        }
        Ok(project)
    }

    pub fn definition(&self) -> ProjectDefinition {
        ProjectDefinition {
            id: Some(self.id.clone()),
            title: self.title.clone(),
            steps: self.steps.iter().map(|s| s.definition.clone()).collect(),
            library_folders: self.library_folders.clone(),
            asset_folders: self.asset_folders.clone(),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn index_of(&self, step: &StepRef) -> Option<usize> {
        match step {
            StepRef::Position(position) => (*position < self.steps.len()).then_some(*position),
            StepRef::Name(name) => self.steps.iter().position(|s| s.name() == name),
        }
    }

    pub fn get_step(&self, step: &StepRef) -> Option<&Step> {
        let index = self.index_of(step)?;
        self.steps.get(index)
    }

    pub fn get_step_mut(&mut self, step: &StepRef) -> Option<&mut Step> {
        let index = self.index_of(step)?;
        self.steps.get_mut(index)
    }

    /// Resolve `step` or fail with `StepNotFound`.
    pub fn require_index(&self, step: &StepRef) -> Result<usize, KernelError> {
        self.index_of(step)
            .ok_or_else(|| KernelError::StepNotFound(step.to_string()))
    }

    /// Every step strictly after `position`.
    pub fn steps_after(&self, position: usize) -> &[Step] {
        self.steps.get(position + 1..).unwrap_or(&[])
    }

    /// Insert a step at `index` (append when `None`).
    ///
    /// The new step and everything after it are dirty.
    pub fn add_step(&mut self, definition: StepDefinition, index: Option<usize>) -> Result<usize> {
        validate_step_name(&definition.name)?;
        if self.steps.iter().any(|s| s.name() == definition.name) {
            bail!("step '{}' already exists", definition.name);
        }
        let index = index.unwrap_or(self.steps.len()).min(self.steps.len());
        let step = Step::new(definition, index, &self.directory);
        self.steps.insert(index, step);
        self.reindex();
        self.mark_dirty(index, true, true);
        Ok(index)
    }

    /// Remove a step; the remainder is re-indexed and everything that
    /// followed it becomes dirty.
    pub fn remove_step(&mut self, name: &str) -> Result<Step, KernelError> {
        let index = self.require_index(&StepRef::Name(name.to_string()))?;
        let removed = self.steps.remove(index);
        self.reindex();
        if index < self.steps.len() {
            self.mark_dirty(index, true, true);
        }
        Ok(removed)
    }

    /// Move a step to `index`; dirties from the earlier of the two positions.
    pub fn move_step(&mut self, name: &str, index: usize) -> Result<(), KernelError> {
        let from = self.require_index(&StepRef::Name(name.to_string()))?;
        let to = index.min(self.steps.len().saturating_sub(1));
        if from == to {
            return Ok(());
        }
        let step = self.steps.remove(from);
        self.steps.insert(to, step);
        self.reindex();
        self.mark_dirty(from.min(to), true, true);
        Ok(())
    }

    fn reindex(&mut self) {
        for (position, step) in self.steps.iter_mut().enumerate() {
            step.position = position;
        }
    }

    /// Set the dirty flag of the step at `position`.
    ///
    /// Without `force` a step already in the requested state keeps its flag.
    /// Marking dirty always cascades to every later step. Returns whether any
    /// flag changed.
    pub fn mark_dirty(&mut self, position: usize, is_dirty: bool, force: bool) -> bool {
        let Some(step) = self.steps.get_mut(position) else {
            return false;
        };
        let mut changed = false;
        if force || step.dirty != is_dirty {
            changed = step.dirty != is_dirty;
            step.dirty = is_dirty;
        }
        if is_dirty {
            changed |= self.mark_downstream_dirty(position);
        }
        changed
    }

    /// Dirty every step after `position`. Returns whether any flag changed.
    pub fn mark_downstream_dirty(&mut self, position: usize) -> bool {
        let mut changed = false;
        for step in self.steps.iter_mut().skip(position + 1) {
            changed |= !step.dirty;
            step.dirty = true;
        }
        changed
    }

    /// Rebuild the step list from `definition`, reusing steps whose
    /// definitions are unchanged. The first new or changed step and
    /// everything after it become dirty; `force` dirties everything.
    ///
    /// A definition naming an invalid step is rejected as a whole.
    pub fn refresh(
        &mut self,
        definition: ProjectDefinition,
        force: bool,
    ) -> Result<bool, KernelError> {
        for step in &definition.steps {
            validate_step_name(&step.name)?;
        }
        let mut old: Vec<Step> = std::mem::take(&mut self.steps);
        let mut first_changed: Option<usize> = None;
        for (position, def) in definition.steps.into_iter().enumerate() {
            let reused = old
                .iter()
                .position(|s| s.definition == def)
                .map(|index| old.remove(index));
            let step = match reused {
                Some(mut step) => {
                    if step.position != position && first_changed.is_none() {
                        first_changed = Some(position);
                    }
                    step.position = position;
                    step
                }
                None => {
                    first_changed.get_or_insert(position);
                    Step::new(def, position, &self.directory)
                }
            };
            self.steps.push(step);
        }
        let removed_any = !old.is_empty();
        if let Some(title) = definition.title {
            self.title = Some(title);
        }
        if let Some(id) = definition.id {
            self.id = id;
        }
        self.library_folders = definition.library_folders;
        self.asset_folders = definition.asset_folders;

        if force {
            for position in 0..self.steps.len() {
                self.mark_dirty(position, true, true);
            }
            return Ok(true);
        }
        if removed_any && first_changed.is_none() {
            // A removal with identical survivors still shifts shared state.
            first_changed = Some(0);
        }
        match first_changed {
            Some(position) => {
                self.mark_dirty(position, true, true);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn library_directories(&self) -> Vec<PathBuf> {
        self.library_folders
            .iter()
            .map(|folder| self.directory.join(folder))
            .collect()
    }

    pub fn asset_directories(&self) -> Vec<PathBuf> {
        self.asset_folders
            .iter()
            .map(|folder| self.directory.join(folder))
            .collect()
    }

    /// `<results>/reports/<uuid>/latest`.
    pub fn output_directory(&self) -> PathBuf {
        self.results_path
            .join("reports")
            .join(&self.uuid)
            .join("latest")
    }

    pub fn kernel_serialize(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            id: self.id.clone(),
            uuid: self.uuid.clone(),
            title: self.title.clone(),
            source_directory: self.directory.to_string_lossy().into_owned(),
            remote_source_directory: self
                .remote_source_directory
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            output_directory: self.output_directory().to_string_lossy().into_owned(),
            run_status: self.run_status,
            current_step: self.current_step.clone(),
            stop_condition: self.stop_condition,
            last_modified: self.last_modified,
            steps: self.steps.iter().map(Step::summary).collect(),
        }
    }
}
