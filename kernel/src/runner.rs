//! Step runner: executes the working set of a run request in project order.
//!
//! A step's artifact is written before the step is flagged clean, so an
//! interrupted or failed write always leaves the step dirty.

use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::abort::AbortSignal;
use crate::core::invariants::validate_invariants;
use crate::core::report::Report;
use crate::core::selector::{should_execute, working_set};
use crate::core::types::{ExecMode, Progress, RunScope, RunStatus, StepError, StepRef};
use crate::error::KernelError;
use crate::execution::RunLog;
use crate::io::clock;
use crate::io::executor::{ExecContext, StepFailure};
use crate::io::project_store;
use crate::io::results::{self, ResultsLayout};
use crate::notebook::{Project, Step};
use crate::reloader::{libraries_changed, reload_libraries};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub scope: RunScope,
    /// Execute clean steps too.
    pub force: bool,
    /// Keep going after a step fails.
    pub allow_failure: bool,
    pub mode: ExecMode,
    /// Maximum number of steps to execute.
    pub limit: Option<usize>,
}

impl RunRequest {
    pub fn new(scope: RunScope) -> Self {
        Self {
            scope,
            force: false,
            allow_failure: false,
            mode: ExecMode::default(),
            limit: None,
        }
    }
}

/// Handles shared between a run and whoever supervises it.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub abort: AbortSignal,
    pub log: RunLog,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_status: RunStatus,
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub reloaded: Vec<String>,
    #[serde(skip)]
    pub error: Option<KernelError>,
}

impl Default for RunOutcome {
    fn default() -> Self {
        Self {
            run_status: RunStatus::Running,
            executed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            reloaded: Vec::new(),
            error: None,
        }
    }
}

enum StepResult {
    Updated,
    Failed(String),
    Aborted,
}

/// Run `request` against the session. Typed kernel failures end the run
/// with a `Failed`/`Aborted` outcome; anything else is returned as an error
/// after the project state has been settled.
#[instrument(skip_all, fields(scope = ?request.scope, force = request.force))]
pub fn run(session: &Session, request: &RunRequest, control: &RunControl) -> Result<RunOutcome> {
    let _active = session.begin_run()?;
    let started = clock::now();
    {
        let mut project = session.project();
        project.run_status = RunStatus::Running;
        project.stop_condition.aborted = false;
    }

    let mut outcome = RunOutcome::default();
    if let Err(err) = execute(session, request, control, &mut outcome) {
        let Some(kind) = err.downcast_ref::<KernelError>() else {
            settle(session, RunStatus::Failed)?;
            return Err(err);
        };
        outcome.run_status = match kind {
            KernelError::Aborted => RunStatus::Aborted,
            _ => RunStatus::Failed,
        };
        control.log.push(format!("run stopped: {kind}"));
        outcome.error = Some(kind.clone());
    }
    if outcome.run_status == RunStatus::Aborted {
        control.log.push("run aborted");
    }

    settle(session, outcome.run_status)?;
    if outcome.run_status == RunStatus::Complete {
        session.record_successful_run(started);
    }
    info!(
        status = %outcome.run_status,
        executed = outcome.executed.len(),
        skipped = outcome.skipped.len(),
        failed = outcome.failed.len(),
        "run finished"
    );
    Ok(outcome)
}

fn settle(session: &Session, status: RunStatus) -> Result<()> {
    let mut project = session.project();
    project.run_status = status;
    project.stop_condition.aborted = status == RunStatus::Aborted;
    project.current_step = None;
    results::write_manifest(
        &ResultsLayout::for_project(&project),
        &project,
        session.config().write_retry(),
    )?;
    Ok(())
}

fn execute(
    session: &Session,
    request: &RunRequest,
    control: &RunControl,
    outcome: &mut RunOutcome,
) -> Result<()> {
    let names = {
        let mut project = session.project();
        let stale = project_store::mark_modified_sources(&mut project);
        if !stale.is_empty() {
            debug!(?stale, "step sources changed on disk");
        }
        let problems = validate_invariants(&project);
        if !problems.is_empty() {
            bail!("project state is inconsistent: {}", problems.join("; "));
        }
        working_set(&project, &request.scope)?
            .into_iter()
            .map(|position| project.steps()[position].name().to_string())
            .collect::<Vec<_>>()
    };

    let roots = session.library_roots();
    {
        let mut modules = session.modules();
        if libraries_changed(&**modules, &roots, session.last_successful_run()) {
            outcome.reloaded = reload_libraries(&mut **modules, &roots, session.reload_policy())?;
            control
                .log
                .push(format!("reloaded {} library modules", outcome.reloaded.len()));
        }
    }

    let mut remaining = request.limit;
    for name in names {
        if control.abort.is_aborted() {
            outcome.run_status = RunStatus::Aborted;
            return Ok(());
        }
        let position = {
            let project = session.project();
            let position = project.require_index(&StepRef::Name(name.clone()))?;
            if !should_execute(&project.steps()[position], &request.scope, request.force) {
                control.log.push(format!("[{name}]: nothing to update"));
                outcome.skipped.push(name);
                continue;
            }
            position
        };
        if let Some(left) = remaining.as_mut() {
            if *left == 0 {
                debug!(limit = ?request.limit, "step limit reached");
                break;
            }
            *left -= 1;
        }

        match run_step(session, position, request, control)? {
            StepResult::Updated => {
                control.log.push(format!("[{name}]: updated"));
                outcome.executed.push(name);
            }
            StepResult::Failed(message) => {
                control.log.push(format!("[{name}]: failed: {message}"));
                outcome.failed.push(name.clone());
                if !request.allow_failure {
                    return Err(KernelError::UserSource { step: name, message }.into());
                }
            }
            StepResult::Aborted => {
                control.log.push(format!("[{name}]: aborted"));
                outcome.run_status = RunStatus::Aborted;
                return Ok(());
            }
        }
    }

    outcome.run_status = if outcome.failed.is_empty() {
        RunStatus::Complete
    } else {
        RunStatus::Failed
    };
    Ok(())
}

fn step_mut(project: &mut Project, position: usize) -> Result<&mut Step, KernelError> {
    project
        .get_step_mut(&StepRef::Position(position))
        .ok_or_else(|| KernelError::StepNotFound(StepRef::Position(position).to_string()))
}

/// Leaves the step not running, without progress and detached from the
/// project's current step. Unless committed, the step also stays dirty.
struct RunningStepGuard<'a> {
    session: &'a Session,
    position: usize,
    committed: bool,
}

impl Drop for RunningStepGuard<'_> {
    fn drop(&mut self) {
        let mut project = self.session.project();
        project.current_step = None;
        if let Some(step) = project.get_step_mut(&StepRef::Position(self.position)) {
            step.is_running = false;
            step.progress = Progress::default();
            if !self.committed {
                step.dirty = true;
                step.end_time.get_or_insert_with(clock::now);
            }
        }
    }
}

struct Prepared {
    name: String,
    source_path: PathBuf,
    extension: String,
    project_dir: PathBuf,
    library_roots: Vec<PathBuf>,
    scratch_dir: PathBuf,
    layout: ResultsLayout,
}

fn prepare(session: &Session, position: usize) -> Result<Prepared> {
    let mut project = session.project();
    project.mark_downstream_dirty(position);
    let layout = ResultsLayout::for_project(&project);
    let project_dir = project.directory.clone();
    let library_roots = project
        .library_directories()
        .into_iter()
        .filter(|dir| dir.is_dir())
        .collect();
    let scratch_root = project.results_path.join("scratch");

    let step = step_mut(&mut project, position)?;
    step.is_running = true;
    step.dirty = true;
    step.report = Report::default();
    step.error = None;
    step.test_locals = None;
    step.progress = Progress::default();
    step.start_time = Some(clock::now());
    step.end_time = None;
    let prepared = Prepared {
        name: step.name().to_string(),
        source_path: step.source_path.clone(),
        extension: step.extension(),
        project_dir,
        library_roots,
        scratch_dir: scratch_root.join(step.uuid()),
        layout,
    };
    project.current_step = Some(prepared.name.clone());
    Ok(prepared)
}

#[instrument(skip_all, fields(position = position))]
fn run_step(
    session: &Session,
    position: usize,
    request: &RunRequest,
    control: &RunControl,
) -> Result<StepResult> {
    let prepared = prepare(session, position)?;
    let mut guard = RunningStepGuard {
        session,
        position,
        committed: false,
    };
    let capture = session.capture().attach(&prepared.name);
    debug!(step = %prepared.name, "step started");

    let mut report = Report::default();
    let files_dir = results::reset_step_files(&prepared.layout, &prepared.name)?;
    let (result, locals) = match session.executors().get(&prepared.extension) {
        None => (
            Err(StepFailure::Source(format!(
                "no executor for '.{}' steps",
                prepared.extension
            ))),
            None,
        ),
        Some(executor) => {
            let mut cache = session.cache();
            let mut modules = session.modules();
            modules.ensure_loaded(&prepared.library_roots)?;
            let mut ctx = ExecContext {
                step_name: &prepared.name,
                source_path: &prepared.source_path,
                project_dir: &prepared.project_dir,
                files_dir: &files_dir,
                scratch_dir: &prepared.scratch_dir,
                cache: &mut cache,
                report: &mut report,
                modules: &**modules,
                library_roots: &prepared.library_roots,
                renderer: session.renderer(),
                mode: request.mode,
                abort: &control.abort,
                capture: session.capture(),
            };
            let result = executor.execute(&mut ctx);
            let locals = request.mode.is_testing.then(|| cache.snapshot());
            (result, locals)
        }
    };
    drop(capture);

    let ended = clock::now();
    let retry = session.config().write_retry();
    match result {
        Ok(()) => {
            let data = {
                let mut project = session.project();
                let step = step_mut(&mut project, position)?;
                step.report = report;
                step.end_time = Some(ended);
                step.test_locals = locals;
                step.step_data(Some(ended))
            };
            results::write_step(&prepared.layout, &data, retry)?;
            {
                let mut project = session.project();
                let step = step_mut(&mut project, position)?;
                step.last_modified = Some(ended);
                step.dirty = false;
                project.last_modified = Some(ended);
            }
            guard.committed = true;
            debug!(step = %prepared.name, "step updated");
            Ok(StepResult::Updated)
        }
        Err(StepFailure::Source(message)) => {
            warn!(step = %prepared.name, %message, "step failed");
            let data = {
                let mut project = session.project();
                let step = step_mut(&mut project, position)?;
                step.report = report;
                step.error = Some(StepError::fatal(message.clone()));
                step.end_time = Some(ended);
                step.step_data(step.last_modified)
            };
            results::write_step(&prepared.layout, &data, retry)?;
            Ok(StepResult::Failed(message))
        }
        Err(StepFailure::Aborted) => {
            let mut project = session.project();
            let step = step_mut(&mut project, position)?;
            step.report = report;
            step.error = Some(StepError::recoverable("aborted"));
            step.end_time = Some(ended);
            Ok(StepResult::Aborted)
        }
        Err(StepFailure::Infrastructure(err)) => Err(err),
    }
}
