//! Command surface: parses command lines and drives the open session.
//!
//! Runs execute on the command queue's worker thread; every other command
//! runs inline and is rejected while a run is active. Every command answers
//! with a [`Response`], never a bare error.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::abort::AbortSignal;
use crate::core::selector::first_dirty;
use crate::core::types::{ExecMode, RunScope, RunStatus, StepRef};
use crate::error::KernelError;
use crate::execution::{AbortOutcome, CommandQueue, Dispatch, QueueTimings, RunLog, RunState};
use crate::io::config::KernelConfig;
use crate::io::sync::ChunkWrite;
use crate::notebook::{Step, StepDefinition, StepStatus};
use crate::response::Response;
use crate::runner::{self, RunControl, RunOutcome, RunRequest};
use crate::session::Session;
use crate::status::{StatusEnvelope, get_status};

#[derive(Debug, Parser)]
#[command(name = "kernel", no_binary_name = true, disable_help_subcommand = true)]
struct CommandLine {
    #[command(subcommand)]
    command: KernelCommand,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum KernelCommand {
    /// Open a project directory, replacing any open project.
    Open { path: PathBuf },
    /// Close the open project and clear its shared cache.
    Close,
    /// Run steps. Without step names every dirty step runs in order.
    Run {
        /// Steps by name or zero-based position; each runs on its own.
        steps: Vec<String>,
        /// Run clean steps too.
        #[arg(long)]
        force: bool,
        /// Run from the first named step to the end.
        #[arg(long = "continue")]
        continue_run: bool,
        /// Run only the first dirty step.
        #[arg(long)]
        single: bool,
        /// Stop after this many steps executed.
        #[arg(long)]
        limit: Option<usize>,
        /// Keep going after a step fails.
        #[arg(long)]
        allow_failure: bool,
        /// Expose the testing flag and record test locals.
        #[arg(long)]
        testing: bool,
    },
    /// Add a step (creating an empty source file if missing).
    AddStep {
        name: String,
        #[arg(long)]
        index: Option<usize>,
        #[arg(long)]
        title: Option<String>,
    },
    /// Remove a step and its source file.
    RemoveStep {
        name: String,
        /// Keep the source file on disk.
        #[arg(long)]
        keep_file: bool,
    },
    MoveStep { name: String, index: usize },
    /// Reload the project definition and recreate the results directory.
    Refresh {
        #[arg(long)]
        force: bool,
    },
    Status {
        /// Only report steps updated after this epoch time.
        #[arg(long)]
        since: Option<f64>,
        /// Return a hash that never matches a previous one.
        #[arg(long)]
        force: bool,
    },
    /// Abort the active run.
    Abort,
}

impl KernelCommand {
    /// Parse a whitespace-separated command line such as `run a.py --force`.
    pub fn parse_line(line: &str) -> Result<Self, KernelError> {
        CommandLine::try_parse_from(line.split_whitespace())
            .map(|cli| cli.command)
            .map_err(|err| KernelError::InvalidCommand(err.to_string().trim_end().to_string()))
    }
}

/// Scopes for a `run` command, executed in order.
fn run_scopes(session: &Session, steps: &[String], continue_run: bool, single: bool) -> Vec<RunScope> {
    if steps.is_empty() {
        if !single {
            return vec![RunScope::All];
        }
        let project = session.project();
        return first_dirty(&project)
            .map(|step| RunScope::Single(StepRef::Name(step.name().to_string())))
            .into_iter()
            .collect();
    }
    let refs = steps.iter().map(|raw| StepRef::parse(raw));
    if continue_run {
        return refs.take(1).map(RunScope::From).collect();
    }
    refs.map(RunScope::Single).collect()
}

fn merge_outcome(total: &mut RunOutcome, next: RunOutcome) {
    total.run_status = next.run_status;
    total.executed.extend(next.executed);
    total.skipped.extend(next.skipped);
    total.failed.extend(next.failed);
    total.reloaded.extend(next.reloaded);
    total.error = next.error;
}

pub struct Kernel {
    config: KernelConfig,
    session: RwLock<Option<Arc<Session>>>,
    queue: CommandQueue<Response>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let timings = QueueTimings {
            busy_wait: Duration::from_millis(config.busy_wait_ms),
            dispatch_wait: Duration::from_millis(config.dispatch_wait_ms),
            abort_grace: Duration::from_millis(config.abort_grace_ms),
        };
        Self {
            config,
            session: RwLock::new(None),
            queue: CommandQueue::new(timings),
        }
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_session(&self) -> Result<Arc<Session>, KernelError> {
        self.session().ok_or(KernelError::NoProject)
    }

    fn ensure_no_run(&self) -> Result<(), KernelError> {
        if self.queue.is_busy() {
            return Err(KernelError::ActionBlocked(
                "a run is in progress".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and execute one command line.
    pub fn execute(&self, line: &str) -> Response {
        match KernelCommand::parse_line(line) {
            Ok(command) => self.dispatch(command),
            Err(err) => Response::from_kernel_error(&err),
        }
    }

    #[instrument(skip_all, fields(command = ?command))]
    pub fn dispatch(&self, command: KernelCommand) -> Response {
        let result = match command {
            KernelCommand::Open { path } => self.open(&path),
            KernelCommand::Close => self.close(),
            KernelCommand::Run {
                steps,
                force,
                continue_run,
                single,
                limit,
                allow_failure,
                testing,
            } => {
                let options = RunOptions {
                    force,
                    allow_failure,
                    limit,
                    testing,
                };
                return self.run(&steps, continue_run, single, options);
            }
            KernelCommand::AddStep { name, index, title } => self.add_step(name, index, title),
            KernelCommand::RemoveStep { name, keep_file } => self.remove_step(&name, keep_file),
            KernelCommand::MoveStep { name, index } => self.move_step(&name, index),
            KernelCommand::Refresh { force } => self.refresh(force),
            KernelCommand::Status { since, force } => self.status_response(since, force),
            KernelCommand::Abort => Ok(self.abort()),
        };
        result.unwrap_or_else(|err| {
            debug!(err = %format!("{err:#}"), "command failed");
            Response::from_error(&err)
        })
    }

    pub fn open(&self, path: &Path) -> Result<Response> {
        self.ensure_no_run()?;
        let session = Session::open(path, self.config.clone())?;
        let (id, steps) = {
            let project = session.project();
            (project.id.clone(), project.step_names())
        };
        let previous = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::new(session));
        if let Some(previous) = previous {
            previous.close()?;
        }
        info!(project = %id, "project open");
        Ok(Response::ok(format!("opened {id}"))
            .with_data("project", id)
            .with_data("steps", steps))
    }

    pub fn close(&self) -> Result<Response> {
        self.ensure_no_run()?;
        let previous = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match previous {
            Some(session) => {
                session.close()?;
                Ok(Response::ok("project closed"))
            }
            None => Ok(Response::ok("no project open")),
        }
    }

    fn run(&self, steps: &[String], continue_run: bool, single: bool, options: RunOptions) -> Response {
        let session = match self.require_session() {
            Ok(session) => session,
            Err(err) => return Response::from_kernel_error(&err),
        };
        let requests: Vec<RunRequest> = run_scopes(&session, steps, continue_run, single)
            .into_iter()
            .map(|scope| RunRequest {
                mode: ExecMode {
                    is_testing: options.testing,
                    is_interactive: false,
                    is_single_run: matches!(scope, RunScope::Single(_)),
                },
                scope,
                force: options.force,
                allow_failure: options.allow_failure,
                limit: options.limit,
            })
            .collect();

        let work = move |abort: &AbortSignal, log: &RunLog| {
            let control = RunControl {
                abort: abort.clone(),
                log: log.clone(),
            };
            let mut total = RunOutcome {
                run_status: RunStatus::Complete,
                ..RunOutcome::default()
            };
            for request in &requests {
                match runner::run(&session, request, &control) {
                    Ok(outcome) => merge_outcome(&mut total, outcome),
                    Err(err) => return Response::from_error(&err),
                }
                if total.run_status != RunStatus::Complete {
                    break;
                }
            }
            Response::from_outcome(&total)
        };

        match self.queue.dispatch(work) {
            Ok(Dispatch::Complete {
                run_uid,
                result,
                log,
            }) => result
                .unwrap_or_else(|| {
                    Response::failure("INTERNAL_ERROR", "run ended without a result")
                })
                .with_data("run_uid", run_uid)
                .with_data("log", log)
                .with_data("running", false),
            Ok(Dispatch::Running { run_uid, log }) => Response::ok("run in progress")
                .with_data("run_uid", run_uid)
                .with_data("log", log)
                .with_data("running", true),
            Err(err) => Response::from_error(&err),
        }
    }

    /// Block until the active run finishes or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Option<Response> {
        self.queue.wait(timeout)
    }

    /// Liveness and log lines of the most recent run.
    pub fn run_state(&self, run_uid: Option<&str>) -> Option<RunState> {
        self.queue.poll(run_uid)
    }

    fn add_step(&self, name: String, index: Option<usize>, title: Option<String>) -> Result<Response> {
        self.ensure_no_run()?;
        let session = self.require_session()?;
        let definition = StepDefinition {
            title,
            ..StepDefinition::named(name.clone())
        };
        let position = session.add_step(definition, index)?;
        Ok(Response::ok(format!("added {name}")).with_data("position", position))
    }

    fn remove_step(&self, name: &str, keep_file: bool) -> Result<Response> {
        self.ensure_no_run()?;
        let session = self.require_session()?;
        session.remove_step(name, keep_file)?;
        Ok(Response::ok(format!("removed {name}")).with_data("keep_file", keep_file))
    }

    fn move_step(&self, name: &str, index: usize) -> Result<Response> {
        self.ensure_no_run()?;
        let session = self.require_session()?;
        session.move_step(name, index)?;
        Ok(Response::ok(format!("moved {name} to {index}")))
    }

    fn refresh(&self, force: bool) -> Result<Response> {
        self.ensure_no_run()?;
        let session = self.require_session()?;
        let changed = session.reload_definition(force)?;
        let layout = session.refresh_results()?;
        Ok(Response::ok("results refreshed")
            .with_data("changed", changed)
            .with_data("output_dir", layout.output_dir.to_string_lossy().into_owned()))
    }

    /// Polling envelope for the open project (or an empty one).
    pub fn status(&self, since: Option<f64>, force: bool) -> Result<StatusEnvelope> {
        let session = self.session();
        let run_uid = self.queue.poll(None).map(|state| state.run_uid);
        get_status(session.as_deref(), run_uid, since, force)
    }

    fn status_response(&self, since: Option<f64>, force: bool) -> Result<Response> {
        let envelope = self.status(since, force)?;
        let mut response = Response::ok("status");
        if let Value::Object(fields) = serde_json::to_value(&envelope)? {
            response.data = fields;
        }
        if let Some(session) = self.session() {
            let listing: Vec<StepStatus> =
                session.project().steps().iter().map(Step::status).collect();
            response = response.with_data("steps", serde_json::to_value(listing)?);
        }
        if let Some(state) = self.queue.poll(None) {
            response = response
                .with_data("running", state.alive)
                .with_data("log", state.log);
        }
        Ok(response)
    }

    pub fn abort(&self) -> Response {
        match self.queue.abort() {
            AbortOutcome::NoActiveRun => Response::ok("no active run"),
            AbortOutcome::Stopped { run_uid } => Response::ok("run aborted")
                .with_data("run_uid", run_uid)
                .with_data("still_running", false),
            AbortOutcome::StillRunning { run_uid } => Response::ok("abort requested; run still active")
                .with_data("run_uid", run_uid)
                .with_data("still_running", true),
        }
    }

    /// Apply one synced chunk to a project file.
    pub fn sync_file(&self, relative: &Path, encoded: &str, mode: ChunkWrite) -> Response {
        match self.try_sync_file(relative, encoded, mode) {
            Ok(()) => Response::ok(format!("synced {}", relative.display())),
            Err(err) => Response::from_error(&err),
        }
    }

    fn try_sync_file(&self, relative: &Path, encoded: &str, mode: ChunkWrite) -> Result<()> {
        self.ensure_no_run()?;
        let session = self.require_session()?;
        session.sync_file(relative, encoded, mode)
    }

    /// Base64 chunks of a project file; `data.chunks` holds them in order.
    pub fn read_file(&self, relative: &Path, chunk_size: usize) -> Response {
        match self.try_read_file(relative, chunk_size) {
            Ok(chunks) => Response::ok(format!("read {}", relative.display()))
                .with_data("chunks", chunks),
            Err(err) => Response::from_error(&err),
        }
    }

    fn try_read_file(&self, relative: &Path, chunk_size: usize) -> Result<Vec<String>> {
        let session = self.require_session()?;
        session.read_file(relative, chunk_size)
    }
}

#[derive(Debug, Clone, Copy)]
struct RunOptions {
    force: bool,
    allow_failure: bool,
    limit: Option<usize>,
    testing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestProject;

    #[test]
    fn parses_run_flags() {
        let command = KernelCommand::parse_line("run a.py 2 --force --continue --limit 3")
            .expect("parse");
        assert_eq!(
            command,
            KernelCommand::Run {
                steps: vec!["a.py".to_string(), "2".to_string()],
                force: true,
                continue_run: true,
                single: false,
                limit: Some(3),
                allow_failure: false,
                testing: false,
            }
        );
    }

    #[test]
    fn unknown_command_is_invalid() {
        let kernel = Kernel::new(KernelConfig::default());
        let response = kernel.execute("explode now");
        assert!(!response.success);
        assert_eq!(response.code, "INVALID_COMMAND");
    }

    #[test]
    fn commands_without_project_report_no_project() {
        let kernel = Kernel::new(KernelConfig::default());
        for line in ["run", "add-step a.py", "remove-step a.py", "refresh"] {
            let response = kernel.execute(line);
            assert_eq!(response.code, "NO_PROJECT", "{line}");
        }
        let status = kernel.execute("status");
        assert!(status.success);
        assert_eq!(status.data["project"], Value::Null);
    }

    #[test]
    fn open_add_move_remove_round_trip() {
        let fixture = TestProject::new(&["a.sh"]);
        let kernel = Kernel::new(fixture.config());
        let opened = kernel.execute(&format!("open {}", fixture.dir().display()));
        assert!(opened.success, "{opened:?}");

        assert!(kernel.execute("add-step b.sh --index 0").success);
        assert!(kernel.execute("move-step b.sh 1").success);
        let names = kernel.session().expect("session").project().step_names();
        assert_eq!(names, vec!["a.sh", "b.sh"]);
        let status = kernel.execute("status");
        assert_eq!(status.data["steps"][1]["name"], "b.sh");
        assert_eq!(status.data["steps"][1]["dirty"], true);

        let missing = kernel.execute("remove-step nope.sh");
        assert_eq!(missing.code, "STEP_NOT_FOUND");
        assert!(kernel.execute("remove-step a.sh --keep-file").success);
        assert!(fixture.dir().join("a.sh").exists());
        assert!(kernel.execute("close").success);
        assert!(kernel.session().is_none());
    }

    #[test]
    fn step_names_outside_the_project_are_rejected() {
        let fixture = TestProject::new(&["a.sh"]);
        let victim = fixture.dir().join("../victim.txt");
        std::fs::write(&victim, "keep").expect("victim");
        let kernel = Kernel::new(fixture.config());
        assert!(kernel.execute(&format!("open {}", fixture.dir().display())).success);

        let added = kernel.execute("add-step ../victim.txt");
        assert_eq!(added.code, "INVALID_STEP_NAME");
        let removed = kernel.execute("remove-step ../victim.txt");
        assert!(!removed.success);
        assert!(victim.exists());
        assert_eq!(
            kernel.session().expect("session").project().step_names(),
            vec!["a.sh"]
        );
    }

    #[test]
    fn single_without_steps_targets_first_dirty() {
        let fixture = TestProject::new(&["a.sh", "b.sh"]);
        let session = fixture.session();
        session.project().mark_dirty(0, false, false);
        let scopes = run_scopes(&session, &[], false, true);
        assert_eq!(
            scopes,
            vec![RunScope::Single(StepRef::Name("b.sh".to_string()))]
        );
        let scopes = run_scopes(&session, &["a.sh".to_string()], true, false);
        assert_eq!(
            scopes,
            vec![RunScope::From(StepRef::Name("a.sh".to_string()))]
        );
    }
}
