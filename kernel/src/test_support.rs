//! Test-only fixtures: in-memory projects, on-disk notebooks, and scripted
//! stand-ins for step execution and library reloads.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Result, bail};
use serde_json::Value;
use tempfile::TempDir;

use crate::core::report::Fragment;
use crate::core::types::LoadedModule;
use crate::io::atomic::WriteRetry;
use crate::io::clock;
use crate::io::config::KernelConfig;
use crate::io::executor::{ExecContext, ExecutorRegistry, StepExecutor, StepFailure};
use crate::io::modules::{FileModuleRegistry, ModuleRegistry, module_name};
use crate::io::project_store;
use crate::notebook::{Project, ProjectDefinition, StepDefinition};
use crate::session::Session;

/// Project rooted at `/tmp/nb` with the given steps, all dirty. Nothing is
/// read from or written to disk.
pub fn project_with_steps(names: &[&str]) -> Project {
    let definition = ProjectDefinition {
        steps: names.iter().map(|name| StepDefinition::named(*name)).collect(),
        ..ProjectDefinition::default()
    };
    Project::from_definition(
        Path::new("/tmp/nb"),
        definition,
        Path::new("/tmp/nb/.results"),
    )
    .expect("project")
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Stamp `path` with an mtime a few seconds ahead, so timestamp checks see
/// the change regardless of filesystem clock granularity.
pub fn push_mtime_forward(path: &Path) {
    let file = fs::File::options()
        .write(true)
        .open(path)
        .expect("open for mtime");
    file.set_modified(SystemTime::now() + Duration::from_secs(5))
        .expect("set mtime");
}

/// Module registry whose reloads succeed or fail on command.
#[derive(Debug, Default)]
pub struct ScriptedRegistry {
    modules: Vec<LoadedModule>,
    failures: HashMap<String, u32>,
    attempts: HashMap<String, u32>,
}

impl ScriptedRegistry {
    pub fn new(root: impl AsRef<Path>, relative: &[&str]) -> Self {
        let root = root.as_ref();
        let modules = relative
            .iter()
            .map(|rel| LoadedModule {
                name: module_name(Path::new(rel)),
                path: root.join(rel),
            })
            .collect();
        Self {
            modules,
            ..Self::default()
        }
    }

    /// Make the next `times` reloads of `module` fail.
    pub fn fail_times(&mut self, module: &str, times: u32) {
        self.failures.insert(module.to_string(), times);
    }

    pub fn attempts(&self, module: &str) -> u32 {
        self.attempts.get(module).copied().unwrap_or(0)
    }
}

impl ModuleRegistry for ScriptedRegistry {
    fn loaded_modules(&self) -> Vec<LoadedModule> {
        self.modules.clone()
    }

    fn reload(&mut self, module: &LoadedModule) -> Result<()> {
        *self.attempts.entry(module.name.clone()).or_default() += 1;
        if let Some(left) = self.failures.get_mut(&module.name)
            && *left > 0
        {
            *left -= 1;
            bail!("scripted reload failure for {}", module.name);
        }
        Ok(())
    }

    fn ensure_loaded(&mut self, _roots: &[PathBuf]) -> Result<Vec<LoadedModule>> {
        Ok(Vec::new())
    }

    fn sources(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
enum Script {
    Export(String, Value),
    Fail(String),
    WaitForAbort,
}

#[derive(Debug, Default)]
struct ScriptState {
    scripts: HashMap<String, Vec<Script>>,
    calls: Vec<String>,
}

/// Executor that records calls and follows per-step scripts. Unscripted
/// steps print `running <name>` and display `<p><name></p>`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, step: &str, script: Script) {
        self.state
            .lock()
            .expect("script state")
            .scripts
            .entry(step.to_string())
            .or_default()
            .push(script);
    }

    pub fn export(&self, step: &str, key: &str, value: Value) {
        self.push(step, Script::Export(key.to_string(), value));
    }

    pub fn fail(&self, step: &str, message: &str) {
        self.push(step, Script::Fail(message.to_string()));
    }

    /// Block the step until the run is aborted.
    pub fn wait_for_abort(&self, step: &str) {
        self.push(step, Script::WaitForAbort);
    }

    /// Step names in execution order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().expect("script state").calls.clone()
    }
}

impl StepExecutor for ScriptedExecutor {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> Result<(), StepFailure> {
        let scripts = {
            let mut state = self.state.lock().expect("script state");
            state.calls.push(ctx.step_name.to_string());
            state.scripts.get(ctx.step_name).cloned().unwrap_or_default()
        };
        let line = format!("running {}\n", ctx.step_name);
        ctx.capture.write(&line);
        ctx.report.append_stdout(&line, clock::now());

        for script in scripts {
            match script {
                Script::Export(key, value) => ctx.cache.set(key, value)?,
                Script::Fail(message) => return Err(StepFailure::Source(message)),
                Script::WaitForAbort => loop {
                    ctx.abort.checkpoint()?;
                    thread::sleep(Duration::from_millis(5));
                },
            }
        }
        ctx.display(Fragment::new(format!("<p>{}</p>", ctx.step_name)));
        Ok(())
    }
}

/// Notebook directory on disk with a definition and empty step sources.
pub struct TestProject {
    _temp: TempDir,
    dir: PathBuf,
}

impl TestProject {
    pub fn new(steps: &[&str]) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp
            .path()
            .canonicalize()
            .expect("canonical tempdir")
            .join("notebook");
        fs::create_dir_all(&dir).expect("create notebook dir");
        let definition = ProjectDefinition {
            steps: steps.iter().map(|name| StepDefinition::named(*name)).collect(),
            ..ProjectDefinition::default()
        };
        project_store::write_definition(
            &project_store::definition_path(&dir),
            &definition,
            WriteRetry::default(),
        )
        .expect("write definition");
        for step in steps {
            fs::write(dir.join(step), "").expect("write step source");
        }
        Self { _temp: temp, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_source(&self, relative: &str, contents: &str) {
        let path = self.dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write source");
    }

    /// Defaults with short waits and backoffs.
    pub fn config(&self) -> KernelConfig {
        KernelConfig {
            write_retry_backoff_ms: 1,
            reload_backoff_ms: 1,
            busy_wait_ms: 50,
            dispatch_wait_ms: 200,
            abort_grace_ms: 1000,
            abort_poll_ms: 5,
            ..KernelConfig::default()
        }
    }

    /// Session with the real executors.
    pub fn session(&self) -> Session {
        Session::open(&self.dir, self.config()).expect("open session")
    }

    /// Session whose `.py` steps run through `executor`.
    pub fn scripted_session(&self, executor: &ScriptedExecutor) -> Session {
        let config = self.config();
        let project = project_store::open_project(&self.dir, &config.results_path(&self.dir))
            .expect("open project");
        let mut executors = ExecutorRegistry::new();
        executors.register("py", executor.clone());
        Session::from_parts(
            project,
            config,
            executors,
            Box::new(FileModuleRegistry::new()),
        )
    }
}
