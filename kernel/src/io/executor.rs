//! Step executors: the pluggable "run this step's source" capability.
//!
//! An executor receives the step's shared-cache handle and report and either
//! fills the report or fails. Which executor runs a step is decided by the
//! source file extension.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::abort::AbortSignal;
use crate::capture::OutputCapture;
use crate::core::cache::SharedCache;
use crate::core::report::{Fragment, Report};
use crate::core::types::ExecMode;
use crate::error::KernelError;
use crate::io::clock;
use crate::io::config::KernelConfig;
use crate::io::modules::ModuleRegistry;
use crate::io::process::{ProcessLimits, run_interruptible};
use crate::render::Renderer;

/// Everything a step sees while it executes.
pub struct ExecContext<'a> {
    pub step_name: &'a str,
    pub source_path: &'a Path,
    pub project_dir: &'a Path,
    /// Where the step may write attachment files.
    pub files_dir: &'a Path,
    /// Private scratch space for the exchange files of one execution.
    pub scratch_dir: &'a Path,
    pub cache: &'a mut SharedCache,
    pub report: &'a mut Report,
    pub modules: &'a dyn ModuleRegistry,
    pub library_roots: &'a [PathBuf],
    pub renderer: &'a dyn Renderer,
    pub mode: ExecMode,
    pub abort: &'a AbortSignal,
    pub capture: &'a OutputCapture,
}

impl ExecContext<'_> {
    pub fn display(&mut self, fragment: Fragment) {
        self.report.append(fragment, clock::now());
    }
}

/// Why a step did not complete.
#[derive(Debug)]
pub enum StepFailure {
    /// The step's own source failed; recorded on the step.
    Source(String),
    /// The abort flag was observed mid-step.
    Aborted,
    /// The kernel could not run the step at all.
    Infrastructure(anyhow::Error),
}

impl From<anyhow::Error> for StepFailure {
    fn from(err: anyhow::Error) -> Self {
        StepFailure::Infrastructure(err)
    }
}

impl From<KernelError> for StepFailure {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Aborted => StepFailure::Aborted,
            KernelError::ProtectedKey(key) => {
                StepFailure::Source(format!("step wrote reserved cache key '{key}'"))
            }
            other => StepFailure::Infrastructure(other.into()),
        }
    }
}

pub trait StepExecutor: Send + Sync {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> Result<(), StepFailure>;
}

/// Display record written by subprocess steps, one JSON object per line.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DisplayRecord {
    Fragment {
        body: String,
        #[serde(default)]
        includes: Vec<String>,
    },
    Value {
        #[serde(default = "default_kind")]
        kind: String,
        value: Value,
    },
}

fn default_kind() -> String {
    "text".to_string()
}

/// Runs a step through an interpreter subprocess.
///
/// The shared cache travels as JSON: the step reads `KERNEL_SHARED_IN` and
/// may write an object to `KERNEL_SHARED_OUT`, whose keys are merged back.
/// Display output goes to the JSONL file at `KERNEL_DISPLAY`.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    interpreter: Vec<String>,
    limits: ProcessLimits,
}

impl CommandExecutor {
    pub fn new(interpreter: Vec<String>, limits: ProcessLimits) -> Self {
        Self {
            interpreter,
            limits,
        }
    }

    fn build_command(&self, ctx: &ExecContext<'_>, exchange: &Exchange) -> Result<Command> {
        let (program, args) = self
            .interpreter
            .split_first()
            .context("interpreter command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(ctx.source_path)
            .current_dir(ctx.project_dir)
            .env("KERNEL_STEP_NAME", ctx.step_name)
            .env("KERNEL_SHARED_IN", &exchange.shared_in)
            .env("KERNEL_SHARED_OUT", &exchange.shared_out)
            .env("KERNEL_DISPLAY", &exchange.display)
            .env("KERNEL_OUTPUT_DIR", ctx.files_dir)
            .env("KERNEL_IS_TESTING", flag(ctx.mode.is_testing))
            .env("KERNEL_IS_INTERACTIVE", flag(ctx.mode.is_interactive))
            .env("KERNEL_IS_SINGLE_RUN", flag(ctx.mode.is_single_run));
        let roots: Vec<&PathBuf> = ctx.library_roots.iter().filter(|p| p.is_dir()).collect();
        if !roots.is_empty() {
            let joined = std::env::join_paths(roots).context("join library paths")?;
            cmd.env("KERNEL_LIBRARY_PATH", joined);
        }
        Ok(cmd)
    }
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

struct Exchange {
    dir: PathBuf,
    shared_in: PathBuf,
    shared_out: PathBuf,
    display: PathBuf,
}

impl Exchange {
    fn create(scratch_dir: &Path, namespace: &Map<String, Value>) -> Result<Self> {
        fs::create_dir_all(scratch_dir)
            .with_context(|| format!("create scratch {}", scratch_dir.display()))?;
        let exchange = Self {
            dir: scratch_dir.to_path_buf(),
            shared_in: scratch_dir.join("shared_in.json"),
            shared_out: scratch_dir.join("shared_out.json"),
            display: scratch_dir.join("display.jsonl"),
        };
        for stale in [&exchange.shared_out, &exchange.display] {
            if stale.exists() {
                fs::remove_file(stale).with_context(|| format!("remove {}", stale.display()))?;
            }
        }
        let json = serde_json::to_vec(namespace).context("serialize shared cache")?;
        fs::write(&exchange.shared_in, json)
            .with_context(|| format!("write {}", exchange.shared_in.display()))?;
        Ok(exchange)
    }

    fn read_exports(&self) -> Result<Option<Map<String, Value>>, StepFailure> {
        if !self.shared_out.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.shared_out)
            .with_context(|| format!("read {}", self.shared_out.display()))?;
        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(_) => Err(StepFailure::Source(
                "shared output must be a JSON object".to_string(),
            )),
            Err(err) => Err(StepFailure::Source(format!("invalid shared output: {err}"))),
        }
    }

    fn read_display(&self) -> Result<Vec<DisplayRecord>, StepFailure> {
        if !self.display.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.display)
            .with_context(|| format!("read {}", self.display.display()))?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<DisplayRecord>(line)
                    .map_err(|err| StepFailure::Source(format!("invalid display record: {err}")))
            })
            .collect()
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), err = %err, "failed to remove scratch dir");
        }
    }
}

/// Attachment files under `files_dir`, relative and sorted.
fn list_files(files_dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(files_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(files_dir)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}

impl StepExecutor for CommandExecutor {
    #[instrument(skip_all, fields(step = %ctx.step_name))]
    fn execute(&self, ctx: &mut ExecContext<'_>) -> Result<(), StepFailure> {
        ctx.abort.checkpoint()?;
        let namespace = ctx.cache.namespace(ctx.mode);
        let exchange = Exchange::create(ctx.scratch_dir, &namespace)?;
        let cmd = self.build_command(ctx, &exchange)?;
        let output = run_interruptible(cmd, self.limits, ctx.abort, Some(ctx.capture.clone()))?;

        let now = clock::now();
        ctx.report.append_stdout(&output.stdout_text(), now);
        if output.aborted {
            return Err(StepFailure::Aborted);
        }
        for record in exchange.read_display()? {
            let fragment = match record {
                DisplayRecord::Fragment { body, includes } => Fragment { body, includes },
                DisplayRecord::Value { kind, value } => ctx.renderer.display(&kind, &value),
            };
            ctx.display(fragment);
        }
        for file in list_files(ctx.files_dir) {
            ctx.report.add_file(file, now);
        }
        if output.timed_out {
            return Err(StepFailure::Source(format!(
                "step timed out after {}s",
                self.limits.timeout.as_secs()
            )));
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            let message = if stderr.trim().is_empty() {
                format!("step exited with {}", output.status)
            } else {
                stderr.trim_end().to_string()
            };
            return Err(StepFailure::Source(message));
        }
        if let Some(exports) = exchange.read_exports()? {
            debug!(keys = exports.len(), "merging step exports");
            ctx.cache.merge_exports(exports)?;
        }
        Ok(())
    }
}

/// Template extensions that library files must have to be includable.
const TEMPLATE_EXTENSIONS: &[&str] = &["html", "md", "j2", "jinja", "txt"];

/// Renders `.md` and `.html` steps with the shared cache as template context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateExecutor;

impl StepExecutor for TemplateExecutor {
    #[instrument(skip_all, fields(step = %ctx.step_name))]
    fn execute(&self, ctx: &mut ExecContext<'_>) -> Result<(), StepFailure> {
        ctx.abort.checkpoint()?;
        let source = fs::read_to_string(ctx.source_path)
            .with_context(|| format!("read step {}", ctx.source_path.display()))?;
        let libraries: Vec<(String, String)> = ctx
            .modules
            .sources()
            .into_iter()
            .filter(|(name, _)| {
                Path::new(name)
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| TEMPLATE_EXTENSIONS.contains(&e))
            })
            .collect();
        let namespace = ctx.cache.namespace(ctx.mode);

        let mut env = Environment::new();
        for (name, library) in &libraries {
            env.add_template(name, library)
                .map_err(|err| StepFailure::Source(format!("library template {name}: {err}")))?;
        }
        env.add_template(ctx.step_name, &source)
            .map_err(|err| StepFailure::Source(err.to_string()))?;
        let template = env
            .get_template(ctx.step_name)
            .map_err(|err| StepFailure::Source(err.to_string()))?;
        let rendered = template
            .render(&namespace)
            .map_err(|err| StepFailure::Source(err.to_string()))?;

        let is_markdown = ctx
            .source_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("md"));
        let fragment = if is_markdown {
            ctx.renderer.markdown(&rendered)
        } else {
            ctx.renderer.html(&rendered)
        };
        ctx.display(fragment);
        Ok(())
    }
}

/// Executors keyed by lowercase source extension.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    by_extension: BTreeMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Template executor for `md`/`html` plus one command executor per
    /// configured interpreter.
    pub fn from_config(config: &KernelConfig) -> Self {
        let limits = ProcessLimits {
            timeout: Duration::from_secs(config.step_timeout_secs),
            output_limit_bytes: config.executor_output_limit_bytes,
            poll: Duration::from_millis(config.abort_poll_ms),
        };
        let mut registry = Self::new();
        for (ext, interpreter) in &config.interpreters {
            registry.register(ext, CommandExecutor::new(interpreter.clone(), limits));
        }
        registry.register("md", TemplateExecutor);
        registry.register("html", TemplateExecutor);
        registry
    }

    pub fn register(&mut self, extension: &str, executor: impl StepExecutor + 'static) {
        self.by_extension
            .insert(extension.to_ascii_lowercase(), Arc::new(executor));
    }

    pub fn get(&self, extension: &str) -> Option<Arc<dyn StepExecutor>> {
        self.by_extension.get(extension).cloned()
    }
}
