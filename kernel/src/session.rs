//! The open project and everything that lives as long as it does.
//!
//! A `Session` is created when a project directory is opened and dropped when
//! it is closed. It is passed explicitly to the runner and status reporter.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::capture::OutputCapture;
use crate::core::cache::SharedCache;
use crate::core::types::StepRef;
use crate::error::KernelError;
use crate::io::clock;
use crate::io::config::KernelConfig;
use crate::io::executor::ExecutorRegistry;
use crate::io::modules::{FileModuleRegistry, ModuleRegistry};
use crate::io::project_store;
use crate::io::results::{self, ResultsLayout};
use crate::io::sync::{ChunkWrite, read_file_chunks, write_file_chunk};
use crate::notebook::{Project, Step, StepDefinition};
use crate::reloader::ReloadPolicy;
use crate::render::{BasicRenderer, Renderer};

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Session {
    config: KernelConfig,
    project: Mutex<Project>,
    cache: Mutex<SharedCache>,
    modules: Mutex<Box<dyn ModuleRegistry>>,
    executors: ExecutorRegistry,
    renderer: Arc<dyn Renderer>,
    capture: OutputCapture,
    last_successful_run: Mutex<Option<f64>>,
    definition_mtime: Mutex<Option<f64>>,
    run_active: AtomicBool,
}

/// Held for the duration of a run; external mutation is rejected meanwhile.
pub struct ActiveRun<'a> {
    session: &'a Session,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.session.run_active.store(false, Ordering::SeqCst);
    }
}

impl Session {
    /// Open the project in `project_dir`, snapshot its libraries and
    /// recreate its results directory.
    #[instrument(skip_all, fields(project_dir = %project_dir.display()))]
    pub fn open(project_dir: &Path, config: KernelConfig) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("resolve project directory {}", project_dir.display()))?;
        let results_path = config.results_path(&project_dir);
        let mut project = project_store::open_project(&project_dir, &results_path)?;
        project.remote_source_directory = config.remote_source_dir.clone();
        let executors = ExecutorRegistry::from_config(&config);
        let session = Self::from_parts(
            project,
            config,
            executors,
            Box::new(FileModuleRegistry::new()),
        );
        session.load_libraries()?;
        *lock(&session.definition_mtime) =
            clock::mtime(&project_store::definition_path(&project_dir));
        session.refresh_results()?;
        info!(steps = session.project().steps().len(), "project opened");
        Ok(session)
    }

    /// Assemble a session from already-built parts.
    pub fn from_parts(
        project: Project,
        config: KernelConfig,
        executors: ExecutorRegistry,
        modules: Box<dyn ModuleRegistry>,
    ) -> Self {
        Self {
            config,
            project: Mutex::new(project),
            cache: Mutex::new(SharedCache::new()),
            modules: Mutex::new(modules),
            executors,
            renderer: Arc::new(BasicRenderer),
            capture: OutputCapture::new(),
            last_successful_run: Mutex::new(None),
            definition_mtime: Mutex::new(None),
            run_active: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn project(&self) -> MutexGuard<'_, Project> {
        lock(&self.project)
    }

    pub fn cache(&self) -> MutexGuard<'_, SharedCache> {
        lock(&self.cache)
    }

    pub fn modules(&self) -> MutexGuard<'_, Box<dyn ModuleRegistry>> {
        lock(&self.modules)
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn renderer(&self) -> &dyn Renderer {
        self.renderer.as_ref()
    }

    pub fn capture(&self) -> &OutputCapture {
        &self.capture
    }

    pub fn layout(&self) -> ResultsLayout {
        ResultsLayout::for_project(&self.project())
    }

    pub fn reload_policy(&self) -> ReloadPolicy {
        ReloadPolicy {
            max_attempts: self.config.reload_max_attempts,
            backoff: std::time::Duration::from_millis(self.config.reload_backoff_ms),
        }
    }

    pub fn last_successful_run(&self) -> Option<f64> {
        *lock(&self.last_successful_run)
    }

    pub fn record_successful_run(&self, at: f64) {
        *lock(&self.last_successful_run) = Some(at);
    }

    /// Existing library directories of the project (`None` for missing ones).
    pub fn library_roots(&self) -> Vec<Option<PathBuf>> {
        self.project()
            .library_directories()
            .into_iter()
            .map(|dir| dir.is_dir().then_some(dir))
            .collect()
    }

    fn load_libraries(&self) -> Result<()> {
        let roots: Vec<PathBuf> = self.library_roots().into_iter().flatten().collect();
        let loaded = self.modules().ensure_loaded(&roots)?;
        debug!(modules = loaded.len(), "libraries loaded");
        Ok(())
    }

    /// Claim the session for a run. The flag flips under the project lock, so
    /// a mutation holding that lock sees either no run or a claimed one.
    pub fn begin_run(&self) -> Result<ActiveRun<'_>, KernelError> {
        let _project = self.project();
        self.run_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| KernelError::ActionBlocked("a run is already active".to_string()))?;
        Ok(ActiveRun { session: self })
    }

    pub fn is_running(&self) -> bool {
        self.run_active.load(Ordering::SeqCst)
    }

    /// Call with the project lock held.
    fn ensure_idle(&self, action: &str) -> Result<(), KernelError> {
        if self.is_running() {
            return Err(KernelError::ActionBlocked(format!(
                "cannot {action} while a run is active"
            )));
        }
        Ok(())
    }

    fn persist(&self, project: &Project) -> Result<()> {
        let retry = self.config.write_retry();
        project_store::save_project(project, retry)?;
        results::write_manifest(&ResultsLayout::for_project(project), project, retry)?;
        *lock(&self.definition_mtime) =
            clock::mtime(&project_store::definition_path(&project.directory));
        Ok(())
    }

    pub fn add_step(&self, definition: StepDefinition, index: Option<usize>) -> Result<usize> {
        let mut project = self.project();
        self.ensure_idle("add a step")?;
        let position = project.add_step(definition, index)?;
        let step = &project.steps()[position];
        if !step.source_path.exists() {
            fs::write(&step.source_path, "")
                .with_context(|| format!("create step source {}", step.source_path.display()))?;
        }
        self.persist(&project)?;
        Ok(position)
    }

    /// Remove a step, its artifact and (unless `keep_file`) its source.
    pub fn remove_step(&self, name: &str, keep_file: bool) -> Result<Step> {
        let mut project = self.project();
        self.ensure_idle("remove a step")?;
        let removed = project.remove_step(name)?;
        results::remove_step(&ResultsLayout::for_project(&project), name)?;
        if !keep_file && removed.source_path.exists() {
            fs::remove_file(&removed.source_path).with_context(|| {
                format!("remove step source {}", removed.source_path.display())
            })?;
        }
        self.persist(&project)?;
        info!(step = %name, keep_file, "step removed");
        Ok(removed)
    }

    pub fn move_step(&self, name: &str, index: usize) -> Result<()> {
        let mut project = self.project();
        self.ensure_idle("move a step")?;
        project.move_step(name, index)?;
        self.persist(&project)
    }

    /// Pick up edits to `notebook.json` made outside the kernel. Returns
    /// whether the step list changed.
    pub fn reload_definition(&self, force: bool) -> Result<bool> {
        let mut project = self.project();
        self.ensure_idle("reload the project")?;
        let path = project_store::definition_path(&project.directory);
        let mtime = clock::mtime(&path);
        if !force && mtime == *lock(&self.definition_mtime) {
            return Ok(false);
        }
        let definition = project_store::load_definition(&path)?;
        let changed = project.refresh(definition, force)?;
        *lock(&self.definition_mtime) = mtime;
        debug!(changed, "definition reloaded");
        Ok(changed)
    }

    /// Recreate the results directory from in-memory state.
    pub fn refresh_results(&self) -> Result<ResultsLayout> {
        let project = self.project();
        self.ensure_idle("refresh results")?;
        results::refresh(&project, self.config.write_retry())
    }

    /// Apply one synced chunk to a file under the project directory. A
    /// synced step source becomes dirty.
    pub fn sync_file(&self, relative: &Path, encoded: &str, mode: ChunkWrite) -> Result<()> {
        let mut project = self.project();
        self.ensure_idle("sync files")?;
        let target = inside_project(&project, relative)?;
        write_file_chunk(&target, encoded, mode)?;
        let name = relative.to_string_lossy().into_owned();
        if let Some(position) = project.index_of(&StepRef::Name(name)) {
            project.mark_dirty(position, true, false);
        }
        Ok(())
    }

    /// Base64 chunks of a project file, for clients pulling a copy.
    pub fn read_file(&self, relative: &Path, chunk_size: usize) -> Result<Vec<String>> {
        let target = inside_project(&self.project(), relative)?;
        read_file_chunks(&target, chunk_size)
    }

    /// Clear user state. The session is unusable for runs afterwards only in
    /// the sense that the cache starts empty.
    pub fn close(&self) -> Result<(), KernelError> {
        let _project = self.project();
        self.ensure_idle("close the project")?;
        self.cache().clear();
        self.capture.detach();
        info!("project closed");
        Ok(())
    }
}

fn inside_project(project: &Project, relative: &Path) -> Result<PathBuf> {
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        anyhow::bail!("path must stay inside the project: {}", relative.display());
    }
    Ok(project.directory.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestProject;

    #[test]
    fn begin_run_is_exclusive() {
        let fixture = TestProject::new(&["a.sh"]);
        let session = fixture.session();
        let run = session.begin_run().expect("first");
        assert!(matches!(
            session.begin_run(),
            Err(KernelError::ActionBlocked(_))
        ));
        assert!(session.remove_step("a.sh", true).is_err());
        drop(run);
        assert!(session.begin_run().is_ok());
    }

    /// A run cannot be claimed while a mutation holds the project, so the
    /// mutation finishes before the run reads its working set.
    #[test]
    fn begin_run_waits_for_the_project_lock() {
        use std::time::Duration;

        let fixture = TestProject::new(&["a.sh", "b.sh"]);
        let session = fixture.session();
        let claimed = AtomicBool::new(false);
        std::thread::scope(|scope| {
            let project = session.project();
            scope.spawn(|| {
                let _run = session.begin_run().expect("claim");
                claimed.store(true, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(50));
            assert!(!claimed.load(Ordering::SeqCst));
            assert!(!session.is_running());
            drop(project);
        });
        assert!(claimed.load(Ordering::SeqCst));
        session.move_step("b.sh", 0).expect("move after the run ended");
    }

    #[test]
    fn add_and_remove_step_persist_definition() {
        let fixture = TestProject::new(&["a.sh"]);
        let session = fixture.session();
        session
            .add_step(StepDefinition::named("b.sh"), None)
            .expect("add");
        assert!(fixture.dir().join("b.sh").exists());
        let saved = project_store::load_definition(&fixture.dir().join("notebook.json"))
            .expect("load");
        assert_eq!(saved.steps.len(), 2);

        session.remove_step("a.sh", false).expect("remove");
        assert!(!fixture.dir().join("a.sh").exists());
        assert_eq!(session.project().step_names(), vec!["b.sh"]);
    }

    #[test]
    fn escaping_step_names_touch_nothing_outside_the_project() {
        let fixture = TestProject::new(&["a.sh"]);
        let victim = fixture.dir().join("../victim.txt");
        fs::write(&victim, "keep").expect("victim");
        let session = fixture.session();

        let err = session
            .add_step(StepDefinition::named("../victim.txt"), None)
            .unwrap_err();
        assert_eq!(crate::error::error_code(&err), "INVALID_STEP_NAME");
        let err = session.remove_step("../victim.txt", false).unwrap_err();
        assert_eq!(crate::error::error_code(&err), "STEP_NOT_FOUND");
        assert_eq!(fs::read_to_string(&victim).expect("victim"), "keep");
    }

    #[test]
    fn external_definition_edit_is_picked_up() {
        let fixture = TestProject::new(&["a.sh"]);
        let session = fixture.session();
        assert!(!session.reload_definition(false).expect("unchanged"));
        fs::write(
            fixture.dir().join("notebook.json"),
            r#"{"steps": ["a.sh", "b.sh"]}"#,
        )
        .expect("edit");
        assert!(session.reload_definition(true).expect("reload"));
        assert_eq!(session.project().step_names(), vec!["a.sh", "b.sh"]);
    }

    #[test]
    fn synced_step_source_becomes_dirty() {
        use base64::Engine;
        let fixture = TestProject::new(&["a.sh", "b.sh"]);
        let session = fixture.session();
        {
            let mut project = session.project();
            project.mark_dirty(0, false, false);
            project.mark_dirty(1, false, false);
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode("echo synced\n");
        session
            .sync_file(Path::new("a.sh"), &encoded, ChunkWrite::Full)
            .expect("sync");
        assert_eq!(
            fs::read_to_string(fixture.dir().join("a.sh")).expect("read"),
            "echo synced\n"
        );
        let flags: Vec<bool> = session.project().steps().iter().map(|s| s.dirty).collect();
        assert_eq!(flags, vec![true, true]);
        assert!(session.sync_file(Path::new("../x"), &encoded, ChunkWrite::Full).is_err());
    }

    #[test]
    fn read_file_returns_chunks_inside_the_project() {
        let fixture = TestProject::new(&["a.sh"]);
        fixture.write_source("a.sh", "echo hi\n");
        let session = fixture.session();
        let chunks = session.read_file(Path::new("a.sh"), 4).expect("read");
        assert_eq!(chunks.len(), 2);
        assert!(session.read_file(Path::new("/etc/passwd"), 4).is_err());
    }

    #[test]
    fn remote_source_directory_comes_from_config() {
        let fixture = TestProject::new(&["a.sh"]);
        let config = KernelConfig {
            remote_source_dir: Some(PathBuf::from("/srv/mirror/nb")),
            ..fixture.config()
        };
        let session = Session::open(fixture.dir(), config).expect("open");
        let snapshot = session.project().kernel_serialize();
        assert_eq!(
            snapshot.remote_source_directory.as_deref(),
            Some("/srv/mirror/nb")
        );
    }

    #[test]
    fn close_clears_user_values() {
        let fixture = TestProject::new(&[]);
        let session = fixture.session();
        session
            .cache()
            .set("x", serde_json::json!(1))
            .expect("set");
        session.close().expect("close");
        assert!(session.cache().is_empty());
    }
}
