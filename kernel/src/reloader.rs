//! Library reloads: refresh every loaded module under the library roots,
//! deepest first, retrying failures as a batch.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use rand::seq::SliceRandom;
use tracing::{debug, info, instrument, warn};

use crate::core::reload_order::reload_order;
use crate::core::types::LoadedModule;
use crate::error::KernelError;
use crate::io::clock;
use crate::io::modules::ModuleRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadPolicy {
    /// Whole-batch attempts before the reload is declared failed.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for ReloadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

fn present_roots(roots: &[Option<PathBuf>]) -> Vec<PathBuf> {
    roots.iter().flatten().cloned().collect()
}

/// Reload every loaded module rooted under one of `roots` (`None` entries
/// are skipped). Returns module names in the order their reload succeeded.
///
/// Modules that fail are retried together, in shuffled order, until they all
/// succeed or `policy.max_attempts` is exhausted; the latter yields
/// [`KernelError::Reload`] naming every module that never reloaded.
#[instrument(skip_all, fields(max_attempts = policy.max_attempts))]
pub fn reload_libraries(
    registry: &mut dyn ModuleRegistry,
    roots: &[Option<PathBuf>],
    policy: ReloadPolicy,
) -> Result<Vec<String>> {
    let roots = present_roots(roots);
    let forgotten = registry.forget_missing();
    if !forgotten.is_empty() {
        info!(modules = ?forgotten, "deleted library modules dropped");
    }
    let mut pending: Vec<LoadedModule> = reload_order(&registry.loaded_modules(), &roots);
    let mut completed = Vec::with_capacity(pending.len());
    let attempts = policy.max_attempts.max(1);
    let mut rng = rand::thread_rng();

    for attempt in 1..=attempts {
        let mut failed = Vec::new();
        for module in pending {
            match registry.reload(&module) {
                Ok(()) => completed.push(module.name),
                Err(err) => {
                    debug!(module = %module.name, attempt, err = %format!("{err:#}"), "reload attempt failed");
                    failed.push(module);
                }
            }
        }
        if failed.is_empty() {
            info!(modules = completed.len(), attempt, "libraries reloaded");
            return Ok(completed);
        }
        warn!(failed = failed.len(), attempt, "library reload incomplete");
        if attempt < attempts {
            failed.shuffle(&mut rng);
            thread::sleep(policy.backoff);
        }
        pending = failed;
    }

    let mut modules: Vec<String> = pending.into_iter().map(|m| m.name).collect();
    modules.sort();
    Err(KernelError::Reload { modules }.into())
}

/// True if a loaded module under `roots` changed on disk.
///
/// Modules with a recorded snapshot mtime changed when the file's mtime
/// differs from it (a deleted file counts). Otherwise the file must be newer
/// than `since`, the last successful run.
pub fn libraries_changed(
    registry: &dyn ModuleRegistry,
    roots: &[Option<PathBuf>],
    since: Option<f64>,
) -> bool {
    let roots = present_roots(roots);
    reload_order(&registry.loaded_modules(), &roots)
        .iter()
        .any(|module| {
            let current = clock::mtime(&module.path);
            match registry.snapshot_mtime(module) {
                Some(snapshot) => current != Some(snapshot),
                None => current.zip(since).is_some_and(|(mtime, since)| mtime > since),
            }
        })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::error::error_code;
    use crate::io::modules::FileModuleRegistry;
    use crate::test_support::{ScriptedRegistry, push_mtime_forward};

    fn policy(max_attempts: u32) -> ReloadPolicy {
        ReloadPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn reloads_deepest_first() {
        let mut registry = ScriptedRegistry::new(
            "/lib",
            &["pkg/__init__.py", "pkg/sub/__init__.py", "pkg/sub/leaf.py"],
        );
        let order = reload_libraries(
            &mut registry,
            &[Some(PathBuf::from("/lib"))],
            policy(3),
        )
        .expect("reload");
        assert_eq!(order, vec!["pkg.sub.leaf", "pkg.sub.__init__", "pkg.__init__"]);
    }

    /// Verifies a module failing on attempts 1..N-1 still succeeds at N.
    #[test]
    fn transient_failures_are_retried() {
        let mut registry = ScriptedRegistry::new("/lib", &["a.py", "b.py"]);
        registry.fail_times("a", 2);
        let order = reload_libraries(&mut registry, &[Some(PathBuf::from("/lib"))], policy(3))
            .expect("reload");
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(registry.attempts("a"), 3);
        assert_eq!(registry.attempts("b"), 1);
    }

    #[test]
    fn exhausted_retries_name_the_module() {
        let mut registry = ScriptedRegistry::new("/lib", &["a.py", "b.py"]);
        registry.fail_times("a", 5);
        let err = reload_libraries(&mut registry, &[Some(PathBuf::from("/lib"))], policy(3))
            .unwrap_err();
        assert_eq!(error_code(&err), "RELOAD_FAILED");
        assert_eq!(
            err.downcast_ref::<KernelError>(),
            Some(&KernelError::Reload {
                modules: vec!["a".to_string()]
            })
        );
        assert_eq!(registry.attempts("a"), 3);
    }

    #[test]
    fn absent_roots_are_skipped() {
        let mut registry = ScriptedRegistry::new("/lib", &["a.py"]);
        let order = reload_libraries(&mut registry, &[None], policy(3)).expect("reload");
        assert!(order.is_empty());
        assert_eq!(registry.attempts("a"), 0);
    }

    /// Without snapshot mtimes only edits newer than the last successful
    /// run count.
    #[test]
    fn untracked_modules_compare_against_last_successful_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.py"), "").expect("write");
        let registry = ScriptedRegistry::new(temp.path(), &["a.py"]);
        let roots = [Some(temp.path().to_path_buf())];
        assert!(!libraries_changed(&registry, &roots, None));
        assert!(libraries_changed(&registry, &roots, Some(0.0)));
        assert!(!libraries_changed(&registry, &roots, Some(clock::now() + 60.0)));
    }

    #[test]
    fn edit_after_snapshot_counts_before_any_successful_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("libs");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(root.join("footer.html"), "OLD").expect("write");
        let mut registry = FileModuleRegistry::new();
        registry.ensure_loaded(&[root.clone()]).expect("load");
        let roots = [Some(root.clone())];
        assert!(!libraries_changed(&registry, &roots, None));

        fs::write(root.join("footer.html"), "NEW").expect("rewrite");
        push_mtime_forward(&root.join("footer.html"));
        assert!(libraries_changed(&registry, &roots, None));

        let order = reload_libraries(&mut registry, &roots, policy(3)).expect("reload");
        assert_eq!(order, vec!["footer"]);
        assert_eq!(registry.source("footer"), Some("NEW"));
        assert!(!libraries_changed(&registry, &roots, None));
    }

    #[test]
    fn deleted_module_is_dropped_from_the_batch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("libs");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(root.join("keep.html"), "v1").expect("write");
        fs::write(root.join("gone.html"), "g").expect("write");
        let mut registry = FileModuleRegistry::new();
        registry.ensure_loaded(&[root.clone()]).expect("load");
        let roots = [Some(root.clone())];

        fs::remove_file(root.join("gone.html")).expect("remove");
        fs::write(root.join("keep.html"), "v2").expect("rewrite");
        push_mtime_forward(&root.join("keep.html"));
        assert!(libraries_changed(&registry, &roots, Some(0.0)));

        let order = reload_libraries(&mut registry, &roots, policy(3)).expect("reload");
        assert_eq!(order, vec!["keep"]);
        assert_eq!(registry.len(), 1);
        assert!(!libraries_changed(&registry, &roots, Some(0.0)));
    }
}
