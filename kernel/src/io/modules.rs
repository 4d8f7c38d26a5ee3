//! Module registry: the host's record of loaded library code.
//!
//! Library files are snapshotted into memory when first loaded. Steps see the
//! snapshot, not the file on disk, until the reloader refreshes it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use walkdir::WalkDir;

use crate::core::types::LoadedModule;
use crate::io::clock;

/// Capability for discovering and refreshing library modules.
pub trait ModuleRegistry: Send {
    /// Modules currently held, in load order.
    fn loaded_modules(&self) -> Vec<LoadedModule>;

    /// Re-read a single module in place.
    fn reload(&mut self, module: &LoadedModule) -> Result<()>;

    /// Load every library file under `roots` not already held. Returns the
    /// newly loaded modules.
    fn ensure_loaded(&mut self, roots: &[PathBuf]) -> Result<Vec<LoadedModule>>;

    /// `(relative path, source)` of every held module, for include resolution.
    fn sources(&self) -> Vec<(String, String)>;

    /// File mtime recorded when `module` was last read, if the registry
    /// tracks one.
    fn snapshot_mtime(&self, _module: &LoadedModule) -> Option<f64> {
        None
    }

    /// Drop modules whose file no longer exists. Returns their names.
    fn forget_missing(&mut self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
struct ModuleEntry {
    module: LoadedModule,
    relative: String,
    source: String,
    mtime: Option<f64>,
}

/// Registry that snapshots library files from disk.
#[derive(Debug, Clone, Default)]
pub struct FileModuleRegistry {
    entries: Vec<ModuleEntry>,
}

impl FileModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.module.name == name)
            .map(|e| e.source.as_str())
    }
}

/// Dotted module name for a file relative to its root (`pkg/sub/leaf.py` → `pkg.sub.leaf`).
pub fn module_name(relative: &Path) -> String {
    let without_ext = relative.with_extension("");
    without_ext
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(".")
}

/// Hidden entries and bytecode caches under a root are never modules.
fn is_skipped(relative: &Path) -> bool {
    relative.components().any(|c| {
        let part = c.as_os_str().to_string_lossy();
        part.starts_with('.') || part == "__pycache__"
    })
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read module {}", path.display()))
}

impl ModuleRegistry for FileModuleRegistry {
    fn loaded_modules(&self) -> Vec<LoadedModule> {
        self.entries.iter().map(|e| e.module.clone()).collect()
    }

    fn reload(&mut self, module: &LoadedModule) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.module == *module)
            .with_context(|| format!("module '{}' is not loaded", module.name))?;
        let mtime = clock::mtime(&module.path);
        entry.source = read_source(&module.path)?;
        entry.mtime = mtime;
        debug!(module = %module.name, "module reloaded");
        Ok(())
    }

    fn ensure_loaded(&mut self, roots: &[PathBuf]) -> Result<Vec<LoadedModule>> {
        self.forget_missing();
        let mut loaded = Vec::new();
        for root in roots {
            if !root.is_dir() {
                continue;
            }
            let mut files: Vec<PathBuf> = WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .map(|e| e.into_path())
                .filter(|p| p.is_file() && p.strip_prefix(root).is_ok_and(|rel| !is_skipped(rel)))
                .collect();
            files.sort();
            for path in files {
                if self.entries.iter().any(|e| e.module.path == path) {
                    continue;
                }
                let relative = path
                    .strip_prefix(root)
                    .with_context(|| format!("relativize {}", path.display()))?;
                let module = LoadedModule {
                    name: module_name(relative),
                    path: path.clone(),
                };
                let mtime = clock::mtime(&path);
                let source = read_source(&path)?;
                self.entries.push(ModuleEntry {
                    module: module.clone(),
                    relative: relative.to_string_lossy().replace('\\', "/"),
                    source,
                    mtime,
                });
                loaded.push(module);
            }
        }
        if !loaded.is_empty() {
            debug!(count = loaded.len(), "library modules loaded");
        }
        Ok(loaded)
    }

    fn sources(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|e| (e.relative.clone(), e.source.clone()))
            .collect()
    }

    fn snapshot_mtime(&self, module: &LoadedModule) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.module == *module)
            .and_then(|e| e.mtime)
    }

    fn forget_missing(&mut self) -> Vec<String> {
        let (kept, gone): (Vec<ModuleEntry>, Vec<ModuleEntry>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.module.path.is_file());
        self.entries = kept;
        let names: Vec<String> = gone.into_iter().map(|e| e.module.name).collect();
        if !names.is_empty() {
            debug!(modules = ?names, "deleted library modules forgotten");
        }
        names
    }
}
