//! Deepest-first ordering of library modules for reload.

use std::cmp::Reverse;
use std::path::{Path, PathBuf};

use crate::core::types::LoadedModule;

/// File stem marking a package's own module; it sits at its directory's depth.
pub const PACKAGE_MARKER: &str = "__init__";

/// Index of the first root containing `path`, and the module's depth under it.
pub fn locate(path: &Path, roots: &[PathBuf]) -> Option<(usize, usize)> {
    roots.iter().enumerate().find_map(|(index, root)| {
        let relative = path.strip_prefix(root).ok()?;
        Some((index, module_depth(relative)))
    })
}

/// Number of path components, with package markers counted as their directory.
pub fn module_depth(relative: &Path) -> usize {
    let components = relative.components().count();
    let is_marker = relative
        .file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem == PACKAGE_MARKER);
    if is_marker {
        components.saturating_sub(1)
    } else {
        components
    }
}

/// Modules rooted under `roots`, grouped by root in root order and sorted
/// deepest-first within each root. Modules outside every root are dropped.
pub fn reload_order(modules: &[LoadedModule], roots: &[PathBuf]) -> Vec<LoadedModule> {
    let mut keyed: Vec<((usize, Reverse<usize>, PathBuf), &LoadedModule)> = modules
        .iter()
        .filter_map(|module| {
            let (root, depth) = locate(&module.path, roots)?;
            Some(((root, Reverse(depth), module.path.clone()), module))
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, module)| module.clone()).collect()
}
