//! The resolution bridge: locating modules the isolated context cannot
//! find on its own.
//!
//! The worker process starts with only its own executable directory as a
//! search root. When test code (or a library it drives) needs an auxiliary
//! module by name, the worker-side [`ModuleResolver`] asks the origin-side
//! [`ResolveHelper`] over the control connection; the origin probes its
//! registered modules and search directories and answers with a path or
//! "unknown". Misses are never errors here; the caller's own load failure
//! is left to surface naturally.
//!
//! The worker-side resolver memoizes hits *and* misses so each distinct
//! name triggers at most one remote lookup per worker lifetime, and records
//! the miss *before* asking so a recursive lookup of the same name cannot
//! storm the bridge.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;

/// Origin-side half of the resolution bridge.
///
/// Resolution order: explicitly registered modules first, then a filename
/// probe of each search directory. Failures are silent by design.
#[derive(Default)]
pub struct ResolveHelper {
    modules: Mutex<HashMap<String, PathBuf>>,
    search_dirs: Mutex<Vec<PathBuf>>,
}

impl ResolveHelper {
    /// Creates a helper with no registered modules or search directories.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module the origin already knows the location of.
    pub fn register_module(&self, name: impl Into<String>, path: impl Into<PathBuf>) {
        let mut modules = self.modules.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        modules.insert(name.into(), path.into());
    }

    /// Adds a directory to probe for modules by filename.
    pub fn add_search_dir(&self, dir: impl Into<PathBuf>) {
        let mut dirs = self.search_dirs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        dirs.push(dir.into());
    }

    /// Locates a module by name, or reports `None` for a true unknown.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        {
            let modules = self.modules.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(path) = modules.get(name) {
                return Some(path.clone());
            }
        }

        let dirs = self.search_dirs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for dir in dirs.iter() {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }

        debug!(module = name, "module unknown to the origin context");
        None
    }
}

/// The lookup a [`ModuleResolver`] delegates to on a cache miss.
///
/// In the worker this forwards over the control connection; tests can
/// substitute a local closure.
pub type ResolveLookup = Box<dyn Fn(&str) -> Option<PathBuf> + Send + Sync>;

/// Worker-side half of the resolution bridge, with memoized results.
pub struct ModuleResolver {
    resolved: Mutex<HashMap<String, Option<PathBuf>>>,
    lookup: ResolveLookup,
}

impl ModuleResolver {
    /// Creates a resolver that consults `lookup` on cache misses.
    #[must_use]
    pub fn new(lookup: ResolveLookup) -> Self {
        Self {
            resolved: Mutex::new(HashMap::new()),
            lookup,
        }
    }

    /// Resolves a module name, consulting the origin at most once per
    /// distinct name.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        {
            let mut resolved = self
                .resolved
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(known) = resolved.get(name) {
                return known.clone();
            }
            // Record the miss up front so a recursive lookup of the same
            // name short-circuits instead of re-entering the bridge.
            resolved.insert(name.to_string(), None);
        }

        let located = (self.lookup)(name);
        if let Some(path) = &located {
            let mut resolved = self
                .resolved
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            resolved.insert(name.to_string(), Some(path.clone()));
        } else {
            debug!(module = name, "module not resolvable through the bridge");
        }

        located
    }
}
