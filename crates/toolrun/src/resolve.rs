//! Mapping logical command names to executables.
//!
//! Lookup locations are plain values handed to [`Runner::new`](crate::Runner::new),
//! so tests can swap in their own [`ExecutableResolver`].

use std::path::{Path, PathBuf};

use tracing::trace;

use crate::error::ResolveError;

pub trait ExecutableResolver: Send + Sync {
    /// Path of the executable for `command`, or [`ResolveError::NotFound`].
    fn resolve(&self, command: &str) -> Result<PathBuf, ResolveError>;
}

fn not_found(command: &str) -> ResolveError {
    ResolveError::NotFound {
        command: command.to_owned(),
    }
}

/// Looks commands up on `$PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathResolver;

impl ExecutableResolver for PathResolver {
    fn resolve(&self, command: &str) -> Result<PathBuf, ResolveError> {
        which::which(command).map_err(|e| {
            trace!(command, error = %e, "not found on PATH");
            not_found(command)
        })
    }
}

/// Looks commands up in an ordered list of directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirResolver {
    dirs: Vec<PathBuf>,
    path_fallback: bool,
}

impl DirResolver {
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
            path_fallback: false,
        }
    }

    /// Also search `$PATH` when no directory has the command.
    pub fn with_path_fallback(mut self, enabled: bool) -> Self {
        self.path_fallback = enabled;
        self
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

impl ExecutableResolver for DirResolver {
    fn resolve(&self, command: &str) -> Result<PathBuf, ResolveError> {
        for dir in &self.dirs {
            match which::which_in(command, Some(dir), dir) {
                Ok(path) => return Ok(path),
                Err(e) => trace!(command, dir = %dir.display(), error = %e, "not in directory"),
            }
        }
        if self.path_fallback {
            return PathResolver.resolve(command);
        }
        Err(not_found(command))
    }
}

/// A vendored tool tree: `bin/`, `lib/` and `include/` under one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorLayout {
    root: PathBuf,
}

impl VendorLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    pub fn include_dir(&self) -> PathBuf {
        self.root.join("include")
    }

    /// Resolver over `bin/` only.
    pub fn resolver(&self) -> DirResolver {
        DirResolver::new([self.bin_dir()])
    }
}
