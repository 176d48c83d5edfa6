use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ResolveError};
use crate::resolve::DirResolver;
use crate::runner::Runner;

pub(crate) const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_MAX_OUTPUT_SIZE: usize = 256 * 1024 * 1024;
pub(crate) const DEFAULT_KILL_GRACE_MS: u64 = 100;

/// Limits applied to every call made through one [`Runner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Budget for a whole call, from spawn to reap.
    pub timeout_ms: u64,
    /// Most stdout bytes a call may return.
    pub max_output_size: usize,
    /// Defer a failed lookup to spawn time instead of failing construction.
    pub ignore_missing: bool,
    /// Time between SIGTERM and SIGKILL once the deadline has passed. Never
    /// more than a quarter of `timeout_ms`, so a child that ignores SIGTERM
    /// costs at most `1.25 * timeout_ms`.
    pub kill_grace_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            ignore_missing: false,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `kill_grace_ms`, capped at a quarter of the timeout.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms.min(self.timeout_ms / 4))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = millis(timeout);
        self
    }

    pub fn with_max_output_size(mut self, bytes: usize) -> Self {
        self.max_output_size = bytes;
        self
    }

    pub fn with_ignore_missing(mut self, ignore: bool) -> Self {
        self.ignore_missing = ignore;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace_ms = millis(grace);
        self
    }
}

/// Per-command overrides. Unset fields fall back to [`ToolsConfig::defaults`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub timeout_ms: Option<u64>,
    pub max_output_size: Option<usize>,
    pub ignore_missing: Option<bool>,
    /// Replaces the built-in trailing arguments for this command.
    pub default_args: Option<Vec<String>>,
}

/// A tools file: where executables live and how each one is run.
///
/// ```yaml
/// bin_dirs: [vendor/binaryen/bin]
/// path_fallback: false
/// defaults:
///   timeout_ms: 30000
/// commands:
///   wasm-opt:
///     max_output_size: 1048576
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub bin_dirs: Vec<PathBuf>,
    pub path_fallback: bool,
    pub defaults: RunnerConfig,
    pub commands: BTreeMap<String, CommandConfig>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            bin_dirs: Vec::new(),
            path_fallback: true,
            defaults: RunnerConfig::default(),
            commands: BTreeMap::new(),
        }
    }
}

/// Load a tools config from a YAML file.
///
/// Relative `bin_dirs` are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> Result<ToolsConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError(format!("read {}: {e}", path.display())))?;
    let mut config: ToolsConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| ConfigError(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    Ok(config)
}

impl ToolsConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        for dir in &mut self.bin_dirs {
            if dir.is_relative() {
                *dir = config_dir.join(&*dir);
            }
        }
    }

    pub fn resolver(&self) -> DirResolver {
        DirResolver::new(self.bin_dirs.iter().cloned()).with_path_fallback(self.path_fallback)
    }

    /// `defaults` with the overrides for `command` applied.
    pub fn runner_config(&self, command: &str) -> RunnerConfig {
        let mut config = self.defaults.clone();
        if let Some(overrides) = self.commands.get(command) {
            if let Some(timeout_ms) = overrides.timeout_ms {
                config.timeout_ms = timeout_ms;
            }
            if let Some(max_output_size) = overrides.max_output_size {
                config.max_output_size = max_output_size;
            }
            if let Some(ignore_missing) = overrides.ignore_missing {
                config.ignore_missing = ignore_missing;
            }
        }
        config
    }

    pub fn runner(&self, command: &str) -> Result<Runner, ResolveError> {
        let runner = Runner::new(command, &self.resolver(), self.runner_config(command))?;
        let default_args = self
            .commands
            .get(command)
            .and_then(|c| c.default_args.clone());
        Ok(match default_args {
            Some(args) => runner.with_default_args(args),
            None => runner,
        })
    }
}
