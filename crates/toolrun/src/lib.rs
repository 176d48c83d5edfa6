//! Run external command-line tools as subprocesses, one call at a time.
//!
//! A [`Runner`] binds a command name to a resolved executable and a
//! [`RunnerConfig`]. Each [`Runner::run`] call spawns the tool in its own
//! process group, streams optional input into its stdin while draining stdout
//! and stderr, and returns the captured stdout.
//!
//! ## Guarantees
//!
//! - One deadline covers writing input, reading output and waiting for exit.
//! - stdout beyond `max_output_size` bytes is never buffered.
//! - The child is reaped on every path, including timeouts and dropped futures.
//! - On timeout the whole process group gets SIGTERM, then SIGKILL after
//!   `kill_grace_ms`.
//!
//! Tool locations come from an [`ExecutableResolver`]: [`PathResolver`] for
//! `$PATH`, [`DirResolver`] for explicit directories, or a [`ToolsConfig`]
//! loaded from YAML with [`config::load`].

pub mod config;
mod defaults;
mod error;
mod process;
mod pump;
mod resolve;
mod runner;

pub use config::{CommandConfig, RunnerConfig, ToolsConfig};
pub use defaults::DefaultArgs;
pub use error::{ConfigError, ResolveError, Result, RunnerError};
pub use resolve::{DirResolver, ExecutableResolver, PathResolver, VendorLayout};
pub use runner::{RunOptions, Runner};
