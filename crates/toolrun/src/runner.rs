use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::process::Command;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::config::RunnerConfig;
use crate::defaults::DefaultArgs;
use crate::error::{ResolveError, Result, RunnerError};
use crate::process::{RunningProcess, Termination, signal_name};
use crate::pump::{self, Captured, Outcome};
use crate::resolve::ExecutableResolver;

/// Used when `start + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Per-call inputs for [`Runner::run`].
#[derive(Default)]
pub struct RunOptions<'a> {
    stdin: Option<&'a [u8]>,
    stderr: Option<&'a mut (dyn AsyncWrite + Unpin + Send)>,
}

impl<'a> RunOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes to feed to the child's stdin. Without this the child reads from
    /// `/dev/null`.
    pub fn stdin(mut self, input: &'a [u8]) -> Self {
        self.stdin = Some(input);
        self
    }

    /// Where the child's stderr goes. Without this it is discarded.
    pub fn stderr(mut self, sink: &'a mut (dyn AsyncWrite + Unpin + Send)) -> Self {
        self.stderr = Some(sink);
        self
    }
}

/// An external tool bound to a resolved executable, a time budget and an
/// output cap.
///
/// ```no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// use std::time::Duration;
/// use toolrun::{PathResolver, RunOptions, Runner, RunnerConfig};
///
/// let config = RunnerConfig::default().with_timeout(Duration::from_secs(10));
/// let wasm_opt = Runner::new("wasm-opt", &PathResolver, config)?;
/// let optimized = wasm_opt
///     .run(&["-O4"], RunOptions::new().stdin(b"(module)"))
///     .await?;
/// # let _ = optimized;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Runner {
    command: String,
    program: PathBuf,
    default_args: Vec<String>,
    config: RunnerConfig,
}

impl Runner {
    /// Resolve `command` and bind it to `config`.
    ///
    /// With `config.ignore_missing` an unresolved command is kept verbatim and
    /// any failure is reported by [`Runner::run`] as [`RunnerError::Spawn`].
    pub fn new<R>(
        command: &str,
        resolver: &R,
        config: RunnerConfig,
    ) -> std::result::Result<Self, ResolveError>
    where
        R: ExecutableResolver + ?Sized,
    {
        let program = match resolver.resolve(command) {
            Ok(path) => path,
            Err(err) if config.ignore_missing => {
                debug!(command, error = %err, "command not resolved; deferring to spawn");
                PathBuf::from(command)
            }
            Err(err) => return Err(err),
        };
        trace!(command, program = %program.display(), "resolved command");

        Ok(Self {
            command: command.to_owned(),
            program,
            default_args: DefaultArgs::builtin().for_command(command).to_vec(),
            config,
        })
    }

    /// Replace the arguments appended after the caller's arguments.
    pub fn with_default_args(mut self, args: Vec<String>) -> Self {
        self.default_args = args;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn default_args(&self) -> &[String] {
        &self.default_args
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run the tool once and return everything it wrote to stdout.
    ///
    /// `args` come first on the command line, followed by the command's
    /// default arguments. One deadline, taken when the call starts, bounds
    /// writing stdin, reading the outputs and waiting for exit. The child is
    /// reaped before this returns, whatever the outcome.
    pub async fn run(&self, args: &[&str], options: RunOptions<'_>) -> Result<Vec<u8>> {
        let mut argv: Vec<&str> = Vec::with_capacity(args.len() + self.default_args.len());
        argv.extend_from_slice(args);
        argv.extend(self.default_args.iter().map(String::as_str));

        Invocation {
            program: &self.program,
            args: argv,
            stdin: options.stdin,
            stderr: options.stderr,
            timeout: self.config.timeout(),
            max_output_size: self.config.max_output_size,
            kill_grace: self.config.kill_grace(),
        }
        .execute()
        .await
    }
}

/// Everything one call needs, owned by the call.
///
/// The sink has its own lifetime because `&mut dyn` is invariant in it.
struct Invocation<'a, 's> {
    program: &'a Path,
    args: Vec<&'a str>,
    stdin: Option<&'a [u8]>,
    stderr: Option<&'s mut (dyn AsyncWrite + Unpin + Send)>,
    timeout: Duration,
    max_output_size: usize,
    kill_grace: Duration,
}

impl Invocation<'_, '_> {
    async fn execute(self) -> Result<Vec<u8>> {
        let started = Instant::now();
        let deadline = started.checked_add(self.timeout).unwrap_or(started + FAR_FUTURE);
        let cmd_display = format_command_display(self.program, &self.args);

        let mut command = Command::new(self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| RunnerError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        let mut process = RunningProcess::new(child);
        debug!(command = %cmd_display, pid = ?process.pid(), timeout_ms = self.timeout.as_millis(), "spawned");

        let pipes = match process.take_pipes() {
            Ok(pipes) => pipes,
            Err(e) => {
                process.kill().await;
                return Err(e.into());
            }
        };

        let input = self.stdin.unwrap_or_default();
        let pumped = time::timeout_at(
            deadline,
            pump::pump(pipes, input, self.stderr, self.max_output_size),
        )
        .await;

        let captured = match pumped {
            Ok(Ok(Outcome::Finished(captured))) => captured,
            Ok(Ok(Outcome::LimitExceeded)) => {
                warn!(command = %cmd_display, limit = self.max_output_size, "output limit exceeded; killing");
                process.kill().await;
                return Err(RunnerError::OutputLimitExceeded {
                    limit: self.max_output_size,
                });
            }
            Ok(Err(e)) => {
                warn!(command = %cmd_display, error = %e, "pipe error; killing");
                process.kill().await;
                return Err(e.into());
            }
            Err(_) => {
                warn!(command = %cmd_display, phase = "io", "deadline reached; terminating");
                process.terminate(self.kill_grace).await;
                return Err(RunnerError::Timeout {
                    timeout: self.timeout,
                });
            }
        };

        let status = match time::timeout_at(deadline, process.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(command = %cmd_display, phase = "wait", "deadline reached; terminating");
                process.terminate(self.kill_grace).await;
                return Err(RunnerError::Timeout {
                    timeout: self.timeout,
                });
            }
        };

        debug!(
            command = %cmd_display,
            ?status,
            stdout_len = captured.stdout.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "command finished"
        );
        interpret(Termination::from(status), captured)
    }
}

fn interpret(termination: Termination, captured: Captured) -> Result<Vec<u8>> {
    match termination {
        Termination::Exited(0) => Ok(captured.stdout),
        Termination::Exited(code) => Err(RunnerError::NonZeroExit {
            code,
            stderr: captured.stderr_tail,
        }),
        Termination::Signaled(signal) => Err(RunnerError::Signal {
            signal,
            name: signal_name(signal),
        }),
    }
}

/// Format a human-readable display string for a direct command invocation.
fn format_command_display(program: &Path, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.display().to_string());
    parts.extend(args.iter().map(|arg| (*arg).to_owned()));
    parts.join(" ")
}
