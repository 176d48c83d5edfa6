use std::time::Duration;

/// Failure to map a command name to an executable.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("command not found: {command}")]
    NotFound { command: String },
}

/// Failure of a single [`Runner::run`](crate::Runner::run) call.
///
/// Every variant is returned only after the child has been reaped.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("command output exceeded maximum of {limit} bytes")]
    OutputLimitExceeded { limit: usize },

    /// `stderr` holds the tail of the child's standard error.
    #[error("command exited with status {code}")]
    NonZeroExit { code: i32, stderr: Vec<u8> },

    #[error("command terminated by signal {name} ({signal})")]
    Signal { signal: i32, name: &'static str },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Exit code of a child that ran to completion with a failing status.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Failure to read or parse a tools config file.
#[derive(Debug, thiserror::Error)]
#[error("config error: {0}")]
pub struct ConfigError(pub String);
