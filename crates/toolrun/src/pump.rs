//! Readiness loop that feeds a child's stdin while draining its stdout and
//! stderr.
//!
//! All three pipes are serviced from one `tokio::select!` so a child that
//! blocks on a full stdout pipe while we are still writing its stdin cannot
//! deadlock the call. The loop has no notion of time; the caller bounds it
//! with the invocation deadline.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::ChildStdin;
use tracing::{debug, trace};

use crate::process::Pipes;

/// Read buffer size per stream.
const READ_CHUNK: usize = 64 * 1024;

/// Bytes of stderr kept for error reporting.
pub(crate) const STDERR_TAIL: usize = 4 * 1024;

/// What the child produced once both output streams reached end-of-file.
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub stdout: Vec<u8>,
    pub stderr_tail: Vec<u8>,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Finished(Captured),
    /// stdout grew past the cap; nothing more was read.
    LimitExceeded,
}

/// Drive the child's pipes until stdin is fully written (or abandoned) and
/// both stdout and stderr are closed.
///
/// stdout is never buffered beyond `max_output + 1` bytes. stderr goes to
/// `sink` when one is given and is otherwise dropped, apart from a short tail.
pub(crate) async fn pump(
    pipes: Pipes,
    input: &[u8],
    mut sink: Option<&mut (dyn AsyncWrite + Unpin + Send)>,
    max_output: usize,
) -> io::Result<Outcome> {
    let Pipes {
        mut stdin,
        mut stdout,
        mut stderr,
    } = pipes;

    if input.is_empty() {
        // Dropping the write end signals EOF straight away.
        stdin = None;
    }

    let mut written = 0usize;
    let mut captured = Captured::default();
    let mut stdout_buf = vec![0u8; READ_CHUNK];
    let mut stderr_buf = vec![0u8; READ_CHUNK];
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdin.is_some() || stdout_open || stderr_open {
        let pending = input.get(written..).unwrap_or_default();
        let room = max_output
            .saturating_sub(captured.stdout.len())
            .saturating_add(1);
        let stdout_window = window(&mut stdout_buf, room);

        tokio::select! {
            result = write_some(stdin.as_mut(), pending), if stdin.is_some() => {
                match result {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => {
                        written += n;
                        if written >= input.len() {
                            trace!(bytes = written, "stdin fully written; closing");
                            stdin = None;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        debug!(
                            written,
                            remaining = input.len().saturating_sub(written),
                            "child closed stdin before consuming all input"
                        );
                        stdin = None;
                    }
                    Err(e) => return Err(e),
                }
            }
            result = stdout.read(stdout_window), if stdout_open => {
                let n = result?;
                if n == 0 {
                    trace!(bytes = captured.stdout.len(), "stdout closed");
                    stdout_open = false;
                } else if captured.stdout.len().saturating_add(n) > max_output {
                    debug!(limit = max_output, "stdout exceeded output cap");
                    return Ok(Outcome::LimitExceeded);
                } else {
                    captured
                        .stdout
                        .extend_from_slice(stdout_buf.get(..n).unwrap_or_default());
                }
            }
            result = stderr.read(&mut stderr_buf), if stderr_open => {
                let n = result?;
                if n == 0 {
                    trace!("stderr closed");
                    stderr_open = false;
                } else {
                    let chunk = stderr_buf.get(..n).unwrap_or_default();
                    keep_tail(&mut captured.stderr_tail, chunk);
                    if let Some(sink) = sink.as_deref_mut() {
                        sink.write_all(chunk).await?;
                    }
                }
            }
        }
    }

    if let Some(sink) = sink.as_deref_mut() {
        sink.flush().await?;
    }

    Ok(Outcome::Finished(captured))
}

/// Write as much of `chunk` as the pipe accepts right now. Never completes
/// when there is no stdin, so a disabled `select!` branch stays inert.
async fn write_some(stdin: Option<&mut ChildStdin>, chunk: &[u8]) -> io::Result<usize> {
    match stdin {
        Some(stdin) => stdin.write(chunk).await,
        None => std::future::pending().await,
    }
}

/// The first `len` bytes of `buf`, or all of it.
fn window(buf: &mut [u8], len: usize) -> &mut [u8] {
    let len = len.min(buf.len());
    buf.split_at_mut(len).0
}

fn keep_tail(tail: &mut Vec<u8>, chunk: &[u8]) {
    tail.extend_from_slice(chunk);
    let excess = tail.len().saturating_sub(STDERR_TAIL);
    if excess > 0 {
        tail.drain(..excess);
    }
}
