#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable
)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use toolrun::{
    ExecutableResolver, PathResolver, ResolveError, RunOptions, Runner, RunnerConfig,
    RunnerError, VendorLayout,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}

/// Maps logical names onto system tools so tests do not depend on any
/// vendored binaries.
struct FakeResolver(HashMap<&'static str, PathBuf>);

impl FakeResolver {
    fn new() -> Self {
        Self(HashMap::from([
            ("echo-tool", PathBuf::from("cat")),
            ("shell", PathBuf::from("sh")),
        ]))
    }
}

impl ExecutableResolver for FakeResolver {
    fn resolve(&self, command: &str) -> Result<PathBuf, ResolveError> {
        self.0
            .get(command)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                command: command.to_owned(),
            })
    }
}

fn runner(command: &str, config: RunnerConfig) -> Runner {
    init_tracing();
    Runner::new(command, &FakeResolver::new(), config).expect("resolve")
}

fn with_timeout(timeout: Duration) -> RunnerConfig {
    RunnerConfig::default().with_timeout(timeout)
}

async fn read_pid(path: &Path) -> Pid {
    let text = tokio::fs::read_to_string(path).await.expect("pid file");
    Pid::from_raw(text.trim().parse().expect("pid"))
}

/// Reaped by us: the pid must be gone from the process table.
fn assert_reaped(pid: Pid) {
    assert_eq!(kill(pid, None), Err(Errno::ESRCH), "pid {pid} still exists");
}

/// True once `pid` has exited. A process reparented to init may linger as a
/// zombie until init gets to it, which counts as exited.
fn has_exited(pid: Pid) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
    }
}

async fn wait_exited(pid: Pid) {
    for _ in 0..100 {
        if has_exited(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pid {pid} is still running");
}

#[tokio::test]
async fn echo_tool_returns_input() {
    let echo = runner("echo-tool", with_timeout(Duration::from_secs(2)));
    let out = echo
        .run(&[], RunOptions::new().stdin(b"abc"))
        .await
        .unwrap();
    assert_eq!(out, b"abc");
}

#[tokio::test]
async fn timeout_kills_and_reaps_sleeper() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let timeout = Duration::from_millis(100);
    let shell = runner("shell", with_timeout(timeout));

    let started = Instant::now();
    let err = shell
        .run(
            &["-c", "echo $$ > \"$1\"; exec sleep 5", "sh", pid_file.to_str().unwrap()],
            RunOptions::new(),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout(), "got {err:?}");
    assert!(elapsed >= timeout, "returned early after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(250), "took {elapsed:?}");
    assert_reaped(read_pid(&pid_file).await);
}

#[tokio::test]
async fn output_cap_of_one_byte() {
    let shell = runner("shell", RunnerConfig::default().with_max_output_size(1));
    let err = shell
        .run(&["-c", "head -c 1024 /dev/zero"], RunOptions::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, RunnerError::OutputLimitExceeded { limit: 1 }),
        "got {err:?}"
    );
}

#[tokio::test]
async fn output_cap_kills_and_reaps_endless_writer() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let shell = runner("shell", RunnerConfig::default().with_max_output_size(64 * 1024));

    let err = shell
        .run(
            &["-c", "echo $$ > \"$1\"; exec yes", "sh", pid_file.to_str().unwrap()],
            RunOptions::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::OutputLimitExceeded { .. }), "got {err:?}");
    assert_reaped(read_pid(&pid_file).await);
}

#[tokio::test]
async fn output_exactly_at_cap_succeeds() {
    let shell = runner("shell", RunnerConfig::default().with_max_output_size(1024));
    let out = shell
        .run(&["-c", "head -c 1024 /dev/zero"], RunOptions::new())
        .await
        .unwrap();
    assert_eq!(out.len(), 1024);
}

#[tokio::test]
async fn binary_round_trip_through_cat() {
    // Larger than any pipe buffer in both directions at once.
    let input: Vec<u8> = (0..8 * 1024 * 1024u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
        .collect();
    let echo = runner("echo-tool", with_timeout(Duration::from_secs(20)));
    let out = echo.run(&[], RunOptions::new().stdin(&input)).await.unwrap();
    assert_eq!(out.len(), input.len());
    assert!(out == input, "round trip corrupted bytes");
}

#[tokio::test]
async fn large_input_to_non_reader_times_out() {
    let input = vec![0x5au8; 64 * 1024 * 1024];
    let shell = runner("shell", with_timeout(Duration::from_millis(300)));
    let started = Instant::now();
    let err = shell
        .run(&["-c", "sleep 5"], RunOptions::new().stdin(&input))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn child_closing_stdin_early_still_succeeds() {
    let input = vec![b'x'; 4 * 1024 * 1024];
    let shell = runner("shell", with_timeout(Duration::from_secs(5)));
    let out = shell
        .run(&["-c", "head -c 3 >/dev/null; echo partial"], RunOptions::new().stdin(&input))
        .await
        .unwrap();
    assert_eq!(out, b"partial\n");
}

#[tokio::test]
async fn empty_input_closes_stdin() {
    let echo = runner("echo-tool", with_timeout(Duration::from_secs(2)));
    let out = echo.run(&[], RunOptions::new().stdin(b"")).await.unwrap();
    assert!(out.is_empty());
}

#[tokio::test]
async fn stderr_sink_receives_stderr_only() {
    let shell = runner("shell", RunnerConfig::default());
    let mut sink: Vec<u8> = Vec::new();
    let out = shell
        .run(
            &["-c", "echo to-out; echo to-err >&2; echo more-err >&2"],
            RunOptions::new().stderr(&mut sink),
        )
        .await
        .unwrap();
    assert_eq!(out, b"to-out\n");
    assert_eq!(sink, b"to-err\nmore-err\n");
}

#[tokio::test]
async fn heavy_stderr_without_sink_does_not_block() {
    let shell = runner("shell", with_timeout(Duration::from_secs(5)));
    let out = shell
        .run(&["-c", "head -c 1048576 /dev/zero >&2; echo ok"], RunOptions::new())
        .await
        .unwrap();
    assert_eq!(out, b"ok\n");
}

#[tokio::test]
async fn exit_status_is_reported() {
    let shell = runner("shell", RunnerConfig::default());

    let err = shell.run(&["-c", "exit 1"], RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, RunnerError::NonZeroExit { code: 1, .. }), "got {err:?}");
    assert_eq!(err.to_string(), "command exited with status 1");

    let out = shell.run(&["-c", "exit 0"], RunOptions::new()).await.unwrap();
    assert!(out.is_empty());
}

#[tokio::test]
async fn non_zero_exit_keeps_stderr_tail() {
    let shell = runner("shell", RunnerConfig::default());
    let err = shell
        .run(
            &["-c", "head -c 10000 /dev/zero | tr '\\0' a >&2; echo Fatal >&2; exit 2"],
            RunOptions::new(),
        )
        .await
        .unwrap_err();
    match err {
        RunnerError::NonZeroExit { code, stderr } => {
            assert_eq!(code, 2);
            assert_eq!(stderr.len(), 4096);
            assert!(stderr.ends_with(b"aaFatal\n"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn self_inflicted_signal_is_reported() {
    let shell = runner("shell", RunnerConfig::default());
    let err = shell
        .run(&["-c", "kill -KILL $$"], RunOptions::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, RunnerError::Signal { signal: 9, name: "SIGKILL" }),
        "got {err:?}"
    );
}

#[tokio::test]
async fn timeout_kills_grandchildren() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("grandchild");
    let shell = runner("shell", with_timeout(Duration::from_millis(300)));

    let err = shell
        .run(
            &["-c", "sleep 30 & echo $! > \"$1\"; wait", "sh", pid_file.to_str().unwrap()],
            RunOptions::new(),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "got {err:?}");
    wait_exited(read_pid(&pid_file).await).await;
}

#[tokio::test]
async fn sigterm_ignoring_child_is_killed_after_grace() {
    let config = with_timeout(Duration::from_millis(200)).with_kill_grace(Duration::from_millis(50));
    let shell = runner("shell", config);
    let started = Instant::now();
    let err = shell
        .run(
            &["-c", "trap '' TERM; while :; do sleep 0.05; done"],
            RunOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn short_timeout_bounds_sigterm_grace() {
    // Default 100ms grace would double a 100ms timeout; it is capped at 25ms.
    let timeout = Duration::from_millis(100);
    let shell = runner("shell", with_timeout(timeout));
    let started = Instant::now();
    let err = shell
        .run(
            &["-c", "trap '' TERM; while :; do sleep 0.01; done"],
            RunOptions::new(),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(err.is_timeout(), "got {err:?}");
    assert!(elapsed >= timeout, "returned early after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(190), "took {elapsed:?}");
}

#[tokio::test]
async fn dropped_call_kills_child() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let shell = runner("shell", with_timeout(Duration::from_secs(30)));

    let args = ["-c", "echo $$ > \"$1\"; exec sleep 30", "sh", pid_file.to_str().unwrap()];
    let call = shell.run(&args, RunOptions::new());
    let abandoned = tokio::time::timeout(Duration::from_millis(300), call).await;
    assert!(abandoned.is_err());

    wait_exited(read_pid(&pid_file).await).await;
}

#[tokio::test]
async fn vendored_tool_gets_default_args_last() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let layout = VendorLayout::new(dir.path());
    let bin = layout.bin_dir();
    tokio::fs::create_dir_all(&bin).await.unwrap();
    let tool = bin.join("wasm-opt");
    tokio::fs::write(&tool, "#!/bin/sh\necho \"$@\"\n").await.unwrap();
    tokio::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755))
        .await
        .unwrap();

    let wasm_opt = Runner::new("wasm-opt", &layout.resolver(), RunnerConfig::default()).unwrap();
    assert_eq!(wasm_opt.program(), tool);
    let out = wasm_opt.run(&["-O1", "-g"], RunOptions::new()).await.unwrap();
    assert_eq!(out, b"-O1 -g --output=-\n");
}

#[tokio::test]
async fn missing_command_fails_at_construction_or_spawn() {
    init_tracing();
    let err = Runner::new("toolrun-missing-7d1e", &PathResolver, RunnerConfig::default())
        .unwrap_err();
    assert_eq!(err.to_string(), "command not found: toolrun-missing-7d1e");

    let lenient = Runner::new(
        "toolrun-missing-7d1e",
        &PathResolver,
        RunnerConfig::default().with_ignore_missing(true),
    )
    .unwrap();
    let err = lenient.run(&[], RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, RunnerError::Spawn { .. }), "got {err:?}");
}

#[tokio::test]
async fn tools_config_drives_runner() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
bin_dirs: []
path_fallback: true
defaults:
  timeout_ms: 2000
commands:
  cat:
    max_output_size: 4
"#;
    let path = dir.path().join("tools.yaml");
    tokio::fs::write(&path, yaml).await.unwrap();

    let config = toolrun::config::load(&path).await.unwrap();
    let cat = config.runner("cat").unwrap();
    assert_eq!(cat.config().timeout(), Duration::from_secs(2));

    let out = cat.run(&[], RunOptions::new().stdin(b"four")).await.unwrap();
    assert_eq!(out, b"four");
    let err = cat
        .run(&[], RunOptions::new().stdin(b"fives"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::OutputLimitExceeded { limit: 4 }));
}
