//! Supervised one-shot child processes.
//!
//! Each call spawns exactly one child, captures its output, and enforces a
//! wall-clock timeout. The child runs in its own process group so that on
//! timeout the whole tree (including anything the CLI under test spawned) is
//! terminated before the call returns; an orphaned deploy left running would
//! keep holding pool slots and cost money on the backend.
//!
//! The caller-supplied environment is merged additively over the ambient
//! one, so concurrent tests never observe each other's overrides.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Options for one invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Wall-clock limit. `None` waits indefinitely.
    pub timeout: Option<Duration>,

    /// Capture stderr into the result. When `false`, stderr passes through
    /// to the parent's stderr for live debugging; stdout is still captured.
    pub capture_stderr: bool,

    /// Run the joined argument vector under `sh -c`, permitting redirection
    /// operators. Explicit opt-in: this gives up exact argument-boundary
    /// passing.
    pub shell: bool,

    /// Environment overrides, merged over the ambient environment. Caller
    /// wins on conflict.
    pub env: HashMap<String, String>,

    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            capture_stderr: true,
            shell: false,
            env: HashMap::new(),
            cwd: None,
        }
    }
}

/// Outcome of one invocation.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// Child exit code; `-1` when the child died to a signal.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr; empty in passthrough mode.
    pub stderr: String,
    /// Wall-clock time from spawn to reap.
    pub duration: Duration,
    /// Whether the wall-clock limit fired.
    pub timed_out: bool,
}

impl ProcessResult {
    /// Exit code zero and no timeout.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Process invocation errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The wall-clock limit fired. Carries whatever output was captured
    /// before the process group was killed.
    #[error("`{program}` timed out after {limit:?}")]
    Timeout {
        program: String,
        limit: Duration,
        result: ProcessResult,
    },

    #[error("I/O error while supervising child process: {0}")]
    Io(#[from] io::Error),
}

/// Run `argv` to completion under `opts`.
pub async fn run(argv: &[String], opts: &RunOptions) -> Result<ProcessResult, ProcessError> {
    let program = argv.first().cloned().unwrap_or_default();
    if program.is_empty() {
        return Err(ProcessError::Spawn {
            program: "<empty>".to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector"),
        });
    }

    let mut command = if opts.shell {
        let mut command = Command::new("sh");
        command.arg("-c").arg(argv.join(" "));
        command
    } else {
        let mut command = Command::new(&program);
        command.args(argv.iter().skip(1));
        command
    };

    command
        .envs(&opts.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(if opts.capture_stderr {
            Stdio::piped()
        } else {
            Stdio::inherit()
        })
        .kill_on_drop(true);

    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }

    // Own process group, so a timeout can terminate descendants too.
    #[cfg(unix)]
    command.process_group(0);

    debug!(program = %program, shell = opts.shell, "spawning child process");

    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    // Drain both pipes concurrently; stderr filling its buffer must not
    // deadlock a child that is still writing stdout.
    let stdout_task = tokio::spawn(drain(child.stdout.take()));
    let stderr_task = tokio::spawn(drain(child.stderr.take()));

    let mut timed_out = false;
    let status = match opts.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(program = %program, ?limit, "child exceeded timeout, killing process group");
                timed_out = true;
                kill_process_group(&mut child).await;
                child.wait().await?
            }
        },
        None => child.wait().await?,
    };

    // The kill closed the pipes, so these complete even on the timeout path,
    // returning whatever the child managed to write.
    let stdout_bytes = stdout_task.await.map_err(join_failure)??;
    let stderr_bytes = stderr_task.await.map_err(join_failure)??;

    let result = ProcessResult {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
        duration: start.elapsed(),
        timed_out,
    };

    if timed_out {
        let limit = opts.timeout.unwrap_or_default();
        return Err(ProcessError::Timeout {
            program,
            limit,
            result,
        });
    }

    Ok(result)
}

async fn drain<R>(stream: Option<R>) -> io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let mut buffer = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buffer).await?;
    }
    Ok(buffer)
}

fn join_failure(err: tokio::task::JoinError) -> ProcessError {
    ProcessError::Io(io::Error::new(io::ErrorKind::Other, err))
}

/// Forcibly terminate the child's whole process group.
#[cfg(unix)]
async fn kill_process_group(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = Pid::from_raw(pid as i32);
        if let Err(err) = killpg(pgid, Signal::SIGKILL) {
            warn!(%pgid, error = %err, "failed to kill process group, killing child only");
            let _ = child.start_kill();
        }
    } else {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
async fn kill_process_group(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let result = run(&argv(&["echo", "hello world"]), &RunOptions::default())
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello world");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_result_not_an_error() {
        let result = run(&argv(&["false"]), &RunOptions::default()).await.unwrap();

        assert!(!result.success());
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let result = run(
            &argv(&["definitely-not-a-real-binary-name"]),
            &RunOptions::default(),
        )
        .await;

        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_empty_argv_is_a_spawn_error() {
        let result = run(&[], &RunOptions::default()).await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_env_overrides_win_over_ambient() {
        let opts = RunOptions {
            shell: true,
            env: HashMap::from([("INTEG_PROBE".to_string(), "override-wins".to_string())]),
            ..Default::default()
        };

        let result = run(&argv(&["echo", "$INTEG_PROBE"]), &opts).await.unwrap();
        assert_eq!(result.stdout.trim(), "override-wins");
    }

    #[tokio::test]
    async fn test_ambient_environment_is_inherited() {
        // PATH comes from the ambient environment, not from our overrides.
        let opts = RunOptions {
            shell: true,
            ..Default::default()
        };

        let result = run(&argv(&["echo", "$PATH"]), &opts).await.unwrap();
        assert!(!result.stdout.trim().is_empty());
    }

    #[tokio::test]
    async fn test_stderr_captured_by_default() {
        let opts = RunOptions {
            shell: true,
            ..Default::default()
        };

        let result = run(&argv(&["echo", "out;", "echo", "err", "1>&2"]), &opts)
            .await
            .unwrap();

        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_stderr_passthrough_still_captures_stdout() {
        let opts = RunOptions {
            shell: true,
            capture_stderr: false,
            ..Default::default()
        };

        let result = run(&argv(&["echo", "out;", "echo", "err", "1>&2"]), &opts)
            .await
            .unwrap();

        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr, "");
    }

    #[tokio::test]
    async fn test_shell_mode_supports_input_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        std::fs::write(&input, "redirected input\n").unwrap();

        let opts = RunOptions {
            shell: true,
            ..Default::default()
        };
        let parts = argv(&["cat", "<", input.to_str().unwrap()]);

        let result = run(&parts, &opts).await.unwrap();
        assert_eq!(result.stdout.trim(), "redirected input");
    }

    #[tokio::test]
    async fn test_timeout_kills_child_and_reports_partial_output() {
        let opts = RunOptions {
            shell: true,
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };

        let start = Instant::now();
        let outcome = run(&argv(&["echo", "partial;", "sleep", "30"]), &opts).await;

        match outcome {
            Err(ProcessError::Timeout { result, .. }) => {
                assert!(result.timed_out);
                assert!(!result.success());
                assert_eq!(result.stdout.trim(), "partial");
            }
            other => panic!("expected timeout, got {:?}", other),
        }

        // Returned promptly rather than waiting out the sleep.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_descendants_too() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("grandchild.pid");

        // The shell backgrounds a sleep (our grandchild), records its pid,
        // then waits on it.
        let script = format!(
            "sleep 30 & echo $! > {}; wait",
            pidfile.to_str().unwrap()
        );
        let opts = RunOptions {
            shell: true,
            timeout: Some(Duration::from_millis(300)),
            ..Default::default()
        };

        let outcome = run(&[script], &opts).await;
        assert!(matches!(outcome, Err(ProcessError::Timeout { .. })));

        // Give the kernel a beat to reap the group.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let grandchild: i32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let alive = kill(Pid::from_raw(grandchild), None).is_ok();
        assert!(!alive, "grandchild {} survived the group kill", grandchild);
    }

    #[tokio::test]
    async fn test_fast_command_does_not_time_out() {
        let opts = RunOptions {
            timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        };

        let result = run(&argv(&["echo", "fast"]), &opts).await.unwrap();
        assert!(!result.timed_out);
        assert!(result.success());
    }
}
