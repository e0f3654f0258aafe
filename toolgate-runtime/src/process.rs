//! Bounded subprocess execution.
//!
//! Processes run without a shell, with a scrubbed environment, a wall-clock
//! timeout and (on unix) CPU and address-space rlimits. Output is read
//! concurrently from both pipes with a per-stream capture ceiling so a noisy
//! process cannot exhaust memory.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::limits::ExecutionLimits;

const INHERITED_ENV: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR", "SYSTEMROOT"];

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("process timed out after {limit:?}")]
    Timeout { limit: Duration },
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Either stream hit `max_capture_bytes`.
    pub overflowed: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `argv` in `cwd`, optionally feeding `stdin`, and wait for it within
/// `limits.timeout`. The child is killed if the timeout expires or the
/// returned future is dropped.
pub async fn run(
    argv: &[String],
    cwd: &Path,
    stdin: Option<&[u8]>,
    limits: &ExecutionLimits,
) -> Result<ProcessOutput, ProcessError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(ProcessError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty argv",
        )));
    };
    let started = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env_clear();
    for key in INHERITED_ENV {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    apply_rlimits(&mut cmd, limits);

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;
    debug!(program = %program, pid = ?child.id(), "spawned tool process");

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // A child that exits without reading its input is not an error here;
        // its exit status says what happened.
        if let Err(err) = pipe.write_all(input).await {
            debug!(error = %err, "child closed stdin early");
        }
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let ceiling = limits.max_capture_bytes;

    let waited = tokio::time::timeout(limits.timeout, async {
        let (out, err, status) = tokio::join!(
            read_bounded(stdout, ceiling),
            read_bounded(stderr, ceiling),
            child.wait()
        );
        (out, err, status)
    })
    .await;

    match waited {
        Ok(((stdout, out_over), (stderr, err_over), status)) => {
            let status = status?;
            Ok(ProcessOutput {
                exit_code: status.code(),
                stdout,
                stderr,
                overflowed: out_over || err_over,
                elapsed: started.elapsed(),
            })
        }
        Err(_) => {
            warn!(program = %program, limit = ?limits.timeout, "tool process timed out; killing");
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill timed out process");
            }
            Err(ProcessError::Timeout {
                limit: limits.timeout,
            })
        }
    }
}

async fn read_bounded<R: AsyncRead + Unpin>(reader: Option<R>, ceiling: usize) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];
    let mut overflowed = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = ceiling.saturating_sub(buf.len());
                if n > room {
                    buf.extend_from_slice(&chunk[..room]);
                    overflowed = true;
                    // Keep draining so the child never blocks on a full pipe.
                    continue;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
    (buf, overflowed)
}

#[cfg(unix)]
fn apply_rlimits(cmd: &mut Command, limits: &ExecutionLimits) {
    let cpu = limits.cpu_seconds;
    let memory = limits.memory_mb.map(|mb| mb.saturating_mul(1024 * 1024));
    if cpu.is_none() && memory.is_none() {
        return;
    }
    // SAFETY: the closure runs in the forked child before exec and only calls
    // setrlimit, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            if let Some(secs) = cpu {
                set_rlimit(libc::RLIMIT_CPU, secs)?;
            }
            if let Some(bytes) = memory {
                set_rlimit(libc::RLIMIT_AS, bytes)?;
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_rlimits(_cmd: &mut Command, _limits: &ExecutionLimits) {}

#[cfg(all(unix, target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type Resource = libc::c_int;

#[cfg(unix)]
fn set_rlimit(resource: Resource, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid, initialized rlimit struct.
    if unsafe { libc::setrlimit(resource, &limit) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(&argv(&["echo", "hello"]), dir.path(), None, &ExecutionLimits::default())
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout), "hello\n");
        assert!(!out.overflowed);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let argv = argv(&["sh", "-c", "echo oops >&2; exit 3"]);
        let out = run(&argv, dir.path(), None, &ExecutionLimits::default())
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(String::from_utf8_lossy(&out.stderr), "oops\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let limits = ExecutionLimits {
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let started = Instant::now();
        let err = run(&argv(&["sleep", "5"]), dir.path(), None, &limits)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(&argv(&["cat"]), dir.path(), Some(b"piped"), &ExecutionLimits::default())
            .await
            .unwrap();
        assert_eq!(out.stdout, b"piped");
    }

    #[tokio::test]
    async fn test_capture_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let limits = ExecutionLimits {
            max_capture_bytes: 10,
            ..Default::default()
        };
        let out = run(&argv(&["sh", "-c", "yes | head -c 100000"]), dir.path(), None, &limits)
            .await
            .unwrap();
        assert_eq!(out.stdout.len(), 10);
        assert!(out.overflowed);
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(&argv(&["env"]), dir.path(), None, &ExecutionLimits::default())
            .await
            .unwrap();
        let env = String::from_utf8_lossy(&out.stdout);
        for line in env.lines() {
            let key = line.split('=').next().unwrap_or_default();
            let shell_own = matches!(key, "" | "PWD" | "SHLVL" | "_");
            assert!(
                INHERITED_ENV.contains(&key) || shell_own,
                "unexpected env var {key}"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let argv = argv(&["definitely-not-a-real-binary-xyz"]);
        let err = run(&argv, dir.path(), None, &ExecutionLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
