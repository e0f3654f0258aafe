//! External reload trigger.
//!
//! A serving process records its pid in `<state>/toolgate.pid` and reloads
//! the policy bundle on SIGHUP. `toolgate policies reload` reads the pid
//! file and sends the signal.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::gateway::Gateway;

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("cannot read pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("pid file {path} does not hold a process id: `{content}`")]
    InvalidPid { path: PathBuf, content: String },
    #[error("cannot signal process {pid}: {source}")]
    Kill {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Pid file owned by the serving process; removed again on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current pid atomically (temp file plus rename).
    pub fn create(path: &Path) -> io::Result<Self> {
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(tmp.path(), std::process::id().to_string())?;
        tmp.persist(path).map_err(|err| err.error)?;
        info!(path = %path.display(), "pid file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove pid file");
        }
    }
}

pub fn read_pid(path: &Path) -> Result<u32, SignalError> {
    let content = std::fs::read_to_string(path).map_err(|source| SignalError::PidFile {
        path: path.to_path_buf(),
        source,
    })?;
    content
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| SignalError::InvalidPid {
            path: path.to_path_buf(),
            content: content.trim().to_string(),
        })
}

/// Ask the process named in `pid_path` to reload its policy.
#[cfg(unix)]
pub fn send_reload_signal(pid_path: &Path) -> Result<u32, SignalError> {
    let pid = read_pid(pid_path)?;
    let target = libc::pid_t::try_from(pid).map_err(|_| SignalError::InvalidPid {
        path: pid_path.to_path_buf(),
        content: pid.to_string(),
    })?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(target, libc::SIGHUP) };
    if rc != 0 {
        return Err(SignalError::Kill {
            pid,
            source: io::Error::last_os_error(),
        });
    }
    info!(pid, "reload signal sent");
    Ok(pid)
}

#[cfg(not(unix))]
pub fn send_reload_signal(pid_path: &Path) -> Result<u32, SignalError> {
    let pid = read_pid(pid_path)?;
    Err(SignalError::Kill {
        pid,
        source: io::Error::new(io::ErrorKind::Unsupported, "reload signals need a unix host"),
    })
}

/// Reload the gateway's policy on every SIGHUP until `cancel` fires. A
/// failed reload keeps the current policy and is only logged and audited.
#[cfg(unix)]
pub fn spawn_reload_listener(
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
) -> io::Result<JoinHandle<()>> {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match gateway.reload_policy("signal") {
                        Ok(outcome) => {
                            info!(version = outcome.version, "policy reloaded on SIGHUP");
                        }
                        Err(err) => warn!(error = %err, "policy reload on SIGHUP failed"),
                    }
                }
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_reload_listener(
    _gateway: Arc<Gateway>,
    cancel: CancellationToken,
) -> io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move { cancel.cancelled().await }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pid_file_round_trip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/toolgate.pid");
        {
            let pid_file = PidFile::create(&path).unwrap();
            assert_eq!(read_pid(pid_file.path()).unwrap(), std::process::id());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_garbage_pid_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolgate.pid");
        std::fs::write(&path, "not-a-pid\n").unwrap();
        match read_pid(&path).unwrap_err() {
            SignalError::InvalidPid { content, .. } => assert_eq!(content, "not-a-pid"),
            other => panic!("expected InvalidPid, got {other:?}"),
        }
        assert!(matches!(
            read_pid(&dir.path().join("missing.pid")),
            Err(SignalError::PidFile { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_to_missing_process_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolgate.pid");
        // Above the default pid_max on linux, so no such process exists.
        std::fs::write(&path, "4194304").unwrap();
        assert!(matches!(
            send_reload_signal(&path),
            Err(SignalError::Kill { .. }) | Err(SignalError::InvalidPid { .. })
        ));
    }
}
