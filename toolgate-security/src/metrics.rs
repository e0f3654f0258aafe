use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Completed,
    Failed,
    Denied,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStats {
    pub calls: u64,
    pub failures: u64,
    pub denials: u64,
    pub total_latency_ms: u64,
}

impl ToolStats {
    pub fn mean_latency_ms(&self) -> Option<u64> {
        let executed = self.calls.saturating_sub(self.denials);
        (executed > 0).then(|| self.total_latency_ms / executed)
    }
}

/// Point-in-time counters, written to `metrics.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    pub tools: BTreeMap<String, ToolStats>,
    /// Tokens reported per run.
    pub tokens: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct MetricsRecorder {
    path: Option<PathBuf>,
    inner: Mutex<MetricsSnapshot>,
}

impl MetricsRecorder {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn persisted(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            inner: Mutex::new(MetricsSnapshot::default()),
        }
    }

    pub fn record_call(&self, tool: &str, outcome: CallOutcome, latency: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = inner.tools.entry(tool.to_string()).or_default();
        stats.calls += 1;
        match outcome {
            CallOutcome::Completed => {}
            CallOutcome::Failed => stats.failures += 1,
            CallOutcome::Denied => stats.denials += 1,
        }
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        stats.total_latency_ms = stats.total_latency_ms.saturating_add(millis);
    }

    pub fn record_tokens(&self, run_id: &str, tokens: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let total = inner.tokens.entry(run_id.to_string()).or_default();
        *total = total.saturating_add(tokens);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        snapshot.generated_at = Some(Utc::now());
        snapshot
    }

    /// Write the current snapshot, replacing the previous file atomically.
    /// Returns `None` for in-memory recorders.
    pub fn write_snapshot(&self) -> std::io::Result<Option<PathBuf>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let snapshot = self.snapshot();
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &snapshot)?;
        tmp.write_all(b"\n")?;
        tmp.persist(path).map_err(|err| err.error)?;
        Ok(Some(path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_calls_and_tokens() {
        let metrics = MetricsRecorder::in_memory();
        metrics.record_call("read_file", CallOutcome::Completed, Duration::from_millis(10));
        metrics.record_call("read_file", CallOutcome::Failed, Duration::from_millis(30));
        metrics.record_call("read_file", CallOutcome::Denied, Duration::ZERO);
        metrics.record_tokens("r1", 100);
        metrics.record_tokens("r1", 50);

        let snapshot = metrics.snapshot();
        let stats = &snapshot.tools["read_file"];
        assert_eq!(
            stats,
            &ToolStats {
                calls: 3,
                failures: 1,
                denials: 1,
                total_latency_ms: 40,
            }
        );
        assert_eq!(stats.mean_latency_ms(), Some(20));
        assert_eq!(snapshot.tokens["r1"], 150);
        assert!(snapshot.generated_at.is_some());
    }

    #[test]
    fn test_write_snapshot_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let metrics = MetricsRecorder::persisted(&path);
        metrics.record_call("shell_exec", CallOutcome::Completed, Duration::from_millis(5));
        assert_eq!(metrics.write_snapshot().unwrap(), Some(path.clone()));
        metrics.record_call("shell_exec", CallOutcome::Completed, Duration::from_millis(5));
        metrics.write_snapshot().unwrap();

        let written: MetricsSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.tools["shell_exec"].calls, 2);
    }

    #[test]
    fn test_in_memory_snapshot_is_not_written() {
        assert_eq!(MetricsRecorder::in_memory().write_snapshot().unwrap(), None);
    }
}
