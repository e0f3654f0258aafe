//! Append-only audit trail.
//!
//! Events are grouped into streams: one per run plus a gateway stream for
//! events that belong to no run (policy reloads, endpoint state changes,
//! capability probes). Each stream is a JSONL file with strictly increasing
//! sequence numbers that continue across restarts. Only a bounded number of
//! stream files stay open; the least recently written one is closed first
//! and picks up its sequence from disk when it is written again.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

use chrono::DateTime;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

/// Stream name used for events with no run id.
pub const GATEWAY_STREAM: &str = "gateway";
const RECENT_PER_STREAM: usize = 256;
pub const DEFAULT_MAX_OPEN_STREAMS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ToolCallDenied,
    ToolCallCompleted,
    ToolCallFailed,
    ToolCallTimedOut,
    RemoteCallCompleted,
    RemoteCallFailed,
    RemoteCallRefused,
    EndpointStateChanged,
    CapabilityProbe,
    PolicyReloaded,
    PolicyReloadFailed,
    CheckpointSaved,
    OutputAcknowledged,
    TokensRecorded,
    RunCancelled,
    RunResumed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub kind: AuditKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

/// An event before the log assigns its sequence number and timestamp.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    run_id: Option<String>,
    kind: AuditKind,
    policy_version: Option<u64>,
    payload: Value,
}

impl AuditRecord {
    pub fn new(kind: AuditKind) -> Self {
        Self {
            run_id: None,
            kind,
            policy_version: None,
            payload: Value::Null,
        }
    }

    pub fn run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn policy_version(mut self, version: u64) -> Self {
        self.policy_version = Some(version);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

/// Patterns for content that should be redacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionPolicy {
    pub patterns: Vec<String>,
    /// Object keys whose values are always replaced, whatever they contain.
    pub sensitive_keys: String,
    pub replacement: String,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self {
            patterns: vec![
                r"(?i)(api[_-]?key|secret|token|password)\s*[=:]\s*\S+".into(),
                r"sk-[a-zA-Z0-9]{20,}".into(),
                r"Bearer\s+[a-zA-Z0-9._-]+".into(),
            ],
            sensitive_keys: concat!(
                r"(?i)^(authorization|cookie|password|secret|client[_-]?secret",
                r"|api[_-]?key|token|(access|auth|bearer)[_-]?token)$",
            )
            .into(),
            replacement: "[REDACTED]".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: Vec<Regex>,
    sensitive_keys: Option<Regex>,
    replacement: String,
}

impl Redactor {
    pub fn new(policy: &RedactionPolicy) -> Result<Self, regex::Error> {
        Ok(Self {
            patterns: policy
                .patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
            sensitive_keys: Some(Regex::new(&policy.sensitive_keys)?),
            replacement: policy.replacement.clone(),
        })
    }

    pub fn redact_str(&self, text: &str) -> String {
        let mut out = text.to_string();
        for pattern in &self.patterns {
            if pattern.is_match(&out) {
                out = pattern
                    .replace_all(&out, self.replacement.as_str())
                    .into_owned();
            }
        }
        out
    }

    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact_str(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.redact_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, v)| {
                        let sensitive = self
                            .sensitive_keys
                            .as_ref()
                            .is_some_and(|re| re.is_match(key));
                        let v = if sensitive {
                            Value::String(self.replacement.clone())
                        } else {
                            self.redact_value(v)
                        };
                        (key.clone(), v)
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl Default for Redactor {
    fn default() -> Self {
        let policy = RedactionPolicy::default();
        Self::new(&policy).unwrap_or_else(|err| {
            error!(error = %err, "built-in redaction patterns failed to compile");
            Self {
                patterns: Vec::new(),
                sensitive_keys: None,
                replacement: policy.replacement,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

struct Stream {
    next_seq: u64,
    file: Option<File>,
    recent: VecDeque<AuditEvent>,
    last_used: u64,
}

/// Open streams keyed by file name, so a run called `gateway` never shares
/// the gateway stream.
#[derive(Default)]
struct Streams {
    open: HashMap<String, Stream>,
    clock: u64,
}

impl Streams {
    /// Close the least recently written stream.
    fn evict_one(&mut self) {
        let oldest = self
            .open
            .iter()
            .min_by_key(|(_, stream)| stream.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.open.remove(&key);
        }
    }
}

pub struct AuditLog {
    dir: Option<PathBuf>,
    redactor: Redactor,
    max_open_streams: usize,
    streams: Mutex<Streams>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Keep events in memory only.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            redactor: Redactor::default(),
            max_open_streams: DEFAULT_MAX_OPEN_STREAMS,
            streams: Mutex::new(Streams::default()),
        }
    }

    /// Persist streams as `run-<id>.jsonl` / `gateway.jsonl` under `dir`.
    pub fn open(dir: &Path) -> Result<Self, AuditError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            redactor: Redactor::default(),
            max_open_streams: DEFAULT_MAX_OPEN_STREAMS,
            streams: Mutex::new(Streams::default()),
        })
    }

    /// Bound on stream files held open at once. In-memory logs never close
    /// a stream, since their events exist nowhere else.
    pub fn with_max_open_streams(mut self, max: usize) -> Self {
        self.max_open_streams = max.max(1);
        self
    }

    /// Whether events survive the process.
    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn stream_path(&self, run_id: Option<&str>) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(stream_file(run_id)))
    }

    /// Append one event. The payload is redacted before it is stored.
    pub fn record(&self, record: AuditRecord) -> Result<AuditEvent, AuditError> {
        let key = stream_file(record.run_id.as_deref());
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.clock += 1;
        let now = streams.clock;
        if !streams.open.contains_key(&key) {
            if self.is_persistent() {
                while streams.open.len() >= self.max_open_streams {
                    streams.evict_one();
                }
            }
            let stream = self.open_stream(record.run_id.as_deref())?;
            streams.open.insert(key.clone(), stream);
        }
        let Some(stream) = streams.open.get_mut(&key) else {
            return Err(AuditError::Io(std::io::Error::other("audit stream vanished")));
        };
        stream.last_used = now;

        let event = AuditEvent {
            seq: stream.next_seq,
            ts: Utc::now(),
            run_id: record.run_id,
            kind: record.kind,
            policy_version: record.policy_version,
            payload: self.redactor.redact_value(&record.payload),
        };
        if let Some(file) = stream.file.as_mut() {
            let mut line = serde_json::to_string(&event)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
            file.flush()?;
        }
        stream.next_seq += 1;
        stream.recent.push_back(event.clone());
        if stream.recent.len() > RECENT_PER_STREAM {
            stream.recent.pop_front();
        }
        Ok(event)
    }

    /// Record, logging instead of failing. For call sites where the action
    /// itself has already happened.
    pub fn emit(&self, record: AuditRecord) -> Option<AuditEvent> {
        let kind = record.kind;
        match self.record(record) {
            Ok(event) => Some(event),
            Err(err) => {
                error!(error = %err, ?kind, "failed to write audit event");
                None
            }
        }
    }

    /// Events this process recorded while the stream was open, oldest first.
    pub fn recent(&self, run_id: Option<&str>) -> Vec<AuditEvent> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams
            .open
            .get(&stream_file(run_id))
            .map(|stream| stream.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Last `limit` events of a stream, read from disk when persisted.
    pub fn tail(&self, run_id: Option<&str>, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        let Some(path) = self.stream_path(run_id) else {
            let mut events = self.recent(run_id);
            let skip = events.len().saturating_sub(limit);
            return Ok(events.split_off(skip));
        };
        read_events(&path, Some(limit))
    }

    /// Every event of a stream, oldest first.
    pub fn events(&self, run_id: Option<&str>) -> Result<Vec<AuditEvent>, AuditError> {
        match self.stream_path(run_id) {
            Some(path) => read_events(&path, None),
            None => Ok(self.recent(run_id)),
        }
    }

    /// Release a persisted stream's file handle and buffered events. The
    /// next event for it reopens the file.
    pub fn close_stream(&self, run_id: Option<&str>) {
        if !self.is_persistent() {
            return;
        }
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.open.remove(&stream_file(run_id));
    }

    pub fn open_streams(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .len()
    }

    fn open_stream(&self, run_id: Option<&str>) -> Result<Stream, AuditError> {
        let Some(dir) = &self.dir else {
            return Ok(Stream {
                next_seq: 1,
                file: None,
                recent: VecDeque::new(),
                last_used: 0,
            });
        };
        let path = dir.join(stream_file(run_id));
        let next_seq = last_seq(&path)?.map_or(1, |seq| seq + 1);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !ends_with_newline(&path)? {
            file.write_all(b"\n")?;
        }
        Ok(Stream {
            next_seq,
            file: Some(file),
            recent: VecDeque::new(),
            last_used: 0,
        })
    }
}

fn stream_file(run_id: Option<&str>) -> String {
    match run_id {
        Some(run_id) => format!("run-{run_id}.jsonl"),
        None => format!("{GATEWAY_STREAM}.jsonl"),
    }
}

/// Highest sequence number already in a stream file. Lines that do not
/// parse (a torn final write) are skipped.
fn last_seq(path: &Path) -> Result<Option<u64>, AuditError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Ok(event) = serde_json::from_str::<AuditEvent>(&line) {
            last = Some(last.map_or(event.seq, |prev: u64| prev.max(event.seq)));
        }
    }
    Ok(last)
}

fn ends_with_newline(path: &Path) -> Result<bool, AuditError> {
    use std::io::Read;
    use std::io::Seek;
    use std::io::SeekFrom;

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Parsed events of a stream file, keeping only the last `limit` when set.
fn read_events(path: &Path, limit: Option<usize>) -> Result<Vec<AuditEvent>, AuditError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut events = VecDeque::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Ok(event) = serde_json::from_str::<AuditEvent>(&line) {
            match limit {
                Some(0) => {}
                Some(limit) if events.len() == limit => {
                    events.pop_front();
                    events.push_back(event);
                }
                _ => events.push_back(event),
            }
        }
    }
    Ok(events.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_sequence_numbers_per_stream() {
        let log = AuditLog::in_memory();
        let a = log.record(AuditRecord::new(AuditKind::ToolCallCompleted).run("r1")).unwrap();
        let b = log.record(AuditRecord::new(AuditKind::ToolCallDenied).run("r1")).unwrap();
        let c = log.record(AuditRecord::new(AuditKind::PolicyReloaded)).unwrap();
        assert_eq!((a.seq, b.seq, c.seq), (1, 2, 1));
        assert_eq!(log.recent(Some("r1")).len(), 2);
        assert_eq!(log.recent(None)[0].kind, AuditKind::PolicyReloaded);
    }

    #[test]
    fn test_payload_is_redacted() {
        let log = AuditLog::in_memory();
        let event = log
            .record(AuditRecord::new(AuditKind::ToolCallCompleted).run("r1").payload(json!({
                "command": "curl -H 'Authorization: Bearer abc.def' https://x",
                "api_key": "plain-value",
                "nested": ["password=hunter2", "fine"],
            })))
            .unwrap();
        assert_eq!(event.payload["api_key"], "[REDACTED]");
        assert_eq!(
            event.payload["command"],
            "curl -H 'Authorization: [REDACTED]' https://x"
        );
        assert_eq!(event.payload["nested"][0], "[REDACTED]");
        assert_eq!(event.payload["nested"][1], "fine");
    }

    #[test]
    fn test_redactor_openai_style_key() {
        let redactor = Redactor::default();
        assert_eq!(
            redactor.redact_str("key is sk-abcdefghijklmnopqrstuvwxyz"),
            "key is [REDACTED]"
        );
        assert_eq!(redactor.redact_str("nothing here"), "nothing here");
    }

    #[test]
    fn test_jsonl_persistence_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = AuditLog::open(dir.path()).unwrap();
            log.record(AuditRecord::new(AuditKind::ToolCallCompleted).run("r1")).unwrap();
            log.record(AuditRecord::new(AuditKind::ToolCallCompleted).run("r1")).unwrap();
        }
        let path = dir.path().join("run-r1.jsonl");
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        let log = AuditLog::open(dir.path()).unwrap();
        let event = log.record(AuditRecord::new(AuditKind::RunCancelled).run("r1")).unwrap();
        assert_eq!(event.seq, 3);

        let tail = log.tail(Some("r1"), 2).unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(tail[1].kind, AuditKind::RunCancelled);
    }

    #[test]
    fn test_torn_line_is_skipped_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.jsonl");
        std::fs::write(
            &path,
            "{\"seq\":4,\"ts\":\"2025-01-01T00:00:00Z\",\"kind\":\"policy_reloaded\",\"payload\":null}\n{\"seq\":5,\"ts\"",
        )
        .unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        assert_eq!(log.record(AuditRecord::new(AuditKind::PolicyReloaded)).unwrap().seq, 5);
        let tail = log.tail(None, 10).unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn test_concurrent_writers_get_unique_ordered_seqs() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(AuditLog::open(dir.path()).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        log.record(AuditRecord::new(AuditKind::ToolCallCompleted).run("r1"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let events = log.tail(Some("r1"), 1000).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=100).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_named_gateway_gets_its_own_stream() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        let reload = log.record(AuditRecord::new(AuditKind::PolicyReloaded)).unwrap();
        let run = log
            .record(AuditRecord::new(AuditKind::ToolCallCompleted).run(GATEWAY_STREAM))
            .unwrap();
        assert_eq!((reload.seq, run.seq), (1, 1));
        assert!(dir.path().join("run-gateway.jsonl").exists());
        assert_eq!(log.tail(None, 10).unwrap().len(), 1);
        assert_eq!(log.recent(Some(GATEWAY_STREAM))[0].kind, AuditKind::ToolCallCompleted);
        assert_eq!(log.recent(None)[0].kind, AuditKind::PolicyReloaded);
    }

    #[test]
    fn test_idle_streams_are_closed_and_resume_their_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap().with_max_open_streams(2);
        for run in ["r1", "r2", "r3", "r4"] {
            log.record(AuditRecord::new(AuditKind::ToolCallCompleted).run(run)).unwrap();
            log.record(AuditRecord::new(AuditKind::ToolCallCompleted).run(run)).unwrap();
        }
        assert_eq!(log.open_streams(), 2);
        assert!(log.recent(Some("r1")).is_empty());

        let event = log.record(AuditRecord::new(AuditKind::RunCancelled).run("r1")).unwrap();
        assert_eq!(event.seq, 3);
        assert_eq!(log.open_streams(), 2);
        let seqs: Vec<u64> = log.events(Some("r1")).unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        log.close_stream(Some("r1"));
        assert_eq!(log.open_streams(), 1);
    }

    #[test]
    fn test_event_serialization_shape() {
        let log = AuditLog::in_memory();
        let event = log
            .record(AuditRecord::new(AuditKind::CheckpointSaved).run("r9").policy_version(3))
            .unwrap();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "checkpoint_saved");
        assert_eq!(value["run_id"], "r9");
        assert_eq!(value["policy_version"], 3);
    }
}
