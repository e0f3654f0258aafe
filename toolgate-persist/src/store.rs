use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use crate::checkpoint::Checkpoint;

/// Older revisions kept next to the latest one.
pub const DEFAULT_KEEP_REVISIONS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("no checkpoint for run: {0}")]
    NotFound(String),
    #[error("invalid run id: {0}")]
    InvalidRunId(String),
    #[error("run {run_id} has no pending output {output_id}")]
    UnknownOutput { run_id: String, output_id: String },
    #[error("run {run_id} is already at step {current}; refusing to save step {requested}")]
    StaleStep {
        run_id: String,
        current: u64,
        requested: u64,
    },
}

/// Storage backend for checkpoints. Each save is a new revision; loading
/// returns the newest readable one.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
    fn load_latest(&self, run_id: &str) -> Result<Checkpoint, CheckpointError>;
    fn list_runs(&self) -> Result<Vec<String>, CheckpointError>;
}

/// `<base>/<run_id>/<revision>.json`, written through a temp file and a
/// rename so a crash never leaves a half-written revision behind.
pub struct JsonFileStore {
    base_dir: PathBuf,
    keep_revisions: usize,
}

impl JsonFileStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            keep_revisions: DEFAULT_KEEP_REVISIONS,
        }
    }

    pub fn with_keep_revisions(mut self, keep: usize) -> Self {
        self.keep_revisions = keep.max(1);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    /// Revision files for a run, newest first.
    fn revisions(&self, run_id: &str) -> Result<Vec<(u64, PathBuf)>, CheckpointError> {
        let dir = self.run_dir(run_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut revisions = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| CheckpointError::Io(e.to_string()))? {
            let path = entry.map_err(|e| CheckpointError::Io(e.to_string()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(revision) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                revisions.push((revision, path));
            }
        }
        revisions.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(revisions)
    }

    fn prune(&self, run_id: &str) -> Result<(), CheckpointError> {
        for (_, path) in self.revisions(run_id)?.into_iter().skip(self.keep_revisions) {
            std::fs::remove_file(&path).map_err(|e| CheckpointError::Io(e.to_string()))?;
        }
        Ok(())
    }
}

impl CheckpointStore for JsonFileStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let dir = self.run_dir(&checkpoint.run_id);
        std::fs::create_dir_all(&dir).map_err(|e| CheckpointError::Io(e.to_string()))?;
        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| CheckpointError::Io(e.to_string()))?;
        tmp.write_all(&json)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| CheckpointError::Io(e.to_string()))?;
        let target = dir.join(format!("{:010}.json", checkpoint.revision));
        tmp.persist(&target)
            .map_err(|e| CheckpointError::Io(e.error.to_string()))?;
        self.prune(&checkpoint.run_id)
    }

    fn load_latest(&self, run_id: &str) -> Result<Checkpoint, CheckpointError> {
        let revisions = self.revisions(run_id)?;
        let mut last_error = None;
        for (_, path) in revisions {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| CheckpointError::Io(e.to_string()))
                .and_then(|data| {
                    serde_json::from_str::<Checkpoint>(&data)
                        .map_err(|e| CheckpointError::Serialization(e.to_string()))
                });
            match parsed {
                Ok(checkpoint) => return Ok(checkpoint),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable checkpoint revision"
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CheckpointError::NotFound(run_id.to_string())))
    }

    fn list_runs(&self) -> Result<Vec<String>, CheckpointError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in
            std::fs::read_dir(&self.base_dir).map_err(|e| CheckpointError::Io(e.to_string()))?
        {
            let entry = entry.map_err(|e| CheckpointError::Io(e.to_string()))?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn checkpoint(run_id: &str, revision: u64, step_index: u64) -> Checkpoint {
        Checkpoint {
            run_id: run_id.to_string(),
            revision,
            step_index,
            pending_outputs: Vec::new(),
            applied_output_ids: BTreeSet::new(),
            usage: Default::default(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_latest_revision_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().to_path_buf());
        store.save(&checkpoint("r1", 1, 0)).unwrap();
        store.save(&checkpoint("r1", 2, 4)).unwrap();
        let loaded = store.load_latest("r1").unwrap();
        assert_eq!(loaded.revision, 2);
        assert_eq!(loaded.step_index, 4);
    }

    #[test]
    fn test_corrupt_latest_falls_back_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().to_path_buf());
        store.save(&checkpoint("r1", 1, 3)).unwrap();
        std::fs::write(dir.path().join("r1").join("0000000002.json"), "{ not json").unwrap();
        assert_eq!(store.load_latest("r1").unwrap().revision, 1);
    }

    #[test]
    fn test_missing_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().to_path_buf());
        assert!(matches!(
            store.load_latest("nope"),
            Err(CheckpointError::NotFound(_))
        ));
    }

    #[test]
    fn test_old_revisions_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().to_path_buf()).with_keep_revisions(2);
        for revision in 1..=4 {
            store.save(&checkpoint("r1", revision, revision)).unwrap();
        }
        let remaining = std::fs::read_dir(dir.path().join("r1")).unwrap().count();
        assert_eq!(remaining, 2);
        assert_eq!(store.load_latest("r1").unwrap().revision, 4);
    }

    #[test]
    fn test_list_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().to_path_buf());
        store.save(&checkpoint("run-b", 1, 0)).unwrap();
        store.save(&checkpoint("run-a", 1, 0)).unwrap();
        assert_eq!(store.list_runs().unwrap(), vec!["run-a", "run-b"]);

        let empty = JsonFileStore::new(dir.path().join("nonexistent-subdir"));
        assert!(empty.list_runs().unwrap().is_empty());
    }
}
