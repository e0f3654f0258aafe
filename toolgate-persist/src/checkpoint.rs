use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use toolgate_security::AuditKind;
use toolgate_security::AuditLog;
use toolgate_security::AuditRecord;
use toolgate_security::BudgetUsage;
use toolgate_security::action::validate_run_id;

use crate::store::CheckpointError;
use crate::store::CheckpointStore;

/// A tool output produced by a step that the reasoning loop has not yet
/// consumed. Ids are stable so re-submission can be detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOutput {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PendingOutput {
    pub fn new(tool: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.into(),
            payload,
        }
    }
}

/// Durable state of one run after a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub revision: u64,
    pub step_index: u64,
    #[serde(default)]
    pub pending_outputs: Vec<PendingOutput>,
    #[serde(default)]
    pub applied_output_ids: BTreeSet<String>,
    #[serde(default)]
    pub usage: BudgetUsage,
    pub created_at: String,
}

/// Where a resumed run continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub run_id: String,
    pub step_index: u64,
    /// Outputs still to be delivered, in the order they were produced.
    pub replay: Vec<PendingOutput>,
    pub usage: BudgetUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acknowledgement {
    Applied,
    AlreadyApplied,
}

/// Saves, loads and resumes run checkpoints. Writes for all runs go through
/// one lock so revision numbers never collide.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    audit: Option<Arc<AuditLog>>,
    write_lock: Mutex<()>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            audit: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Record the state after `step_index`. Outputs that were already
    /// acknowledged are dropped from `pending_outputs`.
    pub fn save(
        &self,
        run_id: &str,
        step_index: u64,
        pending_outputs: Vec<PendingOutput>,
        usage: BudgetUsage,
    ) -> Result<Checkpoint, CheckpointError> {
        validate_run_id(run_id).map_err(|e| CheckpointError::InvalidRunId(e.to_string()))?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = self.load_optional(run_id)?;
        let (revision, applied) = match &previous {
            Some(prev) if step_index < prev.step_index => {
                return Err(CheckpointError::StaleStep {
                    run_id: run_id.to_string(),
                    current: prev.step_index,
                    requested: step_index,
                });
            }
            Some(prev) => (prev.revision + 1, prev.applied_output_ids.clone()),
            None => (1, BTreeSet::new()),
        };
        let checkpoint = Checkpoint {
            run_id: run_id.to_string(),
            revision,
            step_index,
            pending_outputs: pending_outputs
                .into_iter()
                .filter(|output| !applied.contains(&output.id))
                .collect(),
            applied_output_ids: applied,
            usage,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.store.save(&checkpoint)?;
        self.audit(
            AuditRecord::new(AuditKind::CheckpointSaved)
                .run(run_id)
                .payload(json!({
                    "revision": checkpoint.revision,
                    "step_index": checkpoint.step_index,
                    "pending": checkpoint.pending_outputs.len(),
                })),
        );
        Ok(checkpoint)
    }

    pub fn load(&self, run_id: &str) -> Result<Checkpoint, CheckpointError> {
        validate_run_id(run_id).map_err(|e| CheckpointError::InvalidRunId(e.to_string()))?;
        self.store.load_latest(run_id)
    }

    /// Step index to continue from plus the outputs the loop has not yet
    /// acknowledged.
    pub fn resume(&self, run_id: &str) -> Result<ResumePoint, CheckpointError> {
        let checkpoint = self.load(run_id)?;
        let replay = checkpoint
            .pending_outputs
            .into_iter()
            .filter(|output| !checkpoint.applied_output_ids.contains(&output.id))
            .collect();
        Ok(ResumePoint {
            run_id: checkpoint.run_id,
            step_index: checkpoint.step_index,
            replay,
            usage: checkpoint.usage,
        })
    }

    /// Mark a pending output as applied. Acknowledging the same id again is
    /// a no-op reported as [`Acknowledgement::AlreadyApplied`].
    pub fn acknowledge(
        &self,
        run_id: &str,
        output_id: &str,
    ) -> Result<Acknowledgement, CheckpointError> {
        validate_run_id(run_id).map_err(|e| CheckpointError::InvalidRunId(e.to_string()))?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut checkpoint = self.store.load_latest(run_id)?;
        if checkpoint.applied_output_ids.contains(output_id) {
            return Ok(Acknowledgement::AlreadyApplied);
        }
        let Some(position) = checkpoint
            .pending_outputs
            .iter()
            .position(|output| output.id == output_id)
        else {
            return Err(CheckpointError::UnknownOutput {
                run_id: run_id.to_string(),
                output_id: output_id.to_string(),
            });
        };
        checkpoint.pending_outputs.remove(position);
        checkpoint.applied_output_ids.insert(output_id.to_string());
        checkpoint.revision += 1;
        checkpoint.created_at = chrono::Utc::now().to_rfc3339();
        self.store.save(&checkpoint)?;
        self.audit(
            AuditRecord::new(AuditKind::OutputAcknowledged)
                .run(run_id)
                .payload(json!({ "output_id": output_id, "revision": checkpoint.revision })),
        );
        Ok(Acknowledgement::Applied)
    }

    pub fn list_runs(&self) -> Result<Vec<String>, CheckpointError> {
        self.store.list_runs()
    }

    fn load_optional(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        match self.store.load_latest(run_id) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(CheckpointError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn audit(&self, record: AuditRecord) {
        if let Some(audit) = &self.audit {
            audit.emit(record);
        }
    }
}
