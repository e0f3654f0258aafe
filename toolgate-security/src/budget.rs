use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::audit::AuditEvent;
use crate::audit::AuditKind;
use crate::policy::BudgetLimits;
use crate::scope::RuleHit;

/// Consumption recorded against one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub tool_calls: u64,
    pub tokens: u64,
}

impl BudgetUsage {
    /// Usage implied by a run's audit stream. Every charged call leaves one
    /// event behind: a completion, a failure, a timeout, or a remote refusal
    /// marked `charged`. Tokens are summed from `tokens_recorded` events.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a AuditEvent>) -> Self {
        let mut usage = Self::default();
        for event in events {
            match event.kind {
                AuditKind::ToolCallCompleted
                | AuditKind::ToolCallFailed
                | AuditKind::ToolCallTimedOut
                | AuditKind::RemoteCallCompleted
                | AuditKind::RemoteCallFailed => usage.tool_calls += 1,
                AuditKind::RemoteCallRefused
                    if event.payload.get("charged").and_then(Value::as_bool) == Some(true) =>
                {
                    usage.tool_calls += 1;
                }
                AuditKind::TokensRecorded => {
                    let tokens = event.payload.get("tokens").and_then(Value::as_u64).unwrap_or(0);
                    usage.tokens = usage.tokens.saturating_add(tokens);
                }
                _ => {}
            }
        }
        usage
    }

    /// Field-wise maximum of two accounts of the same run.
    pub fn max(self, other: Self) -> Self {
        Self {
            tool_calls: self.tool_calls.max(other.tool_calls),
            tokens: self.tokens.max(other.tokens),
        }
    }
}

/// Deny when the run has already used up a limit.
pub fn check_budget(limits: &BudgetLimits, usage: &BudgetUsage) -> Result<(), RuleHit> {
    match (limits.max_tool_calls, limits.max_tokens) {
        (Some(max), _) if usage.tool_calls >= max => Err(RuleHit::new(
            "budgets.max_tool_calls",
            format!("tool call budget exhausted ({}/{max})", usage.tool_calls),
        )),
        (_, Some(max)) if usage.tokens >= max => Err(RuleHit::new(
            "budgets.max_tokens",
            format!("token budget exhausted ({}/{max})", usage.tokens),
        )),
        _ => Ok(()),
    }
}

/// Per-run counters. A run id that has never been seen starts at zero;
/// counters are never reset for an existing run. Owners that keep a durable
/// account of runs may [`BudgetLedger::forget`] idle ones and
/// [`BudgetLedger::restore`] them later.
#[derive(Debug, Default)]
pub struct BudgetLedger {
    runs: Mutex<HashMap<String, BudgetUsage>>,
}

impl BudgetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage(&self, run_id: &str) -> BudgetUsage {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.get(run_id).copied().unwrap_or_default()
    }

    /// Check the limits and count one tool call in a single step, so two
    /// concurrent calls cannot both take the last slot.
    pub fn try_charge_call(
        &self,
        run_id: &str,
        limits: &BudgetLimits,
    ) -> Result<BudgetUsage, RuleHit> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let usage = runs.entry(run_id.to_string()).or_default();
        check_budget(limits, usage)?;
        usage.tool_calls += 1;
        Ok(*usage)
    }

    pub fn record_tokens(&self, run_id: &str, tokens: u64) -> BudgetUsage {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let usage = runs.entry(run_id.to_string()).or_default();
        usage.tokens = usage.tokens.saturating_add(tokens);
        *usage
    }

    /// Seed counters for a run restored from a checkpoint.
    pub fn restore(&self, run_id: &str, usage: BudgetUsage) {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.insert(run_id.to_string(), usage);
    }

    pub fn forget(&self, run_id: &str) {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.remove(run_id);
    }

    pub fn tracked_runs(&self) -> usize {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
