pub mod action;
pub mod audit;
pub mod budget;
pub mod guardrail;
pub mod metrics;
pub mod policy;
pub mod scope;
pub mod store;

// Re-export key types for convenience.
pub use action::Action;
pub use action::ActionError;
pub use action::ActionRequest;
pub use action::ToolKind;
pub use audit::AuditEvent;
pub use audit::AuditKind;
pub use audit::AuditLog;
pub use audit::AuditRecord;
pub use audit::RedactionPolicy;
pub use audit::Redactor;
pub use budget::BudgetLedger;
pub use budget::BudgetUsage;
pub use guardrail::CommandOverrides;
pub use guardrail::Decision;
pub use guardrail::EvaluationContext;
pub use guardrail::GuardrailEngine;
pub use guardrail::Verdict;
pub use guardrail::evaluate;
pub use metrics::CallOutcome;
pub use metrics::MetricsRecorder;
pub use metrics::MetricsSnapshot;
pub use policy::BudgetLimits;
pub use policy::Policy;
pub use policy::PolicyDocument;
pub use policy::PolicyError;
pub use policy::PolicyTexts;
pub use store::PolicyStore;
pub use store::ReloadOutcome;
