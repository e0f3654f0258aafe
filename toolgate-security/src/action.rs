//! The closed set of actions the reasoning loop may request.
//!
//! Requests arrive as JSON produced (directly or indirectly) by a model, so
//! everything here is parsed strictly: unknown tools and unknown argument
//! fields are rejected before any policy is consulted.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Upper bound accepted for `repo_summary.max_files`.
pub const MAX_SUMMARY_FILES: usize = 2000;
/// Default for `repo_summary.max_files` when the caller omits it.
pub const DEFAULT_SUMMARY_FILES: usize = 200;

const MAX_RUN_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("malformed action request: {0}")]
    Malformed(String),
    #[error("invalid `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

/// One requested action, scoped to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionRequest {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u64>,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum Action {
    ReadFile(ReadFileArgs),
    WriteFile(WriteFileArgs),
    ShellExec(ShellExecArgs),
    RepoSummary(RepoSummaryArgs),
    WorkspaceStatus,
    Remote(RemoteArgs),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadFileArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellExecArgs {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoSummaryArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
}

impl RepoSummaryArgs {
    pub fn effective_max_files(&self) -> usize {
        self.max_files.unwrap_or(DEFAULT_SUMMARY_FILES)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteArgs {
    pub endpoint: String,
    pub operation: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Tool identifiers as they appear in `tools.yaml` and in audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ReadFile,
    WriteFile,
    ShellExec,
    RepoSummary,
    WorkspaceStatus,
    Remote,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        ToolKind::ReadFile,
        ToolKind::WriteFile,
        ToolKind::ShellExec,
        ToolKind::RepoSummary,
        ToolKind::WorkspaceStatus,
        ToolKind::Remote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::ReadFile => "read_file",
            ToolKind::WriteFile => "write_file",
            ToolKind::ShellExec => "shell_exec",
            ToolKind::RepoSummary => "repo_summary",
            ToolKind::WorkspaceStatus => "workspace_status",
            ToolKind::Remote => "remote",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown tool `{s}`"))
    }
}

impl Action {
    pub fn kind(&self) -> ToolKind {
        match self {
            Action::ReadFile(_) => ToolKind::ReadFile,
            Action::WriteFile(_) => ToolKind::WriteFile,
            Action::ShellExec(_) => ToolKind::ShellExec,
            Action::RepoSummary(_) => ToolKind::RepoSummary,
            Action::WorkspaceStatus => ToolKind::WorkspaceStatus,
            Action::Remote(_) => ToolKind::Remote,
        }
    }

    /// Local actions that can be repeated without changing anything.
    /// Remote operations are idempotent only when their endpoint says so.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Action::ReadFile(_) | Action::RepoSummary(_) | Action::WorkspaceStatus
        )
    }
}

impl ActionRequest {
    pub fn new(run_id: impl Into<String>, action: Action) -> Self {
        Self {
            run_id: run_id.into(),
            step_index: None,
            action,
        }
    }

    /// Parse and validate a request from its JSON wire form.
    pub fn parse(text: &str) -> Result<Self, ActionError> {
        let request: ActionRequest =
            serde_json::from_str(text).map_err(|err| ActionError::Malformed(err.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ActionError> {
        validate_run_id(&self.run_id)?;
        match &self.action {
            Action::ReadFile(args) => non_empty("path", &args.path),
            Action::WriteFile(args) => non_empty("path", &args.path),
            Action::ShellExec(args) => {
                non_empty("command", &args.command)?;
                match &args.cwd {
                    Some(cwd) => non_empty("cwd", cwd),
                    None => Ok(()),
                }
            }
            Action::RepoSummary(args) => match args.max_files {
                Some(n) if !(1..=MAX_SUMMARY_FILES).contains(&n) => Err(ActionError::Invalid {
                    field: "max_files",
                    message: format!("must be between 1 and {MAX_SUMMARY_FILES}, got {n}"),
                }),
                _ => Ok(()),
            },
            Action::WorkspaceStatus => Ok(()),
            Action::Remote(args) => {
                non_empty("endpoint", &args.endpoint)?;
                non_empty("operation", &args.operation)
            }
        }
    }
}

/// Run ids name files on disk, so they are restricted to a conservative
/// character set.
pub fn validate_run_id(run_id: &str) -> Result<(), ActionError> {
    let invalid = |message: &str| ActionError::Invalid {
        field: "run_id",
        message: message.to_string(),
    };
    if run_id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if run_id.len() > MAX_RUN_ID_LEN {
        return Err(invalid("too long"));
    }
    if run_id.starts_with('.') {
        return Err(invalid("must not start with `.`"));
    }
    if !run_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("may only contain ASCII letters, digits, `-`, `_` and `.`"));
    }
    Ok(())
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ActionError> {
    if value.trim().is_empty() {
        Err(ActionError::Invalid {
            field,
            message: "must not be empty".to_string(),
        })
    } else {
        Ok(())
    }
}
