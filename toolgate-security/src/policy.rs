//! Policy documents and the immutable [`Policy`] compiled from them.
//!
//! A policy bundle is three YAML documents: `paths.yaml`, `tools.yaml` and
//! `network.yaml`. All three are compiled together so that a version number
//! always names one consistent set of rules.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use globset::Glob;
use globset::GlobSet;
use globset::GlobSetBuilder;
use serde::Deserialize;
use serde::Serialize;

use crate::action::ToolKind;
use crate::scope::CommandPattern;
use crate::scope::CommandScope;
use crate::scope::HostPattern;
use crate::scope::NetworkScope;
use crate::scope::PathScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDocument {
    Paths,
    Tools,
    Network,
}

impl PolicyDocument {
    pub const ALL: [PolicyDocument; 3] = [
        PolicyDocument::Paths,
        PolicyDocument::Tools,
        PolicyDocument::Network,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            PolicyDocument::Paths => "paths.yaml",
            PolicyDocument::Tools => "tools.yaml",
            PolicyDocument::Network => "network.yaml",
        }
    }
}

impl fmt::Display for PolicyDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("{document}: cannot read {path}: {message}")]
    Io {
        document: PolicyDocument,
        path: PathBuf,
        message: String,
    },
    #[error("{document}: {message}")]
    Parse {
        document: PolicyDocument,
        message: String,
    },
    #[error("{document}: rule `{rule}` is invalid: {message}")]
    Invalid {
        document: PolicyDocument,
        rule: String,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsDocument {
    #[serde(default)]
    pub roots: BTreeMap<String, String>,
    pub confine_to: String,
    #[serde(default)]
    pub allowed_globs: Vec<String>,
    #[serde(default)]
    pub denied_globs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsDocument {
    /// Empty means every tool kind is permitted.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub budgets: BudgetLimits,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDocument {
    #[serde(default)]
    pub allow_net: bool,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    #[serde(default)]
    pub rate_limits: BTreeMap<String, u32>,
}

/// Raw text of the three documents. Kept by the store so one document can
/// be replaced while the other two keep their last good contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTexts {
    pub paths: String,
    pub tools: String,
    pub network: String,
}

impl PolicyTexts {
    pub fn read_dir(dir: &Path) -> Result<Self, PolicyError> {
        let read = |document: PolicyDocument| {
            let path = dir.join(document.file_name());
            std::fs::read_to_string(&path).map_err(|err| PolicyError::Io {
                document,
                message: err.to_string(),
                path,
            })
        };
        Ok(Self {
            paths: read(PolicyDocument::Paths)?,
            tools: read(PolicyDocument::Tools)?,
            network: read(PolicyDocument::Network)?,
        })
    }

    pub fn get(&self, document: PolicyDocument) -> &str {
        match document {
            PolicyDocument::Paths => &self.paths,
            PolicyDocument::Tools => &self.tools,
            PolicyDocument::Network => &self.network,
        }
    }

    pub fn set(&mut self, document: PolicyDocument, text: String) {
        match document {
            PolicyDocument::Paths => self.paths = text,
            PolicyDocument::Tools => self.tools = text,
            PolicyDocument::Network => self.network = text,
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled policy
// ---------------------------------------------------------------------------

/// An immutable, versioned snapshot of all rules.
#[derive(Debug, Clone)]
pub struct Policy {
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    pub paths: PathScope,
    pub commands: CommandScope,
    pub network: NetworkScope,
    pub budgets: BudgetLimits,
    allowed_tools: BTreeSet<ToolKind>,
}

impl Policy {
    pub fn tool_allowed(&self, tool: ToolKind) -> bool {
        self.allowed_tools.is_empty() || self.allowed_tools.contains(&tool)
    }

    /// Short description used in status output and audit payloads.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "version": self.version,
            "loaded_at": self.loaded_at.to_rfc3339(),
            "root": self.paths.root().display().to_string(),
            "allowed_commands": self
                .commands
                .patterns()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            "allow_net": self.network.allow_net(),
            "budgets": self.budgets,
        })
    }
}

/// Parse, validate and compile a bundle. Relative roots resolve against
/// `base_dir` (normally the workspace).
pub fn compile(texts: &PolicyTexts, base_dir: &Path, version: u64) -> Result<Policy, PolicyError> {
    let paths: PathsDocument = parse(PolicyDocument::Paths, &texts.paths)?;
    let tools: ToolsDocument = parse(PolicyDocument::Tools, &texts.tools)?;
    let network: NetworkDocument = parse(PolicyDocument::Network, &texts.network)?;

    Ok(Policy {
        version,
        loaded_at: Utc::now(),
        paths: compile_paths(&paths, base_dir)?,
        commands: compile_commands(&tools)?,
        network: compile_network(&network)?,
        budgets: compile_budgets(&tools)?,
        allowed_tools: compile_tools(&tools)?,
    })
}

fn parse<T: serde::de::DeserializeOwned>(
    document: PolicyDocument,
    text: &str,
) -> Result<T, PolicyError> {
    serde_yaml::from_str(text).map_err(|err| PolicyError::Parse {
        document,
        message: err.to_string(),
    })
}

fn compile_paths(doc: &PathsDocument, base_dir: &Path) -> Result<PathScope, PolicyError> {
    let invalid = |rule: String, message: String| PolicyError::Invalid {
        document: PolicyDocument::Paths,
        rule,
        message,
    };
    let Some(raw_root) = doc.roots.get(&doc.confine_to) else {
        return Err(invalid(
            "confine_to".to_string(),
            format!("root `{}` is not defined under `roots`", doc.confine_to),
        ));
    };
    let candidate = Path::new(raw_root);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    };
    let root = dunce::canonicalize(&joined).map_err(|err| {
        invalid(
            format!("roots.{}", doc.confine_to),
            format!("{}: {err}", joined.display()),
        )
    })?;
    if !root.is_dir() {
        return Err(invalid(
            format!("roots.{}", doc.confine_to),
            format!("{} is not a directory", root.display()),
        ));
    }
    Ok(PathScope {
        root_name: doc.confine_to.clone(),
        root,
        allowed: build_globs(&doc.allowed_globs, "allowed_globs")?,
        allowed_patterns: doc.allowed_globs.clone(),
        denied: build_globs(&doc.denied_globs, "denied_globs")?,
        denied_patterns: doc.denied_globs.clone(),
    })
}

fn build_globs(patterns: &[String], field: &str) -> Result<GlobSet, PolicyError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| PolicyError::Invalid {
            document: PolicyDocument::Paths,
            rule: format!("{field}[{pattern}]"),
            message: err.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|err| PolicyError::Invalid {
        document: PolicyDocument::Paths,
        rule: field.to_string(),
        message: err.to_string(),
    })
}

fn compile_commands(doc: &ToolsDocument) -> Result<CommandScope, PolicyError> {
    let patterns = doc
        .allowed_commands
        .iter()
        .map(|text| {
            CommandPattern::parse(text).ok_or_else(|| PolicyError::Invalid {
                document: PolicyDocument::Tools,
                rule: format!("allowed_commands[{text}]"),
                message: "empty command or unbalanced quoting".to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CommandScope { patterns })
}

fn compile_tools(doc: &ToolsDocument) -> Result<BTreeSet<ToolKind>, PolicyError> {
    doc.allowed_tools
        .iter()
        .map(|name| {
            name.parse::<ToolKind>().map_err(|message| PolicyError::Invalid {
                document: PolicyDocument::Tools,
                rule: format!("allowed_tools[{name}]"),
                message,
            })
        })
        .collect()
}

fn compile_budgets(doc: &ToolsDocument) -> Result<BudgetLimits, PolicyError> {
    let check = |field: &str, value: Option<u64>| match value {
        Some(0) => Err(PolicyError::Invalid {
            document: PolicyDocument::Tools,
            rule: format!("budgets.{field}"),
            message: "must be greater than zero; omit it for no limit".to_string(),
        }),
        _ => Ok(()),
    };
    check("max_tool_calls", doc.budgets.max_tool_calls)?;
    check("max_tokens", doc.budgets.max_tokens)?;
    Ok(doc.budgets)
}

fn compile_network(doc: &NetworkDocument) -> Result<NetworkScope, PolicyError> {
    let hosts = |field: &str, list: &[String]| {
        list.iter()
            .map(|text| {
                HostPattern::parse(text).ok_or_else(|| PolicyError::Invalid {
                    document: PolicyDocument::Network,
                    rule: format!("{field}[{text}]"),
                    message: "expected a bare host name or `*.domain`".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
    };
    for (label, limit) in &doc.rate_limits {
        if label.trim().is_empty() || *limit == 0 {
            return Err(PolicyError::Invalid {
                document: PolicyDocument::Network,
                rule: format!("rate_limits.{label}"),
                message: "endpoint label must be non-empty and the limit at least 1".to_string(),
            });
        }
    }
    Ok(NetworkScope {
        allow_net: doc.allow_net,
        allowed_hosts: hosts("allowed_hosts", &doc.allowed_hosts)?,
        blocked_hosts: hosts("blocked_hosts", &doc.blocked_hosts)?,
        rate_limits: doc.rate_limits.clone(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn texts(paths: &str, tools: &str, network: &str) -> PolicyTexts {
        PolicyTexts {
            paths: paths.to_string(),
            tools: tools.to_string(),
            network: network.to_string(),
        }
    }

    pub(crate) const PATHS: &str = "roots:\n  workspace: \".\"\nconfine_to: workspace\nallowed_globs: [\"docs/**\", \"src/**\"]\ndenied_globs: [\"**/.env\"]\n";
    pub(crate) const TOOLS: &str = "allowed_commands: [\"git status\", \"ls\"]\nbudgets:\n  max_tool_calls: 3\n";
    pub(crate) const NETWORK: &str = "allow_net: false\n";

    #[test]
    fn test_compile_valid_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let policy = compile(&texts(PATHS, TOOLS, NETWORK), dir.path(), 7).unwrap();
        assert_eq!(policy.version, 7);
        assert_eq!(policy.paths.root(), dunce::canonicalize(dir.path()).unwrap());
        assert_eq!(policy.paths.root_name(), "workspace");
        assert_eq!(policy.commands.patterns().len(), 2);
        assert_eq!(policy.budgets.max_tool_calls, Some(3));
        assert!(policy.tool_allowed(ToolKind::ShellExec));
        assert!(!policy.network.allow_net());
    }

    #[test]
    fn test_undefined_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = compile(
            &texts("roots: {}\nconfine_to: workspace\n", TOOLS, NETWORK),
            dir.path(),
            1,
        )
        .unwrap_err();
        match err {
            PolicyError::Invalid { document, rule, .. } => {
                assert_eq!(document, PolicyDocument::Paths);
                assert_eq!(rule, "confine_to");
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_root_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = compile(
            &texts(
                "roots:\n  workspace: does-not-exist\nconfine_to: workspace\n",
                TOOLS,
                NETWORK,
            ),
            dir.path(),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::Invalid { ref rule, .. } if rule == "roots.workspace"));
    }

    #[test]
    fn test_bad_glob_names_the_rule() {
        let dir = tempfile::tempdir().unwrap();
        let err = compile(
            &texts(
                "roots:\n  workspace: \".\"\nconfine_to: workspace\nallowed_globs: [\"src/[\"]\n",
                TOOLS,
                NETWORK,
            ),
            dir.path(),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::Invalid { ref rule, .. } if rule == "allowed_globs[src/[]"));
    }

    #[test]
    fn test_unknown_field_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = compile(&texts(PATHS, "allowed_comands: [ls]\n", NETWORK), dir.path(), 1)
            .unwrap_err();
        assert!(matches!(err, PolicyError::Parse { document: PolicyDocument::Tools, .. }));
    }

    #[test]
    fn test_unknown_tool_and_zero_budget_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = compile(&texts(PATHS, "allowed_tools: [teleport]\n", NETWORK), dir.path(), 1)
            .unwrap_err();
        assert!(matches!(err, PolicyError::Invalid { ref rule, .. } if rule == "allowed_tools[teleport]"));

        let err = compile(
            &texts(PATHS, "budgets:\n  max_tokens: 0\n", NETWORK),
            dir.path(),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::Invalid { ref rule, .. } if rule == "budgets.max_tokens"));
    }

    #[test]
    fn test_network_validation() {
        let dir = tempfile::tempdir().unwrap();
        let err = compile(
            &texts(PATHS, TOOLS, "allow_net: true\nallowed_hosts: [\"https://x.com\"]\n"),
            dir.path(),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::Invalid { document: PolicyDocument::Network, .. }));

        let err = compile(
            &texts(PATHS, TOOLS, "rate_limits:\n  github: 0\n"),
            dir.path(),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::Invalid { ref rule, .. } if rule == "rate_limits.github"));
    }

    #[test]
    fn test_read_dir_reports_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("paths.yaml"), PATHS).unwrap();
        let err = PolicyTexts::read_dir(dir.path()).unwrap_err();
        assert!(matches!(err, PolicyError::Io { document: PolicyDocument::Tools, .. }));
    }
}
