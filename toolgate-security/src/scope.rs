//! Compiled path, command and network scopes.
//!
//! These are built once per policy version by [`crate::policy::compile`] and
//! never mutated afterwards.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use globset::GlobSet;
use serde::Serialize;

/// The rule that produced a denial, plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    pub rule: String,
    pub reason: String,
}

impl RuleHit {
    pub fn new(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            reason: reason.into(),
        }
    }
}

pub const OUTSIDE_WORKSPACE: &str = "path outside workspace";

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathAccess {
    Read,
    Write,
    /// Working directories only need to stay inside the root and clear of
    /// denied globs; they are not matched against the allow list.
    WorkingDir,
}

#[derive(Debug, Clone)]
pub struct PathScope {
    pub(crate) root_name: String,
    pub(crate) root: PathBuf,
    pub(crate) allowed: GlobSet,
    pub(crate) allowed_patterns: Vec<String>,
    pub(crate) denied: GlobSet,
    pub(crate) denied_patterns: Vec<String>,
}

impl PathScope {
    /// Canonical root every path must stay under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    /// Resolve `requested` against the root, following symlinks on the part
    /// of the path that exists. Fails when the result leaves the root.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, RuleHit> {
        let confine = || RuleHit::new("paths.confine_to", OUTSIDE_WORKSPACE);
        if requested.trim().is_empty() {
            return Err(RuleHit::new("paths.confine_to", "empty path"));
        }
        let candidate = Path::new(requested);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized = normalize(&joined);

        let mut existing = normalized.as_path();
        let mut missing: Vec<&OsStr> = Vec::new();
        while fs::symlink_metadata(existing).is_err() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name);
                    existing = parent;
                }
                _ => return Err(confine()),
            }
        }
        // A dangling symlink fails here, which is what we want: its target
        // cannot be checked.
        let mut resolved = dunce::canonicalize(existing).map_err(|err| {
            RuleHit::new("paths.confine_to", format!("cannot resolve path: {err}"))
        })?;
        for name in missing.iter().rev() {
            resolved.push(name);
        }
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(confine())
        }
    }

    /// Full path rule: confinement, then deny globs, then allow globs.
    /// Returns the resolved path and the rule that allowed it.
    pub fn check(&self, requested: &str, access: PathAccess) -> Result<(PathBuf, String), RuleHit> {
        let resolved = self.resolve(requested)?;
        let relative = resolved.strip_prefix(&self.root).unwrap_or(Path::new(""));
        if let Some(pattern) = first_match(&self.denied, &self.denied_patterns, relative) {
            return Err(RuleHit::new(
                format!("paths.denied_globs[{pattern}]"),
                format!("path `{}` matches a denied pattern", relative.display()),
            ));
        }
        if access == PathAccess::WorkingDir {
            return Ok((resolved, "paths.confine_to".to_string()));
        }
        match first_match(&self.allowed, &self.allowed_patterns, relative) {
            Some(pattern) => Ok((resolved, format!("paths.allowed_globs[{pattern}]"))),
            None => Err(RuleHit::new(
                "paths.allowed_globs",
                format!("path `{}` is not covered by any allowed pattern", relative.display()),
            )),
        }
    }

    /// Whether a path relative to the root would pass a read check. Used by
    /// tools that walk the tree instead of naming a path.
    pub fn is_readable(&self, relative: &Path) -> bool {
        first_match(&self.denied, &self.denied_patterns, relative).is_none()
            && first_match(&self.allowed, &self.allowed_patterns, relative).is_some()
    }
}

fn first_match<'a>(set: &GlobSet, patterns: &'a [String], path: &Path) -> Option<&'a str> {
    set.matches(path)
        .into_iter()
        .min()
        .and_then(|idx| patterns.get(idx))
        .map(String::as_str)
}

/// Collapse `.` and `..` without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// An allow-listed command: a program optionally followed by fixed
/// arguments, e.g. `git status`. Matches any argv that starts with exactly
/// these tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPattern {
    tokens: Vec<String>,
}

impl CommandPattern {
    pub fn parse(text: &str) -> Option<Self> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return None;
        }
        Some(Self { tokens })
    }

    pub fn matches(&self, argv: &[String]) -> bool {
        argv.len() >= self.tokens.len() && argv[..self.tokens.len()] == self.tokens[..]
    }
}

impl fmt::Display for CommandPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

/// Split a command line into argv using shell quoting rules. `None` when the
/// quoting is unbalanced.
pub fn tokenize(command: &str) -> Option<Vec<String>> {
    shlex::split(command)
}

#[derive(Debug, Clone, Default)]
pub struct CommandScope {
    pub(crate) patterns: Vec<CommandPattern>,
}

impl CommandScope {
    pub fn patterns(&self) -> &[CommandPattern] {
        &self.patterns
    }

    /// First pattern (policy entries before `extra`) covering `argv`.
    pub fn matching<'a>(
        &'a self,
        argv: &[String],
        extra: &'a [CommandPattern],
    ) -> Option<&'a CommandPattern> {
        self.patterns
            .iter()
            .chain(extra.iter())
            .find(|pattern| pattern.matches(argv))
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// `example.com` matches exactly; `*.example.com` matches any subdomain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostPattern(String);

impl HostPattern {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim().to_ascii_lowercase();
        if text.is_empty() || text.contains("://") || text.contains('/') || text.contains(' ') {
            return None;
        }
        Some(Self(text))
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        match self.0.strip_prefix("*.") {
            Some(suffix) => host.len() > suffix.len() && host.ends_with(&format!(".{suffix}")),
            None => host == self.0,
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkScope {
    pub(crate) allow_net: bool,
    pub(crate) allowed_hosts: Vec<HostPattern>,
    pub(crate) blocked_hosts: Vec<HostPattern>,
    pub(crate) rate_limits: BTreeMap<String, u32>,
}

impl NetworkScope {
    pub fn allow_net(&self) -> bool {
        self.allow_net
    }

    /// Per-endpoint invocations per minute, when the policy sets one.
    pub fn rate_limit_for(&self, endpoint: &str) -> Option<u32> {
        self.rate_limits.get(endpoint).copied()
    }

    pub fn check_host(&self, host: &str) -> Result<String, RuleHit> {
        if !self.allow_net {
            return Err(RuleHit::new("network.allow_net", "network access is disabled"));
        }
        if let Some(pattern) = self.blocked_hosts.iter().find(|p| p.matches(host)) {
            return Err(RuleHit::new(
                format!("network.blocked_hosts[{pattern}]"),
                format!("host `{host}` is blocked"),
            ));
        }
        match self.allowed_hosts.iter().find(|p| p.matches(host)) {
            Some(pattern) => Ok(format!("network.allowed_hosts[{pattern}]")),
            None => Err(RuleHit::new(
                "network.allowed_hosts",
                format!("host `{host}` is not in allowed_hosts"),
            )),
        }
    }
}

/// Host of a token that looks like a URL with a network scheme.
pub fn url_host(token: &str) -> Option<String> {
    let parsed = url::Url::parse(token).ok()?;
    match parsed.scheme() {
        "http" | "https" | "ws" | "wss" | "ftp" => parsed.host_str().map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(cmd: &str) -> Vec<String> {
        tokenize(cmd).unwrap()
    }

    #[test]
    fn test_multi_token_pattern_is_exact_prefix() {
        let pattern = CommandPattern::parse("git status").unwrap();
        assert!(pattern.matches(&argv("git status")));
        assert!(pattern.matches(&argv("git status --short")));
        assert!(!pattern.matches(&argv("git push")));
        assert!(!pattern.matches(&argv("git")));
    }

    #[test]
    fn test_tokenize_respects_quotes() {
        assert_eq!(argv("rg 'two words' src"), vec!["rg", "two words", "src"]);
        assert!(tokenize("echo 'unterminated").is_none());
    }

    #[test]
    fn test_matching_prefers_policy_then_extra() {
        let scope = CommandScope {
            patterns: vec![CommandPattern::parse("ls").unwrap()],
        };
        let extra = vec![CommandPattern::parse("cargo test").unwrap()];
        assert!(scope.matching(&argv("ls -la"), &extra).is_some());
        assert!(scope.matching(&argv("cargo test -p x"), &extra).is_some());
        assert!(scope.matching(&argv("cargo build"), &extra).is_none());
    }

    #[test]
    fn test_host_patterns() {
        let exact = HostPattern::parse("api.github.com").unwrap();
        assert!(exact.matches("API.github.com"));
        assert!(!exact.matches("evil-api.github.com"));

        let wildcard = HostPattern::parse("*.corp.example").unwrap();
        assert!(wildcard.matches("build.corp.example"));
        assert!(!wildcard.matches("corp.example"));
        assert!(!wildcard.matches("xcorp.example"));

        assert!(HostPattern::parse("https://x.com").is_none());
        assert!(HostPattern::parse("").is_none());
    }

    #[test]
    fn test_network_scope_order() {
        let scope = NetworkScope {
            allow_net: true,
            allowed_hosts: vec![HostPattern::parse("*.example.com").unwrap()],
            blocked_hosts: vec![HostPattern::parse("bad.example.com").unwrap()],
            rate_limits: BTreeMap::new(),
        };
        assert!(scope.check_host("good.example.com").is_ok());
        let hit = scope.check_host("bad.example.com").unwrap_err();
        assert_eq!(hit.rule, "network.blocked_hosts[bad.example.com]");
        let hit = scope.check_host("other.org").unwrap_err();
        assert_eq!(hit.rule, "network.allowed_hosts");

        let closed = NetworkScope::default();
        assert_eq!(
            closed.check_host("good.example.com").unwrap_err().rule,
            "network.allow_net"
        );
    }

    #[test]
    fn test_url_host() {
        assert_eq!(url_host("https://api.github.com/x"), Some("api.github.com".into()));
        assert_eq!(url_host("file:///etc/passwd"), None);
        assert_eq!(url_host("src/main.rs"), None);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize(Path::new("/a/../../x")), PathBuf::from("/x"));
    }
}
