//! Gateway configuration: a TOML file, environment overrides on top, and a
//! separate secrets file that never ends up in logs or the public view.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use toolgate_provider::BackendConfig;
use toolgate_provider::BreakerConfig;
use toolgate_provider::EndpointConfig;
use toolgate_provider::ManagerSettings;
use toolgate_provider::RetryPolicy;
use toolgate_provider::endpoint::duration_secs;
use toolgate_runtime::ExecutionLimits;

pub const CONFIG_ENV: &str = "TOOLGATE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "toolgate.toml";
pub const DEFAULT_COMMAND_OVERRIDE_ENV: &str = "TOOLGATE_EXTRA_COMMANDS";
pub const DEFAULT_ADMIN_TOKEN_ENV: &str = "TOOLGATE_ADMIN_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("environment variable {name}: {message}")]
    Env { name: &'static str, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProberConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Length of the per-endpoint rate window.
    #[serde(with = "duration_secs")]
    pub rate_window: Duration,
}

impl Default for ProberConfig {
    fn default() -> Self {
        let settings = ManagerSettings::default();
        Self {
            interval: settings.probe_interval,
            timeout: settings.probe_timeout,
            rate_window: settings.rate_window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(with = "duration_secs")]
    pub snapshot_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Older revisions kept per run besides the newest.
    pub keep_revisions: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            keep_revisions: toolgate_persist::store::DEFAULT_KEEP_REVISIONS,
        }
    }
}

/// Everything `toolgate.toml` can hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub workspace: PathBuf,
    pub state_dir: PathBuf,
    pub policy_dir: PathBuf,
    pub secrets_file: Option<PathBuf>,
    /// Environment variable whose comma-separated commands extend the
    /// policy allow-list. Unset disables overrides.
    pub command_override_env: Option<String>,
    /// Secret that administrative requests over the pipe must present.
    /// Without it those requests are refused; the reload signal still works.
    pub admin_token_env: Option<String>,
    pub backend: BackendConfig,
    pub limits: ExecutionLimits,
    pub breaker: BreakerConfig,
    pub prober: ProberConfig,
    pub retry: RetryPolicy,
    pub metrics: MetricsConfig,
    pub checkpoints: CheckpointConfig,
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            state_dir: PathBuf::from(".toolgate"),
            policy_dir: PathBuf::from("policies"),
            secrets_file: None,
            command_override_env: Some(DEFAULT_COMMAND_OVERRIDE_ENV.to_string()),
            admin_token_env: Some(DEFAULT_ADMIN_TOKEN_ENV.to_string()),
            backend: BackendConfig::default(),
            limits: ExecutionLimits::default(),
            breaker: BreakerConfig::default(),
            prober: ProberConfig::default(),
            retry: RetryPolicy::default(),
            metrics: MetricsConfig::default(),
            checkpoints: CheckpointConfig::default(),
            endpoints: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Load from `TOOLGATE_CONFIG` (or `toolgate.toml`) and apply the process
    /// environment.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |name: &str| std::env::var(name).ok();
        let path = env(CONFIG_ENV)
            .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from);
        Self::load_from(&path, env)
    }

    /// Load `path` (a missing file means defaults) and apply overrides from
    /// `env`.
    pub fn load_from(
        path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text).map_err(|message| ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        config.apply_env(env)?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|err| err.to_string())
    }

    /// Environment values win over the file.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = env("TOOLGATE_WORKSPACE") {
            self.workspace = PathBuf::from(value);
        }
        if let Some(value) = env("TOOLGATE_STATE_DIR") {
            self.state_dir = PathBuf::from(value);
        }
        if let Some(value) = env("TOOLGATE_POLICY_DIR") {
            self.policy_dir = PathBuf::from(value);
        }
        if let Some(value) = env("TOOLGATE_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(value));
        }
        if let Some(value) = env("TOOLGATE_BACKEND_URL") {
            self.backend.base_url = value;
        }
        if let Some(value) = env("TOOLGATE_MODEL") {
            self.backend.model = value;
        }
        if let Some(value) = env("TOOLGATE_FORCE_FALLBACK") {
            self.backend.force_fallback = parse_flag(&value).ok_or_else(|| ConfigError::Env {
                name: "TOOLGATE_FORCE_FALLBACK",
                message: format!("expected a boolean, got `{value}`"),
            })?;
        }
        Ok(())
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            breaker: self.breaker.clone(),
            probe_interval: self.prober.interval,
            probe_timeout: self.prober.timeout,
            rate_window: self.prober.rate_window,
        }
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.state_dir.join("audit")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.state_dir.join("spool")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.state_dir.join("metrics.json")
    }

    pub fn endpoints_snapshot_path(&self) -> PathBuf {
        self.state_dir.join("endpoints.json")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join("toolgate.pid")
    }

    /// Configuration as shown to operators. Credentials appear only masked.
    pub fn public_view(&self, secrets: &Secrets) -> Value {
        let lookup = |name: &Option<String>| {
            name.as_deref()
                .and_then(|name| secrets.resolve(name))
                .map(|value| mask_secret(&value))
        };
        let endpoints: BTreeMap<&String, Value> = self
            .endpoints
            .iter()
            .map(|(label, endpoint)| {
                let mut view = serde_json::to_value(endpoint).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut view {
                    map.insert("auth_token".into(), json!(lookup(&endpoint.auth_token_env)));
                }
                (label, view)
            })
            .collect();
        json!({
            "workspace": self.workspace.display().to_string(),
            "state_dir": self.state_dir.display().to_string(),
            "policy_dir": self.policy_dir.display().to_string(),
            "secrets_file": self.secrets_file.as_ref().map(|path| path.display().to_string()),
            "command_override_env": self.command_override_env,
            "admin_token": lookup(&self.admin_token_env),
            "backend": {
                "base_url": self.backend.base_url,
                "model": self.backend.model,
                "wire_protocol": self.backend.wire_protocol,
                "force_fallback": self.backend.force_fallback,
                "api_key": lookup(&self.backend.api_key_env),
            },
            "limits": self.limits,
            "breaker": self.breaker,
            "prober": self.prober,
            "retry": self.retry,
            "endpoints": endpoints,
            "secrets": secrets.masked(),
        })
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// `***` plus the last four characters; shorter values are fully hidden.
pub fn mask_secret(value: &str) -> String {
    let count = value.chars().count();
    if count == 0 {
        return String::new();
    }
    if count < 4 {
        return "***".to_string();
    }
    let tail: String = value.chars().skip(count - 4).collect();
    format!("***{tail}")
}

/// Named secrets. Lookups consult the process environment first, then the
/// secrets file.
#[derive(Clone, Default)]
pub struct Secrets {
    values: BTreeMap<String, String>,
    use_env: bool,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("values", &self.masked())
            .finish()
    }
}

impl Secrets {
    /// Secrets from the environment only.
    pub fn from_env() -> Self {
        Self {
            values: BTreeMap::new(),
            use_env: true,
        }
    }

    /// Read a secrets file. A missing file yields no file secrets.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::from_env());
        };
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self {
                values: parse_secrets(&text),
                use_env: true,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "secrets file not found");
                Ok(Self::from_env())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Fixed values with no environment fallback.
    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self {
            values,
            use_env: false,
        }
    }

    pub fn resolve(&self, name: &str) -> Option<String> {
        self.use_env
            .then(|| std::env::var(name).ok())
            .flatten()
            .filter(|value| !value.is_empty())
            .or_else(|| self.values.get(name).cloned())
    }

    pub fn masked(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), mask_secret(value)))
            .collect()
    }
}

/// A YAML mapping, or `KEY=VALUE` lines with blank lines and `#` comments
/// skipped.
fn parse_secrets(text: &str) -> BTreeMap<String, String> {
    let parsed = serde_yaml::from_str::<serde_yaml::Value>(text);
    if let Ok(serde_yaml::Value::Mapping(mapping)) = parsed {
        return mapping
            .into_iter()
            .filter_map(|(key, value)| Some((yaml_scalar(key)?, yaml_scalar(value)?)))
            .collect();
    }
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

fn yaml_scalar(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(text) => Some(text),
        serde_yaml::Value::Number(number) => Some(number.to_string()),
        serde_yaml::Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load_from(&dir.path().join("nope.toml"), env(&[])).unwrap();
        assert_eq!(config.state_dir, PathBuf::from(".toolgate"));
        assert_eq!(config.prober.interval, Duration::from_secs(5));
        assert_eq!(config.breaker.open_after, 3);
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn test_example_config_matches_defaults() {
        let example = GatewayConfig::from_toml(include_str!("../../toolgate.example.toml")).unwrap();
        let defaults = GatewayConfig::default();
        assert_eq!(example.backend, defaults.backend);
        assert_eq!(example.retry, defaults.retry);
        assert_eq!(example.limits.timeout, defaults.limits.timeout);
        assert_eq!(example.breaker.max_cooldown, defaults.breaker.max_cooldown);
        assert_eq!(example.checkpoints.keep_revisions, defaults.checkpoints.keep_revisions);
        assert_eq!(example.admin_token_env, defaults.admin_token_env);
    }

    #[test]
    fn test_file_sections_and_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolgate.toml");
        std::fs::write(
            &path,
            r#"
workspace = "/srv/ws"
state_dir = "/srv/state"

[backend]
base_url = "http://backend:1234/v1"
probe_timeout = 2

[limits]
timeout = 5
max_output_bytes = 1024

[breaker]
open_after = 5
base_cooldown = 10

[prober]
interval = 2.5

[endpoints.github]
transport = "http"
url = "https://api.github.com"
auth_token_env = "GITHUB_TOKEN"
rate_limit_per_minute = 30
idempotent_operations = ["search"]

[endpoints.local]
transport = "stdio"
command = "tool-server"
"#,
        )
        .unwrap();
        let config = GatewayConfig::load_from(
            &path,
            env(&[
                ("TOOLGATE_STATE_DIR", "/tmp/state"),
                ("TOOLGATE_MODEL", "qwen"),
                ("TOOLGATE_FORCE_FALLBACK", "true"),
            ]),
        )
        .unwrap();
        assert_eq!(config.workspace, PathBuf::from("/srv/ws"));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/state"));
        assert_eq!(config.backend.model, "qwen");
        assert!(config.backend.force_fallback);
        assert_eq!(config.backend.probe_timeout, Duration::from_secs(2));
        assert_eq!(config.limits.timeout, Duration::from_secs(5));
        assert_eq!(config.breaker.open_after, 5);
        assert_eq!(config.breaker.degrade_after, 1);
        assert_eq!(config.prober.interval, Duration::from_millis(2500));
        assert_eq!(config.endpoints.len(), 2);
        assert!(config.endpoints["github"].is_idempotent("search"));
        assert_eq!(config.manager_settings().breaker.base_cooldown, Duration::from_secs(10));
    }

    #[test]
    fn test_unknown_keys_and_bad_flags_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolgate.toml");
        std::fs::write(&path, "workspce = \"/typo\"\n").unwrap();
        let err = GatewayConfig::load_from(&path, env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err:?}");

        let missing = dir.path().join("missing.toml");
        let err = GatewayConfig::load_from(&missing, env(&[("TOOLGATE_FORCE_FALLBACK", "maybe")])).unwrap_err();
        match err {
            ConfigError::Env { name, .. } => assert_eq!(name, "TOOLGATE_FORCE_FALLBACK"),
            other => panic!("expected Env, got {other:?}"),
        }
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("sk-abcdef123456"), "***3456");
        assert_eq!(mask_secret("abc"), "***");
        assert_eq!(mask_secret(""), "");
    }

    #[test]
    fn test_secrets_yaml_and_key_value_forms() {
        let yaml = parse_secrets("GITHUB_TOKEN: ghp_0123456789\nPORT: 8080\n");
        assert_eq!(yaml["GITHUB_TOKEN"], "ghp_0123456789");
        assert_eq!(yaml["PORT"], "8080");

        let lines = parse_secrets("# tokens\n\nA_TOKEN=first=part\nB_TOKEN = second\nnot a pair\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines["A_TOKEN"], "first=part");
        assert_eq!(lines["B_TOKEN"], "second");
    }

    #[test]
    fn test_public_view_masks_credentials() {
        let mut config = GatewayConfig::default();
        config.backend.api_key_env = Some("TOOLGATE_TEST_BACKEND_KEY".into());
        let mut endpoint = EndpointConfig::http("https://api.github.com");
        endpoint.auth_token_env = Some("TOOLGATE_TEST_GITHUB".into());
        config.endpoints.insert("github".into(), endpoint);
        let secrets = Secrets::from_map(BTreeMap::from([
            ("TOOLGATE_TEST_BACKEND_KEY".to_string(), "sk-live-abcd1234".to_string()),
            ("TOOLGATE_TEST_GITHUB".to_string(), "ghp_zzzz9999".to_string()),
        ]));
        let view = config.public_view(&secrets);
        assert_eq!(view["backend"]["api_key"], "***1234");
        assert_eq!(view["endpoints"]["github"]["auth_token"], "***9999");
        assert_eq!(view["secrets"]["TOOLGATE_TEST_GITHUB"], "***9999");
        assert!(!view.to_string().contains("sk-live"));
    }
}
