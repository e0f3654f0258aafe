use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Resource ceilings applied to every local tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Wall-clock limit for one call. Processes are killed when it expires.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// CPU seconds for spawned processes (unix only).
    pub cpu_seconds: Option<u64>,
    /// Address-space limit for spawned processes, in megabytes (unix only).
    pub memory_mb: Option<u64>,
    /// Output returned inline; anything beyond is truncated and spooled.
    pub max_output_bytes: usize,
    /// Output captured per stream at all. Beyond this the process keeps
    /// running but its output is dropped.
    pub max_capture_bytes: usize,
    /// Spool full output of truncated calls to disk.
    pub spool: bool,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            cpu_seconds: Some(120),
            memory_mb: Some(2048),
            max_output_bytes: 64 * 1024,
            max_capture_bytes: 16 * 1024 * 1024,
            spool: true,
        }
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(serde::de::Error::custom("timeout must be a positive number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
