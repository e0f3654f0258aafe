//! Output capping and spooling.
//!
//! The reasoning loop only ever sees `max_output_bytes` of a tool's output.
//! When more was produced, the returned text ends with a one-line summary
//! and the full output is written to a spool file the operator can inspect.

use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CappedText {
    pub text: String,
    pub truncated: bool,
    pub total_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spool_path: Option<PathBuf>,
}

/// Writes full outputs under `<dir>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write(
        &self,
        run_id: &str,
        label: &str,
        content: &[u8],
    ) -> std::io::Result<PathBuf> {
        let dir = self.dir.join(run_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{label}-{}.log", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }
}

/// Longest prefix of `input` that fits in `max_bytes` without splitting a
/// character.
pub fn truncate_utf8_to_bytes(input: &str, max_bytes: usize) -> (&str, bool) {
    if input.len() <= max_bytes {
        return (input, false);
    }
    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    (&input[..end], true)
}

/// Cap `text`, spooling the full content when it does not fit. A spool
/// failure still truncates; the summary then says the output was dropped.
pub async fn cap_output(
    text: &str,
    max_bytes: usize,
    spool: Option<(&Spool, &str, &str)>,
) -> CappedText {
    let (head, truncated) = truncate_utf8_to_bytes(text, max_bytes);
    if !truncated {
        return CappedText {
            text: text.to_string(),
            truncated: false,
            total_bytes: text.len(),
            spool_path: None,
        };
    }
    let spool_path = match spool {
        Some((spool, run_id, label)) => match spool.write(run_id, label, text.as_bytes()).await {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!(error = %err, "failed to spool tool output");
                None
            }
        },
        None => None,
    };
    let location = match &spool_path {
        Some(path) => format!("full output: {}", path.display()),
        None => "remainder discarded".to_string(),
    };
    CappedText {
        text: format!(
            "{head}\n[truncated: showing {} of {} bytes; {location}]",
            head.len(),
            text.len()
        ),
        truncated: true,
        total_bytes: text.len(),
        spool_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_utf8_to_bytes("hello", 10), ("hello", false));
        assert_eq!(truncate_utf8_to_bytes("hello", 3), ("hel", true));
        // "é" is two bytes; cutting at 2 would split it.
        assert_eq!(truncate_utf8_to_bytes("aé", 2), ("a", true));
    }

    #[tokio::test]
    async fn test_small_output_untouched() {
        let capped = cap_output("ok", 10, None).await;
        assert_eq!(capped.text, "ok");
        assert!(!capped.truncated);
    }

    #[tokio::test]
    async fn test_large_output_spooled() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path());
        let text = "x".repeat(100);
        let capped = cap_output(&text, 10, Some((&spool, "r1", "stdout"))).await;
        assert!(capped.truncated);
        assert_eq!(capped.total_bytes, 100);
        assert!(capped.text.starts_with("xxxxxxxxxx\n[truncated: showing 10 of 100 bytes"));
        let path = capped.spool_path.unwrap();
        assert!(path.starts_with(dir.path().join("r1")));
        assert_eq!(std::fs::read_to_string(path).unwrap(), text);
    }

    #[tokio::test]
    async fn test_truncated_without_spool() {
        let capped = cap_output("abcdef", 2, None).await;
        assert!(capped.text.ends_with("remainder discarded]"));
        assert!(capped.spool_path.is_none());
    }
}
