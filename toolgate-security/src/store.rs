//! Versioned policy store with atomic hot reload.
//!
//! Readers take a snapshot with [`PolicyStore::current`] and keep using it for
//! the whole evaluation; a concurrent reload swaps the pointer without ever
//! exposing a half-built policy. Writers are serialized by the text mutex, so
//! versions are assigned in order.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use crate::policy::Policy;
use crate::policy::PolicyDocument;
use crate::policy::PolicyError;
use crate::policy::PolicyTexts;
use crate::policy::compile;

/// Version change produced by a successful reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReloadOutcome {
    pub previous_version: u64,
    pub version: u64,
}

pub struct PolicyStore {
    dir: Option<PathBuf>,
    base_dir: PathBuf,
    current: ArcSwap<Policy>,
    texts: Mutex<PolicyTexts>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore")
            .field("dir", &self.dir)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl PolicyStore {
    /// Load the bundle in `dir`. Failing here is fatal for the caller: there
    /// is no earlier policy to fall back to.
    pub fn load(dir: &Path, base_dir: &Path) -> Result<Self, PolicyError> {
        let texts = PolicyTexts::read_dir(dir)?;
        let mut store = Self::from_texts(texts, base_dir)?;
        store.dir = Some(dir.to_path_buf());
        Ok(store)
    }

    /// Build a store from in-memory documents. `reload` then recompiles the
    /// same texts.
    pub fn from_texts(texts: PolicyTexts, base_dir: &Path) -> Result<Self, PolicyError> {
        let policy = compile(&texts, base_dir, 1)?;
        info!(version = policy.version, "policy loaded");
        Ok(Self {
            dir: None,
            base_dir: base_dir.to_path_buf(),
            current: ArcSwap::from_pointee(policy),
            texts: Mutex::new(texts),
        })
    }

    pub fn current(&self) -> Arc<Policy> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    pub fn policy_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Re-read the whole bundle from disk (or recompile the in-memory texts).
    pub fn reload(&self) -> Result<ReloadOutcome, PolicyError> {
        let mut texts = self.texts.lock().unwrap_or_else(PoisonError::into_inner);
        let candidate = match &self.dir {
            Some(dir) => PolicyTexts::read_dir(dir).inspect_err(|err| {
                warn!(error = %err, "policy reload failed; keeping current policy");
            })?,
            None => texts.clone(),
        };
        self.install(&mut texts, candidate)
    }

    /// Replace one document and recompile the bundle with the other two
    /// unchanged.
    pub fn reload_document(
        &self,
        document: PolicyDocument,
        text: String,
    ) -> Result<ReloadOutcome, PolicyError> {
        let mut texts = self.texts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut candidate = texts.clone();
        candidate.set(document, text);
        self.install(&mut texts, candidate)
    }

    /// Validate documents without installing them.
    pub fn validate(&self, texts: &PolicyTexts) -> Result<(), PolicyError> {
        compile(texts, &self.base_dir, 0).map(|_| ())
    }

    fn install(
        &self,
        texts: &mut PolicyTexts,
        candidate: PolicyTexts,
    ) -> Result<ReloadOutcome, PolicyError> {
        let previous_version = self.current.load().version;
        let policy = compile(&candidate, &self.base_dir, previous_version + 1).inspect_err(|err| {
            warn!(
                error = %err,
                version = previous_version,
                "policy reload rejected; keeping current policy"
            );
        })?;
        let version = policy.version;
        self.current.store(Arc::new(policy));
        *texts = candidate;
        info!(previous_version, version, "policy reloaded");
        Ok(ReloadOutcome {
            previous_version,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::tests::NETWORK;
    use crate::policy::tests::PATHS;
    use crate::policy::tests::TOOLS;
    use crate::policy::tests::texts;

    #[test]
    fn test_reload_bumps_version_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::from_texts(texts(PATHS, TOOLS, NETWORK), dir.path()).unwrap();
        assert_eq!(store.version(), 1);
        let outcome = store.reload().unwrap();
        assert_eq!(outcome, ReloadOutcome { previous_version: 1, version: 2 });
        assert_eq!(store.reload().unwrap().version, 3);
    }

    #[test]
    fn test_failed_reload_keeps_previous_policy() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::from_texts(texts(PATHS, TOOLS, NETWORK), dir.path()).unwrap();
        let before = store.current();

        let err = store
            .reload_document(PolicyDocument::Tools, "allowed_commands: [\"'broken\"]\n".into())
            .unwrap_err();
        assert!(matches!(err, PolicyError::Invalid { document: PolicyDocument::Tools, .. }));

        let after = store.current();
        assert_eq!(after.version, 1);
        assert!(Arc::ptr_eq(&before, &after));
        // A later full reload still sees the last good tools document.
        assert_eq!(store.reload().unwrap().version, 2);
        assert_eq!(store.current().commands.patterns().len(), 2);
    }

    #[test]
    fn test_partial_reload_replaces_one_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::from_texts(texts(PATHS, TOOLS, NETWORK), dir.path()).unwrap();
        store
            .reload_document(PolicyDocument::Network, "allow_net: true\nallowed_hosts: [example.com]\n".into())
            .unwrap();
        let policy = store.current();
        assert!(policy.network.allow_net());
        assert_eq!(policy.commands.patterns().len(), 2);
    }

    #[test]
    fn test_snapshot_survives_swap() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::from_texts(texts(PATHS, TOOLS, NETWORK), dir.path()).unwrap();
        let snapshot = store.current();
        store
            .reload_document(PolicyDocument::Tools, "allowed_commands: [\"cargo test\"]\n".into())
            .unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.commands.patterns().len(), 2);
        assert_eq!(store.current().commands.patterns().len(), 1);
    }

    #[test]
    fn test_load_from_directory_and_reload_from_disk() {
        let workspace = tempfile::tempdir().unwrap();
        let policy_dir = tempfile::tempdir().unwrap();
        std::fs::write(policy_dir.path().join("paths.yaml"), PATHS).unwrap();
        std::fs::write(policy_dir.path().join("tools.yaml"), TOOLS).unwrap();
        std::fs::write(policy_dir.path().join("network.yaml"), NETWORK).unwrap();

        let store = PolicyStore::load(policy_dir.path(), workspace.path()).unwrap();
        assert_eq!(store.policy_dir(), Some(policy_dir.path()));

        std::fs::write(policy_dir.path().join("network.yaml"), "allow_net: [oops\n").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.version(), 1);

        std::fs::write(policy_dir.path().join("network.yaml"), "allow_net: true\n").unwrap();
        assert_eq!(store.reload().unwrap().version, 2);
        assert!(store.current().network.allow_net());
    }

    #[test]
    fn test_concurrent_reloads_assign_distinct_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(PolicyStore::from_texts(texts(PATHS, TOOLS, NETWORK), dir.path()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.reload().unwrap().version)
            })
            .collect();
        let mut versions: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        versions.sort_unstable();
        assert_eq!(versions, (2..=9).collect::<Vec<_>>());
        assert_eq!(store.version(), 9);
    }
}
