//! Durable snapshot persistence.
//!
//! A single compacted snapshot file lives inside the configured state
//! directory. Writes are atomic (temp file then rename) and debounced
//! behind an idle period, so a burst of document changes produces one
//! write. Snapshot failures are never fatal: a read error starts the
//! document empty, a write error leaves the previous snapshot intact.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::doc::Document;
use crate::error::{StateError, StateResult};

/// Size cap for a persisted snapshot (50 MiB).
pub const SNAPSHOT_CAP_BYTES: usize = 50 * 1024 * 1024;

/// Idle period after the last change before the snapshot is rewritten.
pub const PERSIST_DEBOUNCE: Duration = Duration::from_secs(5);

/// Origin tag used when hydrating the document from disk.
const HYDRATE_ORIGIN: u64 = u64::MAX;

/// Validated access to snapshot files inside one state directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    state_dir: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at `state_dir`, creating the directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory cannot be created or
    /// canonicalized.
    pub fn new(state_dir: impl Into<PathBuf>) -> StateResult<Self> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir).map_err(|source| StateError::Io {
            path: state_dir.display().to_string(),
            source,
        })?;
        let state_dir = state_dir.canonicalize().map_err(|source| StateError::Io {
            path: state_dir.display().to_string(),
            source,
        })?;
        Ok(Self { state_dir })
    }

    /// The default snapshot path inside the state directory.
    #[must_use]
    pub fn default_path(&self) -> PathBuf {
        self.state_dir.join(ansible_core::SNAPSHOT_FILE_NAME)
    }

    /// Resolve a snapshot path, following symlinks, and reject anything
    /// that lands outside the state directory.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::PathTraversal`] when the canonical path
    /// escapes, or [`StateError::Io`] when it cannot be canonicalized.
    pub fn resolve(&self, path: &Path) -> StateResult<PathBuf> {
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.state_dir.join(path)
        };

        // The file may not exist yet; canonicalize its parent and re-attach
        // the file name so symlinked parents cannot smuggle the file out.
        let resolved = if candidate.exists() {
            candidate.canonicalize().map_err(|source| StateError::Io {
                path: candidate.display().to_string(),
                source,
            })?
        } else {
            let parent = candidate
                .parent()
                .ok_or_else(|| StateError::PathTraversal {
                    path: candidate.display().to_string(),
                })?;
            let file_name = candidate
                .file_name()
                .ok_or_else(|| StateError::PathTraversal {
                    path: candidate.display().to_string(),
                })?;
            parent
                .canonicalize()
                .map_err(|source| StateError::Io {
                    path: parent.display().to_string(),
                    source,
                })?
                .join(file_name)
        };

        if !resolved.starts_with(&self.state_dir) {
            return Err(StateError::PathTraversal {
                path: path.display().to_string(),
            });
        }
        Ok(resolved)
    }

    /// Persist the compacted document to `path`, atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::SnapshotTooLarge`] past the 50 MiB cap (the
    /// previous snapshot is left intact), [`StateError::PathTraversal`]
    /// for an escaping path, or [`StateError::Io`] on write failure.
    pub async fn persist(&self, doc: &Document, path: &Path) -> StateResult<()> {
        let path = self.resolve(path)?;
        let bytes = doc.compact()?;
        if bytes.len() > SNAPSHOT_CAP_BYTES {
            return Err(StateError::SnapshotTooLarge {
                size: bytes.len(),
                cap: SNAPSHOT_CAP_BYTES,
            });
        }

        let tmp = path.with_extension("yjs.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| StateError::Io {
                path: tmp.display().to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StateError::Io {
                path: path.display().to_string(),
                source,
            })?;
        debug!(path = %path.display(), bytes = bytes.len(), "snapshot persisted");
        Ok(())
    }

    /// Hydrate the document from `path`. A missing file is not an error;
    /// the document simply starts empty.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Decode`] for a corrupt snapshot or
    /// [`StateError::Io`] for a read failure; callers treat both as
    /// warnings.
    pub async fn load(&self, doc: &Document, path: &Path) -> StateResult<()> {
        let path = self.resolve(path)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no snapshot on disk, starting empty");
                return Ok(());
            },
            Err(source) => {
                return Err(StateError::Io {
                    path: path.display().to_string(),
                    source,
                });
            },
        };
        doc.apply_encoded_state(&bytes, HYDRATE_ORIGIN)?;
        debug!(path = %path.display(), bytes = bytes.len(), "snapshot loaded");
        Ok(())
    }
}

/// Run the debounced persister until shutdown.
///
/// Any document change arms (or re-arms) a [`PERSIST_DEBOUNCE`] timer; when
/// it expires the snapshot is rewritten. A final flush runs on shutdown.
/// All persistence errors are warnings.
pub async fn run_persister(
    doc: Document,
    store: SnapshotStore,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let path = store.default_path();
    let mut changes = doc.subscribe_changes();
    let mut dirty = false;

    loop {
        if dirty {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                event = changes.recv() => {
                    // Timer re-arms; lagged receivers just stay dirty.
                    if event.is_err() && !matches!(event, Err(broadcast::error::RecvError::Lagged(_))) {
                        break;
                    }
                }
                () = tokio::time::sleep(PERSIST_DEBOUNCE) => {
                    if let Err(e) = store.persist(&doc, &path).await {
                        warn!(error = %e, "snapshot persist failed");
                    }
                    dirty = false;
                }
            }
        } else {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                event = changes.recv() => {
                    match event {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => dirty = true,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    // Final flush so a clean shutdown never loses the tail of changes.
    if dirty {
        if let Err(e) = store.persist(&doc, &path).await {
            warn!(error = %e, "final snapshot flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let doc = Document::new("n1");
        doc.insert_value("nodes", "bb1", json!({"tier": "backbone"}));
        doc.insert_value("tasks", "t1", json!({"title": "x"}));
        doc.remove("tasks", "t1");

        store.persist(&doc, &store.default_path()).await.unwrap();

        let restored = Document::new("n1");
        store.load(&restored, &store.default_path()).await.unwrap();
        assert_eq!(doc.materialized("nodes"), restored.materialized("nodes"));
        assert_eq!(doc.materialized("tasks"), restored.materialized("tasks"));
    }

    #[tokio::test]
    async fn missing_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let doc = Document::new("n1");
        store.load(&doc, &store.default_path()).await.unwrap();
        assert!(doc.is_empty("nodes"));
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let path = store.default_path();
        tokio::fs::write(&path, b"garbage").await.unwrap();

        let doc = Document::new("n1");
        let err = store.load(&doc, &path).await.unwrap_err();
        assert!(matches!(err, StateError::Decode(_)));
        assert!(doc.is_empty("nodes"));
    }

    #[tokio::test]
    async fn escaping_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let doc = Document::new("n1");

        let escape = dir.path().join("..").join("stolen.yjs");
        let err = store.persist(&doc, &escape).await.unwrap_err();
        assert!(matches!(err, StateError::PathTraversal { .. }));
        assert_eq!(err.kind(), ansible_core::ErrorKind::PathTraversal);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_parent_cannot_smuggle_the_snapshot_out() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();

        let link = dir.path().join("link");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let doc = Document::new("n1");
        let err = store
            .persist(&doc, &link.join("snap.yjs"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::PathTraversal { .. }));
    }

    #[tokio::test]
    async fn relative_paths_resolve_inside_the_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let doc = Document::new("n1");
        doc.insert_value("nodes", "n1", json!({"tier": "edge"}));

        store
            .persist(&doc, Path::new("custom.yjs"))
            .await
            .unwrap();
        assert!(dir.path().join("custom.yjs").exists());
    }
}
