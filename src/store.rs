//! On-disk artifact cache.
//!
//! Artifacts are write-once files keyed by (video id, kind) with
//! deterministic names, so the directory itself is the index. Producers
//! write to a staging path and rename into place; readers only ever see
//! complete files at the final paths.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Original,
    Enhanced,
}

impl ArtifactKind {
    pub fn file_name(&self, id: &str) -> String {
        match self {
            ArtifactKind::Original => format!("{id}.mp3"),
            ArtifactKind::Enhanced => format!("{id}_enhanced.mp3"),
        }
    }

    /// Stem shared by the staged output and any tool intermediates.
    fn staging_stem(&self, id: &str) -> String {
        match self {
            ArtifactKind::Original => format!("{id}.part"),
            ArtifactKind::Enhanced => format!("{id}_enhanced.part"),
        }
    }
}

/// Result of a cache probe. `path` is valid whether or not the file
/// exists, so callers can hand it to a producer.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub exists: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ArtifactStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Creating download directory {}", self.root.display()))
    }

    pub fn path_for(&self, id: &str, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.file_name(id))
    }

    /// Where a producer writes before promotion. Ends in `.mp3` so both
    /// yt-dlp's audio postprocessor and ffmpeg infer the right container.
    pub fn staging_path(&self, id: &str, kind: ArtifactKind) -> PathBuf {
        self.root.join(format!("{}.mp3", kind.staging_stem(id)))
    }

    /// Read-only probe; absent or unreadable entries report `exists: false`.
    pub fn locate(&self, id: &str, kind: ArtifactKind) -> Artifact {
        let path = self.path_for(id, kind);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Artifact {
                path,
                size_bytes: meta.len(),
                exists: true,
            },
            _ => Artifact {
                path,
                size_bytes: 0,
                exists: false,
            },
        }
    }

    /// Renames the staged file onto the final path. Atomic within the
    /// root filesystem; silently replaces an already-present artifact.
    pub fn promote(&self, id: &str, kind: ArtifactKind) -> std::io::Result<()> {
        fs::rename(self.staging_path(id, kind), self.path_for(id, kind))
    }

    /// Best-effort removal of staging leftovers for (id, kind), including
    /// tool intermediates that share the staging stem.
    pub fn discard_staging(&self, id: &str, kind: ArtifactKind) {
        let stem = kind.staging_stem(id);
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(&stem) {
                if let Err(err) = fs::remove_file(entry.path()) {
                    debug!(file = %name, %err, "failed to remove staging leftover");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn temp_store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn paths_are_deterministic_per_kind() {
        let (_dir, store) = temp_store();
        assert!(
            store
                .path_for("abc123", ArtifactKind::Original)
                .ends_with("abc123.mp3")
        );
        assert!(
            store
                .path_for("abc123", ArtifactKind::Enhanced)
                .ends_with("abc123_enhanced.mp3")
        );
        assert_eq!(
            store.path_for("abc123", ArtifactKind::Original),
            store.path_for("abc123", ArtifactKind::Original)
        );
    }

    #[test]
    fn locate_reports_missing_artifacts() {
        let (_dir, store) = temp_store();
        let artifact = store.locate("abc123", ArtifactKind::Original);
        assert!(!artifact.exists);
        assert_eq!(artifact.size_bytes, 0);
    }

    #[test]
    fn locate_reports_size_of_present_artifacts() {
        let (_dir, store) = temp_store();
        fs::write(store.path_for("abc123", ArtifactKind::Original), b"mp3data").unwrap();
        let artifact = store.locate("abc123", ArtifactKind::Original);
        assert!(artifact.exists);
        assert_eq!(artifact.size_bytes, 7);
    }

    #[test]
    fn promote_moves_staging_into_place() {
        let (_dir, store) = temp_store();
        fs::write(store.staging_path("abc123", ArtifactKind::Enhanced), b"data").unwrap();
        store.promote("abc123", ArtifactKind::Enhanced).unwrap();
        assert!(store.locate("abc123", ArtifactKind::Enhanced).exists);
        assert!(!store.staging_path("abc123", ArtifactKind::Enhanced).exists());
    }

    #[test]
    fn promote_replaces_existing_artifact() {
        let (_dir, store) = temp_store();
        fs::write(store.path_for("abc123", ArtifactKind::Original), b"old").unwrap();
        fs::write(store.staging_path("abc123", ArtifactKind::Original), b"fresh").unwrap();
        store.promote("abc123", ArtifactKind::Original).unwrap();
        assert_eq!(
            fs::read(store.path_for("abc123", ArtifactKind::Original)).unwrap(),
            b"fresh"
        );
    }

    #[test]
    fn discard_staging_removes_intermediates_only() {
        let (dir, store) = temp_store();
        fs::write(store.staging_path("abc123", ArtifactKind::Original), b"x").unwrap();
        fs::write(dir.path().join("abc123.part.webm"), b"x").unwrap();
        fs::write(store.path_for("abc123", ArtifactKind::Original), b"keep").unwrap();
        fs::write(store.path_for("other", ArtifactKind::Original), b"keep").unwrap();

        store.discard_staging("abc123", ArtifactKind::Original);

        assert!(!store.staging_path("abc123", ArtifactKind::Original).exists());
        assert!(!dir.path().join("abc123.part.webm").exists());
        assert!(store.locate("abc123", ArtifactKind::Original).exists);
        assert!(store.locate("other", ArtifactKind::Original).exists);
    }

    #[test]
    fn ensure_root_creates_missing_directories() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("nested").join("downloads"));
        store.ensure_root().unwrap();
        assert!(store.root().is_dir());
    }
}
