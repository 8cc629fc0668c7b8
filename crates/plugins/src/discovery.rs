//! Manifest I/O behind an injectable source.
//!
//! Discovery asks a [`ManifestSource`] for package directories and manifest
//! text, so the runtime is testable without touching disk.

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    lokus_manifest::{AcceptedManifest, MANIFEST_FILE_NAME},
    tracing::debug,
};

use crate::error::{Error, Result};

#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Immediate package directories under `root`, sorted by name. A missing
    /// root yields an empty list.
    async fn list_plugin_dirs(&self, root: &Path) -> std::io::Result<Vec<PathBuf>>;

    /// Raw manifest text of the package at `dir`.
    async fn read_manifest(&self, dir: &Path) -> std::io::Result<String>;
}

/// Reads packages from the local filesystem.
#[derive(Debug, Clone)]
pub struct FsManifestSource {
    manifest_file: String,
}

impl FsManifestSource {
    pub fn new(manifest_file: impl Into<String>) -> Self {
        Self {
            manifest_file: manifest_file.into(),
        }
    }

    pub fn manifest_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.manifest_file)
    }
}

impl Default for FsManifestSource {
    fn default() -> Self {
        Self::new(MANIFEST_FILE_NAME)
    }
}

#[async_trait]
impl ManifestSource for FsManifestSource {
    async fn list_plugin_dirs(&self, root: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(root = %root.display(), "plugin root does not exist");
                return Ok(Vec::new());
            },
            Err(e) => return Err(e),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn read_manifest(&self, dir: &Path) -> std::io::Result<String> {
        tokio::fs::read_to_string(self.manifest_path(dir)).await
    }
}

/// Read and accept the manifest of the package at `dir`.
///
/// Used by tooling that wants the intake result without a running manager.
pub async fn read_package(
    source: &dyn ManifestSource,
    dir: &Path,
    allow_migration: bool,
) -> Result<AcceptedManifest> {
    let raw = source.read_manifest(dir).await?;
    let fallback_id = fallback_plugin_id(&raw, dir);
    lokus_manifest::accept_str(&raw, allow_migration)
        .map_err(|e| Error::from_manifest(fallback_id, e))
}

/// Best-effort id for a package whose manifest may be broken: the declared
/// `id` when it is usable, else the directory name.
pub(crate) fn fallback_plugin_id(raw: &str, dir: &Path) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|doc| doc.get("id").and_then(|id| id.as_str()).map(str::to_string))
        .filter(|id| lokus_manifest::is_valid_plugin_id(id))
        .unwrap_or_else(|| {
            dir.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| dir.display().to_string())
        })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "manifest": "2.0",
        "id": "lokus.hello",
        "name": "Hello",
        "version": "1.0.0",
        "publisher": "lokus",
        "description": "Says hello",
        "engines": {"host": "^1.0.0"}
    }"#;

    #[tokio::test]
    async fn lists_only_directories_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("zeta")).unwrap();
        std::fs::create_dir_all(tmp.path().join("alpha")).unwrap();
        std::fs::write(tmp.path().join("README.md"), "not a plugin").unwrap();

        let dirs = FsManifestSource::default()
            .list_plugin_dirs(tmp.path())
            .await
            .unwrap();
        let names: Vec<_> = dirs
            .iter()
            .map(|d| d.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn missing_root_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = FsManifestSource::default()
            .list_plugin_dirs(&tmp.path().join("nope"))
            .await
            .unwrap();
        assert!(dirs.is_empty());
    }

    #[tokio::test]
    async fn reads_configured_manifest_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("hello");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("package.plugin.json"), MANIFEST).unwrap();

        let source = FsManifestSource::new("package.plugin.json");
        let accepted = read_package(&source, &dir, true).await.unwrap();
        assert_eq!(accepted.manifest.id, "lokus.hello");
    }

    #[tokio::test]
    async fn broken_manifest_is_attributed_to_its_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("broken-one");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE_NAME), "{ nope").unwrap();

        let err = read_package(&FsManifestSource::default(), &dir, true)
            .await
            .unwrap_err();
        assert!(
            matches!(&err, Error::ManifestValidation { plugin_id, .. } if plugin_id == "broken-one"),
            "{err}"
        );
    }

    #[test]
    fn fallback_prefers_declared_id() {
        let dir = Path::new("/plugins/dir-name");
        assert_eq!(fallback_plugin_id(r#"{"id": "declared"}"#, dir), "declared");
        assert_eq!(fallback_plugin_id(r#"{"id": "../bad"}"#, dir), "dir-name");
        assert_eq!(fallback_plugin_id("garbage", dir), "dir-name");
    }
}
