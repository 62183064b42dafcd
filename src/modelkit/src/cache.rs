//! Scratch space under the cache home, split by operation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use walkdir::WalkDir;

use kitops_core::error::{KitError, Result};

/// Cache subdirectory for layers being packed.
pub const PACK_SUBDIR: &str = "pack";
/// Cache subdirectory for unpack scratch files.
pub const UNPACK_SUBDIR: &str = "unpack";
/// Cache subdirectory for pull scratch files.
pub const PULL_SUBDIR: &str = "pull";

/// Handle on `<cache_home>`.
#[derive(Debug, Clone)]
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create (if needed) and return `<root>/<sub>/<key>`.
    pub fn mk_cache_dir(&self, sub: &str, key: &str) -> Result<PathBuf> {
        let dir = if key.is_empty() {
            self.root.join(sub)
        } else {
            self.root.join(sub).join(key)
        };
        std::fs::create_dir_all(&dir).map_err(|e| {
            KitError::Other(format!(
                "failed to create cache directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(dir)
    }

    /// Create a named temporary file in `<root>/<sub>`. The file is removed
    /// when the handle is dropped unless it is persisted.
    pub fn mk_cache_file(&self, sub: &str, prefix: &str) -> Result<NamedTempFile> {
        let dir = self.mk_cache_dir(sub, "")?;
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(&dir)?;
        Ok(file)
    }

    /// Remove `<root>/<sub>` and everything in it.
    pub fn clean(&self, sub: &str) -> Result<()> {
        remove_dir_if_exists(&self.root.join(sub))
    }

    /// Bytes used per subdirectory, keyed by subdirectory name.
    pub fn stat(&self) -> Result<BTreeMap<String, u64>> {
        let mut totals = BTreeMap::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(totals),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let size = WalkDir::new(entry.path())
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum();
            totals.insert(entry.file_name().to_string_lossy().into_owned(), size);
        }
        Ok(totals)
    }

    /// Remove the whole cache.
    pub fn clear(&self) -> Result<()> {
        tracing::info!(path = %self.root.display(), "Clearing cache");
        remove_dir_if_exists(&self.root)
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KitError::Other(format!(
            "failed to remove {}: {}",
            dir.display(),
            e
        ))),
    }
}
