//! Per-repository manifest list (`index.json`) and tag map (`tags.json`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kitops_core::config::refs_path;
use kitops_core::error::{KitError, Result};

use crate::oci::{is_digest, Descriptor, Index, REF_NAME_ANNOTATION};

const INDEX_FILE: &str = "index.json";
const TAGS_FILE: &str = "tags.json";

/// In-memory copy of one repository's index and tags, rewritten wholesale
/// on every mutation.
#[derive(Debug)]
pub(crate) struct LocalIndex {
    index_path: PathBuf,
    tags_path: PathBuf,
    index: Index,
    tags: BTreeMap<String, Descriptor>,
}

impl LocalIndex {
    /// `<storage>/refs/<registry>/<repository>`
    pub fn dir(storage: &Path, registry: &str, repository: &str) -> PathBuf {
        let mut dir = refs_path(storage).join(registry);
        for part in repository.split('/') {
            dir.push(part);
        }
        dir
    }

    pub fn load(storage: &Path, registry: &str, repository: &str) -> Result<Self> {
        let dir = Self::dir(storage, registry, repository);
        let index_path = dir.join(INDEX_FILE);
        let tags_path = dir.join(TAGS_FILE);
        let index = read_index(&index_path)?;
        let tags = match std::fs::read(&tags_path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                KitError::LocalStoreCorruption(format!(
                    "failed to parse {}: {}",
                    tags_path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            index_path,
            tags_path,
            index,
            tags,
        })
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn manifests(&self) -> &[Descriptor] {
        &self.index.manifests
    }

    pub fn has_manifest(&self, digest: &str) -> bool {
        self.index.manifests.iter().any(|m| m.digest == digest)
    }

    /// Add a manifest descriptor. A ref-name annotation on `desc` is moved
    /// into the tag map instead of being stored in the index.
    pub fn add_manifest(&mut self, desc: &Descriptor) -> Result<()> {
        let mut desc = desc.clone();
        let tag = desc
            .annotations
            .as_mut()
            .and_then(|a| a.remove(REF_NAME_ANNOTATION));
        if desc.annotations.as_ref().is_some_and(|a| a.is_empty()) {
            desc.annotations = None;
        }
        if !self.has_manifest(&desc.digest) {
            self.index.manifests.push(desc.clone());
        }
        if let Some(tag) = tag.filter(|t| !t.is_empty()) {
            self.tags.insert(tag, desc);
        }
        self.save()
    }

    /// Drop a manifest and every tag pointing at it. Returns the removed tags.
    pub fn remove_manifest(&mut self, digest: &str) -> Result<Vec<String>> {
        let tags = self.tags_for(digest);
        for tag in &tags {
            self.tags.remove(tag);
        }
        self.index.manifests.retain(|m| m.digest != digest);
        self.save()?;
        Ok(tags)
    }

    pub fn resolve(&self, reference: &str) -> Result<Descriptor> {
        if reference.is_empty() {
            return Err(KitError::InvalidTag("missing reference".to_string()));
        }
        if is_digest(reference) {
            return self
                .index
                .manifests
                .iter()
                .find(|m| m.digest == reference)
                .cloned()
                .ok_or_else(|| KitError::ManifestNotFound(reference.to_string()));
        }
        self.tags
            .get(reference)
            .cloned()
            .ok_or_else(|| KitError::TagNotFound(reference.to_string()))
    }

    pub fn tag(&mut self, desc: &Descriptor, name: &str) -> Result<()> {
        let stored = self
            .index
            .manifests
            .iter()
            .find(|m| m.digest == desc.digest)
            .cloned()
            .ok_or_else(|| {
                KitError::ManifestNotFound(format!("{}: {}", desc.digest, desc.media_type))
            })?;
        self.tags.insert(name.to_string(), stored);
        self.save()
    }

    pub fn untag(&mut self, name: &str) -> Result<()> {
        if self.tags.remove(name).is_none() {
            return Err(KitError::TagNotFound(name.to_string()));
        }
        self.save()
    }

    /// Tags pointing at `digest`, sorted.
    pub fn tags_for(&self, digest: &str) -> Vec<String> {
        self.tags
            .iter()
            .filter(|(_, d)| d.digest == digest)
            .map(|(t, _)| t.clone())
            .collect()
    }

    fn save(&self) -> Result<()> {
        if self.tags.is_empty() {
            remove_if_exists(&self.tags_path)?;
        } else {
            write_atomic(&self.tags_path, &serde_json::to_vec(&self.tags)?)?;
        }
        if self.index.manifests.is_empty() {
            remove_if_exists(&self.index_path)?;
        } else {
            write_atomic(&self.index_path, &serde_json::to_vec(&self.index)?)?;
        }
        Ok(())
    }
}

/// Parse an `index.json`; a missing file is an empty index.
pub(crate) fn read_index(path: &Path) -> Result<Index> {
    match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).map_err(|e| {
            KitError::LocalStoreCorruption(format!("failed to parse {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Index::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write to `<path>.tmp`, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
