//! Upgrade of the per-repository OCI layouts used by older releases
//! (`<storage>/<registry>/<repository>/{blobs,index.json}`, tags stored as
//! ref-name annotations) into the shared blob store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use kitops_core::error::{KitError, Result};

use super::index::read_index;
use super::LocalRepository;
use crate::copy::{copy, CopyOptions};
use crate::oci::{is_digest, BlobReader, Descriptor, Target, REF_NAME_ANNOTATION};

/// Top-level storage entries that belong to the current layout.
const CURRENT_LAYOUT_DIRS: [&str; 3] = ["blobs", "ingest", "refs"];

/// Read-only view of one legacy repository directory.
pub struct LegacyStore {
    root: PathBuf,
    registry: String,
    repository: String,
    manifests: Vec<Descriptor>,
}

impl LegacyStore {
    fn open(storage: &Path, rel: &str) -> Result<Option<Self>> {
        let Some((registry, repository)) = rel.split_once('/') else {
            return Ok(None);
        };
        let root = storage.join(rel);
        let manifests = read_index(&root.join("index.json"))?.manifests;
        Ok(Some(Self {
            root,
            registry: registry.to_string(),
            repository: repository.to_string(),
            manifests,
        }))
    }

    pub fn repo_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    pub fn manifests(&self) -> &[Descriptor] {
        &self.manifests
    }

    fn blob_path(&self, desc: &Descriptor) -> Result<PathBuf> {
        Ok(self
            .root
            .join("blobs")
            .join(desc.algorithm()?)
            .join(desc.encoded()?))
    }
}

#[async_trait]
impl Target for LegacyStore {
    fn name(&self) -> String {
        self.repo_name()
    }

    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        let found = if is_digest(reference) {
            self.manifests.iter().find(|m| m.digest == reference)
        } else {
            self.manifests.iter().find(|m| {
                m.annotations
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .is_some_and(|t| t == reference)
            })
        };
        found
            .map(Descriptor::stripped)
            .ok_or_else(|| KitError::ManifestNotFound(format!("{}:{}", self.repo_name(), reference)))
    }

    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(desc)?).await?)
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<BlobReader> {
        match tokio::fs::File::open(self.blob_path(desc)?).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KitError::BlobNotFound(desc.digest.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn push(&self, _desc: &Descriptor, _content: BlobReader) -> Result<()> {
        Err(KitError::Unsupported("legacy storage is read-only".to_string()))
    }

    async fn tag(&self, _desc: &Descriptor, _reference: &str) -> Result<()> {
        Err(KitError::Unsupported("legacy storage is read-only".to_string()))
    }

    async fn untag(&self, _reference: &str) -> Result<()> {
        Err(KitError::Unsupported("legacy storage is read-only".to_string()))
    }

    async fn delete(&self, _desc: &Descriptor) -> Result<()> {
        Err(KitError::Unsupported("legacy storage is read-only".to_string()))
    }
}

/// Every legacy repository under `storage`.
pub fn find_legacy_stores(storage: &Path) -> Result<Vec<LegacyStore>> {
    if !storage.exists() {
        return Ok(Vec::new());
    }
    let mut stores = Vec::new();
    let mut walker = WalkDir::new(storage).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry
            .map_err(|e| KitError::Other(format!("failed to read local storage: {}", e)))?;
        if entry.depth() == 1
            && entry.file_type().is_dir()
            && CURRENT_LAYOUT_DIRS.iter().any(|d| entry.file_name() == *d)
        {
            walker.skip_current_dir();
            continue;
        }
        if !entry.file_type().is_file() || entry.file_name() != "index.json" {
            continue;
        }
        let Some(rel) = entry
            .path()
            .parent()
            .and_then(|dir| dir.strip_prefix(storage).ok())
            .map(|rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
        else {
            continue;
        };
        if let Some(store) = LegacyStore::open(storage, &rel)? {
            stores.push(store);
        }
    }
    Ok(stores)
}

/// Whether `storage` still holds legacy repositories.
pub fn needs_migration(storage: &Path) -> Result<bool> {
    Ok(!find_legacy_stores(storage)?.is_empty())
}

/// Copy every legacy ModelKit into the shared layout, then remove the legacy
/// directories. Returns the number of repositories migrated; a storage
/// directory without legacy content is left untouched.
pub async fn migrate(storage: &Path) -> Result<usize> {
    let stores = find_legacy_stores(storage)?;
    let opts = CopyOptions::default();

    for store in &stores {
        let repo = LocalRepository::open_repo(storage, &store.registry, &store.repository)?;
        for desc in store.manifests() {
            let reference = desc
                .annotations
                .as_ref()
                .and_then(|a| a.get(REF_NAME_ANNOTATION))
                .filter(|t| !t.is_empty())
                .cloned()
                .unwrap_or_else(|| desc.digest.clone());
            tracing::debug!(
                repository = %store.repo_name(),
                reference = %reference,
                "Migrating ModelKit to new storage"
            );
            copy(store, &reference, &repo, &reference, &opts)
                .await
                .map_err(|e| {
                    KitError::Other(format!(
                        "failed to migrate modelkit {}:{}: {}",
                        store.repo_name(),
                        reference,
                        e
                    ))
                })?;
            if !repo.exists(&desc.stripped()).await? {
                return Err(KitError::Other(format!(
                    "migrating modelkit {}:{} failed",
                    store.repo_name(),
                    reference
                )));
            }
        }
        remove_dir(&store.root)?;
    }

    for store in &stores {
        remove_dir(&storage.join(&store.registry))?;
    }
    if !stores.is_empty() {
        tracing::info!(repositories = stores.len(), "Migrated local storage");
    }
    Ok(stores.len())
}

fn remove_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KitError::Other(format!(
            "failed to clean up directory {} after migration: {}",
            dir.display(),
            e
        ))),
    }
}
