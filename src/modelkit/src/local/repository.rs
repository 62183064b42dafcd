//! `Target` over the shared local blob store and one repository's index.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncSeekExt;
use walkdir::WalkDir;

use kitops_core::config::{blobs_path, ingest_path, refs_path};
use kitops_core::error::{KitError, Result};
use kitops_core::progress::{Clock, NoProgress, ProgressSink, SystemClock};

use super::index::{read_index, LocalIndex};
use crate::oci::{BlobReader, Descriptor, FetchedBlob, Manifest, Reference, Target};

/// One `(registry, repository)` view of local storage.
///
/// Blobs live in the shared `<storage>/blobs` store; manifests are only
/// visible through this repository when its index lists them.
pub struct LocalRepository {
    storage: PathBuf,
    registry: String,
    repository: String,
    index: Mutex<LocalIndex>,
    pub(super) progress: Arc<dyn ProgressSink>,
    pub(super) clock: Arc<dyn Clock>,
}

impl LocalRepository {
    /// Open the repository named by `reference`, creating storage
    /// directories as needed.
    pub fn open(storage: &Path, reference: &Reference) -> Result<Self> {
        Self::open_repo(storage, &reference.registry, &reference.repository)
    }

    pub fn open_repo(storage: &Path, registry: &str, repository: &str) -> Result<Self> {
        std::fs::create_dir_all(blobs_path(storage).join("sha256")).map_err(|e| {
            KitError::Other(format!(
                "failed to create storage directory {}: {}",
                storage.display(),
                e
            ))
        })?;
        std::fs::create_dir_all(ingest_path(storage))?;
        let index = LocalIndex::load(storage, registry, repository)?;
        Ok(Self {
            storage: storage.to_path_buf(),
            registry: registry.to_string(),
            repository: repository.to_string(),
            index: Mutex::new(index),
            progress: Arc::new(NoProgress),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>, clock: Arc<dyn Clock>) -> Self {
        self.progress = progress;
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn storage(&self) -> &Path {
        &self.storage
    }

    /// `registry/repository`
    pub fn repo_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// A reference into this repository.
    pub fn reference(&self, reference: &str) -> Reference {
        Reference::new(&self.registry, &self.repository, reference)
    }

    /// `<storage>/blobs/<alg>/<hex>`
    pub fn blob_path(&self, desc: &Descriptor) -> Result<PathBuf> {
        Ok(blobs_path(&self.storage)
            .join(desc.algorithm()?)
            .join(desc.encoded()?))
    }

    pub(super) fn ingest_dir(&self) -> PathBuf {
        ingest_path(&self.storage)
    }

    /// Manifest descriptors listed in this repository's index.
    pub fn get_all_models(&self) -> Vec<Descriptor> {
        self.index.lock().manifests().to_vec()
    }

    /// Tags pointing at `desc`, sorted.
    pub fn get_tags(&self, desc: &Descriptor) -> Vec<String> {
        self.index.lock().tags_for(&desc.digest)
    }

    pub(super) fn add_to_index(&self, desc: &Descriptor) -> Result<()> {
        self.index.lock().add_manifest(desc)
    }

    /// True when no other repository's index lists `digest`.
    pub fn can_safely_delete_manifest(&self, digest: &str) -> Result<bool> {
        let own = self.index.lock().index_path().to_path_buf();
        for (index_path, desc) in indexed_manifests(&self.storage)? {
            if index_path != own && desc.digest == digest {
                tracing::debug!(
                    digest,
                    index = %index_path.display(),
                    "Manifest is still referenced by another repository"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Remove leftover files from interrupted downloads.
    pub fn clean_ingest(&self) -> Result<()> {
        let dir = self.ingest_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    async fn read_manifest_blob(&self, desc: &Descriptor) -> Result<Option<Manifest>> {
        match tokio::fs::read(self.blob_path(desc)?).await {
            Ok(data) => Ok(Some(Manifest::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_blob(&self, desc: &Descriptor) -> Result<()> {
        let path = self.blob_path(desc)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(digest = %desc.digest, "Removed blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KitError::Other(format!(
                "failed to remove blob {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn open_blob(&self, desc: &Descriptor) -> Result<tokio::fs::File> {
        if desc.is_manifest() && !self.index.lock().has_manifest(&desc.digest) {
            return Err(KitError::ManifestNotFound(format!(
                "{}@{}",
                self.repo_name(),
                desc.digest
            )));
        }
        match tokio::fs::File::open(self.blob_path(desc)?).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KitError::BlobNotFound(desc.digest.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Target for LocalRepository {
    fn name(&self) -> String {
        self.repo_name()
    }

    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        self.index.lock().resolve(reference)
    }

    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        if desc.is_manifest() {
            return Ok(self.index.lock().has_manifest(&desc.digest));
        }
        Ok(tokio::fs::try_exists(self.blob_path(desc)?).await?)
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<BlobReader> {
        Ok(Box::new(self.open_blob(desc).await?))
    }

    async fn fetch_from(&self, desc: &Descriptor, offset: u64) -> Result<FetchedBlob> {
        let mut file = self.open_blob(desc).await?;
        let offset = offset.min(desc.size);
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(FetchedBlob {
            reader: Box::new(file),
            offset,
            resumable: true,
        })
    }

    async fn push(&self, desc: &Descriptor, content: BlobReader) -> Result<()> {
        if !tokio::fs::try_exists(self.blob_path(desc)?).await? {
            self.write_blob(desc, content).await?;
        }
        if desc.is_manifest() {
            self.add_to_index(desc)?;
        }
        Ok(())
    }

    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
        self.index.lock().tag(desc, reference)
    }

    async fn untag(&self, reference: &str) -> Result<()> {
        self.index.lock().untag(reference)
    }

    /// Deleting a manifest untags it and drops it from this index. The
    /// manifest blob and any config or layer blob no remaining manifest uses
    /// are removed only when no other repository lists the manifest.
    async fn delete(&self, desc: &Descriptor) -> Result<()> {
        if !desc.is_manifest() {
            return self.remove_blob(desc);
        }
        if !self.index.lock().has_manifest(&desc.digest) {
            return Err(KitError::ManifestNotFound(format!(
                "{}@{}",
                self.repo_name(),
                desc.digest
            )));
        }
        let manifest = self.read_manifest_blob(desc).await?;
        let untagged = self.index.lock().remove_manifest(&desc.digest)?;
        tracing::debug!(
            repository = %self.repo_name(),
            digest = %desc.digest,
            tags = ?untagged,
            "Removed manifest from index"
        );

        if !self.can_safely_delete_manifest(&desc.digest)? {
            return Ok(());
        }
        self.remove_blob(desc)?;
        if let Some(manifest) = manifest {
            let in_use = referenced_blobs(&self.storage)?;
            for blob in manifest.blobs() {
                if !in_use.contains(&blob.digest) {
                    self.remove_blob(&blob)?;
                }
            }
        }
        Ok(())
    }

    async fn ingest_from(&self, source: &dyn Target, desc: &Descriptor) -> Result<()> {
        self.ingest_resumable(source, desc).await
    }
}

/// Every repository under `<storage>/refs` that has an index, sorted by
/// registry and repository.
pub fn list_all_repos(storage: &Path) -> Result<Vec<LocalRepository>> {
    let mut names = index_dirs(storage)?
        .into_iter()
        .filter_map(|(_, rel)| {
            let (registry, repository) = rel.split_once('/')?;
            Some((registry.to_string(), repository.to_string()))
        })
        .collect::<Vec<_>>();
    names.sort();
    names
        .iter()
        .map(|(registry, repository)| LocalRepository::open_repo(storage, registry, repository))
        .collect()
}

/// `(index.json path, slash-separated dir relative to refs/)` for every index.
fn index_dirs(storage: &Path) -> Result<Vec<(PathBuf, String)>> {
    let refs = refs_path(storage);
    if !refs.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(&refs).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            KitError::Other(format!("failed to read local storage: {}", e))
        })?;
        if !entry.file_type().is_file() || entry.file_name() != "index.json" {
            continue;
        }
        let Some(dir) = entry.path().parent() else {
            continue;
        };
        let Ok(rel) = dir.strip_prefix(&refs) else {
            continue;
        };
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if !rel.is_empty() {
            found.push((entry.path().to_path_buf(), rel));
        }
    }
    Ok(found)
}

/// Manifest descriptors of every index, paired with the index path.
fn indexed_manifests(storage: &Path) -> Result<Vec<(PathBuf, Descriptor)>> {
    let mut all = Vec::new();
    for (path, _) in index_dirs(storage)? {
        for desc in read_index(&path)?.manifests {
            all.push((path.clone(), desc));
        }
    }
    Ok(all)
}

/// Digests of config and layer blobs used by any indexed manifest.
fn referenced_blobs(storage: &Path) -> Result<HashSet<String>> {
    let mut in_use = HashSet::new();
    for (_, desc) in indexed_manifests(storage)? {
        in_use.insert(desc.digest.clone());
        let path = blobs_path(storage)
            .join(desc.algorithm()?)
            .join(desc.encoded()?);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(digest = %desc.digest, "Indexed manifest is missing from blob store");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let manifest = Manifest::from_slice(&data)?;
        in_use.extend(manifest.blobs().into_iter().map(|b| b.digest));
    }
    Ok(in_use)
}
