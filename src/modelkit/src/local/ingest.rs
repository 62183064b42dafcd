//! Writing blobs into the shared store through `<storage>/ingest`.
//!
//! Downloads from a source that honours range requests go to
//! `ingest/<hex>` and survive failures so a later attempt can resume.
//! Everything else uses a one-shot `ingest/<hex>_<random>` file that is
//! removed on failure.

use std::path::Path;

use tempfile::NamedTempFile;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use kitops_core::error::{KitError, Result};
use kitops_core::progress::ProgressTracker;

use super::LocalRepository;
use crate::oci::{BlobReader, Descriptor, DigestVerifier, FetchedBlob, Target};

const COPY_BUFFER_SIZE: usize = 256 * 1024;

impl LocalRepository {
    /// Stream `content` into the blob store, verifying digest and size.
    pub(super) async fn write_blob(&self, desc: &Descriptor, mut content: BlobReader) -> Result<()> {
        let tmp_path = self
            .ingest_dir()
            .join(format!("{}_{}", desc.encoded()?, uuid::Uuid::new_v4().simple()));
        let result: Result<()> = async {
            let mut file = File::create(&tmp_path).await?;
            let mut verifier = DigestVerifier::new(&desc.digest, desc.size)?;
            let mut tracker = self.tracker(desc, 0);
            stream_into(&mut content, &mut file, &mut verifier, &mut tracker).await?;
            file.sync_all().await?;
            drop(file);
            verifier.verify()?;
            tracker.finish();
            self.commit_blob(&tmp_path, desc).await
        }
        .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result
    }

    /// Copy `desc` from `source`, resuming a partial download when the
    /// source supports ranged reads.
    pub(super) async fn ingest_resumable(&self, source: &dyn Target, desc: &Descriptor) -> Result<()> {
        if tokio::fs::try_exists(self.blob_path(desc)?).await? {
            if desc.is_manifest() {
                self.add_to_index(desc)?;
            }
            return Ok(());
        }

        let resume_path = self.ingest_dir().join(desc.encoded()?);
        let existing = match tokio::fs::metadata(&resume_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let fetched = source.fetch_from(desc, existing).await?;
        if fetched.resumable {
            tracing::trace!(digest = %desc.digest, "Source supports range requests, using resumable download");
            self.resume_download(desc, &resume_path, existing, fetched).await?;
        } else {
            self.write_blob(desc, fetched.reader).await?;
        }
        if desc.is_manifest() {
            self.add_to_index(desc)?;
        }
        Ok(())
    }

    async fn resume_download(
        &self,
        desc: &Descriptor,
        path: &Path,
        existing: u64,
        mut fetched: FetchedBlob,
    ) -> Result<()> {
        if fetched.offset > existing {
            return Err(KitError::Other(format!(
                "source returned offset {} beyond the {} bytes already downloaded",
                fetched.offset, existing
            )));
        }
        let offset = fetched.offset;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .await?;
        file.set_len(offset).await?;

        let mut verifier = DigestVerifier::new(&desc.digest, desc.size)?;
        if offset > 0 {
            tracing::debug!(digest = %desc.digest, offset, "Resuming download");
            hash_prefix(&mut file, offset, &mut verifier).await?;
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut tracker = self.tracker(desc, offset);
        stream_into(&mut fetched.reader, &mut file, &mut verifier, &mut tracker).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = verifier.verify() {
            let _ = tokio::fs::remove_file(path).await;
            return Err(e);
        }
        tracker.finish();
        self.commit_blob(path, desc).await
    }

    /// Move a built layer into the blob store, falling back to a streaming
    /// copy when a rename is not possible (e.g. across filesystems).
    pub async fn ingest_file(&self, desc: &Descriptor, temp: NamedTempFile) -> Result<()> {
        let blob_path = self.blob_path(desc)?;
        if !tokio::fs::try_exists(&blob_path).await? {
            match temp.persist(&blob_path) {
                Ok(_) => set_blob_permissions(&blob_path).await?,
                Err(e) => {
                    tracing::debug!(
                        digest = %desc.digest,
                        error = %e.error,
                        "Rename into storage failed, copying instead"
                    );
                    let file = File::open(e.file.path()).await?;
                    self.push(desc, Box::new(file)).await?;
                }
            }
        }
        if !self.exists(desc).await? {
            return Err(KitError::Other(format!(
                "failed to add {} to local storage",
                desc.digest
            )));
        }
        Ok(())
    }

    async fn commit_blob(&self, from: &Path, desc: &Descriptor) -> Result<()> {
        let blob_path = self.blob_path(desc)?;
        if let Some(parent) = blob_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from, &blob_path).await.map_err(|e| {
            KitError::Other(format!("failed to move downloaded file into storage: {}", e))
        })?;
        set_blob_permissions(&blob_path).await
    }

    fn tracker(&self, desc: &Descriptor, offset: u64) -> ProgressTracker {
        ProgressTracker::new(
            self.progress.clone(),
            self.clock.clone(),
            desc.short_digest().to_string(),
            desc.size,
        )
        .with_offset(offset)
    }
}

async fn stream_into(
    reader: &mut BlobReader,
    file: &mut File,
    verifier: &mut DigestVerifier,
    tracker: &mut ProgressTracker,
) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        verifier.update(&buf[..n]);
        tracker.advance(n as u64);
    }
    file.flush().await?;
    Ok(())
}

async fn hash_prefix(file: &mut File, len: u64, verifier: &mut DigestVerifier) -> Result<()> {
    file.seek(std::io::SeekFrom::Start(0)).await?;
    let mut prefix = (&mut *file).take(len);
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = prefix.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        verifier.update(&buf[..n]);
    }
    Ok(())
}

#[cfg(unix)]
async fn set_blob_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_blob_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
