//! The storage abstraction shared by local and remote repositories.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use kitops_core::error::{KitError, Result};

use super::descriptor::{Descriptor, Manifest};
use super::digest::{DigestVerifier, VerifyingReader};
use super::media_type::MANIFEST_MEDIA_TYPE;
use crate::kitfile::Kitfile;

/// Boxed blob stream.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// A blob stream that may start part-way into the blob.
pub struct FetchedBlob {
    pub reader: BlobReader,
    /// Offset of the first byte the reader yields
    pub offset: u64,
    /// Whether the source honoured a range request
    pub resumable: bool,
}

/// Content-addressed store of manifests and blobs for one repository.
#[async_trait]
pub trait Target: Send + Sync {
    /// Human-readable name for log lines (`registry/repository`).
    fn name(&self) -> String;

    /// Resolve a tag or digest to a manifest descriptor.
    async fn resolve(&self, reference: &str) -> Result<Descriptor>;

    async fn exists(&self, desc: &Descriptor) -> Result<bool>;

    async fn fetch(&self, desc: &Descriptor) -> Result<BlobReader>;

    /// Fetch starting at `offset`. Targets that cannot seek return the
    /// whole blob with `offset == 0`.
    async fn fetch_from(&self, desc: &Descriptor, _offset: u64) -> Result<FetchedBlob> {
        Ok(FetchedBlob {
            reader: self.fetch(desc).await?,
            offset: 0,
            resumable: false,
        })
    }

    async fn push(&self, desc: &Descriptor, content: BlobReader) -> Result<()>;

    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()>;

    async fn untag(&self, reference: &str) -> Result<()>;

    async fn delete(&self, desc: &Descriptor) -> Result<()>;

    /// Copy one blob from `source` into this target. The default streams it
    /// through a verifying reader; local storage overrides this with a
    /// resumable path.
    async fn ingest_from(&self, source: &dyn Target, desc: &Descriptor) -> Result<()> {
        let reader = source.fetch(desc).await?;
        let verified = VerifyingReader::new(reader, &desc.digest, desc.size)?;
        self.push(desc, Box::new(verified)).await
    }
}

/// Read a whole blob into memory, verifying size and digest.
pub async fn fetch_all(target: &dyn Target, desc: &Descriptor) -> Result<Vec<u8>> {
    let mut reader = target.fetch(desc).await?;
    let mut data = Vec::with_capacity(desc.size.min(16 << 20) as usize);
    reader.read_to_end(&mut data).await?;
    let mut verifier = DigestVerifier::new(&desc.digest, desc.size)?;
    verifier.update(&data);
    verifier.verify()?;
    Ok(data)
}

/// Fetch and parse the manifest behind `desc`.
pub async fn get_manifest(target: &dyn Target, desc: &Descriptor) -> Result<Manifest> {
    if desc.media_type != MANIFEST_MEDIA_TYPE {
        return Err(KitError::Other(format!(
            "expected manifest but got {}",
            desc.media_type
        )));
    }
    let data = fetch_all(target, desc).await?;
    Manifest::from_slice(&data)
}

/// Fetch and parse the Kitfile config of a manifest.
pub async fn get_config(target: &dyn Target, manifest: &Manifest) -> Result<Kitfile> {
    if !manifest.is_modelkit() {
        return Err(KitError::NotAModelKit(format!(
            "config media type is {}",
            manifest.config.media_type
        )));
    }
    let data = fetch_all(target, &manifest.config).await?;
    Kitfile::from_json(&data)
}

/// Manifest and Kitfile for an already-resolved descriptor.
pub async fn get_manifest_and_config(
    target: &dyn Target,
    desc: &Descriptor,
) -> Result<(Manifest, Kitfile)> {
    let manifest = get_manifest(target, desc).await?;
    let config = get_config(target, &manifest).await?;
    Ok((manifest, config))
}

/// Stream `reader` into memory, for manifests that are pushed as bytes.
pub async fn read_to_vec(mut reader: BlobReader, size_hint: u64) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(size_hint.min(16 << 20) as usize);
    reader.read_to_end(&mut data).await?;
    Ok(data)
}
