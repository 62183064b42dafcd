//! Concurrent ModelKit copy between two targets.

use std::io::Cursor;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use kitops_core::error::{KitError, Result};

use crate::oci::{fetch_all, is_digest, Descriptor, Manifest, MediaType, Target};

/// Default number of parallel blob transfers.
pub const DEFAULT_CONCURRENCY: usize = 5;

#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Maximum number of blobs in flight
    pub concurrency: usize,
    pub cancel: CancellationToken,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }
}

impl CopyOptions {
    pub fn new(concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cancel,
        }
    }
}

/// Copy the ModelKit `src_ref` from `src` to `dst`, tagging it as `dst_ref`.
///
/// Config and layer blobs transfer in parallel; the first failure stops the
/// rest. The manifest is pushed only after every blob is present, and the
/// tag is applied last. Returns the manifest descriptor.
pub async fn copy(
    src: &dyn Target,
    src_ref: &str,
    dst: &dyn Target,
    dst_ref: &str,
    opts: &CopyOptions,
) -> Result<Descriptor> {
    let desc = src.resolve(src_ref).await?;
    if !desc.is_manifest() {
        return Err(KitError::Other(format!(
            "expected manifest for {} but got {}",
            src_ref, desc.media_type
        )));
    }
    let manifest_bytes = fetch_all(src, &desc).await?;
    let manifest = Manifest::from_slice(&manifest_bytes)?;
    if !manifest.is_modelkit() {
        return Err(KitError::NotAModelKit(src_ref.to_string()));
    }

    tracing::debug!(
        source = %src.name(),
        destination = %dst.name(),
        digest = %desc.digest,
        blobs = manifest.blobs().len(),
        "Copying ModelKit"
    );

    let transfers = stream::iter(manifest.blobs())
        .map(|blob| copy_blob(src, dst, blob))
        .buffer_unordered(opts.concurrency.max(1))
        .try_collect::<Vec<()>>();
    tokio::select! {
        biased;
        _ = opts.cancel.cancelled() => return Err(KitError::Canceled),
        result = transfers => { result?; }
    }

    if !dst.exists(&desc).await? {
        dst.push(&desc, Box::new(Cursor::new(manifest_bytes))).await?;
    }
    if !dst_ref.is_empty() && !is_digest(dst_ref) {
        dst.tag(&desc, dst_ref).await?;
    }
    Ok(desc)
}

async fn copy_blob(src: &dyn Target, dst: &dyn Target, blob: Descriptor) -> Result<()> {
    if dst.exists(&blob).await? {
        tracing::debug!(digest = %blob.digest, "Blob already exists, skipping");
        return Ok(());
    }
    let kind = MediaType::parse(&blob.media_type)
        .map(|mt| mt.base.user_name())
        .unwrap_or("unknown");
    dst.ingest_from(src, &blob).await.inspect_err(|e| {
        tracing::debug!(digest = %blob.digest, layer = kind, error = %e, "Blob transfer failed");
    })?;
    tracing::debug!(digest = %blob.digest, layer = kind, size = blob.size, "Copied blob");
    Ok(())
}
