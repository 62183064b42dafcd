//! Pushing ModelKits from local storage to a registry.

use kitops_core::error::{KitError, Result};

use crate::context::KitContext;
use crate::copy::copy;
use crate::oci::{Descriptor, Reference, DEFAULT_REGISTRY};

/// Push the local ModelKit `source` to `destination`. Blobs the registry
/// already has are skipped; the manifest is uploaded last and tagged with
/// the destination tag.
pub async fn push(ctx: &KitContext, source: &Reference, destination: &Reference) -> Result<Descriptor> {
    if destination.registry == DEFAULT_REGISTRY {
        return Err(KitError::InvalidRegistry(format!(
            "registry is required when pushing {}",
            destination.format_for_display()
        )));
    }
    if source.reference.is_empty() {
        return Err(KitError::InvalidTag(format!(
            "reference {} has no tag or digest",
            source
        )));
    }
    let dst_ref = if destination.reference.is_empty() {
        source.reference.as_str()
    } else {
        destination.reference.as_str()
    };

    tracing::info!(
        source = %source.format_for_display(),
        destination = %destination.repository_path(),
        "Pushing ModelKit"
    );
    let local = ctx.local_repository(source)?;
    let remote = ctx.remote_repository(destination)?;
    let desc = copy(&local, &source.reference, &remote, dst_ref, &ctx.copy_options()).await?;
    tracing::info!(
        destination = %destination.with_reference(dst_ref),
        digest = %desc.digest,
        "Pushed ModelKit"
    );
    Ok(desc)
}
