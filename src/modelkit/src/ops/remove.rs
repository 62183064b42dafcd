use std::collections::HashSet;

use kitops_core::error::{KitError, Result};

use crate::context::KitContext;
use crate::local::{list_all_repos, LocalRepository};
use crate::oci::{format_for_display, Descriptor, Reference, Target};

/// Remove `reference` and each of `extra_tags` (in the same repository)
/// from local storage. Returns the descriptor the primary reference
/// pointed at.
pub async fn remove(
    ctx: &KitContext,
    reference: &Reference,
    extra_tags: &[String],
    force: bool,
) -> Result<Descriptor> {
    let repo = ctx.local_repository(reference)?;
    let desc = remove_ref(&repo, reference, force).await?;
    tracing::info!(
        reference = %reference.format_for_display(),
        digest = %desc.digest,
        "Removed ModelKit"
    );

    for tag in extra_tags {
        let extra = reference.with_reference(tag.as_str());
        match remove_ref(&repo, &extra, force).await {
            Ok(desc) => tracing::info!(
                reference = %extra.format_for_display(),
                digest = %desc.digest,
                "Removed ModelKit"
            ),
            Err(e) => tracing::error!(tag = %tag, error = %e, "Failed to remove tag"),
        }
    }
    Ok(desc)
}

async fn remove_ref(repo: &LocalRepository, reference: &Reference, force: bool) -> Result<Descriptor> {
    if reference.reference.is_empty() {
        return Err(KitError::InvalidTag(format!(
            "reference {} has no tag or digest",
            reference.format_for_display()
        )));
    }
    let desc = repo.resolve(&reference.reference).await?;

    if reference.is_digest() || force {
        tracing::debug!(digest = %desc.digest, "Deleting manifest");
        repo.delete(&desc).await?;
        return Ok(desc);
    }

    let tags = repo.get_tags(&desc);
    if tags.len() <= 1 {
        tracing::debug!(tag = %reference.reference, "Deleting manifest with its last tag");
        repo.delete(&desc).await?;
    } else {
        tracing::debug!(tags = ?tags, tag = %reference.reference, "Manifest has other tags; untagging");
        repo.untag(&reference.reference).await?;
    }
    Ok(desc)
}

/// Delete `reference` from its registry.
pub async fn remove_remote(ctx: &KitContext, reference: &Reference) -> Result<Descriptor> {
    let repo = ctx.remote_repository(reference)?;
    let desc = repo.resolve(&reference.reference).await?;
    match repo.delete(&desc).await {
        Ok(()) => {}
        Err(KitError::RemoteHttp(e)) if e.status == 405 => {
            return Err(KitError::Unsupported(format!(
                "removing models is unsupported by registry {}",
                reference.registry
            )));
        }
        Err(e) => return Err(e),
    }
    tracing::info!(reference = %reference, digest = %desc.digest, "Removed remote ModelKit");
    Ok(desc)
}

/// Delete every manifest in local storage, or only those without tags when
/// `untagged_only` is set. Failures are logged and skipped. Returns the
/// number of manifests removed.
pub async fn remove_all(ctx: &KitContext, untagged_only: bool) -> Result<usize> {
    let mut removed = 0;
    for repo in list_all_repos(&ctx.storage)? {
        ctx.check_canceled()?;
        let name = format_for_display(&repo.repo_name());
        let mut deleted = HashSet::new();
        for desc in repo.get_all_models() {
            if deleted.contains(&desc.digest) {
                continue;
            }
            let tags = repo.get_tags(&desc);
            if untagged_only && !tags.is_empty() {
                tracing::debug!(digest = %desc.digest, tags = ?tags, "Skipping tagged manifest");
                continue;
            }
            for tag in &tags {
                match repo.untag(tag).await {
                    Ok(()) => tracing::info!(repository = %name, tag = %tag, "Untagged"),
                    Err(e) => tracing::error!(repository = %name, tag = %tag, error = %e, "Failed to untag"),
                }
            }
            if let Err(e) = repo.delete(&desc).await {
                tracing::error!(repository = %name, digest = %desc.digest, error = %e, "Failed to remove manifest");
                continue;
            }
            tracing::info!(repository = %name, digest = %desc.digest, "Removed manifest");
            deleted.insert(desc.digest);
            removed += 1;
        }
    }
    Ok(removed)
}
