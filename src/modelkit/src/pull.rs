//! Pulling ModelKits from a registry into local storage.

use kitops_core::config::MAX_MODEL_REF_CHAIN;
use kitops_core::error::{KitError, Result};

use crate::context::KitContext;
use crate::copy::copy;
use crate::kitfile::format_chain;
use crate::oci::{get_manifest_and_config, Descriptor, Reference, Target, DEFAULT_REGISTRY};

/// Pull `reference` and, recursively, every ModelKit its `model.path`
/// refers to. Returns the descriptor of the requested manifest.
pub async fn pull(ctx: &KitContext, reference: &Reference) -> Result<Descriptor> {
    let desc = pull_one(ctx, reference).await?;
    pull_parents(ctx, reference, &desc).await?;
    Ok(desc)
}

/// Pull a single ModelKit without following parent references.
pub async fn pull_one(ctx: &KitContext, reference: &Reference) -> Result<Descriptor> {
    if reference.registry == DEFAULT_REGISTRY {
        return Err(KitError::InvalidRegistry(format!(
            "registry is required when pulling {}",
            reference.format_for_display()
        )));
    }
    if reference.reference.is_empty() {
        return Err(KitError::InvalidTag(format!(
            "reference {} has no tag or digest",
            reference
        )));
    }

    tracing::info!(reference = %reference, "Pulling ModelKit");
    let remote = ctx.remote_repository(reference)?;
    let local = ctx.local_repository(reference)?;
    let desc = copy(
        &remote,
        &reference.reference,
        &local,
        &reference.reference,
        &ctx.copy_options(),
    )
    .await?;

    // Partial downloads are kept on failure so a retry can resume them.
    if let Err(e) = local.clean_ingest() {
        tracing::warn!(error = %e, "Failed to clean up ingest directory");
    }
    tracing::info!(reference = %reference, digest = %desc.digest, "Pulled ModelKit");
    Ok(desc)
}

/// Follow the `model.path` chain of an already pulled ModelKit. Parents in
/// `localhost` must already be stored locally.
async fn pull_parents(ctx: &KitContext, root: &Reference, desc: &Descriptor) -> Result<()> {
    let local = ctx.local_repository(root)?;
    let (_, kitfile) = get_manifest_and_config(&local, desc).await?;
    let mut next = kitfile.parent_reference().map(str::to_string);
    let mut pulled = vec![root.to_string()];

    while let Some(raw) = next.take() {
        let parent = Reference::parse_single(&raw)?;
        let name = parent.to_string();
        if let Some(idx) = pulled.iter().position(|r| *r == name) {
            return Err(KitError::CycleInModelKitReferences {
                chain: format_chain(&pulled[idx..], &name),
            });
        }
        if pulled.len() > MAX_MODEL_REF_CHAIN {
            return Err(KitError::MaxRefChainExceeded {
                chain: format_chain(&pulled, &name),
            });
        }

        let repo = ctx.local_repository(&parent)?;
        let parent_desc = if parent.registry == DEFAULT_REGISTRY {
            repo.resolve(&parent.reference).await?
        } else {
            tracing::info!(parent = %raw, "Pulling referenced ModelKit");
            pull_one(ctx, &parent).await?
        };
        let (_, parent_kitfile) = get_manifest_and_config(&repo, &parent_desc).await?;
        next = parent_kitfile.parent_reference().map(str::to_string);
        pulled.push(name);
    }
    Ok(())
}
