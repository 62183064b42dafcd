use kitops_core::error::{KitError, Result};

use crate::context::KitContext;
use crate::copy::copy;
use crate::oci::{is_digest, validate_tag, Descriptor, Reference, Target};

/// Tag the local ModelKit `source` as `target`. A target in another
/// repository receives a copy of the manifest; blobs are shared.
pub async fn tag(ctx: &KitContext, source: &Reference, target: &Reference) -> Result<Descriptor> {
    if target.reference.is_empty() || is_digest(&target.reference) {
        return Err(KitError::InvalidTag(format!(
            "target {} must include a tag",
            target
        )));
    }
    validate_tag(&target.reference)?;

    let source_repo = ctx.local_repository(source)?;
    let desc = source_repo.resolve(&source.reference).await?;
    if source.registry == target.registry && source.repository == target.repository {
        source_repo.tag(&desc, &target.reference).await?;
    } else {
        let target_repo = ctx.local_repository(target)?;
        copy(
            &source_repo,
            &source.reference,
            &target_repo,
            &target.reference,
            &ctx.copy_options(),
        )
        .await?;
    }
    tracing::info!(
        source = %source.format_for_display(),
        target = %target.format_for_display(),
        "Tagged ModelKit"
    );
    Ok(desc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{pack, PackOptions};
    use kitops_core::config::KitConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_tag_within_and_across_repositories() {
        let home = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("Kitfile"), "manifestVersion: 1.0.0\nmodel:\n  path: m.bin\n").unwrap();
        std::fs::write(src.path().join("m.bin"), b"weights").unwrap();
        let ctx = KitContext::new(&KitConfig::with_home(home.path()));
        let source = Reference::parse_single("org/model:v1").unwrap();
        let packed = pack(&ctx, &PackOptions::new(src.path(), source.clone()))
            .await
            .unwrap();

        let same_repo = Reference::parse_single("org/model:latest").unwrap();
        tag(&ctx, &source, &same_repo).await.unwrap();
        let repo = ctx.local_repository(&source).unwrap();
        assert_eq!(repo.get_tags(&packed), vec!["latest", "v1"]);

        let other_repo = Reference::parse_single("other/model:prod").unwrap();
        tag(&ctx, &source, &other_repo).await.unwrap();
        let other = ctx.local_repository(&other_repo).unwrap();
        assert_eq!(other.resolve("prod").await.unwrap().digest, packed.digest);

        let by_digest = source.with_reference(packed.digest.clone());
        assert!(matches!(
            tag(&ctx, &source, &by_digest).await,
            Err(KitError::InvalidTag(_))
        ));
    }
}
