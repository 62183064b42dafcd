//! Packing a context directory into a ModelKit in local storage.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use kitops_core::error::{KitError, Result};
use kitops_core::VERSION;

use crate::cache::PACK_SUBDIR;
use crate::context::KitContext;
use crate::ignore::IgnoreMatcher;
use crate::kitfile::{validate_kitfile, Kitfile};
use crate::local::LocalRepository;
use crate::oci::{
    BaseType, Compression, Descriptor, Manifest, MediaType, Reference, Target, CONFIG_MEDIA_TYPE,
};

/// Inputs to [`pack`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Directory every Kitfile path is relative to
    pub context_dir: PathBuf,
    /// Kitfile to pack; read from `context_dir` when unset
    pub kitfile: Option<Kitfile>,
    pub reference: Reference,
    /// Tags applied in addition to the reference's own tag
    pub extra_tags: Vec<String>,
    pub compression: Compression,
}

impl PackOptions {
    pub fn new(context_dir: impl Into<PathBuf>, reference: Reference) -> Self {
        Self {
            context_dir: context_dir.into(),
            kitfile: None,
            reference,
            extra_tags: Vec::new(),
            compression: Compression::None,
        }
    }

    pub fn with_kitfile(mut self, kitfile: Kitfile) -> Self {
        self.kitfile = Some(kitfile);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_extra_tags(mut self, tags: Vec<String>) -> Self {
        self.extra_tags = tags;
        self
    }
}

/// Layer paths in manifest order with their base types. An empty model path
/// packs the whole context directory; a model that references another
/// ModelKit contributes no layer of its own.
pub(crate) fn layer_plan(kitfile: &Kitfile) -> Vec<(String, BaseType)> {
    let mut plan = Vec::new();
    if let Some(model) = &kitfile.model {
        if model.path.is_empty() {
            plan.push((".".to_string(), BaseType::Model));
        } else if !model.is_reference() {
            plan.push((model.path.clone(), BaseType::Model));
        }
        plan.extend(
            model
                .parts
                .iter()
                .map(|p| (p.path.clone(), BaseType::ModelPart)),
        );
    }
    plan.extend(kitfile.code.iter().map(|c| (c.path.clone(), BaseType::Code)));
    plan.extend(
        kitfile
            .datasets
            .iter()
            .map(|d| (d.path.clone(), BaseType::Dataset)),
    );
    plan.extend(kitfile.docs.iter().map(|d| (d.path.clone(), BaseType::Docs)));
    plan
}

/// Build every layer of the Kitfile, store config and manifest in the local
/// repository of `opts.reference` and tag it. Returns the manifest
/// descriptor.
///
/// A failure before the manifest is written leaves at most orphan blobs in
/// the shared store; the repository index is untouched.
pub async fn pack(ctx: &KitContext, opts: &PackOptions) -> Result<Descriptor> {
    let context_dir = opts.context_dir.canonicalize().map_err(|e| {
        KitError::Other(format!(
            "invalid context directory {}: {}",
            opts.context_dir.display(),
            e
        ))
    })?;
    let kitfile = match &opts.kitfile {
        Some(kitfile) => kitfile.clone(),
        None => Kitfile::load_from_dir(&context_dir)?.1,
    };
    validate_kitfile(&kitfile)?;

    let repo = ctx.local_repository(&opts.reference)?;
    let result = pack_into(ctx, &repo, &context_dir, &kitfile, opts).await;
    if let Err(e) = ctx.cache.clean(PACK_SUBDIR) {
        tracing::warn!(error = %e, "Failed to clean pack cache");
    }
    result
}

async fn pack_into(
    ctx: &KitContext,
    repo: &LocalRepository,
    context_dir: &std::path::Path,
    kitfile: &Kitfile,
    opts: &PackOptions,
) -> Result<Descriptor> {
    let ignore = Arc::new(IgnoreMatcher::from_context(context_dir, kitfile)?);
    let builder = ctx.layer_builder();

    let mut layers = Vec::new();
    for (path, base) in layer_plan(kitfile) {
        ctx.check_canceled()?;
        let media_type = MediaType::layer(base, opts.compression);
        let built = {
            let builder = builder.clone();
            let ignore = ignore.clone();
            let dir = context_dir.to_path_buf();
            let path = path.clone();
            tokio::task::spawn_blocking(move || builder.build(&dir, &path, media_type, &ignore))
                .await
                .map_err(|e| KitError::Other(format!("layer build task failed: {}", e)))??
        };

        if repo.exists(&built.descriptor).await? {
            tracing::debug!(
                path = %path,
                digest = %built.descriptor.digest,
                "Layer already in storage"
            );
        } else {
            repo.ingest_file(&built.descriptor, built.temp).await?;
        }
        tracing::info!(
            layer = base.user_name(),
            path = %path,
            digest = %built.descriptor.short_digest(),
            files = built.stats.files,
            "Saved layer"
        );
        layers.push(built.descriptor);
    }

    let config_bytes = kitfile.to_json()?;
    let config = Descriptor::from_bytes(CONFIG_MEDIA_TYPE, &config_bytes);
    repo.push(&config, Box::new(Cursor::new(config_bytes))).await?;

    let (manifest_bytes, manifest_desc) = Manifest::new(config, layers, VERSION).to_bytes()?;
    repo.push(&manifest_desc, Box::new(Cursor::new(manifest_bytes)))
        .await?;

    let tags = opts
        .reference
        .tag()
        .into_iter()
        .chain(opts.extra_tags.iter().map(String::as_str));
    for tag in tags {
        repo.tag(&manifest_desc, tag).await?;
    }

    tracing::info!(
        reference = %opts.reference.format_for_display(),
        digest = %manifest_desc.digest,
        "Packed ModelKit"
    );
    Ok(manifest_desc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{fetch_all, get_manifest_and_config, VERSION_ANNOTATION};
    use kitops_core::config::{blobs_path, KitConfig};
    use std::io::Read;
    use tempfile::TempDir;

    fn setup(kitfile: &str) -> (TempDir, TempDir, KitContext) {
        let home = TempDir::new().unwrap();
        let context = TempDir::new().unwrap();
        std::fs::write(context.path().join("Kitfile"), kitfile).unwrap();
        std::fs::write(context.path().join("model.bin"), b"0123456789").unwrap();
        let ctx = KitContext::new(&KitConfig::with_home(home.path()));
        (home, context, ctx)
    }

    fn blob_count(ctx: &KitContext) -> usize {
        std::fs::read_dir(blobs_path(&ctx.storage).join("sha256"))
            .unwrap()
            .count()
    }

    #[tokio::test]
    async fn test_minimal_pack() {
        let (_home, context, ctx) = setup("manifestVersion: 1.0.0\nmodel:\n  path: model.bin\n");
        let reference = Reference::parse_single("org/minimal:v1").unwrap();
        let desc = pack(&ctx, &PackOptions::new(context.path(), reference.clone()))
            .await
            .unwrap();

        let repo = ctx.local_repository(&reference).unwrap();
        assert_eq!(repo.resolve("v1").await.unwrap().digest, desc.digest);
        let (manifest, kitfile) = get_manifest_and_config(&repo, &desc).await.unwrap();
        assert_eq!(kitfile.model.unwrap().path, "model.bin");
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(
            manifest.layers[0].media_type,
            "application/vnd.kitops.modelkit.model.v1.tar"
        );
        assert_eq!(
            manifest
                .annotations
                .as_ref()
                .and_then(|a| a.get(VERSION_ANNOTATION))
                .map(String::as_str),
            Some(VERSION)
        );
        // config, layer and manifest
        assert_eq!(blob_count(&ctx), 3);

        let data = fetch_all(&repo, &manifest.layers[0]).await.unwrap();
        let mut archive = tar::Archive::new(Cursor::new(data));
        let entries: Vec<_> = archive.entries().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        let header = entries[0].header();
        assert_eq!(header.path().unwrap().to_str(), Some("model.bin"));
        assert_eq!(header.size().unwrap(), 10);
        assert_eq!(header.mtime().unwrap(), 0);
        assert!(!ctx.cache.stat().unwrap().contains_key(PACK_SUBDIR));
    }

    #[tokio::test]
    async fn test_layer_order_and_extra_tags() {
        let (_home, context, ctx) = setup(
            "manifestVersion: 1.0.0\nmodel:\n  path: model.bin\n  parts:\n    - path: tok.json\ncode:\n  - path: src\ndatasets:\n  - name: train\n    path: data\ndocs:\n  - path: README.md\n",
        );
        let dir = context.path();
        std::fs::write(dir.join("tok.json"), b"{}").unwrap();
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("src/train.py"), b"print(1)").unwrap();
        std::fs::create_dir_all(dir.join("data")).unwrap();
        std::fs::write(dir.join("data/train.csv"), b"a,b").unwrap();
        std::fs::write(dir.join("README.md"), b"# readme").unwrap();

        let reference = Reference::parse_single("org/full:v1").unwrap();
        let opts = PackOptions::new(dir, reference.clone())
            .with_compression(Compression::Gzip)
            .with_extra_tags(vec!["latest".to_string()]);
        let desc = pack(&ctx, &opts).await.unwrap();

        let repo = ctx.local_repository(&reference).unwrap();
        assert_eq!(repo.resolve("latest").await.unwrap().digest, desc.digest);
        let (manifest, _) = get_manifest_and_config(&repo, &desc).await.unwrap();
        let types: Vec<_> = manifest
            .layers
            .iter()
            .map(|l| MediaType::parse(&l.media_type).unwrap().base)
            .collect();
        assert_eq!(
            types,
            vec![
                BaseType::Model,
                BaseType::ModelPart,
                BaseType::Code,
                BaseType::Dataset,
                BaseType::Docs
            ]
        );
        assert!(manifest
            .layers
            .iter()
            .all(|l| l.media_type.ends_with("+gzip")));
    }

    #[tokio::test]
    async fn test_pack_is_deterministic() {
        let (_home, context, ctx) = setup("manifestVersion: 1.0.0\nmodel:\n  path: model.bin\n");
        let opts = PackOptions::new(
            context.path(),
            Reference::parse_single("org/det:v1").unwrap(),
        );
        let first = pack(&ctx, &opts).await.unwrap();
        let second = pack(&ctx, &opts).await.unwrap();
        assert_eq!(first.digest, second.digest);
    }

    #[tokio::test]
    async fn test_blobs_are_shared_across_repositories() {
        let (_home, context, ctx) = setup("manifestVersion: 1.0.0\nmodel:\n  path: model.bin\n");
        let a = Reference::parse_single("repo/a:v1").unwrap();
        let b = Reference::parse_single("repo/b:v1").unwrap();
        let desc_a = pack(&ctx, &PackOptions::new(context.path(), a.clone()))
            .await
            .unwrap();
        let desc_b = pack(&ctx, &PackOptions::new(context.path(), b.clone()))
            .await
            .unwrap();
        assert_eq!(desc_a.digest, desc_b.digest);

        let repo_a = ctx.local_repository(&a).unwrap();
        let (manifest, _) = get_manifest_and_config(&repo_a, &desc_a).await.unwrap();
        let layer_path = repo_a.blob_path(&manifest.layers[0]).unwrap();
        assert_eq!(blob_count(&ctx), 3);

        repo_a.delete(&desc_a).await.unwrap();
        assert!(layer_path.exists());

        let repo_b = ctx.local_repository(&b).unwrap();
        repo_b.delete(&desc_b).await.unwrap();
        assert!(!layer_path.exists());
    }

    #[tokio::test]
    async fn test_empty_model_path_packs_context() {
        let (_home, context, ctx) = setup("manifestVersion: 1.0.0\nmodel:\n  name: all\n");
        std::fs::write(context.path().join(".kitignore"), "*.log\n").unwrap();
        std::fs::write(context.path().join("debug.log"), b"noise").unwrap();
        let reference = Reference::parse_single("org/ctx:v1").unwrap();
        let desc = pack(&ctx, &PackOptions::new(context.path(), reference.clone()))
            .await
            .unwrap();

        let repo = ctx.local_repository(&reference).unwrap();
        let (manifest, _) = get_manifest_and_config(&repo, &desc).await.unwrap();
        assert_eq!(manifest.layers.len(), 1);
        let data = fetch_all(&repo, &manifest.layers[0]).await.unwrap();
        let mut archive = tar::Archive::new(Cursor::new(data));
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).unwrap();
            names.push(name);
        }
        assert!(names.iter().any(|n| n.ends_with("model.bin")));
        assert!(!names.iter().any(|n| n.ends_with("debug.log")));
        assert!(!names.iter().any(|n| n.ends_with("Kitfile")));
    }

    #[tokio::test]
    async fn test_reference_model_is_not_packed() {
        let (_home, context, ctx) = setup(
            "manifestVersion: 1.0.0\nmodel:\n  path: ghcr.io/org/base:v1\ndocs:\n  - path: model.bin\n",
        );
        let reference = Reference::parse_single("org/child:v1").unwrap();
        let desc = pack(&ctx, &PackOptions::new(context.path(), reference.clone()))
            .await
            .unwrap();
        let repo = ctx.local_repository(&reference).unwrap();
        let (manifest, kitfile) = get_manifest_and_config(&repo, &desc).await.unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert!(manifest.layers[0].media_type.contains(".docs."));
        assert_eq!(kitfile.parent_reference(), Some("ghcr.io/org/base:v1"));
    }

    #[tokio::test]
    async fn test_invalid_kitfile_writes_nothing() {
        let (_home, context, ctx) = setup("model:\n  path: model.bin\n");
        let reference = Reference::parse_single("org/bad:v1").unwrap();
        let err = pack(&ctx, &PackOptions::new(context.path(), reference.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, KitError::InvalidKitfile(_)));
        let repo = ctx.local_repository(&reference).unwrap();
        assert!(repo.get_all_models().is_empty());
    }

    #[tokio::test]
    async fn test_canceled_pack() {
        let (_home, context, ctx) = setup("manifestVersion: 1.0.0\nmodel:\n  path: model.bin\n");
        ctx.cancel.cancel();
        let err = pack(
            &ctx,
            &PackOptions::new(context.path(), Reference::parse_single("org/c:v1").unwrap()),
        )
        .await
        .unwrap_err();
        assert!(err.is_canceled());
    }
}
