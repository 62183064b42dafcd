use serde::Serialize;

use kitops_core::error::Result;

use crate::context::KitContext;
use crate::kitfile::{resolve_kitfile, Kitfile};
use crate::oci::{Manifest, Reference, VERSION_ANNOTATION};

use super::{resolve_modelkit, Lookup};

const UNKNOWN_VERSION: &str = "unknown";

/// Manifest-level view of a ModelKit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectInfo {
    pub digest: String,
    /// Version of the tool that packed the ModelKit
    pub cli_version: String,
    pub kitfile: Kitfile,
    pub manifest: Manifest,
}

/// Digest, packing version, Kitfile and manifest of `reference`.
pub async fn inspect(ctx: &KitContext, reference: &Reference, lookup: Lookup) -> Result<InspectInfo> {
    let (desc, manifest, kitfile) = resolve_modelkit(ctx, reference, lookup).await?;
    let cli_version = manifest
        .annotations
        .as_ref()
        .and_then(|a| a.get(VERSION_ANNOTATION))
        .cloned()
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string());
    Ok(InspectInfo {
        digest: desc.digest,
        cli_version,
        kitfile,
        manifest,
    })
}

/// The Kitfile of `reference`. With `resolve_parents`, fields inherited
/// through `model.path` references are merged in.
pub async fn info(
    ctx: &KitContext,
    reference: &Reference,
    lookup: Lookup,
    resolve_parents: bool,
) -> Result<Kitfile> {
    let (_, _, kitfile) = resolve_modelkit(ctx, reference, lookup).await?;
    if !resolve_parents {
        return Ok(kitfile);
    }
    resolve_kitfile(ctx, kitfile, &reference.to_string()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{pack, PackOptions};
    use kitops_core::config::KitConfig;
    use kitops_core::VERSION;
    use tempfile::TempDir;

    fn write_kitfile(dir: &TempDir, body: &str) {
        std::fs::write(dir.path().join("Kitfile"), body).unwrap();
    }

    #[tokio::test]
    async fn test_inspect_local_modelkit() {
        let home = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        write_kitfile(&src, "manifestVersion: 1.0.0\npackage:\n  name: demo\nmodel:\n  path: m.bin\n");
        std::fs::write(src.path().join("m.bin"), b"weights").unwrap();
        let ctx = KitContext::new(&KitConfig::with_home(home.path()));
        let reference = Reference::parse_single("org/model:v1").unwrap();
        let desc = pack(&ctx, &PackOptions::new(src.path(), reference.clone()))
            .await
            .unwrap();

        let inspected = inspect(&ctx, &reference, Lookup::Local).await.unwrap();
        assert_eq!(inspected.digest, desc.digest);
        assert_eq!(inspected.cli_version, VERSION);
        assert_eq!(inspected.kitfile.package.name, "demo");
        assert_eq!(inspected.manifest.layers.len(), 1);

        let json = serde_json::to_value(&inspected).unwrap();
        assert_eq!(json["cliVersion"], VERSION);
        assert_eq!(json["manifest"]["schemaVersion"], 2);
    }

    #[tokio::test]
    async fn test_info_resolves_parents() {
        let home = TempDir::new().unwrap();
        let ctx = KitContext::new(&KitConfig::with_home(home.path()));

        let base_src = TempDir::new().unwrap();
        write_kitfile(
            &base_src,
            "manifestVersion: 1.0.0\npackage:\n  name: base\n  authors: [alice]\nmodel:\n  path: m.bin\n",
        );
        std::fs::write(base_src.path().join("m.bin"), b"weights").unwrap();
        let base = Reference::parse_single("org/base:v1").unwrap();
        pack(&ctx, &PackOptions::new(base_src.path(), base)).await.unwrap();

        let child_src = TempDir::new().unwrap();
        write_kitfile(
            &child_src,
            "manifestVersion: 1.0.0\npackage:\n  name: tuned\nmodel:\n  path: localhost/org/base:v1\ndocs:\n  - path: README.md\n",
        );
        std::fs::write(child_src.path().join("README.md"), b"# tuned").unwrap();
        let child = Reference::parse_single("org/tuned:v1").unwrap();
        pack(&ctx, &PackOptions::new(child_src.path(), child.clone()))
            .await
            .unwrap();

        let raw = info(&ctx, &child, Lookup::Auto, false).await.unwrap();
        assert_eq!(raw.parent_reference(), Some("localhost/org/base:v1"));

        let resolved = info(&ctx, &child, Lookup::Auto, true).await.unwrap();
        assert_eq!(resolved.package.name, "tuned");
        assert_eq!(resolved.package.authors, vec!["alice"]);
        assert_eq!(resolved.model.unwrap().path, "m.bin");
        assert_eq!(resolved.docs.len(), 1);
    }

    #[tokio::test]
    async fn test_info_missing_local_model() {
        let home = TempDir::new().unwrap();
        let ctx = KitContext::new(&KitConfig::with_home(home.path()));
        let reference = Reference::parse_single("org/none:v1").unwrap();
        let err = info(&ctx, &reference, Lookup::Local, false).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
