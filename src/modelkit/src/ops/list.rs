use serde::Serialize;

use kitops_core::error::Result;

use crate::context::KitContext;
use crate::local::list_all_repos;
use crate::oci::{format_for_display, get_config, get_manifest};

const NONE: &str = "<none>";
const SIZE_SUFFIXES: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

/// Summary of one locally stored ModelKit manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelKitInfo {
    pub repository: String,
    pub tags: Vec<String>,
    pub digest: String,
    /// Sum of layer sizes in bytes
    pub size: u64,
    pub name: String,
    pub author: String,
}

impl ModelKitInfo {
    /// Table rows (`REPOSITORY TAG MAINTAINER NAME SIZE DIGEST`), one per
    /// tag, or a single `<none>` row for an untagged manifest.
    pub fn rows(&self) -> Vec<[String; 6]> {
        let size = format_bytes(self.size);
        let row = |tag: &str| {
            [
                or_none(&self.repository),
                tag.to_string(),
                or_none(&self.author),
                or_none(&self.name),
                size.clone(),
                self.digest.clone(),
            ]
        };
        if self.tags.is_empty() {
            vec![row(NONE)]
        } else {
            self.tags.iter().map(|t| row(t)).collect()
        }
    }
}

fn or_none(s: &str) -> String {
    if s.is_empty() {
        NONE.to_string()
    } else {
        s.to_string()
    }
}

/// Every ModelKit in local storage, sorted by repository. Manifests whose
/// config is not a Kitfile are skipped.
pub async fn list(ctx: &KitContext) -> Result<Vec<ModelKitInfo>> {
    let mut infos = Vec::new();
    for repo in list_all_repos(&ctx.storage)? {
        let repository = format_for_display(&repo.repo_name());
        for desc in repo.get_all_models() {
            let manifest = get_manifest(&repo, &desc).await?;
            if !manifest.is_modelkit() {
                tracing::debug!(digest = %desc.digest, "Skipping manifest that is not a ModelKit");
                continue;
            }
            let kitfile = get_config(&repo, &manifest).await?;
            infos.push(ModelKitInfo {
                repository: repository.clone(),
                tags: repo.get_tags(&desc),
                digest: desc.digest.clone(),
                size: manifest.layers.iter().map(|l| l.size).sum(),
                name: kitfile.package.name.clone(),
                author: kitfile.package.authors.first().cloned().unwrap_or_default(),
            });
        }
    }
    Ok(infos)
}

/// Human-readable binary size, floored to one decimal place.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    for suffix in SIZE_SUFFIXES {
        if size < 1024.0 {
            return format!("{:.1} {}", (size * 10.0).floor() / 10.0, suffix);
        }
        size /= 1024.0;
    }
    format!("{:.1} PiB", size)
}
