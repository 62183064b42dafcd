use std::collections::HashMap;

use serde::Serialize;

use kitops_core::error::Result;

use crate::context::KitContext;
use crate::oci::{Descriptor, Manifest, Reference};

use super::{resolve_modelkit, Lookup};

/// Layer-level comparison of two ModelKit manifests. Layer lists are sorted
/// by media type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    pub same_config: bool,
    pub annotations_match: bool,
    pub shared_layers: Vec<Descriptor>,
    pub unique_layers_a: Vec<Descriptor>,
    pub unique_layers_b: Vec<Descriptor>,
}

/// Compare two manifests by config digest, annotations and layer digests.
pub fn compare_manifests(a: &Manifest, b: &Manifest) -> DiffResult {
    let empty = Default::default();
    let annotations_a = a.annotations.as_ref().unwrap_or(&empty);
    let annotations_b = b.annotations.as_ref().unwrap_or(&empty);

    let mut only_a: HashMap<&str, &Descriptor> =
        a.layers.iter().map(|l| (l.digest.as_str(), l)).collect();
    let mut shared_layers = Vec::new();
    let mut unique_layers_b = Vec::new();
    for layer in &b.layers {
        if only_a.remove(layer.digest.as_str()).is_some() {
            shared_layers.push(layer.clone());
        } else {
            unique_layers_b.push(layer.clone());
        }
    }
    let mut unique_layers_a: Vec<Descriptor> = only_a.into_values().cloned().collect();

    for layers in [&mut shared_layers, &mut unique_layers_a, &mut unique_layers_b] {
        layers.sort_by(|x, y| x.media_type.cmp(&y.media_type).then_with(|| x.digest.cmp(&y.digest)));
    }

    DiffResult {
        same_config: a.config.digest == b.config.digest,
        annotations_match: annotations_a == annotations_b,
        shared_layers,
        unique_layers_a,
        unique_layers_b,
    }
}

/// Compare two ModelKits given as references with an optional `local://`
/// or `remote://` prefix. Unprefixed references are looked up locally
/// first, then on their registry.
pub async fn diff(ctx: &KitContext, a: &str, b: &str) -> Result<DiffResult> {
    let manifest_a = fetch_manifest(ctx, a).await?;
    let manifest_b = fetch_manifest(ctx, b).await?;
    Ok(compare_manifests(&manifest_a, &manifest_b))
}

async fn fetch_manifest(ctx: &KitContext, arg: &str) -> Result<Manifest> {
    let (lookup, raw) = Lookup::split_prefix(arg);
    let reference = Reference::parse_single(raw)?;
    tracing::debug!(reference = %reference, ?lookup, "Fetching manifest for comparison");
    let (_, manifest, _) = resolve_modelkit(ctx, &reference, lookup).await?;
    Ok(manifest)
}
