//! OCI descriptor, manifest and index documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kitops_core::error::{KitError, Result};

use super::digest::{sha256_digest, split_digest};
use super::media_type::{CONFIG_MEDIA_TYPE, INDEX_MEDIA_TYPE, MANIFEST_MEDIA_TYPE};

/// Manifest annotation recording the tool version that packed a ModelKit.
pub const VERSION_ANNOTATION: &str = "kitops.version";

/// Standard OCI annotation holding a tag in legacy `index.json` files.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            annotations: None,
        }
    }

    /// Descriptor for an in-memory blob.
    pub fn from_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, sha256_digest(data), data.len() as u64)
    }

    pub fn is_manifest(&self) -> bool {
        self.media_type == MANIFEST_MEDIA_TYPE
    }

    /// Digest algorithm (e.g. `sha256`).
    pub fn algorithm(&self) -> Result<&str> {
        split_digest(&self.digest).map(|(alg, _)| alg)
    }

    /// Hex-encoded part of the digest.
    pub fn encoded(&self) -> Result<&str> {
        split_digest(&self.digest).map(|(_, hex)| hex)
    }

    /// First 12 hex characters of the digest, for log lines and progress labels.
    pub fn short_digest(&self) -> &str {
        let hex = self
            .digest
            .split_once(':')
            .map(|(_, h)| h)
            .unwrap_or(&self.digest);
        &hex[..hex.len().min(12)]
    }

    /// Same descriptor without annotations, for digest-keyed comparisons.
    pub fn stripped(&self) -> Self {
        Self {
            annotations: None,
            ..self.clone()
        }
    }
}

/// OCI image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Manifest {
    /// A ModelKit manifest with the version annotation set.
    pub fn new(config: Descriptor, layers: Vec<Descriptor>, version: &str) -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(VERSION_ANNOTATION.to_string(), version.to_string());
        Self {
            schema_version: 2,
            media_type: Some(MANIFEST_MEDIA_TYPE.to_string()),
            config,
            layers,
            annotations: Some(annotations),
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(data)?;
        if manifest.schema_version != 2 {
            return Err(KitError::SerializationError(format!(
                "unsupported manifest schema version {}",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }

    /// Serialize and describe the manifest in one step.
    pub fn to_bytes(&self) -> Result<(Vec<u8>, Descriptor)> {
        let data = serde_json::to_vec(self)?;
        let desc = Descriptor::from_bytes(MANIFEST_MEDIA_TYPE, &data);
        Ok((data, desc))
    }

    pub fn is_modelkit(&self) -> bool {
        self.config.media_type == CONFIG_MEDIA_TYPE
    }

    /// Config followed by layers, de-duplicated by digest.
    pub fn blobs(&self) -> Vec<Descriptor> {
        let mut seen = std::collections::HashSet::new();
        std::iter::once(&self.config)
            .chain(self.layers.iter())
            .filter(|d| seen.insert(d.digest.clone()))
            .cloned()
            .collect()
    }

    /// Whether this manifest references `digest` as config or layer.
    pub fn references(&self, digest: &str) -> bool {
        self.config.digest == digest || self.layers.iter().any(|l| l.digest == digest)
    }
}

/// OCI image index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(INDEX_MEDIA_TYPE.to_string()),
            manifests: Vec::new(),
        }
    }
}
