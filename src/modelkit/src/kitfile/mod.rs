//! The Kitfile: the manifest-config document of a ModelKit.
//!
//! Parsing is strict: unknown fields (including the legacy `kit`, `models`,
//! `training` and `validation` blocks) are rejected.

mod resolve;
mod validate;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kitops_core::config::DEFAULT_KITFILE_NAMES;
use kitops_core::error::{KitError, Result};

use crate::oci::is_modelkit_reference;

pub(crate) use resolve::format_chain;
pub use resolve::{merge_kitfiles, resolve_kitfile, KitfileSource};
pub use validate::{validate_kitfile, verify_subpath};

/// Manifest-config document of a ModelKit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Kitfile {
    #[serde(default)]
    pub manifest_version: String,
    #[serde(default, skip_serializing_if = "Package::is_empty")]
    pub package: Package,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Model>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code: Vec<Code>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datasets: Vec<Dataset>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docs: Vec<Docs>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Package {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
}

impl Package {
    pub fn is_empty(&self) -> bool {
        self == &Package::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Model {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Local path, or a reference to a parent ModelKit
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub framework: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ModelPart>,
    /// Free-form JSON-compatible data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl Model {
    /// Whether the model is inherited from another ModelKit.
    pub fn is_reference(&self) -> bool {
        is_modelkit_reference(&self.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPart {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub part_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Code {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dataset {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Docs {
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Kitfile {
    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yaml::from_str(data).map_err(|e| KitError::InvalidKitfile(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| KitError::InvalidKitfile(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Compact JSON, as stored in the config blob.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Read and parse a Kitfile from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            KitError::InvalidKitfile(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&data)
    }

    /// Find and load the Kitfile in `dir` using the default file names.
    pub fn load_from_dir(dir: &Path) -> Result<(PathBuf, Self)> {
        let path = find_kitfile(dir)?;
        let kitfile = Self::load(&path)?;
        Ok((path, kitfile))
    }

    /// Model path, if the model inherits from another ModelKit.
    pub fn parent_reference(&self) -> Option<&str> {
        self.model
            .as_ref()
            .filter(|m| m.is_reference())
            .map(|m| m.path.as_str())
    }

    /// Cleaned local paths of every declared layer, in declaration order.
    /// References and empty model paths are skipped.
    pub fn layer_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        if let Some(model) = &self.model {
            if !model.path.is_empty() && !model.is_reference() {
                paths.push(clean_path(&model.path));
            }
            paths.extend(model.parts.iter().map(|p| clean_path(&p.path)));
        }
        paths.extend(self.code.iter().map(|c| clean_path(&c.path)));
        paths.extend(self.datasets.iter().map(|d| clean_path(&d.path)));
        paths.extend(self.docs.iter().map(|d| clean_path(&d.path)));
        paths
    }
}

/// Locate the Kitfile in `dir`.
pub fn find_kitfile(dir: &Path) -> Result<PathBuf> {
    DEFAULT_KITFILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
        .ok_or_else(|| {
            KitError::InvalidKitfile(format!(
                "no Kitfile found in {} (looked for {})",
                dir.display(),
                DEFAULT_KITFILE_NAMES.join(", ")
            ))
        })
}

/// Lexically clean a relative path: trim whitespace, drop `.` components and
/// resolve `..` where possible. An empty result becomes `.`.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.trim().split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
