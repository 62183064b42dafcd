//! ModelKit media types.
//!
//! Layers are typed `application/vnd.kitops.modelkit.<base>.v1.tar[+<compression>]`;
//! the Kitfile config blob is `application/vnd.kitops.modelkit.config.v1+json`.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use kitops_core::error::{KitError, Result};

/// Media type of the Kitfile config blob.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.kitops.modelkit.config.v1+json";

/// OCI image manifest media type.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index media type.
pub const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

fn layer_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^application/vnd\.kitops\.modelkit\.(model|modelpart|code|dataset|docs)\.v1\.tar(?:\+(gzip|zstd))?$",
        )
        .expect("media type regex is valid")
    })
}

/// What a layer (or the config) contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseType {
    Model,
    ModelPart,
    Code,
    Dataset,
    Docs,
    Config,
}

impl BaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseType::Model => "model",
            BaseType::ModelPart => "modelpart",
            BaseType::Code => "code",
            BaseType::Dataset => "dataset",
            BaseType::Docs => "docs",
            BaseType::Config => "config",
        }
    }

    /// Name shown to users ("model part" rather than "modelpart").
    pub fn user_name(&self) -> &'static str {
        match self {
            BaseType::ModelPart => "model part",
            BaseType::Config => "Kitfile",
            other => other.as_str(),
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        match s {
            "model" => Some(BaseType::Model),
            "modelpart" => Some(BaseType::ModelPart),
            "code" => Some(BaseType::Code),
            "dataset" => Some(BaseType::Dataset),
            "docs" => Some(BaseType::Docs),
            "config" => Some(BaseType::Config),
            _ => None,
        }
    }
}

impl std::fmt::Display for BaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layer compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "gzip")]
    Gzip,
    /// gzip at level 1; indistinguishable from `Gzip` once encoded
    #[serde(rename = "gzip-fastest")]
    GzipFastest,
    #[serde(rename = "zstd")]
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::GzipFastest => "gzip-fastest",
            Compression::Zstd => "zstd",
        }
    }

    /// Media type suffix, without the leading `+`.
    fn suffix(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip | Compression::GzipFastest => Some("gzip"),
            Compression::Zstd => Some("zstd"),
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = KitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "gzip-fastest" => Ok(Compression::GzipFastest),
            "zstd" => Ok(Compression::Zstd),
            other => Err(KitError::Other(format!(
                "invalid compression '{}' (must be one of none, gzip, gzip-fastest, zstd)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ModelKit media type: base plus compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaType {
    pub base: BaseType,
    pub compression: Compression,
}

impl MediaType {
    pub const CONFIG: MediaType = MediaType {
        base: BaseType::Config,
        compression: Compression::None,
    };

    pub fn layer(base: BaseType, compression: Compression) -> Self {
        Self { base, compression }
    }

    /// Parse a media type string. Returns `None` for anything that is not a
    /// ModelKit config or layer type.
    pub fn parse(s: &str) -> Option<Self> {
        if s == CONFIG_MEDIA_TYPE {
            return Some(Self::CONFIG);
        }
        let caps = layer_regex().captures(s)?;
        let base = BaseType::from_name(caps.get(1)?.as_str())?;
        let compression = match caps.get(2).map(|m| m.as_str()) {
            None => Compression::None,
            Some("gzip") => Compression::Gzip,
            Some("zstd") => Compression::Zstd,
            Some(_) => return None,
        };
        Some(Self { base, compression })
    }

    /// Parse, mapping unknown strings to `InvalidMediaType`.
    pub fn parse_strict(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| KitError::InvalidMediaType(s.to_string()))
    }

    pub fn is_config(&self) -> bool {
        self.base == BaseType::Config
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_config() {
            return f.write_str(CONFIG_MEDIA_TYPE);
        }
        write!(f, "application/vnd.kitops.modelkit.{}.v1.tar", self.base)?;
        if let Some(suffix) = self.compression.suffix() {
            write!(f, "+{}", suffix)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_media_type_strings() {
        assert_eq!(
            MediaType::layer(BaseType::Model, Compression::None).to_string(),
            "application/vnd.kitops.modelkit.model.v1.tar"
        );
        assert_eq!(
            MediaType::layer(BaseType::Dataset, Compression::Gzip).to_string(),
            "application/vnd.kitops.modelkit.dataset.v1.tar+gzip"
        );
        assert_eq!(
            MediaType::layer(BaseType::ModelPart, Compression::Zstd).to_string(),
            "application/vnd.kitops.modelkit.modelpart.v1.tar+zstd"
        );
        assert_eq!(MediaType::CONFIG.to_string(), CONFIG_MEDIA_TYPE);
    }

    #[test]
    fn test_gzip_fastest_renders_as_gzip() {
        let mt = MediaType::layer(BaseType::Code, Compression::GzipFastest);
        assert_eq!(
            mt.to_string(),
            "application/vnd.kitops.modelkit.code.v1.tar+gzip"
        );
        assert_eq!(
            MediaType::parse(&mt.to_string()).unwrap().compression,
            Compression::Gzip
        );
    }

    #[test]
    fn test_parse() {
        let mt = MediaType::parse("application/vnd.kitops.modelkit.docs.v1.tar").unwrap();
        assert_eq!(mt.base, BaseType::Docs);
        assert_eq!(mt.compression, Compression::None);

        let mt = MediaType::parse(CONFIG_MEDIA_TYPE).unwrap();
        assert!(mt.is_config());
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(MediaType::parse("application/vnd.oci.image.layer.v1.tar").is_none());
        assert!(MediaType::parse("application/vnd.kitops.modelkit.model.v1.tar+bzip2").is_none());
        assert!(MediaType::parse("application/vnd.kitops.modelkit.config.v1+JSON").is_none());
        assert!(matches!(
            MediaType::parse_strict("text/plain"),
            Err(KitError::InvalidMediaType(_))
        ));
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("gzip-fastest".parse::<Compression>().unwrap(), Compression::GzipFastest);
        assert_eq!("".parse::<Compression>().unwrap(), Compression::None);
        assert!("lz4".parse::<Compression>().is_err());
    }
}
