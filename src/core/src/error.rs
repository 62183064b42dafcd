use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single entry of the distribution-spec error envelope
/// (`{"errors": [{"code": ..., "message": ..., "detail": ...}]}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// A non-2xx response from a remote registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub method: String,
    pub url: String,
    pub status: u16,
    /// Parsed distribution-spec errors, if the body carried them.
    pub errors: Vec<RegistryErrorDetail>,
    /// Raw body when it could not be parsed as an error envelope.
    pub extra_message: Option<String>,
}

impl RemoteError {
    /// First registry error code, if any (e.g. `BLOB_UNKNOWN`).
    pub fn code(&self) -> Option<&str> {
        self.errors.first().map(|e| e.code.as_str())
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}: response status code {}",
            self.method, self.url, self.status
        )?;
        if self.errors.is_empty() {
            if let Some(extra) = self.extra_message.as_deref().filter(|m| !m.is_empty()) {
                write!(f, ": {}", extra)?;
            }
            return Ok(());
        }
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| {
                if e.message.is_empty() {
                    e.code.to_lowercase()
                } else {
                    format!("{}: {}", e.code.to_lowercase(), e.message)
                }
            })
            .collect();
        write!(f, ": {}", parts.join("; "))
    }
}

/// KitOps error types
#[derive(Error, Debug)]
pub enum KitError {
    /// Registry component of a reference is malformed
    #[error("Invalid registry: {0}")]
    InvalidRegistry(String),

    /// Repository component of a reference is malformed
    #[error("Invalid repository: {0}")]
    InvalidRepository(String),

    /// Tag component of a reference is malformed
    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    /// Digest component of a reference is malformed
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Kitfile failed to parse or validate
    #[error("Invalid Kitfile: {0}")]
    InvalidKitfile(String),

    /// Unrecognized media type
    #[error("Invalid media type: {0}")]
    InvalidMediaType(String),

    /// Manifest not present in the target
    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    /// Blob not present in the target
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    /// Tag not present in the target
    #[error("Tag not found: {0}")]
    TagNotFound(String),

    /// Repository does not exist
    #[error("Repository not found: {0}")]
    RepoNotFound(String),

    /// Destination path already exists
    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    /// Transferred content does not hash to the expected digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// A layer path resolves outside its base directory
    #[error("Path {path} is outside of {base}")]
    SubpathViolation { path: String, base: String },

    /// Kitfile parent chain loops back on itself
    #[error("Found cycle in modelkit references: {chain}")]
    CycleInModelKitReferences { chain: String },

    /// Kitfile parent chain is too long
    #[error("Reached maximum number of model references: {chain}")]
    MaxRefChainExceeded { chain: String },

    /// Registry acknowledged a different byte range than was sent
    #[error("Upload range mismatch: expected {expected}, registry returned {actual}")]
    UploadRangeMismatch { expected: String, actual: String },

    /// Non-2xx response from a registry
    #[error("Registry error: {0}")]
    RemoteHttp(RemoteError),

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// Operation was canceled by the caller
    #[error("Operation canceled")]
    Canceled,

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Index or tag file on disk is malformed
    #[error("Local storage is corrupted: {0}")]
    LocalStoreCorruption(String),

    /// Manifest exists but its config is not a Kitfile
    #[error("Reference {0} is not a ModelKit")]
    NotAModelKit(String),

    /// Unpacking a ModelKit whose model is inherited from another ModelKit
    #[error("Cannot unpack ModelKit that refers to another ModelKit ({0}); unpack its parent first")]
    CannotUnpackModelKitReference(String),

    /// Operation is not supported by the target
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl KitError {
    /// True for every layered not-found kind, including a remote 404.
    pub fn is_not_found(&self) -> bool {
        match self {
            KitError::ManifestNotFound(_)
            | KitError::BlobNotFound(_)
            | KitError::TagNotFound(_)
            | KitError::RepoNotFound(_) => true,
            KitError::RemoteHttp(e) => e.status == 404,
            _ => false,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, KitError::Canceled)
    }
}

impl From<serde_json::Error> for KitError {
    fn from(err: serde_json::Error) -> Self {
        KitError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for KitError {
    fn from(err: serde_yaml::Error) -> Self {
        KitError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for KitError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            KitError::Timeout(err.to_string())
        } else {
            KitError::Http(err.to_string())
        }
    }
}

/// Result type alias for KitOps operations
pub type Result<T> = std::result::Result<T, KitError>;
