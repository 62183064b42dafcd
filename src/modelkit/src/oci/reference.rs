//! ModelKit reference parsing.
//!
//! Parses references like `registry.example.com/org/model:v1` into structured
//! components. References without a registry are stored under `localhost`;
//! a bare digest is addressed through the placeholder repository `_`.

use std::sync::OnceLock;

use regex::Regex;

use kitops_core::error::{KitError, Result};

/// Registry used when none is specified.
pub const DEFAULT_REGISTRY: &str = "localhost";

/// Repository used when only a digest is specified.
pub const DEFAULT_REPOSITORY: &str = "_";

const MAX_TAG_LEN: usize = 128;

fn registry_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9.-]*[A-Za-z0-9])?(?::[0-9]+)?$")
            .expect("registry regex is valid")
    })
}

fn repository_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9](?:[a-z0-9._/-]*[a-z0-9])?$").expect("repository regex is valid")
    })
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").expect("tag regex is valid")
    })
}

fn digest_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(sha256:[a-f0-9]{64}|sha512:[a-f0-9]{128})$").expect("digest regex is valid")
    })
}

/// Parsed ModelKit reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Registry host with optional port (e.g., "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "org/model")
    pub repository: String,
    /// Tag or digest; empty when the reference names only a repository
    pub reference: String,
}

impl Reference {
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            reference: reference.into(),
        }
    }

    /// Parse a reference string, returning the reference and any extra tags.
    ///
    /// Supports formats:
    /// - `model` → localhost/model
    /// - `org/model:v1` → localhost/org/model:v1
    /// - `org/model:v1,latest` → localhost/org/model:v1 plus extra tag `latest`
    /// - `ghcr.io/org/model@sha256:...` → ghcr.io/org/model@sha256:...
    /// - `sha256:...` → localhost/_@sha256:...
    pub fn parse(input: &str) -> Result<(Self, Vec<String>)> {
        let input = input.trim();
        if input.is_empty() {
            return Err(KitError::InvalidRepository("empty reference".to_string()));
        }

        if is_digest(input) {
            return Ok((
                Self::new(DEFAULT_REGISTRY, DEFAULT_REPOSITORY, input),
                Vec::new(),
            ));
        }

        let (head, extra_tags) = match input.split_once(',') {
            Some((head, extras)) => {
                let tags = extras
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(|t| validate_tag(t).map(|_| t.to_string()))
                    .collect::<Result<Vec<_>>>()?;
                (head, tags)
            }
            None => (input, Vec::new()),
        };

        let (registry, remainder) = match head.split_once('/') {
            Some((first, rest)) if looks_like_registry(first) => (first, rest),
            _ => (DEFAULT_REGISTRY, head),
        };
        if !registry_regex().is_match(registry) {
            return Err(KitError::InvalidRegistry(registry.to_string()));
        }

        let (repository, reference) = if let Some((name, digest)) = remainder.split_once('@') {
            // A tag before the digest is ignored
            let name = name.split_once(':').map(|(n, _)| n).unwrap_or(name);
            if !digest_regex().is_match(digest) {
                return Err(KitError::InvalidDigest(digest.to_string()));
            }
            (name, digest)
        } else if let Some((name, tag)) = remainder.split_once(':') {
            validate_tag(tag)?;
            (name, tag)
        } else {
            (remainder, "")
        };

        if !repository_regex().is_match(repository) {
            return Err(KitError::InvalidRepository(repository.to_string()));
        }

        Ok((Self::new(registry, repository, reference), extra_tags))
    }

    /// Parse a reference, discarding extra tags.
    pub fn parse_single(input: &str) -> Result<Self> {
        Self::parse(input).map(|(r, _)| r)
    }

    /// A copy of this reference pointing at `reference` instead.
    pub fn with_reference(&self, reference: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            reference: reference.into(),
        }
    }

    /// `registry/repository` without tag or digest.
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    pub fn is_digest(&self) -> bool {
        is_digest(&self.reference)
    }

    /// The tag, if the reference is a tag.
    pub fn tag(&self) -> Option<&str> {
        if self.reference.is_empty() || self.is_digest() {
            None
        } else {
            Some(&self.reference)
        }
    }

    /// True when the reference was given without a registry.
    pub fn is_local(&self) -> bool {
        self.registry == DEFAULT_REGISTRY
    }

    /// Format for users, hiding the default registry and placeholder
    /// repository so `localhost/_@sha256:...` is shown as `sha256:...`.
    pub fn format_for_display(&self) -> String {
        format_for_display(&self.to_string())
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if self.reference.is_empty() {
            Ok(())
        } else if self.is_digest() {
            write!(f, "@{}", self.reference)
        } else {
            write!(f, ":{}", self.reference)
        }
    }
}

/// Strip the default registry and placeholder repository from a formatted
/// reference or repository string.
pub fn format_for_display(reference: &str) -> String {
    let s = reference
        .strip_prefix(&format!("{}/", DEFAULT_REGISTRY))
        .unwrap_or(reference);
    let s = s.strip_prefix(DEFAULT_REPOSITORY).unwrap_or(s);
    s.strip_prefix('@').unwrap_or(s).to_string()
}

/// Whether `s` is a syntactically valid digest (`sha256:<64 hex>` or
/// `sha512:<128 hex>`).
pub fn is_digest(s: &str) -> bool {
    digest_regex().is_match(s)
}

/// Whether a Kitfile path names another ModelKit rather than a local path.
pub fn is_modelkit_reference(s: &str) -> bool {
    if !s.contains(':') && !s.contains('@') {
        return false;
    }
    Reference::parse(s).is_ok()
}

/// Validate a tag against `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.len() > MAX_TAG_LEN || !tag_regex().is_match(tag) {
        return Err(KitError::InvalidTag(tag.to_string()));
    }
    Ok(())
}

fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == DEFAULT_REGISTRY
}
