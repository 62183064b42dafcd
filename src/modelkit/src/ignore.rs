//! Path exclusion for layer builds.
//!
//! A path is excluded from a layer when `.kitignore` matches it (or one of its
//! parents), or when it lives under another, more specific layer root.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use kitops_core::config::{DEFAULT_KITFILE_NAMES, IGNORE_FILE_NAME};
use kitops_core::error::{KitError, Result};

use crate::kitfile::{clean_path, Kitfile};

/// Gitignore-style matcher combined with cross-layer ownership.
pub struct IgnoreMatcher {
    matcher: Gitignore,
    layers: Vec<String>,
}

impl IgnoreMatcher {
    /// Build a matcher from explicit patterns. Kitfile names and the ignore
    /// file itself are always excluded.
    pub fn new(context_dir: &Path, patterns: &[String], layer_paths: Vec<String>) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(context_dir);
        let defaults = DEFAULT_KITFILE_NAMES.iter().copied().chain([IGNORE_FILE_NAME]);
        for pattern in patterns.iter().map(String::as_str).chain(defaults) {
            builder.add_line(None, pattern).map_err(|e| {
                KitError::Other(format!(
                    "invalid {} pattern '{}': {}",
                    IGNORE_FILE_NAME, pattern, e
                ))
            })?;
        }
        let matcher = builder
            .build()
            .map_err(|e| KitError::Other(format!("invalid {} file: {}", IGNORE_FILE_NAME, e)))?;
        Ok(Self {
            matcher,
            layers: layer_paths.iter().map(|p| clean_path(p)).collect(),
        })
    }

    /// Build a matcher from `<context_dir>/.kitignore` (if present) and the
    /// layer roots declared in `kitfile`.
    pub fn from_context(context_dir: &Path, kitfile: &Kitfile) -> Result<Self> {
        let patterns = read_ignore_file(context_dir)?;
        Self::new(context_dir, &patterns, kitfile.layer_paths())
    }

    /// Whether `path` (relative to the context directory) should be left out
    /// of the layer rooted at `layer_root`.
    pub fn matches(&self, path: &str, layer_root: &str) -> bool {
        self.matches_entry(path, layer_root, false)
    }

    /// Like [`matches`](Self::matches) but for a directory, so that
    /// directory-only patterns (`build/`) apply.
    pub fn matches_dir(&self, path: &str, layer_root: &str) -> bool {
        self.matches_entry(path, layer_root, true)
    }

    /// Whether any `!pattern` re-inclusions exist. Without them, an ignored
    /// directory can be pruned without visiting its contents.
    pub fn has_exclusions(&self) -> bool {
        self.matcher.num_whitelists() > 0
    }

    fn matches_entry(&self, path: &str, layer_root: &str, is_dir: bool) -> bool {
        let path = clean_path(path);
        if path == "." {
            return false;
        }
        if self
            .matcher
            .matched_path_or_any_parents(Path::new(&path), is_dir)
            .is_ignore()
        {
            return true;
        }
        self.owned_by_other_layer(&path, &clean_path(layer_root))
    }

    fn owned_by_other_layer(&self, path: &str, layer_root: &str) -> bool {
        for layer in &self.layers {
            // Layers containing the current one (or equal to it) never exclude
            if is_path_prefix(layer, layer_root) {
                continue;
            }
            if is_path_prefix(layer, path) {
                return true;
            }
        }
        false
    }
}

/// Component-wise prefix test on cleaned, slash-separated relative paths.
fn is_path_prefix(prefix: &str, path: &str) -> bool {
    prefix == "."
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

fn read_ignore_file(context_dir: &Path) -> Result<Vec<String>> {
    let path = context_dir.join(IGNORE_FILE_NAME);
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(KitError::Other(format!(
            "failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}
