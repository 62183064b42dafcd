use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use kitops_core::error::{KitError, Result};

use super::{clean_path, Kitfile};
use crate::oci::is_modelkit_reference;

const PART_TYPE_MAX_LEN: usize = 64;

fn part_type_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\w[\w.-]*$").expect("part type regex is valid"))
}

/// Check every Kitfile invariant, collecting all violations into a single
/// `InvalidKitfile` error with one sorted `  * ...` line per problem.
pub fn validate_kitfile(kitfile: &Kitfile) -> Result<()> {
    let mut errs: Vec<String> = Vec::new();
    // path -> components using it
    let mut paths: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut add_path = |path: &str, source: String| {
        let key = if path.is_empty() { "." } else { path };
        paths.entry(key.to_string()).or_default().push(source);
    };

    if kitfile.manifest_version.trim().is_empty() {
        errs.push("manifestVersion is required".to_string());
    }

    if let Some(model) = &kitfile.model {
        add_path(&model.path, format!("model {}", model.name));
        for part in &model.parts {
            add_path(&part.path, format!("modelpart {}", part.name));
            if is_modelkit_reference(&part.path) {
                errs.push(format!(
                    "modelpart {} path {} refers to a ModelKit; only the model path may",
                    part.name, part.path
                ));
            }
            if !part.part_type.is_empty() {
                if !part_type_regex().is_match(&part.part_type) {
                    errs.push(format!(
                        "modelpart {} has invalid type (must be alphanumeric with dots, dashes, and underscores)",
                        part.name
                    ));
                }
                if part.part_type.len() > PART_TYPE_MAX_LEN {
                    errs.push(format!(
                        "modelpart {} type is too long (must be fewer than {} characters)",
                        part.name, PART_TYPE_MAX_LEN
                    ));
                }
            }
        }
    }
    for dataset in &kitfile.datasets {
        add_path(&dataset.path, format!("dataset {}", dataset.name));
        if dataset.path.trim().is_empty() {
            errs.push(format!("dataset {} has no path", dataset.name));
        }
    }
    for (idx, code) in kitfile.code.iter().enumerate() {
        add_path(&code.path, format!("code layer {}", idx));
        if code.path.trim().is_empty() {
            errs.push(format!("code layer {} has no path", idx));
        }
    }
    for (idx, docs) in kitfile.docs.iter().enumerate() {
        add_path(&docs.path, format!("docs layer {}", idx));
        if docs.path.trim().is_empty() {
            errs.push(format!("docs layer {} has no path", idx));
        }
    }

    for (layer_path, ids) in &paths {
        if let Some((last, rest)) = ids.split_last() {
            if !rest.is_empty() {
                errs.push(format!(
                    "{} and {} use the same path {}",
                    rest.join(", "),
                    last,
                    layer_path
                ));
            }
        }
        if is_absolute(layer_path) {
            errs.push(format!(
                "absolute paths are not supported in a Kitfile (path {} in {})",
                layer_path, ids[0]
            ));
        }
    }

    for dataset in &kitfile.datasets {
        if is_modelkit_reference(&dataset.path) {
            errs.push(format!(
                "dataset {} path {} refers to a ModelKit; only the model path may",
                dataset.name, dataset.path
            ));
        }
    }

    if errs.is_empty() {
        return Ok(());
    }
    errs.sort();
    let lines: Vec<String> = errs.iter().map(|e| format!("  * {}", e)).collect();
    Err(KitError::InvalidKitfile(format!(
        "errors while validating Kitfile: \n{}",
        lines.join("\n")
    )))
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || path.starts_with('\\') || Path::new(path).is_absolute()
}

/// Resolve `sub` inside `context`, following symlinks, and fail with
/// `SubpathViolation` if the result escapes `context`.
///
/// Returns the absolute path and the path relative to the (resolved) context.
pub fn verify_subpath(context: &Path, sub: &str) -> Result<(PathBuf, String)> {
    let violation = || KitError::SubpathViolation {
        path: sub.to_string(),
        base: context.display().to_string(),
    };
    if is_absolute(sub) {
        return Err(violation());
    }
    let cleaned = clean_path(sub);
    if cleaned == ".." || cleaned.starts_with("../") {
        return Err(violation());
    }

    let abs_context = if context.exists() {
        context.canonicalize()?
    } else if context.is_absolute() {
        context.to_path_buf()
    } else {
        std::env::current_dir()?.join(context)
    };

    let mut full = if cleaned == "." {
        abs_context.clone()
    } else {
        abs_context.join(&cleaned)
    };
    if full.exists() {
        full = full.canonicalize()?;
    }

    let rel = full.strip_prefix(&abs_context).map_err(|_| violation())?;
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    let rel = if rel.is_empty() { ".".to_string() } else { rel };
    Ok((full, rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kitfile::{Code, Dataset, Docs, Model, ModelPart};
    use tempfile::TempDir;

    fn base() -> Kitfile {
        Kitfile {
            manifest_version: "1.0.0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_kitfile() {
        let mut kf = base();
        kf.model = Some(Model {
            path: "model".to_string(),
            ..Default::default()
        });
        kf.code = vec![Code {
            path: "src".to_string(),
            ..Default::default()
        }];
        assert!(validate_kitfile(&kf).is_ok());
    }

    #[test]
    fn test_errors_are_aggregated_and_sorted() {
        let mut kf = base();
        kf.manifest_version = String::new();
        kf.model = Some(Model {
            name: "m".to_string(),
            path: "data".to_string(),
            parts: vec![ModelPart {
                name: "p".to_string(),
                path: "/abs/part".to_string(),
                part_type: "bad type!".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        kf.datasets = vec![Dataset {
            name: "d".to_string(),
            path: "data".to_string(),
            ..Default::default()
        }];

        let err = validate_kitfile(&kf).unwrap_err().to_string();
        let lines: Vec<&str> = err.lines().skip(1).collect();
        assert_eq!(
            lines,
            vec![
                "  * absolute paths are not supported in a Kitfile (path /abs/part in modelpart p)",
                "  * manifestVersion is required",
                "  * model m and dataset d use the same path data",
                "  * modelpart p has invalid type (must be alphanumeric with dots, dashes, and underscores)",
            ]
        );
    }

    #[test]
    fn test_empty_paths_collide_as_context_root() {
        let mut kf = base();
        kf.model = Some(Model::default());
        kf.docs = vec![Docs {
            path: ".".to_string(),
            ..Default::default()
        }];
        let err = validate_kitfile(&kf).unwrap_err().to_string();
        assert!(err.contains("use the same path ."));
    }

    #[test]
    fn test_reference_only_allowed_for_model() {
        let mut kf = base();
        kf.model = Some(Model {
            path: "ghcr.io/org/base:v1".to_string(),
            ..Default::default()
        });
        assert!(validate_kitfile(&kf).is_ok());

        kf.datasets = vec![Dataset {
            name: "d".to_string(),
            path: "ghcr.io/org/data:v1".to_string(),
            ..Default::default()
        }];
        assert!(validate_kitfile(&kf).is_err());
    }

    #[test]
    fn test_verify_subpath() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();

        let (abs, rel) = verify_subpath(tmp.path(), "a/./b/").unwrap();
        assert_eq!(rel, "a/b");
        assert!(abs.ends_with("a/b"));

        let (_, rel) = verify_subpath(tmp.path(), "").unwrap();
        assert_eq!(rel, ".");

        assert!(matches!(
            verify_subpath(tmp.path(), "../outside"),
            Err(KitError::SubpathViolation { .. })
        ));
        assert!(verify_subpath(tmp.path(), "/etc/passwd").is_err());
        assert!(verify_subpath(tmp.path(), "a/../../x").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_verify_subpath_rejects_escaping_symlink() {
        let outside = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), ctx.path().join("link")).unwrap();
        assert!(matches!(
            verify_subpath(ctx.path(), "link"),
            Err(KitError::SubpathViolation { .. })
        ));
    }
}
