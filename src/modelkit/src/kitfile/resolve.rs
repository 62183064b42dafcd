//! Parent resolution for Kitfiles whose `model.path` names another ModelKit.

use async_trait::async_trait;

use kitops_core::config::MAX_MODEL_REF_CHAIN;
use kitops_core::error::{KitError, Result};

use super::{validate_kitfile, Kitfile, Model};

/// Loads the Kitfile behind a ModelKit reference.
#[async_trait]
pub trait KitfileSource: Send + Sync {
    async fn get_kitfile(&self, reference: &str) -> Result<Kitfile>;
}

/// Follow `model.path` references from `kitfile` (known as `base_ref`),
/// merging each parent into the result, until the model path is local.
pub async fn resolve_kitfile(
    source: &dyn KitfileSource,
    kitfile: Kitfile,
    base_ref: &str,
) -> Result<Kitfile> {
    let mut resolved = kitfile;
    let mut chain = vec![base_ref.to_string()];

    while let Some(parent_ref) = resolved.parent_reference().map(str::to_string) {
        if let Some(idx) = chain.iter().position(|r| *r == parent_ref) {
            return Err(KitError::CycleInModelKitReferences {
                chain: format_chain(&chain[idx..], &parent_ref),
            });
        }
        if chain.len() > MAX_MODEL_REF_CHAIN {
            return Err(KitError::MaxRefChainExceeded {
                chain: format_chain(&chain, &parent_ref),
            });
        }
        tracing::debug!(parent = %parent_ref, "Resolving parent Kitfile");
        let parent = source.get_kitfile(&parent_ref).await?;
        chain.push(parent_ref);
        resolved = merge_kitfiles(resolved, parent);
    }

    validate_kitfile(&resolved)?;
    Ok(resolved)
}

/// `[a=>b=>c]`
pub(crate) fn format_chain(chain: &[String], next: &str) -> String {
    let mut parts: Vec<&str> = chain.iter().map(String::as_str).collect();
    parts.push(next);
    format!("[{}]", parts.join("=>"))
}

/// Merge a parent Kitfile into a child. Scalar fields keep the child's value
/// when set; lists are concatenated child first. The model path is taken from
/// the parent, since the child's path is the reference being resolved.
pub fn merge_kitfiles(child: Kitfile, parent: Kitfile) -> Kitfile {
    fn first_non_empty(a: String, b: String) -> String {
        if a.is_empty() {
            b
        } else {
            a
        }
    }
    fn concat<T>(mut a: Vec<T>, b: Vec<T>) -> Vec<T> {
        a.extend(b);
        a
    }

    let mut package = child.package;
    package.name = first_non_empty(package.name, parent.package.name);
    package.version = first_non_empty(package.version, parent.package.version);
    package.description = first_non_empty(package.description, parent.package.description);
    package.license = first_non_empty(package.license, parent.package.license);
    package.authors = concat(package.authors, parent.package.authors);

    let model = match (child.model, parent.model) {
        (None, None) => None,
        (child_model, parent_model) => {
            let c = child_model.unwrap_or_default();
            let p = parent_model.unwrap_or_default();
            Some(Model {
                name: first_non_empty(c.name, p.name),
                path: p.path,
                license: first_non_empty(c.license, p.license),
                framework: first_non_empty(c.framework, p.framework),
                version: first_non_empty(c.version, p.version),
                description: first_non_empty(c.description, p.description),
                parts: concat(c.parts, p.parts),
                parameters: c.parameters.or(p.parameters),
            })
        }
    };

    Kitfile {
        manifest_version: first_non_empty(child.manifest_version, parent.manifest_version),
        package,
        model,
        code: concat(child.code, parent.code),
        datasets: concat(child.datasets, parent.datasets),
        docs: concat(child.docs, parent.docs),
    }
}
