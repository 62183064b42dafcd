//! Storage management operations: tag, remove, list, info, inspect, diff.

mod diff;
mod inspect;
mod list;
mod remove;
mod tag;

pub use diff::{compare_manifests, diff, DiffResult};
pub use inspect::{info, inspect, InspectInfo};
pub use list::{format_bytes, list, ModelKitInfo};
pub use remove::{remove, remove_all, remove_remote};
pub use tag::tag;

use kitops_core::error::Result;

use crate::context::KitContext;
use crate::kitfile::Kitfile;
use crate::oci::{get_manifest_and_config, Descriptor, Manifest, Reference, Target};

const REMOTE_PREFIX: &str = "remote://";
const LOCAL_PREFIX: &str = "local://";

/// Where a read-only operation looks a reference up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Lookup {
    /// Local storage, then the registry
    #[default]
    Auto,
    Local,
    Remote,
}

impl Lookup {
    /// Split an optional `local://` or `remote://` prefix off `arg`.
    pub fn split_prefix(arg: &str) -> (Self, &str) {
        if let Some(rest) = arg.strip_prefix(REMOTE_PREFIX) {
            (Self::Remote, rest)
        } else if let Some(rest) = arg.strip_prefix(LOCAL_PREFIX) {
            (Self::Local, rest)
        } else {
            (Self::Auto, arg)
        }
    }
}

/// Manifest descriptor, manifest and Kitfile of `reference`.
pub async fn resolve_modelkit(
    ctx: &KitContext,
    reference: &Reference,
    lookup: Lookup,
) -> Result<(Descriptor, Manifest, Kitfile)> {
    match lookup {
        Lookup::Auto => ctx.get_manifest_and_config(reference).await,
        Lookup::Local => resolve_in(&ctx.local_repository(reference)?, reference).await,
        Lookup::Remote => resolve_in(&ctx.remote_repository(reference)?, reference).await,
    }
}

async fn resolve_in(
    target: &dyn Target,
    reference: &Reference,
) -> Result<(Descriptor, Manifest, Kitfile)> {
    let desc = target.resolve(&reference.reference).await?;
    let (manifest, kitfile) = get_manifest_and_config(target, &desc).await?;
    Ok((desc, manifest, kitfile))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_prefix() {
        assert_eq!(
            Lookup::split_prefix("remote://ghcr.io/org/m:v1"),
            (Lookup::Remote, "ghcr.io/org/m:v1")
        );
        assert_eq!(Lookup::split_prefix("local://org/m:v1"), (Lookup::Local, "org/m:v1"));
        assert_eq!(Lookup::split_prefix("org/m:v1"), (Lookup::Auto, "org/m:v1"));
    }
}
