//! KitOps ModelKit engine.
//!
//! Packs directories described by a Kitfile into OCI artifacts, stores them
//! in a local OCI layout, moves them to and from registries, and unpacks
//! them back onto disk.

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod context;
pub mod copy;
pub mod ignore;
pub mod kitfile;
pub mod layer;
pub mod local;
pub mod oci;
pub mod ops;
pub mod pack;
pub mod pull;
pub mod push;
pub mod remote;
pub mod unpack;

// Re-export common types
pub use cache::CacheDir;
pub use context::KitContext;
pub use copy::{copy, CopyOptions};
pub use ignore::IgnoreMatcher;
pub use kitfile::{resolve_kitfile, validate_kitfile, Kitfile, KitfileSource};
pub use layer::{BuiltLayer, LayerBuilder, LayerStats};
pub use local::{list_all_repos, migrate, needs_migration, LocalRepository};
pub use oci::{BaseType, Compression, Descriptor, Manifest, MediaType, Reference, Target};
pub use ops::{
    compare_manifests, diff, format_bytes, info, inspect, list, remove, remove_all, remove_remote,
    tag, DiffResult, InspectInfo, Lookup, ModelKitInfo,
};
pub use pack::{pack, PackOptions};
pub use pull::{pull, pull_one};
pub use push::push;
pub use remote::{AnonymousAuth, AuthProvider, Credential, EnvAuth, RemoteRepository, StaticAuth};
pub use unpack::{unpack, OverwritePolicy, UnpackFilter, UnpackOptions, UnpackSummary};

pub use kitops_core::{KitConfig, KitError, NetworkOptions, Result, VERSION};
