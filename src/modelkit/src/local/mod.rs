//! Local ModelKit storage.
//!
//! ```text
//! <storage>/
//!   blobs/sha256/<hex>                      shared content-addressed blobs
//!   ingest/                                 partial and in-flight downloads
//!   refs/<registry>/<repository>/index.json manifests of one repository
//!   refs/<registry>/<repository>/tags.json  tag -> manifest descriptor
//! ```

mod index;
mod ingest;
pub mod migration;
mod repository;

pub use migration::{find_legacy_stores, migrate, needs_migration, LegacyStore};
pub use repository::{list_all_repos, LocalRepository};
