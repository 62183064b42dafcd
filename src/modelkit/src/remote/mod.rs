//! OCI distribution-spec client.

pub mod auth;
mod errors;
mod repository;
pub mod upload;

pub use auth::{AnonymousAuth, AuthClient, AuthProvider, Challenge, Credential, EnvAuth, StaticAuth};
pub use repository::{build_http_client, RemoteRepository};
pub use upload::{chunk_ranges, get_upload_format, UploadFormat};
