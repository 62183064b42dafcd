//! KitOps Core - Foundational Types
//!
//! Errors, configuration, progress reporting and logging shared by the
//! ModelKit packaging crates.

pub mod config;
pub mod error;
pub mod log;
pub mod progress;

// Re-export commonly used types
pub use config::{KitConfig, LogLevel, NetworkOptions, MAX_MODEL_REF_CHAIN};
pub use error::{KitError, RegistryErrorDetail, RemoteError, Result};
pub use progress::{
    Clock, NoProgress, ProgressEmitter, ProgressEvent, ProgressSink, ProgressTracker,
    SystemClock, TracingProgress,
};

/// KitOps version, recorded in ModelKit manifest annotations
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
