//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Returns `false` when a
/// subscriber was already installed, in which case nothing changes.
pub fn init_tracing(level: LogLevel, json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_noop() {
        let _ = init_tracing(LogLevel::Debug, false);
        assert!(!init_tracing(LogLevel::Info, true));
    }
}
