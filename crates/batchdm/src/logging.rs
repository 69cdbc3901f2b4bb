//! Tracing subscriber setup for binaries and integration harnesses

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVE: &str = "info,batchdm=debug";

/// Install a formatted subscriber writing to stdout
///
/// `RUST_LOG` takes precedence over `default_directive`. Fails if a global
/// subscriber is already installed.
pub fn init_logging(default_directive: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

/// Same as [`init_logging`] but writes to stderr without colors, for piped output
pub fn init_logging_stderr(default_directive: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}
