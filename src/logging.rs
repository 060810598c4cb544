//! Subscriber setup and the test stream.
//!
//! Test-stream lines go to target `saber::test`; downstream regression checks
//! grep for them, so their wording is stable.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Target of the canonical test stream.
pub const TEST_TARGET: &str = "saber::test";

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber on stderr. `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);
    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| InitError::Subscriber(e.to_string()))
}

/// Writes one line on the test stream.
pub fn test_line(message: &str) {
    tracing::info!(target: TEST_TARGET, "{message}");
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to install subscriber: {0}")]
    Subscriber(String),
}
