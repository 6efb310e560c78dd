//! Tracing/logging initialization.
//!
//! The engine only emits `tracing` events; installing a subscriber is left to the
//! embedding process, which can use the helpers here.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// JSON lines when true, human readable output otherwise.
    pub json: bool,
    /// Directive used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            json: true,
            default_filter: "info".to_string(),
        }
    }
}

impl ObservabilityConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Initialize tracing/logging for the process with the default configuration.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(&ObservabilityConfig::default());
}

/// Install the global subscriber described by `config`.
///
/// Returns `false` when a subscriber was already installed; that one stays in place.
pub fn init_with(config: &ObservabilityConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    // JSON logs + timestamps, configurable via RUST_LOG.
    let installed = if config.json {
        builder.json().with_target(false).try_init().is_ok()
    } else {
        builder.pretty().try_init().is_ok()
    };
    if installed {
        ::tracing::info!(json = config.json, default_filter = %config.default_filter, "tracing initialized");
    } else {
        ::tracing::debug!("global subscriber already installed, keeping it");
    }
    installed
}

/// Route output through the test harness so it only shows for failing tests.
pub fn init_for_tests() {
    let config = ObservabilityConfig {
        json: false,
        default_filter: "debug".to_string(),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_test_writer()
        .try_init();
}
