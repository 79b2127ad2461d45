//! Tracing subscriber bootstrap.
//!
//! Call [`init_telemetry`] once at process start; every component logs
//! through `tracing` with structured fields.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Console logging configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Minimum log level filter.
    ///
    /// Accepts the same syntax as `RUST_LOG`, e.g. `"info"` or
    /// `"evm_indexer=debug,warn"`. Overridden by the `RUST_LOG` environment
    /// variable if set.
    pub log_filter: String,
    /// Enable ANSI color escape codes in console output.
    pub enable_console_colors: bool,
    /// Include the Rust module target path in console output.
    pub show_target: bool,
    /// Include OS thread IDs in console output.
    pub show_thread_ids: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".into(),
            enable_console_colors: true,
            show_target: true,
            show_thread_ids: false,
        }
    }
}

/// Guard that keeps the telemetry subsystem alive.
pub struct TelemetryGuard {
    _private: (),
}

static TELEMETRY_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber (singleton, called once).
///
/// Uses `RUST_LOG` if set, otherwise falls back to `config.log_filter`.
/// Safe to call multiple times — subsequent calls are no-ops.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    TELEMETRY_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

        let fmt_layer = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_ansi(config.enable_console_colors);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    });

    TelemetryGuard { _private: () }
}
