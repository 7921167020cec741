//! Tracing initialization.
//!
//! `RUST_LOG` takes precedence when set, so fine-grained filters such as
//! `RUST_LOG=tem_emulator::server=trace` work without touching the config file.
//! Otherwise the filter comes from `application.log_level`.

use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::error::{AppResult, EmulatorError};

/// Install the global tracing subscriber described by `settings`.
///
/// Calling this more than once is harmless; later calls leave the first subscriber in
/// place.
pub fn init_from_config(settings: &Settings) -> AppResult<()> {
    let filter = build_filter(&settings.application.log_level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true);

    let result = if settings.application.log_format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

fn build_filter(default_level: &str) -> AppResult<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)
            .map_err(|e| EmulatorError::ConfigValidation(format!("Invalid RUST_LOG: {e}"))),
        _ => EnvFilter::try_new(default_level).map_err(|e| {
            EmulatorError::ConfigValidation(format!("Invalid log_level '{default_level}': {e}"))
        }),
    }
}
