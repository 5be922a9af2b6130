//! Logging bootstrap for the plugin runtime
//!
//! Installs a `tracing-subscriber` fmt subscriber driven by an `EnvFilter`
//! and provides [`ArgumentRedactor`], which masks credentials, e-mail
//! addresses and bearer tokens in structured plugin arguments before they are
//! logged.
//!
//! ```no_run
//! use logger_redacted::{init_logging, LoggerConfig};
//!
//! init_logging(&LoggerConfig { json: true, ..Default::default() })?;
//! tracing::info!(plugin = "comm/smtp", "Plugin runtime started");
//! # Ok::<(), logger_redacted::LoggerError>(())
//! ```

pub mod config;
pub mod redactor;

pub use config::LoggerConfig;
pub use redactor::{ArgumentRedactor, RedactionConfig};

use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Install the global subscriber. `RUST_LOG`, when set, wins over `log_level`.
pub fn init_logging(config: &LoggerConfig) -> Result<(), LoggerError> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = if config.json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|_| LoggerError::AlreadyInitialized)
}

fn build_filter(config: &LoggerConfig) -> Result<EnvFilter, LoggerError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.log_level).map_err(|err| LoggerError::InvalidFilter {
        directive: config.log_level.clone(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_already_initialized() {
        let config = LoggerConfig {
            log_level: "debug".to_string(),
            ..Default::default()
        };
        // another test binary may already own the global subscriber
        let _ = init_logging(&config);
        assert!(matches!(init_logging(&config), Err(LoggerError::AlreadyInitialized)));
    }

    #[test]
    fn test_filter_uses_configured_level() {
        let config = LoggerConfig::default();
        if std::env::var("RUST_LOG").is_err() {
            assert!(build_filter(&config).is_ok());
        }
    }
}
