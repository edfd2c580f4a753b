//! Logging setup
//!
//! The synchronizer logs under the `rvoip_callsync_core` target. By default
//! that target is filtered at [`LoggingConfig::level`] and everything else at
//! [`LoggingConfig::dependency_level`]; a `RUST_LOG` value replaces both.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::parse_bool;
use crate::error::{SyncError, SyncResult};

/// Log target of this crate
pub const LOG_TARGET: &str = "rvoip_callsync_core";

/// Environment variable overriding [`LoggingConfig::level`]
pub const ENV_LOG_LEVEL: &str = "CALLSYNC_LOG_LEVEL";
/// Environment variable overriding [`LoggingConfig::json`]
pub const ENV_LOG_JSON: &str = "CALLSYNC_LOG_JSON";

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Level for synchronizer events
    pub level: Level,
    /// Level for every other target (runtime, daemon bindings, ...)
    pub dependency_level: Level,
    /// Whether to enable JSON formatting
    pub json: bool,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Whether to log spans
    pub log_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            dependency_level: Level::WARN,
            json: false,
            file_info: false,
            log_spans: false,
        }
    }
}

impl LoggingConfig {
    /// Log synchronizer events at `level`
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    /// Defaults overridden by `CALLSYNC_LOG_LEVEL` and `CALLSYNC_LOG_JSON`
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(ENV_LOG_LEVEL) {
            config.level = parse_log_level(&raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_LOG_JSON) {
            config.json = parse_bool(ENV_LOG_JSON, &raw)?;
        }
        Ok(config)
    }

    /// Set the level for targets outside this crate
    pub fn with_dependency_level(mut self, level: Level) -> Self {
        self.dependency_level = level;
        self
    }

    /// Enable JSON formatting
    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Enable file and line information in logs
    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    /// Enable span logging
    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    /// Filter directives used when `RUST_LOG` is not set
    pub fn directives(&self) -> String {
        format!(
            "{},{}={}",
            level_name(self.dependency_level),
            LOG_TARGET,
            level_name(self.level)
        )
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directives()))
    }
}

fn level_name(level: Level) -> String {
    level.to_string().to_ascii_lowercase()
}

/// Install the global tracing subscriber
///
/// Fails with a configuration error if a global subscriber is already installed.
pub fn setup_logging(config: LoggingConfig) -> SyncResult<()> {
    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let mut subscriber = fmt::Subscriber::builder()
        .with_env_filter(config.filter())
        .with_span_events(span_events);

    if config.file_info {
        subscriber = subscriber.with_file(true).with_line_number(true);
    }

    let installed = if config.json {
        subscriber.with_writer(std::io::stdout).json().try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|e| SyncError::config(format!("Failed to install logger: {}", e)))?;

    tracing::info!(
        target: LOG_TARGET,
        "Call synchronizer v{} logging at {} ({})",
        crate::VERSION,
        config.level,
        config.directives()
    );
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> SyncResult<Level> {
    Level::from_str(level.trim())
        .map_err(|_| SyncError::config(format!("Invalid log level: {}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        unsafe {
            std::env::remove_var(ENV_LOG_LEVEL);
            std::env::remove_var(ENV_LOG_JSON);
        }
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level(" WARN ").unwrap(), Level::WARN);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_directives_scope_crate_target() {
        assert_eq!(LoggingConfig::default().directives(), "warn,rvoip_callsync_core=info");

        let config = LoggingConfig::new(Level::TRACE)
            .with_dependency_level(Level::ERROR)
            .with_json()
            .with_spans();
        assert_eq!(config.directives(), "error,rvoip_callsync_core=trace");
        assert!(config.json);
        assert!(config.log_spans);
        assert!(!config.file_info);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        assert_eq!(LoggingConfig::from_env().unwrap(), LoggingConfig::default());

        unsafe {
            std::env::set_var(ENV_LOG_LEVEL, "debug");
            std::env::set_var(ENV_LOG_JSON, "1");
        }
        let config = LoggingConfig::from_env().unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.json);

        unsafe {
            std::env::set_var(ENV_LOG_LEVEL, "chatty");
        }
        assert_eq!(LoggingConfig::from_env().unwrap_err().kind(), "config");
        clear_env();
    }

    #[test]
    fn test_second_install_is_a_config_error() {
        let _ = setup_logging(LoggingConfig::new(Level::DEBUG));
        let err = setup_logging(LoggingConfig::new(Level::DEBUG)).unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("Failed to install logger"));
    }
}
