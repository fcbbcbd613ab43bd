//! Tracing initialisation.
//!
//! Builds a `tracing-subscriber` registry with an [`EnvFilter`] and one fmt layer in
//! the configured [`OutputFormat`]. `RUST_LOG`, when set, overrides the configured
//! level.
//!
//! # Example
//! ```no_run
//! use sample_archiver::{config::ArchiverConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ArchiverConfig::load_from("config/archiver.toml")?;
//! logging::init_from_config(&config)?;
//! info!("Archiver started");
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ArchiverConfig;
use crate::error::{ArchiverError, ArchiverResult};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, coloured (development)
    #[default]
    Pretty,
    /// One line per event, no colours
    Compact,
    /// Newline-delimited JSON for log aggregation
    Json,
}

impl FromStr for OutputFormat {
    type Err = ArchiverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(ArchiverError::Configuration(format!(
                "Invalid log format '{s}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    /// Minimum level when `RUST_LOG` is unset
    pub level: Level,
    /// Line format
    pub format: OutputFormat,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
    /// ANSI colours (pretty format only)
    pub with_ansi: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_file_and_line: false,
            with_thread_names: false,
            with_ansi: true,
        }
    }
}

impl LoggingSettings {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Settings from the `[logging]` section.
    pub fn from_config(config: &ArchiverConfig) -> ArchiverResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.logging.level)?,
            format: config.logging.format.parse()?,
            ..Default::default()
        })
    }

    /// Override the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// [`init`] with the settings from the `[logging]` section.
pub fn init_from_config(config: &ArchiverConfig) -> ArchiverResult<()> {
    init(LoggingSettings::from_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed this returns `Ok(())`, which
/// keeps it safe to call from tests.
pub fn init(settings: LoggingSettings) -> ArchiverResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.to_string().to_lowercase()));

    let layer = match settings.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_thread_names(settings.with_thread_names)
            .with_ansi(settings.with_ansi)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_thread_names(settings.with_thread_names)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_thread_names(settings.with_thread_names)
            .boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(ArchiverError::Configuration(format!(
            "Failed to initialize tracing: {e}"
        ))),
    }
}

/// Parse a log level name, case-insensitively.
pub fn parse_log_level(level: &str) -> ArchiverResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ArchiverError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("Compact".parse::<OutputFormat>().unwrap(), OutputFormat::Compact);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_settings_builder() {
        let settings = LoggingSettings::new(Level::WARN)
            .with_format(OutputFormat::Json)
            .with_ansi(false);
        assert_eq!(settings.level, Level::WARN);
        assert_eq!(settings.format, OutputFormat::Json);
        assert!(!settings.with_ansi);
    }

    #[test]
    fn test_settings_from_config() {
        let raw = serde_json::json!({
            "source": { "identifier": "test" },
            "storage": { "base_directory": "/data", "flush_interval_secs": 1 },
        });
        let mut config: ArchiverConfig =
            figment::Figment::from(figment::providers::Serialized::defaults(raw))
                .extract()
                .unwrap();
        config.logging.level = "debug".to_string();
        config.logging.format = "json".to_string();

        let settings = LoggingSettings::from_config(&config).unwrap();
        assert_eq!(settings.level, Level::DEBUG);
        assert_eq!(settings.format, OutputFormat::Json);

        config.logging.format = "xml".to_string();
        assert!(LoggingSettings::from_config(&config).is_err());
    }
}
