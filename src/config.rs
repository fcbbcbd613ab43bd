//! Archiver configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `ARCHIVER_` (nested keys split on `__`)
//!
//! The loaded [`ArchiverConfig`] is validated and then resolved into the
//! [`FlushConfig`] consumed by the protocol driver.
//!
//! # Example
//! ```no_run
//! use sample_archiver::config::ArchiverConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ArchiverConfig::load_from("config/archiver.toml")?;
//! config.validate()?;
//! let flush = config.flush_config()?;
//! println!("Archiving {} every {:?}", flush.source_identifier(), flush.flush_interval());
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::data::sample::{FrameFormat, MalformedDataPolicy};
use crate::error::{ArchiverError, ArchiverResult};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiverConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSection,
    /// Data source identity
    pub source: SourceSection,
    /// Output and flush settings
    pub storage: StorageSection,
    /// State machine behaviour
    #[serde(default)]
    pub protocol: ProtocolSection,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Source identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
    /// Reference designator; also the per-source output directory name
    pub identifier: String,
    /// Upstream source selection regex (opaque to the archiver, validated only)
    #[serde(default = "default_filter_pattern")]
    pub filter_pattern: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Root directory for data files
    pub base_directory: PathBuf,
    /// Flush interval in seconds (> 0)
    pub flush_interval_secs: u64,
    /// Upper bound on a single persist in seconds (> 0)
    #[serde(default = "default_persist_timeout")]
    pub persist_timeout_secs: u64,
    /// Extension of written data files
    #[serde(default = "default_extension")]
    pub file_extension: String,
    /// Buffer cap in bytes (0 = unbounded)
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
}

/// Protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSection {
    /// What to do with chunks that fail structural validation
    #[serde(default)]
    pub malformed_data: MalformedDataPolicy,
    /// Structural check applied to incoming chunks
    #[serde(default)]
    pub frame_format: FrameFormat,
    /// Driver command mailbox capacity
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_filter_pattern() -> String {
    ".*".to_string()
}

fn default_persist_timeout() -> u64 {
    30
}

fn default_extension() -> String {
    "dat".to_string()
}

fn default_max_buffered_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_mailbox_capacity() -> usize {
    1024
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            malformed_data: MalformedDataPolicy::default(),
            frame_format: FrameFormat::default(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl ArchiverConfig {
    /// Load configuration from a TOML file and `ARCHIVER_` environment variables
    ///
    /// Example override: `ARCHIVER_STORAGE__FLUSH_INTERVAL_SECS=5`
    pub fn load_from<P: AsRef<Path>>(path: P) -> ArchiverResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ARCHIVER_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> ArchiverResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ArchiverError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(ArchiverError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        if self.protocol.mailbox_capacity == 0 {
            return Err(ArchiverError::Configuration(
                "mailbox_capacity must be greater than 0".to_string(),
            ));
        }

        self.flush_config().map(|_| ())
    }

    /// Resolve the core flush configuration
    pub fn flush_config(&self) -> ArchiverResult<FlushConfig> {
        let config = FlushConfig::new(
            self.source.identifier.clone(),
            self.source.filter_pattern.clone(),
            self.storage.base_directory.clone(),
            Duration::from_secs(self.storage.flush_interval_secs),
        )?
        .with_persist_timeout(Duration::from_secs(self.storage.persist_timeout_secs))?
        .with_file_extension(self.storage.file_extension.clone())?
        .with_max_buffered_bytes(self.storage.max_buffered_bytes)
        .with_malformed_data_policy(self.protocol.malformed_data)
        .with_frame_format(self.protocol.frame_format);
        Ok(config)
    }
}

/// Resolved configuration consumed by the state machine and the persister.
///
/// Every constructor enforces the invariants, so a `FlushConfig` in hand is always valid.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushConfig {
    source_identifier: String,
    source_filter_pattern: String,
    base_directory: PathBuf,
    flush_interval: Duration,
    persist_timeout: Duration,
    file_extension: String,
    max_buffered_bytes: usize,
    malformed_data: MalformedDataPolicy,
    frame_format: FrameFormat,
}

impl FlushConfig {
    /// Build a configuration with default timeout, extension, cap and policies.
    ///
    /// # Errors
    ///
    /// [`ArchiverError::Configuration`] if the identifier is not a single path
    /// component, the filter is not a valid regex, the base directory is empty or
    /// the interval is zero.
    pub fn new(
        source_identifier: impl Into<String>,
        source_filter_pattern: impl Into<String>,
        base_directory: impl Into<PathBuf>,
        flush_interval: Duration,
    ) -> ArchiverResult<Self> {
        let config = Self {
            source_identifier: source_identifier.into(),
            source_filter_pattern: source_filter_pattern.into(),
            base_directory: base_directory.into(),
            flush_interval,
            persist_timeout: Duration::from_secs(default_persist_timeout()),
            file_extension: default_extension(),
            max_buffered_bytes: default_max_buffered_bytes(),
            malformed_data: MalformedDataPolicy::default(),
            frame_format: FrameFormat::default(),
        };
        validate_identifier(&config.source_identifier)?;
        validate_filter(&config.source_filter_pattern)?;
        validate_base_directory(&config.base_directory)?;
        validate_interval("flush_interval", config.flush_interval)?;
        Ok(config)
    }

    /// Longest a single write may take before it counts as failed.
    pub fn with_persist_timeout(mut self, timeout: Duration) -> ArchiverResult<Self> {
        validate_interval("persist_timeout", timeout)?;
        self.persist_timeout = timeout;
        Ok(self)
    }

    /// Data file extension, without the dot.
    pub fn with_file_extension(mut self, extension: impl Into<String>) -> ArchiverResult<Self> {
        let extension = extension.into();
        if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ArchiverError::Configuration(format!(
                "file_extension '{extension}' must be non-empty ASCII alphanumeric"
            )));
        }
        self.file_extension = extension;
        Ok(self)
    }

    /// Buffer cap in bytes, 0 for unbounded.
    pub fn with_max_buffered_bytes(mut self, max_bytes: usize) -> Self {
        self.max_buffered_bytes = max_bytes;
        self
    }

    /// What to do with chunks that fail validation.
    pub fn with_malformed_data_policy(mut self, policy: MalformedDataPolicy) -> Self {
        self.malformed_data = policy;
        self
    }

    /// Structural check applied to incoming chunks.
    pub fn with_frame_format(mut self, format: FrameFormat) -> Self {
        self.frame_format = format;
        self
    }

    /// Reference designator, also the per-source directory name.
    pub fn source_identifier(&self) -> &str {
        &self.source_identifier
    }

    /// Regex selecting the source's packets upstream.
    pub fn source_filter_pattern(&self) -> &str {
        &self.source_filter_pattern
    }

    /// Root directory for data files.
    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    /// Time between timed flushes.
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Limit on a single write.
    pub fn persist_timeout(&self) -> Duration {
        self.persist_timeout
    }

    /// Data file extension.
    pub fn file_extension(&self) -> &str {
        &self.file_extension
    }

    /// Buffer cap in bytes, 0 when unbounded.
    pub fn max_buffered_bytes(&self) -> usize {
        self.max_buffered_bytes
    }

    /// Policy for chunks that fail validation.
    pub fn malformed_data_policy(&self) -> MalformedDataPolicy {
        self.malformed_data
    }

    /// Structural check applied to incoming chunks.
    pub fn frame_format(&self) -> FrameFormat {
        self.frame_format
    }

    /// `base_directory/source_identifier`
    pub fn source_directory(&self) -> PathBuf {
        self.base_directory.join(&self.source_identifier)
    }

    pub(crate) fn set_source_identifier(&mut self, value: String) -> ArchiverResult<()> {
        validate_identifier(&value)?;
        self.source_identifier = value;
        Ok(())
    }

    pub(crate) fn set_source_filter_pattern(&mut self, value: String) -> ArchiverResult<()> {
        validate_filter(&value)?;
        self.source_filter_pattern = value;
        Ok(())
    }

    pub(crate) fn set_base_directory(&mut self, value: PathBuf) -> ArchiverResult<()> {
        validate_base_directory(&value)?;
        self.base_directory = value;
        Ok(())
    }

    pub(crate) fn set_flush_interval(&mut self, value: Duration) -> ArchiverResult<()> {
        validate_interval("flush_interval", value)?;
        self.flush_interval = value;
        Ok(())
    }
}

fn validate_identifier(identifier: &str) -> ArchiverResult<()> {
    let single_component = !identifier.is_empty()
        && identifier != "."
        && identifier != ".."
        && !identifier.contains(['/', '\\', '\0']);
    if single_component {
        Ok(())
    } else {
        Err(ArchiverError::Configuration(format!(
            "source identifier '{identifier}' must be a single, non-empty path component"
        )))
    }
}

fn validate_filter(pattern: &str) -> ArchiverResult<()> {
    regex::Regex::new(pattern).map(|_| ()).map_err(|e| {
        ArchiverError::Configuration(format!("source filter pattern '{pattern}' is invalid: {e}"))
    })
}

fn validate_base_directory(path: &Path) -> ArchiverResult<()> {
    if path.as_os_str().is_empty() {
        return Err(ArchiverError::Configuration(
            "base directory cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_interval(name: &str, value: Duration) -> ArchiverResult<()> {
    if value.is_zero() {
        return Err(ArchiverError::Configuration(format!(
            "{name} must be greater than 0"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ArchiverConfig {
        ArchiverConfig {
            logging: LoggingSection::default(),
            source: SourceSection {
                identifier: "test".to_string(),
                filter_pattern: ".*".to_string(),
            },
            storage: StorageSection {
                base_directory: PathBuf::from("./archive_data"),
                flush_interval_secs: 10,
                persist_timeout_secs: 30,
                file_extension: "dat".to_string(),
                max_buffered_bytes: 1024,
            },
            protocol: ProtocolSection::default(),
        }
    }

    #[test]
    fn test_config_validation() {
        let config = test_config();
        assert!(config.validate().is_ok());

        let flush = config.flush_config().unwrap();
        assert_eq!(flush.flush_interval(), Duration::from_secs(10));
        assert_eq!(flush.max_buffered_bytes(), 1024);
        assert_eq!(
            flush.source_directory(),
            PathBuf::from("./archive_data").join("test")
        );
    }

    #[test]
    fn test_zero_flush_interval_is_fatal() {
        let mut config = test_config();
        config.storage.flush_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ArchiverError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = test_config();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identifier_must_be_single_component() {
        for bad in ["", "..", "a/b", "a\\b"] {
            let result = FlushConfig::new(bad, ".*", "/data", Duration::from_secs(1));
            assert!(result.is_err(), "identifier {bad:?} should be rejected");
        }
    }

    #[test]
    fn test_invalid_filter_regex() {
        let result = FlushConfig::new("test", "([", "/data", Duration::from_secs(1));
        assert!(matches!(result, Err(ArchiverError::Configuration(_))));
    }

    #[test]
    fn test_load_from_toml_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "archiver.toml",
                r#"
                [source]
                identifier = "refdes-01"

                [storage]
                base_directory = "./antelope_data"
                flush_interval_secs = 60

                [protocol]
                malformed_data = "halt"
                frame_format = "length_prefixed"
                "#,
            )?;
            jail.set_env("ARCHIVER_STORAGE__FLUSH_INTERVAL_SECS", "5");

            let config = ArchiverConfig::load_from("archiver.toml")
                .map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(config.storage.flush_interval_secs, 5);
            assert_eq!(config.source.filter_pattern, ".*");
            assert_eq!(config.protocol.malformed_data, MalformedDataPolicy::Halt);
            assert_eq!(config.protocol.frame_format, FrameFormat::LengthPrefixed);
            assert!(config.validate().is_ok());
            Ok(())
        });
    }
}
