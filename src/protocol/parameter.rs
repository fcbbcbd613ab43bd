//! Driver parameters exposed through `get`/`set`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::FlushConfig;
use crate::error::{ArchiverError, ArchiverResult};

/// Parameters of the flush configuration that the orchestration layer can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parameter {
    /// Reference designator, used as the per-source directory name
    #[serde(rename = "REFDES")]
    SourceIdentifier,
    /// Upstream source selection regex
    #[serde(rename = "SOURCE_REGEX")]
    SourceFilterPattern,
    /// Root directory for data files
    #[serde(rename = "FILE_LOCATION")]
    BaseDirectory,
    /// Seconds between flushes
    #[serde(rename = "FLUSH_INTERVAL")]
    FlushInterval,
}

impl Parameter {
    /// Every parameter.
    pub const ALL: [Parameter; 4] = [
        Parameter::SourceIdentifier,
        Parameter::SourceFilterPattern,
        Parameter::BaseDirectory,
        Parameter::FlushInterval,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Parameter::SourceIdentifier => "REFDES",
            Parameter::SourceFilterPattern => "SOURCE_REGEX",
            Parameter::BaseDirectory => "FILE_LOCATION",
            Parameter::FlushInterval => "FLUSH_INTERVAL",
        }
    }

    /// Read the current value from `config`.
    pub fn read(&self, config: &FlushConfig) -> ParameterValue {
        match self {
            Parameter::SourceIdentifier => {
                ParameterValue::Text(config.source_identifier().to_string())
            }
            Parameter::SourceFilterPattern => {
                ParameterValue::Text(config.source_filter_pattern().to_string())
            }
            Parameter::BaseDirectory => {
                ParameterValue::Path(config.base_directory().to_path_buf())
            }
            Parameter::FlushInterval => {
                ParameterValue::Seconds(config.flush_interval().as_secs())
            }
        }
    }

    /// Validate `value` and store it in `config`. `config` is untouched on error.
    pub fn apply(&self, config: &mut FlushConfig, value: ParameterValue) -> ArchiverResult<()> {
        let rejected = |reason: String| ArchiverError::InvalidParameter {
            parameter: self.as_str().to_string(),
            reason,
        };
        let relabel = |err: ArchiverError| match err {
            ArchiverError::Configuration(reason) => rejected(reason),
            other => other,
        };

        match (self, value) {
            (Parameter::SourceIdentifier, ParameterValue::Text(text)) => {
                config.set_source_identifier(text).map_err(relabel)
            }
            (Parameter::SourceFilterPattern, ParameterValue::Text(text)) => {
                config.set_source_filter_pattern(text).map_err(relabel)
            }
            (Parameter::BaseDirectory, ParameterValue::Path(path)) => {
                config.set_base_directory(path).map_err(relabel)
            }
            (Parameter::BaseDirectory, ParameterValue::Text(text)) => {
                config.set_base_directory(PathBuf::from(text)).map_err(relabel)
            }
            (Parameter::FlushInterval, ParameterValue::Seconds(secs)) => config
                .set_flush_interval(Duration::from_secs(secs))
                .map_err(relabel),
            (Parameter::FlushInterval, ParameterValue::Text(text)) => {
                let secs = text
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| rejected(format!("'{text}' is not a whole number of seconds: {e}")))?;
                config
                    .set_flush_interval(Duration::from_secs(secs))
                    .map_err(relabel)
            }
            (_, other) => Err(rejected(format!("unexpected value type: {other:?}"))),
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Parameter {
    type Err = ArchiverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Parameter::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ArchiverError::InvalidParameter {
                parameter: s.to_string(),
                reason: "unknown parameter".to_string(),
            })
    }
}

/// Value carried by `get`/`set`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Whole seconds, for intervals
    Seconds(u64),
    /// Identifiers and patterns
    Text(String),
    /// Filesystem locations
    Path(PathBuf),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Seconds(secs) => write!(f, "{secs}"),
            ParameterValue::Path(path) => write!(f, "{}", path.display()),
            ParameterValue::Text(text) => f.write_str(text),
        }
    }
}
