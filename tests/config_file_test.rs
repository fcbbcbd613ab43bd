//! The shipped configuration file must load and validate.

use std::path::PathBuf;
use std::time::Duration;

use sample_archiver::config::ArchiverConfig;
use sample_archiver::data::sample::{FrameFormat, MalformedDataPolicy};
use sample_archiver::logging::{LoggingSettings, OutputFormat};

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/archiver.toml")
}

#[test]
fn shipped_config_is_valid() {
    let config = ArchiverConfig::load_from(shipped_config()).unwrap();
    config.validate().unwrap();

    let flush = config.flush_config().unwrap();
    assert_eq!(flush.source_identifier(), "refdes-01");
    assert_eq!(flush.flush_interval(), Duration::from_secs(60));
    assert_eq!(flush.persist_timeout(), Duration::from_secs(30));
    assert_eq!(flush.malformed_data_policy(), MalformedDataPolicy::DropAndLog);
    assert_eq!(flush.frame_format(), FrameFormat::Opaque);
    assert_eq!(
        flush.source_directory(),
        PathBuf::from("./archive_data/refdes-01")
    );

    let logging = LoggingSettings::from_config(&config).unwrap();
    assert_eq!(logging.format, OutputFormat::Pretty);
}
