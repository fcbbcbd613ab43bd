//! CLI entry point for the sample archiver.
//!
//! Reads raw bytes from stdin and archives them with the configured flush
//! settings. Each read from stdin becomes one sample.
//!
//! # Usage
//!
//! ```bash
//! some-instrument-reader | sample-archiver --config config/archiver.toml
//! sample-archiver --config config/archiver.toml --log-format json --discover autosample
//! ```
//!
//! On EOF or Ctrl-C the archiver stops autosampling, waits for the final flush and
//! exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::BytesMut;
use clap::{Parser, ValueEnum};
use sample_archiver::config::ArchiverConfig;
use sample_archiver::data::persister::FilePersister;
use sample_archiver::logging::{self, LoggingSettings, OutputFormat};
use sample_archiver::protocol::{
    DiscoverHint, DriverHandle, ProtocolDriver, ProtocolState, TracingEventSink,
};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "sample-archiver")]
#[command(about = "Archive a raw sample stream from stdin into timed data files", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: PathBuf,

    /// Override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormatArg>,

    /// State reported by the source at startup
    #[arg(long, value_enum, default_value = "command")]
    discover: DiscoverArg,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum DiscoverArg {
    Command,
    Autosample,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ArchiverConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    let mut settings = LoggingSettings::from_config(&config)?;
    if let Some(format) = cli.log_format {
        settings = settings.with_format(match format {
            LogFormatArg::Pretty => OutputFormat::Pretty,
            LogFormatArg::Compact => OutputFormat::Compact,
            LogFormatArg::Json => OutputFormat::Json,
        });
    }
    logging::init(settings)?;

    let flush_config = config.flush_config()?;
    let stop_timeout = flush_config.persist_timeout() + Duration::from_secs(5);
    let driver = ProtocolDriver::spawn(
        flush_config,
        Arc::new(FilePersister::new()),
        Arc::new(TracingEventSink),
        config.protocol.mailbox_capacity,
    )?;

    let hint = match cli.discover {
        DiscoverArg::Command => DiscoverHint::Command,
        DiscoverArg::Autosample => DiscoverHint::Autosample,
    };
    if driver.discover(hint).await? == ProtocolState::Command {
        driver.start_autosample().await?;
    }

    tokio::select! {
        result = pump_stdin(&driver) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    stop(&driver, stop_timeout).await;
    driver.shutdown().await?;
    Ok(())
}

/// Forward stdin to the driver until EOF.
async fn pump_stdin(driver: &DriverHandle) -> Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut buf = BytesMut::with_capacity(READ_CHUNK_BYTES);
    loop {
        buf.reserve(READ_CHUNK_BYTES);
        let read = stdin.read_buf(&mut buf).await.context("reading stdin")?;
        if read == 0 {
            info!("End of input");
            return Ok(());
        }
        let chunk = buf.split().freeze();
        match driver.on_raw_data(chunk, chrono::Utc::now()).await {
            Ok(()) => {}
            Err(e) if !e.is_recoverable() => return Err(e.into()),
            Err(e) => debug!("Sample not buffered: {}", e),
        }
    }
}

async fn stop(driver: &DriverHandle, timeout: Duration) {
    match driver.stop_autosample().await {
        Ok(ProtocolState::Command) => {}
        Ok(_) => {
            if let Err(e) = driver.wait_for_state(ProtocolState::Command, timeout).await {
                warn!("Final flush did not complete: {}", e);
            }
        }
        Err(e) => warn!("Could not stop autosampling: {}", e),
    }
}
