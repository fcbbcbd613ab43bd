//! # Sample Archiver
//!
//! Ingests a continuous stream of raw sensor packets, accumulates them in memory and
//! periodically writes everything received since the previous flush to a new data
//! file. Write failures are tracked as a recoverable protocol state: the unwritten
//! samples are kept and retried, so nothing is lost or written twice.
//!
//! ## Crate Structure
//!
//! - **`config`**: TOML + environment configuration (`figment`) and the validated
//!   `FlushConfig`.
//! - **`data`**: `RawSample`, the append-only `SampleBuffer` and the `Persister` trait
//!   with its file-based implementation.
//! - **`protocol`**: the state machine, the flush timer and the driver task that ties
//!   data arrival, commands, ticks and persist results together.
//! - **`error`**: the crate-wide `ArchiverError`.
//! - **`logging`**: `tracing-subscriber` setup.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sample_archiver::config::FlushConfig;
//! use sample_archiver::data::persister::FilePersister;
//! use sample_archiver::protocol::{DiscoverHint, ProtocolDriver, TracingEventSink};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = FlushConfig::new("refdes-01", ".*", "/data", Duration::from_secs(60))?;
//! let driver = ProtocolDriver::spawn(
//!     config,
//!     Arc::new(FilePersister::new()),
//!     Arc::new(TracingEventSink),
//!     1024,
//! )?;
//! driver.discover(DiscoverHint::Autosample).await?;
//! driver.on_raw_data(&b"packet"[..], chrono::Utc::now()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod protocol;

pub use config::{ArchiverConfig, FlushConfig};
pub use error::{ArchiverError, ArchiverResult, WriteFailure, WriteFailureKind};
