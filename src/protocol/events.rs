//! Outbound notifications and the sinks that receive them.
//!
//! The driver reports three things to the outside world:
//! - a [`SampleEvent`] for every file written (at most once per successful flush),
//! - an [`ErrorEvent`] when it enters an error state or rejects data on overflow,
//! - a state change on every transition.
//!
//! Publication to a real event bus is out of scope; [`ChannelEventSink`] hands events
//! to whoever holds the receiving end, and [`TracingEventSink`] logs them.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info};

use super::state::ProtocolState;
use crate::data::persister::PersistReceipt;
use crate::error::WriteFailure;

/// A data file was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEvent {
    /// Source the samples came from
    pub source_identifier: String,
    /// Data file that was written
    pub file_path: PathBuf,
    /// Samples in the file
    pub sample_count: usize,
    /// Payload bytes in the file
    pub byte_count: usize,
    /// When the flush was taken
    pub timestamp: DateTime<Utc>,
    /// Arrival time of the oldest sample in the file
    pub first_arrival: Option<DateTime<Utc>>,
    /// Arrival time of the newest sample in the file
    pub last_arrival: Option<DateTime<Utc>>,
}

impl SampleEvent {
    /// Event for a persisted batch from `source_identifier`.
    pub fn from_receipt(source_identifier: &str, receipt: PersistReceipt) -> Self {
        Self {
            source_identifier: source_identifier.to_string(),
            file_path: receipt.file_path,
            sample_count: receipt.sample_count,
            byte_count: receipt.byte_count,
            timestamp: receipt.timestamp,
            first_arrival: receipt.first_arrival,
            last_arrival: receipt.last_arrival,
        }
    }
}

/// Category of an [`ErrorEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// A flush could not be written
    WriteFailure,
    /// A chunk failed validation under the halt policy
    MalformedData,
    /// The buffer cap was hit and new samples are being rejected
    BufferOverflow,
}

/// Something went wrong that the operator should know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// What went wrong
    pub kind: ErrorKind,
    /// State after the error was handled
    pub state: ProtocolState,
    /// Human-readable detail
    pub message: String,
    /// Samples still held in memory
    pub retained_samples: usize,
    /// When the error was raised
    pub timestamp: DateTime<Utc>,
}

impl ErrorEvent {
    /// Error event stamped with the current time.
    pub fn new(
        kind: ErrorKind,
        state: ProtocolState,
        message: impl Into<String>,
        retained_samples: usize,
    ) -> Self {
        Self {
            kind,
            state,
            message: message.into(),
            retained_samples,
            timestamp: Utc::now(),
        }
    }

    /// `WRITE_FAILURE` event describing `failure`.
    pub fn write_failure(state: ProtocolState, failure: &WriteFailure, retained: usize) -> Self {
        Self::new(ErrorKind::WriteFailure, state, failure.to_string(), retained)
    }
}

/// Everything a sink can receive, in one serialisable envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverEvent {
    /// A data file was written
    Sample(SampleEvent),
    /// An error was reported
    Error(ErrorEvent),
    /// The protocol state changed
    StateChange {
        /// Previous state
        from: ProtocolState,
        /// New state
        to: ProtocolState,
    },
}

/// Receiver of driver notifications.
///
/// Called from the driver task; implementations must not block.
pub trait EventSink: Send + Sync + 'static {
    /// A data file was written.
    fn emit_sample(&self, event: SampleEvent);

    /// An error occurred.
    fn emit_error(&self, event: ErrorEvent);

    /// Called after every state transition. Ignored by default.
    fn state_changed(&self, _from: ProtocolState, _to: ProtocolState) {}
}

/// Forwards every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<DriverEvent>,
}

impl ChannelEventSink {
    /// Sink plus the receiver its events arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: DriverEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelEventSink {
    fn emit_sample(&self, event: SampleEvent) {
        self.send(DriverEvent::Sample(event));
    }

    fn emit_error(&self, event: ErrorEvent) {
        self.send(DriverEvent::Error(event));
    }

    fn state_changed(&self, from: ProtocolState, to: ProtocolState) {
        self.send(DriverEvent::StateChange { from, to });
    }
}

/// Logs events as structured `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit_sample(&self, event: SampleEvent) {
        info!(
            source = %event.source_identifier,
            path = %event.file_path.display(),
            samples = event.sample_count,
            bytes = event.byte_count,
            "SAMPLE"
        );
    }

    fn emit_error(&self, event: ErrorEvent) {
        error!(
            kind = ?event.kind,
            state = %event.state,
            retained = event.retained_samples,
            "{}",
            event.message
        );
    }

    fn state_changed(&self, from: ProtocolState, to: ProtocolState) {
        info!(%from, %to, "State change");
    }
}
