//! Message types for talking to the protocol driver task.
//!
//! Every [`DriverCommand`] carries a `oneshot::Sender` for its reply. The helper
//! constructors build the command together with the matching receiver:
//!
//! ```rust
//! use sample_archiver::protocol::messages::DriverCommand;
//!
//! let (cmd, rx) = DriverCommand::start_autosample();
//! // command_tx.send(cmd).await?;
//! // let state = rx.await??;
//! # drop((cmd, rx));
//! ```

use tokio::sync::oneshot;

use super::machine::DriverStatus;
use super::parameter::{Parameter, ParameterValue};
use super::state::{Capability, DiscoverHint, ProtocolState};
use crate::data::sample::RawSample;
use crate::error::ArchiverResult;

/// Reply to a state-changing command: the state after it was handled.
pub type StateReply = oneshot::Sender<ArchiverResult<ProtocolState>>;

/// Commands accepted by the driver task.
///
/// State-changing commands reply with the state the driver is in once the command
/// has been handled, or the error that rejected it.
#[derive(Debug)]
pub enum DriverCommand {
    /// One decoded chunk from the transport
    RawData {
        /// Chunk with its arrival time
        sample: RawSample,
        /// Whether the chunk was buffered
        response: oneshot::Sender<ArchiverResult<()>>,
    },
    /// Report the state the source is in at startup.
    Discover {
        /// State the source reported
        hint: DiscoverHint,
        /// `Command` or `Autosample`
        response: StateReply,
    },
    /// Begin buffering and arm the flush timer.
    StartAutosample {
        /// `Autosample` on success
        response: StateReply,
    },
    /// Cancel the timer and run the final flush.
    StopAutosample {
        /// `Stopping` while the final flush runs, else `Command`
        response: StateReply,
    },
    /// Retry the failed write immediately.
    ///
    /// Answered once the retry outcome is known.
    ClearWriteError {
        /// `Command` if the retry succeeded, `WriteError` if it failed
        response: StateReply,
    },
    /// Flush now instead of on the next tick.
    Flush {
        /// Current state
        response: StateReply,
    },
    /// Read one parameter.
    Get {
        /// Parameter to read
        parameter: Parameter,
        /// Current value
        response: oneshot::Sender<ParameterValue>,
    },
    /// Change one parameter. Only accepted while idle.
    Set {
        /// Parameter to change
        parameter: Parameter,
        /// New value, validated before it is applied
        value: ParameterValue,
        /// Validation or state error
        response: oneshot::Sender<ArchiverResult<()>>,
    },
    /// Commands accepted in the current state.
    GetCapabilities {
        /// Capability list
        response: oneshot::Sender<Vec<Capability>>,
    },
    /// Diagnostics snapshot.
    GetStatus {
        /// Status at the time the command was handled
        response: oneshot::Sender<DriverStatus>,
    },
    /// Flush what can be flushed and stop the task.
    Shutdown {
        /// Sent after the task has finished shutting down
        response: oneshot::Sender<()>,
    },
}

impl DriverCommand {
    /// Build a [`DriverCommand::RawData`] and its reply receiver.
    pub fn raw_data(sample: RawSample) -> (Self, oneshot::Receiver<ArchiverResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::RawData {
                sample,
                response: tx,
            },
            rx,
        )
    }

    /// Build a [`DriverCommand::Discover`] and its reply receiver.
    pub fn discover(hint: DiscoverHint) -> (Self, oneshot::Receiver<ArchiverResult<ProtocolState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Discover { hint, response: tx }, rx)
    }

    /// Build a [`DriverCommand::StartAutosample`] and its reply receiver.
    pub fn start_autosample() -> (Self, oneshot::Receiver<ArchiverResult<ProtocolState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartAutosample { response: tx }, rx)
    }

    /// Build a [`DriverCommand::StopAutosample`] and its reply receiver.
    pub fn stop_autosample() -> (Self, oneshot::Receiver<ArchiverResult<ProtocolState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopAutosample { response: tx }, rx)
    }

    /// Build a [`DriverCommand::ClearWriteError`] and its reply receiver.
    pub fn clear_write_error() -> (Self, oneshot::Receiver<ArchiverResult<ProtocolState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ClearWriteError { response: tx }, rx)
    }

    /// Build a [`DriverCommand::Flush`] and its reply receiver.
    pub fn flush() -> (Self, oneshot::Receiver<ArchiverResult<ProtocolState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Flush { response: tx }, rx)
    }

    /// Build a [`DriverCommand::Get`] and its reply receiver.
    pub fn get(parameter: Parameter) -> (Self, oneshot::Receiver<ParameterValue>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Get {
                parameter,
                response: tx,
            },
            rx,
        )
    }

    /// Build a [`DriverCommand::Set`] and its reply receiver.
    pub fn set(
        parameter: Parameter,
        value: ParameterValue,
    ) -> (Self, oneshot::Receiver<ArchiverResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Set {
                parameter,
                value,
                response: tx,
            },
            rx,
        )
    }

    /// Build a [`DriverCommand::GetCapabilities`] and its reply receiver.
    pub fn get_capabilities() -> (Self, oneshot::Receiver<Vec<Capability>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetCapabilities { response: tx }, rx)
    }

    /// Build a [`DriverCommand::GetStatus`] and its reply receiver.
    pub fn get_status() -> (Self, oneshot::Receiver<DriverStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    /// Build a [`DriverCommand::Shutdown`] and its reply receiver.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
