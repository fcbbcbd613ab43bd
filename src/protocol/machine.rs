//! Sans-IO protocol state machine.
//!
//! [`ProtocolStateMachine`] owns the sample buffer and the flush configuration but
//! performs no I/O and never sleeps. Every input is a [`ProtocolEvent`]; the machine
//! updates its state and queues [`Action`]s that the driver executes afterwards
//! (start a persist, notify the sink, arm or cancel the timer). This keeps every
//! transition synchronous and testable without a runtime.
//!
//! # Flush Bookkeeping
//!
//! At most one batch is in flight. The machine keeps its own handle on that batch
//! until [`ProtocolEvent::PersistCompleted`] arrives, so a failed (or timed-out, or
//! aborted) write can always put the samples back with
//! [`SampleBuffer::restore_front`]. Flush requests that arrive while a batch is in
//! flight are coalesced: the next flush picks up everything buffered meanwhile.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::events::{ErrorEvent, ErrorKind, SampleEvent};
use super::parameter::{Parameter, ParameterValue};
use super::state::{capabilities, Capability, DiscoverHint, ProtocolState};
use crate::config::FlushConfig;
use crate::data::buffer::{SampleBatch, SampleBuffer};
use crate::data::persister::PersistReceipt;
use crate::data::sample::{MalformedDataPolicy, RawSample};
use crate::error::{ArchiverError, ArchiverResult, WriteFailure};

/// Inputs to the state machine.
#[derive(Debug)]
pub enum ProtocolEvent {
    /// Startup state reported by the source
    Discover(DiscoverHint),
    /// Begin streaming
    StartAutosample,
    /// End streaming with a final flush
    StopAutosample,
    /// Operator acknowledged a write error
    ClearWriteError,
    /// Manual flush, same effect as a timer tick
    Flush,
    /// Flush timer fired
    Tick,
    /// One chunk from the transport
    Data(RawSample),
    /// A persist worker finished
    PersistCompleted {
        /// Batch the worker was writing
        batch_id: u64,
        /// Receipt or failure
        result: Result<PersistReceipt, WriteFailure>,
    },
}

impl ProtocolEvent {
    fn name(&self) -> &'static str {
        match self {
            ProtocolEvent::Discover(_) => Capability::Discover.as_str(),
            ProtocolEvent::StartAutosample => Capability::StartAutosample.as_str(),
            ProtocolEvent::StopAutosample => Capability::StopAutosample.as_str(),
            ProtocolEvent::ClearWriteError => Capability::ClearWriteError.as_str(),
            ProtocolEvent::Flush => Capability::Flush.as_str(),
            ProtocolEvent::Tick => "TICK",
            ProtocolEvent::Data(_) => "DATA",
            ProtocolEvent::PersistCompleted { .. } => "PERSIST_COMPLETED",
        }
    }
}

/// Side effects requested by the machine, executed in order by the driver.
#[derive(Debug)]
pub enum Action {
    /// Hand the batch to a persist worker
    Persist(SampleBatch),
    /// Report a written file
    EmitSample(SampleEvent),
    /// Report an error
    EmitError(ErrorEvent),
    /// Publish a transition
    StateChanged {
        /// Previous state
        from: ProtocolState,
        /// New state
        to: ProtocolState,
    },
    /// Start ticking with the given period
    ArmTimer(Duration),
    /// Stop ticking
    CancelTimer,
    /// Answer every pending `clear_write_error` with the state it ended in
    SettleClear(ProtocolState),
}

/// Why a batch was sent to the persister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushCause {
    /// Flush timer
    Tick,
    /// `flush` command
    Manual,
    /// Last flush of a stop
    Final,
    /// Timer retry while in `WriteError`
    Retry,
    /// Retry requested by `clear_write_error`
    ClearRetry,
}

#[derive(Debug)]
struct InFlight {
    batch: SampleBatch,
    cause: FlushCause,
}

/// Snapshot of the machine for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverStatus {
    /// Current protocol state
    pub state: ProtocolState,
    /// Samples waiting for the next flush
    pub buffered_samples: usize,
    /// Payload bytes waiting for the next flush
    pub buffered_bytes: usize,
    /// Size of the batch being written, if any
    pub in_flight_samples: Option<usize>,
    /// Why that batch was flushed
    pub in_flight_cause: Option<FlushCause>,
    /// Samples refused because the buffer was full
    pub rejected_samples: u64,
    /// Data files written since startup
    pub files_written: u64,
    /// Most recent data file
    pub last_file: Option<PathBuf>,
    /// Most recent unresolved failure
    pub last_error: Option<String>,
}

/// The archiver protocol. See [`super::state`] for the state diagram.
pub struct ProtocolStateMachine {
    state: ProtocolState,
    config: FlushConfig,
    buffer: SampleBuffer,
    in_flight: Option<InFlight>,
    /// State the current `WriteError` was entered from
    fault_origin: ProtocolState,
    clear_waiting: bool,
    next_batch_id: u64,
    files_written: u64,
    last_file: Option<PathBuf>,
    last_error: Option<String>,
    actions: Vec<Action>,
}

impl ProtocolStateMachine {
    /// Machine in `Unknown` with an empty buffer.
    pub fn new(config: FlushConfig) -> Self {
        let buffer = SampleBuffer::with_limit(config.max_buffered_bytes());
        Self {
            state: ProtocolState::Unknown,
            config,
            buffer,
            in_flight: None,
            fault_origin: ProtocolState::Autosample,
            clear_waiting: false,
            next_batch_id: 0,
            files_written: 0,
            last_file: None,
            last_error: None,
            actions: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Active flush configuration.
    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    /// Samples not yet handed to a persist worker.
    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Commands accepted in the current state.
    pub fn capabilities(&self) -> &'static [Capability] {
        capabilities(self.state)
    }

    /// Whether a persist is outstanding.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Diagnostics snapshot.
    pub fn status(&self) -> DriverStatus {
        let stats = self.buffer.stats();
        DriverStatus {
            state: self.state,
            buffered_samples: stats.samples,
            buffered_bytes: stats.bytes,
            in_flight_samples: self.in_flight.as_ref().map(|f| f.batch.len()),
            in_flight_cause: self.in_flight.as_ref().map(|f| f.cause),
            rejected_samples: stats.rejected_samples,
            files_written: self.files_written,
            last_file: self.last_file.clone(),
            last_error: self.last_error.clone(),
        }
    }

    /// Take the actions queued by the last calls to [`handle`](Self::handle).
    pub fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Read a parameter. Allowed in every state.
    pub fn get(&self, parameter: Parameter) -> ParameterValue {
        parameter.read(&self.config)
    }

    /// Change a parameter. Only allowed while idle.
    pub fn set(&mut self, parameter: Parameter, value: ParameterValue) -> ArchiverResult<()> {
        if !self.state.is_idle() {
            return Err(ArchiverError::invalid_command(Capability::Set, self.state));
        }
        parameter.apply(&mut self.config, value)?;
        info!(%parameter, value = %parameter.read(&self.config), "Parameter updated");
        Ok(())
    }

    /// Feed one event through the transition table.
    ///
    /// # Errors
    ///
    /// Commands not accepted in the current state return
    /// [`ArchiverError::InvalidCommand`] and leave the state unchanged. Data is
    /// refused with `DataRejected`, `BufferFull` or `TransportData`.
    pub fn handle(&mut self, event: ProtocolEvent) -> ArchiverResult<()> {
        use ProtocolEvent as E;
        use ProtocolState as S;

        match (self.state, event) {
            (_, E::PersistCompleted { batch_id, result }) => {
                self.on_persist_completed(batch_id, result);
                Ok(())
            }

            (S::Unknown, E::Discover(DiscoverHint::Command)) => {
                self.transition(S::Command);
                Ok(())
            }
            (S::Unknown, E::Discover(DiscoverHint::Autosample)) | (S::Command, E::StartAutosample) => {
                self.enter_autosample();
                Ok(())
            }

            (S::Autosample, E::StopAutosample) => {
                self.transition(S::Stopping);
                self.actions.push(Action::CancelTimer);
                if self.in_flight.is_none() {
                    self.final_flush();
                } else {
                    debug!("Stop requested with a flush in flight; final flush deferred");
                }
                Ok(())
            }
            (S::Autosample, E::Tick) => {
                self.flush(FlushCause::Tick);
                Ok(())
            }
            (S::Autosample, E::Flush) => {
                self.flush(FlushCause::Manual);
                Ok(())
            }

            (S::WriteError, E::Tick) => {
                if self.fault_origin == S::Autosample {
                    self.flush(FlushCause::Retry);
                }
                Ok(())
            }
            (S::WriteError, E::ClearWriteError) => {
                self.clear_waiting = true;
                if self.in_flight.is_some() {
                    debug!("Retry already in flight; its outcome answers the clear");
                } else {
                    self.flush(FlushCause::ClearRetry);
                }
                Ok(())
            }
            (S::ConfigError, E::ClearWriteError) => {
                info!("Configuration error cleared");
                self.transition(S::Command);
                self.actions.push(Action::SettleClear(S::Command));
                Ok(())
            }

            (state, E::Data(sample)) if state.accepts_data() => self.accept(sample),
            (state, E::Data(_)) => Err(ArchiverError::DataRejected { state }),

            (state, E::Tick) => {
                trace!(%state, "Ignoring stale flush tick");
                Ok(())
            }

            (
                state,
                event @ (E::Discover(_)
                | E::StartAutosample
                | E::StopAutosample
                | E::ClearWriteError
                | E::Flush),
            ) => Err(ArchiverError::invalid_command(event.name(), state)),
        }
    }

    fn transition(&mut self, to: ProtocolState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!(%from, %to, "Protocol state change");
        self.state = to;
        self.actions.push(Action::StateChanged { from, to });
    }

    fn enter_autosample(&mut self) {
        self.transition(ProtocolState::Autosample);
        self.actions
            .push(Action::ArmTimer(self.config.flush_interval()));
    }

    fn accept(&mut self, sample: RawSample) -> ArchiverResult<()> {
        if let Err(err) = self.config.frame_format().validate(&sample) {
            match self.config.malformed_data_policy() {
                MalformedDataPolicy::DropAndLog => {
                    warn!(bytes = sample.len(), "Dropping malformed sample: {}", err);
                }
                MalformedDataPolicy::Halt => {
                    warn!("Malformed sample, halting: {}", err);
                    self.transition(ProtocolState::ConfigError);
                    self.actions.push(Action::CancelTimer);
                    if std::mem::take(&mut self.clear_waiting) {
                        self.actions
                            .push(Action::SettleClear(ProtocolState::ConfigError));
                    }
                    self.last_error = Some(err.to_string());
                    self.actions.push(Action::EmitError(ErrorEvent::new(
                        ErrorKind::MalformedData,
                        self.state,
                        err.to_string(),
                        self.retained_samples(),
                    )));
                }
            }
            return Err(err);
        }

        match self.buffer.append(sample) {
            Ok(()) => Ok(()),
            Err(full) => {
                if full.starts_episode {
                    warn!(
                        limit_bytes = full.limit_bytes,
                        state = %self.state,
                        "Sample buffer full, rejecting new samples"
                    );
                    self.actions.push(Action::EmitError(ErrorEvent::new(
                        ErrorKind::BufferOverflow,
                        self.state,
                        format!("sample buffer reached {} bytes", full.limit_bytes),
                        self.retained_samples(),
                    )));
                }
                Err(ArchiverError::BufferFull {
                    limit_bytes: full.limit_bytes,
                })
            }
        }
    }

    /// Drain the buffer and request a persist, unless one is already in flight.
    ///
    /// Returns `false` if nothing was sent because the buffer was empty.
    fn flush(&mut self, cause: FlushCause) -> bool {
        if let Some(in_flight) = &self.in_flight {
            debug!(
                ?cause,
                in_flight = in_flight.batch.id(),
                "Flush coalesced with in-flight batch"
            );
            return true;
        }

        let samples = self.buffer.drain_snapshot();
        if samples.is_empty() {
            trace!(?cause, "Buffer empty, nothing to flush");
            if cause == FlushCause::ClearRetry {
                self.recovered_by_clear();
            }
            return false;
        }

        let batch = SampleBatch::new(self.next_batch_id, samples);
        self.next_batch_id += 1;
        debug!(
            ?cause,
            batch = batch.id(),
            samples = batch.len(),
            bytes = batch.byte_len(),
            "Flushing"
        );
        self.in_flight = Some(InFlight {
            batch: batch.clone(),
            cause,
        });
        self.actions.push(Action::Persist(batch));
        true
    }

    /// Start the final flush of a stop, or finish the stop if nothing is left.
    fn final_flush(&mut self) {
        if !self.flush(FlushCause::Final) {
            self.transition(ProtocolState::Command);
        }
    }

    fn on_persist_completed(
        &mut self,
        batch_id: u64,
        result: Result<PersistReceipt, WriteFailure>,
    ) {
        let in_flight = match self.in_flight.take() {
            Some(f) if f.batch.id() == batch_id => f,
            other => {
                warn!(batch_id, "Ignoring completion for a batch that is not in flight");
                self.in_flight = other;
                return;
            }
        };

        match result {
            Ok(receipt) => self.persist_succeeded(in_flight, receipt),
            Err(failure) => self.persist_failed(in_flight, failure),
        }
    }

    fn persist_succeeded(&mut self, in_flight: InFlight, receipt: PersistReceipt) {
        self.files_written += 1;
        self.last_file = Some(receipt.file_path.clone());
        self.buffer.end_overflow_if_below_cap();
        self.actions.push(Action::EmitSample(SampleEvent::from_receipt(
            self.config.source_identifier(),
            receipt,
        )));

        match self.state {
            ProtocolState::Stopping => {
                if in_flight.cause == FlushCause::Final {
                    self.transition(ProtocolState::Command);
                } else {
                    self.final_flush();
                }
            }
            ProtocolState::WriteError => {
                self.last_error = None;
                if self.clear_waiting {
                    self.recovered_by_clear();
                } else if self.fault_origin == ProtocolState::Stopping {
                    info!("Retry succeeded, stop completed");
                    self.transition(ProtocolState::Command);
                } else {
                    info!("Retry succeeded, resuming autosample");
                    self.transition(ProtocolState::Autosample);
                }
            }
            // Autosample stays put. In the idle and error states the outcome of a
            // batch that was already in flight is only recorded.
            ProtocolState::Autosample
            | ProtocolState::Unknown
            | ProtocolState::Command
            | ProtocolState::ConfigError => {}
        }
    }

    fn persist_failed(&mut self, in_flight: InFlight, failure: WriteFailure) {
        let batch_len = in_flight.batch.len();
        self.buffer.restore_front(in_flight.batch.into_samples());
        self.last_error = Some(failure.to_string());
        warn!(
            kind = %failure.kind,
            path = %failure.path.display(),
            restored = batch_len,
            retained = self.buffer.len(),
            "Persist failed: {}",
            failure.cause
        );

        match self.state {
            ProtocolState::Autosample | ProtocolState::Stopping => {
                self.fault_origin = self.state;
                self.transition(ProtocolState::WriteError);
                self.emit_write_failure(&failure);
            }
            ProtocolState::WriteError => {
                if self.clear_waiting {
                    self.clear_waiting = false;
                    self.emit_write_failure(&failure);
                    self.actions
                        .push(Action::SettleClear(ProtocolState::WriteError));
                } else {
                    debug!("Retry failed, staying in WRITE_ERROR");
                }
            }
            ProtocolState::Unknown | ProtocolState::Command | ProtocolState::ConfigError => {}
        }
    }

    fn recovered_by_clear(&mut self) {
        self.clear_waiting = false;
        self.last_error = None;
        info!("Write error cleared");
        self.transition(ProtocolState::Command);
        self.actions.push(Action::CancelTimer);
        self.actions.push(Action::SettleClear(ProtocolState::Command));
    }

    fn emit_write_failure(&mut self, failure: &WriteFailure) {
        self.actions.push(Action::EmitError(ErrorEvent::write_failure(
            self.state,
            failure,
            self.retained_samples(),
        )));
    }

    fn retained_samples(&self) -> usize {
        self.buffer.len() + self.in_flight.as_ref().map_or(0, |f| f.batch.len())
    }
}

impl std::fmt::Debug for ProtocolStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolStateMachine")
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("in_flight", &self.in_flight.as_ref().map(|i| i.batch.id()))
            .finish_non_exhaustive()
    }
}
