//! Driver task: the single owner of the protocol state machine.
//!
//! # Architecture
//!
//! [`ProtocolDriver`] runs in a dedicated Tokio task. It owns the
//! [`ProtocolStateMachine`] (and through it the buffer and configuration), the
//! [`FlushTimer`] and the set of persist workers. Four sources feed one
//! `tokio::select!` loop:
//!
//! ```text
//! transport ─on_raw_data()─┐
//! orchestration ─command───┼──> mpsc ──┐
//!                          │           ├──> select! ──> machine.handle() ──> actions
//! FlushTimer ──tick────────────────────┤
//! JoinSet ──persist done───────────────┘
//! ```
//!
//! Because every input is observed in that loop, the machine is never touched
//! concurrently and no tick can be observed after the timer is cancelled.
//!
//! Persists run as `JoinSet` tasks, bounded by the persist timeout. At most one is
//! in flight; the machine decides when to start one.
//!
//! ## Shutdown
//!
//! 1. Cancel the flush timer
//! 2. Await the in-flight persist (bounded by the persist timeout)
//! 3. If streaming, stop autosampling and await the final flush
//! 4. Log whatever is still buffered and exit

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::events::EventSink;
use super::machine::{Action, DriverStatus, ProtocolEvent, ProtocolStateMachine};
use super::messages::{DriverCommand, StateReply};
use super::parameter::{Parameter, ParameterValue};
use super::state::{Capability, DiscoverHint, ProtocolState};
use super::timer::FlushTimer;
use crate::config::FlushConfig;
use crate::data::buffer::SampleBatch;
use crate::data::persister::{PersistReceipt, Persister};
use crate::data::sample::RawSample;
use crate::error::{ArchiverError, ArchiverResult, WriteFailure, WriteFailureKind};

type PersistOutcome = (u64, Result<PersistReceipt, WriteFailure>);

/// Actor that serialises data, commands, ticks and persist completions.
pub struct ProtocolDriver<P: Persister, S: EventSink> {
    machine: ProtocolStateMachine,
    persister: Arc<P>,
    sink: Arc<S>,
    timer: FlushTimer,
    persists: JoinSet<PersistOutcome>,
    /// Batch id of the running persist task, for reporting aborted workers
    persist_batch: Option<u64>,
    pending_clears: Vec<StateReply>,
    state_tx: watch::Sender<ProtocolState>,
}

impl<P: Persister, S: EventSink> ProtocolDriver<P, S> {
    /// Start the driver task and return a handle to it.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiverError::Configuration`] if `mailbox_capacity` is zero.
    pub fn spawn(
        config: FlushConfig,
        persister: Arc<P>,
        sink: Arc<S>,
        mailbox_capacity: usize,
    ) -> ArchiverResult<DriverHandle> {
        if mailbox_capacity == 0 {
            return Err(ArchiverError::Configuration(
                "mailbox capacity must be greater than 0".to_string(),
            ));
        }

        let (command_tx, command_rx) = mpsc::channel(mailbox_capacity);
        let (state_tx, state_rx) = watch::channel(ProtocolState::Unknown);

        info!(
            source = config.source_identifier(),
            directory = %config.source_directory().display(),
            interval = ?config.flush_interval(),
            "Starting protocol driver"
        );

        let driver = Self {
            machine: ProtocolStateMachine::new(config),
            persister,
            sink,
            timer: FlushTimer::new(),
            persists: JoinSet::new(),
            persist_batch: None,
            pending_clears: Vec::new(),
            state_tx,
        };
        tokio::spawn(driver.run(command_rx));

        Ok(DriverHandle {
            command_tx,
            state_rx,
        })
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<DriverCommand>) {
        loop {
            tokio::select! {
                biased;

                Some(joined) = self.persists.join_next(), if !self.persists.is_empty() => {
                    self.on_persist_joined(joined);
                }

                command = command_rx.recv() => match command {
                    Some(DriverCommand::Shutdown { response }) => {
                        self.shutdown().await;
                        let _ = response.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("All driver handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },

                _ = self.timer.tick() => {
                    let _ = self.dispatch(ProtocolEvent::Tick);
                }
            }
        }
        info!("Protocol driver stopped");
    }

    fn on_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::RawData { sample, response } => {
                let _ = response.send(self.dispatch(ProtocolEvent::Data(sample)));
            }
            DriverCommand::Discover { hint, response } => {
                let result = self.dispatch_for_state(ProtocolEvent::Discover(hint));
                let _ = response.send(result);
            }
            DriverCommand::StartAutosample { response } => {
                let result = self.dispatch_for_state(ProtocolEvent::StartAutosample);
                let _ = response.send(result);
            }
            DriverCommand::StopAutosample { response } => {
                let result = self.dispatch_for_state(ProtocolEvent::StopAutosample);
                let _ = response.send(result);
            }
            DriverCommand::Flush { response } => {
                let result = self.dispatch_for_state(ProtocolEvent::Flush);
                let _ = response.send(result);
            }
            DriverCommand::ClearWriteError { response } => {
                match self.machine.handle(ProtocolEvent::ClearWriteError) {
                    Ok(()) => self.pending_clears.push(response),
                    Err(err) => {
                        let _ = response.send(Err(err));
                    }
                }
                self.execute_actions();
            }
            DriverCommand::Get {
                parameter,
                response,
            } => {
                let _ = response.send(self.machine.get(parameter));
            }
            DriverCommand::Set {
                parameter,
                value,
                response,
            } => {
                let _ = response.send(self.machine.set(parameter, value));
            }
            DriverCommand::GetCapabilities { response } => {
                let _ = response.send(self.machine.capabilities().to_vec());
            }
            DriverCommand::GetStatus { response } => {
                let _ = response.send(self.machine.status());
            }
            DriverCommand::Shutdown { response } => {
                // Handled by the run loop; reaching here means a second request raced it.
                let _ = response.send(());
            }
        }
    }

    fn dispatch(&mut self, event: ProtocolEvent) -> ArchiverResult<()> {
        let result = self.machine.handle(event);
        self.execute_actions();
        result
    }

    fn dispatch_for_state(&mut self, event: ProtocolEvent) -> ArchiverResult<ProtocolState> {
        self.dispatch(event).map(|()| self.machine.state())
    }

    fn execute_actions(&mut self) {
        for action in self.machine.drain_actions() {
            match action {
                Action::Persist(batch) => self.start_persist(batch),
                Action::EmitSample(event) => self.sink.emit_sample(event),
                Action::EmitError(event) => self.sink.emit_error(event),
                Action::StateChanged { from, to } => {
                    self.sink.state_changed(from, to);
                    self.state_tx.send_replace(to);
                }
                Action::ArmTimer(period) => self.timer.arm(period),
                Action::CancelTimer => self.timer.cancel(),
                Action::SettleClear(state) => {
                    for response in self.pending_clears.drain(..) {
                        let _ = response.send(Ok(state));
                    }
                }
            }
        }
    }

    fn start_persist(&mut self, batch: SampleBatch) {
        let persister = Arc::clone(&self.persister);
        let config = self.machine.config().clone();
        let batch_id = batch.id();
        self.persist_batch = Some(batch_id);

        self.persists.spawn(async move {
            let timeout = config.persist_timeout();
            let result = match tokio::time::timeout(timeout, persister.write(&batch, &config)).await
            {
                Ok(result) => result,
                Err(_) => Err(WriteFailure::new(
                    WriteFailureKind::Timeout,
                    config.source_directory(),
                    format!("no result within {timeout:?}"),
                )),
            };
            (batch_id, result)
        });
    }

    fn on_persist_joined(&mut self, joined: Result<PersistOutcome, JoinError>) {
        let (batch_id, result) = match joined {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let Some(batch_id) = self.persist_batch else {
                    error!("Persist worker failed with no batch recorded: {}", join_err);
                    return;
                };
                error!(batch_id, "Persist worker failed: {}", join_err);
                let failure = WriteFailure::new(
                    WriteFailureKind::Aborted,
                    self.machine.config().source_directory(),
                    join_err,
                );
                (batch_id, Err(failure))
            }
        };
        self.persist_batch = None;
        let _ = self.dispatch(ProtocolEvent::PersistCompleted { batch_id, result });
    }

    /// Wait for the running persist, giving up after the persist timeout plus a margin.
    async fn drain_persists(&mut self) {
        let limit = self.machine.config().persist_timeout() + Duration::from_secs(1);
        while !self.persists.is_empty() {
            match tokio::time::timeout(limit, self.persists.join_next()).await {
                Ok(Some(joined)) => self.on_persist_joined(joined),
                Ok(None) => break,
                Err(_) => {
                    warn!("Persist did not finish during shutdown, aborting it");
                    self.abandon_persists();
                    break;
                }
            }
        }
    }

    /// Abort the running persist and hand its batch back to the machine.
    fn abandon_persists(&mut self) {
        self.persists.abort_all();
        self.persists.detach_all();
        if let Some(batch_id) = self.persist_batch.take() {
            let failure = WriteFailure::new(
                WriteFailureKind::Aborted,
                self.machine.config().source_directory(),
                "persist aborted at shutdown",
            );
            let _ = self.dispatch(ProtocolEvent::PersistCompleted {
                batch_id,
                result: Err(failure),
            });
        }
    }

    async fn shutdown(&mut self) {
        info!(state = %self.machine.state(), "Shutting down protocol driver");
        self.timer.cancel();
        self.drain_persists().await;

        if self.machine.state() == ProtocolState::Autosample {
            let _ = self.dispatch(ProtocolEvent::StopAutosample);
            self.drain_persists().await;
        }
        self.timer.cancel();

        for response in self.pending_clears.drain(..) {
            let _ = response.send(Err(ArchiverError::DriverStopped));
        }

        let status = self.machine.status();
        let in_flight = status.in_flight_samples.unwrap_or(0);
        if status.buffered_samples > 0 || in_flight > 0 {
            warn!(
                samples = status.buffered_samples,
                bytes = status.buffered_bytes,
                in_flight,
                state = %status.state,
                "Samples left unpersisted at shutdown"
            );
        }
    }
}

/// Cloneable handle to a running [`ProtocolDriver`].
#[derive(Debug, Clone)]
pub struct DriverHandle {
    command_tx: mpsc::Sender<DriverCommand>,
    state_rx: watch::Receiver<ProtocolState>,
}

impl DriverHandle {
    async fn request<T>(
        &self,
        (command, rx): (DriverCommand, oneshot::Receiver<T>),
    ) -> ArchiverResult<T> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ArchiverError::DriverStopped)?;
        rx.await.map_err(|_| ArchiverError::DriverStopped)
    }

    /// Hand one decoded chunk to the driver.
    ///
    /// # Errors
    ///
    /// `DataRejected` outside the streaming states, `BufferFull` when the cap is hit,
    /// `TransportData` for malformed chunks.
    pub async fn on_raw_data(
        &self,
        payload: impl Into<Bytes>,
        arrived_at: DateTime<Utc>,
    ) -> ArchiverResult<()> {
        let sample = RawSample::new(payload, arrived_at);
        self.request(DriverCommand::raw_data(sample)).await?
    }

    /// Report the source's startup state.
    pub async fn discover(&self, hint: DiscoverHint) -> ArchiverResult<ProtocolState> {
        self.request(DriverCommand::discover(hint)).await?
    }

    /// Begin buffering and arm the flush timer.
    pub async fn start_autosample(&self) -> ArchiverResult<ProtocolState> {
        self.request(DriverCommand::start_autosample()).await?
    }

    /// Request a stop. Returns `Stopping` while the final flush runs, or `Command`.
    pub async fn stop_autosample(&self) -> ArchiverResult<ProtocolState> {
        self.request(DriverCommand::stop_autosample()).await?
    }

    /// Retry the failed write now. Resolves once the retry outcome is known.
    pub async fn clear_write_error(&self) -> ArchiverResult<ProtocolState> {
        self.request(DriverCommand::clear_write_error()).await?
    }

    /// Flush now instead of waiting for the next tick.
    pub async fn flush(&self) -> ArchiverResult<ProtocolState> {
        self.request(DriverCommand::flush()).await?
    }

    /// Read a parameter.
    pub async fn get(&self, parameter: Parameter) -> ArchiverResult<ParameterValue> {
        self.request(DriverCommand::get(parameter)).await
    }

    /// Change a parameter. Only accepted in `Unknown` and `Command`.
    pub async fn set(&self, parameter: Parameter, value: ParameterValue) -> ArchiverResult<()> {
        self.request(DriverCommand::set(parameter, value)).await?
    }

    /// Commands accepted in the current state.
    pub async fn capabilities(&self) -> ArchiverResult<Vec<Capability>> {
        self.request(DriverCommand::get_capabilities()).await
    }

    /// Diagnostics snapshot from the driver task.
    pub async fn status(&self) -> ArchiverResult<DriverStatus> {
        self.request(DriverCommand::get_status()).await
    }

    /// Last published state.
    pub fn state(&self) -> ProtocolState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every published state.
    pub fn subscribe_state(&self) -> watch::Receiver<ProtocolState> {
        self.state_rx.clone()
    }

    /// Wait until the driver reaches `expected`.
    ///
    /// # Errors
    ///
    /// `StateTimeout` if `timeout` elapses first, `DriverStopped` if the task ended.
    pub async fn wait_for_state(
        &self,
        expected: ProtocolState,
        timeout: Duration,
    ) -> ArchiverResult<()> {
        let mut rx = self.state_rx.clone();
        // Release the watch guard before `rx` is borrowed again below.
        let waited = tokio::time::timeout(timeout, rx.wait_for(|state| *state == expected))
            .await
            .map(|reached| reached.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ArchiverError::DriverStopped),
            Err(_) => Err(ArchiverError::StateTimeout {
                expected,
                actual: *rx.borrow(),
                timeout,
            }),
        }
    }

    /// Stop the driver task, flushing what can be flushed.
    pub async fn shutdown(&self) -> ArchiverResult<()> {
        self.request(DriverCommand::shutdown()).await
    }

    /// Whether the driver task is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }
}
