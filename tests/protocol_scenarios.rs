//! End-to-end driver scenarios against the real file persister.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sample_archiver::config::FlushConfig;
use sample_archiver::data::persister::FilePersister;
use sample_archiver::protocol::{
    ChannelEventSink, DiscoverHint, DriverEvent, DriverHandle, ErrorEvent, ErrorKind,
    ProtocolDriver, ProtocolState, SampleEvent,
};
use sample_archiver::ArchiverError;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);
const NEVER: Duration = Duration::from_secs(3600);

struct Harness {
    dir: TempDir,
    driver: DriverHandle,
    events: UnboundedReceiver<DriverEvent>,
}

impl Harness {
    fn start(flush_interval: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = FlushConfig::new("test", ".*", dir.path(), flush_interval).unwrap();
        let (sink, events) = ChannelEventSink::new();
        let driver =
            ProtocolDriver::spawn(config, Arc::new(FilePersister::new()), Arc::new(sink), 64)
                .unwrap();
        Self {
            dir,
            driver,
            events,
        }
    }

    fn source_dir(&self) -> PathBuf {
        self.dir.path().join("test")
    }

    /// Put a regular file where the per-source directory must go.
    fn block_writes(&self) {
        fs::write(self.source_dir(), b"in the way").unwrap();
    }

    fn unblock_writes(&self) {
        fs::remove_file(self.source_dir()).unwrap();
    }

    async fn send(&self, payload: &'static [u8]) {
        self.driver.on_raw_data(payload, Utc::now()).await.unwrap();
    }

    async fn next_sample(&mut self) -> SampleEvent {
        loop {
            match tokio::time::timeout(WAIT, self.events.recv()).await {
                Ok(Some(DriverEvent::Sample(event))) => return event,
                Ok(Some(_)) => continue,
                other => panic!("no SAMPLE event: {:?}", other),
            }
        }
    }

    async fn next_error(&mut self) -> ErrorEvent {
        loop {
            match tokio::time::timeout(WAIT, self.events.recv()).await {
                Ok(Some(DriverEvent::Error(event))) => return event,
                Ok(Some(_)) => continue,
                other => panic!("no ERROR event: {:?}", other),
            }
        }
    }

    fn drain_events(&mut self) -> Vec<DriverEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

fn data_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "dat"))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

#[tokio::test]
async fn samples_during_autosample_flush_to_one_file() {
    let interval = Duration::from_millis(500);
    let mut h = Harness::start(interval);
    h.driver.discover(DiscoverHint::Command).await.unwrap();
    h.driver.start_autosample().await.unwrap();

    h.send(b"s1,").await;
    h.send(b"s2,").await;
    h.send(b"s3").await;

    let event = h.next_sample().await;
    assert_eq!(event.sample_count, 3);
    assert_eq!(fs::read(&event.file_path).unwrap(), b"s1,s2,s3");

    // Later ticks find an empty buffer and write nothing.
    tokio::time::sleep(interval * 2).await;
    let later_samples = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, DriverEvent::Sample(_)))
        .count();
    assert_eq!(later_samples, 0);
    assert_eq!(data_files(&h.source_dir()), vec![event.file_path]);
    assert_eq!(h.driver.state(), ProtocolState::Autosample);

    h.driver.shutdown().await.unwrap();
}

#[tokio::test]
async fn timer_flush_writes_buffered_samples() {
    let mut h = Harness::start(Duration::from_millis(200));

    // Buffered before discovery, so all three land in the first tick.
    h.send(b"s1,").await;
    h.send(b"s2,").await;
    h.send(b"s3").await;
    h.driver.discover(DiscoverHint::Command).await.unwrap();
    h.driver.start_autosample().await.unwrap();

    let event = h.next_sample().await;
    assert_eq!(event.sample_count, 3);
    assert_eq!(event.byte_count, 8);
    assert_eq!(event.source_identifier, "test");
    assert_eq!(fs::read(&event.file_path).unwrap(), b"s1,s2,s3");
    assert_eq!(data_files(&h.source_dir()), vec![event.file_path]);
    assert_eq!(h.driver.state(), ProtocolState::Autosample);

    h.driver.shutdown().await.unwrap();
}

#[tokio::test]
async fn write_error_then_clear_persists_everything_once() {
    let mut h = Harness::start(NEVER);
    h.block_writes();
    h.driver.discover(DiscoverHint::Autosample).await.unwrap();

    h.send(b"a").await;
    h.send(b"b").await;
    h.driver.flush().await.unwrap();

    let error = h.next_error().await;
    assert_eq!(error.kind, ErrorKind::WriteFailure);
    assert_eq!(error.state, ProtocolState::WriteError);
    assert_eq!(error.retained_samples, 2);
    assert_eq!(h.driver.state(), ProtocolState::WriteError);

    // Still buffering while the error is outstanding.
    h.send(b"c").await;
    let status = h.driver.status().await.unwrap();
    assert_eq!(status.buffered_samples, 3);

    h.unblock_writes();
    assert_eq!(
        h.driver.clear_write_error().await.unwrap(),
        ProtocolState::Command
    );

    let event = h.next_sample().await;
    assert_eq!(event.sample_count, 3);
    assert_eq!(fs::read(&event.file_path).unwrap(), b"abc");
    assert_eq!(data_files(&h.source_dir()).len(), 1);

    h.driver.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_clear_keeps_write_error() {
    let mut h = Harness::start(NEVER);
    h.block_writes();
    h.driver.discover(DiscoverHint::Autosample).await.unwrap();
    h.send(b"a").await;
    h.driver.flush().await.unwrap();
    h.next_error().await;

    assert_eq!(
        h.driver.clear_write_error().await.unwrap(),
        ProtocolState::WriteError
    );
    let error = h.next_error().await;
    assert_eq!(error.retained_samples, 1);

    h.driver.shutdown().await.unwrap();
}

#[tokio::test]
async fn timer_retry_recovers_with_accumulated_samples() {
    let mut h = Harness::start(Duration::from_millis(150));
    h.block_writes();
    h.driver.discover(DiscoverHint::Autosample).await.unwrap();

    h.send(b"1").await;
    h.send(b"2").await;
    h.next_error().await;
    h.send(b"3").await;

    h.unblock_writes();
    h.driver
        .wait_for_state(ProtocolState::Autosample, WAIT)
        .await
        .unwrap();

    let event = h.next_sample().await;
    assert_eq!(fs::read(&event.file_path).unwrap(), b"123");
    assert_eq!(event.sample_count, 3);

    h.driver.shutdown().await.unwrap();
}

#[tokio::test]
async fn stop_flushes_pending_samples() {
    let mut h = Harness::start(NEVER);
    h.driver.discover(DiscoverHint::Command).await.unwrap();
    h.driver.start_autosample().await.unwrap();
    h.drain_events();

    h.send(b"x").await;
    h.send(b"y").await;
    h.driver.stop_autosample().await.unwrap();
    h.driver
        .wait_for_state(ProtocolState::Command, WAIT)
        .await
        .unwrap();

    let files = data_files(&h.source_dir());
    assert_eq!(files.len(), 1);
    assert_eq!(fs::read(&files[0]).unwrap(), b"xy");

    let transitions: Vec<(ProtocolState, ProtocolState)> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            DriverEvent::StateChange { from, to } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (ProtocolState::Autosample, ProtocolState::Stopping),
            (ProtocolState::Stopping, ProtocolState::Command),
        ]
    );

    h.driver.shutdown().await.unwrap();
}

#[tokio::test]
async fn start_in_autosample_is_rejected() {
    let h = Harness::start(NEVER);
    h.driver.discover(DiscoverHint::Autosample).await.unwrap();

    let err = h.driver.start_autosample().await.unwrap_err();
    assert!(matches!(
        err,
        ArchiverError::InvalidCommand {
            state: ProtocolState::Autosample,
            ..
        }
    ));
    assert_eq!(h.driver.state(), ProtocolState::Autosample);

    h.driver.shutdown().await.unwrap();
}

#[tokio::test]
async fn data_rejected_in_command_state() {
    let h = Harness::start(NEVER);
    h.driver.discover(DiscoverHint::Command).await.unwrap();

    let err = h
        .driver
        .on_raw_data(&b"ignored"[..], Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ArchiverError::DataRejected {
            state: ProtocolState::Command
        }
    ));

    h.driver.shutdown().await.unwrap();
}
