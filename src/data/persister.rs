//! Persisting drained batches as data files.
//!
//! A [`Persister`] turns one [`SampleBatch`] into one file. The production
//! implementation, [`FilePersister`], lays files out as
//!
//! ```text
//! <base_directory>/<source_identifier>/<source_identifier>_<UTC timestamp>_<seq>.<ext>
//! ```
//!
//! and writes them atomically: the payloads go to a hidden `.part` temp file in the
//! same directory, which is synced and then moved into place without replacing an
//! existing file. Every failure path removes the `.part` file, so a failed write never
//! leaves a truncated data file behind.
//!
//! The blocking filesystem work runs on tokio's blocking pool. If the async caller
//! gives up (persist timeout), the write is marked abandoned and skips the final
//! rename, so a timed-out batch that goes back to the buffer is not also on disk.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::buffer::SampleBatch;
use crate::config::FlushConfig;
use crate::error::{WriteFailure, WriteFailureKind};

/// Successful outcome of one persist attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistReceipt {
    /// File that was written
    pub file_path: PathBuf,
    /// Samples in the file
    pub sample_count: usize,
    /// Bytes in the file
    pub byte_count: usize,
    /// Flush time used in the file name
    pub timestamp: DateTime<Utc>,
    /// Arrival time of the oldest sample
    pub first_arrival: Option<DateTime<Utc>>,
    /// Arrival time of the newest sample
    pub last_arrival: Option<DateTime<Utc>>,
}

/// Writes drained batches to durable storage.
///
/// Implementations must either produce one complete file per call or nothing at all.
#[async_trait]
pub trait Persister: Send + Sync + 'static {
    /// Persist `batch` according to `config`.
    ///
    /// An empty batch is not an error.
    async fn write(
        &self,
        batch: &SampleBatch,
        config: &FlushConfig,
    ) -> Result<PersistReceipt, WriteFailure>;
}

/// Writes one file per batch under `base_directory/source_identifier/`.
#[derive(Debug, Default)]
pub struct FilePersister {
    sequence: AtomicU64,
}

impl FilePersister {
    /// Persister with its sequence counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of write attempts so far.
    pub fn attempts(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// File name for a flush taken at `at` with sequence number `seq`.
    pub fn file_name(config: &FlushConfig, at: DateTime<Utc>, seq: u64) -> String {
        format!(
            "{}_{}_{:06}.{}",
            config.source_identifier(),
            at.format("%Y%m%dT%H%M%S%.6fZ"),
            seq,
            config.file_extension()
        )
    }
}

#[async_trait]
impl Persister for FilePersister {
    async fn write(
        &self,
        batch: &SampleBatch,
        config: &FlushConfig,
    ) -> Result<PersistReceipt, WriteFailure> {
        let directory = config.source_directory();
        let timestamp = Utc::now();

        if batch.is_empty() {
            return Ok(PersistReceipt {
                file_path: directory,
                sample_count: 0,
                byte_count: 0,
                timestamp,
                first_arrival: None,
                last_arrival: None,
            });
        }

        let seq = self.sequence.fetch_add(1, Ordering::AcqRel);
        let abandoned = Arc::new(AtomicBool::new(false));
        let job = WriteJob {
            directory: directory.clone(),
            config: config.clone(),
            payloads: batch.samples().iter().map(|s| s.payload().clone()).collect(),
            timestamp,
            seq,
            abandoned: Arc::clone(&abandoned),
        };

        // Flags the job if this future is dropped before the blocking write returns.
        let abandon_guard = AbandonOnDrop(Some(abandoned));
        let joined = tokio::task::spawn_blocking(move || job.run()).await;
        abandon_guard.disarm();

        let (file_path, byte_count) = match joined {
            Ok(result) => result?,
            Err(join_err) => {
                return Err(WriteFailure::new(
                    WriteFailureKind::Aborted,
                    directory,
                    join_err,
                ))
            }
        };

        info!(
            path = %file_path.display(),
            samples = batch.len(),
            bytes = byte_count,
            "Persisted batch {}",
            batch.id()
        );

        Ok(PersistReceipt {
            file_path,
            sample_count: batch.len(),
            byte_count,
            timestamp,
            first_arrival: batch.first_arrival(),
            last_arrival: batch.last_arrival(),
        })
    }
}

struct AbandonOnDrop(Option<Arc<AtomicBool>>);

impl AbandonOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.0.take() {
            flag.store(true, Ordering::Release);
        }
    }
}

struct WriteJob {
    directory: PathBuf,
    config: FlushConfig,
    payloads: Vec<Bytes>,
    timestamp: DateTime<Utc>,
    seq: u64,
    abandoned: Arc<AtomicBool>,
}

impl WriteJob {
    fn run(self) -> Result<(PathBuf, usize), WriteFailure> {
        fs::create_dir_all(&self.directory).map_err(|e| {
            WriteFailure::new(WriteFailureKind::DirectoryUnavailable, &self.directory, e)
        })?;

        // Removed on drop unless committed.
        let name = FilePersister::file_name(&self.config, self.timestamp, self.seq);
        let mut part = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".part")
            .tempfile_in(&self.directory)
            .map_err(|e| WriteFailure::from_io(&self.directory, &e))?;

        let mut byte_count = 0;
        for payload in &self.payloads {
            part.write_all(payload)
                .map_err(|e| WriteFailure::from_io(part.path(), &e))?;
            byte_count += payload.len();
        }
        part.as_file()
            .sync_all()
            .map_err(|e| WriteFailure::from_io(part.path(), &e))?;

        // A timeout landing after this check still commits the file, and the restored
        // batch is written again by the retry.
        if self.abandoned.load(Ordering::Acquire) {
            return Err(WriteFailure::new(
                WriteFailureKind::Timeout,
                part.path(),
                "write abandoned before commit",
            ));
        }

        let final_path = self.commit(part)?;
        Ok((final_path, byte_count))
    }

    /// Move the part file to the first free name at or after `seq`.
    fn commit(&self, mut part: NamedTempFile) -> Result<PathBuf, WriteFailure> {
        let mut seq = self.seq;
        loop {
            let target = self
                .directory
                .join(FilePersister::file_name(&self.config, self.timestamp, seq));
            match part.persist_noclobber(&target) {
                Ok(_) => return Ok(target),
                Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(path = %target.display(), "Data file exists, bumping sequence");
                    part = err.file;
                    seq += 1;
                }
                Err(err) => return Err(WriteFailure::from_io(&target, &err.error)),
            }
        }
    }
}
