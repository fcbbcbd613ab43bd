//! Append-only sample buffer with atomic drain.
//!
//! The buffer holds every sample received since the last successful flush. It is
//! owned by the protocol state machine, but all operations take `&self` behind a
//! short `parking_lot` critical section so it can also be shared across threads.
//!
//! # Ownership Flow
//!
//! ```text
//! append() ──> [s1 s2 s3] ──drain_snapshot()──> SampleBatch ──> persister
//!                  ▲                                  │
//!                  └────────── restore_front() ◄──────┘ (write failed)
//! ```
//!
//! `drain_snapshot` swaps the whole vector out in one critical section, so a sample
//! is either in the snapshot or still in the buffer, never both and never neither.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::sample::RawSample;

/// Returned by [`SampleBuffer::append`] when the byte cap would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull {
    /// Configured cap in bytes.
    pub limit_bytes: usize,
    /// `true` for the first rejection since the buffer was last under the cap.
    pub starts_episode: bool,
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Samples currently held
    pub samples: usize,
    /// Payload bytes currently held
    pub bytes: usize,
    /// Appends refused by the cap since creation
    pub rejected_samples: u64,
    /// Appends accepted since creation
    pub total_appended: u64,
}

#[derive(Default)]
struct BufferInner {
    samples: Vec<RawSample>,
    bytes: usize,
    rejected_samples: u64,
    total_appended: u64,
    overflowing: bool,
}

/// Ordered accumulator of raw samples since the last successful flush.
pub struct SampleBuffer {
    inner: Mutex<BufferInner>,
    /// 0 disables the cap.
    max_bytes: usize,
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl SampleBuffer {
    /// Buffer without a byte cap.
    pub fn unbounded() -> Self {
        Self::with_limit(0)
    }

    /// Buffer that rejects appends once `max_bytes` would be exceeded (0 = unbounded).
    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner::default()),
            max_bytes,
        }
    }

    /// Append one sample at the tail.
    ///
    /// # Errors
    ///
    /// Returns [`BufferFull`] when the cap is set and the sample does not fit. Samples
    /// already held are never evicted to make room.
    pub fn append(&self, sample: RawSample) -> Result<(), BufferFull> {
        let mut inner = self.inner.lock();
        let size = sample.len();
        if self.max_bytes > 0 && inner.bytes + size > self.max_bytes {
            inner.rejected_samples += 1;
            let starts_episode = !inner.overflowing;
            inner.overflowing = true;
            return Err(BufferFull {
                limit_bytes: self.max_bytes,
                starts_episode,
            });
        }
        inner.bytes += size;
        inner.total_appended += 1;
        inner.samples.push(sample);
        Ok(())
    }

    /// Atomically take the entire contents, leaving an empty buffer behind.
    ///
    /// An empty result means there is nothing to persist.
    pub fn drain_snapshot(&self) -> Vec<RawSample> {
        let mut inner = self.inner.lock();
        inner.bytes = 0;
        std::mem::take(&mut inner.samples)
    }

    /// Put a previously drained batch back in front of anything appended since.
    pub fn restore_front(&self, mut samples: Vec<RawSample>) {
        if samples.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let restored: usize = samples.iter().map(RawSample::len).sum();
        samples.append(&mut inner.samples);
        inner.samples = samples;
        inner.bytes += restored;
    }

    /// Close the current overflow episode if the buffer is back under the cap.
    ///
    /// Called after a drained batch is safely on disk. A drain alone does not end the
    /// episode, since a failed write restores the batch.
    pub fn end_overflow_if_below_cap(&self) {
        let mut inner = self.inner.lock();
        if inner.bytes < self.max_bytes {
            inner.overflowing = false;
        }
    }

    /// Samples currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().samples.len()
    }

    /// Whether nothing is waiting to be flushed.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().samples.is_empty()
    }

    /// Payload bytes currently held.
    pub fn byte_len(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Configured cap, 0 when unbounded.
    pub fn limit_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Counters snapshot.
    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        BufferStats {
            samples: inner.samples.len(),
            bytes: inner.bytes,
            rejected_samples: inner.rejected_samples,
            total_appended: inner.total_appended,
        }
    }
}

/// One drained snapshot on its way to disk.
///
/// The samples are shared so the state machine can keep the batch until the persist
/// outcome is known while the worker writes it.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    id: u64,
    samples: Arc<Vec<RawSample>>,
}

impl SampleBatch {
    /// Batch `id` holding `samples` in arrival order.
    pub fn new(id: u64, samples: Vec<RawSample>) -> Self {
        Self {
            id,
            samples: Arc::new(samples),
        }
    }

    /// Batch id, unique per state machine.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Samples in arrival order.
    pub fn samples(&self) -> &[RawSample] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the batch holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total payload bytes.
    pub fn byte_len(&self) -> usize {
        self.samples.iter().map(RawSample::len).sum()
    }

    /// Arrival time of the oldest sample.
    pub fn first_arrival(&self) -> Option<DateTime<Utc>> {
        self.samples.first().map(RawSample::arrived_at)
    }

    /// Arrival time of the newest sample.
    pub fn last_arrival(&self) -> Option<DateTime<Utc>> {
        self.samples.last().map(RawSample::arrived_at)
    }

    /// Recover the samples, cloning only if a worker still holds a reference.
    pub fn into_samples(self) -> Vec<RawSample> {
        Arc::try_unwrap(self.samples).unwrap_or_else(|shared| shared.as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(tag: u32) -> RawSample {
        RawSample::now(tag.to_be_bytes().to_vec())
    }

    fn tags(samples: &[RawSample]) -> Vec<u32> {
        samples
            .iter()
            .map(|s| {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&s.payload()[..4]);
                u32::from_be_bytes(raw)
            })
            .collect()
    }

    #[test]
    fn drain_twice_yields_empty_second_time() {
        let buffer = SampleBuffer::unbounded();
        buffer.append(sample(1)).unwrap();
        buffer.append(sample(2)).unwrap();

        let first = buffer.drain_snapshot();
        assert_eq!(tags(&first), vec![1, 2]);
        assert!(buffer.drain_snapshot().is_empty());
        assert_eq!(buffer.byte_len(), 0);
    }

    #[test]
    fn restore_keeps_arrival_order() {
        let buffer = SampleBuffer::unbounded();
        buffer.append(sample(1)).unwrap();
        buffer.append(sample(2)).unwrap();
        let drained = buffer.drain_snapshot();

        buffer.append(sample(3)).unwrap();
        buffer.restore_front(drained);

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.byte_len(), 12);
        assert_eq!(tags(&buffer.drain_snapshot()), vec![1, 2, 3]);
    }

    #[test]
    fn cap_rejects_new_samples_and_reports_episode_once() {
        let buffer = SampleBuffer::with_limit(8);
        buffer.append(sample(1)).unwrap();
        buffer.append(sample(2)).unwrap();

        let first = buffer.append(sample(3)).unwrap_err();
        assert!(first.starts_episode);
        assert_eq!(first.limit_bytes, 8);
        let second = buffer.append(sample(4)).unwrap_err();
        assert!(!second.starts_episode);

        assert_eq!(tags(&buffer.drain_snapshot()), vec![1, 2]);
        assert_eq!(buffer.stats().rejected_samples, 2);
        buffer.end_overflow_if_below_cap();

        buffer.append(sample(5)).unwrap();
        buffer.append(sample(6)).unwrap();
        assert!(buffer.append(sample(7)).unwrap_err().starts_episode);
    }

    #[test]
    fn failed_drain_keeps_overflow_episode_open() {
        let buffer = SampleBuffer::with_limit(8);
        buffer.append(sample(1)).unwrap();
        buffer.append(sample(2)).unwrap();
        assert!(buffer.append(sample(3)).unwrap_err().starts_episode);

        // Drain, write fails, batch goes back.
        let drained = buffer.drain_snapshot();
        buffer.restore_front(drained);
        buffer.end_overflow_if_below_cap();
        assert!(!buffer.append(sample(4)).unwrap_err().starts_episode);

        // Drain, write succeeds.
        buffer.drain_snapshot();
        buffer.end_overflow_if_below_cap();
        buffer.append(sample(5)).unwrap();
        buffer.append(sample(6)).unwrap();
        assert!(buffer.append(sample(7)).unwrap_err().starts_episode);
    }

    #[test]
    fn restore_ignores_cap() {
        let buffer = SampleBuffer::with_limit(4);
        buffer.append(sample(1)).unwrap();
        let drained = buffer.drain_snapshot();
        buffer.append(sample(2)).unwrap();
        buffer.restore_front(drained);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn batch_round_trips_samples() {
        let batch = SampleBatch::new(7, vec![sample(1), sample(2)]);
        let held = batch.clone();
        assert_eq!(batch.id(), 7);
        assert_eq!(batch.byte_len(), 8);
        assert_eq!(tags(&held.into_samples()), vec![1, 2]);
        assert_eq!(tags(&batch.into_samples()), vec![1, 2]);
    }

    #[test]
    fn concurrent_appends_are_all_drained_once() {
        let buffer = Arc::new(SampleBuffer::unbounded());
        let writers: Vec<_> = (0..4u32)
            .map(|w| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        buffer.append(sample(w * 1000 + i)).unwrap();
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while writers.iter().any(|w| !w.is_finished()) {
            seen.extend(tags(&buffer.drain_snapshot()));
        }
        for w in writers {
            w.join().unwrap();
        }
        seen.extend(tags(&buffer.drain_snapshot()));

        seen.sort_unstable();
        let mut expected: Vec<u32> = (0..4u32)
            .flat_map(|w| (0..500u32).map(move |i| w * 1000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    proptest! {
        #[test]
        fn drained_union_equals_appended(ops in proptest::collection::vec(any::<bool>(), 0..200)) {
            // true = append the next tag, false = drain
            let buffer = SampleBuffer::unbounded();
            let mut appended = Vec::new();
            let mut drained = Vec::new();
            for (i, op) in ops.into_iter().enumerate() {
                if op {
                    buffer.append(sample(i as u32)).unwrap();
                    appended.push(i as u32);
                } else {
                    drained.extend(tags(&buffer.drain_snapshot()));
                }
            }
            drained.extend(tags(&buffer.drain_snapshot()));
            prop_assert_eq!(drained, appended);
        }
    }
}
