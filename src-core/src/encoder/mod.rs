//! Background frame encoder.
//!
//! Captured frames are handed off to tokio's blocking pool, where they are
//! unpacked to B, G, R bytes, compressed and written to the cache directory.
//! Concurrency is bounded by a semaphore; the capture loop reserves a permit
//! before doing any work and skips the frame when none is free.

mod frame_file;

pub use frame_file::{frame_file_name, parse_frame_file_name, read_frame_file, write_frame_file};

use crate::error::{CaptureError, Result};
use framecap_common::config::EncoderConfig;
use framecap_common::Resolution;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

/// Base delay between encode retries; doubles per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Slot in the encoder's bounded worker pool.
#[derive(Debug)]
pub struct EncodePermit(OwnedSemaphorePermit);

/// One captured frame waiting to be persisted.
#[derive(Debug)]
pub struct EncodeJob {
    pub frame_number: u64,
    pub slot: u32,
    pub resolution: Resolution,
    pub pixels: Vec<u32>,
}

/// A frame that could not be written after all retries.
#[derive(Debug, Clone)]
pub struct EncodeFailure {
    pub frame_number: u64,
    pub slot: u32,
    pub error: String,
}

/// Called from the worker thread whenever a frame fails permanently.
pub type FailureHook = Arc<dyn Fn(&EncodeFailure) + Send + Sync>;

/// Shared state handed to every worker.
struct WorkerShared {
    cache_dir: PathBuf,
    sequence: u64,
    compression_level: i32,
    max_retries: u32,
    completed: AtomicU64,
    bytes_written: AtomicU64,
    failures: Mutex<Vec<EncodeFailure>>,
    on_failure: Option<FailureHook>,
    /// Newest frame number written per slot. Held for the whole write.
    slots: Mutex<HashMap<u32, Arc<Mutex<Option<u64>>>>>,
}

pub struct FrameEncoder {
    runtime: Handle,
    permits: Arc<Semaphore>,
    capacity: u32,
    shared: Arc<WorkerShared>,
}

impl FrameEncoder {
    /// Create an encoder writing into `cache_dir` for session `sequence`.
    ///
    /// Concurrency is capped at `min(max_in_flight, ring_size)`. Workers can
    /// still finish out of order, so writes to one slot are serialized and a
    /// frame older than the slot's last write is dropped.
    pub fn new(
        runtime: Handle,
        cache_dir: &Path,
        sequence: u64,
        config: &EncoderConfig,
        ring_size: u32,
    ) -> Self {
        let capacity = config.max_in_flight.min(ring_size as usize).max(1) as u32;
        debug!(
            "Frame encoder for session {} with {} worker slot(s)",
            sequence, capacity
        );
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            shared: Arc::new(WorkerShared {
                cache_dir: cache_dir.to_path_buf(),
                sequence,
                compression_level: config.compression_level,
                max_retries: config.max_retries,
                completed: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                failures: Mutex::new(Vec::new()),
                on_failure: None,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Install a hook invoked for every permanently failed frame.
    ///
    /// Must be called before the first submission.
    pub fn with_failure_hook(mut self, hook: FailureHook) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.on_failure = Some(hook);
        }
        self
    }

    pub fn sequence(&self) -> u64 {
        self.shared.sequence
    }

    pub fn cache_dir(&self) -> &Path {
        &self.shared.cache_dir
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Path of the frame file for `slot`.
    pub fn frame_path(&self, slot: u32) -> PathBuf {
        self.shared
            .cache_dir
            .join(frame_file_name(self.shared.sequence, slot))
    }

    /// Number of encode tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.capacity as usize - self.permits.available_permits()
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Relaxed)
    }

    /// Frames that failed after all retries.
    pub fn failures(&self) -> Vec<EncodeFailure> {
        match self.shared.failures.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Try to reserve a worker slot without blocking.
    pub fn reserve(&self) -> Option<EncodePermit> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(EncodePermit)
    }

    /// Hand a frame to the worker pool. Returns immediately.
    pub fn submit(&self, permit: EncodePermit, job: EncodeJob) {
        let shared = self.shared.clone();
        self.runtime.spawn_blocking(move || {
            let _permit = permit;
            let frame_number = job.frame_number;
            let slot = job.slot;

            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| shared.encode(&job)))
                .unwrap_or_else(|_| {
                    Err(CaptureError::EncodeTask {
                        frame_number,
                        message: "encode worker panicked".to_string(),
                    })
                });

            match outcome {
                Ok(size) => {
                    shared.completed.fetch_add(1, Ordering::Relaxed);
                    shared.bytes_written.fetch_add(size, Ordering::Relaxed);
                }
                Err(e) => shared.record_failure(EncodeFailure {
                    frame_number,
                    slot,
                    error: e.to_string(),
                }),
            }
        });
    }

    /// Wait until every submitted frame has been written or has failed.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.permits.acquire_many(self.capacity)).await {
            Ok(Ok(_all)) => Ok(()),
            Ok(Err(_)) => Err(CaptureError::InvalidState(
                "Encoder worker pool was closed".to_string(),
            )),
            Err(_) => {
                let pending = self.in_flight();
                error!(
                    "Encoder did not drain within {:?}, {} task(s) pending",
                    timeout, pending
                );
                Err(CaptureError::EncodeStalled { pending, timeout })
            }
        }
    }
}

impl WorkerShared {
    fn encode(&self, job: &EncodeJob) -> Result<u64> {
        let expected = job.resolution.pixel_count();
        if job.pixels.len() != expected {
            return Err(CaptureError::EncodeTask {
                frame_number: job.frame_number,
                message: format!(
                    "expected {} pixels for {}, got {}",
                    expected,
                    job.resolution,
                    job.pixels.len()
                ),
            });
        }

        let slot_lock = self.slot_lock(job.slot);
        let mut newest = match slot_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(written) = *newest {
            if written > job.frame_number {
                debug!(
                    "Frame {} superseded by frame {} in slot {}",
                    job.frame_number, written, job.slot
                );
                return Ok(0);
            }
        }

        let path = self
            .cache_dir
            .join(frame_file_name(self.sequence, job.slot));
        let mut attempt = 0;
        loop {
            match write_frame_file(&path, &job.pixels, self.compression_level) {
                Ok(size) => {
                    debug!(
                        "Frame {} -> {} ({} bytes)",
                        job.frame_number,
                        path.display(),
                        size
                    );
                    *newest = Some(job.frame_number);
                    return Ok(size);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Frame {} write failed (attempt {}/{}): {}",
                        job.frame_number,
                        attempt,
                        self.max_retries + 1,
                        e
                    );
                    std::thread::sleep(RETRY_BACKOFF * 2u32.pow(attempt - 1));
                }
                Err(e) => {
                    return Err(CaptureError::EncodeTask {
                        frame_number: job.frame_number,
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    fn slot_lock(&self, slot: u32) -> Arc<Mutex<Option<u64>>> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.entry(slot).or_default().clone()
    }

    fn record_failure(&self, failure: EncodeFailure) {
        error!(
            "Frame {} (slot {}) failed: {}",
            failure.frame_number, failure.slot, failure.error
        );
        match self.failures.lock() {
            Ok(mut guard) => guard.push(failure.clone()),
            Err(poisoned) => poisoned.into_inner().push(failure.clone()),
        }
        if let Some(hook) = &self.on_failure {
            hook(&failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::pack_rgb;
    use std::sync::atomic::AtomicUsize;

    fn config(max_in_flight: usize) -> EncoderConfig {
        EncoderConfig {
            max_in_flight,
            max_retries: 1,
            ..EncoderConfig::default()
        }
    }

    fn job(frame_number: u64, slot: u32) -> EncodeJob {
        EncodeJob {
            frame_number,
            slot,
            resolution: Resolution::new(2, 2),
            pixels: vec![pack_rgb(10, 20, 30); 4],
        }
    }

    #[test]
    fn test_capacity_clamped_to_ring() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let encoder = FrameEncoder::new(rt.handle().clone(), dir.path(), 1, &config(8), 3);
        assert_eq!(encoder.capacity(), 3);
    }

    #[test]
    fn test_reserve_exhausts_permits() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let encoder = FrameEncoder::new(rt.handle().clone(), dir.path(), 1, &config(2), 10);

        let a = encoder.reserve();
        let b = encoder.reserve();
        assert!(a.is_some() && b.is_some());
        assert!(encoder.reserve().is_none());
        assert_eq!(encoder.in_flight(), 2);

        drop(a);
        assert!(encoder.reserve().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_writes_frame_files() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FrameEncoder::new(Handle::current(), dir.path(), 7, &config(4), 10);

        for n in 0..3 {
            let permit = encoder.reserve().unwrap();
            encoder.submit(permit, job(n, n as u32));
        }
        encoder.drain(Duration::from_secs(5)).await.unwrap();

        assert_eq!(encoder.completed(), 3);
        assert!(encoder.failures().is_empty());
        let bgr = read_frame_file(&encoder.frame_path(2), Resolution::new(2, 2)).unwrap();
        assert_eq!(&bgr[..3], &[30, 20, 10]);
        assert!(dir.path().join("7_Frame0").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failures_are_reported_not_panicked() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let encoder = FrameEncoder::new(Handle::current(), &missing, 1, &config(2), 10)
            .with_failure_hook(Arc::new(move |_: &EncodeFailure| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        let permit = encoder.reserve().unwrap();
        encoder.submit(permit, job(0, 0));
        encoder.drain(Duration::from_secs(5)).await.unwrap();

        let failures = encoder.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].frame_number, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(encoder.completed(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wrong_pixel_count_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FrameEncoder::new(Handle::current(), dir.path(), 1, &config(2), 10);

        let mut bad = job(5, 5);
        bad.pixels.truncate(1);
        let permit = encoder.reserve().unwrap();
        encoder.submit(permit, bad);
        encoder.drain(Duration::from_secs(5)).await.unwrap();

        assert_eq!(encoder.failures()[0].frame_number, 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_late_older_frame_does_not_overwrite_slot() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FrameEncoder::new(Handle::current(), dir.path(), 1, &config(2), 2);

        let mut newer = job(2, 0);
        newer.pixels = vec![pack_rgb(200, 0, 0); 4];
        let permit = encoder.reserve().unwrap();
        encoder.submit(permit, newer);
        encoder.drain(Duration::from_secs(5)).await.unwrap();

        let mut older = job(0, 0);
        older.pixels = vec![pack_rgb(0, 0, 50); 4];
        let permit = encoder.reserve().unwrap();
        encoder.submit(permit, older);
        encoder.drain(Duration::from_secs(5)).await.unwrap();

        let bgr = read_frame_file(&encoder.frame_path(0), Resolution::new(2, 2)).unwrap();
        assert_eq!(&bgr[..3], &[0, 0, 200]);
        assert!(encoder.failures().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_same_slot_writes_leave_newest_frame() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FrameEncoder::new(Handle::current(), dir.path(), 1, &config(2), 2);

        for n in [0u64, 2, 4] {
            let mut j = job(n, 0);
            j.pixels = vec![pack_rgb(n as u8 * 10, 0, 0); 4];
            let permit = loop {
                if let Some(p) = encoder.reserve() {
                    break p;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            };
            encoder.submit(permit, j);
        }
        encoder.drain(Duration::from_secs(5)).await.unwrap();

        let bgr = read_frame_file(&encoder.frame_path(0), Resolution::new(2, 2)).unwrap();
        assert_eq!(&bgr[..3], &[0, 0, 40]);
        let parts = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .count();
        assert_eq!(parts, 0);
    }

    #[tokio::test]
    async fn test_drain_times_out_while_permit_held() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FrameEncoder::new(Handle::current(), dir.path(), 1, &config(2), 10);
        let _held = encoder.reserve().unwrap();

        let err = encoder.drain(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, CaptureError::EncodeStalled { pending: 1, .. }));
    }
}
