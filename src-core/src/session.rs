//! Capture session lifecycle.
//!
//! This module manages the recording lifecycle, including:
//! - Session state (idle, recording, finalizing)
//! - The cache directory that frame files are written into
//! - Finalization: drain encoders, write listing and manifest, archive
//! - Extraction, reconstruction and video assembly of finished sessions
//! - Event broadcasting to subscribers

use crate::archive::{Archiver, ZipArchiver};
use crate::assembly::{AssemblyCommand, AssemblyHandler, EncoderProcess, FfmpegProcess};
use crate::encoder::{EncodeFailure, FrameEncoder};
use crate::error::{CaptureError, Result};
use crate::kernel::{normalize_resolution, CpuTileKernel, PixelKernel};
use crate::manifest::{SessionManifest, AUDIO_FILE};
use crate::reconstruct::{reconstruct_frames, ReconstructReport};
use crate::ring::{FrameRing, LISTING_FILE};
use crate::scheduler::{CaptureScheduler, CaptureStats, TickOutcome};
use crate::surface::FrameSource;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use framecap_common::config::{AppConfig, CACHE_DIR_NAME};
use framecap_common::{Resolution, SessionState};
use rand::RngCore;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Directory under the cache root that archives are extracted into.
pub const EXTRACT_DIR_NAME: &str = "TempResult";

/// Events broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    FrameCaptured { frame_number: u64, slot: u32 },
    /// A capture replaced the file of an older frame.
    RingWrapped { frame_number: u64, overwrote: u64 },
    EncodeFailed(EncodeFailure),
    Finalized { archive: PathBuf },
    FinalizeFailed(String),
}

/// Result of a successful finalization.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReport {
    pub sequence: u64,
    pub archive_path: PathBuf,
    /// Key needed to extract the archive.
    pub key: String,
    pub stats: CaptureStats,
    pub throttled: u64,
    pub bytes_written: u64,
}

/// Generate a random per-session archive key.
pub fn generate_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// State shared with the finalize task.
struct Shared {
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn broadcast(&self, event: SessionEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.events.send(event);
    }

    fn set_state(&self, new_state: SessionState) {
        self.state.send_replace(new_state);
        self.broadcast(SessionEvent::StateChanged(new_state));
    }
}

/// Everything that exists only while recording.
struct Active {
    encoder: Arc<FrameEncoder>,
    warned_wrap: bool,
}

pub struct SessionManager {
    config: AppConfig,
    cache_root: PathBuf,
    runtime: Handle,
    handler: Arc<dyn AssemblyHandler>,
    archiver: Arc<dyn Archiver>,
    process: Arc<dyn EncoderProcess>,
    shared: Arc<Shared>,
    scheduler: Mutex<CaptureScheduler>,
    active: Mutex<Option<Active>>,
    finalize_task: Mutex<Option<JoinHandle<Result<FinalizeReport>>>>,
    sequence: AtomicU64,
}

impl SessionManager {
    /// Create a session manager.
    ///
    /// `runtime` runs encode workers and the finalize task; `handler`
    /// receives video assembly progress.
    pub fn new(config: AppConfig, handler: Arc<dyn AssemblyHandler>, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let cache_root = config.cache_root().map_err(CaptureError::Configuration)?;
        let kernel = CpuTileKernel::new(config.capture.kernel_threads)?;
        let scheduler = CaptureScheduler::new(Box::new(kernel), &config.capture);
        let (state, _) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(256);

        Ok(Self {
            config,
            cache_root,
            runtime,
            handler,
            archiver: Arc::new(ZipArchiver::new()),
            process: Arc::new(FfmpegProcess::new()),
            shared: Arc::new(Shared { state, events }),
            scheduler: Mutex::new(scheduler),
            active: Mutex::new(None),
            finalize_task: Mutex::new(None),
            sequence: AtomicU64::new(0),
        })
    }

    /// Replace the pixel kernel.
    pub fn with_kernel(self, kernel: Box<dyn PixelKernel>) -> Self {
        let scheduler = CaptureScheduler::new(kernel, &self.config.capture);
        Self {
            scheduler: Mutex::new(scheduler),
            ..self
        }
    }

    /// Replace the archive collaborator.
    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    /// Replace the encoder process collaborator.
    pub fn with_process(mut self, process: Arc<dyn EncoderProcess>) -> Self {
        self.process = process;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Directory frame files are written into.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_root.join(CACHE_DIR_NAME)
    }

    /// Where the archive of the last session is written.
    pub fn archive_path(&self) -> PathBuf {
        self.cache_root.join(&self.config.archive.file_name)
    }

    /// Default extraction directory.
    pub fn extract_dir(&self) -> PathBuf {
        self.cache_root.join(EXTRACT_DIR_NAME)
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Frames captured in the current or last session.
    pub fn frame_count(&self) -> u64 {
        self.lock_scheduler().map(|s| s.frame_count()).unwrap_or(0)
    }

    fn lock_scheduler(&self) -> Result<MutexGuard<'_, CaptureScheduler>> {
        self.scheduler
            .lock()
            .map_err(|_| CaptureError::InvalidState("Scheduler lock poisoned".to_string()))
    }

    fn lock_active(&self) -> Result<MutexGuard<'_, Option<Active>>> {
        self.active
            .lock()
            .map_err(|_| CaptureError::InvalidState("Session lock poisoned".to_string()))
    }

    /// Start a new session for a frame source of `source_resolution`.
    ///
    /// Returns `Ok(false)` without touching anything when a session is
    /// already recording or finalizing.
    pub fn start_rec(&self, source_resolution: Resolution) -> Result<bool> {
        let mut scheduler = self.lock_scheduler()?;
        if self.state() != SessionState::Idle {
            debug!("start_rec ignored while {}", self.state());
            return Ok(false);
        }

        let resolution =
            normalize_resolution(source_resolution, self.config.capture.resolution_policy)?;

        let cache_dir = self.cache_dir();
        reset_dir(&cache_dir)?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = self.shared.clone();
        let encoder = FrameEncoder::new(
            self.runtime.clone(),
            &cache_dir,
            sequence,
            &self.config.encoder,
            self.config.capture.ring_size,
        )
        .with_failure_hook(Arc::new(move |failure: &EncodeFailure| {
            shared.broadcast(SessionEvent::EncodeFailed(failure.clone()));
        }));

        scheduler.start(self.config.capture.target_fps, resolution)?;
        *self.lock_active()? = Some(Active {
            encoder: Arc::new(encoder),
            warned_wrap: false,
        });
        self.shared.set_state(SessionState::Recording);

        info!(
            "Session {} recording {} into {}",
            sequence,
            resolution,
            cache_dir.display()
        );
        Ok(true)
    }

    /// Advance the session by one host frame.
    pub fn tick(&self, dt: f64, source: &mut dyn FrameSource) -> Result<TickOutcome> {
        let mut scheduler = self.lock_scheduler()?;
        let mut active = self.lock_active()?;
        let Some(active) = active.as_mut() else {
            return Ok(TickOutcome::Idle);
        };

        let outcome = scheduler.tick(dt, source, &active.encoder)?;
        if let TickOutcome::Captured(ticket) = &outcome {
            self.shared.broadcast(SessionEvent::FrameCaptured {
                frame_number: ticket.frame_number,
                slot: ticket.slot,
            });
            if let Some(overwrote) = ticket.overwrote {
                if !active.warned_wrap {
                    warn!(
                        "Frame ring of {} slots wrapped; older frames are being overwritten",
                        scheduler.ring().size()
                    );
                    active.warned_wrap = true;
                }
                self.shared.broadcast(SessionEvent::RingWrapped {
                    frame_number: ticket.frame_number,
                    overwrote,
                });
            }
        }
        Ok(outcome)
    }

    /// Stop recording and start finalization in the background.
    ///
    /// Returns `Ok(false)` when no session is recording. Use
    /// [`SessionManager::wait_finalized`] for the outcome.
    pub fn stop_rec(&self) -> Result<bool> {
        let mut scheduler = self.lock_scheduler()?;
        if self.state() != SessionState::Recording {
            debug!("stop_rec ignored while {}", self.state());
            return Ok(false);
        }

        let Some(active) = self.lock_active()?.take() else {
            return Err(CaptureError::InvalidState(
                "Recording without an encoder".to_string(),
            ));
        };
        let stats = scheduler.stop();
        let throttled = scheduler.throttled();
        let ring = scheduler.ring().clone();
        drop(scheduler);

        self.shared.set_state(SessionState::Finalizing);

        let job = FinalizeJob {
            encoder: active.encoder,
            ring,
            stats,
            throttled,
            cache_dir: self.cache_dir(),
            archive_path: self.archive_path(),
            key: self
                .config
                .archive
                .password
                .clone()
                .unwrap_or_else(generate_key),
            drain_timeout: Duration::from_secs(self.config.encoder.drain_timeout_secs),
            archiver: self.archiver.clone(),
        };
        let shared = self.shared.clone();
        let handle = self.runtime.spawn(async move {
            let result = job.run().await;
            match &result {
                Ok(report) => {
                    info!(
                        "Session {} finalized: {}",
                        report.sequence,
                        report.archive_path.display()
                    );
                    shared.broadcast(SessionEvent::Finalized {
                        archive: report.archive_path.clone(),
                    });
                }
                Err(e) => {
                    error!("Finalization failed: {}", e);
                    shared.broadcast(SessionEvent::FinalizeFailed(e.to_string()));
                }
            }
            shared.set_state(SessionState::Idle);
            result
        });

        match self.finalize_task.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        Ok(true)
    }

    /// Wait for the finalization started by the last `stop_rec`.
    pub async fn wait_finalized(&self) -> Result<FinalizeReport> {
        let handle = match self.finalize_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match handle {
            Some(handle) => handle.await?,
            None => Err(CaptureError::InvalidState(
                "No finalization in progress".to_string(),
            )),
        }
    }

    /// Remove the cache directory. Only allowed while idle.
    pub fn clear(&self) -> Result<()> {
        if self.state() != SessionState::Idle {
            return Err(CaptureError::InvalidState(format!(
                "Cannot clear cache while {}",
                self.state()
            )));
        }
        let cache_dir = self.cache_dir();
        if cache_dir.exists() {
            fs::remove_dir_all(&cache_dir)?;
            info!("Cleared {}", cache_dir.display());
        }
        Ok(())
    }

    /// Extract an archive into `work_dir` and rebuild still images in `out_dir`.
    pub async fn extract_and_reconstruct(
        &self,
        archive: &Path,
        key: &str,
        work_dir: &Path,
        out_dir: &Path,
    ) -> Result<ReconstructReport> {
        let archiver = self.archiver.clone();
        let video = self.config.video.clone();
        let archive = archive.to_path_buf();
        let key = key.to_string();
        let work_dir = work_dir.to_path_buf();
        let out_dir = out_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            reset_dir(&work_dir)?;
            archiver.unpack(&archive, &work_dir, &key)?;
            reconstruct_frames(&work_dir, &out_dir, &video)
        })
        .await?
    }

    /// Stitch reconstructed frames into a video at `output`.
    pub async fn assemble_video(&self, report: &ReconstructReport, output: &Path) -> Result<PathBuf> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        let command = AssemblyCommand::from_report(report, &self.config.video, output);
        let process = self.process.clone();
        let handler = self.handler.clone();

        tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            process.run(&command, handler.as_ref())?;
            Ok(command.output)
        })
        .await?
    }
}

/// Work done after recording stops.
struct FinalizeJob {
    encoder: Arc<FrameEncoder>,
    ring: FrameRing,
    stats: CaptureStats,
    throttled: u64,
    cache_dir: PathBuf,
    archive_path: PathBuf,
    key: String,
    drain_timeout: Duration,
    archiver: Arc<dyn Archiver>,
}

impl FinalizeJob {
    async fn run(self) -> Result<FinalizeReport> {
        self.encoder.drain(self.drain_timeout).await?;

        let failures = self.encoder.failures();
        if let Some(first) = failures.first() {
            return Err(CaptureError::EncodeTask {
                frame_number: first.frame_number,
                message: format!(
                    "{} frame(s) failed to encode, first: {}",
                    failures.len(),
                    first.error
                ),
            });
        }

        self.ring.write_listing(&self.cache_dir.join(LISTING_FILE))?;

        let audio_file = self
            .cache_dir
            .join(AUDIO_FILE)
            .exists()
            .then(|| AUDIO_FILE.to_string());
        let sequence = self.encoder.sequence();
        SessionManifest::from_stats(sequence, &self.stats, audio_file).write(&self.cache_dir)?;

        let archiver = self.archiver.clone();
        let cache_dir = self.cache_dir.clone();
        let archive_path = self.archive_path.clone();
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || archiver.pack(&cache_dir, &archive_path, &key))
            .await??;

        Ok(FinalizeReport {
            sequence,
            archive_path: self.archive_path,
            key: self.key,
            stats: self.stats,
            throttled: self.throttled,
            bytes_written: self.encoder.bytes_written(),
        })
    }
}

/// Remove `dir` if present and create it empty.
fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}
