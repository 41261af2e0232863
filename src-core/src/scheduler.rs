//! Capture cadence and the per-frame capture sequence.
//!
//! The host calls [`CaptureScheduler::tick`] once per rendered frame with the
//! time since the previous frame. A [`FrameClock`] decides whether this frame
//! is sampled; sampled frames go through surface acquisition, blit, kernel
//! dispatch and hand-off to the [`FrameEncoder`].

use crate::encoder::{frame_file_name, EncodeJob, FrameEncoder};
use crate::error::{CaptureError, Result};
use crate::kernel::PixelKernel;
use crate::ring::{FrameRecord, FrameRing};
use crate::surface::{FrameSource, RenderSurface};
use framecap_common::config::CaptureConfig;
use framecap_common::validation;
use framecap_common::{PixelLayout, Resolution};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

/// Timer overshoot below this is treated as a tie and does not capture.
pub const TIMER_EPSILON: f64 = 1e-9;

/// Phase-preserving frame timer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameClock {
    interval: f64,
    timer: f64,
}

impl FrameClock {
    /// `primed` preloads one full interval so the first advance captures.
    ///
    /// A primed clock matches recorders that start with a full timer. At
    /// 30 fps with a 2x multiplier, ten 0.05s ticks capture on ticks
    /// 1, 2, 3, 5, 6, 7, 9 and 10 (eight frames) instead of seven from zero.
    pub fn new(interval: f64, primed: bool) -> Self {
        Self {
            interval,
            timer: if primed { interval } else { 0.0 },
        }
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn timer(&self) -> f64 {
        self.timer
    }

    /// Add `dt` seconds. Returns true when a frame is due; the interval is
    /// then subtracted rather than the timer reset, keeping the phase.
    pub fn advance(&mut self, dt: f64) -> bool {
        self.timer += dt;
        if self.timer - self.interval > TIMER_EPSILON {
            self.timer -= self.interval;
            true
        } else {
            false
        }
    }
}

/// Result of one host tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No session is running.
    Idle,
    /// Not enough time has passed since the last capture.
    Waiting,
    /// A frame was captured and submitted for encoding.
    Captured(FrameTicket),
    /// A frame was due but every encoder slot was busy; the frame was skipped.
    Throttled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTicket {
    pub frame_number: u64,
    pub slot: u32,
    /// Frame number whose file this capture overwrites, once the ring wraps.
    pub overwrote: Option<u64>,
}

/// Summary of a finished capture run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureStats {
    pub resolution: Resolution,
    pub target_fps: u32,
    pub interval_secs: f64,
    pub frames: u64,
    pub elapsed_secs: f64,
    /// None when either the frame count or the elapsed time is zero.
    pub actual_fps: Option<f64>,
    pub ring_size: u32,
    pub overwritten: u64,
}

impl CaptureStats {
    /// Measured rate for display; "undefined" when nothing was measured.
    pub fn actual_fps_display(&self) -> String {
        match self.actual_fps {
            Some(fps) => format!("{:.2}", fps),
            None => "undefined".to_string(),
        }
    }
}

pub struct CaptureScheduler {
    kernel: Box<dyn PixelKernel>,
    interval_multiplier: f64,
    prime_first_frame: bool,
    clock: Option<FrameClock>,
    resolution: Resolution,
    target_fps: u32,
    frame_count: u64,
    throttled: u64,
    elapsed: f64,
    ring: FrameRing,
}

impl CaptureScheduler {
    pub fn new(kernel: Box<dyn PixelKernel>, config: &CaptureConfig) -> Self {
        Self {
            kernel,
            interval_multiplier: config.interval_multiplier,
            prime_first_frame: config.prime_first_frame,
            clock: None,
            resolution: Resolution::new(0, 0),
            target_fps: config.target_fps,
            frame_count: 0,
            throttled: 0,
            elapsed: 0.0,
            ring: FrameRing::new(config.ring_size),
        }
    }

    pub fn kernel_name(&self) -> &str {
        self.kernel.name()
    }

    pub fn is_running(&self) -> bool {
        self.clock.is_some()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Due frames skipped because the encoder was saturated.
    pub fn throttled(&self) -> u64 {
        self.throttled
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    pub fn clock(&self) -> Option<&FrameClock> {
        self.clock.as_ref()
    }

    /// Reset counters and the ring, and arm the clock for `target_fps`.
    pub fn start(&mut self, target_fps: u32, resolution: Resolution) -> Result<()> {
        validation::validate_target_fps(target_fps)?;
        validation::validate_interval_multiplier(self.interval_multiplier)?;
        if resolution.is_empty() || !resolution.is_even() {
            return Err(CaptureError::Configuration(format!(
                "Capture size {} must be non-zero and even",
                resolution
            )));
        }

        self.kernel.bind(resolution)?;

        let interval = self.interval_multiplier / target_fps as f64;
        self.clock = Some(FrameClock::new(interval, self.prime_first_frame));
        self.resolution = resolution;
        self.target_fps = target_fps;
        self.frame_count = 0;
        self.throttled = 0;
        self.elapsed = 0.0;
        self.ring.reset();

        info!(
            "Capture started: {} at {} fps target, one frame every {:.4}s ({} kernel)",
            resolution,
            target_fps,
            interval,
            self.kernel.name()
        );
        Ok(())
    }

    /// Advance by `dt` seconds and capture a frame if one is due.
    pub fn tick(
        &mut self,
        dt: f64,
        source: &mut dyn FrameSource,
        encoder: &FrameEncoder,
    ) -> Result<TickOutcome> {
        let Some(clock) = self.clock.as_mut() else {
            return Ok(TickOutcome::Idle);
        };

        let dt = if dt.is_finite() && dt >= 0.0 {
            dt
        } else {
            debug!("Ignoring invalid frame delta {}", dt);
            0.0
        };
        self.elapsed += dt;

        if !clock.advance(dt) {
            return Ok(TickOutcome::Waiting);
        }

        let Some(permit) = encoder.reserve() else {
            self.throttled += 1;
            warn!(
                "Encoder saturated ({} in flight), skipping frame",
                encoder.in_flight()
            );
            return Ok(TickOutcome::Throttled);
        };

        let layout = self.negotiate_layout(source);
        let pixels = {
            let mut surface = RenderSurface::acquire(self.resolution, layout)?;
            source.blit_into(&mut surface)?;
            self.kernel.dispatch(&surface)?
        };

        let frame_number = self.frame_count;
        self.frame_count += 1;
        let slot = self.ring.slot_for(frame_number);

        let previous = self.ring.record(FrameRecord {
            slot,
            frame_number,
            file_name: frame_file_name(encoder.sequence(), slot),
            elapsed_ms: (self.elapsed * 1000.0).round() as u64,
            width: self.resolution.width,
            height: self.resolution.height,
        });

        encoder.submit(
            permit,
            EncodeJob {
                frame_number,
                slot,
                resolution: self.resolution,
                pixels,
            },
        );
        trace!("Captured frame {} into slot {}", frame_number, slot);

        Ok(TickOutcome::Captured(FrameTicket {
            frame_number,
            slot,
            overwrote: previous.map(|r| r.frame_number),
        }))
    }

    /// Disarm the clock and report what was captured.
    pub fn stop(&mut self) -> CaptureStats {
        let interval_secs = self
            .clock
            .take()
            .map(|c| c.interval())
            .unwrap_or_default();

        let actual_fps = if self.frame_count > 0 && self.elapsed > 0.0 {
            Some(self.frame_count as f64 / self.elapsed)
        } else {
            None
        };

        let stats = CaptureStats {
            resolution: self.resolution,
            target_fps: self.target_fps,
            interval_secs,
            frames: self.frame_count,
            elapsed_secs: self.elapsed,
            actual_fps,
            ring_size: self.ring.size(),
            overwritten: self.ring.overwritten(),
        };
        info!(
            "Capture stopped: {} frames in {:.2}s, actual fps {}",
            stats.frames,
            stats.elapsed_secs,
            stats.actual_fps_display()
        );
        stats
    }

    /// Prefer the compact 16-bit layout when both sides support it.
    fn negotiate_layout(&self, source: &dyn FrameSource) -> PixelLayout {
        if source.supports_layout(PixelLayout::Rgb565)
            && self.kernel.supports_layout(PixelLayout::Rgb565)
        {
            PixelLayout::Rgb565
        } else {
            PixelLayout::Bgra8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::CpuTileKernel;
    use crate::surface::SyntheticSource;
    use framecap_common::config::EncoderConfig;
    use std::time::Duration;
    use tokio::runtime::Handle;

    fn scheduler(config: &CaptureConfig) -> CaptureScheduler {
        CaptureScheduler::new(Box::new(CpuTileKernel::new(Some(1)).unwrap()), config)
    }

    fn encoder(dir: &std::path::Path, ring_size: u32, max_in_flight: usize) -> FrameEncoder {
        let config = EncoderConfig {
            max_in_flight,
            ..EncoderConfig::default()
        };
        FrameEncoder::new(Handle::current(), dir, 1, &config, ring_size)
    }

    #[test]
    fn test_clock_thirty_fps_double_interval() {
        let mut clock = FrameClock::new(2.0 / 30.0, false);
        let captures = (0..10).filter(|_| clock.advance(0.05)).count();
        assert_eq!(captures, 7);
    }

    #[test]
    fn test_clock_primed_thirty_fps_double_interval() {
        let mut clock = FrameClock::new(2.0 / 30.0, true);
        let pattern: Vec<bool> = (0..10).map(|_| clock.advance(0.05)).collect();
        assert_eq!(
            pattern,
            vec![true, true, true, false, true, true, true, false, true, true]
        );
    }

    #[test]
    fn test_clock_primed_captures_first_tick() {
        let mut clock = FrameClock::new(0.1, true);
        assert!(clock.advance(0.01));
        assert!(!clock.advance(0.01));
    }

    #[test]
    fn test_clock_preserves_phase() {
        let mut clock = FrameClock::new(0.1, false);
        assert!(!clock.advance(0.06));
        assert!(clock.advance(0.06));
        assert!((clock.timer() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_start_rejects_bad_parameters() {
        let mut s = scheduler(&CaptureConfig::default());
        assert!(s.start(0, Resolution::new(64, 64)).is_err());
        assert!(s.start(30, Resolution::new(63, 64)).is_err());

        let mut bad_k = scheduler(&CaptureConfig {
            interval_multiplier: 0.0,
            ..CaptureConfig::default()
        });
        assert!(matches!(
            bad_k.start(30, Resolution::new(64, 64)),
            Err(CaptureError::Configuration(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tick_sequence_captures_seven() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder(dir.path(), 100, 8);
        let mut s = scheduler(&CaptureConfig::default());
        let mut source = SyntheticSource::new(Resolution::new(64, 64));
        s.start(30, Resolution::new(64, 64)).unwrap();

        let mut captured = 0;
        for _ in 0..10 {
            if let TickOutcome::Captured(_) = s.tick(0.05, &mut source, &enc).unwrap() {
                captured += 1;
            }
        }
        assert_eq!(captured, 7);
        assert_eq!(s.frame_count(), 7);

        enc.drain(Duration::from_secs(5)).await.unwrap();
        assert_eq!(enc.completed(), 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tick_when_stopped_is_idle() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder(dir.path(), 100, 8);
        let mut s = scheduler(&CaptureConfig::default());
        let mut source = SyntheticSource::new(Resolution::new(64, 64));
        assert_eq!(s.tick(1.0, &mut source, &enc).unwrap(), TickOutcome::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_right_after_start_has_undefined_fps() {
        let mut s = scheduler(&CaptureConfig::default());
        s.start(30, Resolution::new(64, 64)).unwrap();
        let stats = s.stop();
        assert_eq!(stats.frames, 0);
        assert_eq!(stats.actual_fps, None);
        assert_eq!(stats.actual_fps_display(), "undefined");
        assert!(!s.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_throttled_when_encoder_saturated() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder(dir.path(), 100, 1);
        let _busy = enc.reserve().unwrap();

        let mut s = scheduler(&CaptureConfig {
            prime_first_frame: true,
            ..CaptureConfig::default()
        });
        let mut source = SyntheticSource::new(Resolution::new(32, 32));
        s.start(30, Resolution::new(32, 32)).unwrap();

        assert_eq!(s.tick(0.01, &mut source, &enc).unwrap(), TickOutcome::Throttled);
        assert_eq!(s.frame_count(), 0);
        assert_eq!(s.throttled(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ring_wrap_reports_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder(dir.path(), 2, 2);
        let mut s = scheduler(&CaptureConfig {
            ring_size: 2,
            interval_multiplier: 1.0,
            ..CaptureConfig::default()
        });
        let mut source = SyntheticSource::new(Resolution::new(32, 32));
        s.start(10, Resolution::new(32, 32)).unwrap();

        let mut tickets = Vec::new();
        while tickets.len() < 3 {
            match s.tick(0.15, &mut source, &enc).unwrap() {
                TickOutcome::Captured(t) => tickets.push(t),
                TickOutcome::Throttled => {
                    enc.drain(Duration::from_secs(5)).await.unwrap();
                }
                _ => {}
            }
        }
        assert_eq!(tickets[2].slot, 0);
        assert_eq!(tickets[2].overwrote, Some(0));
        assert_eq!(s.ring().overwritten(), 1);
        enc.drain(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prefers_rgb565_when_supported() {
        let s = scheduler(&CaptureConfig::default());
        let source = SyntheticSource::new(Resolution::new(32, 32));
        assert_eq!(s.negotiate_layout(&source), PixelLayout::Rgb565);

        let bgra_only =
            SyntheticSource::new(Resolution::new(32, 32)).with_layouts(vec![PixelLayout::Bgra8]);
        assert_eq!(s.negotiate_layout(&bgra_only), PixelLayout::Bgra8);
    }
}
