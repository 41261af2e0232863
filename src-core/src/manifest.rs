//! Session manifest (`session.json`).

use crate::error::{CaptureError, Result};
use crate::scheduler::CaptureStats;
use chrono::Local;
use framecap_common::Resolution;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const MANIFEST_FILE: &str = "session.json";

/// Audio track a host may drop into the cache directory before finalization.
pub const AUDIO_FILE: &str = "RecordedAudio.wav";

const MANIFEST_VERSION: u32 = 1;

/// Everything reconstruction and assembly need to know about a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub version: u32,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub interval_secs: f64,
    /// None when no frames were captured or no time elapsed.
    pub actual_fps: Option<f64>,
    pub duration_secs: f64,
    pub ring_size: u32,
    pub frames_captured: u64,
    pub frames_overwritten: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_file: Option<String>,
    pub created_at: String,
}

impl SessionManifest {
    pub fn from_stats(sequence: u64, stats: &CaptureStats, audio_file: Option<String>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            sequence,
            width: stats.resolution.width,
            height: stats.resolution.height,
            target_fps: stats.target_fps,
            interval_secs: stats.interval_secs,
            actual_fps: stats.actual_fps,
            duration_secs: stats.elapsed_secs,
            ring_size: stats.ring_size,
            frames_captured: stats.frames,
            frames_overwritten: stats.overwritten,
            audio_file,
            created_at: Local::now().to_rfc3339(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Frame rate to play the reconstructed frames back at.
    ///
    /// Uses the measured capture rate, falling back to the nominal sampling
    /// rate (one frame per interval) when nothing was measured.
    pub fn playback_fps(&self) -> f64 {
        match self.actual_fps {
            Some(fps) if fps > 0.0 => fps,
            _ if self.interval_secs > 0.0 => 1.0 / self.interval_secs,
            _ => self.target_fps as f64,
        }
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CaptureError::InvalidState(format!("Failed to encode manifest: {}", e)))?;
        fs::write(dir.join(MANIFEST_FILE), json)?;
        Ok(())
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let contents = fs::read_to_string(&path)?;
        serde_json::from_str(&contents)
            .map_err(|e| CaptureError::CorruptFrame(format!("{}: {}", path.display(), e)))
    }
}
