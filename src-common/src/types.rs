//! Shared types for the capture pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Edge length of one kernel tile, in pixels.
///
/// Matches the thread-group dimensions of the pixel kernel: work is
/// dispatched in `TILE_SIZE x TILE_SIZE` blocks.
pub const TILE_SIZE: u32 = 32;

/// Capture resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Round both dimensions down to even numbers.
    ///
    /// Downstream video encoders use 4:2:0 chroma subsampling and reject odd
    /// frame sizes.
    pub const fn to_even(self) -> Self {
        Self {
            width: self.width & !1,
            height: self.height & !1,
        }
    }

    /// Round both dimensions down to a multiple of [`TILE_SIZE`].
    pub const fn to_tile_multiple(self) -> Self {
        Self {
            width: self.width - self.width % TILE_SIZE,
            height: self.height - self.height % TILE_SIZE,
        }
    }

    /// Whether both dimensions are multiples of [`TILE_SIZE`].
    pub const fn is_tile_aligned(&self) -> bool {
        self.width % TILE_SIZE == 0 && self.height % TILE_SIZE == 0
    }

    pub const fn is_even(&self) -> bool {
        self.width % 2 == 0 && self.height % 2 == 0
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels covered by this resolution.
    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of tiles along each axis needed to cover this resolution.
    pub const fn tile_counts(&self) -> (u32, u32) {
        (
            self.width.div_ceil(TILE_SIZE),
            self.height.div_ceil(TILE_SIZE),
        )
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Parse a `WIDTHxHEIGHT` string such as `1280x720`.
impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Expected WIDTHxHEIGHT, got '{}'", s))?;
        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("Invalid width '{}': {}", w, e))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("Invalid height '{}': {}", h, e))?;
        Ok(Self { width, height })
    }
}

/// How a resolution that is not a multiple of the kernel tile size is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionPolicy {
    /// Refuse to start the session.
    Reject,
    /// Shrink the capture area to the nearest tile multiple.
    Crop,
    /// Keep the even resolution and dispatch a padded tile grid; the kernel
    /// skips texels outside the frame.
    #[default]
    Pad,
}

impl ResolutionPolicy {
    /// Parse from string (case-insensitive).
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "crop" => Some(Self::Crop),
            "pad" => Some(Self::Pad),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Crop => "crop",
            Self::Pad => "pad",
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Not recording, ready to start
    #[default]
    Idle,
    /// Capturing frames on every tick
    Recording,
    /// Waiting for encode workers to drain and the archive to be written
    Finalizing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Recording => write!(f, "recording"),
            SessionState::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// Memory layout of a render surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayout {
    /// 8-bit B, G, R, A
    Bgra8,
    /// 8-bit R, G, B, A
    Rgba8,
    /// 8-bit A, R, G, B
    Argb8,
    /// 8-bit R, G, B without padding
    Rgb8,
    /// 16-bit little-endian 5:6:5
    Rgb565,
}

impl PixelLayout {
    /// Bytes per pixel for this layout.
    pub const fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelLayout::Bgra8 | PixelLayout::Rgba8 | PixelLayout::Argb8 => 4,
            PixelLayout::Rgb8 => 3,
            PixelLayout::Rgb565 => 2,
        }
    }
}

/// Still-image format used when reconstructing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }

    /// Parse from string (case-insensitive).
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }
}
