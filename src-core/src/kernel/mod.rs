//! Tile-parallel pixel kernel.
//!
//! Converts a render surface in any supported [`PixelLayout`] into one packed
//! `0x00RRGGBB` word per pixel. Work is split into `TILE_SIZE x TILE_SIZE`
//! tiles; each pixel belongs to exactly one tile.

mod cpu;

pub use cpu::CpuTileKernel;

use crate::error::{CaptureError, Result};
use crate::surface::RenderSurface;
use framecap_common::validation;
use framecap_common::{PixelLayout, Resolution, ResolutionPolicy, TILE_SIZE};
use tracing::{debug, warn};

/// A device-side pixel transform.
///
/// `dispatch` takes `&mut self` and returns only after the full result has
/// been read back, so at most one dispatch is ever in flight per kernel.
pub trait PixelKernel: Send {
    fn name(&self) -> &str;

    /// Whether the kernel can read surfaces in `layout`.
    fn supports_layout(&self, layout: PixelLayout) -> bool;

    /// Size the device buffer and tile grid for `resolution`.
    fn bind(&mut self, resolution: Resolution) -> Result<TileGrid>;

    /// Run the kernel over `surface` and return the packed pixels in row-major order.
    fn dispatch(&mut self, surface: &RenderSurface) -> Result<Vec<u32>>;
}

/// Tile decomposition of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    resolution: Resolution,
    tiles_x: u32,
    tiles_y: u32,
}

/// Pixel bounds of one tile, half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl TileGrid {
    pub fn new(resolution: Resolution) -> Self {
        let (tiles_x, tiles_y) = resolution.tile_counts();
        Self {
            resolution,
            tiles_x,
            tiles_y,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Dispatch size as (groups in x, groups in y).
    pub fn dispatch_size(&self) -> (u32, u32) {
        (self.tiles_x, self.tiles_y)
    }

    /// Whether edge tiles extend past the frame and need an out-of-range guard.
    pub fn is_padded(&self) -> bool {
        !self.resolution.is_tile_aligned()
    }

    /// Bounds of tile (tx, ty), clamped to the frame.
    pub fn tile_rect(&self, tx: u32, ty: u32) -> TileRect {
        let x0 = tx * TILE_SIZE;
        let y0 = ty * TILE_SIZE;
        TileRect {
            x0,
            y0,
            x1: (x0 + TILE_SIZE).min(self.resolution.width),
            y1: (y0 + TILE_SIZE).min(self.resolution.height),
        }
    }

    /// Iterate all tiles in row-major order.
    pub fn tiles(&self) -> impl Iterator<Item = TileRect> + '_ {
        (0..self.tiles_y)
            .flat_map(move |ty| (0..self.tiles_x).map(move |tx| self.tile_rect(tx, ty)))
    }
}

/// Round a source resolution to one the pipeline can capture.
///
/// Dimensions are always rounded down to even numbers first. The tile policy
/// then decides what happens when the result is not a multiple of
/// [`TILE_SIZE`].
pub fn normalize_resolution(source: Resolution, policy: ResolutionPolicy) -> Result<Resolution> {
    let even = source.to_even();
    if even != source {
        debug!("Rounded capture size {} down to {}", source, even);
    }

    let resolved = match policy {
        _ if even.is_tile_aligned() => even,
        ResolutionPolicy::Reject => {
            return Err(CaptureError::Configuration(format!(
                "Capture size {} is not a multiple of {} pixels",
                even, TILE_SIZE
            )));
        }
        ResolutionPolicy::Crop => {
            let cropped = even.to_tile_multiple();
            warn!("Cropping capture size {} to {}", even, cropped);
            cropped
        }
        ResolutionPolicy::Pad => even,
    };

    validation::validate_dimensions(resolved.width, resolved.height)?;
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage(grid: &TileGrid) -> Vec<u32> {
        let res = grid.resolution();
        let mut hits = vec![0u32; res.pixel_count()];
        for rect in grid.tiles() {
            for y in rect.y0..rect.y1 {
                for x in rect.x0..rect.x1 {
                    hits[(y * res.width + x) as usize] += 1;
                }
            }
        }
        hits
    }

    #[test]
    fn test_aligned_grid_covers_each_pixel_once() {
        let grid = TileGrid::new(Resolution::new(128, 64));
        assert_eq!(grid.dispatch_size(), (4, 2));
        assert!(!grid.is_padded());
        assert!(coverage(&grid).iter().all(|&n| n == 1));
    }

    #[test]
    fn test_padded_grid_covers_each_pixel_once() {
        let grid = TileGrid::new(Resolution::new(100, 70));
        assert_eq!(grid.dispatch_size(), (4, 3));
        assert!(grid.is_padded());
        assert!(coverage(&grid).iter().all(|&n| n == 1));
        assert_eq!(
            grid.tile_rect(3, 2),
            TileRect {
                x0: 96,
                y0: 64,
                x1: 100,
                y1: 70
            }
        );
    }

    #[test]
    fn test_normalize_odd_resolution() {
        let source = Resolution::new(1281, 721);
        assert_eq!(
            normalize_resolution(source, ResolutionPolicy::Pad).unwrap(),
            Resolution::new(1280, 720)
        );
        assert_eq!(
            normalize_resolution(source, ResolutionPolicy::Crop).unwrap(),
            Resolution::new(1280, 704)
        );
        assert!(matches!(
            normalize_resolution(source, ResolutionPolicy::Reject),
            Err(CaptureError::Configuration(_))
        ));
    }

    #[test]
    fn test_normalize_aligned_passes_every_policy() {
        let source = Resolution::new(1280, 704);
        for policy in [
            ResolutionPolicy::Reject,
            ResolutionPolicy::Crop,
            ResolutionPolicy::Pad,
        ] {
            assert_eq!(normalize_resolution(source, policy).unwrap(), source);
        }
    }

    #[test]
    fn test_normalize_rejects_degenerate() {
        assert!(normalize_resolution(Resolution::new(1, 1), ResolutionPolicy::Pad).is_err());
        assert!(normalize_resolution(Resolution::new(30, 30), ResolutionPolicy::Crop).is_err());
    }
}
