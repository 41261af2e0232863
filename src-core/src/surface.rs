//! Render surfaces and frame sources.
//!
//! A [`RenderSurface`] is the temporary target a host blits the rendered frame
//! into before the kernel runs. It is acquired per captured frame and released
//! when dropped.

use crate::error::{CaptureError, Result};
use crate::pixel;
use framecap_common::{PixelLayout, Resolution};

/// Temporary render target in host memory.
#[derive(Debug)]
pub struct RenderSurface {
    resolution: Resolution,
    layout: PixelLayout,
    data: Vec<u8>,
}

impl RenderSurface {
    /// Acquire a zeroed surface.
    ///
    /// Fails with `ResourceUnavailable` when the allocation cannot be served.
    pub fn acquire(resolution: Resolution, layout: PixelLayout) -> Result<Self> {
        if resolution.is_empty() {
            return Err(CaptureError::Configuration(format!(
                "Cannot acquire a {} surface",
                resolution
            )));
        }
        let len = resolution
            .pixel_count()
            .checked_mul(layout.bytes_per_pixel())
            .ok_or_else(|| {
                CaptureError::ResourceUnavailable(format!("Surface {} is too large", resolution))
            })?;

        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            CaptureError::ResourceUnavailable(format!(
                "Failed to allocate {} byte surface: {}",
                len, e
            ))
        })?;
        data.resize(len, 0);

        Ok(Self {
            resolution,
            layout,
            data,
        })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.resolution.width as usize * self.layout.bytes_per_pixel()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Bytes of the texel at (x, y).
    #[inline]
    pub fn texel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.layout.bytes_per_pixel();
        let offset = y as usize * self.stride() + x as usize * bpp;
        &self.data[offset..offset + bpp]
    }

    /// Write an RGB color at (x, y) in the surface's layout.
    #[inline]
    pub fn put_rgb(&mut self, x: u32, y: u32, r: u8, g: u8, b: u8) {
        let bpp = self.layout.bytes_per_pixel();
        let offset = y as usize * self.stride() + x as usize * bpp;
        pixel::encode_texel(self.layout, r, g, b, &mut self.data[offset..offset + bpp]);
    }
}

/// Something that can render the current frame into a surface.
///
/// Implemented by the host's renderer. The surface is always sized to the
/// session resolution, which may be smaller than [`FrameSource::resolution`]
/// after even/tile rounding; sources copy their top-left region.
pub trait FrameSource {
    /// Native size of the rendered frame.
    fn resolution(&self) -> Resolution;

    /// Whether the source can write `layout` directly.
    fn supports_layout(&self, layout: PixelLayout) -> bool;

    /// Copy the current frame into `surface`.
    fn blit_into(&mut self, surface: &mut RenderSurface) -> Result<()>;
}

/// Animated test pattern used by the headless host and tests.
///
/// Each frame is a diagonal gradient shifted by the frame counter, so
/// consecutive frames differ and channel order mistakes are visible.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    resolution: Resolution,
    layouts: Vec<PixelLayout>,
    frame: u64,
}

impl SyntheticSource {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            layouts: vec![PixelLayout::Rgb565, PixelLayout::Bgra8],
            frame: 0,
        }
    }

    /// Restrict the layouts this source claims to support.
    pub fn with_layouts(mut self, layouts: Vec<PixelLayout>) -> Self {
        self.layouts = layouts;
        self
    }

    /// Frames rendered so far.
    pub fn frames_rendered(&self) -> u64 {
        self.frame
    }

    /// Color of pixel (x, y) in frame `frame`.
    pub fn color_at(frame: u64, x: u32, y: u32) -> (u8, u8, u8) {
        let shift = (frame % 256) as u32;
        (
            (x.wrapping_add(shift) % 256) as u8,
            (y.wrapping_add(shift) % 256) as u8,
            ((x ^ y) % 256) as u8,
        )
    }
}

impl FrameSource for SyntheticSource {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn supports_layout(&self, layout: PixelLayout) -> bool {
        self.layouts.contains(&layout)
    }

    fn blit_into(&mut self, surface: &mut RenderSurface) -> Result<()> {
        if !self.supports_layout(surface.layout()) {
            return Err(CaptureError::Configuration(format!(
                "Synthetic source cannot write {:?}",
                surface.layout()
            )));
        }
        let target = surface.resolution();
        let width = target.width.min(self.resolution.width);
        let height = target.height.min(self.resolution.height);
        for y in 0..height {
            for x in 0..width {
                let (r, g, b) = Self::color_at(self.frame, x, y);
                surface.put_rgb(x, y, r, g, b);
            }
        }
        self.frame += 1;
        Ok(())
    }
}
