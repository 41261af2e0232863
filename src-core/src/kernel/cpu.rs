use super::{PixelKernel, TileGrid};
use crate::error::{CaptureError, Result};
use crate::pixel;
use crate::surface::RenderSurface;
use framecap_common::{PixelLayout, TILE_SIZE};
use rayon::prelude::*;
use tracing::{debug, info};

/// Pixel kernel running on a rayon pool.
///
/// Each band of `TILE_SIZE` rows is a disjoint mutable chunk of the device
/// buffer, and tiles within a band do not overlap, so every pixel has a
/// single writer.
pub struct CpuTileKernel {
    pool: Option<rayon::ThreadPool>,
    grid: Option<TileGrid>,
    device: Vec<u32>,
}

impl CpuTileKernel {
    /// Create a kernel. `threads` of None runs on rayon's global pool.
    pub fn new(threads: Option<usize>) -> Result<Self> {
        let pool = match threads {
            Some(n) if n > 0 => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("framecap-kernel-{}", i))
                    .build()
                    .map_err(|e| {
                        CaptureError::ResourceUnavailable(format!(
                            "Failed to build kernel thread pool: {}",
                            e
                        ))
                    })?;
                info!("Pixel kernel using {} worker threads", n);
                Some(pool)
            }
            _ => None,
        };

        Ok(Self {
            pool,
            grid: None,
            device: Vec::new(),
        })
    }

    fn run(&mut self, surface: &RenderSurface, grid: TileGrid) {
        let width = grid.resolution().width as usize;
        let (tiles_x, _) = grid.dispatch_size();
        let band_len = width * TILE_SIZE as usize;
        let layout = surface.layout();

        self.device
            .par_chunks_mut(band_len)
            .enumerate()
            .for_each(|(ty, band)| {
                let rows = band.len() / width;
                for tx in 0..tiles_x {
                    let rect = grid.tile_rect(tx, ty as u32);
                    for row in 0..rows {
                        let y = rect.y0 + row as u32;
                        let out = &mut band[row * width..(row + 1) * width];
                        for x in rect.x0..rect.x1 {
                            let (r, g, b) = pixel::decode_texel(layout, surface.texel(x, y));
                            out[x as usize] = pixel::pack_rgb(r, g, b);
                        }
                    }
                }
            });
    }
}

impl PixelKernel for CpuTileKernel {
    fn name(&self) -> &str {
        "cpu-tile"
    }

    fn supports_layout(&self, _layout: PixelLayout) -> bool {
        true
    }

    fn bind(&mut self, resolution: framecap_common::Resolution) -> Result<TileGrid> {
        if resolution.is_empty() {
            return Err(CaptureError::Configuration(format!(
                "Cannot bind kernel to {}",
                resolution
            )));
        }
        let grid = TileGrid::new(resolution);
        let len = resolution.pixel_count();

        self.device.clear();
        self.device.try_reserve_exact(len).map_err(|e| {
            CaptureError::ResourceUnavailable(format!("Failed to allocate pixel buffer: {}", e))
        })?;
        self.device.resize(len, 0);
        self.grid = Some(grid);

        let (gx, gy) = grid.dispatch_size();
        debug!(
            "Kernel bound to {} ({}x{} tiles, padded: {})",
            resolution,
            gx,
            gy,
            grid.is_padded()
        );
        Ok(grid)
    }

    fn dispatch(&mut self, surface: &RenderSurface) -> Result<Vec<u32>> {
        let grid = self
            .grid
            .ok_or_else(|| CaptureError::InvalidState("Kernel is not bound".to_string()))?;
        if surface.resolution() != grid.resolution() {
            return Err(CaptureError::Configuration(format!(
                "Surface is {} but kernel is bound to {}",
                surface.resolution(),
                grid.resolution()
            )));
        }

        match self.pool.take() {
            Some(pool) => {
                pool.install(|| self.run(surface, grid));
                self.pool = Some(pool);
            }
            None => self.run(surface, grid),
        }

        // Readback into host memory.
        Ok(self.device.clone())
    }
}
