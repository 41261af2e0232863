//! On-disk frame files.
//!
//! A frame file is a zstd stream of `width * height * 3` bytes in B, G, R
//! order. Files are written to a uniquely named `.part` sibling and renamed
//! into place, so a reader never sees a partial frame and two writers never
//! share a temp file.

use crate::error::{CaptureError, Result};
use crate::pixel::{self, STORED_BYTES_PER_PIXEL};
use framecap_common::Resolution;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

static FRAME_FILE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)_Frame(\d+)$").expect("valid regex"));

/// Name of the frame file for `slot` in session `sequence`.
pub fn frame_file_name(sequence: u64, slot: u32) -> String {
    format!("{}_Frame{}", sequence, slot)
}

/// Parse a frame file name into (sequence, slot).
pub fn parse_frame_file_name(name: &str) -> Option<(u64, u32)> {
    let caps = FRAME_FILE_PATTERN.captures(name)?;
    let sequence = caps.get(1)?.as_str().parse().ok()?;
    let slot = caps.get(2)?.as_str().parse().ok()?;
    Some((sequence, slot))
}

/// Compress packed pixels and write them to `path`. Returns the compressed size.
pub fn write_frame_file(path: &Path, pixels: &[u32], level: i32) -> Result<u64> {
    let bgr = pixel::packed_to_bgr(pixels);
    let compressed = zstd::stream::encode_all(bgr.as_slice(), level)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| CaptureError::InvalidState(format!("No file name in {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        "{}.{}.part",
        name,
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&tmp, &compressed)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(compressed.len() as u64)
}

/// Read and decompress a frame file, returning its B, G, R bytes.
pub fn read_frame_file(path: &Path, resolution: Resolution) -> Result<Vec<u8>> {
    let compressed = fs::read(path)?;
    let bgr = zstd::stream::decode_all(compressed.as_slice()).map_err(|e| {
        CaptureError::CorruptFrame(format!("{}: {}", path.display(), e))
    })?;

    let expected = resolution.pixel_count() * STORED_BYTES_PER_PIXEL;
    if bgr.len() != expected {
        return Err(CaptureError::CorruptFrame(format!(
            "{}: expected {} bytes for {}, got {}",
            path.display(),
            expected,
            resolution,
            bgr.len()
        )));
    }
    Ok(bgr)
}
