//! Rebuild still images from an extracted session.

use crate::encoder::{parse_frame_file_name, read_frame_file};
use crate::error::{CaptureError, Result};
use crate::manifest::SessionManifest;
use crate::pixel;
use crate::ring::{read_listing, FrameRecord, LISTING_FILE};
use framecap_common::config::VideoConfig;
use framecap_common::{ImageFormat, Resolution};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

static OUTPUT_FRAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^frame_\d+\.(jpg|png)$").expect("valid regex"));

/// Output of a reconstruction, ready to be handed to the video assembler.
#[derive(Debug, Clone, Serialize)]
pub struct ReconstructReport {
    pub sequence: u64,
    pub resolution: Resolution,
    /// Written images, oldest frame first.
    pub frames: Vec<PathBuf>,
    /// printf-style input pattern matching `frames`, e.g. `out/frame_%d.jpg`.
    pub pattern: PathBuf,
    pub fps: f64,
    pub duration_secs: f64,
    pub audio: Option<PathBuf>,
}

/// Decode one stored frame into an RGB image.
pub fn decode_frame(path: &Path, resolution: Resolution, flip_vertical: bool) -> Result<RgbImage> {
    let mut data = read_frame_file(path, resolution)?;
    pixel::bgr_to_rgb_in_place(&mut data);
    let mut img = RgbImage::from_raw(resolution.width, resolution.height, data).ok_or_else(|| {
        CaptureError::CorruptFrame(format!("{}: buffer does not match {}", path.display(), resolution))
    })?;
    if flip_vertical {
        image::imageops::flip_vertical_in_place(&mut img);
    }
    Ok(img)
}

fn save_image(img: &RgbImage, out: &Path, video: &VideoConfig) -> Result<()> {
    match video.image_format {
        ImageFormat::Jpeg => {
            let file = BufWriter::new(File::create(out)?);
            let mut encoder = JpegEncoder::new_with_quality(file, video.jpeg_quality);
            encoder.encode_image(img)?;
        }
        ImageFormat::Png => img.save_with_format(out, image::ImageFormat::Png)?,
    }
    Ok(())
}

/// Frame records in playback order.
///
/// Uses the listing when present. Without one the frame files are ordered by
/// slot, which is only exact if the ring never wrapped.
/// Remove images left in `out_dir` by an earlier reconstruction, so the
/// `frame_%d` pattern only sees this run's frames.
fn remove_stale_frames(out_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(out_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_file() && OUTPUT_FRAME_PATTERN.is_match(&name.to_string_lossy()) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!("Removed {} stale frame(s) from {}", removed, out_dir.display());
    }
    Ok(removed)
}

fn load_records(work_dir: &Path, manifest: &SessionManifest) -> Result<Vec<FrameRecord>> {
    let listing = work_dir.join(LISTING_FILE);
    if listing.exists() {
        return read_listing(&listing);
    }

    warn!(
        "No {} in {}, ordering frames by slot",
        LISTING_FILE,
        work_dir.display()
    );
    let mut records: Vec<FrameRecord> = fs::read_dir(work_dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            let (sequence, slot) = parse_frame_file_name(&name)?;
            (sequence == manifest.sequence).then(|| FrameRecord {
                slot,
                frame_number: slot as u64,
                file_name: name,
                elapsed_ms: 0,
                width: manifest.width,
                height: manifest.height,
            })
        })
        .collect();
    records.sort_by_key(|r| r.slot);
    Ok(records)
}

/// Decode every frame in `work_dir` and write images into `out_dir` as
/// `frame_{ordinal}.{ext}`, oldest first.
pub fn reconstruct_frames(
    work_dir: &Path,
    out_dir: &Path,
    video: &VideoConfig,
) -> Result<ReconstructReport> {
    let manifest = SessionManifest::read(work_dir)?;
    let resolution = manifest.resolution();
    let records = load_records(work_dir, &manifest)?;
    if records.is_empty() {
        return Err(CaptureError::InvalidState(format!(
            "No frames to reconstruct in {}",
            work_dir.display()
        )));
    }
    for record in &records {
        if parse_frame_file_name(&record.file_name).is_none() {
            return Err(CaptureError::CorruptFrame(format!(
                "Unexpected frame file name '{}'",
                record.file_name
            )));
        }
    }

    fs::create_dir_all(out_dir)?;
    remove_stale_frames(out_dir)?;
    let ext = video.image_format.extension();

    let frames = records
        .par_iter()
        .enumerate()
        .map(|(i, record)| {
            let out = out_dir.join(format!("frame_{}.{}", i, ext));
            let img = decode_frame(&work_dir.join(&record.file_name), resolution, video.flip_vertical)?;
            save_image(&img, &out, video)?;
            Ok(out)
        })
        .collect::<Result<Vec<_>>>()?;

    let audio = manifest
        .audio_file
        .as_ref()
        .map(|name| work_dir.join(name))
        .filter(|p| p.exists());

    info!(
        "Reconstructed {} frame(s) at {} into {}",
        frames.len(),
        resolution,
        out_dir.display()
    );

    Ok(ReconstructReport {
        sequence: manifest.sequence,
        resolution,
        frames,
        pattern: out_dir.join(format!("frame_%d.{}", ext)),
        fps: manifest.playback_fps(),
        duration_secs: manifest.duration_secs,
        audio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{frame_file_name, write_frame_file};
    use crate::pixel::pack_rgb;
    use crate::ring::FrameRing;
    use crate::scheduler::CaptureStats;

    fn write_session(dir: &Path, frames: u64, ring_size: u32) {
        let resolution = Resolution::new(4, 2);
        let mut ring = FrameRing::new(ring_size);
        for n in 0..frames {
            let slot = ring.slot_for(n);
            let shade = (n * 10) as u8;
            let pixels = vec![pack_rgb(shade, 100, 200); 8];
            write_frame_file(&dir.join(frame_file_name(1, slot)), &pixels, 3).unwrap();
            ring.record(FrameRecord {
                slot,
                frame_number: n,
                file_name: frame_file_name(1, slot),
                elapsed_ms: n * 100,
                width: 4,
                height: 2,
            });
        }
        ring.write_listing(&dir.join(LISTING_FILE)).unwrap();
        let stats = CaptureStats {
            resolution,
            target_fps: 30,
            interval_secs: 0.1,
            frames,
            elapsed_secs: frames as f64 * 0.1,
            actual_fps: Some(10.0),
            ring_size,
            overwritten: ring.overwritten(),
        };
        SessionManifest::from_stats(1, &stats, None).write(dir).unwrap();
    }

    #[test]
    fn test_reconstruct_orders_oldest_first() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_session(work.path(), 5, 3);

        let video = VideoConfig {
            image_format: ImageFormat::Png,
            ..VideoConfig::default()
        };
        let report = reconstruct_frames(work.path(), out.path(), &video).unwrap();
        assert_eq!(report.frames.len(), 3);
        assert_eq!(report.fps, 10.0);

        // Surviving frames are 2, 3, 4; PNG is lossless so the shade is exact.
        let first = image::open(&report.frames[0]).unwrap().to_rgb8();
        assert_eq!(first.get_pixel(0, 0).0, [20, 100, 200]);
        let last = image::open(&report.frames[2]).unwrap().to_rgb8();
        assert_eq!(last.get_pixel(3, 1).0, [40, 100, 200]);
        assert!(report.pattern.ends_with("frame_%d.png"));
    }

    #[test]
    fn test_reconstruct_jpeg_output() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_session(work.path(), 2, 10);

        let report = reconstruct_frames(work.path(), out.path(), &VideoConfig::default()).unwrap();
        assert_eq!(report.frames.len(), 2);
        assert!(out.path().join("frame_0.jpg").exists());
        assert!(out.path().join("frame_1.jpg").exists());
    }

    #[test]
    fn test_reconstruct_twice_replaces_previous_frames() {
        let long = tempfile::tempdir().unwrap();
        let short = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_session(long.path(), 5, 10);
        write_session(short.path(), 2, 10);
        fs::write(out.path().join("notes.txt"), "keep").unwrap();

        let first = reconstruct_frames(long.path(), out.path(), &VideoConfig::default()).unwrap();
        assert_eq!(first.frames.len(), 5);
        let second = reconstruct_frames(short.path(), out.path(), &VideoConfig::default()).unwrap();
        assert_eq!(second.frames.len(), 2);

        let mut images: Vec<String> = fs::read_dir(out.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("frame_"))
            .collect();
        images.sort();
        assert_eq!(images, vec!["frame_0.jpg", "frame_1.jpg"]);
        assert!(out.path().join("notes.txt").exists());
    }

    #[test]
    fn test_reconstruct_without_listing_falls_back_to_slots() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_session(work.path(), 3, 10);
        fs::remove_file(work.path().join(LISTING_FILE)).unwrap();

        let video = VideoConfig {
            image_format: ImageFormat::Png,
            ..VideoConfig::default()
        };
        let report = reconstruct_frames(work.path(), out.path(), &video).unwrap();
        assert_eq!(report.frames.len(), 3);
    }

    #[test]
    fn test_decode_frame_flips() {
        let work = tempfile::tempdir().unwrap();
        let path = work.path().join("1_Frame0");
        write_frame_file(&path, &[pack_rgb(255, 0, 0), pack_rgb(0, 0, 255)], 3).unwrap();

        let img = decode_frame(&path, Resolution::new(1, 2), true).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 255]);
        assert_eq!(img.get_pixel(0, 1).0, [255, 0, 0]);
    }

    #[test]
    fn test_reconstruct_requires_manifest() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        assert!(reconstruct_frames(work.path(), out.path(), &VideoConfig::default()).is_err());
    }
}
