//! Ring of frame-file slots and its on-disk listing.
//!
//! Frame `n` is stored in slot `n % size`; once the ring wraps, new frames
//! overwrite the oldest ones. The listing (`recordVideo.txt`) records the
//! surviving frames oldest first, one JSON object per line.

use crate::error::{CaptureError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Listing file written into the cache directory.
pub const LISTING_FILE: &str = "recordVideo.txt";

/// Metadata for one captured frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub slot: u32,
    pub frame_number: u64,
    pub file_name: String,
    /// Host time since the session started, in milliseconds.
    pub elapsed_ms: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct FrameRing {
    slots: Vec<Option<FrameRecord>>,
    total: u64,
}

impl FrameRing {
    pub fn new(size: u32) -> Self {
        Self {
            slots: vec![None; size.max(1) as usize],
            total: 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Slot that frame `frame_number` is stored in.
    pub fn slot_for(&self, frame_number: u64) -> u32 {
        (frame_number % self.slots.len() as u64) as u32
    }

    /// Frames recorded since the last reset, including overwritten ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Frames lost to overwriting.
    pub fn overwritten(&self) -> u64 {
        self.total.saturating_sub(self.slots.len() as u64)
    }

    pub fn has_wrapped(&self) -> bool {
        self.total > self.slots.len() as u64
    }

    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.total = 0;
    }

    /// Store a record in its slot. Returns the record it replaced, if any.
    pub fn record(&mut self, record: FrameRecord) -> Option<FrameRecord> {
        let slot = record.slot as usize % self.slots.len();
        self.total += 1;
        self.slots[slot].replace(record)
    }

    /// Surviving records, oldest first.
    pub fn ordered(&self) -> Vec<&FrameRecord> {
        let start = (self.total % self.slots.len() as u64) as usize;
        self.slots[start..]
            .iter()
            .chain(self.slots[..start].iter())
            .filter_map(|s| s.as_ref())
            .collect()
    }

    /// Write the listing to `path`.
    pub fn write_listing(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        for record in self.ordered() {
            let line = serde_json::to_string(record)
                .map_err(|e| CaptureError::InvalidState(format!("Failed to encode listing: {}", e)))?;
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Read a listing written by [`FrameRing::write_listing`].
pub fn read_listing(path: &Path) -> Result<Vec<FrameRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            CaptureError::CorruptFrame(format!("{} line {}: {}", path.display(), i + 1, e))
        })?;
        records.push(record);
    }
    Ok(records)
}
