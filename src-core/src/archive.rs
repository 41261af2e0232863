//! Password-protected archives of a session's cache directory.

use crate::error::{CaptureError, Result};
use framecap_common::validation;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{AesMode, CompressionMethod, ZipArchive, ZipWriter};

/// Bundles a directory into a single keyed archive and back.
pub trait Archiver: Send + Sync {
    /// Pack every regular file in `source_dir` into `dest`. Returns the entry count.
    fn pack(&self, source_dir: &Path, dest: &Path, key: &str) -> Result<usize>;

    /// Extract `archive` into `dest`, returning the extracted file paths.
    fn unpack(&self, archive: &Path, dest: &Path, key: &str) -> Result<Vec<PathBuf>>;
}

/// AES-256 encrypted zip archives.
///
/// Entries are stored without deflate since frame files are already
/// compressed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipArchiver;

impl ZipArchiver {
    pub fn new() -> Self {
        Self
    }
}

impl Archiver for ZipArchiver {
    fn pack(&self, source_dir: &Path, dest: &Path, key: &str) -> Result<usize> {
        if key.is_empty() {
            return Err(CaptureError::Configuration(
                "Archive key must not be empty".to_string(),
            ));
        }

        let mut entries: Vec<PathBuf> = fs::read_dir(source_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().map_or(true, |ext| ext != "part"))
            .collect();
        entries.sort();

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = dest.with_extension("zip.part");
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .with_aes_encryption(AesMode::Aes256, key);

        let mut writer = ZipWriter::new(BufWriter::new(File::create(&tmp)?));
        for path in &entries {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| CaptureError::Archive(format!("Unnamed entry {:?}", path)))?;
            writer.start_file(name, options)?;
            let mut reader = BufReader::new(File::open(path)?);
            io::copy(&mut reader, &mut writer)?;
        }
        writer.finish()?;
        fs::rename(&tmp, dest)?;

        info!(
            "Archived {} file(s) from {} to {}",
            entries.len(),
            source_dir.display(),
            dest.display()
        );
        Ok(entries.len())
    }

    fn unpack(&self, archive: &Path, dest: &Path, key: &str) -> Result<Vec<PathBuf>> {
        let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;
        fs::create_dir_all(dest)?;

        let mut extracted = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut entry = zip.by_index_decrypt(i, key.as_bytes())?;
            let relative: PathBuf = entry
                .enclosed_name()
                .map(|p| p.to_path_buf())
                .ok_or_else(|| {
                    CaptureError::Archive(format!("Unsafe entry name '{}'", entry.name()))
                })?;
            validation::validate_relative_path(&relative)
                .map_err(|e| CaptureError::Archive(e.to_string()))?;

            let out = dest.join(&relative);
            if entry.is_dir() {
                fs::create_dir_all(&out)?;
                continue;
            }
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = BufWriter::new(File::create(&out)?);
            io::copy(&mut entry, &mut file)?;
            debug!("Extracted {}", out.display());
            extracted.push(out);
        }

        info!(
            "Extracted {} file(s) from {} to {}",
            extracted.len(),
            archive.display(),
            dest.display()
        );
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(dir: &Path) {
        fs::write(dir.join("1_Frame0"), b"frame zero").unwrap();
        fs::write(dir.join("1_Frame1"), b"frame one").unwrap();
        fs::write(dir.join("1_Frame2.part"), b"partial").unwrap();
        fs::create_dir(dir.join("nested")).unwrap();
    }

    #[test]
    fn test_pack_and_unpack_with_key() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        populate(src.path());
        let archive = out.path().join("result.zip");

        let count = ZipArchiver.pack(src.path(), &archive, "HLMJ123456").unwrap();
        assert_eq!(count, 2);
        assert!(archive.exists());

        let dest = out.path().join("TempResult");
        let files = ZipArchiver.unpack(&archive, &dest, "HLMJ123456").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(fs::read(dest.join("1_Frame1")).unwrap(), b"frame one");
        assert!(!dest.join("1_Frame2.part").exists());
    }

    #[test]
    fn test_unpack_with_wrong_key_fails() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        populate(src.path());
        let archive = out.path().join("result.zip");
        ZipArchiver.pack(src.path(), &archive, "right").unwrap();

        let result = ZipArchiver.unpack(&archive, &out.path().join("x"), "wrong");
        assert!(result.is_err());
    }

    #[test]
    fn test_pack_rejects_empty_key() {
        let src = tempfile::tempdir().unwrap();
        let archive = src.path().join("result.zip");
        assert!(matches!(
            ZipArchiver.pack(src.path(), &archive, ""),
            Err(CaptureError::Configuration(_))
        ));
    }
}
