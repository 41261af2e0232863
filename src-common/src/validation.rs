//! Input validation for capture parameters, file names and archive entries.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path};

/// Plain file names: no separators, no leading dot, 1-128 chars.
static FILE_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\- ]{0,127}$").expect("valid regex"));

/// Maximum dimension value (must be positive)
pub const MAX_DIMENSION: u32 = 16384;

/// Highest capture rate accepted.
pub const MAX_TARGET_FPS: u32 = 240;

/// Largest frame ring accepted.
pub const MAX_RING_SIZE: u32 = 100_000;

/// Maximum path length in characters.
pub const MAX_PATH_LENGTH: usize = 4096;

/// Validation error types.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Dimension (width/height) is out of valid range
    DimensionOutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },
    /// Integer setting outside its accepted range
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    /// Floating point setting that is not finite or not positive
    NotPositive { field: &'static str, value: f64 },
    /// Required string is empty
    Empty(&'static str),
    /// File name contains separators or characters outside the allowed set
    InvalidFileName { field: &'static str, name: String },
    /// Path contains directory traversal sequences (..)
    ContainsTraversal(String),
    /// Path contains null bytes
    ContainsNullByte,
    /// Path is too long
    PathTooLong(usize),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::DimensionOutOfRange { field, value, max } => {
                write!(f, "{} out of range: {} (max {})", field, value, max)
            }
            ValidationError::OutOfRange {
                field,
                value,
                min,
                max,
            } => write!(f, "{} out of range: {} (expected {}..={})", field, value, min, max),
            ValidationError::NotPositive { field, value } => {
                write!(f, "{} must be a positive number, got {}", field, value)
            }
            ValidationError::Empty(field) => write!(f, "{} must not be empty", field),
            ValidationError::InvalidFileName { field, name } => {
                write!(f, "Invalid {}: '{}'", field, name)
            }
            ValidationError::ContainsTraversal(p) => {
                write!(f, "Path contains directory traversal: {}", p)
            }
            ValidationError::ContainsNullByte => write!(f, "Path contains null byte"),
            ValidationError::PathTooLong(len) => write!(f, "Path too long: {} chars", len),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate dimension values (width, height).
///
/// Dimensions must be positive and not exceed MAX_DIMENSION (16384).
pub fn validate_dimensions(width: u32, height: u32) -> Result<(), ValidationError> {
    if width == 0 || width > MAX_DIMENSION {
        return Err(ValidationError::DimensionOutOfRange {
            field: "width",
            value: width,
            max: MAX_DIMENSION,
        });
    }
    if height == 0 || height > MAX_DIMENSION {
        return Err(ValidationError::DimensionOutOfRange {
            field: "height",
            value: height,
            max: MAX_DIMENSION,
        });
    }
    Ok(())
}

pub fn validate_target_fps(fps: u32) -> Result<(), ValidationError> {
    if fps == 0 || fps > MAX_TARGET_FPS {
        return Err(ValidationError::OutOfRange {
            field: "capture.target_fps",
            value: fps as i64,
            min: 1,
            max: MAX_TARGET_FPS as i64,
        });
    }
    Ok(())
}

pub fn validate_interval_multiplier(k: f64) -> Result<(), ValidationError> {
    if !k.is_finite() || k <= 0.0 {
        return Err(ValidationError::NotPositive {
            field: "capture.interval_multiplier",
            value: k,
        });
    }
    Ok(())
}

pub fn validate_ring_size(size: u32) -> Result<(), ValidationError> {
    if size == 0 || size > MAX_RING_SIZE {
        return Err(ValidationError::OutOfRange {
            field: "capture.ring_size",
            value: size as i64,
            min: 1,
            max: MAX_RING_SIZE as i64,
        });
    }
    Ok(())
}

/// zstd accepts levels 1 through 22; 22 needs ultra mode, so cap at 21.
pub fn validate_compression_level(level: i32) -> Result<(), ValidationError> {
    if !(1..=21).contains(&level) {
        return Err(ValidationError::OutOfRange {
            field: "encoder.compression_level",
            value: level as i64,
            min: 1,
            max: 21,
        });
    }
    Ok(())
}

/// Validate a bare file name used inside the cache or output directory.
pub fn validate_file_name(field: &'static str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if !FILE_NAME_PATTERN.is_match(name) {
        return Err(ValidationError::InvalidFileName {
            field,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Validate a relative path taken from an untrusted source such as an
/// archive entry. Only normal components are allowed.
pub fn validate_relative_path(path: &Path) -> Result<(), ValidationError> {
    let path_str = path.to_string_lossy();

    if path_str.contains('\0') {
        return Err(ValidationError::ContainsNullByte);
    }

    if path_str.len() > MAX_PATH_LENGTH {
        return Err(ValidationError::PathTooLong(path_str.len()));
    }

    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(ValidationError::ContainsTraversal(path_str.into_owned())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_dimensions() {
        assert!(validate_dimensions(1920, 1080).is_ok());
        assert!(validate_dimensions(2, 2).is_ok());
        assert!(validate_dimensions(MAX_DIMENSION, MAX_DIMENSION).is_ok());

        assert!(validate_dimensions(0, 1080).is_err());
        assert!(validate_dimensions(1920, 0).is_err());
        assert!(validate_dimensions(MAX_DIMENSION + 1, 1080).is_err());
    }

    #[test]
    fn test_target_fps() {
        assert!(validate_target_fps(30).is_ok());
        assert!(validate_target_fps(0).is_err());
        assert!(validate_target_fps(MAX_TARGET_FPS + 1).is_err());
    }

    #[test]
    fn test_interval_multiplier() {
        assert!(validate_interval_multiplier(2.0).is_ok());
        assert!(validate_interval_multiplier(0.5).is_ok());
        assert!(validate_interval_multiplier(0.0).is_err());
        assert!(validate_interval_multiplier(-1.0).is_err());
        assert!(validate_interval_multiplier(f64::NAN).is_err());
    }

    #[test]
    fn test_ring_size() {
        assert!(validate_ring_size(100).is_ok());
        assert!(validate_ring_size(0).is_err());
    }

    #[test]
    fn test_compression_level() {
        assert!(validate_compression_level(3).is_ok());
        assert!(validate_compression_level(0).is_err());
        assert!(validate_compression_level(22).is_err());
    }

    #[test]
    fn test_valid_file_names() {
        assert!(validate_file_name("f", "result.zip").is_ok());
        assert!(validate_file_name("f", "ScreenCapture.mp4").is_ok());
        assert!(validate_file_name("f", "my video-01.mp4").is_ok());
    }

    #[test]
    fn test_invalid_file_names() {
        assert!(matches!(
            validate_file_name("f", ""),
            Err(ValidationError::Empty("f"))
        ));
        assert!(validate_file_name("f", "../x.mp4").is_err());
        assert!(validate_file_name("f", "dir/x.mp4").is_err());
        assert!(validate_file_name("f", ".hidden").is_err());
        assert!(validate_file_name("f", &"a".repeat(129)).is_err());
    }

    #[test]
    fn test_relative_path_rejects_traversal() {
        let path = PathBuf::from("frames/../../etc/passwd");
        assert!(matches!(
            validate_relative_path(&path),
            Err(ValidationError::ContainsTraversal(_))
        ));
        assert!(validate_relative_path(Path::new("/etc/passwd")).is_err());
        assert!(validate_relative_path(Path::new("1_Frame0")).is_ok());
    }

    #[test]
    fn test_relative_path_rejects_null_byte() {
        let path = PathBuf::from("1_Frame\00");
        assert!(matches!(
            validate_relative_path(&path),
            Err(ValidationError::ContainsNullByte)
        ));
    }
}
