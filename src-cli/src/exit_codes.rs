//! Exit codes for the CLI.
//!
//! These codes enable scripting integration by providing structured
//! feedback about operation results.

use framecap_core::CaptureError;

/// Exit codes for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Operation completed successfully
    Success = 0,
    /// General/unspecified error
    GeneralError = 1,
    /// Invalid command-line arguments
    InvalidArguments = 2,
    /// Configuration could not be loaded, validated or saved
    ConfigurationInvalid = 3,
    /// Recording failed to start
    RecordingFailedToStart = 4,
    /// Recording failed during capture
    RecordingFailedDuringCapture = 5,
    /// Encoders could not be drained or the archive could not be written
    FinalizationFailed = 6,
    /// Archive could not be opened, decrypted or rebuilt into images
    ExtractionFailed = 7,
    /// FFmpeg missing or exited with an error
    AssemblyFailed = 8,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn description(self) -> &'static str {
        match self {
            ExitCode::Success => "success",
            ExitCode::GeneralError => "general error",
            ExitCode::InvalidArguments => "invalid arguments",
            ExitCode::ConfigurationInvalid => "configuration invalid",
            ExitCode::RecordingFailedToStart => "recording failed to start",
            ExitCode::RecordingFailedDuringCapture => "recording failed during capture",
            ExitCode::FinalizationFailed => "session could not be finalized",
            ExitCode::ExtractionFailed => "archive could not be extracted",
            ExitCode::AssemblyFailed => "video assembly failed",
        }
    }

    /// Pick an exit code for `err`, using `fallback` for errors that belong to
    /// the failing step rather than a specific cause.
    pub fn from_error(err: &CaptureError, fallback: ExitCode) -> ExitCode {
        match err {
            CaptureError::Configuration(_) => ExitCode::ConfigurationInvalid,
            CaptureError::ExternalProcess(_) => ExitCode::AssemblyFailed,
            _ => fallback,
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}
