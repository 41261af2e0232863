//! framecap core
//!
//! Captures frames from a host render loop, packs them with a tile-parallel
//! kernel, compresses and persists them on a bounded worker pool, and bundles
//! each session into a keyed archive. The reverse path extracts an archive,
//! rebuilds still images and hands them to FFmpeg.

pub mod archive;
pub mod assembly;
pub mod encoder;
pub mod error;
pub mod kernel;
pub mod manifest;
pub mod pixel;
pub mod reconstruct;
pub mod ring;
pub mod scheduler;
pub mod session;
pub mod surface;

pub use archive::{Archiver, ZipArchiver};
pub use assembly::{
    ensure_ffmpeg, AssemblyCommand, AssemblyHandler, EncoderProcess, FfmpegProcess,
    LoggingHandler,
};
pub use encoder::{EncodeFailure, FrameEncoder};
pub use error::{CaptureError, Result};
pub use kernel::{CpuTileKernel, PixelKernel, TileGrid};
pub use manifest::SessionManifest;
pub use reconstruct::ReconstructReport;
pub use scheduler::{CaptureScheduler, CaptureStats, FrameClock, FrameTicket, TickOutcome};
pub use session::{FinalizeReport, SessionEvent, SessionManager};
pub use surface::{FrameSource, RenderSurface, SyntheticSource};
