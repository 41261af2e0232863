//! Video assembly through an external encoder process (FFmpeg).

use crate::error::{CaptureError, Result};
use crate::reconstruct::ReconstructReport;
use ffmpeg_sidecar::command::FfmpegCommand;
use framecap_common::config::VideoConfig;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, error, info, warn};

/// Receives progress from a running assembly.
///
/// Injected into the session; every method has a no-op default.
pub trait AssemblyHandler: Send + Sync {
    fn on_start(&self) {}
    fn on_progress(&self, _line: &str) {}
    fn on_failure(&self, _message: &str) {}
    fn on_success(&self, _message: &str) {}
    fn on_finish(&self, _output: &Path) {}
}

/// Handler that forwards everything to tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl AssemblyHandler for LoggingHandler {
    fn on_start(&self) {
        info!("Video assembly started");
    }

    fn on_progress(&self, line: &str) {
        debug!("[ffmpeg] {}", line);
    }

    fn on_failure(&self, message: &str) {
        error!("Video assembly failed: {}", message);
    }

    fn on_success(&self, message: &str) {
        info!("Video assembly succeeded: {}", message);
    }

    fn on_finish(&self, output: &Path) {
        info!("Video assembly finished: {}", output.display());
    }
}

/// Arguments for one encoder invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyCommand {
    pub framerate: f64,
    pub input_pattern: PathBuf,
    pub audio: Option<PathBuf>,
    /// Audio is trimmed to this length so it matches the frames.
    pub duration_secs: f64,
    pub codec: String,
    pub crf: u32,
    pub pix_fmt: String,
    pub output: PathBuf,
}

fn path_arg(path: &Path) -> Result<String> {
    let s = path.to_string_lossy();
    if s.is_empty() {
        return Err(CaptureError::Configuration(
            "Encoder path argument is empty".to_string(),
        ));
    }
    Ok(s.into_owned())
}

/// Wrap a path in double quotes for display as a single command line.
pub fn quote_path(path: &Path) -> Result<String> {
    Ok(format!("\"{}\"", path_arg(path)?))
}

impl AssemblyCommand {
    pub fn from_report(report: &ReconstructReport, video: &VideoConfig, output: &Path) -> Self {
        Self {
            framerate: report.fps,
            input_pattern: report.pattern.clone(),
            audio: report.audio.clone(),
            duration_secs: report.duration_secs,
            codec: video.codec.clone(),
            crf: video.crf,
            pix_fmt: video.pix_fmt.clone(),
            output: output.to_path_buf(),
        }
    }

    fn format_rate(&self) -> String {
        let rounded = format!("{:.3}", self.framerate);
        rounded
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    }

    /// Argument vector, without the program name.
    pub fn args(&self) -> Result<Vec<String>> {
        if !(self.framerate.is_finite() && self.framerate > 0.0) {
            return Err(CaptureError::Configuration(format!(
                "Invalid frame rate {}",
                self.framerate
            )));
        }

        let mut args = vec![
            "-y".to_string(),
            "-framerate".to_string(),
            self.format_rate(),
            "-f".to_string(),
            "image2".to_string(),
            "-i".to_string(),
            path_arg(&self.input_pattern)?,
        ];
        if let Some(audio) = &self.audio {
            args.extend([
                "-i".to_string(),
                path_arg(audio)?,
                "-ss".to_string(),
                "0".to_string(),
                "-t".to_string(),
                format!("{:.3}", self.duration_secs),
            ]);
        }
        args.extend([
            "-vcodec".to_string(),
            self.codec.clone(),
            "-crf".to_string(),
            self.crf.to_string(),
            "-pix_fmt".to_string(),
            self.pix_fmt.clone(),
            path_arg(&self.output)?,
        ]);
        Ok(args)
    }

    /// The arguments as one string with paths quoted.
    pub fn command_line(&self) -> Result<String> {
        let mut parts = vec![
            "-y".to_string(),
            format!("-framerate {}", self.format_rate()),
            "-f image2".to_string(),
            format!("-i {}", quote_path(&self.input_pattern)?),
        ];
        if let Some(audio) = &self.audio {
            parts.push(format!(
                "-i {} -ss 0 -t {:.3}",
                quote_path(audio)?,
                self.duration_secs
            ));
        }
        parts.push(format!(
            "-vcodec {} -crf {} -pix_fmt {}",
            self.codec, self.crf, self.pix_fmt
        ));
        parts.push(quote_path(&self.output)?);
        Ok(parts.join(" "))
    }
}

/// Runs an [`AssemblyCommand`] to completion.
pub trait EncoderProcess: Send + Sync {
    fn run(&self, command: &AssemblyCommand, handler: &dyn AssemblyHandler) -> Result<()>;
}

/// Resolve the FFmpeg binary: the system one on Linux, the sidecar next to
/// the executable elsewhere.
pub fn resolve_ffmpeg_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("ffmpeg")
    }
    #[cfg(not(target_os = "linux"))]
    {
        ffmpeg_sidecar::paths::ffmpeg_path()
    }
}

/// Verify FFmpeg can be executed, downloading it on Linux as a last resort.
pub fn ensure_ffmpeg() -> Result<()> {
    let ffmpeg = resolve_ffmpeg_path();
    match Command::new(&ffmpeg)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {
            debug!("FFmpeg verified at {}", ffmpeg.display());
            Ok(())
        }
        Ok(status) => Err(CaptureError::ExternalProcess(format!(
            "FFmpeg at {} exited with status: {}",
            ffmpeg.display(),
            status
        ))),
        Err(e) => {
            warn!("FFmpeg not found at {}: {}", ffmpeg.display(), e);
            #[cfg(target_os = "linux")]
            {
                info!("Attempting FFmpeg auto-download");
                ffmpeg_sidecar::download::auto_download().map_err(|e| {
                    CaptureError::ExternalProcess(format!(
                        "FFmpeg not found and auto-download failed: {}",
                        e
                    ))
                })
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(CaptureError::ExternalProcess(format!(
                    "FFmpeg not found at {}",
                    ffmpeg.display()
                )))
            }
        }
    }
}

/// FFmpeg driven through ffmpeg-sidecar.
#[derive(Debug, Clone)]
pub struct FfmpegProcess {
    path: PathBuf,
}

impl Default for FfmpegProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegProcess {
    pub fn new() -> Self {
        Self::with_path(resolve_ffmpeg_path())
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EncoderProcess for FfmpegProcess {
    fn run(&self, command: &AssemblyCommand, handler: &dyn AssemblyHandler) -> Result<()> {
        let args = command.args()?;
        info!("Running {} {}", self.path.display(), command.command_line()?);
        handler.on_start();

        let mut ffmpeg = FfmpegCommand::new_with_path(&self.path);
        ffmpeg.args(&args);
        let inner = ffmpeg.as_inner_mut();
        inner.stdin(Stdio::null());
        inner.stdout(Stdio::null());
        inner.stderr(Stdio::piped());

        let mut child = match inner.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to start FFmpeg: {}", e);
                handler.on_failure(&message);
                handler.on_finish(&command.output);
                return Err(CaptureError::ExternalProcess(message));
            }
        };

        // FFmpeg ends progress lines with '\r', everything else with '\n'.
        let mut last_line = String::new();
        if let Some(stderr) = child.stderr.take() {
            for chunk in BufReader::new(stderr).split(b'\n') {
                let Ok(chunk) = chunk else { break };
                for part in chunk.split(|&b| b == b'\r') {
                    let line = String::from_utf8_lossy(part);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    handler.on_progress(line);
                    last_line = line.to_string();
                }
            }
        }

        let status = child.wait().map_err(|e| {
            CaptureError::ExternalProcess(format!("FFmpeg process error: {}", e))
        });

        let result = match status {
            Ok(status) if status.success() => {
                handler.on_success(&last_line);
                Ok(())
            }
            Ok(status) => {
                let message = if last_line.is_empty() {
                    format!("FFmpeg exited with code: {:?}", status.code())
                } else {
                    last_line.clone()
                };
                handler.on_failure(&message);
                Err(CaptureError::ExternalProcess(message))
            }
            Err(e) => {
                handler.on_failure(&e.to_string());
                Err(e)
            }
        };
        handler.on_finish(&command.output);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn command(audio: Option<&str>) -> AssemblyCommand {
        AssemblyCommand {
            framerate: 15.0,
            input_pattern: PathBuf::from("/tmp/out/frame_%d.jpg"),
            audio: audio.map(PathBuf::from),
            duration_secs: 2.5,
            codec: "libx264".to_string(),
            crf: 25,
            pix_fmt: "yuv420p".to_string(),
            output: PathBuf::from("/tmp/out/ScreenCapture.mp4"),
        }
    }

    #[test]
    fn test_args_without_audio() {
        let args = command(None).args().unwrap();
        assert_eq!(
            args,
            vec![
                "-y",
                "-framerate",
                "15",
                "-f",
                "image2",
                "-i",
                "/tmp/out/frame_%d.jpg",
                "-vcodec",
                "libx264",
                "-crf",
                "25",
                "-pix_fmt",
                "yuv420p",
                "/tmp/out/ScreenCapture.mp4",
            ]
        );
    }

    #[test]
    fn test_command_line_with_audio() {
        let line = command(Some("/tmp/a b/RecordedAudio.wav"))
            .command_line()
            .unwrap();
        assert_eq!(
            line,
            "-y -framerate 15 -f image2 -i \"/tmp/out/frame_%d.jpg\" \
             -i \"/tmp/a b/RecordedAudio.wav\" -ss 0 -t 2.500 \
             -vcodec libx264 -crf 25 -pix_fmt yuv420p \"/tmp/out/ScreenCapture.mp4\""
        );
    }

    #[test]
    fn test_fractional_framerate() {
        let mut cmd = command(None);
        cmd.framerate = 14.2857142;
        assert_eq!(cmd.args().unwrap()[2], "14.286");
    }

    #[test]
    fn test_empty_path_is_configuration_error() {
        let mut cmd = command(None);
        cmd.output = PathBuf::new();
        assert!(matches!(cmd.args(), Err(CaptureError::Configuration(_))));
        assert!(matches!(
            cmd.command_line(),
            Err(CaptureError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_framerate_rejected() {
        let mut cmd = command(None);
        cmd.framerate = 0.0;
        assert!(cmd.args().is_err());
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl AssemblyHandler for Recorder {
        fn on_start(&self) {
            self.0.lock().unwrap().push("start".into());
        }
        fn on_failure(&self, _message: &str) {
            self.0.lock().unwrap().push("failure".into());
        }
        fn on_success(&self, _message: &str) {
            self.0.lock().unwrap().push("success".into());
        }
        fn on_finish(&self, _output: &Path) {
            self.0.lock().unwrap().push("finish".into());
        }
    }

    #[test]
    fn test_missing_binary_reports_failure_then_finish() {
        let process = FfmpegProcess::with_path("/nonexistent/framecap-ffmpeg");
        let handler = Recorder::default();
        let result = process.run(&command(None), &handler);

        assert!(matches!(result, Err(CaptureError::ExternalProcess(_))));
        assert_eq!(
            *handler.0.lock().unwrap(),
            vec!["start", "failure", "finish"]
        );
    }
}
