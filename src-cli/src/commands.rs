//! CLI command implementations.

use crate::colors;
use crate::exit_codes::ExitCode;
use crate::{ArchiveArgs, RecordOptions};
use framecap_common::config::{self, AppConfig};
use framecap_common::{ImageFormat, ResolutionPolicy};
use framecap_core::{
    ensure_ffmpeg, AssemblyHandler, CaptureError, FinalizeReport, LoggingHandler,
    ReconstructReport, SessionManager, SyntheticSource,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Expand `~` and environment variables in a user-supplied path.
fn expand_path(path: &str) -> String {
    match shellexpand::full(path) {
        Ok(expanded) => expanded.into_owned(),
        Err(_) => shellexpand::tilde(path).into_owned(),
    }
}

fn print_error(msg: &str, quiet: bool) {
    if !quiet {
        eprintln!("{}", colors::error(msg));
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            ExitCode::Success
        }
        Err(e) => {
            eprintln!("{}", colors::error(&format!("Failed to serialize output: {}", e)));
            ExitCode::GeneralError
        }
    }
}

fn open_session(config: AppConfig, handler: Arc<dyn AssemblyHandler>) -> Result<SessionManager, CaptureError> {
    SessionManager::new(config, handler, Handle::current())
}

/// Forwards assembly progress to the terminal.
struct TerminalHandler {
    quiet: bool,
    verbose: bool,
}

impl AssemblyHandler for TerminalHandler {
    fn on_start(&self) {
        LoggingHandler.on_start();
        if !self.quiet {
            eprintln!("{}", colors::info("Assembling video..."));
        }
    }

    fn on_progress(&self, line: &str) {
        LoggingHandler.on_progress(line);
        if self.verbose {
            eprintln!("{}", colors::dim(line));
        }
    }

    fn on_failure(&self, message: &str) {
        LoggingHandler.on_failure(message);
        print_error(message, self.quiet);
    }

    fn on_success(&self, message: &str) {
        LoggingHandler.on_success(message);
    }

    fn on_finish(&self, output: &Path) {
        LoggingHandler.on_finish(output);
    }
}

/// Record a session from the synthetic source until the duration elapses or
/// the user interrupts.
pub async fn record(options: RecordOptions, json: bool, quiet: bool) -> ExitCode {
    if options.render_fps == 0 {
        print_error("--render-fps must be greater than zero.", quiet);
        return ExitCode::InvalidArguments;
    }

    let mut config = config::load_config();
    if let Some(fps) = options.fps {
        config.capture.target_fps = fps;
    }
    if let Some(ring_size) = options.ring_size {
        config.capture.ring_size = ring_size;
    }
    if let Some(password) = options.password {
        config.archive.password = Some(password);
    }
    if let Some(root) = options.cache_root {
        config.paths.cache_root = Some(expand_path(&root));
    }

    let manager = match open_session(config, Arc::new(LoggingHandler)) {
        Ok(manager) => manager,
        Err(e) => {
            print_error(&e.to_string(), quiet);
            return ExitCode::from_error(&e, ExitCode::RecordingFailedToStart);
        }
    };

    let mut source = SyntheticSource::new(options.resolution);
    match manager.start_rec(options.resolution) {
        Ok(true) => {}
        Ok(false) => {
            print_error("A session is already in progress.", quiet);
            return ExitCode::RecordingFailedToStart;
        }
        Err(e) => {
            print_error(&e.to_string(), quiet);
            return ExitCode::from_error(&e, ExitCode::RecordingFailedToStart);
        }
    }

    if !quiet && !json {
        println!(
            "{} {} at {} fps into {}",
            colors::recording("Recording"),
            options.resolution,
            manager.config().capture.target_fps,
            colors::path(&manager.cache_dir().display().to_string())
        );
        println!("{}", colors::dim("Press Ctrl+C to stop."));
    }

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / options.render_fps as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let limit = Duration::from_secs(options.duration);
    let started = Instant::now();
    let mut last = started;
    let mut last_shown = u64::MAX;
    let mut capture_error = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                if !quiet && !json {
                    eprintln!("\n{}", colors::info("Stopping recording..."));
                }
                break;
            }
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        let dt = now.duration_since(last).as_secs_f64();
        last = now;

        let outcome = tokio::task::block_in_place(|| manager.tick(dt, &mut source));
        match outcome {
            Ok(outcome) => debug!("tick {:.4}s: {:?}", dt, outcome),
            Err(e) if !e.is_fatal() => warn!("Frame skipped: {}", e),
            Err(e) => {
                capture_error = Some(e);
                break;
            }
        }

        let elapsed = started.elapsed();
        if !quiet && !json && elapsed.as_secs() != last_shown {
            last_shown = elapsed.as_secs();
            print!(
                "\r{} {}  {} frames",
                colors::recording("Recording:"),
                colors::elapsed_time(last_shown / 60, last_shown % 60),
                colors::number(&manager.frame_count().to_string())
            );
            std::io::stdout().flush().ok();
        }
        if elapsed >= limit {
            if !quiet && !json {
                eprintln!("\n{}", colors::info("Duration limit reached. Stopping recording..."));
            }
            break;
        }
    }

    if let Err(e) = manager.stop_rec() {
        print_error(&e.to_string(), quiet);
        return ExitCode::RecordingFailedDuringCapture;
    }
    if !quiet && !json {
        println!(
            "{} {}",
            colors::dim("State:"),
            colors::state(manager.state())
        );
    }
    let finalized = manager.wait_finalized().await;

    if let Some(e) = capture_error {
        print_error(&format!("Capture failed: {}", e), quiet);
        return ExitCode::RecordingFailedDuringCapture;
    }

    match finalized {
        Ok(report) => {
            if json {
                print_json(&report)
            } else {
                if !quiet {
                    print_finalize_report(&report);
                }
                ExitCode::Success
            }
        }
        Err(e) => {
            print_error(&format!("Finalization failed: {}", e), quiet);
            ExitCode::from_error(&e, ExitCode::FinalizationFailed)
        }
    }
}

fn print_finalize_report(report: &FinalizeReport) {
    let stats = &report.stats;
    println!("{}", colors::success("Recording saved"));
    let rows = [
        ("Archive", colors::path(&report.archive_path.display().to_string())),
        ("Key", colors::bold(&report.key)),
        ("Resolution", stats.resolution.to_string()),
        ("Frames", colors::number(&stats.frames.to_string())),
        ("Overwritten", stats.overwritten.to_string()),
        ("Throttled", report.throttled.to_string()),
        ("Duration", format!("{:.2}s", stats.elapsed_secs)),
        ("Actual FPS", stats.actual_fps_display()),
        ("Bytes", colors::number(&report.bytes_written.to_string())),
    ];
    for (label, value) in rows {
        println!("  {} {}", colors::pad_left(label, 12, colors::header), value);
    }
    if stats.overwritten > 0 {
        eprintln!(
            "{}",
            colors::warning(&format!(
                "{} frame(s) were overwritten; raise capture.ring_size to keep them.",
                stats.overwritten
            ))
        );
    }
}

fn print_reconstruct_report(report: &ReconstructReport) {
    println!(
        "{} {} frame(s) at {}",
        colors::success("Rebuilt"),
        colors::number(&report.frames.len().to_string()),
        report.resolution
    );
    println!(
        "  {} {}",
        colors::pad_left("Pattern", 10, colors::header),
        colors::path(&report.pattern.display().to_string())
    );
    println!("  {} {:.3}", colors::pad_left("FPS", 10, colors::header), report.fps);
    if let Some(audio) = &report.audio {
        println!(
            "  {} {}",
            colors::pad_left("Audio", 10, colors::header),
            colors::path(&audio.display().to_string())
        );
    }
}

fn frames_dir(config: &AppConfig, out: Option<String>) -> Result<PathBuf, String> {
    match out {
        Some(out) => Ok(PathBuf::from(expand_path(&out))),
        None => config.output_dir().map(|dir| dir.join("frames")),
    }
}

async fn reconstruct(
    manager: &SessionManager,
    args: &ArchiveArgs,
    out_dir: &Path,
) -> Result<ReconstructReport, CaptureError> {
    let archive = PathBuf::from(expand_path(&args.archive));
    if !archive.exists() {
        return Err(CaptureError::Configuration(format!(
            "Archive not found: {}",
            archive.display()
        )));
    }
    manager
        .extract_and_reconstruct(&archive, &args.key, &manager.extract_dir(), out_dir)
        .await
}

/// Extract an archive and rebuild its frames as still images.
pub async fn extract(args: ArchiveArgs, out: Option<String>, json: bool, quiet: bool) -> ExitCode {
    let config = config::load_config();
    let out_dir = match frames_dir(&config, out) {
        Ok(dir) => dir,
        Err(e) => {
            print_error(&e, quiet);
            return ExitCode::ConfigurationInvalid;
        }
    };
    let manager = match open_session(config, Arc::new(LoggingHandler)) {
        Ok(manager) => manager,
        Err(e) => {
            print_error(&e.to_string(), quiet);
            return ExitCode::from_error(&e, ExitCode::ExtractionFailed);
        }
    };

    match reconstruct(&manager, &args, &out_dir).await {
        Ok(report) => {
            if json {
                print_json(&report)
            } else {
                if !quiet {
                    print_reconstruct_report(&report);
                }
                ExitCode::Success
            }
        }
        Err(e) => {
            print_error(&format!("Extraction failed: {}", e), quiet);
            ExitCode::from_error(&e, ExitCode::ExtractionFailed)
        }
    }
}

/// Extract an archive, rebuild its frames and assemble them into a video.
pub async fn assemble(
    args: ArchiveArgs,
    output: Option<String>,
    clear: bool,
    json: bool,
    quiet: bool,
    verbose: bool,
) -> ExitCode {
    let config = config::load_config();
    let out_dir = match frames_dir(&config, None) {
        Ok(dir) => dir,
        Err(e) => {
            print_error(&e, quiet);
            return ExitCode::ConfigurationInvalid;
        }
    };
    let output = match output {
        Some(path) => PathBuf::from(expand_path(&path)),
        None => match config.output_dir() {
            Ok(dir) => dir.join(&config.video.file_name),
            Err(e) => {
                print_error(&e, quiet);
                return ExitCode::ConfigurationInvalid;
            }
        },
    };

    let handler = Arc::new(TerminalHandler {
        quiet: quiet || json,
        verbose,
    });
    let manager = match open_session(config, handler) {
        Ok(manager) => manager,
        Err(e) => {
            print_error(&e.to_string(), quiet);
            return ExitCode::from_error(&e, ExitCode::AssemblyFailed);
        }
    };

    let report = match reconstruct(&manager, &args, &out_dir).await {
        Ok(report) => report,
        Err(e) => {
            print_error(&format!("Extraction failed: {}", e), quiet);
            return ExitCode::from_error(&e, ExitCode::ExtractionFailed);
        }
    };

    match tokio::task::spawn_blocking(ensure_ffmpeg).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            print_error(&e.to_string(), quiet);
            return ExitCode::AssemblyFailed;
        }
        Err(e) => {
            print_error(&e.to_string(), quiet);
            return ExitCode::GeneralError;
        }
    }

    let written = match manager.assemble_video(&report, &output).await {
        Ok(path) => path,
        Err(e) => {
            print_error(&format!("Assembly failed: {}", e), quiet);
            return ExitCode::AssemblyFailed;
        }
    };

    if clear {
        if let Err(e) = manager.clear() {
            if !quiet {
                eprintln!("{}", colors::warning(&format!("Could not clear cache: {}", e)));
            }
        }
    }

    if json {
        print_json(&serde_json::json!({
            "output": written,
            "frames": report.frames.len(),
            "fps": report.fps,
            "cleared": clear,
        }))
    } else {
        if !quiet {
            println!(
                "{} {}",
                colors::success("Video written to"),
                colors::path(&written.display().to_string())
            );
        }
        ExitCode::Success
    }
}

/// Remove the recording cache.
/// Remove the recording cache through the session manager. Returns the
/// cache directory and whether anything was removed.
fn clear_cache(manager: &SessionManager) -> Result<(PathBuf, bool), CaptureError> {
    let cache_dir = manager.cache_dir();
    let existed = cache_dir.exists();
    manager.clear()?;
    Ok((cache_dir, existed))
}

pub fn clear(json: bool, quiet: bool) -> ExitCode {
    let config = config::load_config();
    let manager = match open_session(config, Arc::new(LoggingHandler)) {
        Ok(manager) => manager,
        Err(e) => {
            print_error(&e.to_string(), quiet);
            return ExitCode::from_error(&e, ExitCode::GeneralError);
        }
    };
    let (cache_dir, existed) = match clear_cache(&manager) {
        Ok(cleared) => cleared,
        Err(e) => {
            print_error(&e.to_string(), quiet);
            return ExitCode::from_error(&e, ExitCode::GeneralError);
        }
    };

    if json {
        print_json(&serde_json::json!({ "cache_dir": cache_dir, "removed": existed }))
    } else {
        if !quiet {
            if existed {
                println!(
                    "{} {}",
                    colors::success("Removed"),
                    colors::path(&cache_dir.display().to_string())
                );
            } else {
                println!("{}", colors::dim("Nothing to clear."));
            }
        }
        ExitCode::Success
    }
}

fn optional(value: &str) -> Option<String> {
    if value.eq_ignore_ascii_case("none") || value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| format!("Invalid value '{}' for {}: {}", value, key, e))
}

/// Apply one `key = value` setting to `config`.
pub fn apply_setting(config: &mut AppConfig, key: &str, value: &str) -> Result<(), String> {
    match key {
        "capture.target_fps" => config.capture.target_fps = parse(key, value)?,
        "capture.interval_multiplier" => config.capture.interval_multiplier = parse(key, value)?,
        "capture.ring_size" => config.capture.ring_size = parse(key, value)?,
        "capture.prime_first_frame" => config.capture.prime_first_frame = parse(key, value)?,
        "capture.resolution_policy" => {
            config.capture.resolution_policy = ResolutionPolicy::from_str(value)
                .ok_or_else(|| format!("Invalid value '{}' for {}: expected reject, crop or pad", value, key))?
        }
        "capture.kernel_threads" => {
            config.capture.kernel_threads = match optional(value) {
                Some(v) => Some(parse(key, &v)?),
                None => None,
            }
        }
        "encoder.max_in_flight" => config.encoder.max_in_flight = parse(key, value)?,
        "encoder.max_retries" => config.encoder.max_retries = parse(key, value)?,
        "encoder.compression_level" => config.encoder.compression_level = parse(key, value)?,
        "encoder.drain_timeout_secs" => config.encoder.drain_timeout_secs = parse(key, value)?,
        "archive.password" => config.archive.password = optional(value),
        "archive.file_name" => config.archive.file_name = value.to_string(),
        "video.codec" => config.video.codec = value.to_string(),
        "video.crf" => config.video.crf = parse(key, value)?,
        "video.pix_fmt" => config.video.pix_fmt = value.to_string(),
        "video.file_name" => config.video.file_name = value.to_string(),
        "video.image_format" => {
            config.video.image_format = ImageFormat::from_str(value)
                .ok_or_else(|| format!("Invalid value '{}' for {}: expected jpeg or png", value, key))?
        }
        "video.jpeg_quality" => config.video.jpeg_quality = parse(key, value)?,
        "video.flip_vertical" => config.video.flip_vertical = parse(key, value)?,
        "paths.cache_root" => config.paths.cache_root = optional(value).map(|p| expand_path(&p)),
        "paths.output_dir" => config.paths.output_dir = optional(value).map(|p| expand_path(&p)),
        _ => return Err(format!("Unknown configuration key '{}'", key)),
    }
    Ok(())
}

/// Print the effective configuration.
pub fn config_show(json: bool) -> ExitCode {
    let config = config::load_config();
    if json {
        return print_json(&config);
    }

    let value = match serde_json::to_value(&config) {
        Ok(value) => value,
        Err(e) => {
            eprintln!("{}", colors::error(&e.to_string()));
            return ExitCode::GeneralError;
        }
    };
    let Some(groups) = value.as_object() else {
        return ExitCode::GeneralError;
    };
    for (group, fields) in groups {
        println!("{}", colors::header(&format!("[{}]", group)));
        if let Some(fields) = fields.as_object() {
            for (name, field) in fields {
                let shown = match field {
                    serde_json::Value::Null => colors::dim("none"),
                    serde_json::Value::String(s) if name == "password" => {
                        colors::dim(&"*".repeat(s.len().min(8)))
                    }
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                println!("  {} {}", colors::pad_left(name, 22, colors::bold), shown);
            }
        }
    }
    ExitCode::Success
}

/// Print the configuration file path.
pub fn config_path(json: bool) -> ExitCode {
    match config::get_config_path() {
        Ok(path) => {
            if json {
                print_json(&serde_json::json!({ "path": path, "exists": path.exists() }))
            } else {
                println!("{}", colors::path(&path.display().to_string()));
                ExitCode::Success
            }
        }
        Err(e) => {
            eprintln!("{}", colors::error(&e));
            ExitCode::ConfigurationInvalid
        }
    }
}

/// Change a single configuration value and save it.
pub fn config_set(key: &str, value: &str, json: bool, quiet: bool) -> ExitCode {
    let mut config = config::load_config();
    if let Err(e) = apply_setting(&mut config, key, value) {
        print_error(&e, quiet);
        return ExitCode::InvalidArguments;
    }
    if let Err(e) = config.validate() {
        print_error(&e.to_string(), quiet);
        return ExitCode::ConfigurationInvalid;
    }
    if let Err(e) = config::save_config(&config) {
        print_error(&e, quiet);
        return ExitCode::ConfigurationInvalid;
    }

    if json {
        print_json(&serde_json::json!({ "key": key, "value": value }))
    } else {
        if !quiet {
            println!("{} {} = {}", colors::success("Set"), colors::bold(key), value);
        }
        ExitCode::Success
    }
}

/// Overwrite the configuration file with defaults.
pub fn config_reset(json: bool, quiet: bool) -> ExitCode {
    if let Err(e) = config::save_config(&AppConfig::new()) {
        print_error(&e, quiet);
        return ExitCode::ConfigurationInvalid;
    }
    if json {
        print_json(&serde_json::json!({ "reset": true }))
    } else {
        if !quiet {
            println!("{}", colors::success("Configuration reset to defaults"));
        }
        ExitCode::Success
    }
}

pub fn version(json: bool) {
    let version = env!("CARGO_PKG_VERSION");
    let ffmpeg = which::which("ffmpeg").ok();
    if json {
        println!(
            "{}",
            serde_json::json!({ "version": version, "ffmpeg": ffmpeg })
        );
    } else {
        println!("{} {}", colors::bold("framecap"), version);
        match ffmpeg {
            Some(path) => println!(
                "{} {}",
                colors::dim("ffmpeg:"),
                colors::path(&path.display().to_string())
            ),
            None => println!("{} {}", colors::dim("ffmpeg:"), colors::dim("not found in PATH")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn clear_cache_goes_through_session_manager() {
        let root = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.cache_root = Some(root.path().to_string_lossy().into_owned());
        config.capture.kernel_threads = Some(1);
        let manager = open_session(config, Arc::new(LoggingHandler)).unwrap();

        std::fs::create_dir_all(manager.cache_dir()).unwrap();
        std::fs::write(manager.cache_dir().join("1_Frame0"), b"x").unwrap();

        let (dir, removed) = clear_cache(&manager).unwrap();
        assert!(removed);
        assert_eq!(dir, manager.cache_dir());
        assert!(!dir.exists());

        let (_, removed) = clear_cache(&manager).unwrap();
        assert!(!removed);
    }

    #[test]
    fn apply_setting_updates_typed_fields() {
        let mut config = AppConfig::default();
        apply_setting(&mut config, "capture.target_fps", "24").unwrap();
        apply_setting(&mut config, "capture.resolution_policy", "crop").unwrap();
        apply_setting(&mut config, "video.image_format", "PNG").unwrap();
        apply_setting(&mut config, "video.flip_vertical", "true").unwrap();
        apply_setting(&mut config, "capture.kernel_threads", "4").unwrap();

        assert_eq!(config.capture.target_fps, 24);
        assert_eq!(config.capture.resolution_policy, ResolutionPolicy::Crop);
        assert_eq!(config.video.image_format, ImageFormat::Png);
        assert!(config.video.flip_vertical);
        assert_eq!(config.capture.kernel_threads, Some(4));
    }

    #[test]
    fn apply_setting_none_clears_optional_values() {
        let mut config = AppConfig::default();
        apply_setting(&mut config, "archive.password", "HLMJ123456").unwrap();
        assert_eq!(config.archive.password.as_deref(), Some("HLMJ123456"));
        apply_setting(&mut config, "archive.password", "none").unwrap();
        assert!(config.archive.password.is_none());
    }

    #[test]
    fn apply_setting_rejects_bad_input() {
        let mut config = AppConfig::default();
        assert!(apply_setting(&mut config, "capture.target_fps", "fast").is_err());
        assert!(apply_setting(&mut config, "capture.resolution_policy", "stretch").is_err());
        assert!(apply_setting(&mut config, "no.such.key", "1").is_err());
        assert_eq!(config.capture.target_fps, AppConfig::default().capture.target_fps);
    }

    #[test]
    fn expand_path_leaves_plain_paths_alone() {
        assert_eq!(expand_path("/tmp/framecap"), "/tmp/framecap");
    }

    #[test]
    fn frames_dir_prefers_explicit_path() {
        let config = AppConfig::default();
        let dir = frames_dir(&config, Some("/tmp/out".to_string())).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/out"));
    }
}
