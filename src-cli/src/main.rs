//! framecap Command-Line Interface
//!
//! Records capture sessions from a synthetic render loop, and extracts,
//! rebuilds and assembles finished session archives into videos.

mod colors;
mod commands;
mod exit_codes;

use clap::{Parser, Subcommand};
use exit_codes::ExitCode;
use framecap_common::logging::{ensure_log_dir, LOG_FILE_PREFIX};
use framecap_common::Resolution;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// framecap - Frame Capture CLI
#[derive(Parser, Debug)]
#[command(name = "framecap")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format for scripting
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record a session from the built-in test pattern source
    Record {
        #[command(flatten)]
        options: RecordOptions,
    },
    /// Extract a session archive and rebuild its frames as images
    Extract {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Directory for rebuilt images (defaults to <output_dir>/frames)
        #[arg(short, long)]
        out: Option<String>,
    },
    /// Extract a session archive and assemble it into a video
    Assemble {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Output video path (defaults to <output_dir>/<video.file_name>)
        #[arg(short, long)]
        output: Option<String>,

        /// Remove the recording cache after a successful assembly
        #[arg(long)]
        clear: bool,
    },
    /// Remove the recording cache
    Clear,
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Parser, Debug, Clone)]
pub struct RecordOptions {
    /// Source resolution as WIDTHxHEIGHT
    #[arg(short, long, default_value = "1280x720")]
    resolution: Resolution,

    /// Stop after this many seconds
    #[arg(short, long, default_value_t = 5)]
    duration: u64,

    /// Host render loop rate in frames per second
    #[arg(long, default_value_t = 60)]
    render_fps: u32,

    /// Target capture rate (overrides capture.target_fps)
    #[arg(long)]
    fps: Option<u32>,

    /// Frame ring size (overrides capture.ring_size)
    #[arg(long)]
    ring_size: Option<u32>,

    /// Archive password (overrides archive.password; random when unset)
    #[arg(long)]
    password: Option<String>,

    /// Cache root directory (overrides paths.cache_root)
    #[arg(long)]
    cache_root: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct ArchiveArgs {
    /// Session archive produced by 'framecap record'
    archive: String,

    /// Key printed when the session was recorded
    #[arg(short, long)]
    key: String,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Set a single value, e.g. 'capture.target_fps 24'
    Set {
        /// Dotted key such as video.codec
        key: String,
        /// New value ('none' clears optional values)
        value: String,
    },
    /// Restore the default configuration
    Reset,
}

fn main() {
    let cli = Cli::parse();
    let log_guard = init_logging(cli.verbose, cli.quiet);

    // Build the async runtime
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}", colors::error(&format!("Failed to create Tokio runtime: {}", e)));
            std::process::exit(ExitCode::GeneralError.as_i32());
        }
    };

    let exit_code = runtime.block_on(run(cli));
    if exit_code != ExitCode::Success {
        tracing::debug!("Exiting with code {} ({})", exit_code.as_i32(), exit_code);
    }
    drop(runtime);
    drop(log_guard);
    std::process::exit(exit_code.as_i32());
}

/// Initialize logging to stderr and a daily rolling file, with `RUST_LOG`
/// support. The returned guard flushes the file writer on drop.
fn init_logging(verbose: bool, quiet: bool) -> Option<WorkerGuard> {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    match ensure_log_dir() {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            tracing::warn!("File logging disabled: {}", e);
            None
        }
    }
}

async fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Commands::Record { options } => commands::record(options, cli.json, cli.quiet).await,
        Commands::Extract { archive, out } => {
            commands::extract(archive, out, cli.json, cli.quiet).await
        }
        Commands::Assemble {
            archive,
            output,
            clear,
        } => commands::assemble(archive, output, clear, cli.json, cli.quiet, cli.verbose).await,
        Commands::Clear => commands::clear(cli.json, cli.quiet),
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(cli.json),
            ConfigAction::Path => commands::config_path(cli.json),
            ConfigAction::Set { key, value } => {
                commands::config_set(&key, &value, cli.json, cli.quiet)
            }
            ConfigAction::Reset => commands::config_reset(cli.json, cli.quiet),
        },
        Commands::Version => {
            commands::version(cli.json);
            ExitCode::Success
        }
    }
}
