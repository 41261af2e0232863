//! Terminal styling for CLI output.
//!
//! Styles are only applied when the target stream is a terminal, so piped
//! output and `--json` scripting stay free of ANSI escapes.

use framecap_common::SessionState;
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn is_terminal(self) -> bool {
        match self {
            Stream::Stdout => std::io::stdout().is_terminal(),
            Stream::Stderr => std::io::stderr().is_terminal(),
        }
    }
}

fn styled(stream: Stream, msg: &str, style: impl FnOnce(&str) -> String) -> String {
    if stream.is_terminal() {
        style(msg)
    } else {
        msg.to_string()
    }
}

/// Left-align `msg` in `width` columns, then style it.
///
/// Padding first keeps column alignment independent of escape codes.
pub fn pad_left<F>(msg: &str, width: usize, color_fn: F) -> String
where
    F: FnOnce(&str) -> String,
{
    color_fn(&format!("{:<width$}", msg))
}

pub fn error(msg: &str) -> String {
    let label = styled(Stream::Stderr, "error:", |s| s.red().bold().to_string());
    format!("{} {}", label, msg)
}

pub fn warning(msg: &str) -> String {
    let label = styled(Stream::Stderr, "warning:", |s| s.yellow().bold().to_string());
    format!("{} {}", label, msg)
}

pub fn success(msg: &str) -> String {
    styled(Stream::Stdout, msg, |s| s.green().to_string())
}

/// Status lines; these go to stderr so they never mix with piped results.
pub fn info(msg: &str) -> String {
    styled(Stream::Stderr, msg, |s| s.cyan().to_string())
}

pub fn dim(msg: &str) -> String {
    styled(Stream::Stdout, msg, |s| s.dimmed().to_string())
}

pub fn bold(msg: &str) -> String {
    styled(Stream::Stdout, msg, |s| s.bold().to_string())
}

pub fn header(msg: &str) -> String {
    styled(Stream::Stdout, msg, |s| s.bold().blue().to_string())
}

pub fn recording(msg: &str) -> String {
    styled(Stream::Stdout, msg, |s| s.red().bold().to_string())
}

pub fn path(msg: &str) -> String {
    styled(Stream::Stdout, msg, |s| s.underline().to_string())
}

/// Frame counts, byte sizes and rates.
pub fn number(msg: &str) -> String {
    styled(Stream::Stdout, msg, |s| s.cyan().to_string())
}

/// `mm:ss` recording clock.
pub fn elapsed_time(mins: u64, secs: u64) -> String {
    styled(Stream::Stdout, &format!("{:02}:{:02}", mins, secs), |s| {
        s.yellow().bold().to_string()
    })
}

pub fn state(state: SessionState) -> String {
    let name = state.to_string();
    styled(Stream::Stdout, &name, |s| match state {
        SessionState::Idle => s.dimmed().to_string(),
        SessionState::Recording => s.red().bold().to_string(),
        SessionState::Finalizing => s.yellow().to_string(),
    })
}
