//! Default deadlines and duration parsing for command-line values.

use anyhow::{Context as _, Result, anyhow};
use std::time::Duration;

/// Deadline for a single `exec` when the caller gives none.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// How long after boot start the autoboot prompt may take to appear.
pub const AUTOBOOT_WINDOW: Duration = Duration::from_secs(30);

/// How long the bootloader may take to show its prompt after interception.
pub const AUTOBOOT_SHELL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the login prompt may take to appear after boot.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the console may take to answer a username or password.
pub const LOGIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Working directory used when a machine does not configure one.
pub const WORKDIR: &str = "/tmp/labshell-workdir";

/// Poll interval of the output flow during interactive passthrough.
pub const INTERACTIVE_POLL: Duration = Duration::from_millis(50);

/// Parse a duration string: `500ms`, `1.5s`, `2m`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(ms_str) = s.strip_suffix("ms") {
        let ms: u64 = ms_str
            .trim()
            .parse()
            .context("Invalid milliseconds value")?;
        Ok(Duration::from_millis(ms))
    } else if let Some(s_str) = s.strip_suffix('s') {
        let secs: f64 = s_str.trim().parse().context("Invalid seconds value")?;
        Duration::try_from_secs_f64(secs).context("Seconds value out of range")
    } else if let Some(m_str) = s.strip_suffix('m') {
        let mins: u64 = m_str.trim().parse().context("Invalid minutes value")?;
        let secs = mins.checked_mul(60).context("Minutes value out of range")?;
        Ok(Duration::from_secs(secs))
    } else {
        Err(anyhow!(
            "Duration must end with 'ms', 's' or 'm', got: {}",
            s
        ))
    }
}
