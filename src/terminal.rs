//! Raw mode for the local terminal while an interactive session is attached.

use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::os::fd::AsRawFd;
use termios::Termios;

/// Puts stdin into raw mode and restores the saved settings when dropped.
pub struct RawMode {
    fd: i32,
    saved: Termios,
    restored: bool,
}

impl RawMode {
    /// Switch stdin to raw mode. Returns `None` when stdin is not a terminal.
    pub fn enable() -> Result<Option<RawMode>> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Ok(None);
        }
        let fd = stdin.as_raw_fd();
        let saved = Termios::from_fd(fd).context("could not get termios for stdin")?;

        let mut raw = saved;
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(fd, termios::TCSANOW, &raw)
            .context("failed to switch stdin to raw mode")?;

        Ok(Some(RawMode {
            fd,
            saved,
            restored: false,
        }))
    }

    pub fn restore(mut self) -> Result<()> {
        termios::tcsetattr(self.fd, termios::TCSAFLUSH, &self.saved)
            .context("failed to restore terminal settings")?;
        self.restored = true;
        Ok(())
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if !self.restored {
            let _ = termios::tcsetattr(self.fd, termios::TCSAFLUSH, &self.saved);
        }
    }
}
