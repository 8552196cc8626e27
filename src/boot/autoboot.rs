//! Stopping a bootloader's autoboot countdown.

use super::{BootState, enter};
use crate::channel::Channel;
use crate::config::{AUTOBOOT_SHELL_TIMEOUT, AUTOBOOT_WINDOW};
use crate::error::{Error, Result};
use crate::pattern::Pattern;
use std::time::Duration;

/// How to recognize and interrupt the countdown.
#[derive(Debug, Clone)]
pub struct AutobootConfig {
    /// Text of the countdown, e.g. `Hit any key to stop autoboot:  3`
    pub prompt: Pattern,
    /// Keystrokes that stop the countdown
    pub keys: String,
    /// How long after boot start the countdown may take to show up
    pub window: Duration,
    /// How long the bootloader may take to show its prompt once stopped
    pub shell_timeout: Duration,
}

impl Default for AutobootConfig {
    fn default() -> Self {
        AutobootConfig {
            prompt: Pattern::literal("autoboot:"),
            keys: "\r".to_string(),
            window: AUTOBOOT_WINDOW,
            shell_timeout: AUTOBOOT_SHELL_TIMEOUT,
        }
    }
}

impl AutobootConfig {
    pub fn prompt(mut self, prompt: impl Into<Pattern>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn keys(mut self, keys: impl Into<String>) -> Self {
        self.keys = keys.into();
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn shell_timeout(mut self, timeout: Duration) -> Self {
        self.shell_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutobootState {
    WaitingForPrompt,
    Intercepted,
    ShellReady,
    /// The window passed without a countdown; the bootloader went on booting.
    Autobooted,
}

impl BootState for AutobootState {
    fn name(self) -> &'static str {
        match self {
            AutobootState::WaitingForPrompt => "waiting-for-autoboot-prompt",
            AutobootState::Intercepted => "autoboot-intercepted",
            AutobootState::ShellReady => "bootloader-shell-ready",
            AutobootState::Autobooted => "autobooted",
        }
    }
}

/// Wait for the countdown, interrupt it and confirm `shell_prompt` appears.
///
/// The window is measured from the call. Missing it is
/// [`Error::InterceptionFailed`]; the interrupt is never resent, since the
/// bootloader may already be loading the next stage.
pub async fn intercept(
    channel: &mut Channel,
    config: &AutobootConfig,
    shell_prompt: &Pattern,
) -> Result<AutobootState> {
    let mut state = AutobootState::WaitingForPrompt;

    match channel.read_until(&config.prompt, config.window).await {
        Ok(_) => {}
        Err(Error::Timeout { partial, .. }) => {
            enter(channel, &mut state, AutobootState::Autobooted);
            return Err(Error::InterceptionFailed {
                machine: channel.owner().to_string(),
                pattern: config.prompt.to_string(),
                window: config.window,
                partial,
            });
        }
        Err(err) => return Err(err),
    }

    channel.send(&config.keys).await?;
    enter(channel, &mut state, AutobootState::Intercepted);

    channel.read_until(shell_prompt, config.shell_timeout).await?;
    enter(channel, &mut state, AutobootState::ShellReady);
    Ok(state)
}
