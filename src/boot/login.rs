//! The console login handshake.

use super::{BootState, default_shell_prompt, enter};
use crate::channel::Channel;
use crate::config::{LOGIN_RESPONSE_TIMEOUT, LOGIN_TIMEOUT};
use crate::error::{Error, Result};
use crate::pattern::Pattern;
use std::time::Duration;

/// Credentials and prompts of one login console.
///
/// Without a password the console must drop straight into a shell after the
/// username; with one it must ask for it.
#[derive(Debug, Clone)]
pub struct LoginConfig {
    pub login_prompt: Pattern,
    pub username: String,
    pub password: Option<String>,
    pub password_prompt: Pattern,
    pub shell_prompt: Pattern,
    /// Let the console settle this long after the first login prompt
    pub delay: Option<Duration>,
    /// How long the login prompt may take to appear
    pub timeout: Duration,
    /// How long the console may take to answer a username or password
    pub response_timeout: Duration,
}

impl LoginConfig {
    /// Log in as `username` without a password, with default prompts and deadlines.
    pub fn new(username: impl Into<String>) -> Result<Self> {
        Ok(LoginConfig {
            login_prompt: Pattern::literal("login: "),
            username: username.into(),
            password: None,
            password_prompt: Pattern::literal("assword:"),
            shell_prompt: default_shell_prompt()?,
            delay: None,
            timeout: LOGIN_TIMEOUT,
            response_timeout: LOGIN_RESPONSE_TIMEOUT,
        })
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn login_prompt(mut self, prompt: impl Into<Pattern>) -> Self {
        self.login_prompt = prompt.into();
        self
    }

    pub fn password_prompt(mut self, prompt: impl Into<Pattern>) -> Self {
        self.password_prompt = prompt.into();
        self
    }

    pub fn shell_prompt(mut self, prompt: impl Into<Pattern>) -> Self {
        self.shell_prompt = prompt.into();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    AwaitLoginPrompt,
    AwaitPasswordPromptOrShell,
    AwaitShell,
    ShellReady,
}

impl BootState for LoginState {
    fn name(self) -> &'static str {
        match self {
            LoginState::AwaitLoginPrompt => "await-login-prompt",
            LoginState::AwaitPasswordPromptOrShell => "await-password-prompt-or-shell",
            LoginState::AwaitShell => "await-shell",
            LoginState::ShellReady => "shell-ready",
        }
    }
}

/// Log in on the console behind `channel`.
///
/// Every deviation from the configured sequence is an
/// [`Error::LoginProtocolMismatch`], including a console that never shows a
/// login prompt at all: it is most likely sitting in a different program.
pub async fn login(channel: &mut Channel, config: &LoginConfig) -> Result<LoginState> {
    let mut state = LoginState::AwaitLoginPrompt;

    await_login_prompt(channel, config, config.timeout).await?;
    if let Some(delay) = config.delay {
        channel.drain(delay).await?;
        channel.sendline("").await?;
        await_login_prompt(channel, config, config.response_timeout).await?;
    }

    channel.sendline(&config.username).await?;
    enter(channel, &mut state, LoginState::AwaitPasswordPromptOrShell);

    let answers = [config.password_prompt.clone(), config.shell_prompt.clone()];
    let (seen, _) = expect(channel, &answers, config.response_timeout, "after username").await?;

    match (seen, &config.password) {
        (0, Some(password)) => {
            channel.sendline(password).await?;
            enter(channel, &mut state, LoginState::AwaitShell);

            let answers = [config.shell_prompt.clone(), config.login_prompt.clone()];
            let (seen, text) =
                expect(channel, &answers, config.response_timeout, "after password").await?;
            if seen == 1 {
                return Err(mismatch(channel, "credentials were rejected", text));
            }
        }
        (0, None) => {
            return Err(mismatch(
                channel,
                "console asks for a password but none is configured",
                String::new(),
            ));
        }
        (_, Some(_)) => {
            return Err(mismatch(
                channel,
                "console did not ask for the configured password",
                String::new(),
            ));
        }
        (_, None) => {}
    }

    enter(channel, &mut state, LoginState::ShellReady);
    Ok(state)
}

async fn await_login_prompt(
    channel: &mut Channel,
    config: &LoginConfig,
    timeout: Duration,
) -> Result<()> {
    match channel.read_until(&config.login_prompt, timeout).await {
        Ok(_) => Ok(()),
        Err(Error::Timeout { partial, .. }) => Err(mismatch(
            channel,
            &format!("no login prompt {} within {timeout:?}", config.login_prompt),
            partial,
        )),
        Err(err) => Err(err),
    }
}

/// Wait for one of `answers`; no answer at all is a mismatch.
async fn expect(
    channel: &mut Channel,
    answers: &[Pattern],
    timeout: Duration,
    step: &str,
) -> Result<(usize, String)> {
    match channel.read_until_any(answers, timeout).await {
        Err(Error::Timeout { partial, .. }) => Err(mismatch(
            channel,
            &format!("no known prompt {step} within {timeout:?}"),
            partial,
        )),
        other => other,
    }
}

fn mismatch(channel: &Channel, reason: &str, partial: String) -> Error {
    Error::LoginProtocolMismatch {
        machine: channel.owner().to_string(),
        reason: reason.to_string(),
        partial,
    }
}
