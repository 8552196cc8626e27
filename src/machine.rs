//! Machines: one layer of a console stack.
//!
//! A [`Machine`] is put together from strategies by a [`MachineBuilder`]: a
//! [`Connector`] for its channel, optionally a [`PowerControl`], an autoboot
//! interceptor and a login, and either a [`ShellDialect`] or a fixed prompt.
//! Acquisition runs them in that order; [`Machine::exit`] undoes everything,
//! innermost first, and [`Machine::scope`] guarantees the exit on every path.
//!
//! ```no_run
//! use labshell::{cmd, MachineBuilder, TransportConnector};
//!
//! # async fn run() -> labshell::Result<()> {
//! let lab = MachineBuilder::new("lab")
//!     .connector(TransportConnector::pty("bash", &["--norc".to_string()]))
//!     .acquire()
//!     .await?;
//!
//! let kernel = lab
//!     .scope(|lab| Box::pin(async move { lab.exec0(&cmd!["uname", "-r"]).await }))
//!     .await?;
//! print!("{kernel}");
//! # Ok(())
//! # }
//! ```

use crate::boot::{
    AutobootConfig, LoginConfig, PowerControl, PowerGuard, autoboot, default_shell_prompt, login,
};
use crate::channel::Channel;
use crate::cmd;
use crate::command::{self, Arg, Special};
use crate::config::{COMMAND_TIMEOUT, WORKDIR};
use crate::connector::{Connector, TransportConnector};
use crate::error::{Error, Result};
use crate::event::{Event, EventSink, log_sink};
use crate::path::{MachineId, Path};
use crate::pattern::Pattern;
use crate::shell::{BASH, ShellDialect};
use futures::FutureExt;
use rand::Rng;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// A boxed future borrowing a machine, as returned by [`Machine::scope`]
/// bodies.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone)]
enum Shell {
    /// A shell whose prompt is replaced by a unique one
    Dialect(&'static ShellDialect),
    /// An interpreter with a prompt that cannot be changed, e.g. U-Boot
    Fixed(Pattern),
    /// A bare console without any interpreter
    None,
}

/// Collects the strategies of one machine.
pub struct MachineBuilder {
    name: String,
    connector: Option<Box<dyn Connector>>,
    power: Option<Box<dyn PowerControl>>,
    autoboot: Option<AutobootConfig>,
    login: Option<LoginConfig>,
    shell: Shell,
    workdir: Option<String>,
    timeout: Duration,
    sink: EventSink,
}

impl MachineBuilder {
    /// A builder for a bash machine named `name` with the default timeout.
    pub fn new(name: impl Into<String>) -> Self {
        MachineBuilder {
            name: name.into(),
            connector: None,
            power: None,
            autoboot: None,
            login: None,
            shell: Shell::Dialect(&BASH),
            workdir: None,
            timeout: COMMAND_TIMEOUT,
            sink: log_sink(),
        }
    }

    /// How the console is reached. Required.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Box::new(connector));
        self
    }

    /// Switch power on during acquire and off on exit.
    pub fn power(mut self, power: impl PowerControl + 'static) -> Self {
        self.power = Some(Box::new(power));
        self
    }

    /// Stop the bootloader's autoboot countdown.
    pub fn autoboot(mut self, config: AutobootConfig) -> Self {
        self.autoboot = Some(config);
        self
    }

    /// Log in at the console's login prompt.
    pub fn login(mut self, config: LoginConfig) -> Self {
        self.login = Some(config);
        self
    }

    /// The shell running on the console. Defaults to [`BASH`].
    pub fn dialect(mut self, dialect: &'static ShellDialect) -> Self {
        self.shell = Shell::Dialect(dialect);
        self
    }

    /// An interpreter whose prompt is always `prompt`.
    pub fn prompt(mut self, prompt: impl Into<Pattern>) -> Self {
        self.shell = Shell::Fixed(prompt.into());
        self
    }

    /// A console without an interpreter, such as a board's serial port
    /// before anything has booted.
    pub fn no_shell(mut self) -> Self {
        self.shell = Shell::None;
        self
    }

    /// Directory returned by [`Machine::workdir`].
    pub fn workdir(mut self, path: impl Into<String>) -> Self {
        self.workdir = Some(path.into());
        self
    }

    /// Default deadline of every command on this machine.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Where this machine's events go. Defaults to the log.
    pub fn sink(mut self, sink: EventSink) -> Self {
        self.sink = sink;
        self
    }

    /// Connect, power on, intercept autoboot, log in and set up the shell.
    ///
    /// When any step fails, everything done so far is undone before the
    /// error is returned; a failing cleanup is attached to the error.
    pub async fn acquire(self) -> Result<Machine> {
        let MachineBuilder {
            name,
            connector,
            power,
            autoboot,
            login,
            shell,
            workdir,
            timeout,
            sink,
        } = self;

        let Some(mut connector) = connector else {
            return Err(Error::InvalidArgument(format!(
                "machine {name} has no connector"
            )));
        };
        let mut channel = match connector.connect(&name).await {
            Ok(channel) => channel,
            Err(err) => return Err(err.with_cleanup(connector.disconnect().await)),
        };
        channel.adopt(&name, sink.clone());
        log::debug!("{name}: connected");

        let mut machine = Machine {
            name,
            id: MachineId::next(),
            channel,
            connector,
            power: None,
            shell,
            prompt: None,
            workdir,
            workdir_ready: false,
            timeout,
            sink,
        };
        match machine.bring_up(power, autoboot, login).await {
            Ok(()) => Ok(machine),
            Err(err) => {
                let cleanup = machine.exit().await;
                Err(err.with_cleanup(cleanup))
            }
        }
    }
}

/// One acquired layer of a console stack.
///
/// A machine owns the machine below it (through its connector) and its
/// channel, unless a machine above has taken the channel over. Call
/// [`exit`](Machine::exit) when done, or run work inside
/// [`scope`](Machine::scope).
pub struct Machine {
    name: String,
    id: MachineId,
    channel: Channel,
    connector: Box<dyn Connector>,
    power: Option<PowerGuard>,
    shell: Shell,
    prompt: Option<String>,
    workdir: Option<String>,
    workdir_ready: bool,
    timeout: Duration,
    sink: EventSink,
}

impl Machine {
    /// Name given to the builder.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity that host-bound paths are checked against.
    pub fn id(&self) -> MachineId {
        self.id
    }

    /// Name of the machine this one was reached through.
    pub fn parent_name(&self) -> Option<&str> {
        self.connector.parent_name()
    }

    /// The console, for protocols exec does not cover.
    pub fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    async fn bring_up(
        &mut self,
        power: Option<Box<dyn PowerControl>>,
        autoboot_config: Option<AutobootConfig>,
        login_config: Option<LoginConfig>,
    ) -> Result<()> {
        if let Some(control) = power {
            let guard = self
                .power
                .insert(PowerGuard::new(control, &self.name, self.sink.clone()));
            guard.poweron().await?;
        }
        if let Some(config) = autoboot_config {
            let confirm = match &self.shell {
                Shell::Fixed(prompt) => prompt.clone(),
                _ => default_shell_prompt()?,
            };
            autoboot::intercept(&mut self.channel, &config, &confirm).await?;
        }
        if let Some(config) = login_config {
            login::login(&mut self.channel, &config).await?;
        }
        self.init_shell().await
    }

    async fn init_shell(&mut self) -> Result<()> {
        match self.shell.clone() {
            Shell::None => Ok(()),
            Shell::Fixed(prompt) => {
                self.channel.set_prompt(Some(prompt.clone()))?;
                self.channel.sendline("").await?;
                self.channel.read_until(&prompt, self.timeout).await?;
                Ok(())
            }
            Shell::Dialect(dialect) => {
                let prompt = format!("LABSHELL-{:08X}$ ", rand::thread_rng().r#gen::<u32>());
                self.set_shell_prompt(dialect, &prompt).await?;
                self.prompt = Some(prompt);

                let setup = [dialect.disable_history(), dialect.disable_editing()];
                for command in setup.into_iter().flatten() {
                    self.channel.raw_command(command, self.timeout).await?;
                }
                Ok(())
            }
        }
    }

    async fn set_shell_prompt(&mut self, dialect: &ShellDialect, prompt: &str) -> Result<()> {
        let Some(command) = dialect.set_prompt(prompt) else {
            return Err(Error::UnsupportedOperation {
                machine: self.name.clone(),
                operation: "set_prompt",
                reason: format!("{} cannot change its prompt", dialect.name()),
            });
        };
        let prompt = Pattern::literal(prompt);
        self.channel.sendline(&command).await?;
        self.channel.read_until(&prompt, self.timeout).await?;
        self.channel.set_prompt(Some(prompt))
    }

    /// Render `args` into this machine's command line.
    pub fn build_command(&self, args: &[Arg]) -> Result<String> {
        command::build_command(args, self.id, &self.name)
    }

    /// Run a command and return its exit status and output.
    pub async fn exec(&mut self, args: &[Arg]) -> Result<(i32, String)> {
        self.exec_timeout(args, self.timeout).await
    }

    /// [`exec`](Machine::exec) with its own deadline.
    pub async fn exec_timeout(&mut self, args: &[Arg], timeout: Duration) -> Result<(i32, String)> {
        let command = self.build_command(args)?;
        self.channel.raw_command_with_retval(&command, timeout).await
    }

    /// Run a command that must succeed and return its output.
    pub async fn exec0(&mut self, args: &[Arg]) -> Result<String> {
        self.exec0_timeout(args, self.timeout).await
    }

    /// [`exec0`](Machine::exec0) with its own deadline.
    pub async fn exec0_timeout(&mut self, args: &[Arg], timeout: Duration) -> Result<String> {
        let command = self.build_command(args)?;
        let (status, output) = self.channel.raw_command_with_retval(&command, timeout).await?;
        if status != 0 {
            return Err(Error::CommandFailed {
                machine: self.name.clone(),
                command,
                status,
                output,
            });
        }
        Ok(output)
    }

    /// Send a command line that does not return to this machine's prompt,
    /// such as a kernel boot or a console program.
    pub async fn boot(&mut self, args: &[Arg]) -> Result<()> {
        let command = self.build_command(args)?;
        self.channel.emit(&Event::CommandIssued {
            machine: self.name.clone(),
            command: command.clone(),
        });
        self.channel.set_prompt(None)?;
        self.channel.sendline(&command).await
    }

    /// A path on this machine.
    pub fn path(&self, path: impl Into<String>) -> Path {
        Path::new(self.id, &self.name, path)
    }

    /// The working directory, created on first use.
    pub async fn workdir(&mut self) -> Result<Path> {
        let dir = self.path(self.workdir.as_deref().unwrap_or(WORKDIR));
        if !self.workdir_ready {
            self.exec0(&cmd!["mkdir", "-p", &dir]).await?;
            self.workdir_ready = true;
        }
        Ok(dir)
    }

    /// Value of the shell variable `name`.
    pub async fn env(&mut self, name: &str) -> Result<String> {
        let mut chars = name.chars();
        let valid = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(Error::InvalidArgument(format!(
                "not a variable name: {name:?}"
            )));
        }

        let value = Special::raw(format!("\"${name}\""))?;
        let output = self.exec0(&cmd!["printf", "%s\\n", value]).await?;
        Ok(output.strip_suffix('\n').unwrap_or(&output).to_string())
    }

    /// Whether `path` exists on this machine.
    pub async fn path_exists(&mut self, path: &Path) -> Result<bool> {
        let (status, _) = self.exec(&cmd!["test", "-e", path]).await?;
        Ok(status == 0)
    }

    /// Hand the channel to a machine stacked on top of this one.
    pub(crate) fn take_channel(&mut self) -> Result<Channel> {
        self.channel.take()
    }

    /// Open a second, independent session to the same machine.
    ///
    /// Only machines connected over a transport that multiplexes sessions
    /// can be cloned; a console reached through another machine cannot.
    pub async fn clone_session(&mut self) -> Result<Machine> {
        if !self.connector.is_multiplexed() {
            let reason = match self.connector.parent_name() {
                Some(parent) => format!("its console is a single stream shared with {parent}"),
                None => "its console is a single stream".to_string(),
            };
            return Err(Error::UnsupportedOperation {
                machine: self.name.clone(),
                operation: "clone",
                reason,
            });
        }

        let transport = self.channel.open_additional_session().await?;
        let mut builder = MachineBuilder::new(self.name.clone())
            .connector(TransportConnector::from_transport(transport))
            .timeout(self.timeout)
            .sink(self.sink.clone());
        builder.shell = self.shell.clone();
        builder.workdir = self.workdir.clone();
        builder.acquire().await
    }

    /// Attach the local terminal to this machine's shell until the user
    /// leaves the session shell.
    pub async fn interactive(&mut self) -> Result<()> {
        #[cfg(unix)]
        let raw = crate::terminal::RawMode::enable()?;

        let result = self
            .interactive_with(&mut tokio::io::stdin(), &mut tokio::io::stdout())
            .await;

        #[cfg(unix)]
        let restored = match raw {
            Some(raw) => raw.restore().map_err(Error::from),
            None => Ok(()),
        };
        #[cfg(not(unix))]
        let restored: Result<()> = Ok(());

        match result {
            Ok(()) => restored,
            Err(err) => Err(err.with_cleanup(restored)),
        }
    }

    /// Run an interactive session over arbitrary input and output streams.
    ///
    /// Starts a sub-shell and forwards `input` to it until it exits; the
    /// parent shell then prints a one-off end marker as its prompt, which
    /// ends the session.
    pub async fn interactive_with<R, W>(&mut self, input: &mut R, output: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let (Shell::Dialect(dialect), Some(prompt)) = (&self.shell, self.prompt.clone()) else {
            return Err(Error::UnsupportedOperation {
                machine: self.name.clone(),
                operation: "interactive",
                reason: "the machine does not run a known shell".into(),
            });
        };
        let dialect: &'static ShellDialect = *dialect;

        let marker = format!("INTERACTIVE-END-{:08X}", rand::thread_rng().r#gen::<u32>());
        let session_prompt = format!("{}: $PWD> ", self.name);
        let (Some(end_prompt), Some(session_prompt)) = (
            dialect.set_prompt(&marker),
            dialect.set_prompt(&session_prompt),
        ) else {
            return Err(Error::UnsupportedOperation {
                machine: self.name.clone(),
                operation: "interactive",
                reason: format!("{} cannot change its prompt", dialect.name()),
            });
        };

        if let Some(command) = dialect.enable_editing() {
            self.channel.raw_command(command, self.timeout).await?;
        }
        self.channel
            .sendline(&format!("{}; {end_prompt}", dialect.name()))
            .await?;
        self.channel.sendline(&session_prompt).await?;
        log::info!("{}: entering interactive session", self.name);

        self.channel
            .attach_interactive(input, output, &marker)
            .await?;

        log::info!("{}: left interactive session", self.name);
        self.set_shell_prompt(dialect, &prompt).await?;
        if let Some(command) = dialect.disable_editing() {
            self.channel.raw_command(command, self.timeout).await?;
        }
        Ok(())
    }

    /// Tear this machine and everything below it down.
    ///
    /// Power is switched off first, then the channel is closed (unless a
    /// machine above took it) and finally the connector releases the parent
    /// machines. Every step runs even if an earlier one failed; the first
    /// failure is returned with the later ones attached.
    pub async fn exit(self) -> Result<()> {
        let Machine {
            name,
            mut channel,
            connector,
            power,
            ..
        } = self;
        log::debug!("{name}: exiting");

        let mut result = match power {
            Some(guard) => guard.release().await,
            None => Ok(()),
        };
        result = chain(result, channel.close().await);
        chain(result, connector.disconnect().await)
    }

    /// Run `body` on this machine and exit it afterwards, on every path.
    ///
    /// An error from `body` is returned even if the exit fails too; the exit
    /// failure is attached to it. A panic in `body` is resumed after the exit.
    /// If the returned future is dropped early, power is still switched off
    /// by the [`PowerGuard`] of each machine in the stack.
    pub async fn scope<T, F>(mut self, body: F) -> Result<T>
    where
        F: for<'m> FnOnce(&'m mut Machine) -> BoxFuture<'m, Result<T>>,
    {
        let outcome = AssertUnwindSafe(body(&mut self)).catch_unwind().await;
        let cleanup = self.exit().await;
        match outcome {
            Ok(Ok(value)) => cleanup.map(|()| value),
            Ok(Err(err)) => Err(err.with_cleanup(cleanup)),
            Err(panic) => {
                if let Err(err) = cleanup {
                    log::error!("exit after a panic failed: {err}");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

fn chain(result: Result<()>, next: Result<()>) -> Result<()> {
    match result {
        Ok(()) => next,
        Err(err) => Err(err.with_cleanup(next)),
    }
}
