//! # Labshell
//!
//! Drive the consoles of embedded boards: run commands and get their exit
//! status back, stop a bootloader's autoboot, log in, and switch power, over
//! nothing more than a raw text stream.
//!
//! A console stack is built from [`Machine`]s. Each machine is one layer
//! (lab host, board console, bootloader, Linux) and owns the layer below it;
//! [`Machine::exit`] tears the whole stack down innermost first, switching
//! board power off on every path.
//!
//! ## Quick start
//!
//! ```no_run
//! use labshell::{cmd, MachineBuilder, TransportConnector};
//!
//! #[tokio::main]
//! async fn main() -> labshell::Result<()> {
//!     let mut lab = MachineBuilder::new("lab")
//!         .connector(TransportConnector::pty("bash", &["--norc".to_string()]))
//!         .acquire()
//!         .await?;
//!
//!     let (status, output) = lab.exec(&cmd!["ls", "-l", "/tmp"]).await?;
//!     println!("ls exited with {status}:\n{output}");
//!
//!     lab.exit().await
//! }
//! ```
//!
//! ## Building commands
//!
//! Commands are lists of [`Arg`]s, usually written with [`cmd!`]:
//!
//! | Argument | Rendered as |
//! |----------|-------------|
//! | `"any text"` | one shell word, quoted as needed |
//! | [`Special::PIPE`], [`Special::AND`], ... | the operator, unquoted |
//! | [`Special::redirect_stdout`]`(&path)` | `>path` after a host check |
//! | [`Special::raw`]`("...")` | the text verbatim (single line only) |
//! | a [`Path`] | its string, if it belongs to the executing machine |
//!
//! [`Machine::exec0`] fails with [`Error::CommandFailed`] on a non-zero exit
//! status; [`Machine::exec`] hands the status back.
//!
//! ## A board stack
//!
//! ```no_run
//! use labshell::{
//!     cmd, AutobootConfig, HostPowerControl, LoginConfig, MachineBuilder, NestedConnector,
//!     Reuse, BootCommand, TransportConnector,
//! };
//!
//! # async fn run() -> labshell::Result<()> {
//! let pty = || TransportConnector::pty("bash", &[]);
//! let lab = MachineBuilder::new("lab").connector(pty()).acquire().await?;
//! let power_host = MachineBuilder::new("lab").connector(pty()).acquire().await?;
//!
//! let board = MachineBuilder::new("board")
//!     .connector(NestedConnector::console(lab, cmd!["picocom", "-b", "115200", "/dev/ttyUSB0"]))
//!     .power(HostPowerControl::new(
//!         power_host,
//!         cmd!["relay", "on", "3"],
//!         cmd!["relay", "off", "3"],
//!     ))
//!     .no_shell()
//!     .acquire()
//!     .await?;
//!
//! let uboot = MachineBuilder::new("u-boot")
//!     .connector(NestedConnector::new(board, Reuse))
//!     .autoboot(AutobootConfig::default())
//!     .prompt("=> ")
//!     .acquire()
//!     .await?;
//!
//! let linux = MachineBuilder::new("linux")
//!     .connector(NestedConnector::new(uboot, BootCommand::new(cmd!["run", "bootcmd"])))
//!     .login(LoginConfig::new("root")?.password("root"))
//!     .acquire()
//!     .await?;
//!
//! linux
//!     .scope(|linux| Box::pin(async move { linux.exec0(&cmd!["uname", "-a"]).await }))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom strategies
//!
//! Transports, connectors, pivots and power controls are traits. A power
//! switch driven by something other than a shell command:
//!
//! ```no_run
//! use async_trait::async_trait;
//! use labshell::{PowerControl, Result};
//!
//! struct Gpio(u32);
//!
//! #[async_trait]
//! impl PowerControl for Gpio {
//!     async fn poweron(&mut self) -> Result<()> {
//!         std::fs::write(format!("/sys/class/gpio/gpio{}/value", self.0), "1")?;
//!         Ok(())
//!     }
//!
//!     async fn poweroff(&mut self) -> Result<()> {
//!         std::fs::write(format!("/sys/class/gpio/gpio{}/value", self.0), "0")?;
//!         Ok(())
//!     }
//! }
//! ```

pub mod boot;
pub mod channel;
pub mod command;
pub mod config;
pub mod connector;
pub mod error;
pub mod event;
pub mod machine;
pub mod path;
pub mod pattern;
pub(crate) mod pty;
pub mod shell;
#[cfg(unix)]
pub mod terminal;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use boot::{
    AutobootConfig, AutobootState, HostPowerControl, LoginConfig, LoginState, PowerControl,
    PowerGuard,
};
pub use channel::Channel;
pub use command::{Arg, Special};
pub use connector::{BootCommand, Connector, NestedConnector, Pivot, Reuse, TransportConnector};
pub use error::{Error, Result};
pub use event::{Event, EventSink, log_sink, null_sink};
pub use machine::{BoxFuture, Machine, MachineBuilder};
pub use path::{MachineId, Path};
pub use pattern::Pattern;
pub use pty::PtyTransport;
pub use shell::{ASH, BASH, ShellDialect};
pub use transport::{Received, Transport};
