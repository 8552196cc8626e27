//! Where a machine's channel comes from.
//!
//! A [`TransportConnector`] opens a fresh transport. A [`NestedConnector`]
//! inherits the channel of an already acquired parent machine after a
//! [`Pivot`] has switched the parent's console over to the child.

use crate::channel::Channel;
use crate::command::Arg;
use crate::error::{Error, Result};
use crate::machine::Machine;
use crate::pty::PtyTransport;
use crate::transport::Transport;
use async_trait::async_trait;

/// Produces the channel of one machine and tears down what it used.
#[async_trait]
pub trait Connector: Send {
    async fn connect(&mut self, owner: &str) -> Result<Channel>;

    /// Whether independent sessions can be opened next to the channel
    /// returned by [`connect`](Connector::connect).
    fn is_multiplexed(&self) -> bool {
        false
    }

    fn parent_name(&self) -> Option<&str> {
        None
    }

    /// Release everything the connector holds, parent machines included.
    async fn disconnect(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

type Opener = Box<dyn FnMut() -> Result<Box<dyn Transport>> + Send>;

/// Root connector: opens a brand-new transport.
pub struct TransportConnector {
    opener: Option<Opener>,
    opened: Option<Box<dyn Transport>>,
}

impl TransportConnector {
    pub fn new(opener: impl FnMut() -> Result<Box<dyn Transport>> + Send + 'static) -> Self {
        TransportConnector {
            opener: Some(Box::new(opener)),
            opened: None,
        }
    }

    /// Use a transport that is already open.
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        TransportConnector {
            opener: None,
            opened: Some(transport),
        }
    }

    /// Run `program` in a local PTY.
    pub fn pty(program: &str, args: &[String]) -> Self {
        let program = program.to_string();
        let args = args.to_vec();
        TransportConnector::new(move || {
            let transport: Box<dyn Transport> = Box::new(PtyTransport::spawn(&program, &args)?);
            Ok(transport)
        })
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&mut self, owner: &str) -> Result<Channel> {
        let transport = match (self.opened.take(), self.opener.as_mut()) {
            (Some(transport), _) => transport,
            (None, Some(open)) => open()?,
            (None, None) => {
                return Err(Error::UnsupportedOperation {
                    machine: owner.to_string(),
                    operation: "connect",
                    reason: "the transport was already handed out".into(),
                });
            }
        };
        Ok(Channel::new(transport))
    }

    fn is_multiplexed(&self) -> bool {
        true
    }
}

/// Switches a parent's console over to a child machine.
#[async_trait]
pub trait Pivot: Send {
    async fn enter(&mut self, parent: &mut Machine) -> Result<()>;
}

/// The child is already there: use the parent console as it is.
pub struct Reuse;

#[async_trait]
impl Pivot for Reuse {
    async fn enter(&mut self, _parent: &mut Machine) -> Result<()> {
        Ok(())
    }
}

/// Send a command line that hands the console to the child, such as
/// `bootm` in a bootloader or `picocom /dev/ttyUSB0` on a lab host.
pub struct BootCommand {
    args: Vec<Arg>,
}

impl BootCommand {
    pub fn new(args: Vec<Arg>) -> Self {
        BootCommand { args }
    }
}

#[async_trait]
impl Pivot for BootCommand {
    async fn enter(&mut self, parent: &mut Machine) -> Result<()> {
        parent.boot(&self.args).await
    }
}

/// Child connector over the single console of a parent machine.
///
/// The parent is owned by the connector and exited when the child
/// disconnects. Since there is exactly one byte stream, no second session
/// can be derived from it.
pub struct NestedConnector {
    parent: Machine,
    pivot: Box<dyn Pivot>,
}

impl NestedConnector {
    pub fn new(parent: Machine, pivot: impl Pivot + 'static) -> Self {
        NestedConnector {
            parent,
            pivot: Box::new(pivot),
        }
    }

    /// Start a console program on `host` in place of its shell and use
    /// whatever that program connects to.
    pub fn console(host: Machine, mut args: Vec<Arg>) -> Self {
        args.insert(0, Arg::from("exec"));
        NestedConnector::new(host, BootCommand::new(args))
    }
}

#[async_trait]
impl Connector for NestedConnector {
    async fn connect(&mut self, _owner: &str) -> Result<Channel> {
        self.pivot.enter(&mut self.parent).await?;
        self.parent.take_channel()
    }

    fn parent_name(&self) -> Option<&str> {
        Some(self.parent.name())
    }

    async fn disconnect(self: Box<Self>) -> Result<()> {
        self.parent.exit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd;
    use crate::event::null_sink;
    use crate::machine::MachineBuilder;
    use crate::testing::{ScriptedConsole, fake_shell};
    use std::time::Duration;

    #[tokio::test]
    async fn test_transport_is_handed_out_once() {
        let mut connector = TransportConnector::from_transport(ScriptedConsole::new().boxed());
        assert!(connector.is_multiplexed());

        let mut channel = connector.connect("lab").await.unwrap();
        assert!(matches!(
            connector.connect("lab").await,
            Err(Error::UnsupportedOperation {
                operation: "connect",
                ..
            })
        ));
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_opener_runs_per_connect() {
        let mut opened = 0;
        let mut connector = TransportConnector::new(move || {
            opened += 1;
            let console = ScriptedConsole::new().emit_at(Duration::ZERO, &format!("#{opened}"));
            Ok(console.boxed())
        });

        for expected in ["#1", "#2"] {
            let mut channel = connector.connect("lab").await.unwrap();
            let seen = channel
                .read_until(&expected.into(), Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(seen, expected);
            channel.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_console_execs_the_console_program() {
        let console = ScriptedConsole::new()
            .emit_at(Duration::ZERO, "$ ")
            .on_line(fake_shell("$ ", |_| (0, String::new())));
        let log = console.log();
        let lab = MachineBuilder::new("lab")
            .connector(TransportConnector::from_transport(console.boxed()))
            .sink(null_sink())
            .acquire()
            .await
            .unwrap();

        let mut connector = NestedConnector::console(lab, cmd!["picocom", "/dev/ttyUSB0"]);
        assert!(!connector.is_multiplexed());
        assert_eq!(connector.parent_name(), Some("lab"));

        let mut channel = connector.connect("board").await.unwrap();
        assert_eq!(
            log.lines().last().map(String::as_str),
            Some("exec picocom /dev/ttyUSB0")
        );
        assert!(channel.prompt().is_none());

        channel.close().await.unwrap();
        Box::new(connector).disconnect().await.unwrap();
        assert!(log.is_closed());
    }
}
