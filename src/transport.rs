//! The byte-level connection a [`Channel`](crate::Channel) is built on.

use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::time::Instant;

/// Outcome of a single [`Transport::read_available`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Bytes that arrived before the deadline
    Data(Vec<u8>),
    /// The deadline passed without any data
    Idle,
    /// The remote end hung up
    Closed,
}

/// An opaque, unframed byte stream to a console: serial line, SSH session,
/// a program in a PTY.
#[async_trait]
pub trait Transport: Send {
    /// Write all of `data` to the remote end.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Wait until some bytes arrive or `deadline` passes.
    async fn read_available(&mut self, deadline: Instant) -> Result<Received>;

    /// Tear the connection down. Further reads report [`Received::Closed`].
    async fn close(&mut self) -> Result<()>;

    /// Open a second, independent session to the same endpoint.
    ///
    /// Only transports that multiplex sessions (SSH, a local program that can
    /// be spawned again) support this.
    async fn open_additional_session(&mut self) -> Result<Box<dyn Transport>> {
        Err(Error::UnsupportedOperation {
            machine: String::new(),
            operation: "open_additional_session",
            reason: "transport carries a single byte stream".into(),
        })
    }
}
