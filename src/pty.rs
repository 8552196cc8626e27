use crate::error::Result;
use crate::transport::{Received, Transport};
use anyhow::Context;
use async_trait::async_trait;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::thread;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::time::Instant;

/// A console provided by a local program running inside a PTY.
///
/// The program is whatever reaches the target: a local shell, `ssh host`,
/// `picocom /dev/ttyUSB0`, a board emulator.
pub struct PtyTransport {
    // Closing the master hangs up the program.
    _master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Option<Box<dyn Write + Send>>,
    output_rx: UnboundedReceiver<Vec<u8>>,
    program: String,
    args: Vec<String>,
}

impl PtyTransport {
    /// Spawn `program` in a new PTY.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let pty_system = portable_pty::native_pty_system();

        // Wide enough that echoed command lines are not wrapped.
        let pty_size = PtySize {
            rows: 24,
            cols: 512,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(pty_size)
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(program);
        for arg in args {
            cmd.arg(arg);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {program}"))?;

        let writer = pair
            .master
            .take_writer()
            .context("Failed to get PTY writer")?;

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to get PTY reader")?;

        log::debug!("spawned {program} {args:?} in a PTY");

        Ok(PtyTransport {
            _master: pair.master,
            child,
            writer: Some(writer),
            output_rx: forward_output(reader, program)?,
            program: program.to_string(),
            args: args.to_vec(),
        })
    }

    /// Check if the program is still running
    pub fn is_running(&mut self) -> bool {
        self.child.try_wait().ok().flatten().is_none()
    }
}

#[async_trait]
impl Transport for PtyTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("PTY writer already closed")?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    async fn read_available(&mut self, deadline: Instant) -> Result<Received> {
        match tokio::time::timeout_at(deadline, self.output_rx.recv()).await {
            Ok(Some(data)) => Ok(Received::Data(data)),
            Ok(None) => Ok(Received::Closed),
            Err(_) => Ok(Received::Idle),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.writer = None;
        if self.is_running() {
            self.child
                .kill()
                .with_context(|| format!("Failed to stop {}", self.program))?;
        }
        self.child
            .wait()
            .with_context(|| format!("Failed to reap {}", self.program))?;
        Ok(())
    }

    async fn open_additional_session(&mut self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(PtyTransport::spawn(&self.program, &self.args)?))
    }
}

/// Move blocking PTY reads onto a thread of their own. The receiver yields
/// `None` once the program's side of the PTY is gone.
fn forward_output<R: Read + Send + 'static>(
    mut reader: R,
    program: &str,
) -> Result<UnboundedReceiver<Vec<u8>>> {
    let (tx, rx) = unbounded_channel();
    let name = format!("pty-{program}");

    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(chunk[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    // EIO is how Linux reports a hung-up PTY.
                    Err(err) => {
                        log::trace!("{name}: read ended: {err}");
                        break;
                    }
                }
            }
        })
        .context("Failed to start PTY reader thread")?;

    Ok(rx)
}

impl Drop for PtyTransport {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
