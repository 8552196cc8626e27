//! A text channel over a [`Transport`].
//!
//! The channel owns the byte stream of one console and accumulates everything
//! it reads into a buffer. [`Channel::read_until`] consumes that buffer up to
//! the end of a pattern match. On top of that sits the exit-status protocol of
//! [`Channel::raw_command_with_retval`]: each command is followed by an `echo`
//! of a freshly generated sentinel and `$?`, and the channel reads until the
//! sentinel shows up in the output.

use crate::config::INTERACTIVE_POLL;
use crate::error::{Error, Result};
use crate::event::{Event, EventSink, log_sink};
use crate::pattern::Pattern;
use crate::transport::{Received, Transport};
use rand::Rng;
use regex::Regex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

pub(crate) const SENTINEL_PREFIX: &str = "__LABSHELL_RC_";

/// Bidirectional text stream to one console.
///
/// A channel has exactly one owner. [`take`](Channel::take) moves the stream
/// into a new `Channel` and leaves this one permanently unavailable.
pub struct Channel {
    core: Option<Core>,
    owner: String,
    sink: EventSink,
    gone: &'static str,
}

struct Core {
    transport: Box<dyn Transport>,
    buffer: String,
    undecoded: Vec<u8>,
    prompt: Option<Pattern>,
}

impl Channel {
    /// A channel over `transport`, not yet owned by any machine.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Channel {
            core: Some(Core {
                transport,
                buffer: String::new(),
                undecoded: Vec::new(),
                prompt: None,
            }),
            owner: "(unowned)".to_string(),
            sink: log_sink(),
            gone: "",
        }
    }

    /// Name the machine that owns this channel and where its events go.
    pub fn adopt(&mut self, owner: &str, sink: EventSink) {
        self.owner = owner.to_string();
        self.sink = sink;
    }

    /// Name of the owning machine.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub(crate) fn emit(&self, event: &Event) {
        (self.sink)(event);
    }

    /// False once the channel was taken or closed.
    pub fn is_available(&self) -> bool {
        self.core.is_some()
    }

    /// Hand the stream over to a new owner.
    ///
    /// Any later use of `self` fails with [`Error::ChannelUnavailable`].
    pub fn take(&mut self) -> Result<Channel> {
        let core = self.core.take().ok_or_else(|| Error::ChannelUnavailable {
            machine: self.owner.clone(),
            reason: self.gone,
        })?;
        self.gone = "handed off to a nested machine";
        (self.sink)(&Event::ChannelHandedOff {
            from: self.owner.clone(),
        });
        Ok(Channel {
            core: Some(core),
            owner: self.owner.clone(),
            sink: self.sink.clone(),
            gone: "",
        })
    }

    /// Close the transport. Closing a channel that was taken or already
    /// closed does nothing.
    pub async fn close(&mut self) -> Result<()> {
        match self.core.take() {
            Some(mut core) => {
                self.gone = "closed";
                core.transport.close().await
            }
            None => Ok(()),
        }
    }

    fn parts(&mut self) -> Result<(&mut Core, &str, &EventSink)> {
        match self.core.as_mut() {
            Some(core) => Ok((core, &self.owner, &self.sink)),
            None => Err(Error::ChannelUnavailable {
                machine: self.owner.clone(),
                reason: self.gone,
            }),
        }
    }

    /// Pattern that marks the shell being ready for the next command.
    pub fn prompt(&self) -> Option<&Pattern> {
        self.core.as_ref().and_then(|core| core.prompt.as_ref())
    }

    /// Replace the prompt pattern. `None` while no interpreter is ready.
    pub fn set_prompt(&mut self, prompt: Option<Pattern>) -> Result<()> {
        self.parts()?.0.prompt = prompt;
        Ok(())
    }

    /// Write raw bytes to the console.
    pub async fn send(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        let (core, _, _) = self.parts()?;
        core.transport.write(data.as_ref()).await
    }

    /// Write `line` followed by a newline.
    pub async fn sendline(&mut self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.send(data).await
    }

    /// Read until `pattern` matches, returning everything up to and
    /// including the match.
    ///
    /// On timeout the error carries the unconsumed output, which stays in
    /// the buffer.
    pub async fn read_until(&mut self, pattern: &Pattern, timeout: Duration) -> Result<String> {
        let (_, text) = self
            .read_until_any(std::slice::from_ref(pattern), timeout)
            .await?;
        Ok(text)
    }

    /// Read until any of `patterns` matches. The pattern whose match ends
    /// first wins; its index is returned with the consumed text.
    pub async fn read_until_any(
        &mut self,
        patterns: &[Pattern],
        timeout: Duration,
    ) -> Result<(usize, String)> {
        let deadline = Instant::now() + timeout;
        let (core, owner, sink) = self.parts()?;
        loop {
            if let Some((idx, end)) = earliest_match(patterns, &core.buffer) {
                let consumed: String = core.buffer.drain(..end).collect();
                sink(&Event::PatternMatched {
                    machine: owner.to_string(),
                    pattern: patterns[idx].to_string(),
                });
                return Ok((idx, consumed));
            }

            match core.transport.read_available(deadline).await? {
                Received::Data(data) => {
                    sink(&Event::Received {
                        machine: owner.to_string(),
                        data: data.clone(),
                    });
                    core.push(&data);
                }
                Received::Idle => {
                    let pattern = describe(patterns);
                    sink(&Event::Timeout {
                        machine: owner.to_string(),
                        pattern: pattern.clone(),
                    });
                    return Err(Error::Timeout {
                        machine: owner.to_string(),
                        pattern,
                        timeout,
                        partial: core.buffer.clone(),
                    });
                }
                Received::Closed => {
                    return Err(Error::Disconnected {
                        machine: owner.to_string(),
                        partial: core.buffer.clone(),
                    });
                }
            }
        }
    }

    /// Collect everything the console sends during `duration`.
    pub async fn drain(&mut self, duration: Duration) -> Result<String> {
        let deadline = Instant::now() + duration;
        let (core, owner, sink) = self.parts()?;
        loop {
            match core.transport.read_available(deadline).await? {
                Received::Data(data) => {
                    sink(&Event::Received {
                        machine: owner.to_string(),
                        data: data.clone(),
                    });
                    core.push(&data);
                }
                Received::Idle => return Ok(std::mem::take(&mut core.buffer)),
                Received::Closed => {
                    return Err(Error::Disconnected {
                        machine: owner.to_string(),
                        partial: core.buffer.clone(),
                    });
                }
            }
        }
    }

    /// Run `command` and return its output, ignoring the exit status.
    pub async fn raw_command(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let (_, output) = self.raw_command_with_retval(command, timeout).await?;
        Ok(output)
    }

    /// Run `command` and recover its exit status.
    ///
    /// Returns the status and the combined stdout/stderr with `\r\n`
    /// normalized and exactly one trailing newline (empty output stays
    /// empty). If the channel has a prompt, the prompt after the command is
    /// consumed as well.
    pub async fn raw_command_with_retval(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<(i32, String)> {
        let deadline = Instant::now() + timeout;
        let sentinel = Sentinel::generate();
        let re = sentinel.regex()?;
        let marker = Pattern::Regex(re.clone());

        (self.sink)(&Event::CommandIssued {
            machine: self.owner.clone(),
            command: command.to_string(),
        });
        self.sendline(&sentinel.wrap(command)).await?;
        let text = self.read_until(&marker, remaining(deadline)).await?;
        let (status, output) = sentinel.split(&re, &text).ok_or_else(|| Error::Protocol {
            machine: self.owner.clone(),
            reason: format!("unreadable exit status in {text:?}"),
        })?;

        if let Some(prompt) = self.prompt().cloned() {
            self.read_until(&prompt, remaining(deadline)).await?;
        }

        (self.sink)(&Event::CommandFinished {
            machine: self.owner.clone(),
            status,
        });
        Ok((status, output))
    }

    /// Forward `input` to the console and console output to `output` until
    /// `end_marker` shows up in the console output.
    ///
    /// Input forwarding and output watching run as two concurrent flows
    /// sharing the transport; both have finished when this returns. Output
    /// after the marker stays buffered in the channel.
    pub async fn attach_interactive<R, W>(
        &mut self,
        input: &mut R,
        output: &mut W,
        end_marker: &str,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let (core, owner, _) = self.parts()?;

        output.write_all(core.buffer.as_bytes()).await?;
        output.flush().await?;
        core.buffer.clear();

        let transport = Mutex::new(&mut core.transport);
        let (stop_tx, stop_rx) = watch::channel(false);
        let ((), leftover) = tokio::try_join!(
            forward_input(input, &transport, stop_rx),
            watch_output(&transport, output, end_marker, stop_tx, owner),
        )?;
        drop(transport);

        core.buffer.push_str(&leftover);
        Ok(())
    }

    /// Open an independent session to the same endpoint, if the transport
    /// can multiplex.
    pub async fn open_additional_session(&mut self) -> Result<Box<dyn Transport>> {
        let (core, owner, _) = self.parts()?;
        core.transport
            .open_additional_session()
            .await
            .map_err(|err| match err {
                Error::UnsupportedOperation {
                    operation, reason, ..
                } => Error::UnsupportedOperation {
                    machine: owner.to_string(),
                    operation,
                    reason,
                },
                other => other,
            })
    }
}

impl Core {
    /// Append raw bytes to the text buffer, holding back an incomplete UTF-8
    /// sequence at the end until the rest of it arrives.
    fn push(&mut self, data: &[u8]) {
        self.undecoded.extend_from_slice(data);
        loop {
            let (valid, invalid) = match std::str::from_utf8(&self.undecoded) {
                Ok(_) => (self.undecoded.len(), None),
                Err(err) => (err.valid_up_to(), Some(err.error_len())),
            };
            self.buffer
                .push_str(&String::from_utf8_lossy(&self.undecoded[..valid]));
            match invalid {
                None => {
                    self.undecoded.clear();
                    return;
                }
                Some(None) => {
                    self.undecoded.drain(..valid);
                    return;
                }
                Some(Some(len)) => {
                    self.buffer.push(char::REPLACEMENT_CHARACTER);
                    self.undecoded.drain(..valid + len);
                }
            }
        }
    }
}

/// Index of the pattern whose match ends first, and where that match ends.
fn earliest_match(patterns: &[Pattern], buffer: &str) -> Option<(usize, usize)> {
    patterns
        .iter()
        .enumerate()
        .filter_map(|(idx, p)| p.find(buffer).map(|range| (idx, range.end)))
        .min_by_key(|&(idx, end)| (end, idx))
}

fn describe(patterns: &[Pattern]) -> String {
    patterns
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" or ")
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Marker that ends the output of one command.
///
/// The id is random per command so that no command output, accidental or
/// crafted, can end the read early. The wrapper echoes the marker from two
/// separately quoted halves, so the echoed command line never matches.
struct Sentinel {
    id: String,
}

impl Sentinel {
    fn generate() -> Self {
        let id: u64 = rand::thread_rng().r#gen();
        Sentinel {
            id: format!("{id:016x}"),
        }
    }

    fn wrap(&self, command: &str) -> String {
        let mut trimmed = command.trim_end();
        // `cmd ;` would become `cmd ;; echo`. Keep `\;` and `;;` intact.
        if let Some(rest) = trimmed.strip_suffix(';') {
            if !rest.ends_with(['\\', ';']) {
                trimmed = rest.trim_end();
            }
        }
        let separator = if trimmed.ends_with('&') && !trimmed.ends_with("&&") {
            " "
        } else {
            "; "
        };
        format!(
            "{trimmed}{separator}echo '{SENTINEL_PREFIX}''{}:'$?",
            self.id
        )
    }

    /// What the echoed command line contains right before its line break.
    fn echo_marker(&self) -> String {
        format!("''{}:'$?", self.id)
    }

    fn regex(&self) -> Result<Regex> {
        Ok(Regex::new(&format!(
            r"{}{}:(-?\d+)\r?\n",
            regex::escape(SENTINEL_PREFIX),
            self.id
        ))?)
    }

    /// Split text read up to the marker into exit status and output.
    fn split(&self, re: &Regex, text: &str) -> Option<(i32, String)> {
        let caps = re.captures(text)?;
        let status = caps.get(1)?.as_str().parse().ok()?;
        let mut output = &text[..caps.get(0)?.start()];

        if let Some(pos) = output.rfind(&self.echo_marker()) {
            output = match output[pos..].find('\n') {
                Some(nl) => &output[pos + nl + 1..],
                None => "",
            };
        }
        Some((status, normalize_output(output)))
    }
}

fn normalize_output(output: &str) -> String {
    let text = output.replace("\r\n", "\n");
    let text = text.trim_end_matches(['\n', '\r']);
    if text.is_empty() {
        String::new()
    } else {
        format!("{text}\n")
    }
}

async fn forward_input<R: AsyncRead + Unpin>(
    input: &mut R,
    transport: &Mutex<&mut Box<dyn Transport>>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = stop.changed() => return Ok(()),
            read = input.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    // Local input is exhausted; the session ends on the marker.
                    let _ = stop.changed().await;
                    return Ok(());
                }
                transport.lock().await.write(&buf[..n]).await?;
            }
        }
    }
}

async fn watch_output<W: AsyncWrite + Unpin>(
    transport: &Mutex<&mut Box<dyn Transport>>,
    output: &mut W,
    end_marker: &str,
    stop: watch::Sender<bool>,
    machine: &str,
) -> Result<String> {
    let result = watch_for_marker(transport, output, end_marker, machine).await;
    let _ = stop.send(true);
    result
}

async fn watch_for_marker<W: AsyncWrite + Unpin>(
    transport: &Mutex<&mut Box<dyn Transport>>,
    output: &mut W,
    end_marker: &str,
    machine: &str,
) -> Result<String> {
    let mut seen = String::new();
    loop {
        let received = {
            let mut transport = transport.lock().await;
            transport
                .read_available(Instant::now() + INTERACTIVE_POLL)
                .await?
        };
        match received {
            Received::Data(data) => {
                output.write_all(&data).await?;
                output.flush().await?;

                seen.push_str(&String::from_utf8_lossy(&data));
                if let Some(idx) = seen.find(end_marker) {
                    return Ok(seen[idx + end_marker.len()..].to_string());
                }
                // Only a partial marker can still matter.
                if seen.len() > end_marker.len() {
                    let mut cut = seen.len() - end_marker.len();
                    while !seen.is_char_boundary(cut) {
                        cut += 1;
                    }
                    seen.drain(..cut);
                }
            }
            Received::Idle => {}
            Received::Closed => {
                return Err(Error::Disconnected {
                    machine: machine.to_string(),
                    partial: seen,
                });
            }
        }
    }
}
