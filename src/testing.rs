//! A scripted console transport for unit tests.

use crate::channel::SENTINEL_PREFIX;
use crate::error::{Error, Result};
use crate::transport::{Received, Transport};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

type Responder = Box<dyn FnMut(&str) -> Vec<(Duration, String)> + Send>;

/// Console that echoes what is written, answers complete lines through a
/// responder and emits scheduled output relative to its creation.
pub(crate) struct ScriptedConsole {
    start: Instant,
    // (due, data); `None` hangs up. Sorted by due time.
    pending: Vec<(Instant, Option<Vec<u8>>)>,
    line: String,
    echo: bool,
    responder: Responder,
    log: ConsoleLog,
    hung_up: bool,
}

/// What a [`ScriptedConsole`] saw, shared with the test body.
#[derive(Clone, Default)]
pub(crate) struct ConsoleLog(Arc<Mutex<LogInner>>);

#[derive(Default)]
struct LogInner {
    written: String,
    lines: Vec<String>,
    closed: bool,
}

impl ConsoleLog {
    pub fn written(&self) -> String {
        self.0.lock().unwrap().written.clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().lines.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }
}

impl ScriptedConsole {
    pub fn new() -> Self {
        ScriptedConsole {
            start: Instant::now(),
            pending: Vec::new(),
            line: String::new(),
            echo: true,
            responder: Box::new(|_| Vec::new()),
            log: ConsoleLog::default(),
            hung_up: false,
        }
    }

    /// Emit `text` at `offset` after creation.
    pub fn emit_at(mut self, offset: Duration, text: &str) -> Self {
        let due = self.start + offset;
        self.schedule(due, Some(text.as_bytes().to_vec()));
        self
    }

    pub fn emit_bytes_at(mut self, offset: Duration, data: &[u8]) -> Self {
        let due = self.start + offset;
        self.schedule(due, Some(data.to_vec()));
        self
    }

    pub fn hang_up_at(mut self, offset: Duration) -> Self {
        let due = self.start + offset;
        self.schedule(due, None);
        self
    }

    pub fn on_line(
        mut self,
        responder: impl FnMut(&str) -> Vec<(Duration, String)> + Send + 'static,
    ) -> Self {
        self.responder = Box::new(responder);
        self
    }

    pub fn without_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn log(&self) -> ConsoleLog {
        self.log.clone()
    }

    pub fn boxed(self) -> Box<dyn Transport> {
        Box::new(self)
    }

    fn schedule(&mut self, due: Instant, data: Option<Vec<u8>>) {
        let idx = self.pending.partition_point(|(t, _)| *t <= due);
        self.pending.insert(idx, (due, data));
    }
}

#[async_trait]
impl Transport for ScriptedConsole {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.hung_up || self.log.is_closed() {
            return Err(Error::Transport(anyhow::anyhow!("console is gone")));
        }
        let now = Instant::now();
        let text = String::from_utf8_lossy(data).into_owned();
        self.log.0.lock().unwrap().written.push_str(&text);

        if self.echo {
            let echoed = text.replace('\r', "\n").replace('\n', "\r\n");
            self.schedule(now, Some(echoed.into_bytes()));
        }

        for ch in text.chars() {
            if ch == '\n' || ch == '\r' {
                let line = std::mem::take(&mut self.line);
                self.log.0.lock().unwrap().lines.push(line.clone());
                for (delay, reply) in (self.responder)(&line) {
                    self.schedule(now + delay, Some(reply.into_bytes()));
                }
            } else {
                self.line.push(ch);
            }
        }
        Ok(())
    }

    async fn read_available(&mut self, deadline: Instant) -> Result<Received> {
        if self.hung_up {
            return Ok(Received::Closed);
        }
        if let Some((due, _)) = self.pending.first() {
            let due = *due;
            if due < deadline {
                if due > Instant::now() {
                    tokio::time::sleep_until(due).await;
                }
                let (_, data) = self.pending.remove(0);
                return Ok(match data {
                    Some(data) => Received::Data(data),
                    None => {
                        self.hung_up = true;
                        Received::Closed
                    }
                });
            }
        }
        tokio::time::sleep_until(deadline).await;
        Ok(Received::Idle)
    }

    async fn close(&mut self) -> Result<()> {
        self.log.0.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Responder that behaves like a POSIX shell sitting at `prompt`.
///
/// Understands `PS1=` assignments and the exit-status wrapper; the command
/// itself is handed to `run`, which returns its status and output.
pub(crate) fn fake_shell(
    prompt: &str,
    mut run: impl FnMut(&str) -> (i32, String) + Send + 'static,
) -> impl FnMut(&str) -> Vec<(Duration, String)> + Send + 'static {
    let mut prompt = prompt.to_string();
    move |line: &str| {
        if let Some((command, marker)) = split_wrapped(line) {
            let (status, output) = run(command);
            let output = output.replace('\n', "\r\n");
            return vec![(
                Duration::ZERO,
                format!("{output}{marker}{status}\r\n{prompt}"),
            )];
        }
        if let Some(assignment) = line.strip_prefix("PS1=") {
            let value = assignment.split("; ").next().unwrap_or_default();
            prompt = value.replace('\'', "");
        }
        vec![(Duration::ZERO, prompt.clone())]
    }
}

/// Split a wrapped command line into the command and the status marker the
/// shell would print.
pub(crate) fn split_wrapped(line: &str) -> Option<(&str, String)> {
    let idx = line.rfind(&format!(" echo '{SENTINEL_PREFIX}'"))?;
    let command = line[..idx].trim_end_matches(';');
    let marker = line[idx + " echo ".len()..]
        .strip_suffix("$?")?
        .replace('\'', "");
    Some((command, marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_wrapped() {
        let line = format!("uname -a; echo '{SENTINEL_PREFIX}''00ff:'$?");
        let (command, marker) = split_wrapped(&line).unwrap();
        assert_eq!(command, "uname -a");
        assert_eq!(marker, format!("{SENTINEL_PREFIX}00ff:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_output_respects_deadline() {
        let mut console = ScriptedConsole::new().emit_at(Duration::from_secs(2), "late");
        let early = Instant::now() + Duration::from_secs(1);
        assert_eq!(console.read_available(early).await.unwrap(), Received::Idle);

        let later = Instant::now() + Duration::from_secs(5);
        assert_eq!(
            console.read_available(later).await.unwrap(),
            Received::Data(b"late".to_vec())
        );
    }
}
