use std::fmt;
use std::sync::Arc;

/// Observable things that happen on a machine stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A command line was sent to a machine's shell
    CommandIssued { machine: String, command: String },

    /// A command sent through the sentinel protocol reported its status
    CommandFinished { machine: String, status: i32 },

    /// `read_until` found its pattern
    PatternMatched { machine: String, pattern: String },

    /// A deadline expired while waiting for a pattern
    Timeout { machine: String, pattern: String },

    /// Raw bytes arrived from the console
    Received { machine: String, data: Vec<u8> },

    /// Power was switched on or off
    PowerChanged { machine: String, on: bool },

    /// A boot or login state machine moved to a new state
    StateChanged {
        machine: String,
        from: &'static str,
        to: &'static str,
    },

    /// A channel was handed to a nested machine
    ChannelHandedOff { from: String },
}

/// Receiver for [`Event`]s, injected into every machine of a stack.
pub type EventSink = Arc<dyn Fn(&Event) + Send + Sync>;

/// The default sink: forwards every event to the `log` facade.
pub fn log_sink() -> EventSink {
    Arc::new(|event: &Event| match event {
        Event::CommandIssued { .. } | Event::PowerChanged { .. } => log::info!("{event}"),
        Event::Timeout { .. } => log::warn!("{event}"),
        Event::Received { .. } => log::trace!("{event}"),
        _ => log::debug!("{event}"),
    })
}

/// A sink that drops everything.
pub fn null_sink() -> EventSink {
    Arc::new(|_: &Event| {})
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::CommandIssued { machine, command } => write!(f, "[{machine}] $ {command}"),
            Event::CommandFinished { machine, status } => {
                write!(f, "[{machine}] exit status {status}")
            }
            Event::PatternMatched { machine, pattern } => write!(f, "[{machine}] matched {pattern}"),
            Event::Timeout { machine, pattern } => {
                write!(f, "[{machine}] timeout waiting for {pattern}")
            }
            Event::Received { machine, data } => write!(
                f,
                "[{machine}] < {}",
                String::from_utf8_lossy(data).escape_debug()
            ),
            Event::PowerChanged { machine, on } => {
                write!(f, "[{machine}] power {}", if *on { "on" } else { "off" })
            }
            Event::StateChanged { machine, from, to } => write!(f, "[{machine}] {from} -> {to}"),
            Event::ChannelHandedOff { from } => write!(f, "[{from}] channel handed off"),
        }
    }
}
