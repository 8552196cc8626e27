//! Error type shared by every layer of a machine stack.

use std::time::Duration;
use thiserror::Error;

/// How much of the received console output an error message quotes.
const PARTIAL_TAIL: usize = 256;

/// Errors raised while talking to a machine.
///
/// Every variant that waits on a console keeps the text that *was* received,
/// so a desynchronized console can be diagnosed from the error alone.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{machine}: timed out after {timeout:?} waiting for {pattern}; last output: {:?}", tail(.partial))]
    Timeout {
        machine: String,
        pattern: String,
        timeout: Duration,
        partial: String,
    },

    #[error("{machine}: {path} is bound to machine {owner}, not this one")]
    WrongHost {
        machine: String,
        owner: String,
        path: String,
    },

    #[error("{machine}: command `{command}` exited with status {status}:\n{output}")]
    CommandFailed {
        machine: String,
        command: String,
        status: i32,
        output: String,
    },

    #[error("{machine}: missed the autoboot window, {pattern} not seen within {window:?}; last output: {:?}", tail(.partial))]
    InterceptionFailed {
        machine: String,
        pattern: String,
        window: Duration,
        partial: String,
    },

    #[error("{machine}: login protocol mismatch: {reason}; last output: {:?}", tail(.partial))]
    LoginProtocolMismatch {
        machine: String,
        reason: String,
        partial: String,
    },

    #[error("{machine}: {operation} is not supported: {reason}")]
    UnsupportedOperation {
        machine: String,
        operation: &'static str,
        reason: String,
    },

    #[error("{machine}: channel is unavailable, it was {reason}")]
    ChannelUnavailable {
        machine: String,
        reason: &'static str,
    },

    #[error("{machine}: console disconnected; last output: {:?}", tail(.partial))]
    Disconnected { machine: String, partial: String },

    #[error("{machine}: unexpected console response: {reason}")]
    Protocol { machine: String, reason: String },

    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport failure: {0:#}")]
    Transport(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{original}\n(cleanup also failed: {cleanup})")]
    CleanupFailed {
        #[source]
        original: Box<Error>,
        cleanup: Box<Error>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Attach the outcome of a cleanup step to this error.
    ///
    /// A failed cleanup never replaces `self`; both are reported and `self`
    /// stays the [`source`](std::error::Error::source).
    pub fn with_cleanup(self, cleanup: Result<()>) -> Error {
        match cleanup {
            Ok(()) => self,
            Err(cleanup) => Error::CleanupFailed {
                original: Box::new(self),
                cleanup: Box::new(cleanup),
            },
        }
    }

    /// The root cause, looking through [`Error::CleanupFailed`].
    pub fn root(&self) -> &Error {
        match self {
            Error::CleanupFailed { original, .. } => original.root(),
            other => other,
        }
    }

    /// Console output received before the failure, if this error carries any.
    pub fn partial_output(&self) -> Option<&str> {
        match self.root() {
            Error::Timeout { partial, .. }
            | Error::InterceptionFailed { partial, .. }
            | Error::LoginProtocolMismatch { partial, .. }
            | Error::Disconnected { partial, .. } => Some(partial),
            Error::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Transport(err)
    }
}

fn tail(text: &str) -> &str {
    if text.len() <= PARTIAL_TAIL {
        return text;
    }
    let mut start = text.len() - PARTIAL_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout(partial: &str) -> Error {
        Error::Timeout {
            machine: "board".into(),
            pattern: "\"login: \"".into(),
            timeout: Duration::from_secs(1),
            partial: partial.into(),
        }
    }

    #[test]
    fn test_with_cleanup_ok_keeps_error() {
        let err = timeout("U-Boot 2024.01").with_cleanup(Ok(()));
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn test_with_cleanup_failure_keeps_root_cause() {
        let cleanup = Err(Error::InvalidArgument("relay offline".into()));
        let err = timeout("U-Boot 2024.01").with_cleanup(cleanup);

        assert!(matches!(err.root(), Error::Timeout { .. }));
        let text = err.to_string();
        assert!(text.contains("login: "), "got: {text}");
        assert!(text.contains("relay offline"), "got: {text}");

        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("timed out"));
    }

    #[test]
    fn test_partial_output_through_cleanup() {
        let err = timeout("booting kernel").with_cleanup(Err(Error::InvalidArgument("x".into())));
        assert_eq!(err.partial_output(), Some("booting kernel"));
    }

    #[test]
    fn test_message_quotes_only_the_tail() {
        let long = format!("{}END", "x".repeat(4 * PARTIAL_TAIL));
        let text = timeout(&long).to_string();
        assert!(text.contains("END"));
        assert!(text.len() < 2 * PARTIAL_TAIL);
    }
}
