//! Command arguments and command-line building.
//!
//! A command is a list of [`Arg`]s. Literal strings are shell-quoted so they
//! always stay a single word, [`Special`] tokens are emitted unquoted, and
//! [`Path`]s render to their string after a host check.
//!
//! ```
//! use labshell::{cmd, Special};
//!
//! let args = cmd!["grep", "a b", Special::PIPE, "wc", "-l"];
//! assert_eq!(args.len(), 5);
//! ```

use crate::error::{Error, Result};
use crate::path::{MachineId, Path};
use crate::shell::quote;

/// One token of a command line.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Literal(String),
    Special(Special),
    Path(Path),
}

/// An unquoted token: shell operators, redirections, raw snippets.
///
/// Only constructible through the associated constants and the validating
/// constructors below.
#[derive(Debug, Clone, PartialEq)]
pub struct Special(Token);

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Operator(&'static str),
    Redirect { op: &'static str, target: Path },
    Raw(String),
}

impl Special {
    pub const PIPE: Special = Special(Token::Operator("|"));
    pub const AND: Special = Special(Token::Operator("&&"));
    pub const OR: Special = Special(Token::Operator("||"));
    pub const THEN: Special = Special(Token::Operator(";"));
    pub const BACKGROUND: Special = Special(Token::Operator("&"));
    pub const STDERR_TO_STDOUT: Special = Special(Token::Operator("2>&1"));

    /// `>path`
    pub fn redirect_stdout(target: &Path) -> Special {
        Special(Token::Redirect {
            op: ">",
            target: target.clone(),
        })
    }

    /// `>>path`
    pub fn append_stdout(target: &Path) -> Special {
        Special(Token::Redirect {
            op: ">>",
            target: target.clone(),
        })
    }

    /// `2>path`
    pub fn redirect_stderr(target: &Path) -> Special {
        Special(Token::Redirect {
            op: "2>",
            target: target.clone(),
        })
    }

    /// A snippet passed to the shell verbatim.
    ///
    /// Must be a single non-empty line: a line break would end the command
    /// before the exit status is reported.
    pub fn raw(text: impl Into<String>) -> Result<Special> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(Error::InvalidArgument("raw token is empty".into()));
        }
        if text.contains(['\n', '\r']) {
            return Err(Error::InvalidArgument(format!(
                "raw token spans multiple lines: {text:?}"
            )));
        }
        Ok(Special(Token::Raw(text)))
    }

    fn render(&self, host: MachineId, machine: &str) -> Result<String> {
        Ok(match &self.0 {
            Token::Operator(op) => op.to_string(),
            Token::Redirect { op, target } => format!("{op}{}", quote(target.on(host, machine)?)),
            Token::Raw(text) => text.clone(),
        })
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Literal(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Literal(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::Literal(s.clone())
    }
}

impl From<Special> for Arg {
    fn from(s: Special) -> Self {
        Arg::Special(s)
    }
}

impl From<Path> for Arg {
    fn from(p: Path) -> Self {
        Arg::Path(p)
    }
}

impl From<&Path> for Arg {
    fn from(p: &Path) -> Self {
        Arg::Path(p.clone())
    }
}

/// Build a `Vec<Arg>` from mixed strings, [`Special`]s and [`Path`]s.
#[macro_export]
macro_rules! cmd {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::Arg::from($arg)),*]
    };
}

/// Render `args` into the command line machine `host` would run.
///
/// A line ending in `|`, `&&` or `||` is rejected: the shell would wait for
/// the rest of the command.
pub(crate) fn build_command(args: &[Arg], host: MachineId, machine: &str) -> Result<String> {
    if let Some(Arg::Special(Special(Token::Operator(op @ ("|" | "&&" | "||"))))) = args.last() {
        return Err(Error::InvalidArgument(format!(
            "command ends with operator {op}"
        )));
    }
    let mut words = Vec::with_capacity(args.len());
    for arg in args {
        words.push(match arg {
            Arg::Literal(s) => quote(s).into_owned(),
            Arg::Special(special) => special.render(host, machine)?,
            Arg::Path(path) => quote(path.on(host, machine)?).into_owned(),
        });
    }
    Ok(words.join(" "))
}
