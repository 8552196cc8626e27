use crate::error::Result;
use regex::Regex;
use std::fmt;
use std::ops::Range;

/// What [`Channel::read_until`](crate::Channel::read_until) waits for.
///
/// Patterns are matched against the raw accumulated text, not line by line:
/// prompts routinely show up mid-line after garbled boot output. A regex can
/// pin itself to the current tail of the buffer with `\z`.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Regex(Regex),
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Pattern::Literal(text.into())
    }

    pub fn regex(re: &str) -> Result<Self> {
        Ok(Pattern::Regex(Regex::new(re)?))
    }

    /// Byte range of the first match in `haystack`.
    pub fn find(&self, haystack: &str) -> Option<Range<usize>> {
        match self {
            Pattern::Literal(text) => haystack
                .find(text.as_str())
                .map(|start| start..start + text.len()),
            Pattern::Regex(re) => re.find(haystack).map(|m| m.range()),
        }
    }
}

impl From<&str> for Pattern {
    fn from(text: &str) -> Self {
        Pattern::literal(text)
    }
}

impl From<String> for Pattern {
    fn from(text: String) -> Self {
        Pattern::Literal(text)
    }
}

impl From<Regex> for Pattern {
    fn from(re: Regex) -> Self {
        Pattern::Regex(re)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Literal(text) => write!(f, "{text:?}"),
            Pattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}
