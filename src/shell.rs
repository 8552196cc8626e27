//! Shell dialects and shell quoting.

use std::borrow::Cow;

/// How one command interpreter sets its prompt and turns off history and
/// line editing.
///
/// Pure data, shared by every machine that runs the same interpreter.
#[derive(Debug)]
pub struct ShellDialect {
    name: &'static str,
    enable_editing: Option<&'static str>,
    disable_editing: Option<&'static str>,
    disable_history: Option<&'static str>,
    set_prompt: Option<fn(&str) -> String>,
}

pub static BASH: ShellDialect = ShellDialect {
    name: "bash",
    enable_editing: Some("set -o emacs"),
    disable_editing: Some("set +o emacs; set +o vi"),
    disable_history: Some("unset HISTFILE"),
    set_prompt: Some(bash_prompt),
};

/// Busybox `ash`.
pub static ASH: ShellDialect = ShellDialect {
    name: "ash",
    enable_editing: None,
    disable_editing: None,
    disable_history: Some("unset HISTFILE"),
    set_prompt: Some(ash_prompt),
};

fn bash_prompt(prompt: &str) -> String {
    format!("PS1={}; PROMPT_COMMAND=", quote_split(prompt))
}

fn ash_prompt(prompt: &str) -> String {
    format!("PS1={}", quote_split(prompt))
}

impl ShellDialect {
    /// Program name that starts a sub-shell of this dialect.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn enable_editing(&self) -> Option<&'static str> {
        self.enable_editing
    }

    pub fn disable_editing(&self) -> Option<&'static str> {
        self.disable_editing
    }

    pub fn disable_history(&self) -> Option<&'static str> {
        self.disable_history
    }

    /// Command that sets the prompt to `prompt`.
    ///
    /// The prompt text is quoted in two halves, so the echo of this command
    /// never contains the prompt itself.
    pub fn set_prompt(&self, prompt: &str) -> Option<String> {
        self.set_prompt.map(|render| render(prompt))
    }
}

/// Quote `s` so a POSIX shell reads it back as exactly one word.
pub fn quote(s: &str) -> Cow<'_, str> {
    if s.is_empty() {
        return Cow::Borrowed("''");
    }
    if s.chars().all(is_safe) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(force_quote(s))
}

/// Quote `s` as two adjacent quoted halves (`'ab''cd'`).
///
/// The shell still reads one word, but the command line itself no longer
/// contains `s` verbatim.
pub(crate) fn quote_split(s: &str) -> String {
    let mid = s
        .char_indices()
        .nth(s.chars().count() / 2)
        .map_or(s.len(), |(i, _)| i);
    let (head, rest) = s.split_at(mid);
    format!("{}{}", force_quote(head), force_quote(rest))
}

fn force_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c)
}
