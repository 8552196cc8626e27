//! Paths bound to the machine they live on.

use crate::error::{Error, Result};
use std::fmt;
use std::ops::Div;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one acquired machine. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineId(u64);

impl MachineId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        MachineId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A filesystem path on one specific machine.
///
/// This is a command-building value, not a filesystem API: it only ever
/// renders into command lines of the machine it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    host: MachineId,
    host_name: String,
    path: String,
}

impl Path {
    pub(crate) fn new(host: MachineId, host_name: &str, path: impl Into<String>) -> Self {
        Path {
            host,
            host_name: host_name.to_string(),
            path: path.into(),
        }
    }

    pub fn host(&self) -> MachineId {
        self.host
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// The path as the owning machine sees it.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Return the path string if `self` belongs to machine `host`.
    pub fn on(&self, host: MachineId, machine: &str) -> Result<&str> {
        if self.host != host {
            return Err(Error::WrongHost {
                machine: machine.to_string(),
                owner: self.host_name.clone(),
                path: self.path.clone(),
            });
        }
        Ok(&self.path)
    }

    /// Append a path segment.
    pub fn join(&self, segment: &str) -> Path {
        let path = if segment.starts_with('/') {
            segment.to_string()
        } else if self.path.ends_with('/') {
            format!("{}{segment}", self.path)
        } else {
            format!("{}/{segment}", self.path)
        };
        Path {
            path,
            ..self.clone()
        }
    }

    /// Append another path of the same machine.
    pub fn join_path(&self, other: &Path) -> Result<Path> {
        let segment = other.on(self.host, &self.host_name)?;
        Ok(self.join(segment.trim_start_matches('/')))
    }

    pub fn parent(&self) -> Option<Path> {
        let trimmed = self.path.trim_end_matches('/');
        let idx = trimmed.rfind('/')?;
        let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
        Some(Path {
            path: parent.to_string(),
            ..self.clone()
        })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
    }
}

impl Div<&str> for &Path {
    type Output = Path;

    fn div(self, segment: &str) -> Path {
        self.join(segment)
    }
}

impl Div<&str> for Path {
    type Output = Path;

    fn div(self, segment: &str) -> Path {
        self.join(segment)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_name, self.path)
    }
}
