use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Errors reported by a pseudo-console transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open pseudo-console: {0}")]
    OpenFailed(String),

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("failed to resize pseudo-console: {0}")]
    ResizeFailed(String),

    #[error("pseudo-console {0} was already taken")]
    EndpointTaken(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Convert into an `io::Error`, keeping the original when there is one.
    pub fn into_io(self) -> std::io::Error {
        match self {
            TransportError::Io(err) => err,
            other => std::io::Error::other(other.to_string()),
        }
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// A console needs at least one column and one row.
    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 25 }
    }
}

/// What to run inside a pseudo-console.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// `None` inherits the parent's working directory.
    pub cwd: Option<PathBuf>,
    /// `None` inherits the parent's environment; `Some` replaces it entirely.
    pub env: Option<BTreeMap<String, String>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// The environment as `KEY=VALUE` entries, sorted by key.
    pub fn env_block(&self) -> Option<Vec<String>> {
        self.env
            .as_ref()
            .map(|env| env.iter().map(|(k, v)| format!("{k}={v}")).collect())
    }
}

/// Opens pseudo-consoles. One implementation talks to the OS, another is the
/// in-memory mock used by tests.
pub trait Transport: Send + Sync {
    /// Create the pipe pair and the pseudo-console bound to it.
    fn open(&self, size: TermSize) -> Result<Box<dyn PseudoConsole>, TransportError>;
}

/// A pseudo-console plus the host side of its pipes.
///
/// Dropping the console closes it together with any pipe ends it still owns.
pub trait PseudoConsole: Send {
    /// Spawn the child attached to this console. The console's transport-side
    /// pipe ends are closed once the child has inherited them, so a console
    /// accepts a single child.
    fn spawn(&mut self, command: &CommandSpec) -> Result<Box<dyn ChildProcess>, TransportError>;

    /// Hand out the read end that carries the child's output.
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, TransportError>;

    /// Hand out the write end that feeds the child's input.
    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, TransportError>;

    fn resize(&mut self, size: TermSize) -> Result<(), TransportError>;

    fn size(&self) -> Result<TermSize, TransportError>;
}

/// The child process attached to a pseudo-console.
pub trait ChildProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Forcibly terminate the process.
    fn kill(&mut self) -> std::io::Result<()>;

    /// Non-blocking exit-status query. `Ok(None)` while the process runs.
    fn try_wait(&mut self) -> std::io::Result<Option<i32>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_size() {
        let size = TermSize::default();
        assert_eq!(size, TermSize::new(80, 25));
        assert!(size.is_valid());
        assert!(!TermSize::new(0, 25).is_valid());
        assert!(!TermSize::new(80, 0).is_valid());
    }

    #[test]
    fn test_env_block_is_sorted() {
        let mut spec = CommandSpec::new("cmd.exe");
        let mut env = BTreeMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        spec.env = Some(env);

        assert_eq!(
            spec.env_block(),
            Some(vec!["A=1".to_string(), "B=2".to_string()])
        );
    }

    #[test]
    fn test_env_block_inherits_when_unset() {
        assert_eq!(CommandSpec::new("sh").env_block(), None);
    }

    #[test]
    fn test_into_io_keeps_os_error() {
        let err = TransportError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(err.into_io().kind(), std::io::ErrorKind::BrokenPipe);

        let err = TransportError::ResizeFailed("bad size".into());
        assert!(err.into_io().to_string().contains("bad size"));
    }
}
