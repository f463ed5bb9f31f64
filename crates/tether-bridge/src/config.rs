//! Bridge configuration and per-session options.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_pty::{CommandSpec, TermSize};

use crate::error::{BridgeError, Result};

const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
const MIN_READ_BUFFER_SIZE: usize = 256;
const DEFAULT_EXIT_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_EXIT_DRAIN_TIMEOUT_MS: u64 = 250;
const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 500;

/// Tunables shared by every session of a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Console size used when the options leave `cols`/`rows` unset.
    pub default_size: TermSize,
    /// Size of the buffer each output read goes into.
    pub read_buffer_size: usize,
    /// How often the exit watcher polls the child's status.
    pub exit_poll_interval_ms: u64,
    /// How long the exit watcher waits for buffered output to drain before
    /// reporting the exit.
    pub exit_drain_timeout_ms: u64,
    /// How long `close` waits for a terminated child to report its status.
    pub close_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_size: TermSize::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            exit_poll_interval_ms: DEFAULT_EXIT_POLL_INTERVAL_MS,
            exit_drain_timeout_ms: DEFAULT_EXIT_DRAIN_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str::<Self>(json).map(Self::normalized)
    }

    /// Replace unusable values with the nearest usable ones.
    pub fn normalized(self) -> Self {
        let default_size = if self.default_size.is_valid() {
            self.default_size
        } else {
            TermSize::default()
        };
        Self {
            default_size,
            read_buffer_size: self.read_buffer_size.max(MIN_READ_BUFFER_SIZE),
            exit_poll_interval_ms: self.exit_poll_interval_ms.max(1),
            exit_drain_timeout_ms: self.exit_drain_timeout_ms,
            close_timeout_ms: self.close_timeout_ms,
        }
    }

    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms)
    }

    pub fn exit_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_drain_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// What to spawn for a new session.
///
/// Deserializable so an embedding layer can pass the options object through
/// as-is; the event sink travels separately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub command: String,
    pub args: Vec<String>,
    /// `None` inherits the caller's working directory.
    pub cwd: Option<PathBuf>,
    /// `None` inherits the caller's environment. When set, this is the
    /// child's complete environment, passed on in key order.
    pub env: Option<BTreeMap<String, String>>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl SessionOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Options for the user's default shell.
    pub fn shell() -> Self {
        Self::new(tether_pty::default_shell())
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = Some(cols);
        self.rows = Some(rows);
        self
    }

    /// Check the options and resolve them into a command and console size.
    pub(crate) fn resolve(&self, fallback: TermSize) -> Result<(CommandSpec, TermSize)> {
        if self.command.trim().is_empty() {
            return Err(BridgeError::InvalidOptions("command is required".into()));
        }

        let size = TermSize::new(
            self.cols.unwrap_or(fallback.cols),
            self.rows.unwrap_or(fallback.rows),
        );
        if !size.is_valid() {
            return Err(BridgeError::InvalidOptions(format!(
                "console size must be positive, got {}x{}",
                size.cols, size.rows
            )));
        }

        let spec = CommandSpec {
            program: self.command.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        };
        Ok((spec, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.default_size, TermSize::new(80, 25));
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.exit_poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn config_from_partial_json() {
        let config = BridgeConfig::from_json(r#"{ "close_timeout_ms": 1000 }"#).unwrap();
        assert_eq!(config.close_timeout_ms, 1000);
        assert_eq!(config.read_buffer_size, 4096);
    }

    #[test]
    fn config_normalizes_zero_values() {
        let config = BridgeConfig::from_json(
            r#"{ "read_buffer_size": 0, "exit_poll_interval_ms": 0,
                 "default_size": { "cols": 0, "rows": 10 } }"#,
        )
        .unwrap();
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);
        assert_eq!(config.exit_poll_interval_ms, 1);
        assert_eq!(config.default_size, TermSize::default());
    }

    #[test]
    fn config_rejects_malformed_json() {
        assert!(BridgeConfig::from_json("{ not json").is_err());
    }

    #[test]
    fn options_from_json() {
        let options: SessionOptions = serde_json::from_str(
            r#"{ "command": "cmd.exe", "args": ["/c", "dir"],
                 "env": { "B": "2", "A": "1" }, "cols": 120 }"#,
        )
        .unwrap();
        assert_eq!(options.command, "cmd.exe");
        assert_eq!(options.args, vec!["/c", "dir"]);
        assert_eq!(options.cols, Some(120));
        assert_eq!(options.rows, None);
        assert_eq!(options.cwd, None);

        let keys: Vec<&str> = options.env.as_ref().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["A", "B"]);
    }

    #[test]
    fn resolve_fills_default_size() {
        let (spec, size) = SessionOptions::new("sh")
            .arg("-l")
            .resolve(TermSize::default())
            .unwrap();
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-l"]);
        assert_eq!(spec.env, None);
        assert_eq!(size, TermSize::new(80, 25));
    }

    #[test]
    fn resolve_keeps_partial_size() {
        let mut options = SessionOptions::new("sh");
        options.rows = Some(50);
        let (_, size) = options.resolve(TermSize::new(100, 30)).unwrap();
        assert_eq!(size, TermSize::new(100, 50));
    }

    #[test]
    fn resolve_rejects_empty_command() {
        let err = SessionOptions::new("   ").resolve(TermSize::default()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidOptions(_)));
        let err = SessionOptions::default().resolve(TermSize::default()).unwrap_err();
        assert!(err.is_creation());
    }

    #[test]
    fn resolve_rejects_zero_size() {
        let err = SessionOptions::new("sh")
            .size(0, 25)
            .resolve(TermSize::default())
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidOptions(_)));
    }

    #[test]
    fn env_builder_sorts_keys() {
        let (spec, _) = SessionOptions::new("sh")
            .env("B", "2")
            .env("A", "1")
            .resolve(TermSize::default())
            .unwrap();
        assert_eq!(
            spec.env_block(),
            Some(vec!["A=1".to_string(), "B=2".to_string()])
        );
    }
}
