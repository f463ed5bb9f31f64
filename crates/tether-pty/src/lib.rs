//! tether-pty: the pseudo-console transport boundary for Tether.
//!
//! Everything the session bridge needs from the operating system goes through
//! the capabilities defined here, so the bridge's concurrency logic never
//! depends on how the console and child process are actually produced.
//!
//! # Architecture
//!
//! - [`Transport`]: Opens a pseudo-console (pipe pair + console object).
//! - [`PseudoConsole`]: Spawns the attached child, hands out the host-side
//!   pipe ends, and resizes the console.
//! - [`ChildProcess`]: Pid, forced termination, and exit-status polling.
//! - [`NativeTransport`]: The real implementation on top of `portable-pty`.
//! - `mock::MockTransport` (feature `mock`): An in-memory transport with allocation
//!   counters and scripted output, used by tests.

#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod native;
pub mod transport;

pub use native::{default_shell, NativeTransport};
pub use transport::{ChildProcess, CommandSpec, PseudoConsole, TermSize, Transport, TransportError};
