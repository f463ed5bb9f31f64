//! tether-bridge: PTY sessions bridged to an asynchronous consumer.
//!
//! A caller creates sessions through the [`SessionManager`]; each session's
//! output, transport errors and final exit code arrive on the consumer's own
//! execution context through the [`EventSink`] it supplied. Exactly one exit
//! event is delivered per session, whether the child exits by itself, is
//! killed, or the session is closed.
//!
//! # Architecture
//!
//! - [`SessionRegistry`]: handle to session record, behind a single lock.
//! - `Dispatcher`: forwards data, error and exit notifications from the
//!   transport threads, dropping anything for sessions that are gone.
//! - [`CallbackHost`]: moves sink invocations onto the consumer's loop.
//! - [`SessionManager`]: create, write, resize, close, kill and status
//!   queries.
//!
//! ```no_run
//! use tether_bridge::{CallbackHost, EventSink, SessionManager, SessionOptions};
//!
//! let (host, _consumer) = CallbackHost::spawn_thread("pty-events")?;
//! let manager = SessionManager::native(host);
//! let sink = EventSink::new(
//!     |bytes| print!("{}", String::from_utf8_lossy(&bytes)),
//!     |code| println!("exited with {code}"),
//!     |err| eprintln!("transport error: {err}"),
//! );
//! let session = manager.create(&SessionOptions::shell(), sink)?;
//! manager.write(session.handle, b"echo hi\n")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
mod dispatcher;
pub mod error;
pub mod event;
pub mod host;
pub mod manager;
mod pump;
mod record;
pub mod registry;

#[cfg(test)]
mod test_support;

pub use config::{BridgeConfig, SessionOptions};
pub use error::{BridgeError, Result, TransportFatal};
pub use event::{EventSink, SessionEvent};
pub use host::{Callback, CallbackHost, CallbackLoop};
pub use manager::{SessionManager, Spawned};
pub use record::EXIT_CODE_UNKNOWN;
pub use registry::{Handle, SessionRegistry};
pub use tether_pty::{CommandSpec, NativeTransport, TermSize, Transport};
