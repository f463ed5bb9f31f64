//! Forwards transport notifications to the owning session's sink.
//!
//! Notifications arrive on transport threads, possibly several at once for
//! the same handle. Every path looks the handle up under the registry lock
//! and drops the notification if the session is gone or no longer live.
//! Data and error payloads are handed off to the sink while the lock is held;
//! the hand-off only enqueues onto the consumer's loop, so it never blocks on
//! or re-enters consumer code, and it keeps those payloads ahead of the exit
//! event in the consumer's queue. Exit removes the record first, which makes
//! the exit path and `close` race for a single owner of the teardown.

use std::sync::Arc;

use crate::error::TransportFatal;
use crate::record::Teardown;
use crate::registry::{Handle, SessionRegistry};

pub(crate) struct Dispatcher {
    registry: Arc<SessionRegistry>,
}

impl Dispatcher {
    pub(crate) fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Output from the child. `bytes` belongs to the transport and is copied
    /// before this returns.
    pub(crate) fn on_data(&self, handle: Handle, bytes: &[u8]) {
        let delivered = self
            .registry
            .with_record(handle, |record| {
                if record.is_alive() {
                    record.sink().data(bytes.to_vec());
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);

        if !delivered {
            log::debug!("dropped {} bytes for closed session {handle}", bytes.len());
        }
    }

    /// An unrecoverable transport condition.
    pub(crate) fn on_error(&self, handle: Handle, code: i32, message: &str) {
        let delivered = self
            .registry
            .with_record(handle, |record| {
                if record.is_alive() {
                    record.sink().error(TransportFatal {
                        code,
                        message: message.to_string(),
                    });
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);

        if !delivered {
            log::warn!("transport error for closed session {handle}: {message} (code {code})");
        }
    }

    /// The child exited. The first caller for a handle tears the session
    /// down and delivers the code; later callers find nothing.
    pub(crate) fn on_exit(&self, handle: Handle, code: i32) {
        match self.registry.remove(handle) {
            Some(record) => record.teardown(handle, Teardown::Exited(code)),
            None => log::debug!("exit {code} for already closed session {handle}"),
        }
    }
}
