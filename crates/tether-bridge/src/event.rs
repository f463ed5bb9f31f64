//! Session events and the three-slot sink that receives them.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::TransportFatal;
use crate::host::{Callback, CallbackHost};

/// One notification for a session, as seen by its consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Output produced by the child, in the order it was read.
    Data { bytes: Vec<u8> },
    /// The child exited. Always the last event of a session.
    Exit { code: i32 },
    /// The transport reported an unrecoverable condition.
    Error { code: i32, message: String },
}

impl From<TransportFatal> for SessionEvent {
    fn from(fatal: TransportFatal) -> Self {
        SessionEvent::Error {
            code: fatal.code,
            message: fatal.message,
        }
    }
}

type DataFn = Box<dyn Fn(Vec<u8>) + Send + Sync>;
type ExitFn = Box<dyn Fn(i32) + Send + Sync>;
type ErrorFn = Box<dyn Fn(TransportFatal) + Send + Sync>;

/// The data, exit and error callbacks a session's creator supplies.
pub struct EventSink {
    on_data: DataFn,
    on_exit: ExitFn,
    on_error: ErrorFn,
}

impl EventSink {
    pub fn new(
        on_data: impl Fn(Vec<u8>) + Send + Sync + 'static,
        on_exit: impl Fn(i32) + Send + Sync + 'static,
        on_error: impl Fn(TransportFatal) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_data: Box::new(on_data),
            on_exit: Box::new(on_exit),
            on_error: Box::new(on_error),
        }
    }

    /// Route all three slots into one function taking a [`SessionEvent`].
    pub fn from_fn(f: impl Fn(SessionEvent) + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        let (data, exit) = (Arc::clone(&f), Arc::clone(&f));
        Self::new(
            move |bytes| data(SessionEvent::Data { bytes }),
            move |code| exit(SessionEvent::Exit { code }),
            move |fatal| f(SessionEvent::from(fatal)),
        )
    }

    /// A sink that forwards every event into a channel, for async consumers.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::from_fn(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    /// Register the three slots with `host`, one token each.
    pub(crate) fn register(self, host: &CallbackHost) -> SinkRegistration {
        let EventSink {
            on_data,
            on_exit,
            on_error,
        } = self;
        SinkRegistration {
            data: host.register(on_data),
            exit: host.register(on_exit),
            error: host.register(on_error),
        }
    }
}

/// The three registered callback tokens of one session.
///
/// Released together; a session never keeps some slots while dropping others.
pub(crate) struct SinkRegistration {
    data: Callback<Vec<u8>>,
    exit: Callback<i32>,
    error: Callback<TransportFatal>,
}

impl SinkRegistration {
    /// Queue an output chunk. `false` if the consumer loop is gone.
    pub(crate) fn data(&self, bytes: Vec<u8>) -> bool {
        let len = bytes.len();
        let queued = self.data.call(bytes);
        if !queued {
            log::debug!("consumer loop gone; dropped {len} bytes");
        }
        queued
    }

    pub(crate) fn error(&self, fatal: TransportFatal) -> bool {
        let queued = self.error.call(fatal.clone());
        if !queued {
            log::debug!("consumer loop gone; dropped {fatal}");
        }
        queued
    }

    /// Deliver the exit code, then release all three registrations.
    pub(crate) fn exit_and_release(self, code: i32) {
        if !self.exit.call(code) {
            log::debug!("consumer loop gone; dropped exit {code}");
        }
        self.release();
    }

    pub(crate) fn release(self) {
        let SinkRegistration { data, exit, error } = self;
        exit.release();
        data.release();
        error.release();
    }
}
