//! Public operations over PTY sessions.
//!
//! The manager coordinates the transport, the registry and the dispatcher.
//! Caller-side operations look a session up under the registry lock, clone
//! its shared I/O out and release the lock before touching the OS, so a slow
//! write on one session never stalls the others.

use std::sync::Arc;

use serde::Serialize;
use tether_pty::{NativeTransport, TermSize, Transport};

use crate::config::{BridgeConfig, SessionOptions};
use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, Result};
use crate::event::EventSink;
use crate::host::CallbackHost;
use crate::pump::{start_pumps, stop_channels};
use crate::record::{SessionIo, SessionRecord, Teardown};
use crate::registry::{Handle, SessionRegistry};

/// What `create` hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Spawned {
    pub handle: Handle,
    /// The child's OS process id, when the transport can report it.
    pub pid: Option<u32>,
}

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    host: CallbackHost,
    config: BridgeConfig,
}

impl SessionManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        host: CallbackHost,
    ) -> Self {
        Self::with_config(registry, transport, host, BridgeConfig::default())
    }

    pub fn with_config(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        host: CallbackHost,
        config: BridgeConfig,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(Arc::clone(&registry))),
            registry,
            transport,
            host,
            config: config.normalized(),
        }
    }

    /// A manager over the host's native pseudo-terminals with a fresh registry.
    pub fn native(host: CallbackHost) -> Self {
        Self::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(NativeTransport::new()),
            host,
        )
    }

    /// Spawn `options.command` on a new pseudo-console and start forwarding
    /// its events to `sink`.
    ///
    /// Anything allocated before a failure is released before the error is
    /// returned, including the sink's registrations.
    pub fn create(&self, options: &SessionOptions, sink: EventSink) -> Result<Spawned> {
        let (command, size) = options.resolve(self.config.default_size)?;
        let registration = sink.register(&self.host);

        let mut console = self
            .transport
            .open(size)
            .map_err(|e| BridgeError::Creation(format!("failed to open console: {e}")))?;
        let mut process = console.spawn(&command).map_err(|e| {
            BridgeError::Creation(format!("failed to spawn `{}`: {e}", command.program))
        })?;

        let endpoints = console
            .take_reader()
            .and_then(|reader| Ok((reader, console.take_writer()?)));
        let (reader, writer) = match endpoints {
            Ok(endpoints) => endpoints,
            Err(e) => {
                if let Err(kill_err) = process.kill() {
                    log::debug!("kill after failed create: {kill_err}");
                }
                return Err(BridgeError::Creation(format!(
                    "failed to open console pipes: {e}"
                )));
            }
        };

        let io = Arc::new(SessionIo::new(console, writer, process));
        let pid = io.pid();
        let handle = self.registry.allocate();
        let (stops, signals) = stop_channels();
        self.registry.insert(
            handle,
            SessionRecord::new(Arc::clone(&io), registration, stops),
        );

        if let Err(e) = start_pumps(
            handle,
            signals,
            reader,
            io,
            Arc::clone(&self.dispatcher),
            &self.config,
        ) {
            self.discard(handle);
            return Err(BridgeError::Creation(format!(
                "failed to start session threads: {e}"
            )));
        }

        log::info!(
            "session {handle} created: `{}` pid={pid:?} {}x{}",
            command.program,
            size.cols,
            size.rows
        );
        Ok(Spawned { handle, pid })
    }

    /// Send `data` to the child's input. Returns the number of bytes written.
    pub fn write(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        self.live_io(handle)?.write(handle, data)
    }

    pub fn resize(&self, handle: Handle, cols: u16, rows: u16) -> Result<()> {
        let io = self.live_io(handle)?;
        let size = TermSize::new(cols, rows);
        if !size.is_valid() {
            return Err(BridgeError::InvalidOptions(format!(
                "terminal size must be positive, got {cols}x{rows}"
            )));
        }
        io.resize(handle, size)?;
        log::debug!("session {handle} resized to {cols}x{rows}");
        Ok(())
    }

    /// The console's current size.
    pub fn size(&self, handle: Handle) -> Result<TermSize> {
        self.live_io(handle)?.size(handle)
    }

    /// Tear the session down and deliver its exit event.
    ///
    /// A handle that is already gone, because it exited or was closed
    /// earlier, is not an error.
    pub fn close(&self, handle: Handle) {
        match self.registry.remove(handle) {
            Some(record) => record.teardown(
                handle,
                Teardown::Closed {
                    timeout: self.config.close_timeout(),
                },
            ),
            None => log::debug!("close for unknown session {handle}"),
        }
    }

    /// Terminate the child. Teardown follows through the exit path.
    pub fn kill(&self, handle: Handle) -> Result<()> {
        self.live_io(handle)?.kill()?;
        log::debug!("session {handle} killed");
        Ok(())
    }

    /// Whether the child is still running, asked of the OS directly.
    pub fn is_alive(&self, handle: Handle) -> Result<bool> {
        Ok(self.live_io(handle)?.try_wait()?.is_none())
    }

    /// The child's exit code, if it has exited and the session is still known.
    pub fn exit_code(&self, handle: Handle) -> Option<i32> {
        let io = self.live_io(handle).ok()?;
        match io.try_wait() {
            Ok(code) => code,
            Err(e) => {
                log::debug!("session {handle}: exit status query failed: {e}");
                None
            }
        }
    }

    /// Live handles, sorted.
    pub fn handles(&self) -> Vec<Handle> {
        self.registry.handles()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Close every live session.
    pub fn shutdown(&self) {
        let sessions = self.registry.drain();
        if sessions.is_empty() {
            return;
        }
        log::info!("shutting down {} session(s)", sessions.len());
        for (handle, record) in sessions {
            record.teardown(
                handle,
                Teardown::Closed {
                    timeout: self.config.close_timeout(),
                },
            );
        }
    }

    /// Tear down a session whose `create` did not complete. No exit is
    /// reported for it.
    fn discard(&self, handle: Handle) {
        if let Some(record) = self.registry.remove(handle) {
            record.teardown(
                handle,
                Teardown::Aborted {
                    timeout: self.config.close_timeout(),
                },
            );
        }
    }

    fn live_io(&self, handle: Handle) -> Result<Arc<SessionIo>> {
        self.registry
            .with_record(handle, |record| {
                record.is_alive().then(|| Arc::clone(record.io()))
            })
            .flatten()
            .ok_or(BridgeError::InvalidHandle(handle))
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
