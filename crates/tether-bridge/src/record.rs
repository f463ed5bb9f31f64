use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tether_pty::{ChildProcess, PseudoConsole, TermSize};

use crate::error::{BridgeError, Result};
use crate::event::SinkRegistration;
use crate::pump::PumpStops;
use crate::registry::Handle;

/// Exit code delivered when a closed session's child never reported a status.
pub const EXIT_CODE_UNKNOWN: i32 = -1;

const REAP_POLL: Duration = Duration::from_millis(10);

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The OS resources of one session.
///
/// Shared with the session's exit watcher and with callers that are in the
/// middle of a write or resize, so each resource sits behind its own lock and
/// is taken out exactly once by [`release`](SessionIo::release).
pub(crate) struct SessionIo {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    console: Mutex<Option<Box<dyn PseudoConsole>>>,
    process: Mutex<Box<dyn ChildProcess>>,
    pid: Option<u32>,
}

impl SessionIo {
    pub(crate) fn new(
        console: Box<dyn PseudoConsole>,
        writer: Box<dyn Write + Send>,
        process: Box<dyn ChildProcess>,
    ) -> Self {
        Self {
            pid: process.pid(),
            writer: Mutex::new(Some(writer)),
            console: Mutex::new(Some(console)),
            process: Mutex::new(process),
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write all of `data` to the child's input.
    pub(crate) fn write(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        let mut writer = lock(&self.writer);
        let writer = writer.as_mut().ok_or(BridgeError::InvalidHandle(handle))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(data.len())
    }

    pub(crate) fn resize(&self, handle: Handle, size: TermSize) -> Result<()> {
        let mut console = lock(&self.console);
        let console = console.as_mut().ok_or(BridgeError::InvalidHandle(handle))?;
        console
            .resize(size)
            .map_err(|e| BridgeError::Io(e.into_io()))
    }

    pub(crate) fn size(&self, handle: Handle) -> Result<TermSize> {
        let console = lock(&self.console);
        let console = console.as_ref().ok_or(BridgeError::InvalidHandle(handle))?;
        console.size().map_err(|e| BridgeError::Io(e.into_io()))
    }

    /// Ask the OS for the child's exit status.
    pub(crate) fn try_wait(&self) -> std::io::Result<Option<i32>> {
        lock(&self.process).try_wait()
    }

    pub(crate) fn kill(&self) -> std::io::Result<()> {
        lock(&self.process).kill()
    }

    /// Terminate the child if it is still running and wait up to `timeout`
    /// for its exit status.
    pub(crate) fn terminate(&self, timeout: Duration) -> i32 {
        if let Ok(Some(code)) = self.try_wait() {
            return code;
        }
        if let Err(e) = self.kill() {
            log::debug!("kill failed (child may already be gone): {e}");
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.try_wait() {
                Ok(Some(code)) => return code,
                Ok(None) if Instant::now() < deadline => thread::sleep(REAP_POLL),
                Ok(None) => return EXIT_CODE_UNKNOWN,
                Err(e) => {
                    log::debug!("waiting for killed child failed: {e}");
                    return EXIT_CODE_UNKNOWN;
                }
            }
        }
    }

    /// Close the input pipe and the console. Idempotent.
    pub(crate) fn release(&self) {
        lock(&self.writer).take();
        lock(&self.console).take();
    }
}

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Teardown {
    /// The child exited with this code.
    Exited(i32),
    /// The caller closed the session.
    Closed { timeout: Duration },
    /// `create` failed after the record was stored; no exit is reported.
    Aborted { timeout: Duration },
}

/// Per-handle state held by the registry.
///
/// Lifecycle: the record is built and inserted inside `create` with the
/// liveness flag set (Created/Live), and it leaves the registry exactly once
/// by being removed under the registry lock, which clears the flag
/// (Closing). Only the remover owns it from then on, and
/// [`teardown`](SessionRecord::teardown) consumes it (Closed).
pub(crate) struct SessionRecord {
    io: Arc<SessionIo>,
    sink: SinkRegistration,
    stops: PumpStops,
    alive: AtomicBool,
}

impl SessionRecord {
    pub(crate) fn new(io: Arc<SessionIo>, sink: SinkRegistration, stops: PumpStops) -> Self {
        Self {
            io,
            sink,
            stops,
            alive: AtomicBool::new(true),
        }
    }

    pub(crate) fn io(&self) -> &Arc<SessionIo> {
        &self.io
    }

    pub(crate) fn sink(&self) -> &SinkRegistration {
        &self.sink
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Live to Closing. The registry calls this under its lock as the record
    /// is taken out.
    pub(crate) fn mark_closing(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Release everything the session owns and, unless aborted, deliver its
    /// exit code. Must be called without the registry lock held.
    pub(crate) fn teardown(self, handle: Handle, cause: Teardown) {
        self.mark_closing();
        let SessionRecord {
            io, sink, stops, ..
        } = self;
        drop(stops);

        let code = match cause {
            Teardown::Exited(code) => code,
            Teardown::Closed { timeout } | Teardown::Aborted { timeout } => io.terminate(timeout),
        };
        io.release();

        match cause {
            Teardown::Aborted { .. } => {
                sink.release();
                log::debug!("session {handle} discarded during creation");
            }
            Teardown::Exited(_) => {
                sink.exit_and_release(code);
                log::info!("session {handle} exited with code {code}");
            }
            Teardown::Closed { .. } => {
                sink.exit_and_release(code);
                log::info!("session {handle} closed (exit code {code})");
            }
        }
    }
}
