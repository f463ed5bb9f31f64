//! Per-session threads that turn transport activity into dispatcher events.
//!
//! Each session gets two dedicated OS threads because both PTY reads and
//! exit detection block: `pty-read-{handle}` forwards output chunks and read
//! failures, `pty-wait-{handle}` watches the child and reports its exit. The
//! threads hold no registry lock while they block, so other sessions and
//! callers are never stalled by them.

use std::io::{self, Read};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;
use crate::record::SessionIo;
use crate::registry::Handle;

/// `EIO`, which a Unix PTY master returns once the child side is gone.
const EIO: i32 = 5;

/// Code reported with read failures that carry no OS error number.
const UNKNOWN_ERROR_CODE: i32 = -1;

const DRAIN_POLL: Duration = Duration::from_millis(5);

/// The record's side of the stop channels. Dropping it stops both threads.
pub(crate) struct PumpStops {
    _read: mpsc::Sender<()>,
    _wait: mpsc::Sender<()>,
}

/// The threads' side of the stop channels.
pub(crate) struct PumpSignals {
    read: mpsc::Receiver<()>,
    wait: mpsc::Receiver<()>,
}

pub(crate) fn stop_channels() -> (PumpStops, PumpSignals) {
    let (read_tx, read_rx) = mpsc::channel(1);
    let (wait_tx, wait_rx) = mpsc::channel(1);
    (
        PumpStops {
            _read: read_tx,
            _wait: wait_tx,
        },
        PumpSignals {
            read: read_rx,
            wait: wait_rx,
        },
    )
}

/// Start the read and exit-watch threads for a session already in the registry.
pub(crate) fn start_pumps(
    handle: Handle,
    signals: PumpSignals,
    reader: Box<dyn Read + Send>,
    io: Arc<SessionIo>,
    dispatcher: Arc<Dispatcher>,
    config: &BridgeConfig,
) -> io::Result<()> {
    let PumpSignals {
        read: mut read_rx,
        wait: mut wait_rx,
    } = signals;
    // Closes when the read thread ends, letting the exit watcher know that
    // all output has been forwarded.
    let (drained_tx, mut drained_rx) = oneshot::channel::<()>();

    let read_dispatcher = Arc::clone(&dispatcher);
    let buffer_size = config.read_buffer_size;
    thread::Builder::new()
        .name(format!("pty-read-{handle}"))
        .spawn(move || {
            read_loop(handle, reader, buffer_size, &mut read_rx, &read_dispatcher);
            drop(drained_tx);
        })?;

    let poll = config.exit_poll_interval();
    let drain_timeout = config.exit_drain_timeout();
    thread::Builder::new()
        .name(format!("pty-wait-{handle}"))
        .spawn(move || {
            if let Some(code) = wait_loop(handle, &io, poll, &mut wait_rx) {
                wait_drained(&mut drained_rx, drain_timeout);
                dispatcher.on_exit(handle, code);
            }
        })?;

    Ok(())
}

fn read_loop(
    handle: Handle,
    mut reader: Box<dyn Read + Send>,
    buffer_size: usize,
    stop_rx: &mut mpsc::Receiver<()>,
    dispatcher: &Dispatcher,
) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        if stop_requested(stop_rx) {
            return;
        }

        // Blocks until output is available or the console closes.
        let n = match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_end_of_stream(&e) => return,
            Err(e) => {
                if stop_requested(stop_rx) {
                    return;
                }
                log::warn!("session {handle}: PTY read failed: {e}");
                dispatcher.on_error(
                    handle,
                    e.raw_os_error().unwrap_or(UNKNOWN_ERROR_CODE),
                    &e.to_string(),
                );
                return;
            }
        };

        dispatcher.on_data(handle, &buf[..n]);
    }
}

/// Poll the child until it exits. `None` if the session was stopped first.
fn wait_loop(
    handle: Handle,
    io: &SessionIo,
    poll: Duration,
    stop_rx: &mut mpsc::Receiver<()>,
) -> Option<i32> {
    loop {
        thread::sleep(poll);
        if stop_requested(stop_rx) {
            return None;
        }

        match io.try_wait() {
            Ok(None) => {}
            Ok(Some(code)) => return Some(code),
            Err(e) => log::warn!("session {handle}: exit status query failed: {e}"),
        }
    }
}

/// Give the reader up to `timeout` to forward what the child wrote before it
/// exited.
fn wait_drained(drained_rx: &mut oneshot::Receiver<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while matches!(drained_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
        if Instant::now() >= deadline {
            return;
        }
        thread::sleep(DRAIN_POLL);
    }
}

fn is_end_of_stream(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::BrokenPipe || (cfg!(unix) && err.raw_os_error() == Some(EIO))
}

fn stop_requested(stop_rx: &mut mpsc::Receiver<()>) -> bool {
    match stop_rx.try_recv() {
        Ok(()) => true,
        Err(mpsc::error::TryRecvError::Disconnected) => true,
        Err(mpsc::error::TryRecvError::Empty) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_stops_signals_both_threads() {
        let (stops, mut signals) = stop_channels();
        assert!(!stop_requested(&mut signals.read));
        assert!(!stop_requested(&mut signals.wait));

        drop(stops);
        assert!(stop_requested(&mut signals.read));
        assert!(stop_requested(&mut signals.wait));
    }

    #[test]
    fn drain_returns_once_reader_is_done() {
        let (drained_tx, mut drained_rx) = oneshot::channel::<()>();
        let reader = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(drained_tx);
        });

        let started = Instant::now();
        wait_drained(&mut drained_rx, Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(5));
        reader.join().unwrap();
    }

    #[test]
    fn drain_gives_up_at_deadline() {
        let (_drained_tx, mut drained_rx) = oneshot::channel::<()>();
        let started = Instant::now();
        wait_drained(&mut drained_rx, Duration::from_millis(30));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn end_of_stream_errors() {
        assert!(is_end_of_stream(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_end_of_stream(&io::Error::new(io::ErrorKind::Other, "boom")));
        #[cfg(unix)]
        assert!(is_end_of_stream(&io::Error::from_raw_os_error(EIO)));
    }
}
