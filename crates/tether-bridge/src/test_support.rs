//! Shared fixtures for the crate's unit tests.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tether_pty::mock::MockTransport;
use tether_pty::{CommandSpec, TermSize, Transport};

use crate::event::{EventSink, SessionEvent};
use crate::host::{CallbackHost, CallbackLoop};
use crate::pump::{stop_channels, PumpSignals};
use crate::record::{SessionIo, SessionRecord};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// Keeps the pieces of a hand-built record alive for the test's duration.
pub(crate) struct Fixture {
    _transport: MockTransport,
    _host: CallbackHost,
    _loop: CallbackLoop,
    _signals: PumpSignals,
}

/// A record over a fresh mock session with a sink that ignores everything.
pub(crate) fn fixture_record() -> (SessionRecord, Fixture) {
    let (host, callback_loop) = CallbackHost::new();
    let (record, transport, signals) = build_record(&host, EventSink::from_fn(|_| {}));
    let fixture = Fixture {
        _transport: transport,
        _host: host,
        _loop: callback_loop,
        _signals: signals,
    };
    (record, fixture)
}

fn build_record(
    host: &CallbackHost,
    sink: EventSink,
) -> (SessionRecord, MockTransport, PumpSignals) {
    let transport = MockTransport::new();
    let mut console = transport.open(TermSize::default()).unwrap();
    let process = console.spawn(&CommandSpec::new("sh")).unwrap();
    let writer = console.take_writer().unwrap();
    let io = Arc::new(SessionIo::new(console, writer, process));
    let (stops, signals) = stop_channels();
    let record = SessionRecord::new(io, sink.register(host), stops);
    (record, transport, signals)
}

/// Poll `cond` until it holds or [`WAIT`] elapses.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Collects every event delivered through its sinks, on a dedicated
/// consumer thread.
pub(crate) struct Recorder {
    host: CallbackHost,
    events: Arc<Mutex<Vec<SessionEvent>>>,
    fixtures: Mutex<Vec<(MockTransport, PumpSignals)>>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        let (host, _join) = CallbackHost::spawn_thread("test-consumer").unwrap();
        Self {
            host,
            events: Arc::new(Mutex::new(Vec::new())),
            fixtures: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn host(&self) -> &CallbackHost {
        &self.host
    }

    pub(crate) fn sink(&self) -> EventSink {
        let events = Arc::clone(&self.events);
        EventSink::from_fn(move |event| events.lock().unwrap().push(event))
    }

    /// A record over a fresh mock session whose sink feeds this recorder.
    pub(crate) fn record(&self) -> SessionRecord {
        let (record, transport, signals) = build_record(&self.host, self.sink());
        self.fixtures.lock().unwrap().push((transport, signals));
        record
    }

    pub(crate) fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Block until every invocation queued so far has run.
    pub(crate) fn settle(&self) {
        let (tx, rx) = mpsc::channel();
        let marker = self.host.register(move |()| {
            let _ = tx.send(());
        });
        marker.call(());
        rx.recv_timeout(WAIT).expect("consumer loop stalled");
    }

    /// Wait for an exit event and return everything seen up to then.
    pub(crate) fn wait_for_exit(&self) -> Vec<SessionEvent> {
        let seen = wait_until(|| {
            self.events()
                .iter()
                .any(|e| matches!(e, SessionEvent::Exit { .. }))
        });
        assert!(seen, "no exit event within {WAIT:?}: {:?}", self.events());
        self.events()
    }

    /// Output bytes delivered so far, concatenated.
    pub(crate) fn output(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Data { bytes } => Some(bytes),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub(crate) fn exit_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Exit { .. }))
            .count()
    }
}
