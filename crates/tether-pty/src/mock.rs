//! In-memory transport for exercising the session bridge without an OS PTY.
//!
//! Every console, pipe end and process the mock hands out is counted while it
//! is alive, so tests can assert that no failure or teardown path leaks
//! anything. Tests drive the "child" through [`MockTerminal`]: emit output,
//! fail the output stream, break the input pipe, or exit with a code.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::transport::{ChildProcess, CommandSpec, PseudoConsole, TermSize, Transport, TransportError};

/// Exit code reported by a mock child that was killed.
pub const KILLED_EXIT_CODE: i32 = 1;

const FIRST_PID: u32 = 4000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Counters {
    consoles: Arc<AtomicUsize>,
    pipe_ends: Arc<AtomicUsize>,
    processes: Arc<AtomicUsize>,
}

/// Counts one live allocation until dropped.
struct Tracked(Arc<AtomicUsize>);

impl Tracked {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

type OutputSender = mpsc::Sender<io::Result<Vec<u8>>>;

/// The test-side view of one mock console and its child.
pub struct MockTerminal {
    pid: u32,
    size: Mutex<TermSize>,
    command: Mutex<Option<CommandSpec>>,
    input: Mutex<Vec<u8>>,
    input_broken: AtomicBool,
    output: Mutex<Option<OutputSender>>,
    exit_code: Mutex<Option<i32>>,
    killed: AtomicBool,
}

impl MockTerminal {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The child writes `bytes` to its terminal. Returns `false` once the
    /// output stream is closed.
    pub fn emit(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        match lock(&self.output).as_ref() {
            Some(tx) => tx.send(Ok(bytes.to_vec())).is_ok(),
            None => false,
        }
    }

    /// The output pipe fails with `err`, then closes.
    pub fn fail_output(&self, err: io::Error) {
        if let Some(tx) = lock(&self.output).take() {
            let _ = tx.send(Err(err));
        }
    }

    /// The child exits: its output stream ends after whatever was already
    /// emitted, then the exit status becomes visible.
    pub fn exit(&self, code: i32) {
        lock(&self.output).take();
        let mut exit_code = lock(&self.exit_code);
        if exit_code.is_none() {
            *exit_code = Some(code);
        }
    }

    /// Subsequent writes to the child's input fail with `BrokenPipe`.
    pub fn break_input(&self) {
        self.input_broken.store(true, Ordering::SeqCst);
    }

    /// Everything written to the child's input so far.
    pub fn input(&self) -> Vec<u8> {
        lock(&self.input).clone()
    }

    pub fn size(&self) -> TermSize {
        *lock(&self.size)
    }

    /// The command the child was spawned with.
    pub fn command(&self) -> Option<CommandSpec> {
        lock(&self.command).clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MockState {
    counters: Counters,
    terminals: Mutex<Vec<Arc<MockTerminal>>>,
    missing: Mutex<HashSet<String>>,
    fail_open: AtomicBool,
    fail_endpoints: AtomicBool,
    next_pid: AtomicU32,
}

/// A [`Transport`] that keeps everything in memory. Cloning shares state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawning `program` fails as if it could not be resolved.
    pub fn mark_missing(&self, program: impl Into<String>) {
        lock(&self.state.missing).insert(program.into());
    }

    /// Make every subsequent `open` fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Consoles opened from now on refuse to hand out their writer.
    pub fn set_fail_endpoints(&self, fail: bool) {
        self.state.fail_endpoints.store(fail, Ordering::SeqCst);
    }

    /// The terminal whose child has the given pid.
    pub fn terminal(&self, pid: u32) -> Option<Arc<MockTerminal>> {
        lock(&self.state.terminals)
            .iter()
            .find(|t| t.pid == pid)
            .cloned()
    }

    /// The most recently opened terminal.
    pub fn last_terminal(&self) -> Option<Arc<MockTerminal>> {
        lock(&self.state.terminals).last().cloned()
    }

    /// Number of consoles opened so far.
    pub fn opened(&self) -> usize {
        lock(&self.state.terminals).len()
    }

    pub fn live_consoles(&self) -> usize {
        self.state.counters.consoles.load(Ordering::SeqCst)
    }

    pub fn live_pipe_ends(&self) -> usize {
        self.state.counters.pipe_ends.load(Ordering::SeqCst)
    }

    pub fn live_processes(&self) -> usize {
        self.state.counters.processes.load(Ordering::SeqCst)
    }

    /// True when no console, pipe end or process is alive.
    pub fn is_quiescent(&self) -> bool {
        self.live_consoles() == 0 && self.live_pipe_ends() == 0 && self.live_processes() == 0
    }
}

impl Transport for MockTransport {
    fn open(&self, size: TermSize) -> Result<Box<dyn PseudoConsole>, TransportError> {
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::OpenFailed("mock console refused".into()));
        }

        let counters = &self.state.counters;
        let (tx, rx) = mpsc::channel();
        let terminal = Arc::new(MockTerminal {
            pid: FIRST_PID + self.state.next_pid.fetch_add(1, Ordering::SeqCst),
            size: Mutex::new(size),
            command: Mutex::new(None),
            input: Mutex::new(Vec::new()),
            input_broken: AtomicBool::new(false),
            output: Mutex::new(Some(tx)),
            exit_code: Mutex::new(None),
            killed: AtomicBool::new(false),
        });
        lock(&self.state.terminals).push(Arc::clone(&terminal));

        Ok(Box::new(MockConsole {
            reader: Some(MockReader {
                rx,
                pending: Vec::new(),
                _end: Tracked::new(&counters.pipe_ends),
            }),
            writer: Some(MockWriter {
                terminal: Arc::clone(&terminal),
                _end: Tracked::new(&counters.pipe_ends),
            }),
            child_ends: Some([
                Tracked::new(&counters.pipe_ends),
                Tracked::new(&counters.pipe_ends),
            ]),
            processes: Arc::clone(&counters.processes),
            missing: lock(&self.state.missing).clone(),
            fail_endpoints: self.state.fail_endpoints.load(Ordering::SeqCst),
            terminal,
            _console: Tracked::new(&counters.consoles),
        }))
    }
}

struct MockConsole {
    terminal: Arc<MockTerminal>,
    reader: Option<MockReader>,
    writer: Option<MockWriter>,
    /// Transport-side pipe ends, closed once a child inherits them.
    child_ends: Option<[Tracked; 2]>,
    processes: Arc<AtomicUsize>,
    missing: HashSet<String>,
    fail_endpoints: bool,
    _console: Tracked,
}

impl PseudoConsole for MockConsole {
    fn spawn(&mut self, command: &CommandSpec) -> Result<Box<dyn ChildProcess>, TransportError> {
        if self.child_ends.is_none() {
            return Err(TransportError::SpawnFailed("console already has a child".into()));
        }
        if self.missing.contains(&command.program) {
            return Err(TransportError::SpawnFailed(format!(
                "{}: command not found",
                command.program
            )));
        }

        *lock(&self.terminal.command) = Some(command.clone());
        self.child_ends = None;

        Ok(Box::new(MockChild {
            terminal: Arc::clone(&self.terminal),
            _process: Tracked::new(&self.processes),
        }))
    }

    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, TransportError> {
        match self.reader.take() {
            Some(reader) => Ok(Box::new(reader)),
            None => Err(TransportError::EndpointTaken("reader")),
        }
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, TransportError> {
        if self.fail_endpoints {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::Other,
                "mock writer refused",
            )));
        }
        match self.writer.take() {
            Some(writer) => Ok(Box::new(writer)),
            None => Err(TransportError::EndpointTaken("writer")),
        }
    }

    fn resize(&mut self, size: TermSize) -> Result<(), TransportError> {
        if !size.is_valid() {
            return Err(TransportError::ResizeFailed(format!(
                "{}x{} is not a valid size",
                size.cols, size.rows
            )));
        }
        *lock(&self.terminal.size) = size;
        Ok(())
    }

    fn size(&self) -> Result<TermSize, TransportError> {
        Ok(self.terminal.size())
    }
}

impl Drop for MockConsole {
    fn drop(&mut self) {
        // Closing the console ends the output stream.
        lock(&self.terminal.output).take();
    }
}

struct MockReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    _end: Tracked,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => self.pending = chunk,
                Ok(Err(err)) => return Err(err),
                Err(mpsc::RecvError) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct MockWriter {
    terminal: Arc<MockTerminal>,
    _end: Tracked,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.terminal.input_broken.load(Ordering::SeqCst) || self.terminal.exit_code().is_some() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        lock(&self.terminal.input).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MockChild {
    terminal: Arc<MockTerminal>,
    _process: Tracked,
}

impl ChildProcess for MockChild {
    fn pid(&self) -> Option<u32> {
        Some(self.terminal.pid)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.terminal.killed.store(true, Ordering::SeqCst);
        self.terminal.exit(KILLED_EXIT_CODE);
        Ok(())
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.terminal.exit_code())
    }
}
