//! Hand-off of sink invocations into the consumer's own execution context.
//!
//! A [`CallbackHost`] owns a FIFO of pending invocations. Each registered
//! callback yields a [`Callback`] token that any thread may use to enqueue an
//! invocation; the invocation itself only ever runs inside the consumer's
//! [`CallbackLoop`], never on the thread that called [`Callback::call`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send>;

/// Registers callbacks that run on the consumer's execution context.
#[derive(Clone)]
pub struct CallbackHost {
    tx: mpsc::UnboundedSender<Job>,
    registrations: Arc<AtomicUsize>,
}

/// The consumer side: runs queued invocations in order.
///
/// Ends once the host and every callback registered with it are dropped.
pub struct CallbackLoop {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl CallbackHost {
    pub fn new() -> (Self, CallbackLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Self {
            tx,
            registrations: Arc::new(AtomicUsize::new(0)),
        };
        (host, CallbackLoop { rx })
    }

    /// Start a dedicated consumer thread running the loop.
    pub fn spawn_thread(name: &str) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (host, callback_loop) = Self::new();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || callback_loop.run_blocking())?;
        Ok((host, join))
    }

    /// Register `f`; the returned token enqueues invocations of it.
    pub fn register<T, F>(&self, f: F) -> Callback<T>
    where
        T: Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        let func: Arc<dyn Fn(T) + Send + Sync> = Arc::new(f);
        Callback {
            func,
            tx: self.tx.clone(),
            registrations: Arc::clone(&self.registrations),
        }
    }

    /// Number of callback tokens that have not been released yet.
    pub fn active_registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

impl CallbackLoop {
    /// Run invocations on the current tokio task until the queue closes.
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            invoke(job);
        }
    }

    /// Run invocations on the current thread until the queue closes.
    ///
    /// Must not be called from inside an async runtime.
    pub fn run_blocking(mut self) {
        while let Some(job) = self.rx.blocking_recv() {
            invoke(job);
        }
    }
}

fn invoke(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        log::error!("sink callback panicked; continuing with the next event");
    }
}

/// A registration token for one callback.
///
/// Dropping it (or calling [`release`](Callback::release)) drops the
/// registration. Invocations already queued still run.
pub struct Callback<T> {
    func: Arc<dyn Fn(T) + Send + Sync>,
    tx: mpsc::UnboundedSender<Job>,
    registrations: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Callback<T> {
    /// Queue an invocation with `value` and return without waiting for it.
    ///
    /// Returns `false` if the consumer loop is gone.
    pub fn call(&self, value: T) -> bool {
        let func = Arc::clone(&self.func);
        self.tx.send(Box::new(move || func(value))).is_ok()
    }

    pub fn release(self) {}
}

impl<T> Drop for Callback<T> {
    fn drop(&mut self) {
        self.registrations.fetch_sub(1, Ordering::SeqCst);
    }
}
