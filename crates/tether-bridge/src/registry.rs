use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::record::{lock, SessionRecord};

/// Opaque, strictly positive identifier of one session.
pub type Handle = u32;

/// The single authority on which handles are live.
///
/// Every lookup-then-act sequence runs under one lock, so operations on the
/// same handle are linearized. A record leaves the map only through
/// [`remove`](SessionRegistry::remove), which hands it to exactly one caller.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Handle, SessionRecord>>,
    next_handle: AtomicU32,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        lock(&self.sessions).contains_key(&handle)
    }

    /// All live handles, sorted.
    pub fn handles(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = lock(&self.sessions).keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Pick a handle that is neither zero nor held by a live session.
    pub(crate) fn allocate(&self) -> Handle {
        let sessions = lock(&self.sessions);
        loop {
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if handle != 0 && !sessions.contains_key(&handle) {
                return handle;
            }
        }
    }

    /// Store a freshly created record.
    ///
    /// # Panics
    ///
    /// If `handle` is already present. Handles come from [`allocate`], so
    /// this means the registry's bookkeeping is broken.
    ///
    /// [`allocate`]: SessionRegistry::allocate
    pub(crate) fn insert(&self, handle: Handle, record: SessionRecord) {
        match lock(&self.sessions).entry(handle) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(_) => {
                log::error!("session handle {handle} inserted twice");
                panic!("duplicate session handle {handle}");
            }
        }
    }

    /// Run `f` on the record under the lock. `None` if the handle is unknown.
    pub(crate) fn with_record<R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&SessionRecord) -> R,
    ) -> Option<R> {
        lock(&self.sessions).get(&handle).map(f)
    }

    /// Take the record out. Among racing callers exactly one gets it, and
    /// it is already marked closing when the lock is released.
    pub(crate) fn remove(&self, handle: Handle) -> Option<SessionRecord> {
        let mut sessions = lock(&self.sessions);
        let record = sessions.remove(&handle)?;
        record.mark_closing();
        Some(record)
    }

    /// Take every record out, for shutdown.
    pub(crate) fn drain(&self) -> Vec<(Handle, SessionRecord)> {
        let mut sessions = lock(&self.sessions);
        sessions
            .drain()
            .inspect(|(_, record)| record.mark_closing())
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
