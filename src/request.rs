//! C1: Work-Request Registry.
//!
//! Every in-flight send/recv is a [`WorkRequest`] tracked here under a
//! single mutex, the way the source's `WorkRequestManager` keys everything
//! off a monotonic `req_id` (`include/core/work_request.h`). `wait` blocks on
//! a per-request `Condvar` rather than the source's semaphore; acquire/release
//! is implicit in the mutex so a successful wait happens-before the waiter
//! observes the final buffer contents.

use crate::buffer::Buffer;
use crate::Rank;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Running,
    Finished,
    Canceled,
    Closed,
    Error,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Finished | Status::Canceled | Status::Closed | Status::Error
        )
    }
}

/// Extra data stashed on a request by the creator, retrieved by whoever
/// completes it. Used by the rendezvous handshake to remember which peer
/// rank a send/recv belongs to.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtraData {
    pub peer_rank: Option<Rank>,
}

struct Inner {
    direction: Direction,
    buffer: Buffer,
    total: usize,
    processed: usize,
    status: Status,
    extra: ExtraData,
}

struct Entry {
    state: Mutex<Inner>,
    condvar: Condvar,
}

/// Mutex-protected table of all pending/completed work requests for one
/// process. Any thread may read or write it; see spec.md §5.
pub struct WorkRequestRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl Default for WorkRequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkRequestRegistry {
    pub fn new() -> Self {
        WorkRequestRegistry {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a new id and stores the request. `buffer` must already
    /// satisfy [`Buffer`]'s lifetime contract for the lifetime of the I/O.
    pub fn new_request(&self, direction: Direction, buffer: Buffer, extra: ExtraData) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            state: Mutex::new(Inner {
                direction,
                total: buffer.len(),
                buffer,
                processed: 0,
                status: Status::Pending,
                extra,
            }),
            condvar: Condvar::new(),
        };
        self.entries.lock().unwrap().insert(id, entry);
        id
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    pub fn direction(&self, id: u64) -> Direction {
        self.with_inner(id, |inner| inner.direction)
    }

    pub fn extra(&self, id: u64) -> ExtraData {
        self.with_inner(id, |inner| inner.extra)
    }

    pub fn total(&self, id: u64) -> usize {
        self.with_inner(id, |inner| inner.total)
    }

    pub fn processed(&self, id: u64) -> usize {
        self.with_inner(id, |inner| inner.processed)
    }

    pub fn remaining(&self, id: u64) -> usize {
        self.with_inner(id, |inner| inner.total - inner.processed)
    }

    /// Runs `f` with exclusive access to the request's buffer at its current
    /// offset; used by the channel to do the actual `read`/`write` syscall.
    ///
    /// # Safety
    /// `f` must not retain the slice past its own execution.
    pub unsafe fn with_buffer_slice<R>(&self, id: u64, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let map = self.entries.lock().unwrap();
        let entry = map.get(&id).expect("unknown work request");
        let mut inner = entry.state.lock().unwrap();
        let offset = inner.processed;
        let full = inner.buffer.as_mut_slice();
        f(&mut full[offset..])
    }

    /// Accumulates `n` processed bytes; returns `true` if this completed the
    /// request (sets status to `Finished` and wakes waiters).
    pub fn add_bytes(&self, id: u64, n: usize) -> bool {
        let map = self.entries.lock().unwrap();
        let entry = map.get(&id).expect("unknown work request");
        let mut inner = entry.state.lock().unwrap();
        inner.processed += n;
        debug_assert!(inner.processed <= inner.total, "processed must never exceed total");
        if inner.processed == inner.total && !inner.status.is_terminal() {
            inner.status = Status::Finished;
            drop(inner);
            entry.condvar.notify_all();
            true
        } else {
            false
        }
    }

    pub fn status(&self, id: u64) -> Status {
        self.with_inner(id, |inner| inner.status)
    }

    /// Sets status unconditionally. Terminal statuses should be set via this
    /// followed by [`WorkRequestRegistry::notify`]; once terminal, a request
    /// never changes status again (enforced with a debug assertion since
    /// violating it is an internal bug, not a recoverable error).
    pub fn set_status(&self, id: u64, status: Status) {
        let map = self.entries.lock().unwrap();
        let entry = map.get(&id).expect("unknown work request");
        let mut inner = entry.state.lock().unwrap();
        debug_assert!(
            !inner.status.is_terminal() || inner.status == status,
            "status must not change once terminal"
        );
        inner.status = status;
    }

    pub fn notify(&self, id: u64) {
        let map = self.entries.lock().unwrap();
        let entry = map.get(&id).expect("unknown work request");
        entry.condvar.notify_all();
    }

    /// Blocks until the request's status is terminal.
    pub fn wait(&self, id: u64) {
        let map = self.entries.lock().unwrap();
        let entry = map.get(&id).expect("unknown work request");
        let mut inner = entry.state.lock().unwrap();
        while !inner.status.is_terminal() {
            inner = entry.condvar.wait(inner).unwrap();
        }
    }

    fn with_inner<R>(&self, id: u64, f: impl FnOnce(&Inner) -> R) -> R {
        let map = self.entries.lock().unwrap();
        let entry = map.get(&id).expect("unknown work request");
        let inner = entry.state.lock().unwrap();
        f(&inner)
    }

    /// Drops the entry's bookkeeping. Callers should have already waited and
    /// observed a terminal status.
    pub fn reap(&self, id: u64) {
        self.entries.lock().unwrap().remove(&id);
    }
}
