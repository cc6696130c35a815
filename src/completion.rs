//! Work completions: user-facing handles returned from `isend`/`irecv`.
//!
//! A [`WorkCompletion`] is an immutable handle carrying a request id; it
//! defers entirely to the [`WorkRequestRegistry`] for state. A
//! [`ChainCompletion`] aggregates several (e.g. all the concurrent sends in
//! a broadcast step) the way the source's `ChainWorkCompletion` does
//! (`include/core/work_request.h`).

use crate::request::{Status, WorkRequestRegistry};
use std::sync::Arc;

#[derive(Clone)]
pub struct WorkCompletion {
    id: u64,
    registry: Arc<WorkRequestRegistry>,
}

impl WorkCompletion {
    pub(crate) fn new(id: u64, registry: Arc<WorkRequestRegistry>) -> Self {
        WorkCompletion { id, registry }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks until the underlying request reaches a terminal status.
    pub fn wait(&self) -> Status {
        self.registry.wait(self.id);
        self.registry.status(self.id)
    }

    pub fn status(&self) -> Status {
        self.registry.status(self.id)
    }
}

impl Drop for WorkCompletion {
    fn drop(&mut self) {
        // Reap only once the request is terminal; a completion dropped while
        // still pending simply leaks its registry entry until it finishes,
        // which is the same trade-off the source makes with its object pool.
        if self.registry.status(self.id).is_terminal() {
            self.registry.reap(self.id);
        }
    }
}

/// Aggregates several [`WorkCompletion`]s issued concurrently (e.g. every
/// send posted by one rank in a single broadcast/reduce step).
#[derive(Default)]
pub struct ChainCompletion {
    children: Vec<WorkCompletion>,
}

impl ChainCompletion {
    pub fn new() -> Self {
        ChainCompletion::default()
    }

    pub fn push(&mut self, completion: WorkCompletion) {
        self.children.push(completion);
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Blocks until every child completes, then returns the aggregate
    /// status: the first non-`Finished` child status, else `Finished`.
    pub fn wait(&self) -> Status {
        for child in &self.children {
            child.wait();
        }
        self.status()
    }

    pub fn status(&self) -> Status {
        for child in &self.children {
            let s = child.status();
            if s != Status::Finished {
                return s;
            }
        }
        Status::Finished
    }
}
