//! Append isolation.
//!
//! Every appender gets a monotonically increasing id. A snapshot records the
//! highest id handed out so far plus the ids still open at that moment; a
//! sample is visible to the snapshot only if its appender had committed.

use std::collections::BTreeSet;

use parking_lot::Mutex;

#[derive(Debug)]
pub(crate) struct Isolation {
    state: Mutex<OpenAppends>,
}

#[derive(Debug)]
struct OpenAppends {
    next_id: u64,
    open: BTreeSet<u64>,
}

impl Isolation {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(OpenAppends {
                next_id: 1,
                open: BTreeSet::new(),
            }),
        }
    }

    /// Opens a new append and returns its id.
    pub(crate) fn open(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.open.insert(id);
        id
    }

    /// Marks an append as committed.
    pub(crate) fn close(&self, id: u64) {
        self.state.lock().open.remove(&id);
    }

    /// Captures the current visibility boundary.
    pub(crate) fn state(&self) -> IsolationState {
        let state = self.state.lock();
        IsolationState {
            max_id: state.next_id - 1,
            open: state.open.iter().copied().collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }
}

/// The set of appends visible to one snapshot.
#[derive(Debug, Clone)]
pub(crate) struct IsolationState {
    max_id: u64,
    open: Vec<u64>,
}

impl IsolationState {
    pub(crate) fn is_visible(&self, append_id: u64) -> bool {
        append_id <= self.max_id && self.open.binary_search(&append_id).is_err()
    }
}
