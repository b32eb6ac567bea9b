//! Deferred destruction of closed connections.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;

use crate::sys::NativeHandle;

/// Set of native handles scheduled for teardown.
///
/// A connection that closes while a callback still holds a reference to it
/// cannot be destroyed on the spot. Its handle is pushed here instead, and
/// the reactor drains the set at the end of each `poll` cycle: the close
/// callback fires, then the connection is destroyed.
///
/// Handles scheduled while a drain is in progress are not observed by that
/// drain; they become visible on the next one.
#[derive(Default)]
pub(crate) struct Cleaner {
    pending: RefCell<HashSet<NativeHandle>>,
}

impl Cleaner {
    pub(crate) fn new() -> Cleaner {
        Cleaner::default()
    }

    /// Schedules a handle for teardown. De-duplicated on insert.
    pub(crate) fn schedule(&self, handle: NativeHandle) {
        self.pending.borrow_mut().insert(handle);
    }

    /// Withdraws a handle that was finalized out of band, before the drain
    /// it was scheduled for. Happens when the OS recycles a closed handle
    /// for a new connection within the same poll cycle.
    pub(crate) fn unschedule(&self, handle: NativeHandle) {
        self.pending.borrow_mut().remove(&handle);
    }

    /// Takes the current pending set, leaving the cleaner empty.
    ///
    /// The caller iterates the returned set outside of the borrow, so
    /// handlers are free to schedule new handles while it runs.
    pub(crate) fn take(&self) -> HashSet<NativeHandle> {
        self.pending.replace(HashSet::new())
    }

    /// Discards every pending handle.
    pub(crate) fn clear(&self) {
        self.pending.borrow_mut().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending.borrow().len()
    }
}

impl fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleaner")
            .field("pending", &self.pending.borrow().len())
            .finish()
    }
}
