use std::collections::{BTreeSet, HashMap};

use crate::ConnectionError;

use super::{Promise, WireRecord};

/// Table of in-flight requests plus the pool of released ids.
///
/// Owned by the I/O worker. An id is either pending or free, never both: ids
/// enter the pool only through [`RequestTable::release`], which removes the
/// pending entry in the same step.
#[derive(Debug)]
pub(crate) struct RequestTable {
    next_id: i32,
    free: BTreeSet<i32>,
    pending: HashMap<i32, Promise>,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            free: BTreeSet::new(),
            pending: HashMap::new(),
        }
    }

    /// Registers `promise` under a fresh id, preferring released ids.
    ///
    /// Returns `None` after failing the promise when no id is available.
    pub fn start(&mut self, promise: Promise) -> Option<i32> {
        let id = match self.free.pop_first() {
            Some(id) => id,
            None if self.next_id == i32::MAX => {
                promise.fail(ConnectionError::RequestIdsExhausted);
                return None;
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };

        debug_assert!(!self.pending.contains_key(&id));
        self.pending.insert(id, promise);
        Some(id)
    }

    /// Delivers a reply to request `id`.
    ///
    /// The first error record, in record order, fails the request. Returns
    /// `false` when `id` has no pending entry.
    pub fn complete(&mut self, id: i32, records: Vec<WireRecord>) -> bool {
        let Some(promise) = self.release(id) else {
            return false;
        };

        match records.iter().find_map(|r| r.data.as_error()) {
            Some(error) => promise.fail(ConnectionError::Remote(error.clone())),
            None => promise.complete(Ok(records)),
        }
        true
    }

    /// Fails request `id` with a local error.
    pub fn fail(&mut self, id: i32, error: ConnectionError) -> bool {
        match self.release(id) {
            Some(promise) => {
                promise.fail(error);
                true
            }
            None => false,
        }
    }

    /// Fails every pending request, returning how many there were.
    pub fn fail_all<F>(&mut self, error: F) -> usize
    where
        F: Fn() -> ConnectionError,
    {
        let count = self.pending.len();
        for (_, promise) in self.pending.drain() {
            promise.fail(error());
        }
        count
    }

    fn release(&mut self, id: i32) -> Option<Promise> {
        let promise = self.pending.remove(&id)?;
        self.free.insert(id);
        Some(promise)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Number of distinct ids handed out so far.
    pub fn allocated(&self) -> usize {
        (self.next_id - 1) as usize
    }
}
