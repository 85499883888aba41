//! Pooled scratch space for the merge algebra.
//!
//! The `update`/`select`/`del` operations on [`ValGroup`](crate::ValGroup)
//! need a temporary field index or field set. Under high request rates,
//! allocating those per call is measurable churn, so each store owns a
//! [`ScratchPool`] and threads a [`Scratch`] through the hot path. The pool
//! is an explicit object, not hidden global state, so lifetime and test
//! isolation stay obvious.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;

/// Reusable temporaries for one in-flight merge/select/delete call.
///
/// A `Scratch` is always fully owned by the current call stack; it is never
/// aliased across calls. Contents are cleared when returned to the pool.
#[derive(Debug, Default)]
pub struct Scratch {
    /// Field name -> position index, used by `update`.
    pub index: HashMap<Bytes, usize>,
    /// Field name set, used by `select` and `del`.
    pub set: HashSet<Bytes>,
}

impl Scratch {
    fn clear(&mut self) {
        self.index.clear();
        self.set.clear();
    }
}

/// Bounded pool of [`Scratch`] instances.
#[derive(Debug)]
pub struct ScratchPool {
    slots: Mutex<Vec<Scratch>>,
    max_idle: usize,
}

impl ScratchPool {
    /// Creates a pool that retains at most `max_idle` idle instances.
    #[must_use]
    pub fn new(max_idle: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Takes a scratch instance, allocating a fresh one if the pool is empty.
    #[must_use]
    pub fn take(&self) -> Scratch {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slots.pop().unwrap_or_default()
    }

    /// Returns a scratch instance to the pool, clearing it first.
    ///
    /// Instances beyond the `max_idle` bound are dropped instead of pooled.
    pub fn put_back(&self, mut scratch: Scratch) {
        scratch.clear();
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slots.len() < self.max_idle {
            slots.push(scratch);
        }
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_back_clears_contents() {
        let pool = ScratchPool::new(4);

        let mut scratch = pool.take();
        scratch.index.insert(Bytes::from_static(b"f"), 0);
        scratch.set.insert(Bytes::from_static(b"f"));
        pool.put_back(scratch);

        let scratch = pool.take();
        assert!(scratch.index.is_empty());
        assert!(scratch.set.is_empty());
    }

    #[test]
    fn pool_drops_beyond_max_idle() {
        let pool = ScratchPool::new(1);
        pool.put_back(Scratch::default());
        pool.put_back(Scratch::default());

        let slots = pool.slots.lock().unwrap();
        assert_eq!(slots.len(), 1);
    }
}
