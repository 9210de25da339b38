//! Backpressure policies: what happens when a producer adds to a full queue.
//!
//! The queue engine owns the lock and the not-empty signal. A policy only
//! gets called at fixed points of that skeleton:
//!
//! ```text
//! add:     lock ─> before_add ─> insert ─> unlock ─> notify consumers
//! remove:  lock ─> take items ─> unlock ─> after_remove_all / after_remove_one
//! ```
//!
//! | Policy | When full | `add` returns |
//! |--------|-----------|---------------|
//! | [`Unbounded`] | never full | `()` |
//! | [`Blocking`] | producer waits for a consumer | `()` |
//! | [`Dropping`] | backlog is discarded, new items kept | dropped count |
//!
//! Policies are type parameters of [`Queue`](crate::Queue), so the hooks
//! compile down to nothing for [`Unbounded`].

use parking_lot::{Condvar, MutexGuard};
use tracing::{debug, trace};

use crate::store::Store;

/// Hooks the queue engine calls around every add and remove.
///
/// All hooks run on the thread performing the operation. [`before_add`] and
/// [`try_before_add`] run with the queue's lock held. The `after_remove_*`
/// hooks run after it has been released.
///
/// Hooks must not call back into the queue they belong to.
///
/// [`before_add`]: Backpressure::before_add
/// [`try_before_add`]: Backpressure::try_before_add
pub trait Backpressure {
    /// Value returned to the producer from an add.
    type Output;

    /// Called before new items are inserted.
    ///
    /// May block by waiting on a condition variable with `store`, which
    /// releases the lock while waiting and re-acquires it before returning.
    fn before_add<C: Store>(&self, store: &mut MutexGuard<'_, C>) -> Self::Output;

    /// Non-blocking counterpart of [`before_add`](Backpressure::before_add).
    ///
    /// Returns `None` if the add cannot proceed without waiting.
    fn try_before_add<C: Store>(&self, store: &mut C) -> Option<Self::Output>;

    /// Called after the whole store was drained or cleared.
    #[inline]
    fn after_remove_all(&self, previous_len: usize) {
        let _ = previous_len;
    }

    /// Called after a single element was removed.
    #[inline]
    fn after_remove_one(&self, previous_len: usize) {
        let _ = previous_len;
    }
}

// ============================================================================
// Unbounded
// ============================================================================

/// No limit. Adds never wait and never drop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Unbounded;

impl Backpressure for Unbounded {
    type Output = ();

    #[inline]
    fn before_add<C: Store>(&self, _store: &mut MutexGuard<'_, C>) {}

    #[inline]
    fn try_before_add<C: Store>(&self, _store: &mut C) -> Option<()> {
        Some(())
    }
}

// ============================================================================
// Blocking
// ============================================================================

/// Producers wait while the queue holds `capacity` or more elements.
///
/// The check happens before insertion, so a single
/// [`append`](crate::Queue::append) may push the size past `capacity`. It is
/// the *next* add that waits.
#[derive(Debug)]
pub struct Blocking {
    capacity: usize,
    not_full: Condvar,
}

impl Blocking {
    /// Creates a blocking policy.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "blocking queue capacity must be non-zero");
        Self {
            capacity,
            not_full: Condvar::new(),
        }
    }

    /// Size at which producers start waiting.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Backpressure for Blocking {
    type Output = ();

    fn before_add<C: Store>(&self, store: &mut MutexGuard<'_, C>) {
        if store.len() < self.capacity {
            return;
        }
        trace!(capacity = self.capacity, "producer waiting for space");
        self.not_full
            .wait_while(store, |store| store.len() >= self.capacity);
    }

    #[inline]
    fn try_before_add<C: Store>(&self, store: &mut C) -> Option<()> {
        (store.len() < self.capacity).then_some(())
    }

    // Every waiting producer saw `len >= capacity` when it last checked, so
    // the first removal from at or above capacity must wake all of them. A
    // later removal may start below capacity and notify nobody.

    #[inline]
    fn after_remove_all(&self, previous_len: usize) {
        if previous_len >= self.capacity {
            self.not_full.notify_all();
        }
    }

    #[inline]
    fn after_remove_one(&self, previous_len: usize) {
        if previous_len >= self.capacity {
            self.not_full.notify_all();
        }
    }
}

// ============================================================================
// Dropping
// ============================================================================

/// When an add finds `capacity` or more elements queued, the queued elements
/// are discarded first. The new elements are always kept.
///
/// Adds return the number of elements discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dropping {
    capacity: usize,
}

impl Dropping {
    /// Creates a dropping policy.
    ///
    /// A capacity of 0 clears the queue on every add.
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Size at which the backlog is discarded.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn discard<C: Store>(&self, store: &mut C) -> usize {
        let len = store.len();
        if len < self.capacity {
            return 0;
        }
        store.clear();
        debug!(dropped = len, capacity = self.capacity, "discarded queue backlog");
        len
    }
}

impl Backpressure for Dropping {
    type Output = usize;

    #[inline]
    fn before_add<C: Store>(&self, store: &mut MutexGuard<'_, C>) -> usize {
        self.discard(&mut **store)
    }

    #[inline]
    fn try_before_add<C: Store>(&self, store: &mut C) -> Option<usize> {
        Some(self.discard(store))
    }
}
