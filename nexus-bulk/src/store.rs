//! Backing storage for a [`Queue`](crate::Queue).
//!
//! The queue never looks inside its store beyond the handful of operations in
//! [`Store`]: append one element, append a batch, size, clear and reserve.
//! Draining is done by swapping whole stores, so any `Default` container
//! works. Single-element pops additionally need [`FrontPop`].
//!
//! `Vec<T>` is the default and the fastest choice: a drain hands the consumer
//! the entire buffer, and the consumer can hand it back for reuse. Use
//! `VecDeque<T>` when consumers want one element at a time via `pop_one`.

use std::collections::VecDeque;
use std::mem;

/// A growable sequence the queue can append to and drain by swapping.
///
/// Implementations are only ever touched while the queue's lock is held, and
/// must not call back into the queue that owns them.
pub trait Store: Default {
    /// Element type.
    type Item;

    /// Whether this store supports cheap removal from the front.
    ///
    /// A wake-up hint only. When `true`, a batch landing in an empty store
    /// wakes every consumer at once instead of one. Single-element consumers
    /// pass the wakeup on to each other while items remain, so a
    /// [`FrontPop`] store that leaves this `false` is still correct, just
    /// slower to fan a batch out.
    const FRONT_POP: bool = false;

    /// Number of elements.
    fn len(&self) -> usize;

    /// Returns `true` if there are no elements.
    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a single element at the back.
    fn push_back(&mut self, item: Self::Item);

    /// Appends every element of `items` at the back.
    ///
    /// If the iterator panics part way through, the store must be left as it
    /// was before the call. Consumers rely on a batch being all-or-nothing.
    fn extend_back<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = Self::Item>;

    /// Drops all elements, keeping the allocation where possible.
    fn clear(&mut self);

    /// Ensures room for at least `capacity` elements in total.
    fn reserve(&mut self, capacity: usize);
}

/// A [`Store`] that can remove its oldest element.
pub trait FrontPop: Store {
    /// Removes and returns the oldest element.
    fn pop_front(&mut self) -> Option<Self::Item>;
}

// ============================================================================
// Vec
// ============================================================================

impl<T> Store for Vec<T> {
    type Item = T;

    #[inline]
    fn len(&self) -> usize {
        Vec::len(self)
    }

    #[inline]
    fn push_back(&mut self, item: T) {
        self.push(item);
    }

    fn extend_back<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let rollback = Rollback::new(self, Vec::truncate);
        rollback.store.extend(items);
        rollback.disarm();
    }

    #[inline]
    fn clear(&mut self) {
        Vec::clear(self);
    }

    #[inline]
    fn reserve(&mut self, capacity: usize) {
        Vec::reserve(self, capacity.saturating_sub(Vec::len(self)));
    }
}

// ============================================================================
// VecDeque
// ============================================================================

impl<T> Store for VecDeque<T> {
    type Item = T;

    const FRONT_POP: bool = true;

    #[inline]
    fn len(&self) -> usize {
        VecDeque::len(self)
    }

    #[inline]
    fn push_back(&mut self, item: T) {
        VecDeque::push_back(self, item);
    }

    fn extend_back<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let rollback = Rollback::new(self, VecDeque::truncate);
        rollback.store.extend(items);
        rollback.disarm();
    }

    #[inline]
    fn clear(&mut self) {
        VecDeque::clear(self);
    }

    #[inline]
    fn reserve(&mut self, capacity: usize) {
        VecDeque::reserve(self, capacity.saturating_sub(VecDeque::len(self)));
    }
}

impl<T> FrontPop for VecDeque<T> {
    #[inline]
    fn pop_front(&mut self) -> Option<T> {
        VecDeque::pop_front(self)
    }
}

/// Truncates the store back to its starting length unless disarmed.
///
/// Armed across a bulk insert so an unwinding iterator leaves no partial
/// batch behind.
struct Rollback<'a, S> {
    store: &'a mut S,
    len: usize,
    truncate: fn(&mut S, usize),
}

impl<'a, S: Store> Rollback<'a, S> {
    fn new(store: &'a mut S, truncate: fn(&mut S, usize)) -> Self {
        let len = store.len();
        Self {
            store,
            len,
            truncate,
        }
    }

    fn disarm(self) {
        mem::forget(self);
    }
}

impl<S> Drop for Rollback<'_, S> {
    fn drop(&mut self) {
        (self.truncate)(self.store, self.len);
    }
}
