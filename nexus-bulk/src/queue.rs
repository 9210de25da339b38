//! The queue engine: one lock, one not-empty signal, pluggable backpressure.

use std::fmt;
use std::mem;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::TryAddError;
use crate::policy::{Backpressure, Blocking, Dropping, Unbounded};
use crate::stop::StopToken;
use crate::store::{FrontPop, Store};

/// A multi-producer multi-consumer queue that hands consumers the entire
/// backlog at once.
///
/// `C` is the backing [`Store`] (usually `Vec<T>`), `P` the
/// [`Backpressure`] policy.
///
/// Every operation takes `&self`. Share the queue by reference (scoped
/// threads) or behind an `Arc`; build it fully before sharing it.
///
/// # Guarantees
///
/// - Items from one producer are seen by consumers in the order they were
///   added.
/// - A single add, of one item or of a whole batch, is all-or-nothing: a
///   drain sees every item of it or none of it.
/// - With [`Unbounded`] and [`Blocking`], every added item is returned by
///   exactly one remove, unless the queue is cleared.
/// - No fairness between consumers: one drain may take everything.
///
/// # Preconditions
///
/// The element type's constructors, iterator and `Drop` run with the queue's
/// lock held. They must not call back into the same queue; doing so
/// deadlocks.
///
/// # Example
///
/// ```
/// use nexus_bulk::UnboundedQueue;
/// use std::thread;
///
/// let queue = UnboundedQueue::<u64>::new();
///
/// thread::scope(|s| {
///     s.spawn(|| queue.append(0..100));
///     s.spawn(|| queue.append(100..200));
///
///     let mut seen = 0;
///     let mut batch = Vec::new();
///     while seen < 200 {
///         batch = queue.pop_all(batch);
///         seen += batch.len();
///         batch.clear();
///     }
/// });
/// ```
pub struct Queue<C, P = Unbounded> {
    store: CachePadded<Mutex<C>>,
    not_empty: CachePadded<Condvar>,
    policy: P,
}

impl<C: Store> Queue<C, Unbounded> {
    /// Creates an empty queue limited only by available memory.
    pub fn new() -> Self {
        Self::with_policy(Unbounded)
    }
}

impl<C: Store> Default for Queue<C, Unbounded> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Store> Queue<C, Blocking> {
    /// Creates an empty queue whose producers wait while it holds `capacity`
    /// or more elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    ///
    /// # Example
    ///
    /// ```
    /// use nexus_bulk::BlockingQueue;
    ///
    /// let queue = BlockingQueue::<u32>::new(2);
    /// queue.push(1);
    /// queue.push(2);
    /// // queue.push(3) would now wait for a consumer.
    /// assert!(queue.try_push(3).unwrap_err().is_full());
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(Blocking::new(capacity))
    }

    /// Size at which producers start waiting.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.policy.capacity()
    }
}

impl<C: Store> Queue<C, Dropping> {
    /// Creates an empty queue that discards its backlog when an add finds
    /// `capacity` or more elements queued.
    ///
    /// # Example
    ///
    /// ```
    /// use nexus_bulk::DroppingQueue;
    ///
    /// let queue = DroppingQueue::<u32>::new(3);
    /// assert_eq!(queue.append([1, 2, 3]), 0);
    /// assert_eq!(queue.push(4), 3);
    /// assert_eq!(queue.try_pop_all(Vec::new()), vec![4]);
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(Dropping::new(capacity))
    }

    /// Size at which the backlog is discarded.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.policy.capacity()
    }
}

impl<C: Store, P: Backpressure> Queue<C, P> {
    /// Creates an empty queue with the given policy.
    pub fn with_policy(policy: P) -> Self {
        Self {
            store: CachePadded::new(Mutex::new(C::default())),
            not_empty: CachePadded::new(Condvar::new()),
            policy,
        }
    }

    /// Returns the backpressure policy.
    #[inline]
    pub fn policy(&self) -> &P {
        &self.policy
    }

    // ========================================================================
    // Add
    // ========================================================================

    /// Appends every item of `items` as one indivisible batch.
    ///
    /// Takes the lock once for the whole batch, so prefer this over repeated
    /// [`push`](Self::push) calls. Blocks only if the policy waits for space.
    pub fn append<I>(&self, items: I) -> P::Output
    where
        I: IntoIterator<Item = C::Item>,
    {
        let mut store = self.store.lock();
        let output = self.policy.before_add(&mut store);
        self.insert(store, true, |store| store.extend_back(items));
        output
    }

    /// Adds a single item.
    pub fn push(&self, value: C::Item) -> P::Output {
        let mut store = self.store.lock();
        let output = self.policy.before_add(&mut store);
        self.insert(store, false, |store| store.push_back(value));
        output
    }

    /// Adds a single item built by `make`, which runs with the lock held.
    pub fn push_with<F>(&self, make: F) -> P::Output
    where
        F: FnOnce() -> C::Item,
    {
        let mut store = self.store.lock();
        let output = self.policy.before_add(&mut store);
        self.insert(store, false, |store| store.push_back(make()));
        output
    }

    /// Appends a batch without ever waiting.
    ///
    /// # Errors
    ///
    /// Returns the untouched `items` in [`TryAddError::Contended`] if another
    /// thread holds the lock, or in [`TryAddError::Full`] if the policy has no
    /// room.
    pub fn try_append<I>(&self, items: I) -> Result<P::Output, TryAddError<I>>
    where
        I: IntoIterator<Item = C::Item>,
    {
        self.try_add(items, true, |store, items| store.extend_back(items))
    }

    /// Adds a single item without ever waiting.
    ///
    /// # Errors
    ///
    /// See [`try_append`](Self::try_append).
    ///
    /// # Example
    ///
    /// ```
    /// use nexus_bulk::UnboundedQueue;
    ///
    /// let queue = UnboundedQueue::<&str>::new();
    /// queue.try_push("tick").unwrap();
    /// assert_eq!(queue.len(), 1);
    /// ```
    pub fn try_push(&self, value: C::Item) -> Result<P::Output, TryAddError<C::Item>> {
        self.try_add(value, false, |store, value| store.push_back(value))
    }

    /// Adds a single item built by `make` without ever waiting.
    ///
    /// `make` is only called if the add goes ahead.
    ///
    /// # Errors
    ///
    /// See [`try_append`](Self::try_append).
    pub fn try_push_with<F>(&self, make: F) -> Result<P::Output, TryAddError<F>>
    where
        F: FnOnce() -> C::Item,
    {
        self.try_add(make, false, |store, make| store.push_back(make()))
    }

    fn try_add<V>(
        &self,
        value: V,
        several: bool,
        add: impl FnOnce(&mut C, V),
    ) -> Result<P::Output, TryAddError<V>> {
        let Some(mut store) = self.store.try_lock() else {
            return Err(TryAddError::Contended(value));
        };
        let Some(output) = self.policy.try_before_add(&mut *store) else {
            return Err(TryAddError::Full(value));
        };
        self.insert(store, several, |store| add(store, value));
        Ok(output)
    }

    /// Runs `add` under the lock, then wakes consumers if the store went from
    /// empty to non-empty.
    #[inline]
    fn insert(&self, mut store: MutexGuard<'_, C>, several: bool, add: impl FnOnce(&mut C)) {
        let was_empty = store.is_empty();
        add(&mut *store);
        let became_ready = was_empty && !store.is_empty();
        drop(store);

        // Notifying after unlocking cannot lose a wakeup. A consumer checks
        // for emptiness and starts waiting as one atomic step under the lock,
        // and the insert above also happened under the lock. So either the
        // consumer saw the new items and never waited, or it was already
        // waiting when this notify fires.
        if became_ready {
            // A batch landing in a front-poppable store may feed several
            // single-item consumers at once. A Vec is drained whole by one
            // consumer, so waking more than one is wasted contention. Either
            // way `take_front` passes the wakeup on while items remain.
            if C::FRONT_POP && several {
                self.not_empty.notify_all();
            } else {
                self.not_empty.notify_one();
            }
        }
    }

    // ========================================================================
    // Drain
    // ========================================================================

    /// Waits until the queue is non-empty, then takes everything in it.
    ///
    /// The queue's contents are swapped with `storage` in O(1): pass back a
    /// cleared buffer from a previous call to reuse its allocation. Any
    /// elements left in `storage` are dropped first. Pass `C::default()`
    /// (e.g. `Vec::new()`) if there is nothing to reuse.
    ///
    /// Never returns an empty container.
    ///
    /// # Example
    ///
    /// ```
    /// use nexus_bulk::UnboundedQueue;
    ///
    /// let queue = UnboundedQueue::<u32>::new();
    /// queue.push(0);
    /// queue.push(7);
    ///
    /// let batch = queue.pop_all(Vec::new());
    /// assert_eq!(batch, vec![0, 7]);
    /// ```
    pub fn pop_all(&self, mut storage: C) -> C {
        storage.clear();
        let mut store = self.store.lock();
        self.not_empty.wait_while(&mut store, |store| store.is_empty());
        self.drain(store, storage)
    }

    /// Like [`pop_all`](Self::pop_all), but gives up at `deadline`.
    ///
    /// Returns `storage` (empty) if nothing arrived in time. Never returns
    /// before `deadline` unless data is available.
    pub fn pop_all_until(&self, deadline: Instant, mut storage: C) -> C {
        storage.clear();
        let store = self.wait_until(deadline);
        self.drain(store, storage)
    }

    /// Like [`pop_all`](Self::pop_all), but gives up after `timeout`.
    ///
    /// Returns `storage` (empty) if nothing arrived in time.
    ///
    /// # Example
    ///
    /// ```
    /// use nexus_bulk::UnboundedQueue;
    /// use std::time::Duration;
    ///
    /// let queue = UnboundedQueue::<u32>::new();
    /// let batch = queue.pop_all_for(Duration::from_millis(10), Vec::with_capacity(64));
    /// assert!(batch.is_empty());
    /// assert!(batch.capacity() >= 64);
    /// ```
    pub fn pop_all_for(&self, timeout: Duration, mut storage: C) -> C {
        storage.clear();
        let store = self.wait_for(timeout);
        self.drain(store, storage)
    }

    /// Like [`pop_all`](Self::pop_all), but gives up once `token` is
    /// stopped.
    ///
    /// Returns `storage` (empty) if the stop arrived first. Items that were
    /// already queued when the wait ended are always returned, even if the
    /// stop was requested at the same moment.
    pub fn pop_all_or_stop(&self, token: &StopToken, mut storage: C) -> C
    where
        C: Send,
        P: Sync,
    {
        storage.clear();
        let wake = || self.wake_all_consumers();
        // SAFETY: `registration` is declared after `wake` and dropped before
        // it. It is never leaked.
        let registration = unsafe { token.register(&wake) };
        let store = self.wait_or_stop(token);
        let batch = self.drain(store, storage);
        drop(registration);
        batch
    }

    /// Takes everything currently queued without waiting.
    ///
    /// Returns `storage` (empty) if the queue is empty.
    pub fn try_pop_all(&self, mut storage: C) -> C {
        storage.clear();
        let store = self.store.lock();
        self.drain(store, storage)
    }

    fn drain(&self, mut store: MutexGuard<'_, C>, mut storage: C) -> C {
        let previous_len = store.len();
        if previous_len == 0 {
            return storage;
        }
        mem::swap(&mut *store, &mut storage);
        drop(store);
        self.policy.after_remove_all(previous_len);
        storage
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drops everything currently queued.
    pub fn clear(&self) {
        let mut store = self.store.lock();
        let previous_len = store.len();
        store.clear();
        drop(store);
        self.policy.after_remove_all(previous_len);
    }

    /// Ensures the internal store can hold `capacity` elements without
    /// reallocating.
    ///
    /// Only helps until the next drain, which swaps the store out.
    pub fn reserve(&self, capacity: usize) {
        self.store.lock().reserve(capacity);
    }

    /// Number of queued elements.
    ///
    /// Stale as soon as it is returned if other threads are active.
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    fn wait_until(&self, deadline: Instant) -> MutexGuard<'_, C> {
        let mut store = self.store.lock();
        self.not_empty
            .wait_while_until(&mut store, |store| store.is_empty(), deadline);
        store
    }

    fn wait_for(&self, timeout: Duration) -> MutexGuard<'_, C> {
        let mut store = self.store.lock();
        self.not_empty
            .wait_while_for(&mut store, |store| store.is_empty(), timeout);
        store
    }

    /// Callers must hold a wake registration on `token` for the duration.
    fn wait_or_stop(&self, token: &StopToken) -> MutexGuard<'_, C> {
        let mut store = self.store.lock();
        self.not_empty.wait_while(&mut store, |store| {
            store.is_empty() && !token.stop_requested()
        });
        store
    }

    /// Wake callback for stop tokens.
    ///
    /// Taking the lock orders this notify after any consumer that has checked
    /// the token but not yet started waiting.
    fn wake_all_consumers(&self) {
        drop(self.store.lock());
        self.not_empty.notify_all();
    }
}

// ============================================================================
// Single-element removal
// ============================================================================

impl<C: FrontPop, P: Backpressure> Queue<C, P> {
    /// Waits until the queue is non-empty, then removes the oldest element.
    ///
    /// # Example
    ///
    /// ```
    /// use nexus_bulk::{Queue, Unbounded};
    /// use std::collections::VecDeque;
    ///
    /// let queue: Queue<VecDeque<u32>> = Queue::with_policy(Unbounded);
    /// queue.append([1, 2]);
    /// assert_eq!(queue.pop_one(), 1);
    /// assert_eq!(queue.pop_one(), 2);
    /// ```
    pub fn pop_one(&self) -> C::Item {
        loop {
            let mut store = self.store.lock();
            self.not_empty.wait_while(&mut store, |store| store.is_empty());
            if let Some(value) = self.take_front(store) {
                return value;
            }
        }
    }

    /// Like [`pop_one`](Self::pop_one), but gives up at `deadline`.
    pub fn pop_one_until(&self, deadline: Instant) -> Option<C::Item> {
        let store = self.wait_until(deadline);
        self.take_front(store)
    }

    /// Like [`pop_one`](Self::pop_one), but gives up after `timeout`.
    pub fn pop_one_for(&self, timeout: Duration) -> Option<C::Item> {
        let store = self.wait_for(timeout);
        self.take_front(store)
    }

    /// Like [`pop_one`](Self::pop_one), but gives up once `token` is stopped.
    ///
    /// An element already queued when the wait ends is returned even if the
    /// stop was requested at the same moment.
    pub fn pop_one_or_stop(&self, token: &StopToken) -> Option<C::Item>
    where
        C: Send,
        P: Sync,
    {
        let wake = || self.wake_all_consumers();
        // SAFETY: see `pop_all_or_stop`.
        let registration = unsafe { token.register(&wake) };
        let store = self.wait_or_stop(token);
        let value = self.take_front(store);
        drop(registration);
        value
    }

    /// Removes the oldest element without waiting for one to arrive.
    pub fn try_pop_one(&self) -> Option<C::Item> {
        let store = self.store.lock();
        self.take_front(store)
    }

    fn take_front(&self, mut store: MutexGuard<'_, C>) -> Option<C::Item> {
        let previous_len = store.len();
        let value = store.pop_front()?;
        let more = !store.is_empty();
        drop(store);

        // Adds only wake on the empty to non-empty edge. Pass the wakeup on
        // so items queued behind this one are not left with every consumer
        // asleep.
        if more {
            self.not_empty.notify_one();
        }
        self.policy.after_remove_one(previous_len);
        Some(value)
    }
}

impl<C: Store, P: Backpressure + fmt::Debug> fmt::Debug for Queue<C, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
