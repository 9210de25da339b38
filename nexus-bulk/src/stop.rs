//! Cooperative cancellation for blocking drains.
//!
//! A [`StopSource`] hands out any number of [`StopToken`]s. Passing a token to
//! [`Queue::pop_all_or_stop`](crate::Queue::pop_all_or_stop) or
//! [`Queue::pop_one_or_stop`](crate::Queue::pop_one_or_stop) makes the wait
//! return early once [`StopSource::request_stop`] is called.
//!
//! # Wakeup protocol
//!
//! A blocked consumer sleeps on its queue's condition variable, which the
//! stop source knows nothing about. While waiting, the consumer registers a
//! wake callback on the token. `request_stop` sets the flag first and then
//! runs every registered callback:
//!
//! ```text
//! Consumer:                          Stopper:
//! ─────────────────────              ─────────────────────
//! register(wake)                     requested = true
//! lock(queue)                        lock(wakers)
//! check requested -> false           for wake in wakers:
//! wait(not_empty)  [unlocks]             lock(queue); unlock
//!                                        notify_all(not_empty)
//! ```
//!
//! The callback takes the queue lock before notifying, so it cannot slip
//! between the consumer's check and its wait. A registration made after the
//! callbacks ran always observes the flag.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

type WakeFn = &'static (dyn Fn() + Sync);

struct Shared {
    requested: AtomicBool,
    wakers: Mutex<Wakers>,
}

#[derive(Default)]
struct Wakers {
    next_id: u64,
    entries: Vec<(u64, WakeFn)>,
}

/// The owning side of a stop signal.
///
/// # Example
///
/// ```
/// use nexus_bulk::{StopSource, UnboundedQueue};
/// use std::thread;
///
/// let queue = UnboundedQueue::<u32>::new();
/// let source = StopSource::new();
/// let token = source.token();
///
/// thread::scope(|s| {
///     let consumer = s.spawn(|| queue.pop_all_or_stop(&token, Vec::new()));
///     source.request_stop();
///     assert!(consumer.join().unwrap().is_empty());
/// });
/// ```
pub struct StopSource {
    shared: Arc<Shared>,
}

/// A cloneable handle observing a [`StopSource`].
#[derive(Clone)]
pub struct StopToken {
    shared: Arc<Shared>,
}

impl StopSource {
    /// Creates a source with no stop requested.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                requested: AtomicBool::new(false),
                wakers: Mutex::new(Wakers::default()),
            }),
        }
    }

    /// Returns a token tied to this source.
    pub fn token(&self) -> StopToken {
        StopToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Requests a stop and wakes every consumer currently waiting on a token
    /// from this source.
    ///
    /// Returns `true` if this call made the request, `false` if a stop had
    /// already been requested.
    pub fn request_stop(&self) -> bool {
        if self.shared.requested.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Callbacks run with the registry locked, so a registration cannot
        // be removed (and its closure freed) while it is being called.
        let wakers = self.shared.wakers.lock();
        debug!(waiters = wakers.entries.len(), "stop requested");
        for (_, wake) in &wakers.entries {
            wake();
        }
        true
    }

    /// Returns `true` once a stop has been requested.
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.shared.requested.load(Ordering::SeqCst)
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StopSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSource")
            .field("stop_requested", &self.stop_requested())
            .finish_non_exhaustive()
    }
}

impl StopToken {
    /// Returns `true` once the source has requested a stop.
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.shared.requested.load(Ordering::SeqCst)
    }

    /// Registers `wake` to be called when a stop is requested.
    ///
    /// # Safety
    ///
    /// The returned [`Registration`] must be dropped before `wake` is; it must
    /// not be leaked with `mem::forget`. Dropping it blocks until any
    /// in-flight call to `wake` has finished.
    ///
    /// `wake` is called from the stopping thread with the registry locked. It
    /// must not register or deregister on the same token.
    pub(crate) unsafe fn register<'a>(&'a self, wake: &'a (dyn Fn() + Sync + 'a)) -> Registration<'a> {
        // SAFETY: the caller keeps `wake` alive until the registration is
        // dropped, and the registration removes it under the registry lock.
        let wake = unsafe { mem::transmute::<&'a (dyn Fn() + Sync + 'a), WakeFn>(wake) };

        let mut wakers = self.shared.wakers.lock();
        let id = wakers.next_id;
        wakers.next_id += 1;
        wakers.entries.push((id, wake));

        Registration { token: self, id }
    }
}

impl fmt::Debug for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopToken")
            .field("stop_requested", &self.stop_requested())
            .finish_non_exhaustive()
    }
}

/// Keeps a wake callback registered on a [`StopToken`] until dropped.
pub(crate) struct Registration<'a> {
    token: &'a StopToken,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut wakers = self.token.shared.wakers.lock();
        if let Some(pos) = wakers.entries.iter().position(|(id, _)| *id == self.id) {
            wakers.entries.swap_remove(pos);
        }
    }
}
