//! A lock-based multi-producer multi-consumer queue that hands consumers the
//! whole backlog at once.
//!
//! Producers append single items or whole batches. A consumer takes
//! *everything* queued in one O(1) swap of the backing container, instead of
//! paying a synchronization round trip per element.
//!
//! ```text
//!   producer ──push──┐
//!   producer ──append┼──> [ Mutex<Vec<T>> ] ──swap──> consumer's Vec<T>
//!   producer ──push──┘        │     ▲
//!                       not_empty   └── cleared Vec handed back for reuse
//! ```
//!
//! # Why Batches
//!
//! With a per-element queue, a consumer that wakes up to 2000 items pays for
//! 2000 pops, each one touching the shared state. Here it pays for one lock
//! and one pointer swap, then iterates a plain `Vec` it owns. Passing the
//! drained `Vec` back into the next drain (after clearing it) recycles its
//! allocation, so steady state runs without allocating:
//!
//! ```
//! use nexus_bulk::UnboundedQueue;
//!
//! let queue = UnboundedQueue::<u64>::new();
//! queue.append(0..4);
//!
//! let mut batch = Vec::with_capacity(4096);
//! batch = queue.pop_all(batch);
//! assert_eq!(batch, [0, 1, 2, 3]);
//!
//! // Next drain reuses `batch`'s buffer as the queue's store.
//! queue.push(4);
//! batch = queue.pop_all(batch);
//! assert_eq!(batch, [4]);
//! ```
//!
//! # Backpressure
//!
//! What happens when producers outrun consumers is a type parameter:
//!
//! | Alias | Policy | Full queue |
//! |-------|--------|------------|
//! | [`UnboundedQueue`] | [`Unbounded`] | never full |
//! | [`BlockingQueue`] | [`Blocking`] | producers wait |
//! | [`DroppingQueue`] | [`Dropping`] | backlog discarded, adds return the count |
//!
//! # Stores
//!
//! The backing container is also a type parameter ([`Store`]). `Vec<T>` is the
//! default. `VecDeque<T>` additionally supports taking one element at a time
//! with [`Queue::pop_one`].
//!
//! # Cancellation
//!
//! Blocking drains can be interrupted with a [`StopToken`]. See
//! [`Queue::pop_all_or_stop`].

#![warn(missing_docs)]

mod error;
mod policy;
mod queue;
mod stop;
mod store;

pub use error::TryAddError;
pub use policy::{Backpressure, Blocking, Dropping, Unbounded};
pub use queue::Queue;
pub use stop::{StopSource, StopToken};
pub use store::{FrontPop, Store};

/// `Vec`-backed queue with no size limit.
pub type UnboundedQueue<T> = Queue<Vec<T>, Unbounded>;

/// `Vec`-backed queue whose producers wait once it is full.
pub type BlockingQueue<T> = Queue<Vec<T>, Blocking>;

/// `Vec`-backed queue that discards its backlog once it is full.
pub type DroppingQueue<T> = Queue<Vec<T>, Dropping>;
