use std::fmt;

/// Error returned by the non-blocking add operations
/// ([`Queue::try_push`](crate::Queue::try_push),
/// [`Queue::try_append`](crate::Queue::try_append),
/// [`Queue::try_push_with`](crate::Queue::try_push_with)).
///
/// Nothing was added. The rejected input is handed back so it can be retried
/// or routed elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAddError<T> {
    /// Another thread holds the queue's lock.
    Contended(T),

    /// The backpressure policy has no room right now.
    ///
    /// Only returned by queues with the [`Blocking`](crate::Blocking) policy.
    Full(T),
}

impl<T> TryAddError<T> {
    /// Returns the input that could not be added.
    pub fn into_inner(self) -> T {
        match self {
            Self::Contended(v) | Self::Full(v) => v,
        }
    }

    /// Returns `true` if the add failed because the lock was held.
    pub fn is_contended(&self) -> bool {
        matches!(self, Self::Contended(_))
    }

    /// Returns `true` if the add failed because the queue was full.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl<T> fmt::Display for TryAddError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contended(_) => write!(f, "queue lock is held by another thread"),
            Self::Full(_) => write!(f, "queue is full"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for TryAddError<T> {}
