#![forbid(unsafe_code)]

//! RAII subscription guard.

use std::any::Any;
use std::fmt;

/// Keeps a subscriber callback alive.
///
/// Stores hold only weak references to their callbacks; dropping the guard
/// drops the strong reference, so the callback is not invoked again and its
/// entry is pruned on the next notification.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    _guard: Box<dyn Any + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new<G: Any + Send + Sync>(guard: G) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }

    /// Combine several subscriptions into one guard.
    pub fn all(subscriptions: Vec<Subscription>) -> Self {
        Self::new(subscriptions)
    }

    /// Unsubscribe now. Equivalent to dropping the guard.
    pub fn unsubscribe(self) {}
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
