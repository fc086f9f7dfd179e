#![forbid(unsafe_code)]

//! Read-only values derived from a store, lens, or another computed value.
//!
//! A [`Computed`] has no storage of its own: `get()` re-derives from the
//! source every time, so it is never stale and always reflects the bound
//! session. Subscribers are notified only when the derived value changes by
//! equality, even if the source changed.

use std::fmt;
use std::sync::Arc;

use crate::source::{ChangeFn, DependencyKey, Source};
use crate::subscription::Subscription;
use crate::tracking;

type DeriveFn<I, R> = dyn Fn(&I) -> R + Send + Sync;

/// A pure derivation `S::Output -> R`.
pub struct Computed<S: Source, R> {
    source: S,
    derive: Arc<DeriveFn<S::Output, R>>,
}

impl<S: Source, R> Clone for Computed<S, R> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            derive: Arc::clone(&self.derive),
        }
    }
}

impl<S: Source + fmt::Debug, R> fmt::Debug for Computed<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl<S, R> Computed<S, R>
where
    S: Source,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(source: S, derive: impl Fn(&S::Output) -> R + Send + Sync + 'static) -> Self {
        Self {
            source,
            derive: Arc::new(derive),
        }
    }

    /// Derive from the source's current value. Recorded by
    /// [`tracking::track`].
    #[must_use]
    pub fn get(&self) -> R {
        tracking::record(self);
        self.read()
    }

    /// Call `callback(new)` when the derived value changes.
    pub fn subscribe(&self, callback: impl Fn(&R) + Send + Sync + 'static) -> Subscription {
        self.watch(Arc::new(move |new: &R, _: &R| callback(new)))
    }

    /// Call `callback(new, old)` when the derived value changes.
    pub fn subscribe_change(
        &self,
        callback: impl Fn(&R, &R) + Send + Sync + 'static,
    ) -> Subscription {
        self.watch(Arc::new(callback))
    }

    /// Derive further from this value.
    pub fn map<U>(&self, f: impl Fn(&R) -> U + Send + Sync + 'static) -> Computed<Self, U>
    where
        U: Clone + PartialEq + Send + Sync + 'static,
    {
        Computed::new(self.clone(), f)
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S, R> Source for Computed<S, R>
where
    S: Source,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    type Output = R;

    fn read(&self) -> R {
        (self.derive)(&self.source.read())
    }

    fn watch(&self, on_change: Arc<ChangeFn<R>>) -> Subscription {
        let derive = Arc::clone(&self.derive);
        self.source
            .watch(Arc::new(move |new: &S::Output, old: &S::Output| {
                let new = derive(new);
                let old = derive(old);
                if new != old {
                    on_change(&new, &old);
                }
            }))
    }

    fn dependency_key(&self) -> DependencyKey {
        let derive = Arc::as_ptr(&self.derive) as *const () as usize;
        self.source.dependency_key().derived(format_args!("fn@{derive:#x}"))
    }
}
