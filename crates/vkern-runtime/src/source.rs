#![forbid(unsafe_code)]

//! Common interface of readable reactive values.

use std::fmt;
use std::sync::Arc;

use crate::subscription::Subscription;

/// Change callback: `(new, old)`.
pub type ChangeFn<T> = dyn Fn(&T, &T) + Send + Sync;

/// Identity of a reactive source, used to de-duplicate tracked reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyKey {
    origin: usize,
    path: String,
}

impl DependencyKey {
    pub(crate) fn new(origin: usize, path: impl Into<String>) -> Self {
        Self {
            origin,
            path: path.into(),
        }
    }

    /// Key of a value derived from this one.
    pub(crate) fn derived(&self, suffix: impl fmt::Display) -> Self {
        Self {
            origin: self.origin,
            path: format!("{}|{suffix}", self.path),
        }
    }
}

impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}{}", self.origin, self.path)
    }
}

/// A reactive value: stores, lenses, and computed values.
pub trait Source: Clone + Send + Sync + 'static {
    type Output: Clone + PartialEq + Send + Sync + 'static;

    /// Current value, without recording a dependency.
    fn read(&self) -> Self::Output;

    /// Call `on_change(new, old)` whenever the output changes by value in the
    /// scope active at subscribe time.
    fn watch(&self, on_change: Arc<ChangeFn<Self::Output>>) -> Subscription;

    fn dependency_key(&self) -> DependencyKey;
}
