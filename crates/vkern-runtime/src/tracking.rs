#![forbid(unsafe_code)]

//! Read tracking for automatic subscription.
//!
//! [`track`] runs a closure and records every store, lens, and computed value
//! it reads through `get()`. The render cycle uses the returned
//! [`Dependencies`] to subscribe to exactly what a component read:
//!
//! ```
//! use vkern_runtime::store::Store;
//! use vkern_runtime::tracking::track;
//!
//! let count = Store::new(1);
//! let (label, deps) = track(|| format!("count = {}", count.get()));
//! assert_eq!(label, "count = 1");
//! assert_eq!(deps.len(), 1);
//! ```
//!
//! Frames nest; a read is recorded only in the innermost frame. Reads inside
//! [`untracked`] are not recorded at all.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::source::{DependencyKey, Source};
use crate::subscription::Subscription;

trait Watch: Send + Sync {
    fn watch_any(&self, on_change: Arc<dyn Fn() + Send + Sync>) -> Subscription;
}

impl<S: Source> Watch for S {
    fn watch_any(&self, on_change: Arc<dyn Fn() + Send + Sync>) -> Subscription {
        self.watch(Arc::new(move |_: &S::Output, _: &S::Output| on_change()))
    }
}

struct Dependency {
    key: DependencyKey,
    source: Arc<dyn Watch>,
}

thread_local! {
    /// `None` frames suppress recording.
    static FRAMES: RefCell<Vec<Option<Vec<Dependency>>>> = const { RefCell::new(Vec::new()) };
}

/// Record a read of `source` in the innermost tracking frame, if any.
pub(crate) fn record<S: Source>(source: &S) {
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        let Some(Some(frame)) = frames.last_mut() else {
            return;
        };
        let key = source.dependency_key();
        if frame.iter().all(|d| d.key != key) {
            frame.push(Dependency {
                key,
                source: Arc::new(source.clone()),
            });
        }
    });
}

/// Pops its frame on drop, so a panicking closure leaves the stack balanced.
struct Frame {
    _not_send: PhantomData<*const ()>,
}

impl Frame {
    fn open(recording: bool) -> Self {
        FRAMES.with(|frames| frames.borrow_mut().push(recording.then(Vec::new)));
        Self {
            _not_send: PhantomData,
        }
    }

    fn close(self) -> Vec<Dependency> {
        let deps = FRAMES.with(|frames| frames.borrow_mut().pop().flatten());
        std::mem::forget(self);
        deps.unwrap_or_default()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

/// Run `f`, returning its result and the reactive values it read.
pub fn track<R>(f: impl FnOnce() -> R) -> (R, Dependencies) {
    let frame = Frame::open(true);
    let out = f();
    let deps = frame.close();
    (out, Dependencies { deps })
}

/// Run `f` without recording its reads in any enclosing [`track`].
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let frame = Frame::open(false);
    let out = f();
    frame.close();
    out
}

/// Whether a [`track`] frame is recording on this thread.
#[must_use]
pub fn is_tracking() -> bool {
    FRAMES.with(|frames| matches!(frames.borrow().last(), Some(Some(_))))
}

/// Reactive values read during a [`track`] call.
pub struct Dependencies {
    deps: Vec<Dependency>,
}

impl Dependencies {
    #[must_use]
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Keys of the recorded sources, in first-read order.
    #[must_use]
    pub fn keys(&self) -> Vec<DependencyKey> {
        self.deps.iter().map(|d| d.key.clone()).collect()
    }

    /// Call `on_change` whenever any recorded source changes. Each change
    /// fires once, in the scope active now.
    pub fn subscribe(&self, on_change: impl Fn() + Send + Sync + 'static) -> Subscription {
        let on_change: Arc<dyn Fn() + Send + Sync> = Arc::new(on_change);
        Subscription::all(
            self.deps
                .iter()
                .map(|d| d.source.watch_any(Arc::clone(&on_change)))
                .collect(),
        )
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.deps.iter().map(|d| d.key.to_string()))
            .finish()
    }
}
