#![forbid(unsafe_code)]

//! Reactive value container with pluggable, session-aware storage.
//!
//! # Design
//!
//! A [`Store<T>`] resolves its value slot through a
//! [`Storage`](crate::storage::Storage) backend on every access, so the same
//! handle reads and writes a different value in each bound session. Slots
//! hold immutable snapshots (`ArcSwap<T>`): `get()` never blocks and never
//! observes a partially merged value.
//!
//! Writes go through one per-store mutex. The read-merge-write sequence and
//! the enqueueing of the resulting notification happen under it; subscriber
//! callbacks never do. A single drainer delivers queued notifications in
//! mutation order, so a callback that writes to the store again simply
//! enqueues another notification.
//!
//! # Invariants
//!
//! 1. Setting a value equal to the current one is a no-op (no notification).
//! 2. Notifications for one store are delivered in the order the mutations
//!    were applied.
//! 3. A listener is bucketed by the session owning the slot it subscribed
//!    through, and runs inside the scope it subscribed from.
//! 4. A panicking listener is logged and skipped; the remaining listeners
//!    still run.
//! 5. A failed merge leaves the value unchanged.
//!
//! # Failure Modes
//!
//! | Failure | Behavior |
//! |---------|----------|
//! | Merge / update closure returns `Err` | Error returned to the caller, nothing written |
//! | Listener panics | Logged at `error`, delivery continues |
//! | Update closure writes to the same store | Misuse reported, inner write skipped |
//! | Bound session is closed | Misuse reported, process-wide slot used |

use std::cell::RefCell;
use std::collections::VecDeque;
use std::collections::hash_map::Entry;
use std::convert::Infallible;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use ahash::AHashMap;
use vkern_core::binding;
use vkern_core::error::{ContextMisuseError, report_misuse};
use vkern_core::session::{SessionId, WeakSessionContext};

use crate::computed::Computed;
use crate::error::{MergeError, StoreError};
use crate::lens::FieldLens;
use crate::source::{ChangeFn, DependencyKey, Source};
use crate::storage::{GlobalStorage, SessionStorage, Storage};
use crate::subscription::Subscription;
use crate::tracking;
use crate::value::{Merge, Value};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

thread_local! {
    /// Stores whose write lock this thread currently holds.
    static WRITING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a store as being written by this thread until dropped.
struct Writing(usize);

impl Writing {
    fn enter<T>(inner: &Arc<StoreInner<T>>) -> Option<Self> {
        let id = Arc::as_ptr(inner) as *const () as usize;
        WRITING.with(|w| {
            let mut w = w.borrow_mut();
            if w.contains(&id) {
                None
            } else {
                w.push(id);
                Some(Self(id))
            }
        })
    }
}

impl Drop for Writing {
    fn drop(&mut self) {
        WRITING.with(|w| w.borrow_mut().retain(|id| *id != self.0));
    }
}

struct Listener<T> {
    callback: Weak<ChangeFn<T>>,
    /// Scope the listener subscribed from (`None` = process-wide).
    scope: Option<WeakSessionContext>,
}

struct Bucket<T> {
    /// Session owning the bucket, so a hook from an older session with the
    /// same id cannot drop a newer session's listeners.
    owner: Option<WeakSessionContext>,
    listeners: Vec<Listener<T>>,
}

struct Pending<T> {
    bucket: Option<SessionId>,
    new: Arc<T>,
    old: Arc<T>,
}

struct WriteState<T> {
    pending: VecDeque<Pending<T>>,
    draining: bool,
}

struct StoreInner<T> {
    storage: Box<dyn Storage<T>>,
    write: Mutex<WriteState<T>>,
    listeners: Mutex<AHashMap<Option<SessionId>, Bucket<T>>>,
    version: AtomicU64,
}

/// A reactive, session-aware value container.
///
/// Cloning a `Store` creates another handle to the same store.
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("storage", &self.inner.storage.label())
            .field("version", &self.inner.version.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> Store<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// A process-wide store shared by every session.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self::with_storage(GlobalStorage::new(initial))
    }

    /// A session-scoped store: each session gets its own value under `key`,
    /// created lazily from `init`. Outside any session the store reads and
    /// writes a process-wide fallback.
    pub fn scoped(
        key: impl Into<Arc<str>>,
        init: impl Fn() -> T + Send + Sync + 'static,
    ) -> Result<Self, StoreError> {
        Ok(Self::with_storage(SessionStorage::new(key, init)?))
    }

    /// [`scoped`](Self::scoped) with `T::default()` as the initial value.
    pub fn scoped_default(key: impl Into<Arc<str>>) -> Result<Self, StoreError>
    where
        T: Default,
    {
        Self::scoped(key, T::default)
    }

    /// A store over a custom backend.
    pub fn with_storage(storage: impl Storage<T> + 'static) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                storage: Box::new(storage),
                write: Mutex::new(WriteState {
                    pending: VecDeque::new(),
                    draining: false,
                }),
                listeners: Mutex::new(AHashMap::new()),
                version: AtomicU64::new(0),
            }),
        }
    }

    /// The current value in this scope. Recorded by [`tracking::track`].
    #[must_use]
    pub fn get(&self) -> T {
        tracking::record(self);
        self.read()
    }

    /// The current snapshot, without cloning and without recording a
    /// dependency.
    #[must_use]
    pub fn peek(&self) -> Arc<T> {
        self.inner.storage.resolve().slot.load_full()
    }

    /// Replace the value and notify this scope's listeners with
    /// `(new, old)`.
    pub fn set(&self, value: T) {
        let _ = self.write(|_| Ok::<_, Infallible>(value));
    }

    /// Replace the value with `f(current)`, atomically.
    pub fn update_with(&self, f: impl FnOnce(&T) -> T) {
        let _ = self.write(|current| Ok::<_, Infallible>(f(current)));
    }

    /// Like [`update_with`](Self::update_with), but `f` may fail; on error
    /// the value is unchanged and the error returned.
    pub fn try_update_with<E>(&self, f: impl FnOnce(&T) -> Result<T, E>) -> Result<(), E> {
        self.write(f).map(|_| ())
    }

    /// Merge a partial update into the current value.
    ///
    /// Runs under the store's write lock, so concurrent updates to disjoint
    /// fields are all preserved.
    pub fn update(&self, patch: impl Into<T::Patch>) -> Result<(), MergeError>
    where
        T: Merge,
    {
        let patch = patch.into();
        self.try_update_with(|current| current.merge(patch))
    }

    /// Number of applied (value-changing) mutations across all scopes.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Live listeners in this scope's bucket.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let bucket = self.inner.storage.resolve().session.map(|c| c.id().clone());
        lock(&self.inner.listeners)
            .get(&bucket)
            .map_or(0, |b| {
                b.listeners
                    .iter()
                    .filter(|l| l.callback.strong_count() > 0)
                    .count()
            })
    }

    /// Call `callback(new)` after every change in this scope.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.subscribe_change(move |new, _| callback(new))
    }

    /// Call `callback(new, old)` after every change in this scope.
    pub fn subscribe_change(
        &self,
        callback: impl Fn(&T, &T) + Send + Sync + 'static,
    ) -> Subscription {
        let strong: Arc<ChangeFn<T>> = Arc::new(callback);
        let target = self.inner.storage.resolve();
        let owner = target.session.as_ref().map(|c| c.downgrade());
        let key = target.session.as_ref().map(|c| c.id().clone());
        let listener = Listener {
            callback: Arc::downgrade(&strong),
            scope: binding::current().map(|c| c.downgrade()),
        };

        let fresh = {
            let mut listeners = lock(&self.inner.listeners);
            match listeners.entry(key) {
                Entry::Occupied(mut e) => {
                    e.get_mut().listeners.push(listener);
                    false
                }
                Entry::Vacant(e) => {
                    e.insert(Bucket {
                        owner: owner.clone(),
                        listeners: vec![listener],
                    });
                    true
                }
            }
        };

        if fresh
            && let (Some(ctx), Some(owner)) = (target.session, owner)
        {
            let store = Arc::downgrade(&self.inner);
            ctx.on_close(move |id| {
                if let Some(inner) = store.upgrade() {
                    drop_bucket(&inner, id, &owner);
                }
                Ok(())
            });
        }
        Subscription::new(strong)
    }

    /// A read-only value derived from this store.
    pub fn computed<R>(&self, f: impl Fn(&T) -> R + Send + Sync + 'static) -> Computed<Self, R>
    where
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        Computed::new(self.clone(), f)
    }

    fn write<E>(&self, f: impl FnOnce(&T) -> Result<T, E>) -> Result<bool, E> {
        let Some(writing) = Writing::enter(&self.inner) else {
            let _ = report_misuse(ContextMisuseError::ReentrantWrite {
                store: self.inner.storage.label().to_string(),
            });
            return Ok(false);
        };
        let mut state = lock(&self.inner.write);
        let target = self.inner.storage.resolve();
        let old = target.slot.load_full();
        let new = f(&old)?;
        if new == *old {
            return Ok(false);
        }
        let new = Arc::new(new);
        target.slot.store(Arc::clone(&new));
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        state.pending.push_back(Pending {
            bucket: target.session.map(|c| c.id().clone()),
            new,
            old,
        });
        let drain = !state.draining;
        state.draining = true;
        drop(state);
        drop(writing);
        if drain {
            self.drain();
        }
        Ok(true)
    }

    fn drain(&self) {
        loop {
            let next = {
                let mut state = lock(&self.inner.write);
                match state.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            self.deliver(&next);
        }
    }

    fn deliver(&self, change: &Pending<T>) {
        type Target<T> = (Arc<ChangeFn<T>>, Option<WeakSessionContext>);
        let targets: Vec<Target<T>> = {
            let mut listeners = lock(&self.inner.listeners);
            let Some(bucket) = listeners.get_mut(&change.bucket) else {
                return;
            };
            bucket.listeners.retain(|l| l.callback.strong_count() > 0);
            bucket
                .listeners
                .iter()
                .filter_map(|l| l.callback.upgrade().map(|cb| (cb, l.scope.clone())))
                .collect()
        };

        for (callback, scope) in targets {
            let call = || catch_unwind(AssertUnwindSafe(|| callback(&change.new, &change.old)));
            let outcome = match scope {
                None => binding::with_global(call),
                Some(weak) => match weak.upgrade() {
                    Some(ctx) if !ctx.is_closed() => binding::with_context(&ctx, call),
                    _ => continue,
                },
            };
            if outcome.is_err() {
                tracing::error!(
                    store = self.inner.storage.label(),
                    session = ?change.bucket,
                    "store listener panicked"
                );
            }
        }
    }
}

fn drop_bucket<T>(inner: &StoreInner<T>, id: &SessionId, owner: &WeakSessionContext) {
    let mut listeners = lock(&inner.listeners);
    let key = Some(id.clone());
    let owned = listeners
        .get(&key)
        .and_then(|b| b.owner.as_ref())
        .is_some_and(|o| o.ptr_eq(owner));
    if owned {
        listeners.remove(&key);
        drop(listeners);
        tracing::debug!(store = inner.storage.label(), session = %id, "listeners released");
    }
}

impl Store<Value> {
    /// Root lens over the whole value; extend it with
    /// [`attr`](FieldLens::attr), [`key`](FieldLens::key), and
    /// [`index`](FieldLens::index).
    #[must_use]
    pub fn fields(&self) -> FieldLens {
        FieldLens::root(self.clone())
    }

    /// Shorthand for `self.fields().attr(name)`.
    #[must_use]
    pub fn attr(&self, name: impl Into<String>) -> FieldLens {
        self.fields().attr(name)
    }

    /// Shorthand for `self.fields().key(key)`.
    #[must_use]
    pub fn key(&self, key: impl Into<String>) -> FieldLens {
        self.fields().key(key)
    }

    /// Shorthand for `self.fields().index(index)`.
    #[must_use]
    pub fn index(&self, index: usize) -> FieldLens {
        self.fields().index(index)
    }
}

impl<T> Source for Store<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    type Output = T;

    fn read(&self) -> T {
        T::clone(&self.inner.storage.resolve().slot.load())
    }

    fn watch(&self, on_change: Arc<ChangeFn<T>>) -> Subscription {
        self.subscribe_change(move |new, old| on_change(new, old))
    }

    fn dependency_key(&self) -> DependencyKey {
        DependencyKey::new(Arc::as_ptr(&self.inner) as *const () as usize, "")
    }
}
