#![forbid(unsafe_code)]

//! Mappings that resolve to the current session's registry.
//!
//! Collaborator code is written against [`KeyValueStore`] and handed an
//! implementation at construction time. A [`SharedMapping`] is one plain
//! process-wide table; a [`ScopedMapping`] re-resolves on every call: to the
//! named registry of the bound session if there is one, otherwise to its
//! process-wide fallback. The same collaborator code therefore becomes
//! per-session without modification.
//!
//! # Capture hazard
//!
//! A value built in one scope and stored into another silently aliases state
//! across sessions. Wrap such values in [`Captured`] and store them with
//! [`ScopedMapping::adopt`], which refuses values from a different scope.

use std::collections::hash_map::Entry;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::AHashMap;

use crate::binding;
use crate::error::{ContextMisuseError, report_misuse};
use crate::session::SessionId;

/// Mutable mapping interface shared by the process-wide and session-scoped
/// implementations. Methods take `&self`; implementations synchronize
/// internally.
pub trait KeyValueStore<K, V>: Send + Sync {
    /// Insert, returning the previous value.
    fn insert(&self, key: K, value: V) -> Option<V>;

    fn get(&self, key: &K) -> Option<V>;

    fn remove(&self, key: &K) -> Option<V>;

    fn contains_key(&self, key: &K) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn keys(&self) -> Vec<K>;

    /// All entries, cloned out of the table.
    fn snapshot(&self) -> Vec<(K, V)>;

    /// Visit entries under the read lock. `f` must not write to the same
    /// mapping.
    fn for_each(&self, f: &mut dyn FnMut(&K, &V));

    fn clear(&self);
}

// ============================================================================
// SharedMapping
// ============================================================================

/// A single lock-protected table.
pub struct SharedMapping<K, V> {
    map: RwLock<AHashMap<K, V>>,
}

impl<K, V> Default for SharedMapping<K, V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(AHashMap::new()),
        }
    }
}

impl<K, V> fmt::Debug for SharedMapping<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMapping")
            .field("len", &self.read().len())
            .finish()
    }
}

impl<K, V> SharedMapping<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, AHashMap<K, V>> {
        self.map.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AHashMap<K, V>> {
        self.map.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K, V> SharedMapping<K, V>
where
    K: Eq + Hash,
{
    /// Return the value for `key`, inserting `make()` first if absent.
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V
    where
        V: Clone,
    {
        match self.write().entry(key) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => e.insert(make()).clone(),
        }
    }
}

impl<K, V> KeyValueStore<K, V> for SharedMapping<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn insert(&self, key: K, value: V) -> Option<V> {
        self.write().insert(key, value)
    }

    fn get(&self, key: &K) -> Option<V> {
        self.read().get(key).cloned()
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.write().remove(key)
    }

    fn contains_key(&self, key: &K) -> bool {
        self.read().contains_key(key)
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn keys(&self) -> Vec<K> {
        self.read().keys().cloned().collect()
    }

    fn snapshot(&self) -> Vec<(K, V)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn for_each(&self, f: &mut dyn FnMut(&K, &V)) {
        for (k, v) in self.read().iter() {
            f(k, v);
        }
    }

    fn clear(&self) {
        self.write().clear();
    }
}

// ============================================================================
// ScopedMapping
// ============================================================================

/// A mapping that resolves to the bound session's registry `name`, or to a
/// process-wide fallback when no session is bound.
///
/// If the bound session is closed, the access is reported as misuse and
/// (in production mode) served from the fallback.
pub struct ScopedMapping<K, V> {
    name: Arc<str>,
    fallback: Arc<SharedMapping<K, V>>,
}

impl<K, V> Clone for ScopedMapping<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            fallback: Arc::clone(&self.fallback),
        }
    }
}

impl<K, V> fmt::Debug for ScopedMapping<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedMapping")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<K, V> ScopedMapping<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Mapping backed by registry `name`, with a fresh process-wide fallback.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_fallback(name, Arc::new(SharedMapping::new()))
    }

    /// Mapping backed by registry `name`, falling back to `fallback`.
    #[must_use]
    pub fn with_fallback(name: impl Into<Arc<str>>, fallback: Arc<SharedMapping<K, V>>) -> Self {
        Self {
            name: name.into(),
            fallback,
        }
    }

    /// Registry name inside each session.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The process-wide table used when no session is bound.
    #[must_use]
    pub fn fallback(&self) -> &Arc<SharedMapping<K, V>> {
        &self.fallback
    }

    /// The concrete table the current scope resolves to.
    #[must_use]
    pub fn resolve(&self) -> Arc<SharedMapping<K, V>> {
        match binding::current() {
            Some(ctx) => ctx
                .registry::<SharedMapping<K, V>>(&self.name)
                .unwrap_or_else(|_| Arc::clone(&self.fallback)),
            None => Arc::clone(&self.fallback),
        }
    }

    /// Store a captured value, refusing it if it was captured in another
    /// scope. Returns the previous value.
    pub fn adopt(&self, key: K, value: Captured<V>) -> Result<Option<V>, ContextMisuseError> {
        let value = value.into_inner()?;
        Ok(self.resolve().insert(key, value))
    }
}

impl<K, V> KeyValueStore<K, V> for ScopedMapping<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn insert(&self, key: K, value: V) -> Option<V> {
        self.resolve().insert(key, value)
    }

    fn get(&self, key: &K) -> Option<V> {
        self.resolve().get(key)
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.resolve().remove(key)
    }

    fn contains_key(&self, key: &K) -> bool {
        self.resolve().contains_key(key)
    }

    fn len(&self) -> usize {
        self.resolve().len()
    }

    fn keys(&self) -> Vec<K> {
        self.resolve().keys()
    }

    fn snapshot(&self) -> Vec<(K, V)> {
        self.resolve().snapshot()
    }

    fn for_each(&self, f: &mut dyn FnMut(&K, &V)) {
        self.resolve().for_each(f);
    }

    fn clear(&self) {
        self.resolve().clear();
    }
}

// ============================================================================
// Captured
// ============================================================================

/// A value tagged with the scope it was created in.
#[derive(Debug, Clone)]
pub struct Captured<T> {
    origin: Option<SessionId>,
    value: T,
}

impl<T> Captured<T> {
    /// Tag `value` with the current scope.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            origin: binding::current_id(),
            value,
        }
    }

    /// Scope the value was created in (`None` = process-wide).
    #[must_use]
    pub fn origin(&self) -> Option<&SessionId> {
        self.origin.as_ref()
    }

    fn check(&self) -> Result<(), ContextMisuseError> {
        let current = binding::current_id();
        if current == self.origin {
            Ok(())
        } else {
            Err(report_misuse(ContextMisuseError::CapturedAcrossSessions {
                origin: self.origin.clone(),
                current,
            }))
        }
    }

    /// Borrow the value if the current scope is the one it was created in.
    pub fn get(&self) -> Result<&T, ContextMisuseError> {
        self.check().map(|()| &self.value)
    }

    /// Take the value if the current scope is the one it was created in.
    pub fn into_inner(self) -> Result<T, ContextMisuseError> {
        self.check()?;
        Ok(self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{clear_thread_stack, with_context};
    use crate::config::{RunMode, with_mode};
    use crate::session::SessionContext;

    fn widgets() -> ScopedMapping<String, u32> {
        ScopedMapping::new("widgets")
    }

    #[test]
    fn unbound_access_uses_fallback() {
        clear_thread_stack();
        let map = widgets();
        map.insert("a".into(), 1);
        assert_eq!(map.fallback().get(&"a".to_string()), Some(1));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn sessions_see_their_own_tables() {
        clear_thread_stack();
        let map = widgets();
        let a = SessionContext::new("a");
        let b = SessionContext::new("b");
        with_context(&a, || map.insert("w".into(), 1));
        with_context(&b, || map.insert("w".into(), 2));
        assert_eq!(with_context(&a, || map.get(&"w".into())), Some(1));
        assert_eq!(with_context(&b, || map.get(&"w".into())), Some(2));
        assert!(map.get(&"w".into()).is_none(), "fallback untouched");
        assert_eq!(a.registry_names(), vec!["widgets".to_string()]);
    }

    #[test]
    fn injected_as_trait_object() {
        clear_thread_stack();
        fn register(store: &dyn KeyValueStore<String, u32>, name: &str) {
            let next = store.len() as u32;
            store.insert(name.to_string(), next);
        }
        let scoped: Arc<dyn KeyValueStore<String, u32>> = Arc::new(widgets());
        let a = SessionContext::new("a");
        with_context(&a, || {
            register(scoped.as_ref(), "x");
            register(scoped.as_ref(), "y");
            let mut keys = scoped.keys();
            keys.sort();
            assert_eq!(keys, vec!["x".to_string(), "y".to_string()]);
        });
        assert!(scoped.is_empty());
    }

    #[test]
    fn closed_session_falls_back_in_production() {
        clear_thread_stack();
        let map = widgets();
        let a = SessionContext::new("a");
        a.close();
        with_mode(RunMode::Production, || {
            with_context(&a, || map.insert("late".into(), 7));
        });
        assert_eq!(map.fallback().get(&"late".to_string()), Some(7));
    }

    #[test]
    fn adopt_refuses_value_from_other_scope() {
        clear_thread_stack();
        let map = widgets();
        let leaked = Captured::new(5_u32);
        assert!(leaked.origin().is_none());
        let a = SessionContext::new("a");
        let err = with_mode(RunMode::Production, || {
            with_context(&a, || map.adopt("k".into(), leaked.clone()))
        });
        assert!(matches!(
            err,
            Err(ContextMisuseError::CapturedAcrossSessions { origin: None, .. })
        ));
        assert!(with_context(&a, || map.get(&"k".into())).is_none());
    }

    #[test]
    fn adopt_accepts_value_from_same_scope() {
        clear_thread_stack();
        let map = widgets();
        let a = SessionContext::new("a");
        with_context(&a, || {
            let own = Captured::new(9_u32);
            assert_eq!(own.get().copied(), Ok(9));
            map.adopt("k".into(), own).unwrap();
            assert_eq!(map.get(&"k".into()), Some(9));
        });
    }

    #[test]
    fn get_or_insert_with_keeps_first() {
        let shared: SharedMapping<&str, u32> = SharedMapping::new();
        assert_eq!(shared.get_or_insert_with("a", || 1), 1);
        assert_eq!(shared.get_or_insert_with("a", || 2), 1);
        let mut seen = Vec::new();
        shared.for_each(&mut |k, v| seen.push((*k, *v)));
        assert_eq!(seen, vec![("a", 1)]);
    }
}
