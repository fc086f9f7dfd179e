#![forbid(unsafe_code)]

//! Storage backends for [`Store`](crate::store::Store).
//!
//! A backend answers one question on every access: which value slot does the
//! current scope use? [`GlobalStorage`] always answers with its single
//! process-wide slot. [`SessionStorage`] answers with the bound session's
//! slot for its key (created from the default on first use) and with a
//! process-wide fallback slot when no session is bound.
//!
//! Session storage keys are claimed process-wide: reusing a key for a
//! different value type is rejected when the second store is created.

use std::any::{TypeId, type_name};
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use ahash::AHashMap;
use arc_swap::ArcSwap;
use vkern_core::binding;
use vkern_core::session::SessionContext;

use crate::error::StoreError;

/// A value cell: readers load a snapshot, writers swap in a new one.
pub type Slot<T> = Arc<ArcSwap<T>>;

/// Outcome of resolving a backend in the current scope.
pub struct Resolved<T> {
    pub slot: Slot<T>,
    /// Session owning the slot, `None` for a process-wide slot.
    pub session: Option<SessionContext>,
}

/// Resolves the value slot for the current scope.
pub trait Storage<T>: Send + Sync {
    fn resolve(&self) -> Resolved<T>;

    /// Short label for logs.
    fn label(&self) -> &str;
}

// ============================================================================
// Global
// ============================================================================

/// One slot shared by every session.
pub struct GlobalStorage<T> {
    slot: Slot<T>,
}

impl<T> GlobalStorage<T> {
    pub fn new(initial: T) -> Self {
        Self {
            slot: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }
}

impl<T> fmt::Debug for GlobalStorage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalStorage").finish_non_exhaustive()
    }
}

impl<T: Send + Sync> Storage<T> for GlobalStorage<T> {
    fn resolve(&self) -> Resolved<T> {
        Resolved {
            slot: Arc::clone(&self.slot),
            session: None,
        }
    }

    fn label(&self) -> &str {
        "global"
    }
}

// ============================================================================
// Session
// ============================================================================

type Init<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Per-session slots under `key`, plus a process-wide fallback slot.
///
/// A closed bound session is reported as misuse and served from the fallback.
pub struct SessionStorage<T> {
    key: Arc<str>,
    init: Init<T>,
    fallback: Slot<T>,
}

impl<T> fmt::Debug for SessionStorage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStorage")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> SessionStorage<T> {
    /// Claim `key` for `T`. `init` builds each session's initial value (and
    /// the fallback's).
    pub fn new(
        key: impl Into<Arc<str>>,
        init: impl Fn() -> T + Send + Sync + 'static,
    ) -> Result<Self, StoreError> {
        let key = key.into();
        claim_key::<T>(&key)?;
        let fallback = Arc::new(ArcSwap::from_pointee(init()));
        Ok(Self {
            key,
            init: Arc::new(init),
            fallback,
        })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn global(&self) -> Resolved<T> {
        Resolved {
            slot: Arc::clone(&self.fallback),
            session: None,
        }
    }
}

impl<T: Send + Sync + 'static> Storage<T> for SessionStorage<T> {
    fn resolve(&self) -> Resolved<T> {
        let Some(ctx) = binding::current() else {
            return self.global();
        };
        let init = Arc::clone(&self.init);
        match ctx.slot::<ArcSwap<T>, _>(&self.key, move || ArcSwap::from_pointee(init())) {
            Ok(slot) => Resolved {
                slot,
                session: Some(ctx),
            },
            Err(_) => self.global(),
        }
    }

    fn label(&self) -> &str {
        &self.key
    }
}

struct KeyOwner {
    type_id: TypeId,
    type_name: &'static str,
}

fn keys() -> &'static Mutex<AHashMap<String, KeyOwner>> {
    static KEYS: OnceLock<Mutex<AHashMap<String, KeyOwner>>> = OnceLock::new();
    KEYS.get_or_init(|| Mutex::new(AHashMap::new()))
}

/// Reserve `key` for values of type `T`. Re-claiming with the same type is
/// allowed; stores sharing a key share their per-session slots.
fn claim_key<T: 'static>(key: &str) -> Result<(), StoreError> {
    let mut keys = keys().lock().unwrap_or_else(|e| e.into_inner());
    match keys.entry(key.to_string()) {
        Entry::Occupied(e) if e.get().type_id != TypeId::of::<T>() => {
            Err(StoreError::KeyCollision {
                key: key.to_string(),
                existing: e.get().type_name,
                requested: type_name::<T>(),
            })
        }
        Entry::Occupied(_) => Ok(()),
        Entry::Vacant(e) => {
            e.insert(KeyOwner {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
            });
            tracing::debug!(key, value_type = type_name::<T>(), "store key claimed");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkern_core::binding::{clear_thread_stack, with_context};
    use vkern_core::config::{RunMode, with_mode};

    #[test]
    fn key_reuse_with_other_type_collides() {
        SessionStorage::new("storage-test-collide", || 0_i64).unwrap();
        SessionStorage::new("storage-test-collide", || 1_i64).unwrap();
        let err = SessionStorage::new("storage-test-collide", String::new).unwrap_err();
        assert!(matches!(err, StoreError::KeyCollision { ref key, .. } if key == "storage-test-collide"));
    }

    #[test]
    fn session_resolution_is_per_session() {
        clear_thread_stack();
        let storage = SessionStorage::new("storage-test-resolve", || 0_u32).unwrap();
        let a = SessionContext::new("a");
        let slot_a = with_context(&a, || storage.resolve());
        assert_eq!(slot_a.session.as_ref().map(|c| c.id().as_str()), Some("a"));
        slot_a.slot.store(Arc::new(7));
        assert_eq!(**storage.resolve().slot.load(), 0, "fallback unchanged");
        assert_eq!(**with_context(&a, || storage.resolve()).slot.load(), 7);
    }

    #[test]
    fn closed_session_resolves_to_fallback() {
        clear_thread_stack();
        let storage = SessionStorage::new("storage-test-closed", || 1_u32).unwrap();
        let a = SessionContext::new("a");
        a.close();
        let resolved = with_mode(RunMode::Production, || with_context(&a, || storage.resolve()));
        assert!(resolved.session.is_none());
    }
}
