#![forbid(unsafe_code)]

//! Process-wide table of live sessions.
//!
//! The table lock is held only while the map itself is read or mutated;
//! lifecycle work (connect, cull, teardown) happens on cloned
//! [`SessionContext`] handles outside it. Each session created here removes
//! itself from the table when it closes, so culled sessions do not leak.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use ahash::AHashMap;

use crate::config::{self, RuntimeConfig};
use crate::error::{ContextMisuseError, RegistryError};
use crate::io::IoHandle;
use crate::session::{CullHandle, SessionContext, SessionId, WeakSessionContext};
use crate::timer::{ThreadTimer, Timer};

struct RegistryInner {
    sessions: Mutex<AHashMap<SessionId, SessionContext>>,
    config: RuntimeConfig,
    timer: Arc<dyn Timer>,
}

impl RegistryInner {
    fn table(&self) -> MutexGuard<'_, AHashMap<SessionId, SessionContext>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove_exact(&self, id: &SessionId, ctx: &WeakSessionContext) {
        let mut table = self.table();
        if table.get(id).is_some_and(|current| ctx.is(current)) {
            table.remove(id);
            drop(table);
            tracing::debug!(session = %id, "session removed from registry");
        }
    }
}

/// Table from [`SessionId`] to [`SessionContext`]. Clones share the table.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("cull_timeout", &self.inner.config.cull_timeout)
            .finish()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Registry using the process-wide config and a [`ThreadTimer`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(config::current().as_ref().clone())
    }

    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_parts(config, Arc::new(ThreadTimer))
    }

    /// Registry with an explicit config and timer (tests use a manual timer).
    #[must_use]
    pub fn with_parts(config: RuntimeConfig, timer: Arc<dyn Timer>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(AHashMap::new()),
                config,
                timer,
            }),
        }
    }

    /// The shared process-wide registry.
    pub fn global() -> &'static SessionRegistry {
        static GLOBAL: OnceLock<SessionRegistry> = OnceLock::new();
        GLOBAL.get_or_init(SessionRegistry::new)
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    fn build(&self, id: SessionId) -> SessionContext {
        SessionContext::with_parts(id, &self.inner.config, Arc::clone(&self.inner.timer))
    }

    /// Detach the new context from the table once it closes.
    fn track(&self, ctx: &SessionContext) {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let weak = ctx.downgrade();
        ctx.on_close(move |id| {
            if let Some(registry) = registry.upgrade() {
                registry.remove_exact(id, &weak);
            }
            Ok(())
        });
    }

    /// Create a session in the `Connecting` state.
    ///
    /// Fails with [`RegistryError::Collision`] if a session with this id
    /// exists and is not closed; the existing session is left untouched.
    pub fn create(&self, id: impl Into<SessionId>) -> Result<SessionContext, RegistryError> {
        let id = id.into();
        let ctx = {
            let mut table = self.inner.table();
            if let Some(existing) = table.get(&id)
                && !existing.is_closed()
            {
                return Err(RegistryError::Collision(id));
            }
            let ctx = self.build(id.clone());
            table.insert(id.clone(), ctx.clone());
            ctx
        };
        self.track(&ctx);
        tracing::info!(session = %id, "session created");
        Ok(ctx)
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<SessionContext> {
        self.inner.table().get(id).cloned()
    }

    /// Drop the entry for `id` if it is closed. Returns `true` if removed.
    pub fn remove_if_closed(&self, id: &SessionId) -> bool {
        let mut table = self.inner.table();
        if table.get(id).is_some_and(SessionContext::is_closed) {
            table.remove(id);
            true
        } else {
            false
        }
    }

    /// Attach `io` to the session `id`, creating it if needed.
    ///
    /// An existing `Disconnected` session is re-attached (its cull is
    /// cancelled and its registries kept).
    pub fn connect(
        &self,
        id: impl Into<SessionId>,
        io: Arc<dyn IoHandle>,
    ) -> Result<SessionContext, ContextMisuseError> {
        let id = id.into();
        let (ctx, created) = {
            let mut table = self.inner.table();
            match table.get(&id) {
                Some(existing) if !existing.is_closed() => (existing.clone(), false),
                _ => {
                    let ctx = self.build(id.clone());
                    table.insert(id.clone(), ctx.clone());
                    (ctx, true)
                }
            }
        };
        if created {
            self.track(&ctx);
            tracing::info!(session = %id, "session created");
        }
        ctx.connect(io)?;
        Ok(ctx)
    }

    /// Report a transport disconnect for `id`.
    pub fn disconnect(&self, id: &SessionId) -> Option<CullHandle> {
        self.get(id).and_then(|ctx| ctx.disconnect())
    }

    /// Close `id` and wait for its teardown. Returns `false` if unknown.
    pub fn close(&self, id: &SessionId) -> bool {
        match self.get(id) {
            Some(ctx) => {
                ctx.close();
                true
            }
            None => false,
        }
    }

    /// Whether `id` is closed. Unknown ids count as closed.
    #[must_use]
    pub fn is_closed(&self, id: &SessionId) -> bool {
        self.get(id).is_none_or(|ctx| ctx.is_closed())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.table().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all tracked sessions, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.inner.table().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every session, e.g. at process shutdown.
    pub fn close_all(&self) {
        let sessions: Vec<SessionContext> = self.inner.table().values().cloned().collect();
        tracing::info!(count = sessions.len(), "closing all sessions");
        for ctx in sessions {
            ctx.close();
        }
    }
}
