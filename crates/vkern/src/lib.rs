#![forbid(unsafe_code)]

//! vkern: per-session context and reactive state for server-driven UIs.
//!
//! Each connected client gets a [`SessionContext`](session::SessionContext)
//! that survives short disconnects, owns the client's registries, and is
//! torn down exactly once when it closes or its cull timer fires. Code runs
//! "inside" a session by binding it to the current thread (or future); any
//! session-scoped [`Store`](runtime::Store) read there resolves to that
//! session's slot.
//!
//! This crate re-exports [`vkern_core`] as [`session`] and, with the default
//! `runtime` feature, [`vkern_runtime`] as [`runtime`]. Most applications
//! only need the [`prelude`].
//!
//! ```
//! use vkern::prelude::*;
//!
//! let counter = Store::scoped("docs-counter", || 0_i64).unwrap();
//! let session = SessionContext::new("client-1");
//!
//! with_context(&session, || counter.set(3));
//! assert_eq!(with_context(&session, || counter.get()), 3);
//! assert_eq!(counter.get(), 0);
//! ```

pub use vkern_core as session;
#[cfg(feature = "runtime")]
pub use vkern_runtime as runtime;

/// The commonly used types and functions.
pub mod prelude {
    pub use vkern_core::{
        CapturedContext, ContextGuard, ContextMisuseError, FutureExt, IoHandle, Message,
        RegistryError, RunMode, RuntimeConfig, SessionContext, SessionId, SessionRegistry,
        SessionState, capture, current, current_id, with_context, with_global,
    };

    #[cfg(feature = "runtime")]
    pub use vkern_runtime::{
        Computed, FieldLens, LensError, Merge, Store, StoreError, Subscription, Value, track,
        untracked,
    };
}
