#![forbid(unsafe_code)]

//! Session contexts and thread binding for vkern.
//!
//! This crate provides:
//! - [`SessionContext`] with its connect/disconnect/cull/close lifecycle
//! - [`binding`] for scoping a thread (or a future) to one session
//! - [`SessionRegistry`] mapping session ids to live contexts
//! - [`ScopedMapping`] for per-session tables behind one shared handle
//!
//! Configuration, logging setup, and the error taxonomy live in [`config`],
//! [`logging`], and [`error`].

pub mod binding;
pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod registry;
pub mod scoped;
pub mod session;
pub mod timer;

pub use binding::{
    CapturedContext, ContextGuard, EnterToken, FutureExt, InContext, capture, current, current_id,
    enter, enter_global, exit, with_context, with_global,
};
pub use config::{MisusePolicy, RunMode, RuntimeConfig};
pub use error::{ContextMisuseError, RegistryError, SendError, report_misuse};
pub use io::{IoHandle, Message};
pub use registry::SessionRegistry;
pub use scoped::{Captured, KeyValueStore, ScopedMapping, SharedMapping};
pub use session::{
    ClosedSignal, CullHandle, SessionContext, SessionId, SessionState, TeardownError,
    WeakSessionContext,
};
pub use timer::{ThreadTimer, Timer, TimerHandle, TimerTask};
