#![forbid(unsafe_code)]

//! Session-scoped reactive state for vkern.
//!
//! This crate provides:
//!
//! - [`Store`]: a value container whose slot is resolved per session (or
//!   process-wide) on every access, with `(new, old)` change notification.
//! - [`FieldLens`]: a read/write view into part of a `Store<Value>`.
//! - [`Computed`]: a derived, read-only value.
//! - [`tracking`]: record which of the above a closure read, and subscribe to
//!   all of them.
//!
//! # Architecture
//!
//! Slots are `ArcSwap` snapshots, so readers never lock. Each store has one
//! write mutex covering read-merge-write; notifications are queued under it
//! and delivered outside it, in mutation order, each inside the scope its
//! listener subscribed from. Listeners are held weakly and pruned lazily;
//! [`Subscription`] guards own them.
//!
//! Session-scoped slots live in the session's registries and are released
//! with the session; the store drops that session's listeners from a
//! teardown hook.

pub mod computed;
pub mod error;
pub mod lens;
pub mod source;
pub mod storage;
pub mod store;
pub mod subscription;
pub mod tracking;
pub mod value;

pub use computed::Computed;
pub use error::{LensError, MergeError, StoreError};
pub use lens::FieldLens;
pub use source::{ChangeFn, DependencyKey, Source};
pub use storage::{GlobalStorage, Resolved, SessionStorage, Slot, Storage};
pub use store::Store;
pub use subscription::Subscription;
pub use tracking::{Dependencies, track, untracked};
pub use value::{Fields, Merge, PathStep, Value};
