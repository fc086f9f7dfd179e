#![forbid(unsafe_code)]

//! Per-connection session context and its lifecycle state machine.
//!
//! A [`SessionContext`] is the isolation unit: it owns a set of named
//! registries (and the per-session slots of session-scoped stores), refers to
//! the transport's [`IoHandle`] while connected, and moves through
//!
//! ```text
//! Connecting ──connect──► Connected ◄──connect── Disconnected
//!      │                     │                       ▲   │
//!      │                     └───────disconnect──────┘   │ cull timer
//!      └─────────────── close (any state) ──► Closing ◄──┘
//!                                               │
//!                                               ▼
//!                                             Closed
//! ```
//!
//! # Invariants
//!
//! 1. Teardown runs exactly once. Whichever of the cull timer or an explicit
//!    close flips `teardown_started` first does the work; the other observes
//!    it and no-ops.
//! 2. A cull only proceeds if the session is still `Disconnected` with the
//!    same disconnect generation that scheduled it, so a session is never
//!    culled while `Connected` and a stale timer from an earlier disconnect
//!    never wins over a later one. The cull claims teardown in the same
//!    critical section as that check, so a `connect` that returned `Ok` is
//!    never followed by a cull.
//! 3. Teardown always reaches `Closed`: hook errors and panics are logged and
//!    skipped.
//! 4. Registries are unreachable once released; access afterwards is a
//!    [`ContextMisuseError::SessionClosed`].
//!
//! # Failure Modes
//!
//! | Failure | Behavior |
//! |---------|----------|
//! | Teardown hook returns `Err` | Logged at `warn`, teardown continues |
//! | Teardown hook panics | Logged at `error`, teardown continues |
//! | Timer thread cannot be spawned | Logged; session stays `Disconnected` until reconnect or close |
//! | `close()` re-entered from a hook | Returns immediately (no self-deadlock) |

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll, Waker};
use std::thread::{self, ThreadId};
use std::time::Duration;

use ahash::AHashMap;

use crate::config::{self, RuntimeConfig};
use crate::error::{ContextMisuseError, SendError, report_misuse};
use crate::io::{IoHandle, Message};
use crate::timer::{ThreadTimer, Timer, TimerHandle};

/// Handle to a pending cull countdown, returned by
/// [`SessionContext::disconnect`]. Cancelling it keeps the session alive in
/// the `Disconnected` state.
pub type CullHandle = TimerHandle;

/// Error type teardown hooks may return.
pub type TeardownError = Box<dyn std::error::Error + Send + Sync>;

type TeardownHook = Box<dyn FnOnce(&SessionId) -> Result<(), TeardownError> + Send>;
type AnyArc = Arc<dyn Any + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// SessionId
// ============================================================================

/// Opaque, cheaply clonable session identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Arc<str>);

impl SessionId {
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique id.
    #[must_use]
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let seq = NEXT.fetch_add(1, Ordering::Relaxed);
        let nanos = web_time::SystemTime::now()
            .duration_since(web_time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        Self::new(format!("vk-{nanos:08x}-{seq}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// State
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    Closing,
    Closed,
}

impl SessionState {
    /// `Closing` or `Closed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct PendingCull {
    handle: TimerHandle,
    generation: u64,
}

struct Lifecycle {
    state: SessionState,
    io: Option<Arc<dyn IoHandle>>,
    cull: Option<PendingCull>,
    /// Bumped on every disconnect; a cull only acts on its own generation.
    generation: u64,
}

#[derive(Default)]
struct Registries {
    named: AHashMap<String, AnyArc>,
    slots: AHashMap<String, AnyArc>,
    released: bool,
}

#[derive(Default)]
struct ClosedState {
    done: bool,
    wakers: Vec<Waker>,
}

#[derive(Default)]
struct ClosedShared {
    state: Mutex<ClosedState>,
    changed: Condvar,
}

struct SessionInner {
    id: SessionId,
    cull_timeout: Duration,
    timer: Arc<dyn Timer>,
    lifecycle: Mutex<Lifecycle>,
    registries: Mutex<Registries>,
    container: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    /// `None` once teardown has drained them.
    hooks: Mutex<Option<Vec<TeardownHook>>>,
    teardown_started: AtomicBool,
    teardown_thread: Mutex<Option<ThreadId>>,
    closed: Arc<ClosedShared>,
}

// ============================================================================
// SessionContext
// ============================================================================

/// Shared handle to one session. Clones refer to the same session.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PartialEq for SessionContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SessionContext {}

impl SessionContext {
    /// Create a session in the `Connecting` state using the process-wide
    /// config and a [`ThreadTimer`].
    #[must_use]
    pub fn new(id: impl Into<SessionId>) -> Self {
        Self::with_parts(id, &config::current(), Arc::new(ThreadTimer))
    }

    /// Create a session with an explicit config and timer.
    #[must_use]
    pub fn with_parts(id: impl Into<SessionId>, cfg: &RuntimeConfig, timer: Arc<dyn Timer>) -> Self {
        let id = id.into();
        tracing::debug!(session = %id, "session context created");
        Self {
            inner: Arc::new(SessionInner {
                id,
                cull_timeout: cfg.cull_timeout,
                timer,
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Connecting,
                    io: None,
                    cull: None,
                    generation: 0,
                }),
                registries: Mutex::new(Registries::default()),
                container: Mutex::new(None),
                hooks: Mutex::new(Some(Vec::new())),
                teardown_started: AtomicBool::new(false),
                teardown_thread: Mutex::new(None),
                closed: Arc::new(ClosedShared::default()),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        lock(&self.inner.lifecycle).state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Timeout applied when this session disconnects.
    #[must_use]
    pub fn cull_timeout(&self) -> Duration {
        self.inner.cull_timeout
    }

    /// Whether a cull countdown is currently pending.
    #[must_use]
    pub fn has_pending_cull(&self) -> bool {
        lock(&self.inner.lifecycle)
            .cull
            .as_ref()
            .is_some_and(|c| c.handle.is_pending())
    }

    /// A weak handle that does not keep the session alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakSessionContext {
        WeakSessionContext {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Attach (or re-attach) a transport handle.
    ///
    /// From `Connecting` this is the first attach; from `Disconnected` it is a
    /// reconnect and cancels the pending cull. Registries are untouched.
    pub fn connect(&self, io: Arc<dyn IoHandle>) -> Result<(), ContextMisuseError> {
        let mut lc = lock(&self.inner.lifecycle);
        if lc.state.is_terminal() || self.inner.teardown_started.load(Ordering::Acquire) {
            drop(lc);
            return Err(report_misuse(ContextMisuseError::SessionClosed {
                session: self.inner.id.clone(),
                operation: "connect",
            }));
        }
        let previous = lc.state;
        if let Some(cull) = lc.cull.take() {
            let cancelled = cull.handle.cancel();
            tracing::info!(session = %self.inner.id, cancelled, "reconnected within cull window");
        }
        lc.io = Some(io);
        lc.state = SessionState::Connected;
        drop(lc);
        tracing::info!(session = %self.inner.id, from = %previous, "session connected");
        Ok(())
    }

    /// The transport reported that the connection went away.
    ///
    /// Starts a cull countdown of [`cull_timeout`](Self::cull_timeout),
    /// replacing any countdown from an earlier disconnect. Returns `None` if
    /// the session is already closing or closed, or the timer could not be
    /// scheduled.
    pub fn disconnect(&self) -> Option<CullHandle> {
        let mut lc = lock(&self.inner.lifecycle);
        if lc.state.is_terminal() || self.inner.teardown_started.load(Ordering::Acquire) {
            tracing::debug!(session = %self.inner.id, state = %lc.state, "disconnect ignored");
            return None;
        }
        if let Some(previous) = lc.cull.take() {
            previous.handle.cancel();
        }
        lc.generation += 1;
        let generation = lc.generation;
        lc.state = SessionState::Disconnected;
        lc.io = None;

        let weak = self.downgrade();
        let task = Box::new(move || {
            if let Some(ctx) = weak.upgrade() {
                ctx.cull(generation);
            }
        });
        match self.inner.timer.schedule(self.inner.cull_timeout, task) {
            Ok(handle) => {
                lc.cull = Some(PendingCull {
                    handle: handle.clone(),
                    generation,
                });
                drop(lc);
                tracing::info!(
                    session = %self.inner.id,
                    timeout_ms = self.inner.cull_timeout.as_millis() as u64,
                    "session disconnected, cull scheduled"
                );
                Some(handle)
            }
            Err(err) => {
                drop(lc);
                tracing::error!(session = %self.inner.id, %err, "failed to schedule cull timer");
                None
            }
        }
    }

    /// Poll the attached handle and move to `Disconnected` if the transport
    /// has closed it. Returns the state after the check.
    pub fn refresh_connection(&self) -> SessionState {
        let dropped = {
            let lc = lock(&self.inner.lifecycle);
            lc.state == SessionState::Connected && lc.io.as_ref().is_some_and(|io| io.is_closed())
        };
        if dropped {
            self.disconnect();
        }
        self.state()
    }

    /// The due-check and the teardown claim share one lifecycle critical
    /// section, so a reconnect either lands before (and the cull is stale)
    /// or after (and sees the session closing).
    fn cull(&self, generation: u64) {
        {
            let mut lc = lock(&self.inner.lifecycle);
            let due = lc.state == SessionState::Disconnected
                && lc.cull.as_ref().is_some_and(|c| c.generation == generation);
            if !due {
                tracing::debug!(session = %self.inner.id, generation, state = %lc.state, "stale cull ignored");
                return;
            }
            if !self.claim_teardown("cull") {
                return;
            }
            lc.cull = None;
            lc.state = SessionState::Closing;
        }
        tracing::info!(session = %self.inner.id, "cull timeout elapsed");
        self.run_teardown("cull");
    }

    /// Close the session and wait for teardown to finish.
    ///
    /// Takes precedence over a pending cull. Repeated calls are no-ops once
    /// the session is closed; a call racing with an in-flight cull waits for
    /// that teardown instead of running its own.
    pub fn close(&self) {
        if !self.teardown("close") && !self.is_tearing_down_here() {
            self.closed().wait();
        }
    }

    /// Start closing without waiting. Returns the signal to await.
    pub fn request_close(&self) -> ClosedSignal {
        let ctx = self.clone();
        let spawned = thread::Builder::new()
            .name("vkern-close".into())
            .spawn(move || {
                ctx.teardown("close");
            });
        if let Err(err) = spawned {
            tracing::warn!(session = %self.inner.id, %err, "close thread unavailable, closing inline");
            self.teardown("close");
        }
        self.closed()
    }

    /// Signal that completes once the session is `Closed`.
    #[must_use]
    pub fn closed(&self) -> ClosedSignal {
        ClosedSignal {
            shared: Arc::clone(&self.inner.closed),
        }
    }

    fn is_tearing_down_here(&self) -> bool {
        *lock(&self.inner.teardown_thread) == Some(thread::current().id())
    }

    /// Run teardown if nobody has yet. Returns `true` if this call did it.
    fn teardown(&self, reason: &'static str) -> bool {
        if !self.claim_teardown(reason) {
            return false;
        }
        self.run_teardown(reason);
        true
    }

    /// Flip `teardown_started`. Only the caller that gets `true` may call
    /// [`run_teardown`](Self::run_teardown).
    fn claim_teardown(&self, reason: &'static str) -> bool {
        let claimed = self
            .inner
            .teardown_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            *lock(&self.inner.teardown_thread) = Some(thread::current().id());
        } else {
            tracing::debug!(session = %self.inner.id, reason, "teardown already started");
        }
        claimed
    }

    fn run_teardown(&self, reason: &'static str) {
        let _span = tracing::info_span!("session_teardown", session = %self.inner.id, reason).entered();

        let io = {
            let mut lc = lock(&self.inner.lifecycle);
            lc.state = SessionState::Closing;
            if let Some(cull) = lc.cull.take() {
                cull.handle.cancel();
            }
            lc.io.take()
        };
        drop(io);

        let hooks = lock(&self.inner.hooks).take().unwrap_or_default();
        for hook in hooks {
            run_hook(&self.inner.id, hook);
        }

        let released = {
            let mut regs = lock(&self.inner.registries);
            regs.released = true;
            (std::mem::take(&mut regs.named), std::mem::take(&mut regs.slots))
        };
        drop(released);
        *lock(&self.inner.container) = None;

        lock(&self.inner.lifecycle).state = SessionState::Closed;
        *lock(&self.inner.teardown_thread) = None;
        self.inner.closed.finish();
        tracing::info!(session = %self.inner.id, "session closed");
    }

    /// Register a teardown callback. Runs once, during `Closing`. If the
    /// session is already past that point the hook runs immediately.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce(&SessionId) -> Result<(), TeardownError> + Send + 'static,
    {
        let mut hooks = lock(&self.inner.hooks);
        match hooks.as_mut() {
            Some(list) => list.push(Box::new(hook)),
            None => {
                drop(hooks);
                run_hook(&self.inner.id, Box::new(hook));
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Forward a message to the attached transport.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), SendError> {
        let io = {
            let lc = lock(&self.inner.lifecycle);
            match (&lc.io, lc.state) {
                (Some(io), SessionState::Connected) => Arc::clone(io),
                _ => return Err(SendError::NotConnected(self.inner.id.clone())),
            }
        };
        io.send(message.into()).map_err(SendError::Io)
    }

    // ------------------------------------------------------------------
    // Container back-reference
    // ------------------------------------------------------------------

    /// Remember the root UI object rendered for this session (not owned).
    pub fn set_container(&self, container: &Arc<dyn Any + Send + Sync>) {
        *lock(&self.inner.container) = Some(Arc::downgrade(container));
    }

    /// The root UI object, if it is still alive.
    #[must_use]
    pub fn container(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        lock(&self.inner.container).as_ref().and_then(Weak::upgrade)
    }

    /// The root UI object downcast to `T`.
    #[must_use]
    pub fn container_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.container().and_then(|c| c.downcast::<T>().ok())
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    /// The named registry of type `T`, created empty on first use.
    pub fn registry<T>(&self, name: &str) -> Result<Arc<T>, ContextMisuseError>
    where
        T: Any + Send + Sync + Default,
    {
        self.entry(name, false, T::default)
    }

    /// The per-session slot stored under `key`, created with `init` on first
    /// use. Slots back session-scoped stores and are released with the
    /// session.
    pub fn slot<T, F>(&self, key: &str, init: F) -> Result<Arc<T>, ContextMisuseError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.entry(key, true, init)
    }

    fn entry<T, F>(&self, name: &str, slot: bool, init: F) -> Result<Arc<T>, ContextMisuseError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let closed = || {
            report_misuse(ContextMisuseError::SessionClosed {
                session: self.inner.id.clone(),
                operation: if slot { "store slot access" } else { "registry access" },
            })
        };
        let existing = {
            let regs = lock(&self.inner.registries);
            if regs.released {
                drop(regs);
                return Err(closed());
            }
            let map = if slot { &regs.slots } else { &regs.named };
            map.get(name).cloned()
        };
        let any = match existing {
            Some(any) => any,
            None => {
                // `init` may itself read session state, so it runs unlocked.
                let fresh = Arc::new(init()) as AnyArc;
                let mut regs = lock(&self.inner.registries);
                if regs.released {
                    drop(regs);
                    return Err(closed());
                }
                let map = if slot { &mut regs.slots } else { &mut regs.named };
                map.entry(name.to_string()).or_insert(fresh).clone()
            }
        };
        any.downcast::<T>().map_err(|_| {
            report_misuse(ContextMisuseError::RegistryTypeMismatch {
                name: name.to_string(),
            })
        })
    }

    /// Names of the registries created so far.
    #[must_use]
    pub fn registry_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.registries).named.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of named registries plus store slots currently held.
    #[must_use]
    pub fn held_entries(&self) -> usize {
        let regs = lock(&self.inner.registries);
        regs.named.len() + regs.slots.len()
    }

    /// Whether teardown has released the registries.
    #[must_use]
    pub fn registries_released(&self) -> bool {
        lock(&self.inner.registries).released
    }

    /// Drop all registries and store slots while keeping the session alive,
    /// e.g. when the application is re-mounted for the same connection.
    pub fn reset(&self) -> Result<(), ContextMisuseError> {
        let cleared = {
            let mut regs = lock(&self.inner.registries);
            if regs.released {
                drop(regs);
                return Err(report_misuse(ContextMisuseError::SessionClosed {
                    session: self.inner.id.clone(),
                    operation: "reset",
                }));
            }
            (std::mem::take(&mut regs.named), std::mem::take(&mut regs.slots))
        };
        drop(cleared);
        tracing::debug!(session = %self.inner.id, "session registries reset");
        Ok(())
    }
}

fn run_hook(id: &SessionId, hook: TeardownHook) {
    match catch_unwind(AssertUnwindSafe(|| hook(id))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(session = %id, %err, "teardown hook failed"),
        Err(_) => tracing::error!(session = %id, "teardown hook panicked"),
    }
}

/// Non-owning session handle.
#[derive(Clone)]
pub struct WeakSessionContext {
    inner: Weak<SessionInner>,
}

impl WeakSessionContext {
    #[must_use]
    pub fn upgrade(&self) -> Option<SessionContext> {
        self.inner.upgrade().map(|inner| SessionContext { inner })
    }

    /// Whether this handle points at `ctx`.
    #[must_use]
    pub fn is(&self, ctx: &SessionContext) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&ctx.inner))
    }

    /// Whether both handles point at the same session.
    #[must_use]
    pub fn ptr_eq(&self, other: &WeakSessionContext) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for WeakSessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSessionContext").finish_non_exhaustive()
    }
}

// ============================================================================
// ClosedSignal
// ============================================================================

impl ClosedShared {
    fn finish(&self) {
        let wakers = {
            let mut state = lock(&self.state);
            state.done = true;
            std::mem::take(&mut state.wakers)
        };
        self.changed.notify_all();
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Completion signal for session teardown.
///
/// Block with [`wait`](Self::wait) / [`wait_timeout`](Self::wait_timeout),
/// or `.await` it from async code.
#[derive(Clone)]
pub struct ClosedSignal {
    shared: Arc<ClosedShared>,
}

impl ClosedSignal {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).done
    }

    /// Block until the session is closed.
    pub fn wait(&self) {
        let mut state = lock(&self.shared.state);
        while !state.done {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block up to `timeout`. Returns `true` if the session closed in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = lock(&self.shared.state);
        let (state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| !s.done)
            .unwrap_or_else(|e| e.into_inner());
        state.done
    }
}

impl fmt::Debug for ClosedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosedSignal")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Future for ClosedSignal {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = lock(&self.shared.state);
        if state.done {
            return Poll::Ready(());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
