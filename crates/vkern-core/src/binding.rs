#![forbid(unsafe_code)]

//! Thread-to-session binding.
//!
//! Each thread carries a stack of entered scopes. The top of the stack is the
//! "current" session; an empty stack, or an explicitly entered global scope,
//! means the process-wide default.
//!
//! # Invariants
//!
//! 1. **Thread isolation**: stacks are thread-local; entering on one thread
//!    never affects another.
//! 2. **Strict LIFO**: [`exit`] only pops the scope its [`EnterToken`] pushed.
//!    Anything else is a [`ContextMisuseError::UnbalancedExit`].
//! 3. **Re-entrancy**: the same session may be entered more than once; each
//!    entry is a separate stack frame.
//! 4. **Bounded depth**: entering beyond
//!    [`RuntimeConfig::max_context_depth`](crate::config::RuntimeConfig) is a
//!    [`ContextMisuseError::DepthExceeded`].
//! 5. **Propagation**: work handed to another thread or a future captures the
//!    current scope with [`capture`] and re-enters it when it runs.
//!
//! # Example
//!
//! ```
//! use vkern_core::binding::{current_id, with_context};
//! use vkern_core::session::SessionContext;
//!
//! let ctx = SessionContext::new("s1");
//! assert!(current_id().is_none());
//! with_context(&ctx, || {
//!     assert_eq!(current_id().unwrap().as_str(), "s1");
//! });
//! assert!(current_id().is_none());
//! ```

use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use crate::config;
use crate::error::{ContextMisuseError, report_misuse};
use crate::session::{SessionContext, SessionId};

thread_local! {
    /// `None` frames are explicit process-wide scopes.
    static STACK: RefCell<Vec<Option<SessionContext>>> = const { RefCell::new(Vec::new()) };
}

/// Proof of a successful [`enter`]; hand it back to [`exit`].
///
/// Tokens are tied to the thread that created them.
#[must_use = "pass the token to `exit` or the scope stays entered"]
#[derive(Debug)]
pub struct EnterToken {
    depth: usize,
    session: Option<SessionId>,
    _not_send: PhantomData<*const ()>,
}

impl EnterToken {
    /// Session this token entered (`None` = process-wide scope).
    #[must_use]
    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    /// Stack depth right after the matching enter.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }
}

fn push(frame: Option<SessionContext>) -> Result<EnterToken, ContextMisuseError> {
    let limit = config::current().max_context_depth;
    let session = frame.as_ref().map(|c| c.id().clone());
    let pushed = STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if stack.len() >= limit {
            return None;
        }
        stack.push(frame);
        Some(stack.len())
    });
    match pushed {
        Some(depth) => Ok(EnterToken {
            depth,
            session,
            _not_send: PhantomData,
        }),
        None => Err(report_misuse(ContextMisuseError::DepthExceeded { limit, session })),
    }
}

/// Make `ctx` the current session on this thread.
pub fn enter(ctx: &SessionContext) -> Result<EnterToken, ContextMisuseError> {
    push(Some(ctx.clone()))
}

/// Make the process-wide default current on this thread, shadowing any
/// entered session.
pub fn enter_global() -> Result<EnterToken, ContextMisuseError> {
    push(None)
}

/// Undo the [`enter`] that produced `token`.
///
/// If `token` is not the innermost scope the stack is left untouched and the
/// misuse is reported.
pub fn exit(token: EnterToken) -> Result<(), ContextMisuseError> {
    let actual = STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let actual = stack.len();
        if actual == token.depth {
            stack.pop();
        }
        actual
    });
    if actual == token.depth {
        Ok(())
    } else {
        Err(report_misuse(ContextMisuseError::UnbalancedExit {
            expected_depth: token.depth,
            actual_depth: actual,
        }))
    }
}

/// The current session, or `None` for the process-wide default.
#[must_use]
pub fn current() -> Option<SessionContext> {
    STACK.with(|stack| stack.borrow().last().cloned().flatten())
}

/// Id of the current session.
#[must_use]
pub fn current_id() -> Option<SessionId> {
    STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .and_then(|frame| frame.as_ref().map(|c| c.id().clone()))
    })
}

/// Number of entered scopes on this thread.
#[must_use]
pub fn depth() -> usize {
    STACK.with(|stack| stack.borrow().len())
}

/// Drop every scope on this thread, bypassing tokens.
///
/// For test harness cleanup only.
#[cfg(any(test, feature = "test-helpers"))]
pub fn clear_thread_stack() {
    STACK.with(|stack| stack.borrow_mut().clear());
}

// ============================================================================
// RAII scopes
// ============================================================================

/// Exits its scope when dropped, including during unwinding.
#[must_use = "the scope is exited when the guard is dropped"]
#[derive(Debug)]
pub struct ContextGuard {
    token: Option<EnterToken>,
}

impl ContextGuard {
    /// Enter `ctx` until the guard drops.
    pub fn enter(ctx: &SessionContext) -> Result<Self, ContextMisuseError> {
        enter(ctx).map(|token| Self { token: Some(token) })
    }

    /// Enter the process-wide scope until the guard drops.
    pub fn enter_global() -> Result<Self, ContextMisuseError> {
        enter_global().map(|token| Self { token: Some(token) })
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            // During unwinding a second panic would abort; the stack is
            // already being torn down by the panicking frames.
            if thread::panicking() {
                let _ = config::with_mode(config::RunMode::Production, || exit(token));
            } else {
                let _ = exit(token);
            }
        }
    }
}

fn scoped<R>(frame: Option<SessionContext>, f: impl FnOnce() -> R) -> R {
    let guard = push(frame).ok().map(|token| ContextGuard { token: Some(token) });
    let out = f();
    drop(guard);
    out
}

/// Run `f` with `ctx` as the current session.
///
/// If the scope cannot be entered (production mode, depth exceeded) `f`
/// still runs, against whatever scope was already current.
pub fn with_context<R>(ctx: &SessionContext, f: impl FnOnce() -> R) -> R {
    scoped(Some(ctx.clone()), f)
}

/// Run `f` against the process-wide default scope.
pub fn with_global<R>(f: impl FnOnce() -> R) -> R {
    scoped(None, f)
}

// ============================================================================
// Propagation to other threads and futures
// ============================================================================

/// A snapshot of the current scope that can be re-entered elsewhere.
#[derive(Debug, Clone)]
pub struct CapturedContext {
    ctx: Option<SessionContext>,
}

impl CapturedContext {
    /// Session captured (`None` = process-wide).
    #[must_use]
    pub fn session(&self) -> Option<&SessionContext> {
        self.ctx.as_ref()
    }

    /// Run `f` inside the captured scope.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        scoped(self.ctx.clone(), f)
    }
}

/// Capture the current scope.
#[must_use]
pub fn capture() -> CapturedContext {
    CapturedContext { ctx: current() }
}

/// Spawn a named thread that runs `f` inside the caller's current scope.
pub fn spawn<F, R>(name: impl Into<String>, f: F) -> io::Result<JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let captured = capture();
    thread::Builder::new()
        .name(name.into())
        .spawn(move || captured.run(f))
}

/// Future adaptor that re-enters a captured scope around every poll.
#[must_use = "futures do nothing unless polled"]
pub struct InContext<F> {
    captured: CapturedContext,
    future: Pin<Box<F>>,
}

impl<F> std::fmt::Debug for InContext<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InContext")
            .field("captured", &self.captured)
            .finish_non_exhaustive()
    }
}

impl<F: Future> Future for InContext<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Self { captured, future } = &mut *self;
        captured.run(|| future.as_mut().poll(cx))
    }
}

/// Bind futures to a session scope.
pub trait FutureExt: Future + Sized {
    /// Run this future inside the scope that is current right now.
    fn in_current_context(self) -> InContext<Self> {
        InContext {
            captured: capture(),
            future: Box::pin(self),
        }
    }

    /// Run this future inside `ctx`.
    fn in_context(self, ctx: &SessionContext) -> InContext<Self> {
        InContext {
            captured: CapturedContext {
                ctx: Some(ctx.clone()),
            },
            future: Box::pin(self),
        }
    }
}

impl<F: Future> FutureExt for F {}
