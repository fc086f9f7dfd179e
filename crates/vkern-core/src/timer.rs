#![forbid(unsafe_code)]

//! Cancellable delayed tasks.
//!
//! A [`Timer`] schedules a closure to run once after a delay and hands back a
//! [`TimerHandle`]. Cancellation and firing are mutually exclusive: both go
//! through a single `Pending -> {Cancelled, Fired}` transition under the
//! handle's lock, so exactly one of them wins.
//!
//! [`ThreadTimer`] runs each task on its own short-lived thread, which is
//! plenty for cull countdowns (one per disconnected session).

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use web_time::Instant;

/// Work scheduled on a [`Timer`].
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Clock primitive: run a task after a delay, cancellably.
pub trait Timer: Send + Sync {
    /// Schedule `task` to run once after `delay`.
    fn schedule(&self, delay: Duration, task: TimerTask) -> io::Result<TimerHandle>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Cancelled,
    Fired,
}

#[derive(Debug)]
struct Shared {
    phase: Mutex<Phase>,
    changed: Condvar,
    deadline: Instant,
}

/// Handle to a scheduled task. Cloning shares the same task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    shared: Arc<Shared>,
}

impl TimerHandle {
    /// A pending handle due at `deadline`. Intended for [`Timer`] implementations.
    #[must_use]
    pub fn pending(deadline: Instant) -> Self {
        Self {
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Pending),
                changed: Condvar::new(),
                deadline,
            }),
        }
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.shared.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancel the task. Returns `true` if this call prevented it from running.
    pub fn cancel(&self) -> bool {
        let mut phase = self.phase();
        if *phase == Phase::Pending {
            *phase = Phase::Cancelled;
            self.shared.changed.notify_all();
            true
        } else {
            false
        }
    }

    /// Claim the right to run the task. Returns `true` exactly once, and only
    /// if the handle was not cancelled first. Intended for [`Timer`]
    /// implementations.
    pub fn try_fire(&self) -> bool {
        let mut phase = self.phase();
        if *phase == Phase::Pending {
            *phase = Phase::Fired;
            self.shared.changed.notify_all();
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        *self.phase() == Phase::Pending
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.phase() == Phase::Cancelled
    }

    #[must_use]
    pub fn has_fired(&self) -> bool {
        *self.phase() == Phase::Fired
    }

    /// When the task is due.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.shared.deadline
    }

    /// Block until the deadline passes or the handle is cancelled.
    /// Returns `true` if the deadline was reached while still pending.
    fn sleep_until_due(&self) -> bool {
        let mut phase = self.phase();
        loop {
            if *phase != Phase::Pending {
                return false;
            }
            let now = Instant::now();
            if now >= self.shared.deadline {
                return true;
            }
            let remaining = self.shared.deadline.saturating_duration_since(now);
            phase = self
                .shared
                .changed
                .wait_timeout(phase, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

/// [`Timer`] backed by one OS thread per scheduled task.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadTimer;

impl ThreadTimer {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Timer for ThreadTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> io::Result<TimerHandle> {
        let handle = TimerHandle::pending(Instant::now() + delay);
        let waiter = handle.clone();
        thread::Builder::new()
            .name("vkern-timer".into())
            .spawn(move || {
                if waiter.sleep_until_due() && waiter.try_fire() {
                    task();
                }
            })?;
        Ok(handle)
    }
}
