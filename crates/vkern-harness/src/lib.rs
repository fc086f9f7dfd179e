#![forbid(unsafe_code)]

//! Test fixtures for vkern.
//!
//! - [`RecordingIo`]: an [`IoHandle`] that keeps every message it is sent and
//!   can be marked closed to simulate a dropped connection.
//! - [`ManualTimer`]: a [`Timer`] on a virtual clock, so cull timeouts fire
//!   when the test calls [`ManualTimer::advance`] rather than after a sleep.
//! - [`init_test_logging`]: route `tracing` output to the test harness.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use vkern_core::io::{IoHandle, Message};
use vkern_core::session::SessionContext;
use vkern_core::timer::{Timer, TimerHandle, TimerTask};
use vkern_core::{RuntimeConfig, SessionRegistry};
use web_time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// RecordingIo
// ============================================================================

/// Transport double that records outbound messages.
#[derive(Debug, Default)]
pub struct RecordingIo {
    sent: Mutex<Vec<Message>>,
    closed: AtomicBool,
}

impl RecordingIo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh handle, ready to pass to `connect`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Messages sent so far, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.sent).clone()
    }

    /// Simulate the client going away. Later sends fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl IoHandle for RecordingIo {
    fn send(&self, message: Message) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }
        lock(&self.sent).push(message);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// ManualTimer
// ============================================================================

struct Scheduled {
    handle: TimerHandle,
    task: TimerTask,
}

struct Clock {
    origin: Instant,
    elapsed: Duration,
    queue: Vec<Scheduled>,
}

/// [`Timer`] on a virtual clock advanced by the test.
///
/// Tasks run on the thread calling [`advance`](Self::advance), in deadline
/// order, outside the timer's lock. Cancelled tasks are dropped unrun.
#[derive(Clone)]
pub struct ManualTimer {
    clock: Arc<Mutex<Clock>>,
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualTimer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: Arc::new(Mutex::new(Clock {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                queue: Vec::new(),
            })),
        }
    }

    /// Virtual time since the timer was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        lock(&self.clock).elapsed
    }

    /// Tasks scheduled and neither fired nor cancelled.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.clock)
            .queue
            .iter()
            .filter(|s| s.handle.is_pending())
            .count()
    }

    /// Move the clock forward by `by` and run every task now due.
    /// Returns how many tasks ran.
    pub fn advance(&self, by: Duration) -> usize {
        let due = {
            let mut clock = lock(&self.clock);
            clock.elapsed += by;
            let now = clock.origin + clock.elapsed;
            let (mut due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut clock.queue)
                .into_iter()
                .filter(|s| !s.handle.is_cancelled())
                .partition(|s| s.handle.deadline() <= now);
            clock.queue = rest;
            due.sort_by_key(|s| s.handle.deadline());
            due
        };
        let mut ran = 0;
        for Scheduled { handle, task } in due {
            if handle.try_fire() {
                task();
                ran += 1;
            }
        }
        tracing::trace!(ran, elapsed_ms = self.elapsed().as_millis() as u64, "manual timer advanced");
        ran
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> io::Result<TimerHandle> {
        let mut clock = lock(&self.clock);
        let deadline = clock.origin + clock.elapsed + delay;
        let handle = TimerHandle::pending(deadline);
        clock.queue.push(Scheduled {
            handle: handle.clone(),
            task,
        });
        Ok(handle)
    }
}

/// A session on `timer` with the given cull timeout.
#[must_use]
pub fn manual_session(id: &str, timer: &ManualTimer, cull_timeout: Duration) -> SessionContext {
    let cfg = RuntimeConfig::default().with_cull_timeout(cull_timeout);
    SessionContext::with_parts(id, &cfg, Arc::new(timer.clone()))
}

/// A registry whose sessions cull on `timer`.
#[must_use]
pub fn manual_registry(timer: &ManualTimer, cull_timeout: Duration) -> SessionRegistry {
    let cfg = RuntimeConfig::default().with_cull_timeout(cull_timeout);
    SessionRegistry::with_parts(cfg, Arc::new(timer.clone()))
}

// ============================================================================
// Logging
// ============================================================================

static LOGGING: Once = Once::new();

/// Send `tracing` output through the test writer, filtered by `RUST_LOG`.
/// Safe to call from every test.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn manual_timer_fires_in_deadline_order() {
        let timer = ManualTimer::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, ms) in [("late", 30_u64), ("early", 10)] {
            let o = Arc::clone(&order);
            timer
                .schedule(
                    Duration::from_millis(ms),
                    Box::new(move || o.lock().unwrap().push(label)),
                )
                .unwrap();
        }
        assert_eq!(timer.advance(Duration::from_millis(5)), 0);
        assert_eq!(timer.advance(Duration::from_millis(30)), 2);
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let timer = ManualTimer::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let handle = timer
            .schedule(
                Duration::from_millis(10),
                Box::new(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert!(handle.cancel());
        timer.advance(Duration::from_secs(1));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recording_io_rejects_after_close() {
        let io = RecordingIo::new();
        io.send(Message::from("hi")).unwrap();
        io.close();
        assert!(io.send(Message::from("bye")).is_err());
        assert_eq!(io.messages(), vec![Message::from("hi")]);
    }
}
