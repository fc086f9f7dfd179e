#![forbid(unsafe_code)]

//! Integration tests: connect / disconnect / cull / close.
//!
//! Cull timeouts run on a [`ManualTimer`], so "0.1s later" means an explicit
//! `advance` and the tests never sleep.

use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use vkern_core::config::{RunMode, RuntimeConfig, with_mode};
use vkern_core::error::ContextMisuseError;
use vkern_core::session::{SessionContext, SessionId, SessionState};
use vkern_core::timer::ThreadTimer;
use vkern_core::{KeyValueStore, SharedMapping};
use vkern_harness::{ManualTimer, RecordingIo, init_test_logging, manual_registry, manual_session};

const CULL: Duration = Duration::from_millis(200);

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

// ============================================================================
// Cull window
// ============================================================================

#[test]
fn reconnect_within_window_keeps_session() {
    init_test_logging();
    let timer = ManualTimer::new();
    let session = manual_session("lc-reconnect", &timer, CULL);
    session.connect(RecordingIo::shared()).unwrap();
    let prefs = session.registry::<SharedMapping<String, String>>("prefs").unwrap();
    prefs.insert("theme".into(), "dark".into());

    let cull = session.disconnect().expect("cull scheduled");
    assert_eq!(session.state(), SessionState::Disconnected);

    timer.advance(ms(100));
    session.connect(RecordingIo::shared()).unwrap();
    assert!(cull.is_cancelled());

    timer.advance(ms(200));
    assert_eq!(session.state(), SessionState::Connected);
    let prefs = session.registry::<SharedMapping<String, String>>("prefs").unwrap();
    assert_eq!(
        prefs.get(&"theme".to_string()),
        Some("dark".to_string()),
        "registries survive a reconnect"
    );
}

#[test]
fn no_reconnect_closes_and_releases() {
    init_test_logging();
    let timer = ManualTimer::new();
    let session = manual_session("lc-cull", &timer, CULL);
    session.connect(RecordingIo::shared()).unwrap();
    session.registry::<SharedMapping<u32, u32>>("counts").unwrap();
    assert_eq!(session.held_entries(), 1);

    session.disconnect();
    assert_eq!(timer.advance(ms(199)), 0);
    assert_eq!(session.state(), SessionState::Disconnected);

    assert_eq!(timer.advance(ms(1)), 1);
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.registries_released());
    assert_eq!(session.held_entries(), 0);

    let err = with_mode(RunMode::Production, || {
        session
            .registry::<SharedMapping<u32, u32>>("counts")
            .unwrap_err()
    });
    assert!(matches!(err, ContextMisuseError::SessionClosed { .. }));
}

#[test]
fn second_disconnect_restarts_countdown() {
    let timer = ManualTimer::new();
    let session = manual_session("lc-restart", &timer, CULL);
    session.connect(RecordingIo::shared()).unwrap();
    let first = session.disconnect().unwrap();
    timer.advance(ms(150));
    session.connect(RecordingIo::shared()).unwrap();
    session.disconnect().unwrap();
    assert!(first.is_cancelled());

    timer.advance(ms(150));
    assert_eq!(session.state(), SessionState::Disconnected, "old deadline ignored");
    timer.advance(ms(50));
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn reconnect_racing_cull_is_never_torn_down() {
    init_test_logging();
    for round in 0..2_000 {
        let timer = ManualTimer::new();
        let session = manual_session(&format!("lc-reconnect-race-{round}"), &timer, CULL);
        session.connect(RecordingIo::shared()).unwrap();
        session.disconnect();

        let start = Arc::new(Barrier::new(2));
        let reconnect = {
            let session = session.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                with_mode(RunMode::Production, || session.connect(RecordingIo::shared()))
            })
        };
        start.wait();
        timer.advance(CULL);
        let reconnected = reconnect.join().unwrap();

        match reconnected {
            Ok(()) => assert_eq!(
                session.state(),
                SessionState::Connected,
                "round {round}: accepted reconnect was culled"
            ),
            Err(err) => {
                assert!(matches!(err, ContextMisuseError::SessionClosed { .. }));
                assert!(session.closed().wait_timeout(Duration::from_secs(5)));
                assert_eq!(session.state(), SessionState::Closed);
            }
        }
    }
}

#[test]
fn dropped_transport_is_noticed_by_refresh() {
    let timer = ManualTimer::new();
    let session = manual_session("lc-refresh", &timer, CULL);
    let io = RecordingIo::shared();
    session.connect(io.clone()).unwrap();
    session.send("hello").unwrap();
    io.close();

    assert_eq!(session.refresh_connection(), SessionState::Disconnected);
    assert!(session.send("lost").is_err());
    assert_eq!(io.messages().len(), 1);
}

// ============================================================================
// Wall clock
// ============================================================================

fn real_session(id: &str) -> SessionContext {
    let cfg = RuntimeConfig::default().with_cull_timeout(CULL);
    SessionContext::with_parts(id, &cfg, Arc::new(ThreadTimer::new()))
}

#[test]
fn wall_clock_reconnect_cancels_cull() {
    let session = real_session("lc-wall-reconnect");
    session.connect(RecordingIo::shared()).unwrap();
    session.disconnect();
    thread::sleep(ms(100));
    session.connect(RecordingIo::shared()).unwrap();
    thread::sleep(ms(200));
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn wall_clock_cull_closes_session() {
    let session = real_session("lc-wall-cull");
    session.connect(RecordingIo::shared()).unwrap();
    session.registry::<SharedMapping<u8, u8>>("scratch").unwrap();
    session.disconnect();
    assert!(session.closed().wait_timeout(Duration::from_secs(5)));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.held_entries(), 0);
}

// ============================================================================
// Close
// ============================================================================

#[test]
fn close_is_idempotent_and_hooks_run_once() {
    let timer = ManualTimer::new();
    let session = manual_session("lc-close", &timer, CULL);
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    session.on_close(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    session.close();
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(session.closed().is_closed());
}

#[test]
fn close_racing_cull_tears_down_once() {
    init_test_logging();
    for round in 0..20 {
        let timer = ManualTimer::new();
        let session = manual_session(&format!("lc-race-{round}"), &timer, CULL);
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        session.on_close(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        session.connect(RecordingIo::shared()).unwrap();
        session.disconnect();

        let closer = {
            let session = session.clone();
            thread::spawn(move || session.close())
        };
        timer.advance(CULL);
        closer.join().unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(runs.load(Ordering::SeqCst), 1, "round {round}");
    }
}

#[test]
fn failing_hook_does_not_stop_teardown() {
    let timer = ManualTimer::new();
    let session = manual_session("lc-hook-err", &timer, CULL);
    let after = Arc::new(AtomicUsize::new(0));
    session.on_close(|_| Err("flush failed".into()));
    session.on_close(|_| panic!("hook exploded"));
    let a = Arc::clone(&after);
    session.on_close(move |_| {
        a.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[test]
fn connect_after_close_is_misuse() {
    let timer = ManualTimer::new();
    let session = manual_session("lc-late-connect", &timer, CULL);
    session.close();
    let err = with_mode(RunMode::Production, || {
        session.connect(RecordingIo::shared()).unwrap_err()
    });
    assert!(matches!(
        err,
        ContextMisuseError::SessionClosed {
            operation: "connect",
            ..
        }
    ));
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn registry_reattaches_and_forgets_culled_sessions() {
    init_test_logging();
    let timer = ManualTimer::new();
    let registry = manual_registry(&timer, CULL);
    let id = SessionId::from("lc-registry");

    let first = registry.connect(id.clone(), RecordingIo::shared()).unwrap();
    registry.disconnect(&id);
    timer.advance(ms(50));
    let again = registry.connect(id.clone(), RecordingIo::shared()).unwrap();
    assert!(first.downgrade().is(&again), "same session re-attached");
    assert_eq!(registry.len(), 1);

    registry.disconnect(&id);
    timer.advance(CULL);
    assert!(registry.is_closed(&id));
    assert!(registry.is_empty());

    let fresh = registry.connect(id.clone(), RecordingIo::shared()).unwrap();
    assert!(!first.downgrade().is(&fresh));
    assert_eq!(fresh.state(), SessionState::Connected);
}
