#![forbid(unsafe_code)]

//! Integration tests: concurrent writers on one session's state.

use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use pretty_assertions::assert_eq;
use vkern_core::binding::with_context;
use vkern_core::SessionContext;
use vkern_runtime::value::Fields;
use vkern_runtime::{Store, Value};

fn run_concurrently(n: usize, work: impl Fn(usize) + Send + Sync + 'static) {
    let barrier = Arc::new(Barrier::new(n));
    let work = Arc::new(work);
    let workers: Vec<_> = (0..n)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let work = Arc::clone(&work);
            thread::spawn(move || {
                barrier.wait();
                work(i);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn increments_from_three_threads_all_land() {
    let counter = Store::scoped("conc-counter", || 0_i64).unwrap();
    let session = SessionContext::new("conc-a");
    let (c, s) = (counter.clone(), session.clone());
    run_concurrently(3, move |_| with_context(&s, || c.update_with(|v| v + 1)));
    assert_eq!(with_context(&session, || counter.get()), 3);
}

#[test]
fn disjoint_field_updates_are_preserved() {
    let profile = Store::scoped("conc-profile", || {
        Value::record("Profile", [("name", Value::from("")), ("age", Value::from(0))])
    })
    .unwrap();
    let session = SessionContext::new("conc-b");
    let (p, s) = (profile.clone(), session.clone());
    run_concurrently(2, move |i| {
        with_context(&s, || {
            let patch = if i == 0 {
                Fields::new().with("name", "ada")
            } else {
                Fields::new().with("age", 36)
            };
            p.update(patch).unwrap();
        });
    });
    let merged = with_context(&session, || profile.get());
    assert_eq!(
        merged,
        Value::record("Profile", [("name", Value::from("ada")), ("age", Value::from(36))])
    );
}

#[test]
fn lens_writers_on_sibling_paths_do_not_clobber() {
    let grid = Store::new(Value::seq([0, 0, 0, 0, 0, 0, 0, 0]));
    let g = grid.clone();
    run_concurrently(8, move |i| {
        for _ in 0..25 {
            g.index(i)
                .update(|v| Value::from(v.as_int().unwrap_or(0) + 1))
                .unwrap();
        }
    });
    assert_eq!(grid.get(), Value::seq([25, 25, 25, 25, 25, 25, 25, 25]));
    assert_eq!(grid.version(), 200);
}

#[test]
fn listeners_see_every_value_in_write_order() {
    let counter = Store::new(0_i64);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = counter.subscribe_change(move |new, old| s.lock().unwrap().push((*old, *new)));
    let c = counter.clone();
    run_concurrently(4, move |_| {
        for _ in 0..50 {
            c.update_with(|v| v + 1);
        }
    });
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 200);
    for (i, (old, new)) in seen.iter().enumerate() {
        assert_eq!((*old, *new), (i as i64, i as i64 + 1));
    }
}
