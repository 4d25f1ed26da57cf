//! Multithreaded mutator churn with concurrent collection.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::channel;

use midden::{make_gc_with, GarbageCollector, GcPtr, GcVec};

struct Chain {
    payload: String,
    next: GcPtr<Chain>,
}

/// Builds a linked chain of `depth + 1` allocations, allocating recursively
/// inside the initializers.
fn build_chain(depth: usize) -> GcPtr<Chain> {
    make_gc_with(|| Chain {
        payload: "link".into(),
        next: if depth == 0 {
            GcPtr::new()
        } else {
            build_chain(depth - 1)
        },
    })
}

#[test]
fn handles_move_across_threads() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let chain = build_chain(2);
    assert_eq!(gc.alive_allocation_count(), 3);

    std::thread::spawn(move || {
        assert_eq!(chain.payload, "link");
        assert!(!chain.next.is_null());
        drop(chain);
    })
    .join()
    .expect("worker thread panicked");

    assert_eq!(gc.collect_garbage(), 3);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn churn_from_many_threads_drains_to_zero() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();
    assert_eq!(gc.alive_allocation_count(), 0);

    const WORKERS: usize = 4;
    const ITERATIONS: usize = 60;
    const DEPTH: usize = 4;

    let active = AtomicUsize::new(WORKERS);
    let freed_during_run = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..WORKERS {
            scope.spawn(|| {
                let chains: GcVec<Chain> = GcVec::new();
                for iteration in 0..ITERATIONS {
                    chains.push_back(build_chain(DEPTH));
                    // Periodically abandon everything built so far, creating
                    // garbage while the collector thread is running.
                    if iteration % 16 == 15 {
                        chains.clear();
                    }
                }
                chains.clear();
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        scope.spawn(|| {
            while active.load(Ordering::SeqCst) > 0 {
                freed_during_run.fetch_add(gc.collect_garbage(), Ordering::SeqCst);
                std::thread::yield_now();
            }
        });
    });

    // Every allocation made by every worker is garbage by now; the run and
    // the final drain together must account for all of them.
    let total_allocated = WORKERS * ITERATIONS * (DEPTH + 1);
    let final_drain = gc.collect_garbage();
    assert_eq!(
        freed_during_run.load(Ordering::SeqCst) + final_drain,
        total_allocated
    );
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn container_mutation_is_serialized_against_collection() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();
    assert_eq!(gc.alive_allocation_count(), 0);

    let (stop_tx, stop_rx) = channel::bounded::<()>(1);

    std::thread::scope(|scope| {
        let mutator = scope.spawn(move || {
            let items: GcVec<Chain> = GcVec::new();
            let mut rounds = 0_usize;
            loop {
                items.push_back(build_chain(1));
                if items.len() >= 8 {
                    let popped = items.pop_back();
                    assert!(popped.is_some());
                    items.clear();
                }
                rounds += 1;
                if rounds >= 400 || stop_rx.try_recv().is_ok() {
                    break;
                }
            }
            rounds
        });

        for _ in 0..50 {
            gc.collect_garbage();
            std::thread::sleep(Duration::from_micros(200));
        }
        stop_tx.send(()).ok();

        let rounds = mutator.join().expect("mutator thread panicked");
        assert!(rounds > 0);
    });

    gc.collect_garbage();
    assert_eq!(gc.alive_allocation_count(), 0);
}
