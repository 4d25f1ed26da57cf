//! Handle behavior: comparison, raw pointers, moves, destructors and the
//! error callbacks.

mod common;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use midden::{make_gc, set_callbacks, GarbageCollector, GcPtr};

static WARNING_HITS: AtomicUsize = AtomicUsize::new(0);
static CRITICAL_HITS: AtomicUsize = AtomicUsize::new(0);

fn recording_warning(_message: &str) {
    WARNING_HITS.fetch_add(1, Ordering::SeqCst);
}

fn recording_critical(_message: &str) {
    CRITICAL_HITS.fetch_add(1, Ordering::SeqCst);
}

fn quiet(_message: &str) {}

/// Runs `operation` expecting it to trip the critical-error callback.
fn expect_critical_error(operation: impl FnOnce()) {
    set_callbacks(quiet, recording_critical);
    let before = CRITICAL_HITS.load(Ordering::SeqCst);
    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));
    let result = catch_unwind(AssertUnwindSafe(operation));
    std::panic::set_hook(previous_hook);
    set_callbacks(quiet, quiet);
    assert!(result.is_err(), "operation should have panicked");
    assert_eq!(CRITICAL_HITS.load(Ordering::SeqCst), before + 1);
}

struct Foo {
    value: u64,
    inner: GcPtr<Foo>,
}

fn new_foo(value: u64) -> Foo {
    Foo {
        value,
        inner: GcPtr::new(),
    }
}

#[test]
fn handle_comparison_follows_the_target() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let a = make_gc(new_foo(1));
    let b = make_gc(new_foo(2));
    let alias = a.clone();

    assert_eq!(a, alias);
    assert_ne!(a, b);
    assert_eq!(a.value, 1);
    assert_eq!(alias.value, 1);

    let empty_one: GcPtr<Foo> = GcPtr::new();
    let empty_two: GcPtr<Foo> = GcPtr::new();
    assert_eq!(empty_one, empty_two);
    assert_ne!(empty_one, a);
    assert!(empty_one.is_null());
    assert!(empty_one.get().is_none());

    drop((a, b, alias, empty_one, empty_two));
    assert_eq!(gc.collect_garbage(), 2);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn raw_pointer_round_trip_binds_the_same_allocation() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();
    {
        let foo = make_gc(new_foo(7));
        let rebound = GcPtr::from_raw(foo.as_ptr());
        assert_eq!(rebound, foo);
        assert_eq!(rebound.value, 7);
        assert_eq!(gc.root_nodes().gc_ptr_roots.len(), 2);

        // The second root keeps the object alive on its own.
        drop(foo);
        assert_eq!(gc.collect_garbage(), 0);
        assert_eq!(rebound.value, 7);
    }
    assert_eq!(gc.collect_garbage(), 1);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn assigning_null_empties_the_handle() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let foo = make_gc(new_foo(3));
    foo.inner.assign(&foo);
    foo.inner.assign_raw(std::ptr::null_mut());
    assert!(foo.inner.is_null());

    drop(foo);
    assert_eq!(gc.collect_garbage(), 1);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn moving_handles_does_not_leak_or_dangle() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    fn produce() -> GcPtr<Foo> {
        make_gc(new_foo(11))
    }

    let moved = produce();
    let stored = vec![moved];
    let boxed = Box::new(stored);
    assert_eq!(boxed[0].value, 11);
    assert_eq!(gc.root_nodes().gc_ptr_roots.len(), 1);

    drop(boxed);
    assert_eq!(gc.root_nodes().gc_ptr_roots.len(), 0);
    assert_eq!(gc.collect_garbage(), 1);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn plain_heap_pointer_is_rejected() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let raw = Box::into_raw(Box::new(new_foo(0)));
    expect_critical_error(|| {
        let _handle = GcPtr::from_raw(raw);
    });

    // SAFETY: `raw` came from Box::into_raw above and was never freed.
    drop(unsafe { Box::from_raw(raw) });
    assert_eq!(gc.collect_garbage(), 0);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[repr(C)]
struct Part {
    value: u64,
}

#[repr(C)]
struct Wrapper {
    leading: Part,
    trailing: Part,
}

#[test]
fn interior_pointer_is_rejected() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let wrapper = make_gc(Wrapper {
        leading: Part { value: 1 },
        trailing: Part { value: 2 },
    });
    let wrapper_ref: &Wrapper = wrapper.get().unwrap();
    let trailing = std::ptr::addr_of!(wrapper_ref.trailing).cast_mut();

    expect_critical_error(|| {
        let _handle = GcPtr::<Part>::from_raw(trailing);
    });

    drop(wrapper);
    assert_eq!(gc.collect_garbage(), 1);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn pointer_to_leading_field_binds_the_whole_object() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let wrapper = make_gc(Wrapper {
        leading: Part { value: 5 },
        trailing: Part { value: 6 },
    });
    let wrapper_ref: &Wrapper = wrapper.get().unwrap();
    let leading = std::ptr::addr_of!(wrapper_ref.leading).cast_mut();

    let part = GcPtr::<Part>::from_raw(leading);
    assert_eq!(part.as_ptr().cast::<Wrapper>(), wrapper.as_ptr());
    assert_eq!(part.value, 5);

    // The leading-field handle keeps the whole object alive.
    drop(wrapper);
    assert_eq!(gc.collect_garbage(), 0);
    assert_eq!(part.value, 5);

    drop(part);
    assert_eq!(gc.collect_garbage(), 1);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn sweep_runs_the_destructor() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();
    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Tracked {
        _value: u64,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    let before = DROPS.load(Ordering::SeqCst);
    {
        let _a = make_gc(Tracked { _value: 1 });
        let _b = make_gc(Tracked { _value: 2 });
        assert_eq!(DROPS.load(Ordering::SeqCst), before);
    }
    assert_eq!(DROPS.load(Ordering::SeqCst), before);
    assert_eq!(gc.collect_garbage(), 2);
    assert_eq!(DROPS.load(Ordering::SeqCst), before + 2);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn reentrant_collection_from_a_destructor_warns_and_does_nothing() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    struct CollectsInDrop;

    impl Drop for CollectsInDrop {
        fn drop(&mut self) {
            // The outer collection is still sweeping; this must be refused.
            assert_eq!(GarbageCollector::get().collect_garbage(), 0);
        }
    }

    set_callbacks(recording_warning, quiet);
    let before = WARNING_HITS.load(Ordering::SeqCst);

    drop(make_gc(CollectsInDrop));
    assert_eq!(gc.collect_garbage(), 1);

    assert_eq!(WARNING_HITS.load(Ordering::SeqCst), before + 1);
    set_callbacks(quiet, quiet);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn panicking_initializer_unwinds_cleanly() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));
    let result = catch_unwind(|| {
        let _handle = midden::make_gc_with(|| -> Foo {
            let _partial = GcPtr::<Foo>::new();
            panic!("constructor failure");
        });
    });
    std::panic::set_hook(previous_hook);

    assert!(result.is_err());
    assert_eq!(gc.alive_allocation_count(), 0);
    assert_eq!(gc.root_nodes().gc_ptr_roots.len(), 0);
    assert_eq!(gc.collect_garbage(), 0);
}

#[test]
fn unit_sized_objects_are_collected() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let a = make_gc(());
    let b = make_gc(());
    assert_ne!(a, b);
    drop((a, b));
    assert_eq!(gc.collect_garbage(), 2);
    assert_eq!(gc.alive_allocation_count(), 0);
}
