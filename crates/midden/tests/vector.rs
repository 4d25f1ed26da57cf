//! `GcVec` behavior: root transitions of its items, container root
//! attribution, mutation under tracing, and the element API.

mod common;

use midden::{make_gc, GarbageCollector, GcPtr, GcVec};

struct Foo {
    tag: u64,
    inner: GcPtr<Foo>,
}

fn new_foo(tag: u64) -> Foo {
    Foo {
        tag,
        inner: GcPtr::new(),
    }
}

#[test]
fn stored_elements_are_not_roots() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let items: GcVec<Foo> = GcVec::new();
    items.push_back(make_gc(new_foo(1)));
    items.push_back(make_gc(new_foo(2)));

    let roots = gc.root_nodes();
    assert_eq!(roots.gc_container_roots.len(), 1);
    assert_eq!(roots.gc_ptr_roots.len(), 0);
    assert_eq!(gc.alive_allocation_count(), 2);
    assert_eq!(gc.collect_garbage(), 0);

    // Popping promotes the handle back to a root.
    let popped = items.pop_back().expect("two items were pushed");
    assert_eq!(popped.tag, 2);
    assert_eq!(gc.root_nodes().gc_ptr_roots.len(), 1);
    assert!(popped.inner.is_null());

    drop(items);
    assert_eq!(gc.collect_garbage(), 1);
    assert_eq!(gc.alive_allocation_count(), 1);

    drop(popped);
    assert_eq!(gc.collect_garbage(), 1);
    assert_eq!(gc.alive_allocation_count(), 0);
}

struct Tree {
    tag: u64,
    children: GcVec<Tree>,
}

fn new_tree(tag: u64) -> Tree {
    Tree {
        tag,
        children: GcVec::new(),
    }
}

#[test]
fn vector_field_of_a_gc_object_is_not_a_root() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let root = make_gc(new_tree(0));
    for tag in 1..=3 {
        root.children.push_back(make_gc(new_tree(tag)));
    }
    assert_eq!(gc.alive_allocation_count(), 4);

    let roots = gc.root_nodes();
    assert_eq!(roots.gc_ptr_roots.len(), 1);
    assert_eq!(roots.gc_container_roots.len(), 0);
    assert_eq!(gc.collect_garbage(), 0);

    // The container field was learned from the first Tree instance.
    let type_info = midden::type_info_of::<Tree>();
    assert_eq!(type_info.gc_container_field_offsets().len(), 1);
    assert_eq!(type_info.gc_ptr_field_offsets().len(), 0);

    let middle = root.children.remove(1);
    assert_eq!(middle.tag, 2);
    assert_eq!(root.children.len(), 2);
    drop(middle);
    assert_eq!(gc.collect_garbage(), 1);

    drop(root);
    assert_eq!(gc.collect_garbage(), 3);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn vector_in_a_non_gc_object_is_a_root() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    struct Holder {
        items: GcVec<Foo>,
    }

    let holder = Box::new(Holder {
        items: GcVec::new(),
    });
    assert_eq!(gc.root_nodes().gc_container_roots.len(), 1);

    holder.items.push_back(make_gc(new_foo(9)));
    assert_eq!(gc.collect_garbage(), 0);
    assert_eq!(gc.alive_allocation_count(), 1);

    drop(holder);
    assert_eq!(gc.root_nodes().gc_container_roots.len(), 0);
    assert_eq!(gc.collect_garbage(), 1);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn cloned_vector_shares_targets() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let original: GcVec<Foo> = GcVec::new();
    original.push_back(make_gc(new_foo(1)));
    original.push_back(make_gc(new_foo(2)));

    let copy = original.clone();
    assert_eq!(original, copy);
    assert_eq!(copy.len(), 2);
    assert_eq!(copy.get(0), original.get(0));
    assert_eq!(gc.root_nodes().gc_container_roots.len(), 2);

    original.clear();
    assert_ne!(original, copy);
    // The clone still keeps both objects alive.
    assert_eq!(gc.collect_garbage(), 0);
    assert_eq!(gc.alive_allocation_count(), 2);

    copy.clear();
    assert_eq!(original, copy);
    assert_eq!(gc.collect_garbage(), 2);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn element_api_behaves_like_a_vector() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let items: GcVec<Foo> = GcVec::new();
    assert!(items.is_empty());
    assert!(items.front().is_none());
    assert!(items.back().is_none());
    assert!(items.get(0).is_none());

    items.reserve(8);
    assert!(items.capacity() >= 8);

    for tag in [1_u64, 3, 4] {
        items.push_back(make_gc(new_foo(tag)));
    }
    items.insert(1, make_gc(new_foo(2)));

    assert_eq!(items.len(), 4);
    assert_eq!(items.front().expect("not empty").tag, 1);
    assert_eq!(items.back().expect("not empty").tag, 4);
    let tags: Vec<u64> = items.iter().map(|handle| handle.tag).collect();
    assert_eq!(tags, vec![1, 2, 3, 4]);

    // Growing fills with empty internal handles; none of them are roots.
    items.resize(6);
    assert_eq!(items.len(), 6);
    assert!(items.get(5).expect("resized to six").is_null());
    assert_eq!(gc.root_nodes().gc_ptr_roots.len(), 0);
    assert_eq!(gc.collect_garbage(), 0);

    items.resize(2);
    assert_eq!(items.len(), 2);
    items.shrink_to_fit();
    assert_eq!(gc.collect_garbage(), 2);

    drop(items);
    assert_eq!(gc.collect_garbage(), 2);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn equality_is_by_target_sequence() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();

    let a = make_gc(new_foo(1));
    let b = make_gc(new_foo(2));

    let forward: GcVec<Foo> = GcVec::new();
    forward.push_back(a.clone());
    forward.push_back(b.clone());

    let reversed: GcVec<Foo> = GcVec::new();
    reversed.push_back(b.clone());
    reversed.push_back(a.clone());

    assert_ne!(forward, reversed);
    assert_eq!(forward, forward.clone());

    drop((a, b, forward, reversed));
    assert_eq!(gc.collect_garbage(), 2);
    assert_eq!(gc.alive_allocation_count(), 0);
}

#[test]
fn cycle_through_two_container_fields_is_collected() {
    let _lock = common::exclusive();
    let gc = GarbageCollector::get();
    {
        let left = make_gc(new_tree(1));
        let right = make_gc(new_tree(2));
        left.children.push_back(right.clone());
        right.children.push_back(left.clone());
        assert_eq!(gc.collect_garbage(), 0);
        assert_eq!(gc.alive_allocation_count(), 2);
    }
    assert_eq!(gc.collect_garbage(), 2);
    assert_eq!(gc.alive_allocation_count(), 0);
}
