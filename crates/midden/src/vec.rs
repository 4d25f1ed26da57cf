//! `GcVec<T>`: a growable container of GC handles.
//!
//! A `GcVec` is a single node in the object graph. The handles it stores are
//! *internal*: they never join the root set, because the container itself is
//! traced (as a root, or as a field of a GC object) and iterates its items
//! for the collector on demand. Handles entering the container are demoted
//! out of the root set; handles leaving it by value are promoted back.
//!
//! Structural mutations take the collector lock: the collector may be
//! iterating the storage during a trace, and growing or relocating the
//! backing buffer under it would be a use-after-free. Reads that do not
//! reshape the storage stay lock-free, which is sound because `GcVec` is
//! deliberately not `Sync`.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::gc::GarbageCollector;
use crate::node::{GcContainerNode, GcNodeKind, GcNodeShared, GcPtrNode, NodeAttribution};
use crate::ptr::GcPtr;

// ============================================================================
// Container node
// ============================================================================

#[repr(C)]
struct GcVecNode<T: 'static> {
    base: GcContainerNode,
    items: UnsafeCell<Vec<GcPtr<T>>>,
}

/// Iteration callback handed to the collector; monomorphized per item type.
///
/// # Safety
///
/// `container` must be the base of a live `GcVecNode<T>`, and the collector
/// lock must be held so the storage cannot be reshaped mid-iteration.
unsafe fn iterate_gc_vec_items<T: 'static>(
    container: *const GcContainerNode,
    visit: &mut dyn FnMut(&GcPtrNode),
) {
    let node = container.cast::<GcVecNode<T>>();
    // SAFETY: guaranteed by the caller.
    let items = unsafe { &*(*node).items.get() };
    for item in items {
        // SAFETY: item handles are alive while the container is.
        visit(unsafe { &*item.node_ptr() });
    }
}

// ============================================================================
// GcVec
// ============================================================================

/// Growable, GC-aware vector of `GcPtr<T>` handles.
///
/// Participates in tracing as one node whose children are the targets of the
/// stored handles. Element access hands out cloned handles (which are roots
/// in their own right), never references into the storage.
///
/// Containers hold handles only — a `GcVec` never directly contains another
/// container. A container *of handles to* GC-allocated containers is fine.
pub struct GcVec<T: 'static> {
    node: NonNull<GcVecNode<T>>,
    marker: PhantomData<*const T>,
}

// SAFETY: all shared graph state is behind the collector lock and item
// access follows `T`'s thread-safety. `GcVec` is deliberately `!Sync`: that
// is what makes its unlocked shape reads (`len`, `capacity`) race-free.
unsafe impl<T: Send + Sync + 'static> Send for GcVec<T> {}

impl<T: 'static> GcVec<T> {
    /// Creates an empty container, registering it with the collector the
    /// same way a handle registers itself (root, or candidate field of the
    /// allocation under construction).
    #[must_use]
    pub fn new() -> Self {
        let node = Box::new(GcVecNode {
            base: GcContainerNode {
                shared: GcNodeShared {
                    kind: GcNodeKind::Container,
                    attribution: Cell::new(NodeAttribution::Embedded),
                },
                iterate_items: iterate_gc_vec_items::<T>,
            },
            items: UnsafeCell::new(Vec::new()),
        });
        // SAFETY: `Box::into_raw` never returns null.
        let node = unsafe { NonNull::new_unchecked(Box::into_raw(node)) };
        GarbageCollector::get().attribute_new_container_node(node.cast::<GcContainerNode>().as_ptr());
        Self {
            node,
            marker: PhantomData,
        }
    }

    /// Creates an empty container with room for `capacity` handles.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let vec = Self::new();
        vec.reserve(capacity);
        vec
    }

    fn vec_node(&self) -> &GcVecNode<T> {
        // SAFETY: the node lives until this wrapper is dropped.
        unsafe { self.node.as_ref() }
    }

    fn container_ptr(&self) -> *const GcContainerNode {
        std::ptr::addr_of!(self.vec_node().base)
    }

    fn items(&self) -> &Vec<GcPtr<T>> {
        // SAFETY: shared read. The only writers are this wrapper's own
        // methods (same thread, `GcVec` is `!Sync`); the collector only
        // reads.
        unsafe { &*self.vec_node().items.get() }
    }

    /// # Safety
    ///
    /// The collector lock must be held, and no reference obtained from
    /// [`Self::items`] may be live.
    #[allow(clippy::mut_from_ref)]
    unsafe fn items_mut(&self) -> &mut Vec<GcPtr<T>> {
        // SAFETY: guaranteed by the caller.
        unsafe { &mut *self.vec_node().items.get() }
    }

    /// Appends a handle. The handle becomes container-internal and leaves
    /// the root set.
    pub fn push_back(&self, item: GcPtr<T>) {
        let gc = GarbageCollector::get();
        let _guard = gc.lock_graph();
        gc.demote_gc_ptr_node(item.node_ptr());
        // SAFETY: lock held; element access never leaks storage references.
        unsafe { self.items_mut() }.push(item);
    }

    /// Removes and returns the last handle, promoting it back to a root.
    pub fn pop_back(&self) -> Option<GcPtr<T>> {
        let gc = GarbageCollector::get();
        let _guard = gc.lock_graph();
        // SAFETY: as in `push_back`.
        let item = unsafe { self.items_mut() }.pop()?;
        gc.promote_gc_ptr_node_to_root(item.node_ptr());
        Some(item)
    }

    /// Inserts a handle at `index`, shifting later items right.
    ///
    /// # Panics
    ///
    /// Panics when `index > len()`.
    pub fn insert(&self, index: usize, item: GcPtr<T>) {
        let gc = GarbageCollector::get();
        let _guard = gc.lock_graph();
        gc.demote_gc_ptr_node(item.node_ptr());
        // SAFETY: as in `push_back`.
        unsafe { self.items_mut() }.insert(index, item);
    }

    /// Removes and returns the handle at `index`, promoting it to a root.
    ///
    /// # Panics
    ///
    /// Panics when `index >= len()`.
    pub fn remove(&self, index: usize) -> GcPtr<T> {
        let gc = GarbageCollector::get();
        let _guard = gc.lock_graph();
        // SAFETY: as in `push_back`.
        let item = unsafe { self.items_mut() }.remove(index);
        gc.promote_gc_ptr_node_to_root(item.node_ptr());
        item
    }

    /// A handle to the item at `index`, or `None` out of bounds.
    ///
    /// The returned handle is a clone bound to the same object.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<GcPtr<T>> {
        self.items().get(index).cloned()
    }

    /// A handle to the first item.
    #[must_use]
    pub fn front(&self) -> Option<GcPtr<T>> {
        self.items().first().cloned()
    }

    /// A handle to the last item.
    #[must_use]
    pub fn back(&self) -> Option<GcPtr<T>> {
        self.items().last().cloned()
    }

    /// Iterates over clones of the stored handles.
    ///
    /// The iterator owns a snapshot, so the container may be mutated while
    /// iterating.
    pub fn iter(&self) -> std::vec::IntoIter<GcPtr<T>> {
        self.items()
            .iter()
            .map(GcPtr::clone)
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Number of stored handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items().len()
    }

    /// Whether the container is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Number of handles the current storage can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.items().capacity()
    }

    /// Drops every stored handle.
    pub fn clear(&self) {
        let _guard = GarbageCollector::get().lock_graph();
        // SAFETY: as in `push_back`. Dropped items are internal handles and
        // touch no root bookkeeping.
        unsafe { self.items_mut() }.clear();
    }

    /// Reserves storage for at least `additional` more handles.
    pub fn reserve(&self, additional: usize) {
        let _guard = GarbageCollector::get().lock_graph();
        // SAFETY: as in `push_back`.
        unsafe { self.items_mut() }.reserve(additional);
    }

    /// Frees unused storage.
    pub fn shrink_to_fit(&self) {
        let _guard = GarbageCollector::get().lock_graph();
        // SAFETY: as in `push_back`.
        unsafe { self.items_mut() }.shrink_to_fit();
    }

    /// Resizes to `new_len`, filling with empty internal handles.
    pub fn resize(&self, new_len: usize) {
        let _guard = GarbageCollector::get().lock_graph();
        // SAFETY: as in `push_back`.
        let items = unsafe { self.items_mut() };
        if new_len <= items.len() {
            items.truncate(new_len);
        } else {
            items.resize_with(new_len, GcPtr::new_internal);
        }
    }
}

impl<T: 'static> Default for GcVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Clone for GcVec<T> {
    /// Clones the container: a new node holding internal handles bound to
    /// the same objects.
    fn clone(&self) -> Self {
        let clone = Self::new();
        let _guard = GarbageCollector::get().lock_graph();
        let items = self.items();
        // SAFETY: lock held; `clone` is not shared yet.
        let clone_items = unsafe { clone.items_mut() };
        clone_items.reserve(items.len());
        for item in items {
            clone_items.push(item.clone_internal());
        }
        clone
    }
}

impl<T: 'static> PartialEq for GcVec<T> {
    /// Containers are equal when they hold handles to the same objects in
    /// the same order.
    fn eq(&self, other: &Self) -> bool {
        let ours = self.items();
        let theirs = other.items();
        ours.len() == theirs.len() && ours.iter().zip(theirs).all(|(a, b)| a == b)
    }
}

impl<T: 'static> Eq for GcVec<T> {}

impl<'a, T: 'static> IntoIterator for &'a GcVec<T> {
    type Item = GcPtr<T>;
    type IntoIter = std::vec::IntoIter<GcPtr<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: 'static> std::fmt::Debug for GcVec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcVec").field("len", &self.len()).finish()
    }
}

impl<T: 'static> Drop for GcVec<T> {
    fn drop(&mut self) {
        let gc = GarbageCollector::get();
        // The lock guarantees no trace is iterating this container while it
        // is torn down.
        let _guard = gc.lock_graph();
        let node = self.container_ptr();
        // SAFETY: the node lives until freed below; only the owner changes
        // its attribution.
        let attribution = unsafe { (*node).shared.attribution.get() };
        match attribution {
            NodeAttribution::Root => gc.on_gc_container_root_destroyed(node),
            NodeAttribution::Candidate => gc.on_gc_container_candidate_destroyed(node),
            NodeAttribution::Embedded => {}
        }
        // SAFETY: allocated in `new`; nothing refers to it anymore. The
        // dropped item handles are internal and touch no root bookkeeping.
        drop(unsafe { Box::from_raw(self.node.as_ptr()) });
    }
}
