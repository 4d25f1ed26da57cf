//! The `GcPtr<T>` smart handle and the allocation factories.
//!
//! A handle is either empty or bound to exactly one GC allocation. Handles
//! report their own construction and destruction to the collector, which is
//! how the collector learns the object graph without reflection: a handle
//! constructed outside any GC object joins the root set, while a handle that
//! ends up inside a value adopted by [`make_gc`] becomes a field of that
//! value's type, reached only through its owner during tracing.

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::callbacks;
use crate::construction::ConstructionFrameGuard;
use crate::gc::GarbageCollector;
use crate::heap::{self, GcAllocation};
use crate::node::{GcNodeKind, GcNodeShared, GcPtrNode, NodeAttribution};
use crate::type_info::GcTypeInfo;

const NOT_A_GC_POINTER: &str = "failed to bind a raw pointer: the target was not created by \
     make_gc, or the pointer does not point at the start of a GC object";

// ============================================================================
// GcPtr
// ============================================================================

/// Smart handle to a garbage-collected object.
///
/// Works like a shared pointer, except reclamation is decided by tracing:
/// an object stays alive exactly as long as it is reachable from a root
/// handle or root container, so reference cycles are collected.
///
/// An empty handle binds to nothing and compares equal to other empty
/// handles. Rebinding goes through [`assign`](Self::assign) and takes the
/// collector lock; reading the target does not lock.
///
/// Handles may be moved and sent freely. The one discipline to keep is to
/// rebind embedded handles with `assign` rather than overwriting them
/// wholesale through interior mutability: a root handle moved into GC-owned
/// storage keeps its target conservatively alive until the handle itself is
/// dropped.
pub struct GcPtr<T: 'static> {
    node: NonNull<GcPtrNode>,
    marker: PhantomData<*const T>,
}

// SAFETY: the node core is heap-stable; its target pointer is atomic and all
// graph bookkeeping goes through the collector lock. Access to the pointee
// follows `T`'s own thread-safety, hence the bounds.
unsafe impl<T: Send + Sync + 'static> Send for GcPtr<T> {}
// SAFETY: as above; `&GcPtr<T>` only permits locked rebinds and shared reads.
unsafe impl<T: Send + Sync + 'static> Sync for GcPtr<T> {}

impl<T: 'static> GcPtr<T> {
    fn allocate_node() -> NonNull<GcPtrNode> {
        let node = Box::new(GcPtrNode {
            shared: GcNodeShared {
                kind: GcNodeKind::GcPtr,
                attribution: Cell::new(NodeAttribution::Embedded),
            },
            target: AtomicPtr::new(std::ptr::null_mut()),
        });
        // SAFETY: `Box::into_raw` never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }

    /// Creates an empty handle.
    ///
    /// The handle registers itself with the collector: constructed inside a
    /// running [`make_gc_with`] initializer it becomes a candidate field of
    /// the allocation under construction, otherwise it joins the root set.
    #[must_use]
    pub fn new() -> Self {
        let node = Self::allocate_node();
        GarbageCollector::get().attribute_new_gc_ptr_node(node.as_ptr());
        Self {
            node,
            marker: PhantomData,
        }
    }

    /// Creates an empty container-internal handle.
    ///
    /// Internal handles never join the root set; the owning container alone
    /// traces them.
    pub(crate) fn new_internal() -> Self {
        Self {
            node: Self::allocate_node(),
            marker: PhantomData,
        }
    }

    /// Creates a handle from a raw pointer previously obtained through
    /// [`as_ptr`](Self::as_ptr) on some live handle.
    ///
    /// The pointer is validated against the collector's allocation tables;
    /// a pointer that was not produced by [`make_gc`], or that points
    /// anywhere but the start of a GC object, is a critical error.
    #[must_use]
    pub fn from_raw(target_object: *mut T) -> Self {
        let handle = Self::new();
        handle.assign_raw(target_object);
        handle
    }

    fn node(&self) -> &GcPtrNode {
        // SAFETY: the node core lives until this handle is dropped.
        unsafe { self.node.as_ref() }
    }

    pub(crate) fn node_ptr(&self) -> *const GcPtrNode {
        self.node.as_ptr()
    }

    /// Binds directly to an allocation. Caller holds the collector lock.
    pub(crate) fn bind(&self, allocation: *mut GcAllocation) {
        self.node().target.store(allocation, Ordering::Release);
    }

    /// Internal clone for container storage: same target, never a root.
    pub(crate) fn clone_internal(&self) -> Self {
        let clone = Self::new_internal();
        clone
            .node()
            .target
            .store(self.node().target.load(Ordering::Acquire), Ordering::Release);
        clone
    }

    /// Rebinds this handle to whatever `source` is bound to.
    ///
    /// The source is already validated, so no table lookup is needed; the
    /// collector lock is still taken so a collection never observes a
    /// half-updated graph.
    pub fn assign(&self, source: &GcPtr<T>) {
        let _guard = GarbageCollector::get().lock_graph();
        let target = source.node().target.load(Ordering::Acquire);
        self.node().target.store(target, Ordering::Release);
    }

    /// Rebinds this handle from a raw user-object pointer.
    ///
    /// Passing null empties the handle. Any other pointer must name the
    /// start of a live GC object (see [`from_raw`](Self::from_raw)); on a
    /// validation failure the critical-error callback fires and the handle
    /// is left unchanged.
    pub fn assign_raw(&self, target_object: *mut T) {
        let gc = GarbageCollector::get();
        let _guard = gc.lock_graph();
        if target_object.is_null() {
            self.node().target.store(std::ptr::null_mut(), Ordering::Release);
            return;
        }
        let type_info = GcTypeInfo::of::<T>();
        let Some(header) =
            heap::header_address_for_user_ptr(target_object.cast_const().cast::<u8>(), type_info)
        else {
            callbacks::critical_error(NOT_A_GC_POINTER);
        };
        let Some(allocation) = gc.allocation_for_header(header) else {
            callbacks::critical_error(NOT_A_GC_POINTER);
        };
        self.node().target.store(allocation, Ordering::Release);
    }

    /// Empties the handle.
    pub fn clear(&self) {
        let _guard = GarbageCollector::get().lock_graph();
        self.node().target.store(std::ptr::null_mut(), Ordering::Release);
    }

    /// Raw pointer to the target user object, or null when empty.
    #[must_use]
    pub fn as_ptr(&self) -> *mut T {
        let target = self.node().target.load(Ordering::Acquire);
        if target.is_null() {
            std::ptr::null_mut()
        } else {
            // SAFETY: a bound target is a live, registered allocation; the
            // collector never frees an allocation reachable through a bound
            // handle.
            unsafe { (*target).user_ptr().cast() }
        }
    }

    /// Shared reference to the target, or `None` when empty.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        let object = self.as_ptr();
        if object.is_null() {
            None
        } else {
            // SAFETY: see `as_ptr`.
            Some(unsafe { &*object })
        }
    }

    /// Whether the handle is empty.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.node().target.load(Ordering::Acquire).is_null()
    }
}

impl<T: 'static> Default for GcPtr<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Clone for GcPtr<T> {
    fn clone(&self) -> Self {
        let clone = Self::new();
        clone.assign(self);
        clone
    }
}

impl<T: 'static> Drop for GcPtr<T> {
    fn drop(&mut self) {
        let node = self.node.as_ptr();
        // SAFETY: the node core stays alive until freed below; only the
        // owner of the handle ever changes its attribution.
        let attribution = unsafe { (*node).shared.attribution.get() };
        match attribution {
            NodeAttribution::Root => GarbageCollector::get().on_gc_ptr_root_destroyed(node),
            NodeAttribution::Candidate => {
                GarbageCollector::get().on_gc_ptr_candidate_destroyed(node);
            }
            NodeAttribution::Embedded => {}
        }
        // SAFETY: allocated in `allocate_node`; no registry refers to it
        // anymore.
        drop(unsafe { Box::from_raw(node) });
    }
}

impl<T: 'static> Deref for GcPtr<T> {
    type Target = T;

    /// Dereferences the handle.
    ///
    /// # Panics
    ///
    /// Panics when the handle is empty.
    fn deref(&self) -> &T {
        match self.get() {
            Some(object) => object,
            None => panic!(
                "dereferenced an empty GcPtr<{}>",
                std::any::type_name::<T>()
            ),
        }
    }
}

impl<T: 'static> PartialEq for GcPtr<T> {
    /// Handles are equal when they point at the same user object (or are
    /// both empty).
    fn eq(&self, other: &Self) -> bool {
        self.as_ptr() == other.as_ptr()
    }
}

impl<T: 'static> Eq for GcPtr<T> {}

impl<T: 'static> std::hash::Hash for GcPtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_ptr().hash(state);
    }
}

impl<T: 'static> std::fmt::Debug for GcPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcPtr")
            .field("target", &self.as_ptr())
            .finish()
    }
}

// ============================================================================
// Factories
// ============================================================================

/// Deregisters and frees an allocation whose initializer panicked before
/// the value was adopted.
struct UnadoptedAllocationGuard<'gc> {
    gc: &'gc GarbageCollector,
    allocation: *mut GcAllocation,
    adopted: bool,
}

impl Drop for UnadoptedAllocationGuard<'_> {
    fn drop(&mut self) {
        if self.adopted {
            return;
        }
        self.gc.unregister_allocation(self.allocation);
        // SAFETY: the user object was never constructed in this block.
        unsafe { GcAllocation::discard_unconstructed(self.allocation) };
    }
}

/// Allocates a GC-controlled object and returns a root handle to it.
///
/// The value's embedded handles and containers are discovered during
/// adoption; the first value of each type teaches the collector where those
/// fields live, and later values reuse the learned layout.
///
/// ```
/// use midden::{make_gc, GarbageCollector};
///
/// let number = make_gc(42_u32);
/// assert_eq!(*number, 42);
///
/// drop(number);
/// assert_eq!(GarbageCollector::get().collect_garbage(), 1);
/// ```
pub fn make_gc<T: 'static>(value: T) -> GcPtr<T> {
    make_gc_with(move || value)
}

/// Allocates a GC-controlled object built by `init`, which may itself call
/// the factories recursively.
///
/// The collector lock is held for the whole call, so the initializer runs
/// with collection blocked; handles it creates attach to this allocation
/// (innermost factory first) instead of becoming roots.
pub fn make_gc_with<T: 'static, F: FnOnce() -> T>(init: F) -> GcPtr<T> {
    let gc = GarbageCollector::get();
    let _graph_guard = gc.lock_graph();
    let type_info = GcTypeInfo::of::<T>();
    let allocation = GcAllocation::create(type_info);
    gc.register_allocation(allocation);
    let mut unwind_guard = UnadoptedAllocationGuard {
        gc,
        allocation,
        adopted: false,
    };
    {
        let _frame = ConstructionFrameGuard::new(gc, allocation);
        let value = ManuallyDrop::new(init());
        let value_ptr = std::ptr::addr_of!(value).cast::<u8>();
        // SAFETY: `value` is fully constructed, owned by this frame and not
        // mutated concurrently; the collector lock is held.
        unsafe { gc.adopt_constructed_value(type_info, value_ptr) };
        // SAFETY: the block holds room for exactly one `T`, and the source
        // bits are never touched again (`ManuallyDrop` suppresses the local
        // drop, so ownership transfers to the allocation).
        unsafe {
            std::ptr::copy_nonoverlapping(
                value_ptr,
                (*allocation).user_ptr(),
                std::mem::size_of::<T>(),
            );
        }
        unwind_guard.adopted = true;
    }
    type_info.mark_all_offsets_initialized();

    let handle = GcPtr::<T>::new();
    handle.bind(allocation);
    handle
}
