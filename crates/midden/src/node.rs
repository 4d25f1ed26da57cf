//! Node cores shared by GC pointers and GC containers.
//!
//! Every traceable entity in the object graph is a *node*: either a handle
//! (`GcPtr`) or a container (`GcVec`). The public wrapper types are a single
//! pointer-sized word referring to a heap-allocated node core defined here.
//! The indirection is what makes the graph bookkeeping survive Rust moves:
//! wrapper values are moved bitwise all the time, but the core — which the
//! root set, the construction stack and the learned field offsets refer to —
//! never changes address until the wrapper is dropped.

use std::cell::Cell;
use std::sync::atomic::AtomicPtr;

use crate::heap::GcAllocation;

// ============================================================================
// Node identity
// ============================================================================

/// Which kind of node a core belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcNodeKind {
    /// A smart-pointer handle.
    GcPtr,
    /// A container of handles.
    Container,
}

/// Where a node currently sits in the graph bookkeeping.
///
/// `Root` and `Candidate` nodes are registered (in the root set and in a
/// construction frame respectively); `Embedded` nodes are reached only
/// through their owning allocation or container and carry no registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeAttribution {
    /// Registered in the collector's root set.
    Root,
    /// Created while a construction frame was active; resolved when the
    /// frame's value is adopted or the frame pops.
    Candidate,
    /// A field of a GC allocation or an item inside a GC container.
    Embedded,
}

/// Header common to both node cores.
///
/// Attribution is only read and written under the collector lock (or before
/// the node is shared), so a plain `Cell` suffices.
#[repr(C)]
pub(crate) struct GcNodeShared {
    pub(crate) kind: GcNodeKind,
    pub(crate) attribution: Cell<NodeAttribution>,
}

// ============================================================================
// Handle core
// ============================================================================

/// Core of a `GcPtr`: the bound allocation, or null when empty.
///
/// The target pointer is atomic so that unlocked reads (`get`, `Deref`)
/// observe whatever was last stored under the collector lock.
#[repr(C)]
pub(crate) struct GcPtrNode {
    pub(crate) shared: GcNodeShared,
    pub(crate) target: AtomicPtr<GcAllocation>,
}

// ============================================================================
// Container core
// ============================================================================

/// Type-erased callback iterating a container's handle items.
///
/// The collector calls this during marking, with the collector lock held, so
/// implementations may read the container storage without further locking.
pub(crate) type IterateContainerItems =
    unsafe fn(*const GcContainerNode, &mut dyn FnMut(&GcPtrNode));

/// Core prefix of every container node.
///
/// Concrete containers embed this as their first (`#[repr(C)]`) field so the
/// collector can go from a `*const GcContainerNode` to the concrete storage
/// inside the monomorphized iteration callback.
#[repr(C)]
pub(crate) struct GcContainerNode {
    pub(crate) shared: GcNodeShared,
    pub(crate) iterate_items: IterateContainerItems,
}
