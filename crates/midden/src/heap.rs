//! Allocation layout and lifetime.
//!
//! Every GC-controlled object lives in one raw block laid out as
//! `[AllocHeader | padding | user object]`. Given a raw user-object pointer
//! of a known type, subtracting the type's user offset lands exactly on the
//! header, which is the key into the collector's header index — this is what
//! makes raw-pointer validation O(1).

use std::ptr::NonNull;

use crate::callbacks;
use crate::type_info::GcTypeInfo;

// ============================================================================
// Header
// ============================================================================

/// Mark color of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcColor {
    /// Not (yet) proven reachable in the current collection.
    White,
    /// Proven reachable; survives the sweep.
    Black,
}

/// Metadata prefixed to every GC allocation.
#[repr(C)]
pub(crate) struct AllocHeader {
    pub(crate) color: GcColor,
    pub(crate) type_info: &'static GcTypeInfo,
}

// ============================================================================
// Allocation
// ============================================================================

/// Owner of one GC-controlled block.
///
/// Boxed so its address is stable; handles bind to the `GcAllocation`
/// address rather than to the block itself. Registered in the collector's
/// allocation tables for as long as it exists. The type record is read back
/// from the header, which stays valid for the life of the block.
pub(crate) struct GcAllocation {
    memory: NonNull<u8>,
}

impl GcAllocation {
    /// Allocates the raw block and the owner.
    ///
    /// The header is written with color white. The caller is responsible for
    /// registering the returned owner in the collector tables and, later,
    /// for constructing the user object in place. A host-allocator failure
    /// is a critical error.
    pub(crate) fn create(type_info: &'static GcTypeInfo) -> *mut GcAllocation {
        let layout = type_info.alloc_layout();
        // SAFETY: the layout always includes the header, so its size is
        // never zero.
        let raw = unsafe { std::alloc::alloc(layout) };
        let Some(memory) = NonNull::new(raw) else {
            callbacks::critical_error("failed to allocate memory for a new GC controlled object");
        };
        // SAFETY: the block starts with space for the header and is aligned
        // for it.
        unsafe {
            memory.as_ptr().cast::<AllocHeader>().write(AllocHeader {
                color: GcColor::White,
                type_info,
            });
        }
        Box::into_raw(Box::new(GcAllocation { memory }))
    }

    pub(crate) fn type_info(&self) -> &'static GcTypeInfo {
        // SAFETY: the header lives at the start of the block for the
        // lifetime of this owner.
        unsafe { (*self.memory.as_ptr().cast::<AllocHeader>()).type_info }
    }

    /// Pointer to the header at the start of the block.
    pub(crate) fn header_ptr(&self) -> *const AllocHeader {
        self.memory.as_ptr().cast()
    }

    /// Pointer to the user object inside the block.
    pub(crate) fn user_ptr(&self) -> *mut u8 {
        // SAFETY: the block is at least `user_offset + type_size` bytes.
        unsafe { self.memory.as_ptr().add(self.type_info().user_offset()) }
    }

    pub(crate) fn color(&self) -> GcColor {
        // SAFETY: the header lives at the start of the block for the
        // lifetime of this owner.
        unsafe { (*self.memory.as_ptr().cast::<AllocHeader>()).color }
    }

    /// Repaints the allocation. Only called under the collector lock.
    pub(crate) fn set_color(&self, color: GcColor) {
        // SAFETY: as in `color`; the collector lock serializes writers.
        unsafe { (*self.memory.as_ptr().cast::<AllocHeader>()).color = color };
    }

    /// Runs the user destructor and frees the block and the owner.
    ///
    /// Only the sweep phase (and the factory's unwind path via
    /// [`Self::discard_unconstructed`]) ever frees allocations.
    ///
    /// # Safety
    ///
    /// `allocation` must have been returned by [`Self::create`], hold a
    /// fully constructed user object, and be deregistered from the collector
    /// tables. It must not be used afterwards.
    pub(crate) unsafe fn destroy(allocation: *mut GcAllocation) {
        // SAFETY: guaranteed by the caller.
        let allocation = unsafe { Box::from_raw(allocation) };
        let type_info = allocation.type_info();
        // SAFETY: the user object is fully constructed and dies here. Its
        // destructor may touch its own embedded handles; those nodes are
        // still alive until the destructor returns.
        unsafe { (type_info.invoke_destructor())(allocation.user_ptr()) };
        // SAFETY: the block was allocated with this exact layout.
        unsafe { std::alloc::dealloc(allocation.memory.as_ptr(), type_info.alloc_layout()) };
    }

    /// Frees a block whose user object was never constructed.
    ///
    /// Used when a factory initializer panics before the value is adopted.
    ///
    /// # Safety
    ///
    /// As for [`Self::destroy`], except the user-object region is treated as
    /// uninitialized and no destructor runs.
    pub(crate) unsafe fn discard_unconstructed(allocation: *mut GcAllocation) {
        // SAFETY: guaranteed by the caller.
        let allocation = unsafe { Box::from_raw(allocation) };
        let layout = allocation.type_info().alloc_layout();
        // SAFETY: the block was allocated with this exact layout.
        unsafe { std::alloc::dealloc(allocation.memory.as_ptr(), layout) };
    }
}

/// Would-be header address for a raw user pointer of a known type.
///
/// Returns `None` when the subtraction underflows, which means the pointer
/// cannot possibly point into a GC block.
pub(crate) fn header_address_for_user_ptr(
    user_ptr: *const u8,
    type_info: &'static GcTypeInfo,
) -> Option<*const AllocHeader> {
    (user_ptr as usize)
        .checked_sub(type_info.user_offset())
        .map(|address| address as *const AllocHeader)
}
