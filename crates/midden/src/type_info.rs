//! Per-type records learned at first construction.
//!
//! The collector has no reflection: it discovers where the handle and
//! container fields of a user type live by observing the first construction
//! of that type (see the adoption scan in `gc.rs`). The observed byte
//! offsets are memoized here, one record per user type for the lifetime of
//! the process.

use std::alloc::Layout;
use std::any::TypeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::callbacks;
use crate::heap::AllocHeader;
use crate::node::GcNodeKind;

/// Offset (in bytes) from the start of a user object to an embedded node.
pub type GcNodeFieldOffset = u32;

/// Learned offsets to the node fields of a user type.
#[derive(Debug, Default)]
pub(crate) struct GcNodeFieldOffsets {
    /// Offsets of directly embedded handle fields, including those that sit
    /// inside nested plain-struct fields.
    pub(crate) gc_ptr_offsets: Vec<GcNodeFieldOffset>,
    /// Offsets of directly embedded container fields.
    pub(crate) gc_container_offsets: Vec<GcNodeFieldOffset>,
}

/// Information about one GC-controlled user type.
///
/// Obtained through [`GcTypeInfo::of`]; records are leaked into statics so
/// every pointer to one stays valid for the process lifetime.
pub struct GcTypeInfo {
    type_name: &'static str,
    type_size: usize,
    value_align: usize,
    /// Combined layout of `[AllocHeader | padding | T]`.
    alloc_layout: Layout,
    /// Byte offset of the user object inside the combined block.
    user_offset: usize,
    invoke_destructor: unsafe fn(*mut u8),
    offsets: Mutex<GcNodeFieldOffsets>,
    all_offsets_initialized: AtomicBool,
}

/// Runs `T`'s destructor on a raw user-object pointer.
///
/// # Safety
///
/// `object` must point to a fully constructed `T` that is not used again.
unsafe fn invoke_destructor<T>(object: *mut u8) {
    // SAFETY: guaranteed by the caller.
    unsafe { std::ptr::drop_in_place(object.cast::<T>()) };
}

static REGISTRY: LazyLock<Mutex<FxHashMap<TypeId, &'static GcTypeInfo>>> =
    LazyLock::new(|| Mutex::new(FxHashMap::default()));

impl GcTypeInfo {
    /// Returns the process-global record for `T`, creating it on first use.
    pub fn of<T: 'static>() -> &'static GcTypeInfo {
        let mut registry = REGISTRY.lock();
        *registry.entry(TypeId::of::<T>()).or_insert_with(|| {
            let Ok((alloc_layout, user_offset)) =
                Layout::new::<AllocHeader>().extend(Layout::new::<T>())
            else {
                callbacks::critical_error("combined GC allocation layout overflows");
            };
            Box::leak(Box::new(GcTypeInfo {
                type_name: std::any::type_name::<T>(),
                type_size: std::mem::size_of::<T>(),
                value_align: std::mem::align_of::<T>(),
                alloc_layout: alloc_layout.pad_to_align(),
                user_offset,
                invoke_destructor: invoke_destructor::<T>,
                offsets: Mutex::new(GcNodeFieldOffsets::default()),
                all_offsets_initialized: AtomicBool::new(false),
            }))
        })
    }

    /// Name of the user type, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Size of the user type in bytes.
    #[must_use]
    pub fn type_size(&self) -> usize {
        self.type_size
    }

    /// Offsets from the user object's start to each embedded handle field.
    ///
    /// Complete once [`Self::all_field_offsets_initialized`] returns `true`.
    #[must_use]
    pub fn gc_ptr_field_offsets(&self) -> Vec<GcNodeFieldOffset> {
        self.offsets.lock().gc_ptr_offsets.clone()
    }

    /// Offsets from the user object's start to each embedded container field.
    #[must_use]
    pub fn gc_container_field_offsets(&self) -> Vec<GcNodeFieldOffset> {
        self.offsets.lock().gc_container_offsets.clone()
    }

    /// Whether the offset lists are frozen.
    ///
    /// Set once, right after the first value of the type has been fully
    /// constructed and adopted by the collector.
    #[must_use]
    pub fn all_field_offsets_initialized(&self) -> bool {
        self.all_offsets_initialized.load(Ordering::Acquire)
    }

    pub(crate) fn value_align(&self) -> usize {
        self.value_align
    }

    pub(crate) fn alloc_layout(&self) -> Layout {
        self.alloc_layout
    }

    pub(crate) fn user_offset(&self) -> usize {
        self.user_offset
    }

    pub(crate) fn invoke_destructor(&self) -> unsafe fn(*mut u8) {
        self.invoke_destructor
    }

    /// Records the offset of a node field observed during adoption.
    ///
    /// No-op once the lists are frozen (later instances of the type place
    /// their fields at the same offsets by layout).
    pub(crate) fn register_node_offset(&self, offset: usize, kind: GcNodeKind) {
        if self.all_field_offsets_initialized() {
            return;
        }
        let Ok(offset) = GcNodeFieldOffset::try_from(offset) else {
            callbacks::critical_error("embedded node field offset does not fit the offset type");
        };
        let mut offsets = self.offsets.lock();
        match kind {
            GcNodeKind::GcPtr => offsets.gc_ptr_offsets.push(offset),
            GcNodeKind::Container => offsets.gc_container_offsets.push(offset),
        }
    }

    /// Freezes the offset lists. Idempotent.
    pub(crate) fn mark_all_offsets_initialized(&self) {
        self.all_offsets_initialized.store(true, Ordering::Release);
    }

    /// Runs `reader` with the offset lists locked.
    pub(crate) fn with_offsets<R>(&self, reader: impl FnOnce(&GcNodeFieldOffsets) -> R) -> R {
        reader(&self.offsets.lock())
    }
}

impl std::fmt::Debug for GcTypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcTypeInfo")
            .field("type_name", &self.type_name)
            .field("type_size", &self.type_size)
            .field(
                "all_offsets_initialized",
                &self.all_field_offsets_initialized(),
            )
            .finish_non_exhaustive()
    }
}

/// Returns the per-type record for `T`.
///
/// Free-function form of [`GcTypeInfo::of`], mainly for tests inspecting the
/// learned field offsets.
#[must_use]
pub fn type_info_of<T: 'static>() -> &'static GcTypeInfo {
    GcTypeInfo::of::<T>()
}
