//! The garbage collector singleton and the mark-and-sweep cycle.
//!
//! One process-wide [`GarbageCollector`] owns the root sets, the allocation
//! tables, the construction stack and the gray scratch buffer. A single
//! reentrant lock serializes every mutator operation that touches the graph
//! (node construction and destruction, handle rebinds, container mutation,
//! allocation birth) against [`GarbageCollector::collect_garbage`].

use std::cell::RefCell;
use std::sync::LazyLock;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::callbacks;
use crate::construction::ConstructionStack;
use crate::heap::{AllocHeader, GcAllocation, GcColor};
use crate::node::{GcContainerNode, GcNodeKind, GcPtrNode, NodeAttribution};
use crate::trace_log;
use crate::type_info::GcTypeInfo;

// ============================================================================
// Public snapshot of the root set
// ============================================================================

/// Read-only snapshot of the collector's root node set.
///
/// Taken under the collector lock by [`GarbageCollector::root_nodes`]. The
/// addresses are opaque; the snapshot exists so tests and debugging tools
/// can observe how many roots of each kind are registered.
#[derive(Debug, Clone)]
pub struct GcRootNodes {
    /// Addresses of the registered root handles.
    pub gc_ptr_roots: Vec<*const ()>,
    /// Addresses of the registered root containers.
    pub gc_container_roots: Vec<*const ()>,
}

// ============================================================================
// Graph state
// ============================================================================

/// Everything guarded by the collector lock.
pub(crate) struct NodeGraph {
    gc_ptr_roots: FxHashSet<*const GcPtrNode>,
    gc_container_roots: FxHashSet<*const GcContainerNode>,
    /// Every live allocation.
    allocations: FxHashSet<*mut GcAllocation>,
    /// Mirror of `allocations` keyed by header address, for O(1) raw-pointer
    /// validation in handle rebinds.
    header_index: FxHashMap<*const AllocHeader, *mut GcAllocation>,
    /// Reusable scratch buffer for the trace.
    gray: Vec<*mut GcAllocation>,
    /// Set while a collection cycle is running, to catch re-entry from user
    /// destructors during the sweep.
    collecting: bool,
}

// SAFETY: the raw pointers are keys into collector-owned bookkeeping; all
// access goes through the collector lock.
unsafe impl Send for NodeGraph {}

impl NodeGraph {
    fn new() -> Self {
        Self {
            gc_ptr_roots: FxHashSet::default(),
            gc_container_roots: FxHashSet::default(),
            allocations: FxHashSet::default(),
            header_index: FxHashMap::default(),
            gray: Vec::new(),
            collecting: false,
        }
    }
}

/// Resets the `collecting` flag even if a user destructor panics mid-sweep.
struct CollectingFlagReset<'a> {
    graph: &'a RefCell<NodeGraph>,
}

impl Drop for CollectingFlagReset<'_> {
    fn drop(&mut self) {
        self.graph.borrow_mut().collecting = false;
    }
}

// ============================================================================
// The collector
// ============================================================================

static COLLECTOR: LazyLock<GarbageCollector> = LazyLock::new(GarbageCollector::new);

/// Process-wide garbage collector.
///
/// Lazily initialized on first use and alive for the rest of the process,
/// so node and allocation teardown never races collector teardown.
pub struct GarbageCollector {
    /// The single lock serializing all graph work. Reentrant because user
    /// destructors run during the sweep and may create, rebind or drop GC
    /// entities of their own.
    graph: ReentrantMutex<RefCell<NodeGraph>>,
    /// Allocations whose initializers are currently running. Only ever
    /// locked while the graph lock is already held.
    construction: Mutex<ConstructionStack>,
}

impl GarbageCollector {
    fn new() -> Self {
        Self {
            graph: ReentrantMutex::new(RefCell::new(NodeGraph::new())),
            construction: Mutex::new(ConstructionStack::default()),
        }
    }

    /// Returns the collector singleton.
    #[must_use]
    pub fn get() -> &'static GarbageCollector {
        &COLLECTOR
    }

    /// Acquires the collector lock for the current thread.
    pub(crate) fn lock_graph(&self) -> ReentrantMutexGuard<'_, RefCell<NodeGraph>> {
        self.graph.lock()
    }

    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    /// Runs a full stop-the-world collection cycle.
    ///
    /// Paints every allocation white, traces reachability from the root set
    /// (and from allocations still under construction), then frees every
    /// allocation that stayed white. Returns the number of user objects
    /// freed.
    ///
    /// Blocks while another thread holds the collector lock. Calling this
    /// from a destructor that is itself running inside a sweep is reported
    /// through the warning callback and returns 0.
    pub fn collect_garbage(&self) -> usize {
        let graph_cell = self.graph.lock();
        {
            let mut graph = graph_cell.borrow_mut();
            if graph.collecting {
                callbacks::warning(
                    "collect_garbage called while a collection is already running; ignoring",
                );
                return 0;
            }
            graph.collecting = true;
        }
        let _reset = CollectingFlagReset { graph: &graph_cell };
        let _span = trace_log::collection_span();

        // Clear: repaint the world white and seed the gray queue from the
        // root set.
        trace_log::log_phase(trace_log::GcPhase::Clear);
        let mut gray = {
            let mut graph = graph_cell.borrow_mut();
            for &allocation in &graph.allocations {
                // SAFETY: registered allocations are alive.
                unsafe { (*allocation).set_color(GcColor::White) };
            }
            let mut gray = std::mem::take(&mut graph.gray);
            gray.clear();
            for &node in &graph.gc_ptr_roots {
                // SAFETY: root nodes stay registered for as long as they live.
                unsafe { mark_handle_target(node, &mut gray) };
            }
            for &container in &graph.gc_container_roots {
                // SAFETY: as above.
                unsafe { mark_container_items(container, &mut gray) };
            }
            gray
        };

        // Allocations whose initializers are still on the stack, and the
        // nodes those initializers created, are reachable by definition.
        // In-flight allocations are blackened directly rather than traced:
        // their user memory is not fully constructed yet, and every edge
        // their initializer has produced so far is covered by the frame's
        // candidate nodes.
        {
            let stack = self.construction.lock();
            for frame in stack.frames() {
                // SAFETY: a framed allocation is registered and alive.
                unsafe { (*frame.allocation).set_color(GcColor::Black) };
                for &node in &frame.gc_ptr_candidates {
                    // SAFETY: candidates are live until resolved or dropped.
                    unsafe { mark_handle_target(node, &mut gray) };
                }
                for &container in &frame.gc_container_candidates {
                    // SAFETY: as above.
                    unsafe { mark_container_items(container, &mut gray) };
                }
            }
        }

        // Mark: drain the gray queue to a fixed point, tracing through the
        // learned field offsets of each reached allocation.
        trace_log::log_phase(trace_log::GcPhase::Mark);
        while let Some(allocation) = gray.pop() {
            // SAFETY: only registered (live) allocations enter the queue.
            let allocation = unsafe { &*allocation };
            if allocation.color() == GcColor::Black {
                continue;
            }
            allocation.set_color(GcColor::Black);
            let user = allocation.user_ptr().cast_const();
            allocation.type_info().with_offsets(|offsets| {
                for &offset in &offsets.gc_ptr_offsets {
                    // SAFETY: the learned offset points at an embedded
                    // handle word inside the live user object.
                    let node = unsafe { user.add(offset as usize).cast::<*const GcPtrNode>().read() };
                    if !node.is_null() {
                        // SAFETY: embedded nodes live as long as their owner.
                        unsafe { mark_handle_target(node, &mut gray) };
                    }
                }
                for &offset in &offsets.gc_container_offsets {
                    // SAFETY: as above, for an embedded container word.
                    let container =
                        unsafe { user.add(offset as usize).cast::<*const GcContainerNode>().read() };
                    if !container.is_null() {
                        // SAFETY: embedded nodes live as long as their owner.
                        unsafe { mark_container_items(container, &mut gray) };
                    }
                }
            });
        }

        // Sweep: deregister every still-white allocation first, then run
        // destructors with no graph borrow outstanding so they may re-enter
        // the (reentrant) collector lock freely.
        trace_log::log_phase(trace_log::GcPhase::Sweep);
        let white = {
            let mut graph = graph_cell.borrow_mut();
            let white: Vec<*mut GcAllocation> = graph
                .allocations
                .iter()
                .copied()
                // SAFETY: registered allocations are alive.
                .filter(|&allocation| unsafe { (*allocation).color() } == GcColor::White)
                .collect();
            for &allocation in &white {
                graph.allocations.remove(&allocation);
                // SAFETY: still alive; destroyed below.
                let header = unsafe { (*allocation).header_ptr() };
                if graph.header_index.remove(&header).is_none() {
                    callbacks::critical_error(
                        "allocation missing from the header index during sweep",
                    );
                }
            }
            white
        };
        for &allocation in &white {
            // SAFETY: deregistered above and unreachable from the graph;
            // this is the only place that frees swept allocations.
            unsafe { GcAllocation::destroy(allocation) };
        }

        let freed = white.len();
        {
            let mut graph = graph_cell.borrow_mut();
            graph.gray = gray;
            trace_log::log_collection_end(freed, graph.allocations.len());
        }
        freed
    }

    /// Number of currently live GC allocations.
    #[must_use]
    pub fn alive_allocation_count(&self) -> usize {
        let graph = self.graph.lock();
        let count = graph.borrow().allocations.len();
        count
    }

    /// Snapshot of the root node set, for tests and debugging.
    #[must_use]
    pub fn root_nodes(&self) -> GcRootNodes {
        let graph = self.graph.lock();
        let graph = graph.borrow();
        GcRootNodes {
            gc_ptr_roots: graph.gc_ptr_roots.iter().map(|&node| node.cast()).collect(),
            gc_container_roots: graph
                .gc_container_roots
                .iter()
                .map(|&node| node.cast())
                .collect(),
        }
    }

    /// Returns the per-type record for `T`.
    #[must_use]
    pub fn type_info_of<T: 'static>(&self) -> &'static GcTypeInfo {
        GcTypeInfo::of::<T>()
    }

    // ------------------------------------------------------------------
    // Node attribution
    // ------------------------------------------------------------------

    /// Decides whether a freshly constructed handle is a root or a
    /// candidate of the innermost construction frame, and registers it.
    pub(crate) fn attribute_new_gc_ptr_node(&self, node: *const GcPtrNode) {
        let graph = self.graph.lock();
        let mut stack = self.construction.lock();
        let attribution = if let Some(frame) = stack.top_mut() {
            frame.gc_ptr_candidates.insert(node);
            NodeAttribution::Candidate
        } else {
            graph.borrow_mut().gc_ptr_roots.insert(node);
            NodeAttribution::Root
        };
        // SAFETY: the node was just constructed by the caller and is alive.
        unsafe { (*node).shared.attribution.set(attribution) };
    }

    /// Container counterpart of [`Self::attribute_new_gc_ptr_node`].
    pub(crate) fn attribute_new_container_node(&self, node: *const GcContainerNode) {
        let graph = self.graph.lock();
        let mut stack = self.construction.lock();
        let attribution = if let Some(frame) = stack.top_mut() {
            frame.gc_container_candidates.insert(node);
            NodeAttribution::Candidate
        } else {
            graph.borrow_mut().gc_container_roots.insert(node);
            NodeAttribution::Root
        };
        // SAFETY: as in `attribute_new_gc_ptr_node`.
        unsafe { (*node).shared.attribution.set(attribution) };
    }

    /// Removes a dying root handle from the root set.
    pub(crate) fn on_gc_ptr_root_destroyed(&self, node: *const GcPtrNode) {
        let graph = self.graph.lock();
        if !graph.borrow_mut().gc_ptr_roots.remove(&node) {
            callbacks::critical_error(
                "destroyed root GC pointer was not registered in the root set",
            );
        }
    }

    /// Removes a dying root container from the root set.
    pub(crate) fn on_gc_container_root_destroyed(&self, node: *const GcContainerNode) {
        let graph = self.graph.lock();
        if !graph.borrow_mut().gc_container_roots.remove(&node) {
            callbacks::critical_error(
                "destroyed root GC container was not registered in the root set",
            );
        }
    }

    /// Removes a dying candidate handle from its construction frame.
    pub(crate) fn on_gc_ptr_candidate_destroyed(&self, node: *const GcPtrNode) {
        let _graph = self.graph.lock();
        if !self.construction.lock().remove_gc_ptr_candidate(node) {
            callbacks::critical_error(
                "destroyed candidate GC pointer was not found on the construction stack",
            );
        }
    }

    /// Removes a dying candidate container from its construction frame.
    pub(crate) fn on_gc_container_candidate_destroyed(&self, node: *const GcContainerNode) {
        let _graph = self.graph.lock();
        if !self.construction.lock().remove_gc_container_candidate(node) {
            callbacks::critical_error(
                "destroyed candidate GC container was not found on the construction stack",
            );
        }
    }

    /// Turns a root or candidate handle into an embedded one.
    ///
    /// Used when a handle is adopted into a GC object or pushed into a GC
    /// container.
    pub(crate) fn demote_gc_ptr_node(&self, node: *const GcPtrNode) {
        let graph = self.graph.lock();
        // SAFETY: the caller owns the handle, so the node is alive.
        debug_assert_eq!(unsafe { (*node).shared.kind }, GcNodeKind::GcPtr);
        // SAFETY: as above.
        let attribution = unsafe { (*node).shared.attribution.get() };
        let removed = match attribution {
            NodeAttribution::Root => graph.borrow_mut().gc_ptr_roots.remove(&node),
            NodeAttribution::Candidate => self.construction.lock().remove_gc_ptr_candidate(node),
            NodeAttribution::Embedded => {
                callbacks::critical_error("embedded GC pointer demoted a second time")
            }
        };
        if !removed {
            callbacks::critical_error("demoted GC pointer was not registered where expected");
        }
        // SAFETY: as above.
        unsafe { (*node).shared.attribution.set(NodeAttribution::Embedded) };
    }

    /// Re-registers a handle leaving GC container storage as a root.
    pub(crate) fn promote_gc_ptr_node_to_root(&self, node: *const GcPtrNode) {
        let graph = self.graph.lock();
        graph.borrow_mut().gc_ptr_roots.insert(node);
        // SAFETY: the caller owns the handle, so the node is alive.
        unsafe { (*node).shared.attribution.set(NodeAttribution::Root) };
    }

    // ------------------------------------------------------------------
    // Allocation tables
    // ------------------------------------------------------------------

    /// Enters a freshly created allocation into both tables.
    pub(crate) fn register_allocation(&self, allocation: *mut GcAllocation) {
        let graph = self.graph.lock();
        let mut graph = graph.borrow_mut();
        // SAFETY: just created by the caller.
        let header = unsafe { (*allocation).header_ptr() };
        graph.allocations.insert(allocation);
        graph.header_index.insert(header, allocation);
    }

    /// Removes an allocation from both tables (factory unwind path).
    pub(crate) fn unregister_allocation(&self, allocation: *mut GcAllocation) {
        let graph = self.graph.lock();
        let mut graph = graph.borrow_mut();
        graph.allocations.remove(&allocation);
        // SAFETY: still alive; the caller frees it right after.
        let header = unsafe { (*allocation).header_ptr() };
        graph.header_index.remove(&header);
    }

    /// Looks up the allocation owning `header`, if any.
    ///
    /// Callers that act on the result must hold the collector lock across
    /// both the lookup and the action.
    pub(crate) fn allocation_for_header(
        &self,
        header: *const AllocHeader,
    ) -> Option<*mut GcAllocation> {
        let graph = self.graph.lock();
        let allocation = graph.borrow().header_index.get(&header).copied();
        allocation
    }

    // ------------------------------------------------------------------
    // Construction stack plumbing
    // ------------------------------------------------------------------

    pub(crate) fn push_construction_frame(&self, allocation: *mut GcAllocation) {
        let _graph = self.graph.lock();
        self.construction.lock().push(allocation);
    }

    /// Pops a construction frame and resolves its leftover candidates:
    /// nodes the initializer created that did not end up inside the adopted
    /// value cascade to the parent frame, or become roots when the stack is
    /// empty.
    pub(crate) fn finish_construction_frame(&self, allocation: *mut GcAllocation) {
        let graph = self.graph.lock();
        let mut stack = self.construction.lock();
        let frame = stack.pop_expecting(allocation);
        if let Some(frame) = stack.cascade(frame) {
            let mut graph = graph.borrow_mut();
            for node in frame.gc_ptr_candidates {
                graph.gc_ptr_roots.insert(node);
                // SAFETY: candidates are live until resolved or dropped.
                unsafe { (*node).shared.attribution.set(NodeAttribution::Root) };
            }
            for node in frame.gc_container_candidates {
                graph.gc_container_roots.insert(node);
                // SAFETY: as above.
                unsafe { (*node).shared.attribution.set(NodeAttribution::Root) };
            }
        }
    }

    // ------------------------------------------------------------------
    // Value adoption
    // ------------------------------------------------------------------

    /// Claims a handle node found inside an adopted value, wherever it is
    /// currently registered. Returns `false` if the word is not a known
    /// handle node.
    fn try_claim_gc_ptr_node(&self, node: *const GcPtrNode) -> bool {
        if self.construction.lock().remove_gc_ptr_candidate(node) {
            // SAFETY: candidates are live; the adopting thread owns the value.
            unsafe { (*node).shared.attribution.set(NodeAttribution::Embedded) };
            return true;
        }
        let graph = self.graph.lock();
        if graph.borrow_mut().gc_ptr_roots.remove(&node) {
            // SAFETY: as above.
            unsafe { (*node).shared.attribution.set(NodeAttribution::Embedded) };
            return true;
        }
        false
    }

    /// Container counterpart of [`Self::try_claim_gc_ptr_node`].
    fn try_claim_gc_container_node(&self, node: *const GcContainerNode) -> bool {
        if self.construction.lock().remove_gc_container_candidate(node) {
            // SAFETY: candidates are live; the adopting thread owns the value.
            unsafe { (*node).shared.attribution.set(NodeAttribution::Embedded) };
            return true;
        }
        let graph = self.graph.lock();
        if graph.borrow_mut().gc_container_roots.remove(&node) {
            // SAFETY: as above.
            unsafe { (*node).shared.attribution.set(NodeAttribution::Embedded) };
            return true;
        }
        false
    }

    /// Attributes the node fields of a fully constructed value that is
    /// about to move into its allocation.
    ///
    /// The first value of a type is scanned word-by-word: every word that
    /// names a registered handle or container node is an embedded node
    /// field, so its offset is recorded in the type record and the node is
    /// demoted out of the root set (or its construction frame). Later values
    /// reuse the learned offsets directly.
    ///
    /// # Safety
    ///
    /// `value_ptr` must point to a live, fully constructed value of the type
    /// described by `type_info`, owned by the caller and not concurrently
    /// mutated. The caller must hold the collector lock.
    pub(crate) unsafe fn adopt_constructed_value(
        &self,
        type_info: &'static GcTypeInfo,
        value_ptr: *const u8,
    ) {
        if type_info.all_field_offsets_initialized() {
            type_info.with_offsets(|offsets| {
                for &offset in &offsets.gc_ptr_offsets {
                    // SAFETY: the type's layout fixes a handle word at every
                    // learned offset.
                    let node =
                        unsafe { value_ptr.add(offset as usize).cast::<*const GcPtrNode>().read() };
                    if node.is_null() {
                        continue;
                    }
                    if !self.try_claim_gc_ptr_node(node) {
                        callbacks::critical_error(
                            "embedded handle of a constructed value is not a registered node",
                        );
                    }
                }
                for &offset in &offsets.gc_container_offsets {
                    // SAFETY: as above, for a container word.
                    let node = unsafe {
                        value_ptr
                            .add(offset as usize)
                            .cast::<*const GcContainerNode>()
                            .read()
                    };
                    if node.is_null() {
                        continue;
                    }
                    if !self.try_claim_gc_container_node(node) {
                        callbacks::critical_error(
                            "embedded container of a constructed value is not a registered node",
                        );
                    }
                }
            });
            return;
        }

        // First value of this type: learn the offsets by scanning. Node
        // words are pointer-aligned, so a type whose alignment is below a
        // pointer's cannot embed nodes at all.
        let word_size = std::mem::size_of::<usize>();
        if type_info.value_align() < word_size || type_info.type_size() < word_size {
            return;
        }
        let word_count = type_info.type_size() / word_size;
        for index in 0..word_count {
            // SAFETY: in-bounds, aligned read of the caller-owned value.
            // Words that are padding or unrelated data simply fail the
            // registry membership tests below.
            let word = unsafe { value_ptr.cast::<usize>().add(index).read() };
            if word == 0 {
                continue;
            }
            let offset = index * word_size;
            if self.try_claim_gc_ptr_node(word as *const GcPtrNode) {
                type_info.register_node_offset(offset, GcNodeKind::GcPtr);
            } else if self.try_claim_gc_container_node(word as *const GcContainerNode) {
                type_info.register_node_offset(offset, GcNodeKind::Container);
            }
        }
    }
}

// ============================================================================
// Marking helpers
// ============================================================================

/// Enqueues a handle's target if it is bound and still white.
///
/// # Safety
///
/// `node` must point to a live handle node.
unsafe fn mark_handle_target(node: *const GcPtrNode, gray: &mut Vec<*mut GcAllocation>) {
    // SAFETY: guaranteed by the caller.
    let target = unsafe { (*node).target.load(std::sync::atomic::Ordering::Acquire) };
    if target.is_null() {
        return;
    }
    // SAFETY: a bound target is a registered, live allocation.
    if unsafe { (*target).color() } == GcColor::White {
        gray.push(target);
    }
}

/// Enqueues the white targets of every handle a container holds.
///
/// # Safety
///
/// `container` must point to a live container node, and the collector lock
/// must be held (the iteration callback reads the container storage).
unsafe fn mark_container_items(
    container: *const GcContainerNode,
    gray: &mut Vec<*mut GcAllocation>,
) {
    let mut visit = |item: &GcPtrNode| {
        let target = item.target.load(std::sync::atomic::Ordering::Acquire);
        if target.is_null() {
            return;
        }
        // SAFETY: a bound target is a registered, live allocation.
        if unsafe { (*target).color() } == GcColor::White {
            gray.push(target);
        }
    };
    // SAFETY: guaranteed by the caller.
    unsafe { ((*container).iterate_items)(container, &mut visit) };
}
