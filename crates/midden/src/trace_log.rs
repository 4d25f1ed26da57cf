//! Collection logging support.
//!
//! When the `tracing` feature is enabled, every collection cycle runs inside
//! a `gc_collect` debug span and emits phase events, so a host subscriber
//! can correlate pauses with its own activity. Without the feature all of
//! this compiles to nothing.

/// High-level collection phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcPhase {
    /// Repaint every allocation white and seed the gray queue.
    Clear,
    /// Trace the live object graph.
    Mark,
    /// Reclaim unreachable allocations.
    Sweep,
}

#[cfg(feature = "tracing")]
mod enabled {
    use super::GcPhase;
    use tracing::{span, Level};

    pub(crate) fn collection_span() -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect").entered()
    }

    pub(crate) fn log_phase(phase: GcPhase) {
        tracing::debug!(phase = ?phase, "phase_start");
    }

    pub(crate) fn log_collection_end(objects_freed: usize, objects_alive: usize) {
        tracing::debug!(objects_freed, objects_alive, "collection_end");
    }
}

#[cfg(not(feature = "tracing"))]
mod enabled {
    use super::GcPhase;

    pub(crate) fn collection_span() {}

    pub(crate) fn log_phase(_phase: GcPhase) {}

    pub(crate) fn log_collection_end(_objects_freed: usize, _objects_alive: usize) {}
}

pub(crate) use enabled::{collection_span, log_collection_end, log_phase};
