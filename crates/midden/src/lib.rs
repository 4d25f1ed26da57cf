//! A small, embeddable mark-and-sweep garbage collector.
//!
//! `midden` provides a smart handle [`GcPtr<T>`] and a handle container
//! [`GcVec<T>`] for building arbitrary object graphs — cycles included —
//! in programs that otherwise manage memory manually. Unreachable objects
//! are reclaimed on demand by an explicit
//! [`collect_garbage`](GarbageCollector::collect_garbage) call; there is no
//! background thread and no pause that you did not ask for.
//!
//! # How it works
//!
//! Handles and containers report their own construction to the collector.
//! A handle living on the stack (or inside any non-GC object) becomes a
//! *root*; a handle that is a field of a GC-allocated value is discovered
//! when the first value of its type is adopted by [`make_gc`], which
//! teaches the collector the field layout of that type once and for all.
//! Collection is classical stop-the-world mark-and-sweep over the root set,
//! so reference cycles are collected naturally — there is no reference
//! counting to defeat.
//!
//! # Quick start
//!
//! ```
//! use midden::{make_gc, GarbageCollector, GcPtr};
//!
//! struct Node {
//!     name: String,
//!     next: GcPtr<Node>,
//! }
//!
//! let a = make_gc(Node { name: "a".into(), next: GcPtr::new() });
//! let b = make_gc(Node { name: "b".into(), next: GcPtr::new() });
//!
//! // Build a cycle: a -> b -> a.
//! a.next.assign(&b);
//! b.next.assign(&a);
//! assert_eq!(a.next.next.name, "a");
//!
//! drop(a);
//! drop(b);
//!
//! // Both nodes are unreachable despite the cycle.
//! assert_eq!(GarbageCollector::get().collect_garbage(), 2);
//! assert_eq!(GarbageCollector::get().alive_allocation_count(), 0);
//! ```
//!
//! # Threading
//!
//! Mutator threads share one process-wide collector. Creating, rebinding
//! and dropping GC entities, mutating containers, and collecting all
//! serialize on a single reentrant lock; collection runs on whichever
//! thread calls it. Reading a bound handle does not lock.
//!
//! # Errors
//!
//! The collector reports anomalies through two process-wide hooks
//! installed with [`set_callbacks`]: warnings for recoverable oddities and
//! critical errors (followed by a panic) for misuse such as binding a
//! handle to a pointer that `make_gc` never produced.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod callbacks;
mod construction;
mod gc;
mod heap;
mod node;
mod ptr;
mod trace_log;
mod type_info;
mod vec;

pub use callbacks::{set_callbacks, GcCriticalErrorCallback, GcWarningCallback};
pub use gc::{GarbageCollector, GcRootNodes};
pub use ptr::{make_gc, make_gc_with, GcPtr};
pub use type_info::{type_info_of, GcNodeFieldOffset, GcTypeInfo};
pub use vec::GcVec;
