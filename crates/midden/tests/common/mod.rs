//! Shared plumbing for the integration suites.

use parking_lot::{Mutex, MutexGuard};

static GC_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serializes the tests of one binary.
///
/// The collector is process-global, so tests that assert on allocation or
/// root counts must not overlap.
pub fn exclusive() -> MutexGuard<'static, ()> {
    GC_TEST_LOCK.lock()
}
