//! Process-wide warning and critical-error hooks.
//!
//! The collector never prints or aborts on its own. Anomalies are reported
//! through two settable function pointers: warnings describe recoverable
//! oddities, critical errors describe corruption or misuse the collector
//! cannot continue past. After invoking the critical hook the collector
//! panics, which aborts the offending operation on the calling thread.

use parking_lot::RwLock;

/// Callback invoked when the collector produces a warning.
pub type GcWarningCallback = fn(&str);

/// Callback invoked when the collector hits an irrecoverable error.
///
/// The collector panics right after the callback returns, so a host that
/// wants custom teardown should do it inside the callback (or catch the
/// panic at a thread boundary).
pub type GcCriticalErrorCallback = fn(&str);

struct CallbackSet {
    warning: GcWarningCallback,
    critical: GcCriticalErrorCallback,
}

fn default_warning_callback(_message: &str) {}

fn default_critical_error_callback(_message: &str) {}

static CALLBACKS: RwLock<CallbackSet> = RwLock::new(CallbackSet {
    warning: default_warning_callback,
    critical: default_critical_error_callback,
});

/// Installs custom warning and critical-error callbacks.
///
/// Both default to no-ops. Intended to be called once during host
/// initialization, but replacing the callbacks later is safe.
pub fn set_callbacks(warning: GcWarningCallback, critical: GcCriticalErrorCallback) {
    let mut callbacks = CALLBACKS.write();
    callbacks.warning = warning;
    callbacks.critical = critical;
}

/// Reports a non-fatal anomaly.
pub(crate) fn warning(message: &str) {
    let callback = CALLBACKS.read().warning;
    callback(message);
}

/// Reports an irrecoverable error and panics.
pub(crate) fn critical_error(message: &str) -> ! {
    let callback = CALLBACKS.read().critical;
    callback(message);
    panic!("{message}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static WARNINGS_SEEN: AtomicUsize = AtomicUsize::new(0);

    fn counting_warning(_message: &str) {
        WARNINGS_SEEN.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn installed_warning_callback_receives_reports() {
        set_callbacks(counting_warning, default_critical_error_callback);
        let before = WARNINGS_SEEN.load(Ordering::SeqCst);
        warning("test warning");
        assert_eq!(WARNINGS_SEEN.load(Ordering::SeqCst), before + 1);
        set_callbacks(default_warning_callback, default_critical_error_callback);
    }
}
