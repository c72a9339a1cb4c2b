//! Shutdown flag consulted by the VM loop at safe points
//!
//! SIGINT/SIGTERM set the flag; the interpreter observes it between
//! instructions and unwinds with an `interrupted` error.

use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static HANDLER_INIT: Once = Once::new();

/// Install the SIGINT/SIGTERM handlers. Idempotent.
pub fn install() {
    HANDLER_INIT.call_once(|| {
        #[cfg(unix)]
        {
            for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
                unsafe {
                    let _ = signal_hook::low_level::register(sig, || {
                        INTERRUPTED.store(true, Ordering::Release);
                    });
                }
            }
        }
    });
}

pub fn requested() -> bool {
    INTERRUPTED.load(Ordering::Acquire)
}

/// Observe and clear the flag; true if an interrupt was pending
pub fn take() -> bool {
    INTERRUPTED.swap(false, Ordering::AcqRel)
}

/// Used by tests and the REPL to simulate or dismiss an interrupt
pub fn set(flag: bool) {
    INTERRUPTED.store(flag, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_take_clears_flag() {
        set(true);
        assert!(requested());
        assert!(take());
        assert!(!requested());
        assert!(!take());
    }
}
