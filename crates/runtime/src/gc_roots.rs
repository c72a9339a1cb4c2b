//! Root scanning glue between the runtime and the collector
//!
//! Global roots (namespace var tables, tagged readers) register once with
//! the heap; per-thread roots (dynamic bindings, the current transaction,
//! the in-flight exception) are folded in by the collecting VM alongside
//! its own frames.

use sable_core::gc;
use sable_core::value::Value;
use std::sync::Once;

static ROOTS_INIT: Once = Once::new();

/// Register the process-wide root providers. Idempotent.
pub fn register_global_roots() {
    ROOTS_INIT.call_once(|| {
        gc::heap().register_roots(
            "namespaces",
            Box::new(|visit| crate::env::global().each_root_value(visit)),
        );
    });
}

/// Roots owned by the calling thread
pub fn visit_thread_roots(visit: &mut dyn FnMut(&Value)) {
    sable_core::refs::bindings::each_bound_value(visit);
    crate::stm::trace_current_tx(visit);
    crate::vm::trace_pending(visit);
}
