//! Dispatch vtable: the layering inversion point
//!
//! Low-level code (lazy-seq realization, structural equality over seqs, GC
//! tracing of compiled code) needs to invoke callable values and walk
//! bytecode units, but those concerns live above this crate. The runtime
//! installs concrete function pointers here at startup; everything below
//! references only this table.

use crate::error::SableError;
use crate::value::Value;
use std::any::Any;
use std::sync::OnceLock;

pub struct Vtable {
    /// Invoke any callable value with the given arguments
    pub call: fn(&Value, &[Value]) -> Result<Value, SableError>,
    /// Protocol-dispatch type key for a value (handles `:__reify_type` maps)
    pub type_key: fn(&Value) -> String,
    /// Metadata lookup (mirrors `Value::meta`, present for completeness of
    /// the dispatch record)
    pub get_meta: fn(&Value) -> Option<Value>,
    /// Does this error match a `catch` class name?
    pub exception_matches_class: fn(&SableError, &str) -> bool,
    /// Trace the constants of a compiled fn body (installed by the compiler
    /// layer so the GC can walk bytecode units it cannot name)
    pub trace_fn_proto: fn(&(dyn Any + Send + Sync), &mut dyn FnMut(&Value)),
}

static VTABLE: OnceLock<Vtable> = OnceLock::new();

/// Install the dispatch table. Later installs are ignored (first wins),
/// which keeps repeated runtime initialization idempotent.
pub fn install(vt: Vtable) {
    let _ = VTABLE.set(vt);
}

pub fn installed() -> bool {
    VTABLE.get().is_some()
}

pub fn get() -> Result<&'static Vtable, SableError> {
    VTABLE
        .get()
        .ok_or_else(|| SableError::value_err("runtime dispatch table not installed"))
}

/// Convenience wrapper over the `call` slot
pub fn call_value(f: &Value, args: &[Value]) -> Result<Value, SableError> {
    (get()?.call)(f, args)
}
