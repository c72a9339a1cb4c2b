//! Sable runtime: namespaces, the VM and tree-walking backends, reference
//! types, the stdlib registry, and the external surfaces (nREPL, build
//! artifacts, snapshots)
//!
//! Layering: this crate installs the dispatch vtable that `sable-core` and
//! `sable-compiler` call through, which is what lets value-level code
//! invoke callables and trace compiled fns without upward imports.

pub mod builtins;
pub mod call;
pub mod embed;
pub mod env;
pub mod errors;
pub mod gc_roots;
pub mod interrupt;
pub mod nrepl;
pub mod registry;
pub mod runtime;
pub mod snapshot;
pub mod stm;
pub mod treewalk;
pub mod vm;

pub use call::{Backend, call_value, set_backend};
pub use env::{Environment, Namespace, NsState};
pub use registry::{BuiltinDef, Loading, NamespaceDef};
pub use runtime::{
    dump_bytecode, eval_form, eval_str, format_error, incomplete_input, init, macroexpand_1,
};
