//! Native builtin functions, one domain per module
//!
//! Each module contributes rows to the stdlib registration table. Macro
//! builtins receive unevaluated forms; everything else receives values.

pub mod arith;
pub mod coll;
pub mod io;
pub mod macros;
pub mod proto_ops;
pub mod refs_ops;
pub mod regex_ops;
pub mod seq_ops;
pub mod set_ops;
pub mod str_ops;
pub mod test_ops;

use crate::registry::{BuiltinDef, Loading, NamespaceDef};
use sable_core::error::SableError;
use sable_core::value::Value;

/// Shorthand for one registry row
macro_rules! b {
    ($name:literal, $f:path, $arglists:literal, $doc:literal) => {
        $crate::registry::BuiltinDef {
            name: $name,
            f: $f,
            doc: $doc,
            arglists: $arglists,
            added: "0.1",
        }
    };
}
pub(crate) use b;

// -- argument helpers --------------------------------------------------------

pub fn check_exact(name: &str, args: &[Value], n: usize) -> Result<(), SableError> {
    if args.len() != n {
        return Err(SableError::arity(name, args.len()));
    }
    Ok(())
}

pub fn check_range(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), SableError> {
    if args.len() < min || args.len() > max {
        return Err(SableError::arity(name, args.len()));
    }
    Ok(())
}

pub fn check_min(name: &str, args: &[Value], min: usize) -> Result<(), SableError> {
    if args.len() < min {
        return Err(SableError::arity(name, args.len()));
    }
    Ok(())
}

pub fn int_arg(name: &str, args: &[Value], idx: usize) -> Result<i64, SableError> {
    match args.get(idx) {
        Some(Value::Int(n)) => Ok(*n),
        Some(other) => Err(SableError::type_err(format!(
            "{} expects an integer, got {}",
            name,
            other.type_name()
        ))),
        None => Err(SableError::arity(name, args.len())),
    }
}

pub fn str_arg<'a>(name: &str, args: &'a [Value], idx: usize) -> Result<&'a str, SableError> {
    match args.get(idx) {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(SableError::type_err(format!(
            "{} expects a string, got {}",
            name,
            other.type_name()
        ))),
        None => Err(SableError::arity(name, args.len())),
    }
}

// -- namespace assembly ------------------------------------------------------

/// Core namespace: native fns, native macros, dynamic vars, and the
/// embedded lazy-sequence library (compiled through the normal pipeline)
pub fn core_namespace() -> NamespaceDef {
    let mut builtins: Vec<BuiltinDef> = Vec::new();
    builtins.extend(arith::builtins());
    builtins.extend(coll::builtins());
    builtins.extend(seq_ops::builtins());
    builtins.extend(str_ops::core_builtins());
    builtins.extend(io::builtins());
    builtins.extend(refs_ops::builtins());
    builtins.extend(proto_ops::builtins());
    builtins.extend(regex_ops::builtins());

    NamespaceDef {
        name: "sable.core",
        doc: "The core library: collections, seqs, reference types, and evaluation.",
        builtins,
        macro_builtins: macros::macro_builtins(),
        dynamic_vars: vec![
            ("*print-readably*", Value::Bool(true)),
            ("*assert*", Value::Bool(true)),
            ("*command-line-args*", Value::Nil),
        ],
        constant_vars: vec![
            ("*sable-version*", Value::string(env!("CARGO_PKG_VERSION"))),
        ],
        embedded_source: Some(include_str!("core.sbl")),
        loading: Loading::EagerEval,
        // unquote forms outside syntax-quote resolve to unbound vars, so
        // they fail at deref with a useful name instead of at resolution
        post_register: Some(|env| {
            let core = env.find_or_create_ns("sable.core");
            core.intern("unquote");
            core.intern("unquote-splicing");
            Ok(())
        }),
    }
}

pub fn string_namespace() -> NamespaceDef {
    NamespaceDef {
        name: "sable.string",
        doc: "String manipulation.",
        builtins: str_ops::string_ns_builtins(),
        macro_builtins: vec![],
        dynamic_vars: vec![],
        constant_vars: vec![],
        embedded_source: None,
        loading: Loading::Eager,
        post_register: None,
    }
}

pub fn set_namespace() -> NamespaceDef {
    NamespaceDef {
        name: "sable.set",
        doc: "Set algebra over persistent sets.",
        builtins: set_ops::builtins(),
        macro_builtins: vec![],
        dynamic_vars: vec![],
        constant_vars: vec![],
        embedded_source: None,
        loading: Loading::Eager,
        post_register: None,
    }
}

pub fn test_namespace() -> NamespaceDef {
    NamespaceDef {
        name: "sable.test",
        doc: "Minimal test framework: deftest registration and assertions.",
        builtins: test_ops::builtins(),
        macro_builtins: test_ops::macro_builtins(),
        dynamic_vars: vec![],
        constant_vars: vec![],
        embedded_source: None,
        loading: Loading::Eager,
        post_register: None,
    }
}

/// Small utility namespace, deliberately lazy: materialized on first
/// require, with its whole body in embedded source
pub fn walk_namespace() -> NamespaceDef {
    NamespaceDef {
        name: "sable.walk",
        doc: "Tree traversal over nested collections.",
        builtins: vec![],
        macro_builtins: vec![],
        dynamic_vars: vec![],
        constant_vars: vec![],
        embedded_source: Some(include_str!("walk.sbl")),
        loading: Loading::Lazy,
        post_register: None,
    }
}
