//! Standard-library registration table
//!
//! Every standard namespace registers one [`NamespaceDef`]: native fns,
//! native macros, dynamic and constant vars, optionally embedded source
//! compiled through the normal pipeline, and a post-register hook. The
//! runtime walks the table at startup, materializing eager entries
//! immediately and parking lazy ones until first require.

use crate::env::{Environment, NsState};
use sable_core::error::SableError;
use sable_core::fns::{BuiltinFn, NativeFn};
use sable_core::value::Value;
use std::sync::Arc;

#[derive(Clone, Copy)]
pub struct BuiltinDef {
    pub name: &'static str,
    pub f: NativeFn,
    pub doc: &'static str,
    pub arglists: &'static str,
    pub added: &'static str,
}

/// How eagerly a namespace materializes at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loading {
    /// Bind builtins at startup
    Eager,
    /// Bind builtins and evaluate embedded source at startup
    EagerEval,
    /// Defer everything until first require
    Lazy,
}

pub struct NamespaceDef {
    pub name: &'static str,
    pub doc: &'static str,
    pub builtins: Vec<BuiltinDef>,
    pub macro_builtins: Vec<BuiltinDef>,
    pub dynamic_vars: Vec<(&'static str, Value)>,
    pub constant_vars: Vec<(&'static str, Value)>,
    pub embedded_source: Option<&'static str>,
    pub loading: Loading,
    pub post_register: Option<fn(&Environment) -> Result<(), SableError>>,
}

/// The full registry, in registration order (core first)
pub fn all() -> Vec<NamespaceDef> {
    vec![
        crate::builtins::core_namespace(),
        crate::builtins::string_namespace(),
        crate::builtins::set_namespace(),
        crate::builtins::test_namespace(),
        crate::builtins::walk_namespace(),
    ]
}

/// Find a builtin fn by qualified name (snapshot restore)
pub fn builtin_by_name(ns: &str, name: &str) -> Option<BuiltinDef> {
    all().into_iter().find(|def| def.name == ns).and_then(|def| {
        def.builtins
            .iter()
            .chain(def.macro_builtins.iter())
            .find(|b| b.name == name)
            .copied()
    })
}

/// Bind a namespace definition's vars into the environment. Embedded
/// source evaluation is the caller's job (it needs the eval pipeline).
pub fn materialize(env: &Environment, def: &NamespaceDef) -> Result<(), SableError> {
    let ns = env.find_or_create_ns(def.name);
    ns.set_state(NsState::Loading);
    if !def.doc.is_empty() {
        *ns.doc.write().expect("ns poisoned") = Some(def.doc.to_string());
    }

    for b in &def.builtins {
        let var_value = ns.intern(b.name);
        if let Value::Var(var) = &var_value {
            var.bind_root(builtin_value(b, false));
            var.set_meta(Some(doc_meta(b)));
        }
    }
    for b in &def.macro_builtins {
        let var_value = ns.intern(b.name);
        if let Value::Var(var) = &var_value {
            var.bind_root(builtin_value(b, true));
            var.set_macro(true);
            var.set_meta(Some(doc_meta(b)));
        }
    }
    for (name, default) in &def.dynamic_vars {
        let var_value = ns.intern(name);
        if let Value::Var(var) = &var_value {
            var.set_dynamic(true);
            var.bind_root(default.clone());
        }
    }
    for (name, value) in &def.constant_vars {
        let var_value = ns.intern(name);
        if let Value::Var(var) = &var_value {
            var.bind_root(value.clone());
        }
    }
    if let Some(post) = def.post_register {
        post(env)?;
    }
    Ok(())
}

fn builtin_value(def: &BuiltinDef, is_macro: bool) -> Value {
    sable_core::gc::alloc(Value::Builtin(Arc::new(BuiltinFn {
        name: def.name,
        f: def.f,
        doc: def.doc,
        arglists: def.arglists,
        is_macro,
    })))
}

fn doc_meta(def: &BuiltinDef) -> Value {
    sable_core::gc::alloc(Value::ArrayMap(Arc::new(
        sable_core::map::ArrayMap::from_pairs(vec![
            (Value::keyword("doc"), Value::string(def.doc)),
            (Value::keyword("arglists"), Value::string(def.arglists)),
            (Value::keyword("added"), Value::string(def.added)),
        ]),
    )))
}
