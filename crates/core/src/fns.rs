//! Callable payloads: user fns, native builtins, multimethods, protocols
//!
//! A user fn's compiled body lives above this crate (AST or bytecode), so
//! `FnHandle` stores it type-erased; the runtime downcasts through the
//! dispatch vtable when calling or tracing.

use crate::error::SableError;
use crate::value::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Signature shared by all native functions (and macro builtins, which
/// receive unevaluated forms)
pub type NativeFn = fn(&[Value]) -> Result<Value, SableError>;

/// A native function with its documentation record
#[derive(Debug)]
pub struct BuiltinFn {
    pub name: &'static str,
    pub f: NativeFn,
    pub doc: &'static str,
    pub arglists: &'static str,
    /// Receives forms instead of values when true
    pub is_macro: bool,
}

impl BuiltinFn {
    pub fn invoke(&self, args: &[Value]) -> Result<Value, SableError> {
        (self.f)(args)
    }
}

/// A user function: treewalk AST and/or compiled bytecode, plus captures
pub struct FnHandle {
    /// Self-name for recursion and error reporting
    pub name: Option<Arc<str>>,
    /// The fn prototype (arity bodies); concrete type lives in the runtime
    pub proto: Arc<dyn Any + Send + Sync>,
    /// Values closed over at creation, ordered by upvalue index
    pub captures: Box<[Value]>,
    meta: RwLock<Option<Value>>,
    macro_flag: AtomicBool,
}

impl std::fmt::Debug for FnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FnHandle({})", self.name.as_deref().unwrap_or("anonymous"))
    }
}

impl FnHandle {
    pub fn new(
        name: Option<Arc<str>>,
        proto: Arc<dyn Any + Send + Sync>,
        captures: Box<[Value]>,
    ) -> FnHandle {
        FnHandle {
            name,
            proto,
            captures,
            meta: RwLock::new(None),
            macro_flag: AtomicBool::new(false),
        }
    }

    pub fn meta(&self) -> Option<Value> {
        self.meta.read().expect("fn meta poisoned").clone()
    }

    pub fn set_meta(&self, meta: Option<Value>) {
        *self.meta.write().expect("fn meta poisoned") = meta;
    }

    pub fn is_macro(&self) -> bool {
        self.macro_flag.load(Ordering::Acquire)
    }

    pub fn set_macro(&self) {
        self.macro_flag.store(true, Ordering::Release);
    }
}

/// A multimethod: dispatch fn plus a method table keyed by value equality
#[derive(Debug)]
pub struct MultiFn {
    pub name: Arc<str>,
    pub dispatch_fn: Value,
    pub default_key: Value,
    methods: RwLock<Vec<(Value, Value)>>,
}

impl MultiFn {
    pub fn new(name: Arc<str>, dispatch_fn: Value, default_key: Value) -> MultiFn {
        MultiFn {
            name,
            dispatch_fn,
            default_key,
            methods: RwLock::new(Vec::new()),
        }
    }

    pub fn add_method(&self, dispatch_val: Value, method: Value) {
        let mut methods = self.methods.write().expect("multifn poisoned");
        match methods
            .iter()
            .position(|(k, _)| crate::cmp::value_equals(k, &dispatch_val))
        {
            Some(idx) => methods[idx] = (dispatch_val, method),
            None => methods.push((dispatch_val, method)),
        }
    }

    pub fn remove_method(&self, dispatch_val: &Value) {
        self.methods
            .write()
            .expect("multifn poisoned")
            .retain(|(k, _)| !crate::cmp::value_equals(k, dispatch_val));
    }

    /// Exact-match lookup; the `:default` fallback is applied by the caller
    pub fn find_method(&self, dispatch_val: &Value) -> Option<Value> {
        self.methods
            .read()
            .expect("multifn poisoned")
            .iter()
            .find(|(k, _)| crate::cmp::value_equals(k, dispatch_val))
            .map(|(_, m)| m.clone())
    }

    pub fn find_default(&self) -> Option<Value> {
        self.find_method(&self.default_key)
    }

    pub fn methods_snapshot(&self) -> Vec<(Value, Value)> {
        self.methods.read().expect("multifn poisoned").clone()
    }
}

/// A protocol: named method signatures plus per-type-key implementations
#[derive(Debug)]
pub struct Protocol {
    pub name: Arc<str>,
    /// Method name → arglists doc (signature record)
    pub sigs: Vec<(Arc<str>, Value)>,
    /// type key → method name → fn
    impls: RwLock<HashMap<String, HashMap<String, Value>>>,
    pub extend_via_metadata: bool,
}

impl Protocol {
    pub fn new(name: Arc<str>, sigs: Vec<(Arc<str>, Value)>, extend_via_metadata: bool) -> Protocol {
        Protocol {
            name,
            sigs,
            impls: RwLock::new(HashMap::new()),
            extend_via_metadata,
        }
    }

    pub fn extend_type(&self, type_key: &str, methods: Vec<(String, Value)>) {
        let mut impls = self.impls.write().expect("protocol poisoned");
        let table = impls.entry(type_key.to_string()).or_default();
        for (name, f) in methods {
            table.insert(name, f);
        }
    }

    /// Look up `method` for `type_key`, falling back to the `"Object"` row
    pub fn find_impl(&self, type_key: &str, method: &str) -> Option<Value> {
        let impls = self.impls.read().expect("protocol poisoned");
        impls
            .get(type_key)
            .and_then(|t| t.get(method))
            .or_else(|| impls.get("Object").and_then(|t| t.get(method)))
            .cloned()
    }

    pub fn satisfied_by(&self, type_key: &str) -> bool {
        let impls = self.impls.read().expect("protocol poisoned");
        impls.contains_key(type_key) || impls.contains_key("Object")
    }

    pub fn impls_snapshot(&self) -> Vec<Value> {
        self.impls
            .read()
            .expect("protocol poisoned")
            .values()
            .flat_map(|t| t.values().cloned())
            .collect()
    }
}

/// One named method of a protocol; dispatches on the type key of args[0]
#[derive(Debug)]
pub struct ProtocolFn {
    pub protocol: Arc<Protocol>,
    pub method: Arc<str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multifn_method_table() {
        let mf = MultiFn::new(
            Arc::from("area"),
            Value::Nil,
            Value::keyword("default"),
        );
        mf.add_method(Value::keyword("circle"), Value::Int(1));
        mf.add_method(Value::keyword("square"), Value::Int(2));
        mf.add_method(Value::keyword("circle"), Value::Int(3));

        assert!(matches!(
            mf.find_method(&Value::keyword("circle")),
            Some(Value::Int(3))
        ));
        assert!(mf.find_method(&Value::keyword("oval")).is_none());
        mf.remove_method(&Value::keyword("circle"));
        assert!(mf.find_method(&Value::keyword("circle")).is_none());
    }

    #[test]
    fn test_protocol_object_fallback() {
        let p = Protocol::new(Arc::from("Renderable"), vec![], false);
        p.extend_type("Integer", vec![("render".to_string(), Value::Int(1))]);
        p.extend_type("Object", vec![("render".to_string(), Value::Int(0))]);

        assert!(matches!(p.find_impl("Integer", "render"), Some(Value::Int(1))));
        assert!(matches!(p.find_impl("String", "render"), Some(Value::Int(0))));
        assert!(p.find_impl("String", "paint").is_none());
        assert!(p.satisfied_by("Keyword"));
    }
}
