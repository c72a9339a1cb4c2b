//! Central call dispatch
//!
//! Every call site — VM, tree-walker, native builtins, macro expansion —
//! funnels through [`call_value`], which dispatches on the callable's tag:
//! user fns (bytecode or treewalk backend), builtins, multimethods,
//! protocol fns, and the keyword/map/set/vector/var-as-function semantics.
//! This function is also what the dispatch vtable's `call` slot points at.

use crate::stm;
use sable_core::error::SableError;
use sable_core::fns::FnHandle;
use sable_core::list::PersistentList;
use sable_core::seqs;
use sable_core::value::Value;
use sable_compiler::ast::FnProto;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Execution backend for user fns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Vm,
    TreeWalk,
}

static BACKEND: AtomicU8 = AtomicU8::new(0);

pub fn set_backend(backend: Backend) {
    BACKEND.store(backend as u8, Ordering::Release);
}

pub fn backend() -> Backend {
    if BACKEND.load(Ordering::Acquire) == 0 {
        Backend::Vm
    } else {
        Backend::TreeWalk
    }
}

/// Invoke any callable value
pub fn call_value(f: &Value, args: &[Value]) -> Result<Value, SableError> {
    match f {
        Value::Builtin(b) => b.invoke(args),
        Value::Fn(handle) => call_fn(handle, args),
        Value::MultiFn(mf) => {
            let dispatch_val = call_value(&mf.dispatch_fn, args)?;
            let method = mf
                .find_method(&dispatch_val)
                .or_else(|| mf.find_default())
                .ok_or_else(|| {
                    SableError::value_err(format!(
                        "no method in multimethod '{}' for dispatch value: {}",
                        mf.name,
                        sable_core::printer::pr_str(&dispatch_val)
                    ))
                })?;
            call_value(&method, args)
        }
        Value::ProtocolFn(pf) => {
            let target = args.first().ok_or_else(|| {
                SableError::arity(&format!("{}/{}", pf.protocol.name, pf.method), 0)
            })?;
            // extend-via-metadata: a fully qualified method symbol in the
            // value's metadata wins
            if pf.protocol.extend_via_metadata {
                if let Some(meta) = target.meta() {
                    let key = Value::symbol(&format!("{}/{}", pf.protocol.name, pf.method));
                    if let Some(method) = map_get(&meta, &key) {
                        return call_value(&method, args);
                    }
                }
            }
            let key = type_key(target);
            let method = pf.protocol.find_impl(&key, &pf.method).ok_or_else(|| {
                SableError::value_err(format!(
                    "no implementation of method {} of protocol {} for type {}",
                    pf.method, pf.protocol.name, key
                ))
            })?;
            call_value(&method, args)
        }
        Value::Keyword(_) => {
            check_lookup_arity("keyword", args)?;
            let found = lookup(&args[0], f)?;
            Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::Nil)))
        }
        Value::ArrayMap(_) | Value::Map(_) => {
            check_lookup_arity("map", args)?;
            let found = lookup(f, &args[0])?;
            Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::Nil)))
        }
        Value::Set(s) => {
            check_lookup_arity("set", args)?;
            Ok(s.get(&args[0])
                .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::Nil)))
        }
        Value::Symbol(_) => {
            check_lookup_arity("symbol", args)?;
            let found = lookup(&args[0], f)?;
            Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::Nil)))
        }
        Value::Vector(v) => {
            if args.len() != 1 {
                return Err(SableError::arity("vector", args.len()));
            }
            match &args[0] {
                Value::Int(i) if *i >= 0 => v.nth(*i as usize).cloned(),
                other => Err(SableError::type_err(format!(
                    "vector index must be a non-negative integer, got {}",
                    other.type_name()
                ))),
            }
        }
        Value::Var(var) => {
            let target = var.deref()?;
            call_value(&target, args)
        }
        other => Err(SableError::type_err(format!(
            "{} is not callable",
            other.type_name()
        ))),
    }
}

fn check_lookup_arity(what: &str, args: &[Value]) -> Result<(), SableError> {
    if args.is_empty() || args.len() > 2 {
        return Err(SableError::arity(what, args.len()));
    }
    Ok(())
}

/// Associative lookup shared by `get`, keyword invoke, and map-as-fn
pub fn lookup(coll: &Value, key: &Value) -> Result<Option<Value>, SableError> {
    match coll {
        Value::Nil => Ok(None),
        Value::ArrayMap(m) => Ok(m.get(key).cloned()),
        Value::Map(m) => Ok(m.get(key).cloned()),
        Value::Set(s) => Ok(s.get(key)),
        Value::Vector(v) => match key {
            Value::Int(i) if *i >= 0 => Ok(v.get(*i as usize).cloned()),
            _ => Ok(None),
        },
        Value::Str(s) => match key {
            Value::Int(i) if *i >= 0 => Ok(s.chars().nth(*i as usize).map(Value::Char)),
            _ => Ok(None),
        },
        Value::TransientMap(t) => t.get(key),
        _ => Ok(None),
    }
}

fn map_get(m: &Value, key: &Value) -> Option<Value> {
    match m {
        Value::ArrayMap(am) => am.get(key).cloned(),
        Value::Map(hm) => hm.get(key).cloned(),
        _ => None,
    }
}

/// Protocol-dispatch type key: the value's tag, except maps may carry an
/// embedded `:__reify_type` override
pub fn type_key(v: &Value) -> String {
    if let Some(t) = map_get(v, &Value::keyword("__reify_type")) {
        match t {
            Value::Str(s) => return s.to_string(),
            Value::Symbol(s) => return s.name_str().to_string(),
            Value::Keyword(k) => return k.name_str().to_string(),
            _ => {}
        }
    }
    v.base_type_key().to_string()
}

/// Invoke a user fn on the configured backend
pub fn call_fn(handle: &Arc<FnHandle>, args: &[Value]) -> Result<Value, SableError> {
    let proto = handle
        .proto
        .clone()
        .downcast::<FnProto>()
        .map_err(|_| SableError::type_err("corrupt fn prototype"))?;
    let arity = proto.select_arity(args.len()).ok_or_else(|| {
        SableError::arity(
            handle.name.as_deref().unwrap_or("anonymous"),
            args.len(),
        )
    })?;

    // Bind fixed params, collect a variadic tail (nil when empty)
    let mut locals = vec![Value::Nil; arity.slots.max(arity.required + usize::from(arity.variadic))];
    locals[..arity.required].clone_from_slice(&args[..arity.required]);
    if arity.variadic {
        let rest = &args[arity.required..];
        locals[arity.required] = if rest.is_empty() {
            Value::Nil
        } else {
            Value::List(Arc::new(PersistentList::from_values(rest.to_vec())))
        };
    }

    match backend() {
        Backend::Vm => crate::vm::run_fn(handle, &proto, arity, locals),
        Backend::TreeWalk => crate::treewalk::run_fn(handle, arity, locals),
    }
}

/// `deref` over every deref-able tag
pub fn deref_value(v: &Value, timeout_ms: Option<(u64, Value)>) -> Result<Value, SableError> {
    match v {
        Value::Atom(a) => Ok(a.load()),
        Value::Ref(r) => stm::ref_deref(r),
        Value::Volatile(cell) => Ok(cell.load()),
        Value::Var(var) => var.deref(),
        Value::Promise(p) => match timeout_ms {
            None => Ok(p.wait()),
            Some((ms, default)) => Ok(p
                .wait_timeout(std::time::Duration::from_millis(ms))
                .unwrap_or(default)),
        },
        Value::Reduced(inner) => Ok((**inner).clone()),
        other => Err(SableError::type_err(format!(
            "{} is not derefable",
            other.type_name()
        ))),
    }
}

/// The `apply` spread: fixed args followed by a final seqable
pub fn spread_args(args: &[Value]) -> Result<(Value, Vec<Value>), SableError> {
    if args.len() < 2 {
        return Err(SableError::arity("apply", args.len()));
    }
    let f = args[0].clone();
    let mut call_args: Vec<Value> = args[1..args.len() - 1].to_vec();
    for item in seqs::iter(&args[args.len() - 1]) {
        call_args.push(item?);
    }
    Ok((f, call_args))
}
