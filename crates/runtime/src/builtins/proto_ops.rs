//! Protocol and multimethod builtins
//!
//! The defprotocol/defmulti macros expand into these constructors; dispatch
//! itself lives in the central call path.

use super::{b, check_exact, check_min, check_range};
use crate::registry::BuiltinDef;
use sable_core::error::SableError;
use sable_core::fns::{MultiFn, Protocol, ProtocolFn};
use sable_core::gc;
use sable_core::seqs;
use sable_core::value::Value;
use std::sync::Arc;

pub fn builtins() -> Vec<BuiltinDef> {
    vec![
        b!("-make-protocol", make_protocol, "([name sigs opts])", "Constructs a protocol value."),
        b!("-protocol-fn", protocol_fn, "([protocol method-name])", "One named method of a protocol."),
        b!("-extend!", extend_bang, "([protocol type-key method-map])", "Installs method implementations for a type key."),
        b!("extend", extend, "([type-key protocol method-map])", "Installs a method map keyed by keyword method names."),
        b!("satisfies?", satisfies_p, "([protocol x])", "True if x's type has an implementation of protocol."),
        b!("extends?", extends_p, "([protocol type-key])", "True if type-key has an implementation of protocol."),
        b!("-make-multi", make_multi, "([name dispatch-fn default])", "Constructs a multimethod."),
        b!("-add-method!", add_method_bang, "([multifn dispatch-val f])", "Adds a method to a multimethod."),
        b!("remove-method", remove_method, "([multifn dispatch-val])", "Removes the method for a dispatch value."),
        b!("methods", methods, "([multifn])", "A map of dispatch value to method."),
        b!("get-method", get_method, "([multifn dispatch-val])", "The method for a dispatch value, or the default."),
        b!("type-key", type_key_fn, "([x])", "The protocol-dispatch type key of x."),
    ]
}

fn make_protocol(args: &[Value]) -> Result<Value, SableError> {
    check_range("-make-protocol", args, 2, 3)?;
    let name = match &args[0] {
        Value::Str(s) => s.to_string(),
        Value::Symbol(s) => s.name_str().to_string(),
        other => {
            return Err(SableError::type_err(format!(
                "protocol name must be a symbol, got {}",
                other.type_name()
            )));
        }
    };
    let mut sigs = Vec::new();
    for sig in seqs::iter(&args[1]) {
        let sig = sig?;
        let method = seqs::first(&sig)?;
        if let Value::Symbol(m) = &method {
            sigs.push((sable_core::intern_str(m.name_str()), sig.clone()));
        }
    }
    let extend_via_metadata = args
        .get(2)
        .map(|opts| {
            crate::call::lookup(opts, &Value::keyword("extend-via-metadata"))
                .ok()
                .flatten()
                .is_some_and(|v| v.is_truthy())
        })
        .unwrap_or(false);
    Ok(gc::alloc(Value::Protocol(Arc::new(Protocol::new(
        Arc::from(name.as_str()),
        sigs,
        extend_via_metadata,
    )))))
}

fn protocol_arg<'a>(name: &str, v: Option<&'a Value>) -> Result<&'a Arc<Protocol>, SableError> {
    match v {
        Some(Value::Protocol(p)) => Ok(p),
        Some(other) => Err(SableError::type_err(format!(
            "{} expects a protocol, got {}",
            name,
            other.type_name()
        ))),
        None => Err(SableError::arity(name, 0)),
    }
}

fn protocol_fn(args: &[Value]) -> Result<Value, SableError> {
    check_exact("-protocol-fn", args, 2)?;
    let protocol = protocol_arg("-protocol-fn", args.first())?;
    let method = match &args[1] {
        Value::Str(s) => s.to_string(),
        Value::Symbol(s) => s.name_str().to_string(),
        other => {
            return Err(SableError::type_err(format!(
                "method name must be a symbol, got {}",
                other.type_name()
            )));
        }
    };
    Ok(gc::alloc(Value::ProtocolFn(Arc::new(ProtocolFn {
        protocol: protocol.clone(),
        method: Arc::from(method.as_str()),
    }))))
}

fn method_map(v: &Value) -> Result<Vec<(String, Value)>, SableError> {
    let mut methods = Vec::new();
    for entry in seqs::iter(v) {
        let entry = entry?;
        if let Value::Vector(kv) = &entry {
            let name = match kv.get(0) {
                Some(Value::Str(s)) => s.to_string(),
                Some(Value::Keyword(k)) => k.name_str().to_string(),
                Some(Value::Symbol(s)) => s.name_str().to_string(),
                other => {
                    return Err(SableError::type_err(format!(
                        "method key must name a method, got {:?}",
                        other.map(|v| v.type_name())
                    )));
                }
            };
            methods.push((name, kv.get(1).cloned().unwrap_or(Value::Nil)));
        }
    }
    Ok(methods)
}

fn type_key_str(v: &Value) -> Result<String, SableError> {
    match v {
        Value::Str(s) => Ok(s.to_string()),
        Value::Symbol(s) => Ok(s.name_str().to_string()),
        Value::Keyword(k) => Ok(k.name_str().to_string()),
        other => Err(SableError::type_err(format!(
            "type key must be a symbol or string, got {}",
            other.type_name()
        ))),
    }
}

fn extend_bang(args: &[Value]) -> Result<Value, SableError> {
    check_exact("-extend!", args, 3)?;
    let protocol = protocol_arg("-extend!", args.first())?;
    let key = type_key_str(&args[1])?;
    protocol.extend_type(&key, method_map(&args[2])?);
    Ok(Value::Nil)
}

fn extend(args: &[Value]) -> Result<Value, SableError> {
    check_exact("extend", args, 3)?;
    let key = type_key_str(&args[0])?;
    let protocol = protocol_arg("extend", args.get(1))?;
    protocol.extend_type(&key, method_map(&args[2])?);
    Ok(Value::Nil)
}

fn satisfies_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("satisfies?", args, 2)?;
    let protocol = protocol_arg("satisfies?", args.first())?;
    let key = crate::call::type_key(&args[1]);
    Ok(Value::Bool(protocol.satisfied_by(&key)))
}

fn extends_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("extends?", args, 2)?;
    let protocol = protocol_arg("extends?", args.first())?;
    let key = type_key_str(&args[1])?;
    Ok(Value::Bool(protocol.satisfied_by(&key)))
}

fn make_multi(args: &[Value]) -> Result<Value, SableError> {
    check_exact("-make-multi", args, 3)?;
    let name = match &args[0] {
        Value::Str(s) => s.to_string(),
        Value::Symbol(s) => s.name_str().to_string(),
        other => {
            return Err(SableError::type_err(format!(
                "multimethod name must be a symbol, got {}",
                other.type_name()
            )));
        }
    };
    Ok(gc::alloc(Value::MultiFn(Arc::new(MultiFn::new(
        Arc::from(name.as_str()),
        args[1].clone(),
        args[2].clone(),
    )))))
}

fn multi_arg<'a>(name: &str, v: Option<&'a Value>) -> Result<&'a Arc<MultiFn>, SableError> {
    match v {
        Some(Value::MultiFn(m)) => Ok(m),
        Some(other) => Err(SableError::type_err(format!(
            "{} expects a multimethod, got {}",
            name,
            other.type_name()
        ))),
        None => Err(SableError::arity(name, 0)),
    }
}

fn add_method_bang(args: &[Value]) -> Result<Value, SableError> {
    check_exact("-add-method!", args, 3)?;
    let mf = multi_arg("-add-method!", args.first())?;
    mf.add_method(args[1].clone(), args[2].clone());
    Ok(args[0].clone())
}

fn remove_method(args: &[Value]) -> Result<Value, SableError> {
    check_exact("remove-method", args, 2)?;
    let mf = multi_arg("remove-method", args.first())?;
    mf.remove_method(&args[1]);
    Ok(args[0].clone())
}

fn methods(args: &[Value]) -> Result<Value, SableError> {
    check_exact("methods", args, 1)?;
    let mf = multi_arg("methods", args.first())?;
    Ok(super::coll::map_from_pairs(mf.methods_snapshot()))
}

fn get_method(args: &[Value]) -> Result<Value, SableError> {
    check_min("get-method", args, 2)?;
    let mf = multi_arg("get-method", args.first())?;
    Ok(mf
        .find_method(&args[1])
        .or_else(|| mf.find_default())
        .unwrap_or(Value::Nil))
}

fn type_key_fn(args: &[Value]) -> Result<Value, SableError> {
    check_exact("type-key", args, 1)?;
    Ok(Value::string(crate::call::type_key(&args[0])))
}
