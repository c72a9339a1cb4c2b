//! Reference type builtins: atoms, refs/STM, volatiles, promises

use super::{b, check_exact, check_min, check_range};
use crate::call::{call_value, deref_value};
use crate::registry::BuiltinDef;
use crate::stm;
use sable_core::error::SableError;
use sable_core::gc;
use sable_core::refs::{AtomCell, PromiseCell, StmRef, VolatileCell};
use sable_core::value::Value;
use std::sync::Arc;

pub fn builtins() -> Vec<BuiltinDef> {
    vec![
        b!("atom", atom, "([x])", "A mutable reference with compare-and-set semantics."),
        b!("deref", deref, "([ref] [ref timeout-ms timeout-val])", "The current value of a reference."),
        b!("swap!", swap_bang, "([atom f & args])", "Atomically updates an atom with f; retries under contention."),
        b!("reset!", reset_bang, "([atom v])", "Unconditionally sets an atom."),
        b!("compare-and-set!", compare_and_set_bang, "([atom expected new])", "Sets the atom iff it holds expected."),
        b!("add-watch", add_watch, "([ref key f])", "Registers a watch fn fired after updates."),
        b!("remove-watch", remove_watch, "([ref key])", "Removes a watch by key."),
        b!("set-validator!", set_validator_bang, "([ref f])", "Installs a validator on an atom or ref."),
        b!("volatile!", volatile_bang, "([x])", "A mutable cell without atomicity guarantees."),
        b!("vreset!", vreset_bang, "([vol v])", "Sets a volatile."),
        b!("vswap!", vswap_bang, "([vol f & args])", "Updates a volatile with f."),
        b!("volatile?", volatile_p, "([x])", "True if x is a volatile."),
        b!("ref", ref_fn, "([x] [x & options])", "An STM-managed reference; options :min-history and :max-history."),
        b!("ref-set", ref_set, "([ref v])", "Sets a ref inside a transaction."),
        b!("alter", alter, "([ref f & args])", "Sets a ref to (apply f current args) inside a transaction."),
        b!("commute", commute, "([ref f & args])", "Like alter, but replayed against the committed value at commit."),
        b!("ensure", ensure, "([ref])", "Protects a ref from concurrent modification without writing it."),
        b!("-run-in-transaction", run_in_transaction, "([thunk])", "Runs thunk inside an STM transaction (dosync)."),
        b!("atom?", atom_p, "([x])", "True if x is an atom."),
        b!("ref?", ref_p, "([x])", "True if x is a ref."),
        b!("promise", promise, "([])", "A write-once value readers block on."),
        b!("deliver", deliver, "([promise v])", "Delivers a promise; later deliveries are ignored."),
    ]
}

fn atom(args: &[Value]) -> Result<Value, SableError> {
    check_exact("atom", args, 1)?;
    Ok(gc::alloc(Value::Atom(Arc::new(AtomCell::new(
        args[0].clone(),
    )))))
}

fn deref(args: &[Value]) -> Result<Value, SableError> {
    check_range("deref", args, 1, 3)?;
    match args.len() {
        1 => deref_value(&args[0], None),
        3 => {
            let ms = super::int_arg("deref", args, 1)?;
            deref_value(&args[0], Some((ms.max(0) as u64, args[2].clone())))
        }
        _ => Err(SableError::arity("deref", args.len())),
    }
}

fn atom_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a Arc<AtomCell>, SableError> {
    match args.first() {
        Some(Value::Atom(a)) => Ok(a),
        Some(other) => Err(SableError::type_err(format!(
            "{} expects an atom, got {}",
            name,
            other.type_name()
        ))),
        None => Err(SableError::arity(name, 0)),
    }
}

fn validate(validator: &Option<Value>, proposed: &Value) -> Result<(), SableError> {
    if let Some(f) = validator {
        let verdict = call_value(f, &[proposed.clone()])?;
        if !verdict.is_truthy() {
            return Err(SableError::value_err("validator rejected the proposed value"));
        }
    }
    Ok(())
}

fn fire_watches(watches: Vec<(Value, Value)>, target: &Value, old: &Value, new: &Value) {
    for (key, f) in watches {
        let _ = call_value(&f, &[key, target.clone(), old.clone(), new.clone()]);
    }
}

fn swap_bang(args: &[Value]) -> Result<Value, SableError> {
    check_min("swap!", args, 2)?;
    let a = atom_arg("swap!", args)?;
    // Compare-and-set loop: retry until the update sticks
    loop {
        let old = a.load();
        let mut call_args = vec![old.clone()];
        call_args.extend_from_slice(&args[2..]);
        let new = call_value(&args[1], &call_args)?;
        let validator = a.validator.read().expect("atom poisoned").clone();
        validate(&validator, &new)?;
        if a.compare_and_set(&old, new.clone()) {
            fire_watches(a.watches_snapshot(), &args[0], &old, &new);
            return Ok(new);
        }
    }
}

fn reset_bang(args: &[Value]) -> Result<Value, SableError> {
    check_exact("reset!", args, 2)?;
    let a = atom_arg("reset!", args)?;
    let validator = a.validator.read().expect("atom poisoned").clone();
    validate(&validator, &args[1])?;
    let old = a.store(args[1].clone());
    fire_watches(a.watches_snapshot(), &args[0], &old, &args[1]);
    Ok(args[1].clone())
}

fn compare_and_set_bang(args: &[Value]) -> Result<Value, SableError> {
    check_exact("compare-and-set!", args, 3)?;
    let a = atom_arg("compare-and-set!", args)?;
    let validator = a.validator.read().expect("atom poisoned").clone();
    validate(&validator, &args[2])?;
    let swapped = a.compare_and_set(&args[1], args[2].clone());
    if swapped {
        fire_watches(a.watches_snapshot(), &args[0], &args[1], &args[2]);
    }
    Ok(Value::Bool(swapped))
}

fn add_watch(args: &[Value]) -> Result<Value, SableError> {
    check_exact("add-watch", args, 3)?;
    match &args[0] {
        Value::Atom(a) => a.add_watch(args[1].clone(), args[2].clone()),
        Value::Ref(r) => r.add_watch(args[1].clone(), args[2].clone()),
        other => {
            return Err(SableError::type_err(format!(
                "add-watch not supported on {}",
                other.type_name()
            )));
        }
    }
    Ok(args[0].clone())
}

fn remove_watch(args: &[Value]) -> Result<Value, SableError> {
    check_exact("remove-watch", args, 2)?;
    match &args[0] {
        Value::Atom(a) => a.remove_watch(&args[1]),
        Value::Ref(r) => r.remove_watch(&args[1]),
        other => {
            return Err(SableError::type_err(format!(
                "remove-watch not supported on {}",
                other.type_name()
            )));
        }
    }
    Ok(args[0].clone())
}

fn set_validator_bang(args: &[Value]) -> Result<Value, SableError> {
    check_exact("set-validator!", args, 2)?;
    let validator = match &args[1] {
        Value::Nil => None,
        f => Some(f.clone()),
    };
    match &args[0] {
        Value::Atom(a) => {
            if let Some(v) = &validator {
                let current = a.load();
                validate(&Some(v.clone()), &current)?;
            }
            *a.validator.write().expect("atom poisoned") = validator;
        }
        Value::Ref(r) => {
            if let Some(v) = &validator {
                let current = r.current();
                validate(&Some(v.clone()), &current)?;
            }
            *r.validator.write().expect("ref poisoned") = validator;
        }
        other => {
            return Err(SableError::type_err(format!(
                "set-validator! not supported on {}",
                other.type_name()
            )));
        }
    }
    Ok(Value::Nil)
}

fn volatile_bang(args: &[Value]) -> Result<Value, SableError> {
    check_exact("volatile!", args, 1)?;
    Ok(gc::alloc(Value::Volatile(Arc::new(VolatileCell::new(
        args[0].clone(),
    )))))
}

fn volatile_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a Arc<VolatileCell>, SableError> {
    match args.first() {
        Some(Value::Volatile(v)) => Ok(v),
        Some(other) => Err(SableError::type_err(format!(
            "{} expects a volatile, got {}",
            name,
            other.type_name()
        ))),
        None => Err(SableError::arity(name, 0)),
    }
}

fn vreset_bang(args: &[Value]) -> Result<Value, SableError> {
    check_exact("vreset!", args, 2)?;
    volatile_arg("vreset!", args)?.store(args[1].clone());
    Ok(args[1].clone())
}

fn vswap_bang(args: &[Value]) -> Result<Value, SableError> {
    check_min("vswap!", args, 2)?;
    let v = volatile_arg("vswap!", args)?;
    let mut call_args = vec![v.load()];
    call_args.extend_from_slice(&args[2..]);
    let new = call_value(&args[1], &call_args)?;
    v.store(new.clone());
    Ok(new)
}

fn volatile_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("volatile?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Volatile(_))))
}

fn ref_fn(args: &[Value]) -> Result<Value, SableError> {
    check_min("ref", args, 1)?;
    let mut min_history = 0usize;
    let mut max_history = 10usize;
    let mut i = 1;
    while i < args.len() {
        match (&args[i], args.get(i + 1)) {
            (Value::Keyword(k), Some(Value::Int(n))) if k.name_str() == "min-history" => {
                min_history = (*n).max(0) as usize;
                i += 2;
            }
            (Value::Keyword(k), Some(Value::Int(n))) if k.name_str() == "max-history" => {
                max_history = (*n).max(1) as usize;
                i += 2;
            }
            _ => {
                return Err(SableError::value_err(
                    "ref options are :min-history and :max-history",
                ));
            }
        }
    }
    Ok(gc::alloc(Value::Ref(Arc::new(StmRef::with_history(
        args[0].clone(),
        min_history,
        max_history,
    )))))
}

fn ref_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a Arc<StmRef>, SableError> {
    match args.first() {
        Some(Value::Ref(r)) => Ok(r),
        Some(other) => Err(SableError::type_err(format!(
            "{} expects a ref, got {}",
            name,
            other.type_name()
        ))),
        None => Err(SableError::arity(name, 0)),
    }
}

fn ref_set(args: &[Value]) -> Result<Value, SableError> {
    check_exact("ref-set", args, 2)?;
    let r = ref_arg("ref-set", args)?;
    stm::do_set(r, args[1].clone())
}

fn alter(args: &[Value]) -> Result<Value, SableError> {
    check_min("alter", args, 2)?;
    let r = ref_arg("alter", args)?;
    let current = stm::do_get(r)?;
    let mut call_args = vec![current];
    call_args.extend_from_slice(&args[2..]);
    let new = call_value(&args[1], &call_args)?;
    stm::do_set(r, new)
}

fn commute(args: &[Value]) -> Result<Value, SableError> {
    check_min("commute", args, 2)?;
    let r = ref_arg("commute", args)?;
    stm::do_commute(r, &args[1], &args[2..])
}

fn ensure(args: &[Value]) -> Result<Value, SableError> {
    check_exact("ensure", args, 1)?;
    let r = ref_arg("ensure", args)?;
    stm::do_ensure(r)
}

fn run_in_transaction(args: &[Value]) -> Result<Value, SableError> {
    check_exact("-run-in-transaction", args, 1)?;
    stm::run_in_transaction(&args[0])
}

fn atom_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("atom?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Atom(_))))
}

fn ref_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("ref?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Ref(_))))
}

fn promise(args: &[Value]) -> Result<Value, SableError> {
    check_exact("promise", args, 0)?;
    Ok(gc::alloc(Value::Promise(Arc::new(PromiseCell::new()))))
}

fn deliver(args: &[Value]) -> Result<Value, SableError> {
    check_exact("deliver", args, 2)?;
    match &args[0] {
        Value::Promise(p) => {
            p.deliver(args[1].clone());
            Ok(args[0].clone())
        }
        other => Err(SableError::type_err(format!(
            "deliver expects a promise, got {}",
            other.type_name()
        ))),
    }
}
