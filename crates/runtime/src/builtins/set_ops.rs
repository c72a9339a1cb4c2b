//! Set algebra for the `sable.set` namespace

use super::{b, check_exact, check_min};
use crate::registry::BuiltinDef;
use sable_core::error::SableError;
use sable_core::gc;
use sable_core::set::PersistentSet;
use sable_core::value::Value;
use std::sync::Arc;

pub fn builtins() -> Vec<BuiltinDef> {
    vec![
        b!("union", union, "([& sets])", "The union of the sets."),
        b!("intersection", intersection, "([s & sets])", "Members present in every set."),
        b!("difference", difference, "([s & sets])", "Members of s absent from the other sets."),
        b!("subset?", subset_p, "([a b])", "True if every member of a is in b."),
        b!("superset?", superset_p, "([a b])", "True if every member of b is in a."),
        b!("select", select, "([pred s])", "Members of s for which pred is truthy."),
    ]
}

fn set_arg<'a>(name: &str, v: &'a Value) -> Result<&'a Arc<PersistentSet>, SableError> {
    match v {
        Value::Set(s) => Ok(s),
        other => Err(SableError::type_err(format!(
            "{} expects a set, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn union(args: &[Value]) -> Result<Value, SableError> {
    let mut acc = PersistentSet::new();
    for arg in args {
        for member in set_arg("union", arg)?.iter() {
            acc = acc.conj(member.clone());
        }
    }
    Ok(gc::alloc(Value::Set(Arc::new(acc))))
}

fn intersection(args: &[Value]) -> Result<Value, SableError> {
    check_min("intersection", args, 1)?;
    let first = set_arg("intersection", &args[0])?;
    let rest: Vec<&Arc<PersistentSet>> = args[1..]
        .iter()
        .map(|a| set_arg("intersection", a))
        .collect::<Result<_, _>>()?;
    let mut acc = PersistentSet::new();
    for member in first.iter() {
        if rest.iter().all(|s| s.contains(member)) {
            acc = acc.conj(member.clone());
        }
    }
    Ok(gc::alloc(Value::Set(Arc::new(acc))))
}

fn difference(args: &[Value]) -> Result<Value, SableError> {
    check_min("difference", args, 1)?;
    let first = set_arg("difference", &args[0])?;
    let rest: Vec<&Arc<PersistentSet>> = args[1..]
        .iter()
        .map(|a| set_arg("difference", a))
        .collect::<Result<_, _>>()?;
    let mut acc = PersistentSet::new();
    for member in first.iter() {
        if !rest.iter().any(|s| s.contains(member)) {
            acc = acc.conj(member.clone());
        }
    }
    Ok(gc::alloc(Value::Set(Arc::new(acc))))
}

fn subset_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("subset?", args, 2)?;
    let a = set_arg("subset?", &args[0])?;
    let b = set_arg("subset?", &args[1])?;
    Ok(Value::Bool(a.iter().all(|m| b.contains(m))))
}

fn superset_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("superset?", args, 2)?;
    let a = set_arg("superset?", &args[0])?;
    let b = set_arg("superset?", &args[1])?;
    Ok(Value::Bool(b.iter().all(|m| a.contains(m))))
}

fn select(args: &[Value]) -> Result<Value, SableError> {
    check_exact("select", args, 2)?;
    let s = set_arg("select", &args[1])?;
    let mut acc = PersistentSet::new();
    for member in s.iter() {
        if crate::call::call_value(&args[0], &[member.clone()])?.is_truthy() {
            acc = acc.conj(member.clone());
        }
    }
    Ok(gc::alloc(Value::Set(Arc::new(acc))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(items: &[i64]) -> Value {
        Value::Set(Arc::new(PersistentSet::from_values(
            items.iter().map(|n| Value::Int(*n)).collect(),
        )))
    }

    #[test]
    fn test_union_intersection_difference() {
        let a = set_of(&[1, 2, 3]);
        let b = set_of(&[2, 3, 4]);
        match union(&[a.clone(), b.clone()]).unwrap() {
            Value::Set(s) => assert_eq!(s.len(), 4),
            other => panic!("unexpected {:?}", other),
        }
        match intersection(&[a.clone(), b.clone()]).unwrap() {
            Value::Set(s) => assert_eq!(s.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        match difference(&[a, b]).unwrap() {
            Value::Set(s) => {
                assert_eq!(s.len(), 1);
                assert!(s.contains(&Value::Int(1)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_subset_superset() {
        let small = set_of(&[1, 2]);
        let big = set_of(&[1, 2, 3]);
        assert!(subset_p(&[small.clone(), big.clone()]).unwrap().is_truthy());
        assert!(!subset_p(&[big.clone(), small.clone()]).unwrap().is_truthy());
        assert!(superset_p(&[big, small]).unwrap().is_truthy());
    }
}
