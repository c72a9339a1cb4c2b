//! Structural equality and ordering
//!
//! Equality partitions: sequential collections (lists, vectors, conses,
//! lazy seqs) compare elementwise across representations; both map kinds
//! compare by entries; sets by membership. Ints and floats are distinct
//! partitions under `=` (numeric cross-type equality is the separate `==`
//! builtin). Reference types compare by identity.

use crate::error::SableError;
use crate::seqs;
use crate::value::Value;
use std::cmp::Ordering;

/// Structural equality
pub fn value_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Char(x), Value::Char(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Symbol(x), Value::Symbol(y)) => x == y,
        (Value::Keyword(x), Value::Keyword(y)) => x == y,
        (Value::Regex(x), Value::Regex(y)) => x.source == y.source,
        (Value::Reduced(x), Value::Reduced(y)) => value_equals(x, y),

        // Sequential partition: cross-representation elementwise comparison
        (Value::Vector(x), Value::Vector(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| value_equals(a, b))
        }
        (x, y) if is_sequential(x) && is_sequential(y) => seq_equals(x, y),

        // Map partition
        (x, y) if is_map(x) && is_map(y) => map_equals(x, y),

        // Set partition
        (Value::Set(x), Value::Set(y)) => {
            x.len() == y.len() && x.iter().all(|m| y.contains(m))
        }

        // Everything else: identity
        _ => a.identical(b),
    }
}

pub fn is_sequential(v: &Value) -> bool {
    matches!(
        v,
        Value::List(_) | Value::Vector(_) | Value::Cons(_) | Value::LazySeq(_)
    )
}

pub fn is_map(v: &Value) -> bool {
    matches!(v, Value::ArrayMap(_) | Value::Map(_))
}

fn seq_equals(a: &Value, b: &Value) -> bool {
    let mut ia = seqs::iter(a);
    let mut ib = seqs::iter(b);
    loop {
        match (ia.next(), ib.next()) {
            (None, None) => return true,
            (Some(Ok(x)), Some(Ok(y))) => {
                if !value_equals(&x, &y) {
                    return false;
                }
            }
            // Mismatched lengths or a realization failure
            _ => return false,
        }
    }
}

fn map_entries(v: &Value) -> Vec<(Value, Value)> {
    match v {
        Value::ArrayMap(m) => m.iter().cloned().collect(),
        Value::Map(m) => m.to_pairs(),
        _ => unreachable!("map_entries on non-map"),
    }
}

fn map_get(v: &Value, key: &Value) -> Option<Value> {
    match v {
        Value::ArrayMap(m) => m.get(key).cloned(),
        Value::Map(m) => m.get(key).cloned(),
        _ => None,
    }
}

fn map_len(v: &Value) -> usize {
    match v {
        Value::ArrayMap(m) => m.len(),
        Value::Map(m) => m.len(),
        _ => 0,
    }
}

fn map_equals(a: &Value, b: &Value) -> bool {
    if map_len(a) != map_len(b) {
        return false;
    }
    map_entries(a).iter().all(|(k, v)| {
        map_get(b, k)
            .map(|other| value_equals(v, &other))
            .unwrap_or(false)
    })
}

/// Total ordering over comparable values (sort, `compare`, `<` on numbers)
pub fn value_compare(a: &Value, b: &Value) -> Result<Ordering, SableError> {
    match (a, b) {
        (Value::Nil, Value::Nil) => Ok(Ordering::Equal),
        (Value::Nil, _) => Ok(Ordering::Less),
        (_, Value::Nil) => Ok(Ordering::Greater),
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        (Value::Int(x), Value::Float(y)) => Ok(partial(*x as f64, *y)),
        (Value::Float(x), Value::Int(y)) => Ok(partial(*x, *y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(partial(*x, *y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        (Value::Char(x), Value::Char(y)) => Ok(x.cmp(y)),
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::Symbol(x), Value::Symbol(y)) => {
            Ok((x.ns_str(), x.name_str()).cmp(&(y.ns_str(), y.name_str())))
        }
        (Value::Keyword(x), Value::Keyword(y)) => {
            Ok((x.ns_str(), x.name_str()).cmp(&(y.ns_str(), y.name_str())))
        }
        (Value::Vector(x), Value::Vector(y)) => {
            for (ea, eb) in x.iter().zip(y.iter()) {
                match value_compare(ea, eb)? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        _ => Err(SableError::type_err(format!(
            "can't compare {} with {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn partial(x: f64, y: f64) -> Ordering {
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

/// Numeric cross-type equality (the `==` builtin)
pub fn numeric_equals(a: &Value, b: &Value) -> Result<bool, SableError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x == y),
        (Value::Float(x), Value::Float(y)) => Ok(x == y),
        (Value::Int(x), Value::Float(y)) => Ok((*x as f64) == *y),
        (Value::Float(x), Value::Int(y)) => Ok(*x == (*y as f64)),
        _ => Err(SableError::type_err(format!(
            "== requires numbers, got {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::PersistentList;
    use crate::map::{ArrayMap, HashTrieMap};
    use crate::vector::PersistentVector;
    use std::sync::Arc;

    fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(PersistentList::from_values(items)))
    }

    fn vector(items: Vec<Value>) -> Value {
        Value::Vector(Arc::new(PersistentVector::from_values(items)))
    }

    #[test]
    fn test_cross_representation_sequential_equality() {
        let l = list(vec![Value::Int(1), Value::Int(2)]);
        let v = vector(vec![Value::Int(1), Value::Int(2)]);
        assert!(value_equals(&l, &v));
        assert!(!value_equals(&l, &vector(vec![Value::Int(1)])));
    }

    #[test]
    fn test_int_float_partition() {
        assert!(!value_equals(&Value::Int(1), &Value::Float(1.0)));
        assert!(numeric_equals(&Value::Int(1), &Value::Float(1.0)).unwrap());
        assert!(numeric_equals(&Value::Int(1), &Value::Nil).is_err());
    }

    #[test]
    fn test_map_equality_across_impls() {
        let kw_a = Value::keyword("a");
        let kw_b = Value::keyword("b");
        let am = Value::ArrayMap(Arc::new(ArrayMap::from_pairs(vec![
            (kw_a.clone(), Value::Int(1)),
            (kw_b.clone(), Value::Int(2)),
        ])));
        let hm = Value::Map(Arc::new(HashTrieMap::from_pairs(vec![
            (kw_b.clone(), Value::Int(2)),
            (kw_a.clone(), Value::Int(1)),
        ])));
        assert!(value_equals(&am, &hm));

        let different = Value::Map(Arc::new(HashTrieMap::from_pairs(vec![(
            kw_a,
            Value::Int(9),
        )])));
        assert!(!value_equals(&am, &different));
    }

    #[test]
    fn test_compare_vectors_lexicographically() {
        let a = vector(vec![Value::Int(1), Value::Int(2)]);
        let b = vector(vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(value_compare(&a, &b).unwrap(), Ordering::Less);
        let shorter = vector(vec![Value::Int(1)]);
        assert_eq!(value_compare(&shorter, &a).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_nil_sorts_first() {
        assert_eq!(
            value_compare(&Value::Nil, &Value::Int(-100)).unwrap(),
            Ordering::Less
        );
    }
}
