//! Structural hashing with the `equals(a, b) ⇒ hash(a) = hash(b)` contract
//!
//! Sequential collections hash ordered (any representation of the same
//! elements hashes alike), maps and sets hash order-independently, and
//! reference types hash by identity (matching their identity equality).

use crate::cmp::value_equals;
use crate::seqs;
use crate::value::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

// Tag salts keep the partitions from colliding trivially
const SALT_SEQ: u64 = 0x5351;
const SALT_MAP: u64 = 0x4d41;
const SALT_SET: u64 = 0x5345;
const SALT_SYM: u64 = 0x53_59_4d << 8;
const SALT_KW: u64 = 0x4b_57 << 24;

fn hash_one<T: Hash>(t: &T) -> u64 {
    let mut h = DefaultHasher::new();
    t.hash(&mut h);
    h.finish()
}

fn mix(seed: u64, item: u64) -> u64 {
    seed.wrapping_mul(31).wrapping_add(item)
}

/// Structural hash of any value
pub fn value_hash(v: &Value) -> u64 {
    match v {
        Value::Nil => 0,
        Value::Bool(b) => hash_one(b),
        Value::Int(n) => hash_one(n),
        Value::Float(f) => hash_one(&f.to_bits()),
        Value::Char(c) => hash_one(c),
        Value::Str(s) => hash_one(&&**s),
        Value::Symbol(s) => hash_one(&**s) ^ SALT_SYM,
        Value::Keyword(k) => hash_one(k) ^ SALT_KW,
        Value::Regex(r) => hash_one(&&*r.source),
        Value::Reduced(inner) => value_hash(inner).wrapping_add(1),

        Value::List(_) | Value::Vector(_) | Value::Cons(_) | Value::LazySeq(_) => {
            let mut h = SALT_SEQ;
            for item in seqs::iter(v) {
                match item {
                    Ok(item) => h = mix(h, value_hash(&item)),
                    Err(_) => return SALT_SEQ,
                }
            }
            h
        }

        Value::ArrayMap(m) => hash_map_entries(m.iter().map(|(k, v)| (k, v))),
        Value::Map(m) => hash_map_entries(m.iter()),

        Value::Set(s) => {
            let mut h = SALT_SET;
            for member in s.iter() {
                h = h.wrapping_add(value_hash(member));
            }
            h
        }

        // Identity partition: hash by payload address
        other => other.heap_addr().map(|addr| hash_one(&addr)).unwrap_or(0),
    }
}

fn hash_map_entries<'a>(entries: impl Iterator<Item = (&'a Value, &'a Value)>) -> u64 {
    let mut h = SALT_MAP;
    for (k, v) in entries {
        // Unordered combine: per-entry mix, commutative fold
        h = h.wrapping_add(value_hash(k) ^ value_hash(v).rotate_left(16));
    }
    h
}

/// Wrapper giving `Value` the std `Hash`/`Eq` contract for use as a native
/// hash-table key (transients, memoization tables)
#[derive(Debug, Clone)]
pub struct HashKey(pub Value);

impl PartialEq for HashKey {
    fn eq(&self, other: &Self) -> bool {
        value_equals(&self.0, &other.0)
    }
}

impl Eq for HashKey {}

impl Hash for HashKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(value_hash(&self.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::PersistentList;
    use crate::map::{ArrayMap, HashTrieMap};
    use crate::set::PersistentSet;
    use crate::vector::PersistentVector;
    use std::sync::Arc;

    #[test]
    fn test_equal_seqs_hash_alike_across_representations() {
        let l = Value::List(Arc::new(PersistentList::from_values(vec![
            Value::Int(1),
            Value::Int(2),
        ])));
        let v = Value::Vector(Arc::new(PersistentVector::from_values(vec![
            Value::Int(1),
            Value::Int(2),
        ])));
        assert_eq!(value_hash(&l), value_hash(&v));
    }

    #[test]
    fn test_map_hash_is_insertion_order_independent() {
        let a = Value::keyword("a");
        let b = Value::keyword("b");
        let m1 = Value::ArrayMap(Arc::new(ArrayMap::from_pairs(vec![
            (a.clone(), Value::Int(1)),
            (b.clone(), Value::Int(2)),
        ])));
        let m2 = Value::Map(Arc::new(HashTrieMap::from_pairs(vec![
            (b, Value::Int(2)),
            (a, Value::Int(1)),
        ])));
        assert_eq!(value_hash(&m1), value_hash(&m2));
    }

    #[test]
    fn test_set_hash_order_independent() {
        let s1 = Value::Set(Arc::new(PersistentSet::from_values(vec![
            Value::Int(1),
            Value::Int(2),
        ])));
        let s2 = Value::Set(Arc::new(PersistentSet::from_values(vec![
            Value::Int(2),
            Value::Int(1),
        ])));
        assert_eq!(value_hash(&s1), value_hash(&s2));
    }

    #[test]
    fn test_distinct_values_usually_differ() {
        assert_ne!(value_hash(&Value::Int(1)), value_hash(&Value::Int(2)));
        assert_ne!(
            value_hash(&Value::string("a")),
            value_hash(&Value::keyword("a"))
        );
    }
}
