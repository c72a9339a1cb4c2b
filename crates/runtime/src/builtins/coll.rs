//! Collection builtins: constructors, associative ops, transients
//!
//! Persistent operations return new values sharing structure; transient
//! operations mutate in place and seal on persistent!. Array-maps promote
//! to hash-maps past the flat threshold.

use super::{b, check_exact, check_min, check_range};
use crate::call::lookup;
use crate::registry::BuiltinDef;
use sable_core::error::SableError;
use sable_core::gc;
use sable_core::list::PersistentList;
use sable_core::map::{ARRAY_MAP_THRESHOLD, ArrayMap, HashTrieMap};
use sable_core::seqs;
use sable_core::set::PersistentSet;
use sable_core::transient::{TransientMap, TransientSet, TransientVector};
use sable_core::value::Value;
use sable_core::vector::PersistentVector;
use std::sync::Arc;

pub fn builtins() -> Vec<BuiltinDef> {
    vec![
        b!("list", list, "([& items])", "Returns a new list containing the items."),
        b!("vector", vector, "([& items])", "Returns a new vector containing the items."),
        b!("vec", vec_coerce, "([coll])", "Returns a vector of the items in coll."),
        b!("hash-map", hash_map, "([& kvs])", "Returns a new map with the supplied key-value pairs."),
        b!("array-map", array_map, "([& kvs])", "Returns a flat ordered map with the supplied pairs."),
        b!("hash-set", hash_set, "([& items])", "Returns a new set of the distinct items."),
        b!("set", set_coerce, "([coll])", "Returns a set of the distinct items in coll."),
        b!("get", get, "([map key] [map key not-found])", "Returns the value mapped to key, or not-found."),
        b!("get-in", get_in, "([m ks] [m ks not-found])", "Returns the value at a nested key path."),
        b!("assoc", assoc, "([coll key val & kvs])", "Returns a new collection with key mapped to val."),
        b!("assoc-in", assoc_in, "([m ks v])", "Associates a value at a nested key path."),
        b!("update", update, "([m k f & args])", "Returns a map with the value at k transformed by f."),
        b!("update-in", update_in, "([m ks f & args])", "Transforms the value at a nested key path."),
        b!("dissoc", dissoc, "([map & keys])", "Returns a new map without mappings for keys."),
        b!("disj", disj, "([set & items])", "Returns a new set without the items."),
        b!("conj", conj, "([coll & items])", "Adds items to coll at its natural insertion point."),
        b!("contains?", contains_p, "([coll key])", "True if coll has an entry for key."),
        b!("count", count, "([coll])", "Number of items in the collection."),
        b!("empty?", empty_p, "([coll])", "True if coll has no items."),
        b!("not-empty", not_empty, "([coll])", "coll if it has items, else nil."),
        b!("keys", keys, "([map])", "A seq of the map's keys."),
        b!("vals", vals, "([map])", "A seq of the map's values."),
        b!("zipmap", zipmap, "([keys vals])", "A map pairing keys with vals."),
        b!("merge", merge, "([& maps])", "Merges maps left to right."),
        b!("select-keys", select_keys, "([map keyseq])", "A map of only the entries whose key is in keyseq."),
        b!("peek", peek, "([coll])", "Last of a vector, first of a list."),
        b!("pop", pop, "([coll])", "Without peek's item."),
        b!("subvec", subvec, "([v start] [v start end])", "A vector of the items from start to end."),
        b!("nth", nth, "([coll index] [coll index not-found])", "The item at index; errors without not-found."),
        b!("transient", transient, "([coll])", "A mutable shell of a vector, map, or set."),
        b!("persistent!", persistent_bang, "([tcoll])", "Seals a transient back into a persistent collection."),
        b!("conj!", conj_bang, "([tcoll item])", "Adds an item to a transient collection."),
        b!("assoc!", assoc_bang, "([tcoll key val])", "Associates a key in a transient collection."),
        b!("dissoc!", dissoc_bang, "([tmap key])", "Removes a key from a transient map."),
        b!("disj!", disj_bang, "([tset item])", "Removes an item from a transient set."),
        b!("vector?", vector_p, "([x])", "True if x is a vector."),
        b!("map?", map_p, "([x])", "True if x is a map."),
        b!("set?", set_p, "([x])", "True if x is a set."),
        b!("list?", list_p, "([x])", "True if x is a list."),
        b!("coll?", coll_p, "([x])", "True if x is a collection."),
        b!("associative?", associative_p, "([x])", "True if x supports key lookup."),
    ]
}

fn list(args: &[Value]) -> Result<Value, SableError> {
    Ok(gc::alloc(Value::List(Arc::new(PersistentList::from_values(
        args.to_vec(),
    )))))
}

fn vector(args: &[Value]) -> Result<Value, SableError> {
    Ok(gc::alloc(Value::Vector(Arc::new(
        PersistentVector::from_values(args.to_vec()),
    ))))
}

fn vec_coerce(args: &[Value]) -> Result<Value, SableError> {
    check_exact("vec", args, 1)?;
    match &args[0] {
        Value::Vector(_) => Ok(args[0].clone()),
        other => {
            let items = seqs::collect(other)?;
            vector(&items)
        }
    }
}

pub(crate) fn map_from_pairs(pairs: Vec<(Value, Value)>) -> Value {
    if pairs.len() <= ARRAY_MAP_THRESHOLD {
        gc::alloc(Value::ArrayMap(Arc::new(ArrayMap::from_pairs(pairs))))
    } else {
        gc::alloc(Value::Map(Arc::new(HashTrieMap::from_pairs(pairs))))
    }
}

fn hash_map(args: &[Value]) -> Result<Value, SableError> {
    if args.len() % 2 != 0 {
        return Err(SableError::value_err(
            "hash-map requires an even number of arguments",
        ));
    }
    let pairs: Vec<(Value, Value)> = args
        .chunks(2)
        .map(|kv| (kv[0].clone(), kv[1].clone()))
        .collect();
    Ok(map_from_pairs(pairs))
}

fn array_map(args: &[Value]) -> Result<Value, SableError> {
    if args.len() % 2 != 0 {
        return Err(SableError::value_err(
            "array-map requires an even number of arguments",
        ));
    }
    let pairs: Vec<(Value, Value)> = args
        .chunks(2)
        .map(|kv| (kv[0].clone(), kv[1].clone()))
        .collect();
    Ok(gc::alloc(Value::ArrayMap(Arc::new(ArrayMap::from_pairs(
        pairs,
    )))))
}

fn hash_set(args: &[Value]) -> Result<Value, SableError> {
    Ok(gc::alloc(Value::Set(Arc::new(PersistentSet::from_values(
        args.to_vec(),
    )))))
}

fn set_coerce(args: &[Value]) -> Result<Value, SableError> {
    check_exact("set", args, 1)?;
    match &args[0] {
        Value::Set(_) => Ok(args[0].clone()),
        other => {
            let items = seqs::collect(other)?;
            hash_set(&items)
        }
    }
}

fn get(args: &[Value]) -> Result<Value, SableError> {
    check_range("get", args, 2, 3)?;
    let found = lookup(&args[0], &args[1])?;
    Ok(found.unwrap_or_else(|| args.get(2).cloned().unwrap_or(Value::Nil)))
}

fn get_in(args: &[Value]) -> Result<Value, SableError> {
    check_range("get-in", args, 2, 3)?;
    let mut current = args[0].clone();
    for key in seqs::iter(&args[1]) {
        let key = key?;
        match lookup(&current, &key)? {
            Some(v) => current = v,
            None => return Ok(args.get(2).cloned().unwrap_or(Value::Nil)),
        }
    }
    Ok(current)
}

pub(crate) fn assoc_one(coll: &Value, key: Value, val: Value) -> Result<Value, SableError> {
    match coll {
        Value::Nil => Ok(map_from_pairs(vec![(key, val)])),
        Value::ArrayMap(m) => {
            let updated = m.assoc(key, val);
            if updated.len() > ARRAY_MAP_THRESHOLD {
                let pairs: Vec<(Value, Value)> = updated.iter().cloned().collect();
                Ok(gc::alloc(Value::Map(Arc::new(HashTrieMap::from_pairs(
                    pairs,
                )))))
            } else {
                Ok(gc::alloc(Value::ArrayMap(Arc::new(updated))))
            }
        }
        Value::Map(m) => Ok(gc::alloc(Value::Map(Arc::new(m.assoc(key, val))))),
        Value::Vector(v) => match key {
            Value::Int(i) if i >= 0 => Ok(gc::alloc(Value::Vector(Arc::new(
                v.assoc(i as usize, val)?,
            )))),
            other => Err(SableError::type_err(format!(
                "vector assoc index must be a non-negative integer, got {}",
                other.type_name()
            ))),
        },
        other => Err(SableError::type_err(format!(
            "assoc not supported on {}",
            other.type_name()
        ))),
    }
}

fn assoc(args: &[Value]) -> Result<Value, SableError> {
    check_min("assoc", args, 3)?;
    if args.len() % 2 != 1 {
        return Err(SableError::value_err(
            "assoc requires an even number of key-value arguments",
        ));
    }
    let mut coll = args[0].clone();
    for kv in args[1..].chunks(2) {
        coll = assoc_one(&coll, kv[0].clone(), kv[1].clone())?;
    }
    Ok(coll)
}

fn assoc_in(args: &[Value]) -> Result<Value, SableError> {
    check_exact("assoc-in", args, 3)?;
    let keys = seqs::collect(&args[1])?;
    if keys.is_empty() {
        return Err(SableError::value_err("assoc-in requires at least one key"));
    }
    assoc_in_rec(&args[0], &keys, args[2].clone())
}

fn assoc_in_rec(coll: &Value, keys: &[Value], val: Value) -> Result<Value, SableError> {
    if keys.len() == 1 {
        assoc_one(coll, keys[0].clone(), val)
    } else {
        let inner = lookup(coll, &keys[0])?.unwrap_or(Value::Nil);
        let updated = assoc_in_rec(&inner, &keys[1..], val)?;
        assoc_one(coll, keys[0].clone(), updated)
    }
}

fn update(args: &[Value]) -> Result<Value, SableError> {
    check_min("update", args, 3)?;
    let current = lookup(&args[0], &args[1])?.unwrap_or(Value::Nil);
    let mut call_args = vec![current];
    call_args.extend_from_slice(&args[3..]);
    let updated = crate::call::call_value(&args[2], &call_args)?;
    assoc_one(&args[0], args[1].clone(), updated)
}

fn update_in(args: &[Value]) -> Result<Value, SableError> {
    check_min("update-in", args, 3)?;
    let keys = seqs::collect(&args[1])?;
    if keys.is_empty() {
        return Err(SableError::value_err("update-in requires at least one key"));
    }
    update_in_rec(&args[0], &keys, &args[2], &args[3..])
}

fn update_in_rec(
    coll: &Value,
    keys: &[Value],
    f: &Value,
    extra: &[Value],
) -> Result<Value, SableError> {
    if keys.len() == 1 {
        let current = lookup(coll, &keys[0])?.unwrap_or(Value::Nil);
        let mut call_args = vec![current];
        call_args.extend_from_slice(extra);
        let updated = crate::call::call_value(f, &call_args)?;
        assoc_one(coll, keys[0].clone(), updated)
    } else {
        let inner = lookup(coll, &keys[0])?.unwrap_or(Value::Nil);
        let updated = update_in_rec(&inner, &keys[1..], f, extra)?;
        assoc_one(coll, keys[0].clone(), updated)
    }
}

fn dissoc(args: &[Value]) -> Result<Value, SableError> {
    check_min("dissoc", args, 1)?;
    let mut coll = args[0].clone();
    for key in &args[1..] {
        coll = match &coll {
            Value::Nil => Value::Nil,
            Value::ArrayMap(m) => gc::alloc(Value::ArrayMap(Arc::new(m.dissoc(key)))),
            Value::Map(m) => gc::alloc(Value::Map(Arc::new(m.dissoc(key)))),
            other => {
                return Err(SableError::type_err(format!(
                    "dissoc not supported on {}",
                    other.type_name()
                )));
            }
        };
    }
    Ok(coll)
}

fn disj(args: &[Value]) -> Result<Value, SableError> {
    check_min("disj", args, 1)?;
    match &args[0] {
        Value::Set(s) => {
            let mut set = (**s).clone();
            for item in &args[1..] {
                set = set.disj(item);
            }
            Ok(gc::alloc(Value::Set(Arc::new(set))))
        }
        Value::Nil => Ok(Value::Nil),
        other => Err(SableError::type_err(format!(
            "disj not supported on {}",
            other.type_name()
        ))),
    }
}

pub(crate) fn conj_one(coll: &Value, item: Value) -> Result<Value, SableError> {
    match coll {
        Value::Nil => Ok(gc::alloc(Value::List(Arc::new(
            PersistentList::from_values(vec![item]),
        )))),
        Value::List(l) => Ok(gc::alloc(Value::List(Arc::new(l.push_front(item))))),
        Value::Vector(v) => Ok(gc::alloc(Value::Vector(Arc::new(v.push(item))))),
        Value::Set(s) => Ok(gc::alloc(Value::Set(Arc::new(s.conj(item))))),
        Value::ArrayMap(_) | Value::Map(_) => match &item {
            Value::Vector(kv) if kv.len() == 2 => assoc_one(
                coll,
                kv.get(0).cloned().unwrap_or(Value::Nil),
                kv.get(1).cloned().unwrap_or(Value::Nil),
            ),
            Value::ArrayMap(m) => {
                let mut acc = coll.clone();
                for (k, v) in m.iter() {
                    acc = assoc_one(&acc, k.clone(), v.clone())?;
                }
                Ok(acc)
            }
            Value::Map(m) => {
                let mut acc = coll.clone();
                for (k, v) in m.iter() {
                    acc = assoc_one(&acc, k.clone(), v.clone())?;
                }
                Ok(acc)
            }
            other => Err(SableError::type_err(format!(
                "can't conj {} into a map",
                other.type_name()
            ))),
        },
        Value::Cons(_) | Value::LazySeq(_) => {
            Ok(gc::alloc(Value::Cons(Arc::new(sable_core::seqs::Cons::new(
                item,
                coll.clone(),
            )))))
        }
        other => Err(SableError::type_err(format!(
            "conj not supported on {}",
            other.type_name()
        ))),
    }
}

fn conj(args: &[Value]) -> Result<Value, SableError> {
    check_min("conj", args, 1)?;
    let mut coll = args[0].clone();
    for item in &args[1..] {
        coll = conj_one(&coll, item.clone())?;
    }
    Ok(coll)
}

fn contains_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("contains?", args, 2)?;
    Ok(Value::Bool(match &args[0] {
        Value::Nil => false,
        Value::ArrayMap(m) => m.contains_key(&args[1]),
        Value::Map(m) => m.contains_key(&args[1]),
        Value::Set(s) => s.contains(&args[1]),
        Value::Vector(v) => match &args[1] {
            Value::Int(i) => *i >= 0 && (*i as usize) < v.len(),
            _ => false,
        },
        Value::Str(s) => match &args[1] {
            Value::Int(i) => *i >= 0 && (*i as usize) < s.chars().count(),
            _ => false,
        },
        other => {
            return Err(SableError::type_err(format!(
                "contains? not supported on {}",
                other.type_name()
            )));
        }
    }))
}

fn count(args: &[Value]) -> Result<Value, SableError> {
    check_exact("count", args, 1)?;
    Ok(Value::Int(seqs::count(&args[0])? as i64))
}

fn empty_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("empty?", args, 1)?;
    Ok(Value::Bool(matches!(seqs::seq(&args[0])?, Value::Nil)))
}

fn not_empty(args: &[Value]) -> Result<Value, SableError> {
    check_exact("not-empty", args, 1)?;
    match seqs::seq(&args[0])? {
        Value::Nil => Ok(Value::Nil),
        _ => Ok(args[0].clone()),
    }
}

fn map_entries(v: &Value) -> Result<Vec<(Value, Value)>, SableError> {
    match v {
        Value::Nil => Ok(vec![]),
        Value::ArrayMap(m) => Ok(m.iter().cloned().collect()),
        Value::Map(m) => Ok(m.to_pairs()),
        other => Err(SableError::type_err(format!(
            "expected a map, got {}",
            other.type_name()
        ))),
    }
}

fn keys(args: &[Value]) -> Result<Value, SableError> {
    check_exact("keys", args, 1)?;
    let ks: Vec<Value> = map_entries(&args[0])?.into_iter().map(|(k, _)| k).collect();
    if ks.is_empty() {
        return Ok(Value::Nil);
    }
    list(&ks)
}

fn vals(args: &[Value]) -> Result<Value, SableError> {
    check_exact("vals", args, 1)?;
    let vs: Vec<Value> = map_entries(&args[0])?.into_iter().map(|(_, v)| v).collect();
    if vs.is_empty() {
        return Ok(Value::Nil);
    }
    list(&vs)
}

fn zipmap(args: &[Value]) -> Result<Value, SableError> {
    check_exact("zipmap", args, 2)?;
    let ks = seqs::collect(&args[0])?;
    let vs = seqs::collect(&args[1])?;
    let pairs: Vec<(Value, Value)> = ks.into_iter().zip(vs).collect();
    Ok(map_from_pairs(pairs))
}

fn merge(args: &[Value]) -> Result<Value, SableError> {
    if args.is_empty() {
        return Ok(Value::Nil);
    }
    let mut acc = args[0].clone();
    for m in &args[1..] {
        if matches!(m, Value::Nil) {
            continue;
        }
        if matches!(acc, Value::Nil) {
            acc = m.clone();
            continue;
        }
        for (k, v) in map_entries(m)? {
            acc = assoc_one(&acc, k, v)?;
        }
    }
    Ok(acc)
}

fn select_keys(args: &[Value]) -> Result<Value, SableError> {
    check_exact("select-keys", args, 2)?;
    let mut pairs = Vec::new();
    for key in seqs::iter(&args[1]) {
        let key = key?;
        if let Some(v) = lookup(&args[0], &key)? {
            pairs.push((key, v));
        }
    }
    Ok(map_from_pairs(pairs))
}

fn peek(args: &[Value]) -> Result<Value, SableError> {
    check_exact("peek", args, 1)?;
    match &args[0] {
        Value::Nil => Ok(Value::Nil),
        Value::Vector(v) => Ok(v.peek().cloned().unwrap_or(Value::Nil)),
        Value::List(l) => Ok(l.first().cloned().unwrap_or(Value::Nil)),
        other => Err(SableError::type_err(format!(
            "peek not supported on {}",
            other.type_name()
        ))),
    }
}

fn pop(args: &[Value]) -> Result<Value, SableError> {
    check_exact("pop", args, 1)?;
    match &args[0] {
        Value::Vector(v) => Ok(gc::alloc(Value::Vector(Arc::new(v.pop()?)))),
        Value::List(l) => {
            if l.is_empty() {
                Err(SableError::value_err("can't pop empty list"))
            } else {
                Ok(gc::alloc(Value::List(Arc::new(l.rest()))))
            }
        }
        other => Err(SableError::type_err(format!(
            "pop not supported on {}",
            other.type_name()
        ))),
    }
}

fn subvec(args: &[Value]) -> Result<Value, SableError> {
    check_range("subvec", args, 2, 3)?;
    let v = match &args[0] {
        Value::Vector(v) => v,
        other => {
            return Err(SableError::type_err(format!(
                "subvec expects a vector, got {}",
                other.type_name()
            )));
        }
    };
    let start = super::int_arg("subvec", args, 1)? as usize;
    let end = match args.get(2) {
        Some(_) => super::int_arg("subvec", args, 2)? as usize,
        None => v.len(),
    };
    if start > end || end > v.len() {
        return Err(SableError::index(format!(
            "subvec range {}..{} out of bounds for vector of {}",
            start,
            end,
            v.len()
        )));
    }
    let items: Vec<Value> = (start..end)
        .map(|i| v.get(i).cloned().expect("bounds checked"))
        .collect();
    vector(&items)
}

fn nth(args: &[Value]) -> Result<Value, SableError> {
    check_range("nth", args, 2, 3)?;
    let idx = super::int_arg("nth", args, 1)?;
    let fallback = args.get(2).cloned();
    if idx < 0 {
        return fallback.ok_or_else(|| SableError::index("nth with negative index"));
    }
    let idx = idx as usize;
    match &args[0] {
        Value::Vector(v) => match v.get(idx) {
            Some(item) => Ok(item.clone()),
            None => fallback.ok_or_else(|| {
                SableError::index(format!(
                    "index {} out of bounds for vector of {}",
                    idx,
                    v.len()
                ))
            }),
        },
        Value::Str(s) => match s.chars().nth(idx) {
            Some(c) => Ok(Value::Char(c)),
            None => fallback.ok_or_else(|| SableError::index("string index out of bounds")),
        },
        Value::Nil => fallback.ok_or_else(|| SableError::index("nth on nil")),
        seqable => {
            for (i, item) in seqs::iter(seqable).enumerate() {
                let item = item?;
                if i == idx {
                    return Ok(item);
                }
            }
            fallback.ok_or_else(|| SableError::index(format!("index {} out of bounds", idx)))
        }
    }
}

fn transient(args: &[Value]) -> Result<Value, SableError> {
    check_exact("transient", args, 1)?;
    match &args[0] {
        Value::Vector(v) => Ok(gc::alloc(Value::TransientVector(Arc::new(
            TransientVector::from_persistent(v),
        )))),
        Value::ArrayMap(m) => Ok(gc::alloc(Value::TransientMap(Arc::new(
            TransientMap::from_entries(m.iter().cloned().collect()),
        )))),
        Value::Map(m) => Ok(gc::alloc(Value::TransientMap(Arc::new(
            TransientMap::from_entries(m.to_pairs()),
        )))),
        Value::Set(s) => Ok(gc::alloc(Value::TransientSet(Arc::new(
            TransientSet::from_persistent(s),
        )))),
        other => Err(SableError::type_err(format!(
            "transient not supported on {}",
            other.type_name()
        ))),
    }
}

fn persistent_bang(args: &[Value]) -> Result<Value, SableError> {
    check_exact("persistent!", args, 1)?;
    match &args[0] {
        Value::TransientVector(t) => Ok(gc::alloc(Value::Vector(Arc::new(t.persist()?)))),
        Value::TransientMap(t) => Ok(gc::alloc(t.persist()?)),
        Value::TransientSet(t) => Ok(gc::alloc(Value::Set(Arc::new(t.persist()?)))),
        other => Err(SableError::type_err(format!(
            "persistent! expects a transient, got {}",
            other.type_name()
        ))),
    }
}

fn conj_bang(args: &[Value]) -> Result<Value, SableError> {
    check_exact("conj!", args, 2)?;
    match &args[0] {
        Value::TransientVector(t) => {
            t.conj(args[1].clone())?;
            Ok(args[0].clone())
        }
        Value::TransientSet(t) => {
            t.conj(args[1].clone())?;
            Ok(args[0].clone())
        }
        Value::TransientMap(t) => match &args[1] {
            Value::Vector(kv) if kv.len() == 2 => {
                t.assoc(
                    kv.get(0).cloned().unwrap_or(Value::Nil),
                    kv.get(1).cloned().unwrap_or(Value::Nil),
                )?;
                Ok(args[0].clone())
            }
            other => Err(SableError::type_err(format!(
                "can't conj! {} into a transient map",
                other.type_name()
            ))),
        },
        other => Err(SableError::type_err(format!(
            "conj! expects a transient, got {}",
            other.type_name()
        ))),
    }
}

fn assoc_bang(args: &[Value]) -> Result<Value, SableError> {
    check_exact("assoc!", args, 3)?;
    match &args[0] {
        Value::TransientMap(t) => {
            t.assoc(args[1].clone(), args[2].clone())?;
            Ok(args[0].clone())
        }
        Value::TransientVector(t) => {
            let idx = super::int_arg("assoc!", args, 1)?;
            t.assoc(idx as usize, args[2].clone())?;
            Ok(args[0].clone())
        }
        other => Err(SableError::type_err(format!(
            "assoc! expects a transient, got {}",
            other.type_name()
        ))),
    }
}

fn dissoc_bang(args: &[Value]) -> Result<Value, SableError> {
    check_exact("dissoc!", args, 2)?;
    match &args[0] {
        Value::TransientMap(t) => {
            t.dissoc(&args[1])?;
            Ok(args[0].clone())
        }
        other => Err(SableError::type_err(format!(
            "dissoc! expects a transient map, got {}",
            other.type_name()
        ))),
    }
}

fn disj_bang(args: &[Value]) -> Result<Value, SableError> {
    check_exact("disj!", args, 2)?;
    match &args[0] {
        Value::TransientSet(t) => {
            t.disj(&args[1])?;
            Ok(args[0].clone())
        }
        other => Err(SableError::type_err(format!(
            "disj! expects a transient set, got {}",
            other.type_name()
        ))),
    }
}

fn vector_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("vector?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Vector(_))))
}

fn map_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("map?", args, 1)?;
    Ok(Value::Bool(matches!(
        args[0],
        Value::ArrayMap(_) | Value::Map(_)
    )))
}

fn set_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("set?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Set(_))))
}

fn list_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("list?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::List(_))))
}

fn coll_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("coll?", args, 1)?;
    Ok(Value::Bool(matches!(
        args[0],
        Value::List(_)
            | Value::Vector(_)
            | Value::ArrayMap(_)
            | Value::Map(_)
            | Value::Set(_)
            | Value::Cons(_)
            | Value::LazySeq(_)
    )))
}

fn associative_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("associative?", args, 1)?;
    Ok(Value::Bool(matches!(
        args[0],
        Value::ArrayMap(_) | Value::Map(_) | Value::Vector(_)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assoc_promotes_array_map() {
        let mut m = map_from_pairs(vec![]);
        for i in 0..12 {
            m = assoc_one(&m, Value::Int(i), Value::Int(i)).unwrap();
        }
        assert!(matches!(m, Value::Map(_)));
        let small = assoc_one(&Value::Nil, Value::Int(1), Value::Int(2)).unwrap();
        assert!(matches!(small, Value::ArrayMap(_)));
    }

    #[test]
    fn test_conj_insertion_points() {
        let l = list(&[Value::Int(2)]).unwrap();
        let l2 = conj(&[l, Value::Int(1)]).unwrap();
        match &l2 {
            Value::List(pl) => assert!(matches!(pl.first(), Some(Value::Int(1)))),
            other => panic!("unexpected {:?}", other),
        }
        let v = vector(&[Value::Int(1)]).unwrap();
        let v2 = conj(&[v, Value::Int(2)]).unwrap();
        match &v2 {
            Value::Vector(pv) => assert!(matches!(pv.get(1), Some(Value::Int(2)))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_nth_with_and_without_default() {
        let v = vector(&[Value::Int(10), Value::Int(20)]).unwrap();
        assert!(matches!(
            nth(&[v.clone(), Value::Int(1)]).unwrap(),
            Value::Int(20)
        ));
        assert!(nth(&[v.clone(), Value::Int(9)]).is_err());
        assert!(matches!(
            nth(&[v, Value::Int(9), Value::keyword("missing")]).unwrap(),
            Value::Keyword(_)
        ));
    }

    #[test]
    fn test_get_in_and_assoc_in() {
        let inner = map_from_pairs(vec![(Value::keyword("b"), Value::Int(1))]);
        let outer = map_from_pairs(vec![(Value::keyword("a"), inner)]);
        let path = vector(&[Value::keyword("a"), Value::keyword("b")]).unwrap();
        assert!(matches!(
            get_in(&[outer.clone(), path.clone()]).unwrap(),
            Value::Int(1)
        ));
        let updated = assoc_in(&[outer, path.clone(), Value::Int(9)]).unwrap();
        assert!(matches!(get_in(&[updated, path]).unwrap(), Value::Int(9)));
    }

    #[test]
    fn test_transient_round_trip() {
        let v = vector(&[Value::Int(1)]).unwrap();
        let t = transient(&[v.clone()]).unwrap();
        conj_bang(&[t.clone(), Value::Int(2)]).unwrap();
        let sealed = persistent_bang(&[t.clone()]).unwrap();
        assert!(matches!(seqs::count(&sealed), Ok(2)));
        // Source collection never observes the mutation
        assert!(matches!(seqs::count(&v), Ok(1)));
        // Transient is unusable after sealing
        assert!(conj_bang(&[t, Value::Int(3)]).is_err());
    }
}
