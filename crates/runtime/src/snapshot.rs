//! Bootstrap environment snapshots
//!
//! A tool-mode binary can serialize the post-bootstrap environment into a
//! flat byte sequence: a version tag, a value table deduplicated through
//! back-references by index, and per-namespace var tables. Data values
//! serialize structurally; builtin fns serialize as named references
//! resolved against the registry on restore. Fn values compiled from
//! embedded source are not serialized — their namespaces re-evaluate the
//! embedded source instead, which the loader triggers through the normal
//! bootstrap path. A version mismatch surfaces as an error so the caller
//! rebuilds from source.

use crate::registry;
use sable_core::error::SableError;
use sable_core::hashing::HashKey;
use sable_core::list::PersistentList;
use sable_core::map::{ArrayMap, HashTrieMap};
use sable_core::set::PersistentSet;
use sable_core::symbol::{Keyword, Symbol};
use sable_core::value::Value;
use sable_core::vector::PersistentVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const SNAPSHOT_VERSION: u32 = 3;

/// Owned, serializable mirror of the data subset of `Value`. Children are
/// back-references into the snapshot's value table.
#[derive(Debug, Serialize, Deserialize)]
pub enum TypedValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Symbol(Option<String>, String),
    Keyword(Option<String>, String),
    Regex(String),
    List(Vec<u32>),
    Vector(Vec<u32>),
    Map(Vec<(u32, u32)>),
    ArrayMap(Vec<(u32, u32)>),
    Set(Vec<u32>),
    /// A builtin fn by (namespace, name)
    BuiltinRef(String, String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VarSnapshot {
    pub name: String,
    /// Index into the value table; None for unbound or unserializable roots
    pub root: Option<u32>,
    pub dynamic: bool,
    pub is_macro: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    pub name: String,
    pub vars: Vec<VarSnapshot>,
    pub aliases: Vec<(String, String)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnvSnapshot {
    pub version: u32,
    pub values: Vec<TypedValue>,
    pub namespaces: Vec<NamespaceSnapshot>,
}

#[derive(Default)]
struct ValueTable {
    values: Vec<TypedValue>,
    /// Structural dedup: equal values share one table slot
    index: HashMap<HashKey, u32>,
}

impl ValueTable {
    fn intern(&mut self, v: &Value) -> Option<u32> {
        let key = HashKey(v.clone());
        if let Some(idx) = self.index.get(&key) {
            return Some(*idx);
        }
        let typed = self.convert(v)?;
        let idx = self.values.len() as u32;
        self.values.push(typed);
        self.index.insert(key, idx);
        Some(idx)
    }

    fn convert(&mut self, v: &Value) -> Option<TypedValue> {
        Some(match v {
            Value::Nil => TypedValue::Nil,
            Value::Bool(b) => TypedValue::Bool(*b),
            Value::Int(n) => TypedValue::Int(*n),
            Value::Float(f) => TypedValue::Float(*f),
            Value::Char(c) => TypedValue::Char(*c),
            Value::Str(s) => TypedValue::Str(s.to_string()),
            Value::Symbol(s) => {
                TypedValue::Symbol(s.ns_str().map(str::to_string), s.name_str().to_string())
            }
            Value::Keyword(k) => {
                TypedValue::Keyword(k.ns_str().map(str::to_string), k.name_str().to_string())
            }
            Value::Regex(r) => TypedValue::Regex(r.source.to_string()),
            Value::List(l) => {
                let items: Option<Vec<u32>> = l.iter().map(|i| self.intern(i)).collect();
                TypedValue::List(items?)
            }
            Value::Vector(vec) => {
                let items: Option<Vec<u32>> = vec.iter().map(|i| self.intern(i)).collect();
                TypedValue::Vector(items?)
            }
            Value::ArrayMap(m) => {
                let pairs: Option<Vec<(u32, u32)>> = m
                    .iter()
                    .map(|(k, v)| Some((self.intern(k)?, self.intern(v)?)))
                    .collect();
                TypedValue::ArrayMap(pairs?)
            }
            Value::Map(m) => {
                let pairs: Option<Vec<(u32, u32)>> = m
                    .iter()
                    .map(|(k, v)| Some((self.intern(k)?, self.intern(v)?)))
                    .collect();
                TypedValue::Map(pairs?)
            }
            Value::Set(s) => {
                let items: Option<Vec<u32>> = s.iter().map(|i| self.intern(i)).collect();
                TypedValue::Set(items?)
            }
            Value::Builtin(b) => {
                // Name collides across namespaces; the fn pointer decides
                let (ns, name) = registry::all()
                    .into_iter()
                    .find_map(|def| {
                        def.builtins
                            .iter()
                            .chain(def.macro_builtins.iter())
                            .find(|row| row.name == b.name && std::ptr::fn_addr_eq(row.f, b.f))
                            .map(|row| (def.name.to_string(), row.name.to_string()))
                    })?;
                TypedValue::BuiltinRef(ns, name)
            }
            // Fns, reference cells, transients: not snapshot-able
            _ => return None,
        })
    }
}

/// Serialize the current environment
pub fn save() -> Result<Vec<u8>, SableError> {
    let mut table = ValueTable::default();
    let mut namespaces = Vec::new();
    for ns in crate::env::global().all_ns() {
        let mut vars = Vec::new();
        for name in ns.var_names() {
            if let Some(Value::Var(var)) = ns.lookup(&name) {
                let root = var.root().as_ref().and_then(|v| table.intern(v));
                vars.push(VarSnapshot {
                    name,
                    root,
                    dynamic: var.is_dynamic(),
                    is_macro: var.is_macro(),
                });
            }
        }
        vars.sort_by(|a, b| a.name.cmp(&b.name));
        namespaces.push(NamespaceSnapshot {
            name: ns.name.clone(),
            vars,
            aliases: Vec::new(),
        });
    }
    namespaces.sort_by(|a, b| a.name.cmp(&b.name));
    let snapshot = EnvSnapshot {
        version: SNAPSHOT_VERSION,
        values: table.values,
        namespaces,
    };
    bincode::serialize(&snapshot)
        .map_err(|e| SableError::io(format!("snapshot serialization failed: {}", e)))
}

/// Restore an environment snapshot over the booted registry. Returns an
/// error on version mismatch (the caller falls back to a full bootstrap).
pub fn restore(bytes: &[u8]) -> Result<(), SableError> {
    let snapshot: EnvSnapshot = bincode::deserialize(bytes)
        .map_err(|e| SableError::io(format!("snapshot deserialization failed: {}", e)))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(SableError::value_err(format!(
            "snapshot version {} does not match runtime version {}",
            snapshot.version, SNAPSHOT_VERSION
        )));
    }

    // Rebuild the value table front to back; children always precede
    // their containers, so plain indexing suffices
    let mut values: Vec<Value> = Vec::with_capacity(snapshot.values.len());
    for typed in &snapshot.values {
        let value = materialize_value(typed, &values)?;
        values.push(value);
    }

    let environment = crate::env::global();
    for ns_snapshot in &snapshot.namespaces {
        let ns = environment.find_or_create_ns(&ns_snapshot.name);
        for var_snapshot in &ns_snapshot.vars {
            let var_value = ns.intern(&var_snapshot.name);
            if let Value::Var(var) = &var_value {
                if let Some(root_idx) = var_snapshot.root {
                    let root = values.get(root_idx as usize).cloned().ok_or_else(|| {
                        SableError::value_err("snapshot back-reference out of range")
                    })?;
                    var.bind_root(root);
                }
                var.set_dynamic(var_snapshot.dynamic);
                var.set_macro(var_snapshot.is_macro);
            }
        }
        for (short, full) in &ns_snapshot.aliases {
            ns.add_alias(short, full);
        }
    }
    Ok(())
}

fn materialize_value(typed: &TypedValue, table: &[Value]) -> Result<Value, SableError> {
    let at = |idx: &u32| -> Result<Value, SableError> {
        table
            .get(*idx as usize)
            .cloned()
            .ok_or_else(|| SableError::value_err("snapshot back-reference out of range"))
    };
    Ok(match typed {
        TypedValue::Nil => Value::Nil,
        TypedValue::Bool(b) => Value::Bool(*b),
        TypedValue::Int(n) => Value::Int(*n),
        TypedValue::Float(f) => Value::Float(*f),
        TypedValue::Char(c) => Value::Char(*c),
        TypedValue::Str(s) => Value::string(s),
        TypedValue::Symbol(ns, name) => Value::Symbol(Arc::new(match ns {
            Some(ns) => Symbol::qualified(ns, name),
            None => Symbol::simple(name),
        })),
        TypedValue::Keyword(ns, name) => {
            Value::Keyword(Keyword::intern(ns.as_deref(), name))
        }
        TypedValue::Regex(source) => {
            Value::Regex(Arc::new(sable_core::value::RegexVal::compile(source)?))
        }
        TypedValue::List(items) => {
            let items: Result<Vec<Value>, _> = items.iter().map(at).collect();
            Value::List(Arc::new(PersistentList::from_values(items?)))
        }
        TypedValue::Vector(items) => {
            let items: Result<Vec<Value>, _> = items.iter().map(at).collect();
            Value::Vector(Arc::new(PersistentVector::from_values(items?)))
        }
        TypedValue::ArrayMap(pairs) => {
            let pairs: Result<Vec<(Value, Value)>, SableError> = pairs
                .iter()
                .map(|(k, v)| Ok((at(k)?, at(v)?)))
                .collect();
            Value::ArrayMap(Arc::new(ArrayMap::from_pairs(pairs?)))
        }
        TypedValue::Map(pairs) => {
            let pairs: Result<Vec<(Value, Value)>, SableError> = pairs
                .iter()
                .map(|(k, v)| Ok((at(k)?, at(v)?)))
                .collect();
            Value::Map(Arc::new(HashTrieMap::from_pairs(pairs?)))
        }
        TypedValue::Set(items) => {
            let items: Result<Vec<Value>, _> = items.iter().map(at).collect();
            Value::Set(Arc::new(PersistentSet::from_values(items?)))
        }
        TypedValue::BuiltinRef(ns, name) => {
            let def = registry::builtin_by_name(ns, name).ok_or_else(|| {
                SableError::value_err(format!(
                    "snapshot references unknown builtin {}/{}",
                    ns, name
                ))
            })?;
            let is_macro = registry::all()
                .into_iter()
                .find(|d| d.name == ns)
                .map(|d| d.macro_builtins.iter().any(|b| b.name == name))
                .unwrap_or(false);
            sable_core::gc::alloc(Value::Builtin(Arc::new(sable_core::fns::BuiltinFn {
                name: def.name,
                f: def.f,
                doc: def.doc,
                arglists: def.arglists,
                is_macro,
            })))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_snapshot_round_trip_preserves_data_vars() {
        crate::runtime::init();
        crate::runtime::eval_str("(def snapshot-test-value {:a [1 2] :b #{3}})").unwrap();
        let bytes = save().unwrap();
        restore(&bytes).unwrap();
        let back = crate::runtime::eval_str("snapshot-test-value").unwrap();
        let expected = crate::runtime::eval_str("{:a [1 2] :b #{3}}").unwrap();
        assert!(sable_core::value_equals(&back, &expected));
    }

    #[test]
    #[serial]
    fn test_version_mismatch_rejected() {
        crate::runtime::init();
        let bytes = save().unwrap();
        let mut snapshot: EnvSnapshot = bincode::deserialize(&bytes).unwrap();
        snapshot.version = SNAPSHOT_VERSION + 1;
        let tampered = bincode::serialize(&snapshot).unwrap();
        let err = restore(&tampered).unwrap_err();
        assert!(err.message.contains("version"));
    }

    #[test]
    #[serial]
    fn test_value_table_dedupes_shared_structure() {
        let shared = Value::string("shared");
        let mut table = ValueTable::default();
        let a = table.intern(&shared).unwrap();
        let b = table.intern(&Value::string("shared")).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.values.len(), 1);
    }
}
