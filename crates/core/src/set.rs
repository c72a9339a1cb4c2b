//! Persistent hash set, backed by the same trie as the hash map

use crate::map::HashTrieMap;
use crate::value::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct PersistentSet {
    impl_: HashTrieMap,
    meta: Option<Arc<Value>>,
}

impl PersistentSet {
    pub fn new() -> PersistentSet {
        PersistentSet::default()
    }

    pub fn from_values(items: Vec<Value>) -> PersistentSet {
        let mut s = PersistentSet::new();
        for item in items {
            s = s.conj(item);
        }
        s
    }

    pub fn len(&self) -> usize {
        self.impl_.len()
    }

    pub fn is_empty(&self) -> bool {
        self.impl_.is_empty()
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.impl_.contains_key(value)
    }

    /// The member equal to `value`, if present
    pub fn get(&self, value: &Value) -> Option<Value> {
        if self.impl_.contains_key(value) {
            Some(value.clone())
        } else {
            None
        }
    }

    pub fn conj(&self, value: Value) -> PersistentSet {
        PersistentSet {
            impl_: self.impl_.assoc(value, Value::Bool(true)),
            meta: None,
        }
    }

    pub fn disj(&self, value: &Value) -> PersistentSet {
        PersistentSet {
            impl_: self.impl_.dissoc(value),
            meta: None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.impl_.iter().map(|(k, _)| k)
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.iter().cloned().collect()
    }

    pub fn meta(&self) -> Option<Value> {
        self.meta.as_deref().cloned()
    }

    pub fn with_meta(&self, meta: Option<Value>) -> PersistentSet {
        PersistentSet {
            impl_: self.impl_.clone(),
            meta: meta.map(Arc::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conj_disj_contains() {
        let s = PersistentSet::from_values(vec![Value::Int(1), Value::Int(2), Value::Int(2)]);
        assert_eq!(s.len(), 2);
        assert!(s.contains(&Value::Int(1)));

        let s2 = s.disj(&Value::Int(1));
        assert!(!s2.contains(&Value::Int(1)));
        assert!(s.contains(&Value::Int(1)));
    }

    #[test]
    fn test_get_returns_stored_member() {
        let s = PersistentSet::from_values(vec![Value::string("x")]);
        match s.get(&Value::string("x")) {
            Some(Value::Str(v)) => assert_eq!(&*v, "x"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(s.get(&Value::string("y")).is_none());
    }
}
