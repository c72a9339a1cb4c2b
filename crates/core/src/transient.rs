//! Transient collections: mutable shells for batch construction
//!
//! A transient is created from a persistent collection, edited in place,
//! and sealed by `persistent!`. Mutation is never visible to holders of the
//! source collection, and a sealed transient rejects further edits.

use crate::cmp::value_equals;
use crate::error::SableError;
use crate::hashing::HashKey;
use crate::map::{ARRAY_MAP_THRESHOLD, ArrayMap, HashTrieMap};
use crate::set::PersistentSet;
use crate::value::Value;
use crate::vector::PersistentVector;
use std::collections::HashMap;
use std::sync::Mutex;

fn sealed_err() -> SableError {
    SableError::value_err("transient used after persistent! call")
}

#[derive(Debug)]
struct TransientState<T> {
    data: T,
    editable: bool,
}

/// Mutable vector shell
#[derive(Debug)]
pub struct TransientVector {
    state: Mutex<TransientState<Vec<Value>>>,
}

impl TransientVector {
    pub fn from_persistent(v: &PersistentVector) -> TransientVector {
        TransientVector {
            state: Mutex::new(TransientState {
                data: v.to_vec(),
                editable: true,
            }),
        }
    }

    pub fn len(&self) -> Result<usize, SableError> {
        let guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        Ok(guard.data.len())
    }

    pub fn conj(&self, value: Value) -> Result<(), SableError> {
        let mut guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        guard.data.push(value);
        Ok(())
    }

    pub fn assoc(&self, idx: usize, value: Value) -> Result<(), SableError> {
        let mut guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        let len = guard.data.len();
        if idx == len {
            guard.data.push(value);
        } else if idx < len {
            guard.data[idx] = value;
        } else {
            return Err(SableError::index(format!(
                "index {} out of bounds for transient of {}",
                idx, len
            )));
        }
        Ok(())
    }

    pub fn pop(&self) -> Result<(), SableError> {
        let mut guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        if guard.data.pop().is_none() {
            return Err(SableError::value_err("can't pop empty transient vector"));
        }
        Ok(())
    }

    pub fn nth(&self, idx: usize) -> Result<Value, SableError> {
        let guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        guard
            .data
            .get(idx)
            .cloned()
            .ok_or_else(|| SableError::index(format!("index {} out of bounds", idx)))
    }

    /// Seal and convert back to a persistent vector
    pub fn persist(&self) -> Result<PersistentVector, SableError> {
        let mut guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        guard.editable = false;
        Ok(PersistentVector::from_values(std::mem::take(&mut guard.data)))
    }

    /// Snapshot of current contents (GC tracing)
    pub fn snapshot(&self) -> Vec<Value> {
        self.state.lock().expect("transient poisoned").data.clone()
    }
}

/// Mutable map shell. Keeps insertion order so that sealing to an array-map
/// preserves it.
#[derive(Debug)]
pub struct TransientMap {
    state: Mutex<TransientState<MapData>>,
}

#[derive(Debug, Default)]
struct MapData {
    index: HashMap<HashKey, usize>,
    entries: Vec<Option<(Value, Value)>>,
    live: usize,
}

impl TransientMap {
    pub fn from_entries(entries: Vec<(Value, Value)>) -> TransientMap {
        let mut data = MapData::default();
        for (k, v) in entries {
            Self::insert(&mut data, k, v);
        }
        TransientMap {
            state: Mutex::new(TransientState {
                data,
                editable: true,
            }),
        }
    }

    fn insert(data: &mut MapData, key: Value, value: Value) {
        let hk = HashKey(key.clone());
        match data.index.get(&hk) {
            Some(&slot) => data.entries[slot] = Some((key, value)),
            None => {
                data.index.insert(hk, data.entries.len());
                data.entries.push(Some((key, value)));
                data.live += 1;
            }
        }
    }

    pub fn len(&self) -> Result<usize, SableError> {
        let guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        Ok(guard.data.live)
    }

    pub fn assoc(&self, key: Value, value: Value) -> Result<(), SableError> {
        let mut guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        Self::insert(&mut guard.data, key, value);
        Ok(())
    }

    pub fn dissoc(&self, key: &Value) -> Result<(), SableError> {
        let mut guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        if let Some(slot) = guard.data.index.remove(&HashKey(key.clone())) {
            guard.data.entries[slot] = None;
            guard.data.live -= 1;
        }
        Ok(())
    }

    pub fn get(&self, key: &Value) -> Result<Option<Value>, SableError> {
        let guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        Ok(guard
            .data
            .index
            .get(&HashKey(key.clone()))
            .and_then(|&slot| guard.data.entries[slot].as_ref())
            .map(|(_, v)| v.clone()))
    }

    /// Seal; small results become array-maps, larger ones hash-maps
    pub fn persist(&self) -> Result<Value, SableError> {
        let mut guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        guard.editable = false;
        let pairs: Vec<(Value, Value)> = guard.data.entries.drain(..).flatten().collect();
        if pairs.len() <= ARRAY_MAP_THRESHOLD {
            Ok(Value::ArrayMap(std::sync::Arc::new(ArrayMap::from_pairs(
                pairs,
            ))))
        } else {
            Ok(Value::Map(std::sync::Arc::new(HashTrieMap::from_pairs(
                pairs,
            ))))
        }
    }

    pub fn snapshot(&self) -> Vec<(Value, Value)> {
        self.state
            .lock()
            .expect("transient poisoned")
            .data
            .entries
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Mutable set shell
#[derive(Debug)]
pub struct TransientSet {
    state: Mutex<TransientState<Vec<Value>>>,
}

impl TransientSet {
    pub fn from_persistent(s: &PersistentSet) -> TransientSet {
        TransientSet {
            state: Mutex::new(TransientState {
                data: s.to_vec(),
                editable: true,
            }),
        }
    }

    pub fn len(&self) -> Result<usize, SableError> {
        let guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        Ok(guard.data.len())
    }

    pub fn conj(&self, value: Value) -> Result<(), SableError> {
        let mut guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        if !guard.data.iter().any(|m| value_equals(m, &value)) {
            guard.data.push(value);
        }
        Ok(())
    }

    pub fn disj(&self, value: &Value) -> Result<(), SableError> {
        let mut guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        guard.data.retain(|m| !value_equals(m, value));
        Ok(())
    }

    pub fn contains(&self, value: &Value) -> Result<bool, SableError> {
        let guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        Ok(guard.data.iter().any(|m| value_equals(m, value)))
    }

    pub fn persist(&self) -> Result<PersistentSet, SableError> {
        let mut guard = self.state.lock().expect("transient poisoned");
        if !guard.editable {
            return Err(sealed_err());
        }
        guard.editable = false;
        Ok(PersistentSet::from_values(std::mem::take(&mut guard.data)))
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.state.lock().expect("transient poisoned").data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_vector_edit_and_seal() {
        let source = PersistentVector::from_values(vec![Value::Int(1)]);
        let t = TransientVector::from_persistent(&source);
        t.conj(Value::Int(2)).unwrap();
        t.assoc(0, Value::Int(9)).unwrap();
        let sealed = t.persist().unwrap();

        assert_eq!(sealed.len(), 2);
        assert!(matches!(sealed.get(0), Some(Value::Int(9))));
        // Source untouched
        assert_eq!(source.len(), 1);
        assert!(matches!(source.get(0), Some(Value::Int(1))));
        // Edits after sealing fail
        assert!(t.conj(Value::Int(3)).is_err());
    }

    #[test]
    fn test_transient_map_insertion_order_and_overwrite() {
        let t = TransientMap::from_entries(vec![]);
        t.assoc(Value::keyword("a"), Value::Int(1)).unwrap();
        t.assoc(Value::keyword("b"), Value::Int(2)).unwrap();
        t.assoc(Value::keyword("a"), Value::Int(3)).unwrap();
        assert_eq!(t.len().unwrap(), 2);
        match t.persist().unwrap() {
            Value::ArrayMap(m) => {
                let first = m.iter().next().unwrap();
                assert!(matches!(first.1, Value::Int(3)));
            }
            other => panic!("expected array-map, got {:?}", other),
        }
    }

    #[test]
    fn test_transient_map_promotes_past_threshold() {
        let t = TransientMap::from_entries(vec![]);
        for i in 0..20 {
            t.assoc(Value::Int(i), Value::Int(i)).unwrap();
        }
        assert!(matches!(t.persist().unwrap(), Value::Map(_)));
    }

    #[test]
    fn test_transient_set() {
        let t = TransientSet::from_persistent(&PersistentSet::new());
        t.conj(Value::Int(1)).unwrap();
        t.conj(Value::Int(1)).unwrap();
        t.conj(Value::Int(2)).unwrap();
        t.disj(&Value::Int(2)).unwrap();
        let sealed = t.persist().unwrap();
        assert_eq!(sealed.len(), 1);
        assert!(sealed.contains(&Value::Int(1)));
    }
}
