//! Associative collections: array-map and hash-array-mapped-trie map
//!
//! Small maps are flat ordered key/value arrays with linear search; past
//! [`ARRAY_MAP_THRESHOLD`] entries, `assoc` promotes to the HAMT. Both
//! compare equal when they hold the same entries (see [`crate::cmp`]).

use crate::cmp::value_equals;
use crate::error::SableError;
use crate::hashing::value_hash;
use crate::value::Value;
use std::sync::Arc;

/// Entry cap for the flat representation
pub const ARRAY_MAP_THRESHOLD: usize = 8;

const HBITS: u32 = 5;
const HMASK: u32 = 31;

/// Ordered associative array with linear lookup
#[derive(Debug, Clone, Default)]
pub struct ArrayMap {
    entries: Vec<(Value, Value)>,
    meta: Option<Arc<Value>>,
}

impl ArrayMap {
    pub fn new() -> ArrayMap {
        ArrayMap::default()
    }

    pub fn from_pairs(pairs: Vec<(Value, Value)>) -> ArrayMap {
        let mut m = ArrayMap::new();
        for (k, v) in pairs {
            m = m.assoc(k, v);
        }
        m
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| value_equals(k, key))
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    /// Replace in place (position preserved) or append
    pub fn assoc(&self, key: Value, value: Value) -> ArrayMap {
        let mut entries = self.entries.clone();
        match entries.iter().position(|(k, _)| value_equals(k, &key)) {
            Some(idx) => entries[idx] = (key, value),
            None => entries.push((key, value)),
        }
        ArrayMap {
            entries,
            meta: None,
        }
    }

    pub fn dissoc(&self, key: &Value) -> ArrayMap {
        let entries = self
            .entries
            .iter()
            .filter(|(k, _)| !value_equals(k, key))
            .cloned()
            .collect();
        ArrayMap {
            entries,
            meta: None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }

    pub fn meta(&self) -> Option<Value> {
        self.meta.as_deref().cloned()
    }

    pub fn with_meta(&self, meta: Option<Value>) -> ArrayMap {
        ArrayMap {
            entries: self.entries.clone(),
            meta: meta.map(Arc::new),
        }
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Pair(Value, Value),
    Node(Arc<MapNode>),
}

#[derive(Debug, Clone)]
enum MapNode {
    Bitmap { bitmap: u32, entries: Vec<Entry> },
    Collision { hash: u32, pairs: Vec<(Value, Value)> },
}

fn key_hash(key: &Value) -> u32 {
    let h = value_hash(key);
    (h ^ (h >> 32)) as u32
}

fn bit_for(hash: u32, shift: u32) -> u32 {
    1 << ((hash >> shift) & HMASK)
}

fn index_of(bitmap: u32, bit: u32) -> usize {
    (bitmap & (bit - 1)).count_ones() as usize
}

impl MapNode {
    fn get<'a>(&'a self, shift: u32, hash: u32, key: &Value) -> Option<&'a Value> {
        match self {
            MapNode::Bitmap { bitmap, entries } => {
                let bit = bit_for(hash, shift);
                if bitmap & bit == 0 {
                    return None;
                }
                match &entries[index_of(*bitmap, bit)] {
                    Entry::Pair(k, v) => {
                        if value_equals(k, key) {
                            Some(v)
                        } else {
                            None
                        }
                    }
                    Entry::Node(child) => child.get(shift + HBITS, hash, key),
                }
            }
            MapNode::Collision { hash: h, pairs } => {
                if *h != hash {
                    return None;
                }
                pairs
                    .iter()
                    .find(|(k, _)| value_equals(k, key))
                    .map(|(_, v)| v)
            }
        }
    }

    /// Returns the new node and whether the key was added (vs replaced)
    fn assoc(&self, shift: u32, hash: u32, key: Value, value: Value) -> (MapNode, bool) {
        match self {
            MapNode::Bitmap { bitmap, entries } => {
                let bit = bit_for(hash, shift);
                let idx = index_of(*bitmap, bit);
                if bitmap & bit == 0 {
                    let mut new_entries = entries.clone();
                    new_entries.insert(idx, Entry::Pair(key, value));
                    (
                        MapNode::Bitmap {
                            bitmap: bitmap | bit,
                            entries: new_entries,
                        },
                        true,
                    )
                } else {
                    match &entries[idx] {
                        Entry::Pair(k0, v0) => {
                            if value_equals(k0, &key) {
                                let mut new_entries = entries.clone();
                                new_entries[idx] = Entry::Pair(key, value);
                                (
                                    MapNode::Bitmap {
                                        bitmap: *bitmap,
                                        entries: new_entries,
                                    },
                                    false,
                                )
                            } else {
                                let merged = merge_pairs(
                                    shift + HBITS,
                                    key_hash(k0),
                                    k0.clone(),
                                    v0.clone(),
                                    hash,
                                    key,
                                    value,
                                );
                                let mut new_entries = entries.clone();
                                new_entries[idx] = Entry::Node(Arc::new(merged));
                                (
                                    MapNode::Bitmap {
                                        bitmap: *bitmap,
                                        entries: new_entries,
                                    },
                                    true,
                                )
                            }
                        }
                        Entry::Node(child) => {
                            let (new_child, added) = child.assoc(shift + HBITS, hash, key, value);
                            let mut new_entries = entries.clone();
                            new_entries[idx] = Entry::Node(Arc::new(new_child));
                            (
                                MapNode::Bitmap {
                                    bitmap: *bitmap,
                                    entries: new_entries,
                                },
                                added,
                            )
                        }
                    }
                }
            }
            MapNode::Collision { hash: h, pairs } => {
                if *h == hash {
                    let mut new_pairs = pairs.clone();
                    match new_pairs.iter().position(|(k, _)| value_equals(k, &key)) {
                        Some(idx) => {
                            new_pairs[idx] = (key, value);
                            (
                                MapNode::Collision {
                                    hash: *h,
                                    pairs: new_pairs,
                                },
                                false,
                            )
                        }
                        None => {
                            new_pairs.push((key, value));
                            (
                                MapNode::Collision {
                                    hash: *h,
                                    pairs: new_pairs,
                                },
                                true,
                            )
                        }
                    }
                } else {
                    // Push the collision node a level down, then insert
                    let wrapper = MapNode::Bitmap {
                        bitmap: bit_for(*h, shift),
                        entries: vec![Entry::Node(Arc::new(self.clone()))],
                    };
                    wrapper.assoc(shift, hash, key, value)
                }
            }
        }
    }

    /// Returns (replacement, removed). `None` replacement deletes the node.
    fn dissoc(&self, shift: u32, hash: u32, key: &Value) -> (Option<MapNode>, bool) {
        match self {
            MapNode::Bitmap { bitmap, entries } => {
                let bit = bit_for(hash, shift);
                if bitmap & bit == 0 {
                    return (Some(self.clone()), false);
                }
                let idx = index_of(*bitmap, bit);
                match &entries[idx] {
                    Entry::Pair(k, _) => {
                        if !value_equals(k, key) {
                            return (Some(self.clone()), false);
                        }
                        let mut new_entries = entries.clone();
                        new_entries.remove(idx);
                        if new_entries.is_empty() {
                            (None, true)
                        } else {
                            (
                                Some(MapNode::Bitmap {
                                    bitmap: bitmap & !bit,
                                    entries: new_entries,
                                }),
                                true,
                            )
                        }
                    }
                    Entry::Node(child) => {
                        let (new_child, removed) = child.dissoc(shift + HBITS, hash, key);
                        if !removed {
                            return (Some(self.clone()), false);
                        }
                        let mut new_entries = entries.clone();
                        match new_child {
                            None => {
                                new_entries.remove(idx);
                                if new_entries.is_empty() {
                                    (None, true)
                                } else {
                                    (
                                        Some(MapNode::Bitmap {
                                            bitmap: bitmap & !bit,
                                            entries: new_entries,
                                        }),
                                        true,
                                    )
                                }
                            }
                            Some(node) => {
                                // Contract single-pair children back into this level
                                new_entries[idx] = match node.single_pair() {
                                    Some((k, v)) => Entry::Pair(k, v),
                                    None => Entry::Node(Arc::new(node)),
                                };
                                (
                                    Some(MapNode::Bitmap {
                                        bitmap: *bitmap,
                                        entries: new_entries,
                                    }),
                                    true,
                                )
                            }
                        }
                    }
                }
            }
            MapNode::Collision { hash: h, pairs } => {
                if *h != hash {
                    return (Some(self.clone()), false);
                }
                match pairs.iter().position(|(k, _)| value_equals(k, key)) {
                    None => (Some(self.clone()), false),
                    Some(idx) => {
                        let mut new_pairs = pairs.clone();
                        new_pairs.remove(idx);
                        if new_pairs.is_empty() {
                            (None, true)
                        } else {
                            (
                                Some(MapNode::Collision {
                                    hash: *h,
                                    pairs: new_pairs,
                                }),
                                true,
                            )
                        }
                    }
                }
            }
        }
    }

    fn single_pair(&self) -> Option<(Value, Value)> {
        match self {
            MapNode::Bitmap { entries, .. } => match entries.as_slice() {
                [Entry::Pair(k, v)] => Some((k.clone(), v.clone())),
                _ => None,
            },
            MapNode::Collision { pairs, .. } => match pairs.as_slice() {
                [(k, v)] => Some((k.clone(), v.clone())),
                _ => None,
            },
        }
    }
}

fn merge_pairs(
    shift: u32,
    h0: u32,
    k0: Value,
    v0: Value,
    h1: u32,
    k1: Value,
    v1: Value,
) -> MapNode {
    if h0 == h1 {
        return MapNode::Collision {
            hash: h0,
            pairs: vec![(k0, v0), (k1, v1)],
        };
    }
    let bit0 = bit_for(h0, shift);
    let bit1 = bit_for(h1, shift);
    if bit0 == bit1 {
        let child = merge_pairs(shift + HBITS, h0, k0, v0, h1, k1, v1);
        MapNode::Bitmap {
            bitmap: bit0,
            entries: vec![Entry::Node(Arc::new(child))],
        }
    } else {
        let entries = if bit0 < bit1 {
            vec![Entry::Pair(k0, v0), Entry::Pair(k1, v1)]
        } else {
            vec![Entry::Pair(k1, v1), Entry::Pair(k0, v0)]
        };
        MapNode::Bitmap {
            bitmap: bit0 | bit1,
            entries,
        }
    }
}

/// Hash-array-mapped-trie map
#[derive(Debug, Clone, Default)]
pub struct HashTrieMap {
    count: usize,
    root: Option<Arc<MapNode>>,
    meta: Option<Arc<Value>>,
}

impl HashTrieMap {
    pub fn new() -> HashTrieMap {
        HashTrieMap::default()
    }

    pub fn from_pairs(pairs: Vec<(Value, Value)>) -> HashTrieMap {
        let mut m = HashTrieMap::new();
        for (k, v) in pairs {
            m = m.assoc(k, v);
        }
        m
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        let root = self.root.as_ref()?;
        root.get(0, key_hash(key), key)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    pub fn assoc(&self, key: Value, value: Value) -> HashTrieMap {
        let hash = key_hash(&key);
        match &self.root {
            None => HashTrieMap {
                count: 1,
                root: Some(Arc::new(MapNode::Bitmap {
                    bitmap: bit_for(hash, 0),
                    entries: vec![Entry::Pair(key, value)],
                })),
                meta: None,
            },
            Some(root) => {
                let (new_root, added) = root.assoc(0, hash, key, value);
                HashTrieMap {
                    count: self.count + usize::from(added),
                    root: Some(Arc::new(new_root)),
                    meta: None,
                }
            }
        }
    }

    pub fn dissoc(&self, key: &Value) -> HashTrieMap {
        match &self.root {
            None => self.clone(),
            Some(root) => {
                let (new_root, removed) = root.dissoc(0, key_hash(key), key);
                if !removed {
                    return self.clone();
                }
                HashTrieMap {
                    count: self.count - 1,
                    root: new_root.map(Arc::new),
                    meta: None,
                }
            }
        }
    }

    pub fn iter(&self) -> MapIter<'_> {
        let mut stack = Vec::new();
        if let Some(root) = &self.root {
            stack.push((root.as_ref(), 0));
        }
        MapIter { stack }
    }

    pub fn to_pairs(&self) -> Vec<(Value, Value)> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn meta(&self) -> Option<Value> {
        self.meta.as_deref().cloned()
    }

    pub fn with_meta(&self, meta: Option<Value>) -> HashTrieMap {
        HashTrieMap {
            count: self.count,
            root: self.root.clone(),
            meta: meta.map(Arc::new),
        }
    }
}

/// Depth-first walk over trie nodes
pub struct MapIter<'a> {
    stack: Vec<(&'a MapNode, usize)>,
}

impl<'a> Iterator for MapIter<'a> {
    type Item = (&'a Value, &'a Value);

    fn next(&mut self) -> Option<(&'a Value, &'a Value)> {
        while let Some((node, idx)) = self.stack.pop() {
            match node {
                MapNode::Bitmap { entries, .. } => {
                    if idx >= entries.len() {
                        continue;
                    }
                    self.stack.push((node, idx + 1));
                    match &entries[idx] {
                        Entry::Pair(k, v) => return Some((k, v)),
                        Entry::Node(child) => self.stack.push((child.as_ref(), 0)),
                    }
                }
                MapNode::Collision { pairs, .. } => {
                    if idx >= pairs.len() {
                        continue;
                    }
                    self.stack.push((node, idx + 1));
                    let (k, v) = &pairs[idx];
                    return Some((k, v));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn kw(name: &str) -> Value {
        Value::keyword(name)
    }

    #[test]
    fn test_array_map_preserves_order() {
        let m = ArrayMap::new()
            .assoc(kw("a"), Value::Int(1))
            .assoc(kw("b"), Value::Int(2))
            .assoc(kw("a"), Value::Int(3));
        let keys: Vec<String> = m.iter().map(|(k, _)| format!("{:?}", k)).collect();
        assert_eq!(m.len(), 2);
        assert!(keys[0].contains('a'));
        assert!(matches!(m.get(&kw("a")), Some(Value::Int(3))));
    }

    #[test]
    fn test_hamt_assoc_get_many() {
        let mut m = HashTrieMap::new();
        for i in 0..2000 {
            m = m.assoc(Value::Int(i), Value::Int(i * 10));
        }
        assert_eq!(m.len(), 2000);
        for i in (0..2000).step_by(97) {
            match m.get(&Value::Int(i)) {
                Some(Value::Int(v)) => assert_eq!(*v, i * 10),
                other => panic!("key {}: unexpected {:?}", i, other),
            }
        }
        assert!(m.get(&Value::Int(5000)).is_none());
    }

    #[test]
    fn test_hamt_replace_does_not_grow() {
        let m = HashTrieMap::new().assoc(kw("x"), Value::Int(1));
        let m2 = m.assoc(kw("x"), Value::Int(2));
        assert_eq!(m2.len(), 1);
        assert!(matches!(m2.get(&kw("x")), Some(Value::Int(2))));
        assert!(matches!(m.get(&kw("x")), Some(Value::Int(1))));
    }

    #[test]
    fn test_hamt_dissoc() {
        let mut m = HashTrieMap::new();
        for i in 0..100 {
            m = m.assoc(Value::Int(i), Value::Int(i));
        }
        for i in 0..50 {
            m = m.dissoc(&Value::Int(i));
        }
        assert_eq!(m.len(), 50);
        assert!(m.get(&Value::Int(10)).is_none());
        assert!(m.get(&Value::Int(75)).is_some());
        // Removing an absent key is a no-op
        assert_eq!(m.dissoc(&Value::Int(10)).len(), 50);
    }

    #[test]
    fn test_hamt_iter_yields_every_pair() {
        let mut m = HashTrieMap::new();
        for i in 0..300 {
            m = m.assoc(Value::Int(i), Value::Int(-i));
        }
        let mut seen: Vec<i64> = m
            .iter()
            .map(|(k, _)| match k {
                Value::Int(n) => *n,
                _ => unreachable!(),
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..300).collect::<Vec<i64>>());
    }
}
