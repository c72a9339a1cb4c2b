//! Seq abstraction: cons cells, lazy seqs, and traversal over anything seqable
//!
//! `seq` normalizes a value into either nil or a concrete sequence head
//! (list or cons). Lazy seqs memoize their realization under a mutex; the
//! thunk is invoked through the dispatch vtable so this crate never names
//! the evaluator.

use crate::error::SableError;
use crate::list::PersistentList;
use crate::value::Value;
use crate::vtable;
use std::sync::{Arc, Mutex};

/// A cons cell. `rest` may be any seqable value (including another cons,
/// a lazy seq, or nil).
#[derive(Debug)]
pub struct Cons {
    pub first: Value,
    rest: Value,
}

impl Cons {
    pub fn new(first: Value, rest: Value) -> Cons {
        Cons { first, rest }
    }

    pub fn rest(&self) -> Value {
        self.rest.clone()
    }
}

impl Drop for Cons {
    fn drop(&mut self) {
        // Unlink long chains iteratively so deep realized seqs drop without
        // exhausting the native stack.
        let mut rest = std::mem::replace(&mut self.rest, Value::Nil);
        while let Value::Cons(cell) = rest {
            match Arc::try_unwrap(cell) {
                Ok(mut owned) => {
                    rest = std::mem::replace(&mut owned.rest, Value::Nil);
                }
                Err(_) => break,
            }
        }
    }
}

#[derive(Debug)]
enum LazyState {
    /// Thunk not yet invoked
    Pending(Value),
    /// Realized to a seq head (nil, list, or cons)
    Forced(Value),
}

/// A deferred seq: the thunk runs once, and its result is memoized
#[derive(Debug)]
pub struct LazySeq {
    state: Mutex<LazyState>,
}

impl LazySeq {
    pub fn new(thunk: Value) -> LazySeq {
        LazySeq {
            state: Mutex::new(LazyState::Pending(thunk)),
        }
    }

    pub fn is_realized(&self) -> bool {
        matches!(*self.state.lock().expect("lazy-seq poisoned"), LazyState::Forced(_))
    }

    /// Current state without forcing: the pending thunk or the realized head
    /// (GC child tracing)
    pub fn peek_state(&self) -> Value {
        match &*self.state.lock().expect("lazy-seq poisoned") {
            LazyState::Pending(thunk) => thunk.clone(),
            LazyState::Forced(head) => head.clone(),
        }
    }

    /// Force the thunk (once) and return the realized seq head
    pub fn force(&self) -> Result<Value, SableError> {
        let mut guard = self.state.lock().expect("lazy-seq poisoned");
        match &*guard {
            LazyState::Forced(v) => Ok(v.clone()),
            LazyState::Pending(thunk) => {
                let thunk = thunk.clone();
                // The thunk body may itself return another lazy seq; chase
                // the chain to a concrete head.
                let mut produced = vtable::call_value(&thunk, &[])?;
                while let Value::LazySeq(inner) = produced {
                    produced = inner.force()?;
                }
                let head = seq(&produced)?;
                *guard = LazyState::Forced(head.clone());
                Ok(head)
            }
        }
    }
}

/// Normalize to nil or a concrete seq head. Errors on non-seqable values.
pub fn seq(v: &Value) -> Result<Value, SableError> {
    match v {
        Value::Nil => Ok(Value::Nil),
        Value::List(l) => {
            if l.is_empty() {
                Ok(Value::Nil)
            } else {
                Ok(v.clone())
            }
        }
        Value::Cons(_) => Ok(v.clone()),
        Value::LazySeq(l) => l.force(),
        Value::Vector(vec) => {
            if vec.is_empty() {
                Ok(Value::Nil)
            } else {
                Ok(Value::List(Arc::new(PersistentList::from_values(
                    vec.to_vec(),
                ))))
            }
        }
        Value::ArrayMap(m) => {
            if m.is_empty() {
                Ok(Value::Nil)
            } else {
                Ok(pairs_to_seq(m.iter().cloned().collect()))
            }
        }
        Value::Map(m) => {
            if m.is_empty() {
                Ok(Value::Nil)
            } else {
                Ok(pairs_to_seq(m.to_pairs()))
            }
        }
        Value::Set(s) => {
            if s.is_empty() {
                Ok(Value::Nil)
            } else {
                Ok(Value::List(Arc::new(PersistentList::from_values(
                    s.to_vec(),
                ))))
            }
        }
        Value::Str(s) => {
            if s.is_empty() {
                Ok(Value::Nil)
            } else {
                Ok(Value::List(Arc::new(PersistentList::from_values(
                    s.chars().map(Value::Char).collect(),
                ))))
            }
        }
        other => Err(SableError::type_err(format!(
            "{} is not seqable",
            other.type_name()
        ))),
    }
}

/// Map entries seq as a list of two-element vectors
fn pairs_to_seq(pairs: Vec<(Value, Value)>) -> Value {
    let entries: Vec<Value> = pairs
        .into_iter()
        .map(|(k, v)| {
            Value::Vector(Arc::new(crate::vector::PersistentVector::from_values(
                vec![k, v],
            )))
        })
        .collect();
    Value::List(Arc::new(PersistentList::from_values(entries)))
}

/// First element of a seqable, nil when empty
pub fn first(v: &Value) -> Result<Value, SableError> {
    match seq(v)? {
        Value::Nil => Ok(Value::Nil),
        Value::List(l) => Ok(l.first().cloned().unwrap_or(Value::Nil)),
        Value::Cons(c) => Ok(c.first.clone()),
        _ => unreachable!("seq returned a non-seq head"),
    }
}

/// Everything but the first element; always a seq (possibly empty list)
pub fn rest(v: &Value) -> Result<Value, SableError> {
    match seq(v)? {
        Value::Nil => Ok(Value::List(Arc::new(PersistentList::EMPTY))),
        Value::List(l) => Ok(Value::List(Arc::new(l.rest()))),
        Value::Cons(c) => Ok(c.rest()),
        _ => unreachable!("seq returned a non-seq head"),
    }
}

/// Like `rest` but nil when the result is empty
pub fn next(v: &Value) -> Result<Value, SableError> {
    let r = rest(v)?;
    seq(&r)
}

/// Iterator over a seqable, realizing lazy tails as it walks
pub struct SeqIter {
    cur: Value,
    failed: bool,
}

impl Iterator for SeqIter {
    type Item = Result<Value, SableError>;

    fn next(&mut self) -> Option<Result<Value, SableError>> {
        if self.failed {
            return None;
        }
        let head = match seq(&self.cur) {
            Ok(h) => h,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        match head {
            Value::Nil => None,
            other => {
                let item = first(&other);
                match rest(&other) {
                    Ok(r) => self.cur = r,
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
                Some(item)
            }
        }
    }
}

pub fn iter(v: &Value) -> SeqIter {
    SeqIter {
        cur: v.clone(),
        failed: false,
    }
}

/// Element count. O(1) for counted collections, linear for seqs.
pub fn count(v: &Value) -> Result<usize, SableError> {
    match v {
        Value::Nil => Ok(0),
        Value::List(l) => Ok(l.len()),
        Value::Vector(vec) => Ok(vec.len()),
        Value::ArrayMap(m) => Ok(m.len()),
        Value::Map(m) => Ok(m.len()),
        Value::Set(s) => Ok(s.len()),
        Value::Str(s) => Ok(s.chars().count()),
        Value::Cons(_) | Value::LazySeq(_) => {
            let mut n = 0;
            for item in iter(v) {
                item?;
                n += 1;
            }
            Ok(n)
        }
        other => Err(SableError::type_err(format!(
            "count not supported on {}",
            other.type_name()
        ))),
    }
}

/// Collect a seqable into a vec, propagating realization errors
pub fn collect(v: &Value) -> Result<Vec<Value>, SableError> {
    iter(v).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_of_empty_collections_is_nil() {
        assert!(matches!(seq(&Value::Nil).unwrap(), Value::Nil));
        let empty_list = Value::List(Arc::new(PersistentList::EMPTY));
        assert!(matches!(seq(&empty_list).unwrap(), Value::Nil));
        let empty_vec = Value::Vector(Arc::new(crate::vector::PersistentVector::new()));
        assert!(matches!(seq(&empty_vec).unwrap(), Value::Nil));
    }

    #[test]
    fn test_first_rest_over_cons() {
        let chain = Value::Cons(Arc::new(Cons::new(
            Value::Int(1),
            Value::Cons(Arc::new(Cons::new(Value::Int(2), Value::Nil))),
        )));
        assert!(matches!(first(&chain).unwrap(), Value::Int(1)));
        let r = rest(&chain).unwrap();
        assert!(matches!(first(&r).unwrap(), Value::Int(2)));
        assert!(matches!(next(&r).unwrap(), Value::Nil));
    }

    #[test]
    fn test_string_seq() {
        let items = collect(&Value::string("ab")).unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Value::Char('a')));
    }

    #[test]
    fn test_count_over_seq() {
        let l = Value::List(Arc::new(PersistentList::from_values(vec![
            Value::Int(1),
            Value::Int(2),
        ])));
        assert_eq!(count(&l).unwrap(), 2);
        assert_eq!(count(&Value::Nil).unwrap(), 0);
        assert!(count(&Value::Int(3)).is_err());
    }

    #[test]
    fn test_deep_cons_chain_drops() {
        let mut chain = Value::Nil;
        for i in 0..200_000 {
            chain = Value::Cons(Arc::new(Cons::new(Value::Int(i), chain)));
        }
        drop(chain);
    }
}
