//! Value: the uniform tagged variant the language talks about
//!
//! Every runtime value is one of the tags below. The enum is small and cheap
//! to clone: heap-backed payloads sit behind `Arc`, so duplicating a value
//! bumps a reference count. Structural equality and hashing live in
//! [`crate::cmp`] and [`crate::hashing`]; the GC ledger tracks composite
//! values by their payload address (see [`crate::gc`]).

use crate::error::SableError;
use crate::fns::{BuiltinFn, FnHandle, MultiFn, Protocol, ProtocolFn};
use crate::list::PersistentList;
use crate::map::{ArrayMap, HashTrieMap};
use crate::refs::{AtomCell, PromiseCell, StmRef, Var, VolatileCell};
use crate::seqs::{Cons, LazySeq};
use crate::set::PersistentSet;
use crate::symbol::{Keyword, Symbol};
use crate::transient::{TransientMap, TransientSet, TransientVector};
use crate::vector::PersistentVector;
use std::sync::Arc;

/// A compiled regex plus its source pattern (equality and hashing use the
/// source; the compiled machine carries no identity)
#[derive(Debug)]
pub struct RegexVal {
    pub source: Arc<str>,
    pub regex: regex::Regex,
}

impl RegexVal {
    pub fn compile(source: &str) -> Result<RegexVal, SableError> {
        let regex = regex::Regex::new(source)
            .map_err(|e| SableError::value_err(format!("invalid regex pattern: {}", e)))?;
        Ok(RegexVal {
            source: Arc::from(source),
            regex,
        })
    }
}

/// The uniform tagged value
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(Arc<str>),
    Symbol(Arc<Symbol>),
    Keyword(Keyword),
    List(Arc<PersistentList>),
    Vector(Arc<PersistentVector>),
    ArrayMap(Arc<ArrayMap>),
    Map(Arc<HashTrieMap>),
    Set(Arc<PersistentSet>),
    Cons(Arc<Cons>),
    LazySeq(Arc<LazySeq>),
    Fn(Arc<FnHandle>),
    Builtin(Arc<BuiltinFn>),
    MultiFn(Arc<MultiFn>),
    Protocol(Arc<Protocol>),
    ProtocolFn(Arc<ProtocolFn>),
    Var(Arc<Var>),
    Atom(Arc<AtomCell>),
    Ref(Arc<StmRef>),
    Volatile(Arc<VolatileCell>),
    Promise(Arc<PromiseCell>),
    Regex(Arc<RegexVal>),
    Reduced(Arc<Value>),
    TransientVector(Arc<TransientVector>),
    TransientMap(Arc<TransientMap>),
    TransientSet(Arc<TransientSet>),
}

impl Value {
    /// nil and false are falsy; everything else is truthy
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn string(s: impl AsRef<str>) -> Value {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn symbol(name: &str) -> Value {
        Value::Symbol(Arc::new(Symbol::parse(name)))
    }

    pub fn keyword(name: &str) -> Value {
        Value::Keyword(Keyword::parse(name))
    }

    /// Tag name used in error messages and `type`
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Char(_) => "char",
            Value::Str(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Keyword(_) => "keyword",
            Value::List(_) => "list",
            Value::Vector(_) => "vector",
            Value::ArrayMap(_) => "array-map",
            Value::Map(_) => "hash-map",
            Value::Set(_) => "set",
            Value::Cons(_) => "cons",
            Value::LazySeq(_) => "lazy-seq",
            Value::Fn(_) => "fn",
            Value::Builtin(_) => "builtin-fn",
            Value::MultiFn(_) => "multi-fn",
            Value::Protocol(_) => "protocol",
            Value::ProtocolFn(_) => "protocol-fn",
            Value::Var(_) => "var",
            Value::Atom(_) => "atom",
            Value::Ref(_) => "ref",
            Value::Volatile(_) => "volatile",
            Value::Promise(_) => "promise",
            Value::Regex(_) => "regex",
            Value::Reduced(_) => "reduced",
            Value::TransientVector(_) => "transient-vector",
            Value::TransientMap(_) => "transient-map",
            Value::TransientSet(_) => "transient-set",
        }
    }

    /// Type key for protocol dispatch. Map values may override this with an
    /// embedded `:__reify_type` entry (resolved by the runtime dispatcher).
    pub fn base_type_key(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "Boolean",
            Value::Int(_) => "Integer",
            Value::Float(_) => "Double",
            Value::Char(_) => "Character",
            Value::Str(_) => "String",
            Value::Symbol(_) => "Symbol",
            Value::Keyword(_) => "Keyword",
            Value::List(_) | Value::Cons(_) | Value::LazySeq(_) => "ISeq",
            Value::Vector(_) => "IPersistentVector",
            Value::ArrayMap(_) | Value::Map(_) => "IPersistentMap",
            Value::Set(_) => "IPersistentSet",
            Value::Fn(_) | Value::Builtin(_) => "IFn",
            Value::MultiFn(_) => "MultiFn",
            Value::Protocol(_) => "Protocol",
            Value::ProtocolFn(_) => "IFn",
            Value::Var(_) => "Var",
            Value::Atom(_) => "Atom",
            Value::Ref(_) => "Ref",
            Value::Volatile(_) => "Volatile",
            Value::Promise(_) => "IDeref",
            Value::Regex(_) => "Pattern",
            Value::Reduced(_) => "Reduced",
            Value::TransientVector(_) | Value::TransientMap(_) | Value::TransientSet(_) => {
                "ITransientCollection"
            }
        }
    }

    /// Address of the heap payload, or None for inline values. This is the
    /// identity the GC marks by and the identity used by `identical?`.
    pub fn heap_addr(&self) -> Option<usize> {
        match self {
            Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Char(_) => None,
            Value::Str(s) => Some(Arc::as_ptr(s) as *const u8 as usize),
            Value::Symbol(s) => Some(Arc::as_ptr(s) as usize),
            Value::Keyword(k) => Some(k.addr()),
            Value::List(p) => Some(Arc::as_ptr(p) as usize),
            Value::Vector(p) => Some(Arc::as_ptr(p) as usize),
            Value::ArrayMap(p) => Some(Arc::as_ptr(p) as usize),
            Value::Map(p) => Some(Arc::as_ptr(p) as usize),
            Value::Set(p) => Some(Arc::as_ptr(p) as usize),
            Value::Cons(p) => Some(Arc::as_ptr(p) as usize),
            Value::LazySeq(p) => Some(Arc::as_ptr(p) as usize),
            Value::Fn(p) => Some(Arc::as_ptr(p) as usize),
            Value::Builtin(p) => Some(Arc::as_ptr(p) as usize),
            Value::MultiFn(p) => Some(Arc::as_ptr(p) as usize),
            Value::Protocol(p) => Some(Arc::as_ptr(p) as usize),
            Value::ProtocolFn(p) => Some(Arc::as_ptr(p) as usize),
            Value::Var(p) => Some(Arc::as_ptr(p) as usize),
            Value::Atom(p) => Some(Arc::as_ptr(p) as usize),
            Value::Ref(p) => Some(Arc::as_ptr(p) as usize),
            Value::Volatile(p) => Some(Arc::as_ptr(p) as usize),
            Value::Promise(p) => Some(Arc::as_ptr(p) as usize),
            Value::Regex(p) => Some(Arc::as_ptr(p) as usize),
            Value::Reduced(p) => Some(Arc::as_ptr(p) as usize),
            Value::TransientVector(p) => Some(Arc::as_ptr(p) as usize),
            Value::TransientMap(p) => Some(Arc::as_ptr(p) as usize),
            Value::TransientSet(p) => Some(Arc::as_ptr(p) as usize),
        }
    }

    /// Reference identity (used by `identical?`)
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            _ => match (self.heap_addr(), other.heap_addr()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Metadata attached to this value, if any
    pub fn meta(&self) -> Option<Value> {
        match self {
            Value::Symbol(s) => s.meta.as_deref().cloned(),
            Value::List(l) => l.meta(),
            Value::Vector(v) => v.meta(),
            Value::ArrayMap(m) => m.meta(),
            Value::Map(m) => m.meta(),
            Value::Set(s) => s.meta(),
            Value::Fn(f) => f.meta(),
            Value::Var(v) => v.meta(),
            Value::Atom(a) => a.meta(),
            Value::Ref(r) => r.meta(),
            _ => None,
        }
    }

    /// Return a value of the same type carrying `meta` (structural copy for
    /// collections; in-place for reference types)
    pub fn with_meta(&self, meta: Option<Value>) -> Result<Value, SableError> {
        match self {
            Value::Symbol(s) => Ok(Value::Symbol(Arc::new(s.with_meta(meta)))),
            Value::List(l) => Ok(Value::List(Arc::new(l.with_meta(meta)))),
            Value::Vector(v) => Ok(Value::Vector(Arc::new(v.with_meta(meta)))),
            Value::ArrayMap(m) => Ok(Value::ArrayMap(Arc::new(m.with_meta(meta)))),
            Value::Map(m) => Ok(Value::Map(Arc::new(m.with_meta(meta)))),
            Value::Set(s) => Ok(Value::Set(Arc::new(s.with_meta(meta)))),
            Value::Fn(f) => {
                f.set_meta(meta);
                Ok(self.clone())
            }
            Value::Atom(a) => {
                a.set_meta(meta);
                Ok(self.clone())
            }
            Value::Ref(r) => {
                r.set_meta(meta);
                Ok(self.clone())
            }
            Value::Var(v) => {
                v.set_meta(meta);
                Ok(self.clone())
            }
            other => Err(SableError::type_err(format!(
                "{} does not support metadata",
                other.type_name()
            ))),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness_contract() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::string("").is_truthy());
        assert!(Value::Float(0.0).is_truthy());
    }

    #[test]
    fn test_identical_inline_vs_heap() {
        assert!(Value::Int(3).identical(&Value::Int(3)));
        assert!(!Value::string("a").identical(&Value::string("a")));
        let s = Value::string("a");
        assert!(s.identical(&s.clone()));
        // Interned keywords are identical by construction
        assert!(Value::keyword("k").identical(&Value::keyword("k")));
    }

    #[test]
    fn test_value_is_small() {
        // Cheap pass-by-copy contract: tag + payload word(s)
        assert!(std::mem::size_of::<Value>() <= 24);
    }
}
