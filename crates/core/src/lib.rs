//! Sable core: the value model shared by every layer of the runtime
//!
//! Key design principles:
//! - Value: a uniform tagged variant, cheap to clone, safe to share
//! - Persistent collections: structural sharing, never in-place mutation
//! - The GC ledger owns heap lifetimes; everything else holds references
//! - The dispatch vtable inverts dependencies on the evaluator

pub mod cmp;
pub mod error;
pub mod fns;
pub mod gc;
pub mod hashing;
pub mod list;
pub mod map;
pub mod printer;
pub mod refs;
pub mod seqs;
pub mod set;
pub mod symbol;
pub mod transient;
pub mod value;
pub mod vector;
pub mod vtable;

pub use cmp::{numeric_equals, value_compare, value_equals};
pub use error::{ErrorKind, Phase, SableError, SourcePos};
pub use fns::{BuiltinFn, FnHandle, MultiFn, NativeFn, Protocol, ProtocolFn};
pub use hashing::{HashKey, value_hash};
pub use list::PersistentList;
pub use map::{ARRAY_MAP_THRESHOLD, ArrayMap, HashTrieMap};
pub use printer::{display_str, pr_str};
pub use refs::{AtomCell, PromiseCell, RefHistory, RefVersion, StmRef, Var, VolatileCell};
pub use seqs::{Cons, LazySeq};
pub use set::PersistentSet;
pub use symbol::{Keyword, Symbol, intern_str};
pub use transient::{TransientMap, TransientSet, TransientVector};
pub use value::{RegexVal, Value};
pub use vector::PersistentVector;
