//! Exception values: the bridge between host errors and user-level maps
//!
//! User code sees exceptions as ordinary maps (`{:__ex_info true, :message
//! …, :data …, :cause …}`). Host errors crossing into a `catch` binding are
//! synthesized into the same shape; thrown maps ride inside the error's
//! payload so re-throws preserve identity.

use sable_core::error::{ErrorKind, SableError};
use sable_core::map::ArrayMap;
use sable_core::value::Value;
use std::sync::Arc;

pub const EX_INFO_KEY: &str = "__ex_info";

/// Build the `ex-info` map shape
pub fn make_ex_info(message: Value, data: Value, cause: Option<Value>) -> Value {
    let mut pairs = vec![
        (Value::keyword(EX_INFO_KEY), Value::Bool(true)),
        (Value::keyword("message"), message),
        (Value::keyword("data"), data),
    ];
    if let Some(cause) = cause {
        pairs.push((Value::keyword("cause"), cause));
    }
    sable_core::gc::alloc(Value::ArrayMap(Arc::new(ArrayMap::from_pairs(pairs))))
}

pub fn is_ex_info(v: &Value) -> bool {
    map_get(v, EX_INFO_KEY).is_some_and(|flag| flag.is_truthy())
}

fn map_get(v: &Value, key: &str) -> Option<Value> {
    let k = Value::keyword(key);
    match v {
        Value::ArrayMap(m) => m.get(&k).cloned(),
        Value::Map(m) => m.get(&k).cloned(),
        _ => None,
    }
}

/// Turn a thrown user value into a host error
pub fn throw_value(v: Value) -> SableError {
    if is_ex_info(&v) {
        let message = match map_get(&v, "message") {
            Some(Value::Str(s)) => s.to_string(),
            Some(other) => sable_core::printer::display_str(&other),
            None => "exception".to_string(),
        };
        let data = map_get(&v, "data");
        SableError::thrown(message, data, v)
    } else {
        let message = sable_core::printer::display_str(&v);
        SableError::thrown(message, None, v)
    }
}

/// The value a `catch` clause binds for this error
pub fn error_to_value(err: &SableError) -> Value {
    if let Some(payload) = &err.payload {
        return payload.clone();
    }
    let data = err.data.clone().unwrap_or(Value::Nil);
    let mut pairs = vec![
        (Value::keyword(EX_INFO_KEY), Value::Bool(true)),
        (Value::keyword("message"), Value::string(&err.message)),
        (Value::keyword("data"), data),
        (
            Value::keyword("kind"),
            Value::keyword(err.kind.keyword_name()),
        ),
    ];
    if let Some(pos) = err.pos {
        pairs.push((
            Value::keyword("line"),
            Value::Int(pos.line as i64 + 1),
        ));
    }
    sable_core::gc::alloc(Value::ArrayMap(Arc::new(ArrayMap::from_pairs(pairs))))
}

/// Catch-class matcher installed on the dispatch vtable. Handles both host
/// errors (by kind) and exception-map payloads.
pub fn matches_class(err: &SableError, class: &str) -> bool {
    // The internal STM conflict signal must never be caught by user code
    if err.kind == ErrorKind::StmRetry {
        return false;
    }
    match class {
        "Throwable" | "Exception" | "Error" | "Object" => true,
        "ExceptionInfo" => err.payload.as_ref().is_some_and(is_ex_info),
        other => err.kind.class_name() == other,
    }
}

/// ex-message / ex-data accessors over both representations
pub fn ex_message(v: &Value) -> Value {
    map_get(v, "message").unwrap_or(Value::Nil)
}

pub fn ex_data(v: &Value) -> Value {
    if is_ex_info(v) {
        map_get(v, "data").unwrap_or(Value::Nil)
    } else {
        Value::Nil
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throw_ex_info_round_trip() {
        let ex = make_ex_info(
            Value::string("boom"),
            Value::Nil,
            None,
        );
        let err = throw_value(ex.clone());
        assert_eq!(err.message, "boom");
        let back = error_to_value(&err);
        assert!(back.identical(&ex));
    }

    #[test]
    fn test_matches_class() {
        let arity = SableError::arity("f", 2);
        assert!(matches_class(&arity, "ArityException"));
        assert!(matches_class(&arity, "Exception"));
        assert!(!matches_class(&arity, "ClassCastException"));

        let info = throw_value(make_ex_info(Value::string("x"), Value::Nil, None));
        assert!(matches_class(&info, "ExceptionInfo"));

        let retry = SableError::new(
            sable_core::error::Phase::Eval,
            ErrorKind::StmRetry,
            "conflict",
        );
        assert!(!matches_class(&retry, "Throwable"));
    }

    #[test]
    fn test_host_error_synthesizes_map() {
        let err = SableError::type_err("bad cast");
        let v = error_to_value(&err);
        assert!(is_ex_info(&v));
        match ex_message(&v) {
            Value::Str(s) => assert_eq!(&*s, "bad cast"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
