//! Regex builtins over the compiled `#"…"` literal values

use super::{b, check_exact, str_arg};
use crate::registry::BuiltinDef;
use sable_core::error::SableError;
use sable_core::gc;
use sable_core::list::PersistentList;
use sable_core::value::{RegexVal, Value};
use sable_core::vector::PersistentVector;
use std::sync::Arc;

pub fn builtins() -> Vec<BuiltinDef> {
    vec![
        b!("re-pattern", re_pattern, "([s])", "Compiles a string into a regex."),
        b!("re-matches", re_matches, "([re s])", "The whole-string match (with groups), or nil."),
        b!("re-find", re_find, "([re s])", "The first match (with groups), or nil."),
        b!("re-seq", re_seq, "([re s])", "A seq of successive matches."),
    ]
}

fn regex_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a Arc<RegexVal>, SableError> {
    match args.first() {
        Some(Value::Regex(r)) => Ok(r),
        Some(other) => Err(SableError::type_err(format!(
            "{} expects a regex, got {}",
            name,
            other.type_name()
        ))),
        None => Err(SableError::arity(name, 0)),
    }
}

fn re_pattern(args: &[Value]) -> Result<Value, SableError> {
    check_exact("re-pattern", args, 1)?;
    match &args[0] {
        Value::Regex(_) => Ok(args[0].clone()),
        Value::Str(s) => Ok(gc::alloc(Value::Regex(Arc::new(RegexVal::compile(s)?)))),
        other => Err(SableError::type_err(format!(
            "re-pattern expects a string, got {}",
            other.type_name()
        ))),
    }
}

/// A match with groups is a vector; without, the matched string
fn captures_value(re: &RegexVal, caps: regex::Captures<'_>) -> Value {
    if re.regex.captures_len() == 1 {
        return Value::string(caps.get(0).map(|m| m.as_str()).unwrap_or(""));
    }
    let items: Vec<Value> = (0..re.regex.captures_len())
        .map(|i| match caps.get(i) {
            Some(m) => Value::string(m.as_str()),
            None => Value::Nil,
        })
        .collect();
    gc::alloc(Value::Vector(Arc::new(PersistentVector::from_values(items))))
}

fn re_matches(args: &[Value]) -> Result<Value, SableError> {
    check_exact("re-matches", args, 2)?;
    let re = regex_arg("re-matches", args)?;
    let s = str_arg("re-matches", args, 1)?;
    match re.regex.captures(s) {
        Some(caps) if caps.get(0).map(|m| m.as_str()) == Some(s) => {
            Ok(captures_value(re, caps))
        }
        _ => Ok(Value::Nil),
    }
}

fn re_find(args: &[Value]) -> Result<Value, SableError> {
    check_exact("re-find", args, 2)?;
    let re = regex_arg("re-find", args)?;
    let s = str_arg("re-find", args, 1)?;
    match re.regex.captures(s) {
        Some(caps) => Ok(captures_value(re, caps)),
        None => Ok(Value::Nil),
    }
}

fn re_seq(args: &[Value]) -> Result<Value, SableError> {
    check_exact("re-seq", args, 2)?;
    let re = regex_arg("re-seq", args)?;
    let s = str_arg("re-seq", args, 1)?;
    let items: Vec<Value> = re
        .regex
        .captures_iter(s)
        .map(|caps| captures_value(re, caps))
        .collect();
    if items.is_empty() {
        return Ok(Value::Nil);
    }
    Ok(gc::alloc(Value::List(Arc::new(PersistentList::from_values(
        items,
    )))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn re(pattern: &str) -> Value {
        Value::Regex(Arc::new(RegexVal::compile(pattern).unwrap()))
    }

    #[test]
    fn test_re_matches_whole_string_only() {
        let digits = re(r"\d+");
        assert!(matches!(
            re_matches(&[digits.clone(), Value::string("123")]).unwrap(),
            Value::Str(_)
        ));
        assert!(matches!(
            re_matches(&[digits, Value::string("a123")]).unwrap(),
            Value::Nil
        ));
    }

    #[test]
    fn test_re_find_with_groups_returns_vector() {
        let pair = re(r"(\w+)=(\d+)");
        match re_find(&[pair, Value::string("x=10")]).unwrap() {
            Value::Vector(v) => assert_eq!(v.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_re_seq_collects_all() {
        let word = re(r"\w+");
        match re_seq(&[word, Value::string("a b c")]).unwrap() {
            Value::List(l) => assert_eq!(l.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }
}
