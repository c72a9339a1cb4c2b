//! String builtins: core string/symbol/keyword fns plus the
//! `sable.string` namespace

use super::{b, check_exact, check_min, check_range, str_arg};
use crate::registry::BuiltinDef;
use sable_core::error::SableError;
use sable_core::gc;
use sable_core::list::PersistentList;
use sable_core::symbol::{Keyword, Symbol};
use sable_core::value::Value;
use std::sync::Arc;

pub fn core_builtins() -> Vec<BuiltinDef> {
    vec![
        b!("str", str_fn, "([& xs])", "Concatenates the display forms of xs."),
        b!("subs", subs, "([s start] [s start end])", "Substring from start to end."),
        b!("name", name, "([x])", "The name of a symbol, keyword, or string."),
        b!("namespace", namespace, "([x])", "The namespace of a symbol or keyword, or nil."),
        b!("symbol", symbol, "([name] [ns name])", "Returns a symbol."),
        b!("keyword", keyword, "([name] [ns name])", "Returns an interned keyword."),
        b!("gensym", gensym, "([] [prefix])", "A new symbol with a unique name."),
        b!("char", char_fn, "([i])", "The character with scalar value i."),
    ]
}

pub fn string_ns_builtins() -> Vec<BuiltinDef> {
    vec![
        b!("upper-case", upper_case, "([s])", "Converts s to upper case."),
        b!("lower-case", lower_case, "([s])", "Converts s to lower case."),
        b!("trim", trim, "([s])", "Removes whitespace from both ends."),
        b!("triml", triml, "([s])", "Removes whitespace from the left end."),
        b!("trimr", trimr, "([s])", "Removes whitespace from the right end."),
        b!("split", split, "([s re])", "Splits s on a regex, returning a vector."),
        b!("join", join, "([coll] [sep coll])", "Joins the display forms with sep."),
        b!("includes?", includes_p, "([s substr])", "True if s contains substr."),
        b!("starts-with?", starts_with_p, "([s prefix])", "True if s starts with prefix."),
        b!("ends-with?", ends_with_p, "([s suffix])", "True if s ends with suffix."),
        b!("replace", replace, "([s match replacement])", "Replaces every occurrence of match."),
        b!("blank?", blank_p, "([s])", "True if s is nil, empty, or whitespace."),
        b!("reverse", reverse, "([s])", "Reverses the characters of s."),
        b!("split-lines", split_lines, "([s])", "Splits on line endings."),
    ]
}

fn str_fn(args: &[Value]) -> Result<Value, SableError> {
    let mut out = String::new();
    for arg in args {
        if !matches!(arg, Value::Nil) {
            out.push_str(&sable_core::printer::display_str(arg));
        }
    }
    Ok(Value::string(out))
}

fn subs(args: &[Value]) -> Result<Value, SableError> {
    check_range("subs", args, 2, 3)?;
    let s = str_arg("subs", args, 0)?;
    let chars: Vec<char> = s.chars().collect();
    let start = super::int_arg("subs", args, 1)? as usize;
    let end = match args.get(2) {
        Some(_) => super::int_arg("subs", args, 2)? as usize,
        None => chars.len(),
    };
    if start > end || end > chars.len() {
        return Err(SableError::index(format!(
            "substring range {}..{} out of bounds for string of {}",
            start,
            end,
            chars.len()
        )));
    }
    Ok(Value::string(chars[start..end].iter().collect::<String>()))
}

fn name(args: &[Value]) -> Result<Value, SableError> {
    check_exact("name", args, 1)?;
    match &args[0] {
        Value::Str(s) => Ok(Value::Str(s.clone())),
        Value::Symbol(s) => Ok(Value::string(s.name_str())),
        Value::Keyword(k) => Ok(Value::string(k.name_str())),
        other => Err(SableError::type_err(format!(
            "name expects a string, symbol, or keyword, got {}",
            other.type_name()
        ))),
    }
}

fn namespace(args: &[Value]) -> Result<Value, SableError> {
    check_exact("namespace", args, 1)?;
    let ns = match &args[0] {
        Value::Symbol(s) => s.ns_str().map(Value::string),
        Value::Keyword(k) => k.ns_str().map(Value::string),
        other => {
            return Err(SableError::type_err(format!(
                "namespace expects a symbol or keyword, got {}",
                other.type_name()
            )));
        }
    };
    Ok(ns.unwrap_or(Value::Nil))
}

fn symbol(args: &[Value]) -> Result<Value, SableError> {
    check_range("symbol", args, 1, 2)?;
    match args.len() {
        1 => match &args[0] {
            Value::Symbol(_) => Ok(args[0].clone()),
            Value::Str(s) => Ok(Value::Symbol(Arc::new(Symbol::parse(s)))),
            Value::Keyword(k) => Ok(Value::Symbol(Arc::new(match k.ns_str() {
                Some(ns) => Symbol::qualified(ns, k.name_str()),
                None => Symbol::simple(k.name_str()),
            }))),
            other => Err(SableError::type_err(format!(
                "symbol expects a string, got {}",
                other.type_name()
            ))),
        },
        _ => {
            let ns = str_arg("symbol", args, 0)?;
            let name = str_arg("symbol", args, 1)?;
            Ok(Value::Symbol(Arc::new(Symbol::qualified(ns, name))))
        }
    }
}

fn keyword(args: &[Value]) -> Result<Value, SableError> {
    check_range("keyword", args, 1, 2)?;
    match args.len() {
        1 => match &args[0] {
            Value::Keyword(_) => Ok(args[0].clone()),
            Value::Str(s) => Ok(Value::Keyword(Keyword::parse(s))),
            Value::Symbol(s) => Ok(Value::Keyword(Keyword::intern(s.ns_str(), s.name_str()))),
            other => Err(SableError::type_err(format!(
                "keyword expects a string or symbol, got {}",
                other.type_name()
            ))),
        },
        _ => {
            let ns = str_arg("keyword", args, 0)?;
            let name = str_arg("keyword", args, 1)?;
            Ok(Value::Keyword(Keyword::intern(Some(ns), name)))
        }
    }
}

fn gensym(args: &[Value]) -> Result<Value, SableError> {
    check_range("gensym", args, 0, 1)?;
    let prefix = match args.first() {
        Some(Value::Str(s)) => s.to_string(),
        Some(Value::Symbol(s)) => s.name_str().to_string(),
        Some(other) => {
            return Err(SableError::type_err(format!(
                "gensym prefix must be a string or symbol, got {}",
                other.type_name()
            )));
        }
        None => "G__".to_string(),
    };
    let id = sable_compiler::next_gensym_id();
    Ok(Value::Symbol(Arc::new(Symbol::simple(&format!(
        "{}{}",
        prefix, id
    )))))
}

fn char_fn(args: &[Value]) -> Result<Value, SableError> {
    check_exact("char", args, 1)?;
    match &args[0] {
        Value::Char(c) => Ok(Value::Char(*c)),
        Value::Int(n) => u32::try_from(*n)
            .ok()
            .and_then(char::from_u32)
            .map(Value::Char)
            .ok_or_else(|| SableError::value_err(format!("invalid character code {}", n))),
        other => Err(SableError::type_err(format!(
            "char expects an integer, got {}",
            other.type_name()
        ))),
    }
}

// -- sable.string ------------------------------------------------------------

fn upper_case(args: &[Value]) -> Result<Value, SableError> {
    check_exact("upper-case", args, 1)?;
    Ok(Value::string(str_arg("upper-case", args, 0)?.to_uppercase()))
}

fn lower_case(args: &[Value]) -> Result<Value, SableError> {
    check_exact("lower-case", args, 1)?;
    Ok(Value::string(str_arg("lower-case", args, 0)?.to_lowercase()))
}

fn trim(args: &[Value]) -> Result<Value, SableError> {
    check_exact("trim", args, 1)?;
    Ok(Value::string(str_arg("trim", args, 0)?.trim()))
}

fn triml(args: &[Value]) -> Result<Value, SableError> {
    check_exact("triml", args, 1)?;
    Ok(Value::string(str_arg("triml", args, 0)?.trim_start()))
}

fn trimr(args: &[Value]) -> Result<Value, SableError> {
    check_exact("trimr", args, 1)?;
    Ok(Value::string(str_arg("trimr", args, 0)?.trim_end()))
}

fn split(args: &[Value]) -> Result<Value, SableError> {
    check_exact("split", args, 2)?;
    let s = str_arg("split", args, 0)?;
    let parts: Vec<Value> = match &args[1] {
        Value::Regex(re) => re.regex.split(s).map(Value::string).collect(),
        Value::Str(sep) => s.split(&**sep).map(Value::string).collect(),
        other => {
            return Err(SableError::type_err(format!(
                "split expects a regex or string separator, got {}",
                other.type_name()
            )));
        }
    };
    Ok(gc::alloc(Value::Vector(Arc::new(
        sable_core::vector::PersistentVector::from_values(parts),
    ))))
}

fn join(args: &[Value]) -> Result<Value, SableError> {
    check_range("join", args, 1, 2)?;
    let (sep, coll) = if args.len() == 2 {
        (
            sable_core::printer::display_str(&args[0]),
            &args[1],
        )
    } else {
        (String::new(), &args[0])
    };
    let mut out = String::new();
    for (i, item) in sable_core::seqs::iter(coll).enumerate() {
        let item = item?;
        if i > 0 {
            out.push_str(&sep);
        }
        if !matches!(item, Value::Nil) {
            out.push_str(&sable_core::printer::display_str(&item));
        }
    }
    Ok(Value::string(out))
}

fn includes_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("includes?", args, 2)?;
    Ok(Value::Bool(
        str_arg("includes?", args, 0)?.contains(str_arg("includes?", args, 1)?),
    ))
}

fn starts_with_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("starts-with?", args, 2)?;
    Ok(Value::Bool(
        str_arg("starts-with?", args, 0)?.starts_with(str_arg("starts-with?", args, 1)?),
    ))
}

fn ends_with_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("ends-with?", args, 2)?;
    Ok(Value::Bool(
        str_arg("ends-with?", args, 0)?.ends_with(str_arg("ends-with?", args, 1)?),
    ))
}

fn replace(args: &[Value]) -> Result<Value, SableError> {
    check_exact("replace", args, 3)?;
    let s = str_arg("replace", args, 0)?;
    let replacement = str_arg("replace", args, 2)?;
    match &args[1] {
        Value::Str(m) => Ok(Value::string(s.replace(&**m, replacement))),
        Value::Regex(re) => Ok(Value::string(
            re.regex.replace_all(s, replacement).into_owned(),
        )),
        other => Err(SableError::type_err(format!(
            "replace expects a string or regex match, got {}",
            other.type_name()
        ))),
    }
}

fn blank_p(args: &[Value]) -> Result<Value, SableError> {
    check_min("blank?", args, 1)?;
    Ok(Value::Bool(match &args[0] {
        Value::Nil => true,
        Value::Str(s) => s.trim().is_empty(),
        other => {
            return Err(SableError::type_err(format!(
                "blank? expects a string, got {}",
                other.type_name()
            )));
        }
    }))
}

fn reverse(args: &[Value]) -> Result<Value, SableError> {
    check_exact("reverse", args, 1)?;
    Ok(Value::string(
        str_arg("reverse", args, 0)?.chars().rev().collect::<String>(),
    ))
}

fn split_lines(args: &[Value]) -> Result<Value, SableError> {
    check_exact("split-lines", args, 1)?;
    let parts: Vec<Value> = str_arg("split-lines", args, 0)?
        .lines()
        .map(Value::string)
        .collect();
    Ok(gc::alloc(Value::List(Arc::new(PersistentList::from_values(
        parts,
    )))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_skips_nil_and_displays() {
        let out = str_fn(&[
            Value::string("a"),
            Value::Nil,
            Value::Int(3),
            Value::keyword("k"),
        ])
        .unwrap();
        match out {
            Value::Str(s) => assert_eq!(&*s, "a3:k"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_name_and_namespace() {
        let sym = Value::symbol("a.b/c");
        match name(&[sym.clone()]).unwrap() {
            Value::Str(s) => assert_eq!(&*s, "c"),
            other => panic!("unexpected {:?}", other),
        }
        match namespace(&[sym]).unwrap() {
            Value::Str(s) => assert_eq!(&*s, "a.b"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(namespace(&[Value::keyword("k")]).unwrap(), Value::Nil));
    }

    #[test]
    fn test_gensym_unique() {
        let a = gensym(&[]).unwrap();
        let b = gensym(&[]).unwrap();
        assert!(!sable_core::value_equals(&a, &b));
    }

    #[test]
    fn test_subs_bounds() {
        let s = Value::string("hello");
        match subs(&[s.clone(), Value::Int(1), Value::Int(3)]).unwrap() {
            Value::Str(out) => assert_eq!(&*out, "el"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(subs(&[s, Value::Int(9)]).is_err());
    }
}
