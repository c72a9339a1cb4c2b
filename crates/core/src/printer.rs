//! Printing: readable (`pr-str`) and display (`print`) forms
//!
//! Readable output round-trips through the reader for every readable value.
//! Lazy seqs are realized while printing; a realization failure prints as
//! an opaque form rather than propagating (matching REPL behavior).

use crate::seqs;
use crate::value::Value;
use std::fmt::Write;

/// Readable representation (`pr-str`)
pub fn pr_str(v: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, v, true);
    out
}

/// Human representation (`print`): strings and chars unquoted
pub fn display_str(v: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, v, false);
    out
}

fn write_value(out: &mut String, v: &Value, readably: bool) {
    match v {
        Value::Nil => out.push_str("nil"),
        Value::Bool(b) => {
            let _ = write!(out, "{}", b);
        }
        Value::Int(n) => {
            let _ = write!(out, "{}", n);
        }
        Value::Float(f) => write_float(out, *f),
        Value::Char(c) => {
            if readably {
                write_char(out, *c);
            } else {
                out.push(*c);
            }
        }
        Value::Str(s) => {
            if readably {
                write_string_readably(out, s);
            } else {
                out.push_str(s);
            }
        }
        Value::Symbol(s) => {
            let _ = write!(out, "{}", s);
        }
        Value::Keyword(k) => {
            let _ = write!(out, "{}", k);
        }
        Value::List(l) => {
            out.push('(');
            write_items(out, l.iter(), readably);
            out.push(')');
        }
        Value::Cons(_) | Value::LazySeq(_) => match seqs::collect(v) {
            Ok(items) => {
                out.push('(');
                write_items(out, items.iter(), readably);
                out.push(')');
            }
            Err(_) => out.push_str("#<unrealizable-seq>"),
        },
        Value::Vector(vec) => {
            out.push('[');
            write_items(out, vec.iter(), readably);
            out.push(']');
        }
        Value::ArrayMap(m) => write_map(out, m.iter().map(|(k, v)| (k, v)), readably),
        Value::Map(m) => write_map(out, m.iter(), readably),
        Value::Set(s) => {
            out.push_str("#{");
            write_items(out, s.iter(), readably);
            out.push('}');
        }
        Value::Regex(r) => {
            let _ = write!(out, "#\"{}\"", r.source);
        }
        Value::Fn(f) => {
            let _ = write!(out, "#<fn {}>", f.name.as_deref().unwrap_or("anonymous"));
        }
        Value::Builtin(b) => {
            let _ = write!(out, "#<builtin {}>", b.name);
        }
        Value::MultiFn(m) => {
            let _ = write!(out, "#<multifn {}>", m.name);
        }
        Value::Protocol(p) => {
            let _ = write!(out, "#<protocol {}>", p.name);
        }
        Value::ProtocolFn(p) => {
            let _ = write!(out, "#<protocol-fn {}/{}>", p.protocol.name, p.method);
        }
        Value::Var(var) => {
            let _ = write!(out, "#'{}", var.qualified_name());
        }
        Value::Atom(a) => {
            out.push_str("#<atom ");
            write_value(out, &a.load(), readably);
            out.push('>');
        }
        Value::Ref(r) => {
            out.push_str("#<ref ");
            write_value(out, &r.current(), readably);
            out.push('>');
        }
        Value::Volatile(cell) => {
            out.push_str("#<volatile ");
            write_value(out, &cell.load(), readably);
            out.push('>');
        }
        Value::Promise(p) => {
            if p.is_delivered() {
                out.push_str("#<promise delivered>");
            } else {
                out.push_str("#<promise pending>");
            }
        }
        Value::Reduced(inner) => {
            out.push_str("#<reduced ");
            write_value(out, inner, readably);
            out.push('>');
        }
        Value::TransientVector(_) | Value::TransientMap(_) | Value::TransientSet(_) => {
            let _ = write!(out, "#<{}>", v.type_name());
        }
    }
}

fn write_items<'a>(out: &mut String, items: impl Iterator<Item = &'a Value>, readably: bool) {
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push(' ');
        }
        write_value(out, item, readably);
    }
}

fn write_map<'a>(
    out: &mut String,
    entries: impl Iterator<Item = (&'a Value, &'a Value)>,
    readably: bool,
) {
    out.push('{');
    for (i, (k, v)) in entries.enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_value(out, k, readably);
        out.push(' ');
        write_value(out, v, readably);
    }
    out.push('}');
}

/// Floats always show a decimal point so they read back as floats
fn write_float(out: &mut String, f: f64) {
    if f.is_nan() {
        out.push_str("##NaN");
    } else if f.is_infinite() {
        out.push_str(if f > 0.0 { "##Inf" } else { "##-Inf" });
    } else if f == f.trunc() && f.abs() < 1e17 {
        let _ = write!(out, "{:.1}", f);
    } else {
        let _ = write!(out, "{}", f);
    }
}

fn write_char(out: &mut String, c: char) {
    match c {
        '\n' => out.push_str("\\newline"),
        '\t' => out.push_str("\\tab"),
        ' ' => out.push_str("\\space"),
        '\r' => out.push_str("\\return"),
        '\u{8}' => out.push_str("\\backspace"),
        '\u{c}' => out.push_str("\\formfeed"),
        c => {
            out.push('\\');
            out.push(c);
        }
    }
}

fn write_string_readably(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::PersistentList;
    use crate::map::ArrayMap;
    use crate::vector::PersistentVector;
    use std::sync::Arc;

    #[test]
    fn test_scalars() {
        assert_eq!(pr_str(&Value::Nil), "nil");
        assert_eq!(pr_str(&Value::Bool(true)), "true");
        assert_eq!(pr_str(&Value::Int(-3)), "-3");
        assert_eq!(pr_str(&Value::Float(1.0)), "1.0");
        assert_eq!(pr_str(&Value::Float(1.5)), "1.5");
        assert_eq!(pr_str(&Value::keyword("a")), ":a");
        assert_eq!(pr_str(&Value::symbol("inc")), "inc");
    }

    #[test]
    fn test_string_readable_vs_display() {
        let s = Value::string("a\"b\n");
        assert_eq!(pr_str(&s), "\"a\\\"b\\n\"");
        assert_eq!(display_str(&s), "a\"b\n");
    }

    #[test]
    fn test_char_names() {
        assert_eq!(pr_str(&Value::Char('\n')), "\\newline");
        assert_eq!(pr_str(&Value::Char('x')), "\\x");
        assert_eq!(display_str(&Value::Char('x')), "x");
    }

    #[test]
    fn test_collections() {
        let l = Value::List(Arc::new(PersistentList::from_values(vec![
            Value::Int(1),
            Value::Int(2),
        ])));
        assert_eq!(pr_str(&l), "(1 2)");
        let v = Value::Vector(Arc::new(PersistentVector::from_values(vec![
            Value::keyword("k"),
            Value::string("x"),
        ])));
        assert_eq!(pr_str(&v), "[:k \"x\"]");
        let m = Value::ArrayMap(Arc::new(ArrayMap::from_pairs(vec![(
            Value::keyword("a"),
            Value::Int(1),
        )])));
        assert_eq!(pr_str(&m), "{:a 1}");
    }
}
