//! Seq primitives and eager traversal
//!
//! The lazy sequence library (map, filter, take, iterate, …) lives in the
//! embedded core source on top of these primitives. `reduce` is the native
//! bridge that drives user fns from Rust, honoring `reduced` short-circuits.

use super::{b, check_exact, check_min, check_range};
use crate::call::call_value;
use crate::registry::BuiltinDef;
use sable_core::error::SableError;
use sable_core::gc;
use sable_core::list::PersistentList;
use sable_core::seqs::{self, Cons, LazySeq};
use sable_core::value::Value;
use std::sync::Arc;

pub fn builtins() -> Vec<BuiltinDef> {
    vec![
        b!("seq", seq, "([coll])", "A seq on the collection, or nil when empty."),
        b!("first", first, "([coll])", "The first item, or nil."),
        b!("rest", rest, "([coll])", "A possibly empty seq of the items after the first."),
        b!("next", next, "([coll])", "A seq of the items after the first, or nil."),
        b!("nthnext", nthnext, "([coll n])", "The nth next of coll."),
        b!("cons", cons, "([x seq])", "A new seq with x as the first element."),
        b!("list*", list_star, "([& args+seq])", "A seq of the fixed args followed by the final seq."),
        b!("reduce", reduce, "([f coll] [f init coll])", "Folds f over coll, honoring reduced."),
        b!("reduce-kv", reduce_kv, "([f init map])", "Folds f over a map's entries."),
        b!("reduced", reduced, "([x])", "Wraps x so reduce terminates with it."),
        b!("reduced?", reduced_p, "([x])", "True if x was created by reduced."),
        b!("into", into, "([to from])", "Adds every item of from to to."),
        b!("apply", apply, "([f & args+seq])", "Applies f to the fixed args plus the final seq of args."),
        b!("doall", doall, "([seq])", "Realizes a lazy seq fully and returns it."),
        b!("dorun", dorun, "([seq])", "Realizes a lazy seq for side effects, returning nil."),
        b!("sort", sort, "([coll] [comp coll])", "A sorted seq of the items."),
        b!("sort-by", sort_by, "([keyfn coll])", "Sorted by comparing (keyfn item)."),
        b!("reverse", reverse, "([coll])", "A list of the items in reverse order."),
        b!("-lazy-seq", lazy_seq_ctor, "([thunk])", "A lazy seq realizing thunk on first use."),
        b!("realized?", realized_p, "([x])", "True if a lazy value has been forced."),
        b!("seq?", seq_p, "([x])", "True if x is a seq (list, cons, lazy seq)."),
        b!("sequential?", sequential_p, "([x])", "True if x holds items in order."),
        b!("identity", identity, "([x])", "Returns its argument."),
        b!("not", not, "([x])", "true if x is logical false."),
        b!("boolean", boolean, "([x])", "Coerce to true or false."),
        b!("nil?", nil_p, "([x])", "True if x is nil."),
        b!("some?", some_p, "([x])", "True if x is not nil."),
        b!("true?", true_p, "([x])", "True if x is the value true."),
        b!("false?", false_p, "([x])", "True if x is the value false."),
        b!("fn?", fn_p, "([x])", "True if x is a function."),
        b!("ifn?", ifn_p, "([x])", "True if x can be invoked."),
        b!("string?", string_p, "([x])", "True if x is a string."),
        b!("keyword?", keyword_p, "([x])", "True if x is a keyword."),
        b!("symbol?", symbol_p, "([x])", "True if x is a symbol."),
        b!("char?", char_p, "([x])", "True if x is a character."),
        b!("boolean?", boolean_p, "([x])", "True if x is a boolean."),
        b!("var?", var_p, "([x])", "True if x is a var."),
    ]
}

fn seq(args: &[Value]) -> Result<Value, SableError> {
    check_exact("seq", args, 1)?;
    seqs::seq(&args[0])
}

fn first(args: &[Value]) -> Result<Value, SableError> {
    check_exact("first", args, 1)?;
    seqs::first(&args[0])
}

fn rest(args: &[Value]) -> Result<Value, SableError> {
    check_exact("rest", args, 1)?;
    seqs::rest(&args[0])
}

fn next(args: &[Value]) -> Result<Value, SableError> {
    check_exact("next", args, 1)?;
    seqs::next(&args[0])
}

fn nthnext(args: &[Value]) -> Result<Value, SableError> {
    check_exact("nthnext", args, 2)?;
    let n = super::int_arg("nthnext", args, 1)?;
    let mut cur = seqs::seq(&args[0])?;
    for _ in 0..n {
        if matches!(cur, Value::Nil) {
            return Ok(Value::Nil);
        }
        cur = seqs::next(&cur)?;
    }
    Ok(cur)
}

fn cons(args: &[Value]) -> Result<Value, SableError> {
    check_exact("cons", args, 2)?;
    Ok(gc::alloc(Value::Cons(Arc::new(Cons::new(
        args[0].clone(),
        args[1].clone(),
    )))))
}

fn list_star(args: &[Value]) -> Result<Value, SableError> {
    check_min("list*", args, 1)?;
    let mut items: Vec<Value> = args[..args.len() - 1].to_vec();
    for item in seqs::iter(&args[args.len() - 1]) {
        items.push(item?);
    }
    if items.is_empty() {
        return Ok(Value::Nil);
    }
    Ok(gc::alloc(Value::List(Arc::new(PersistentList::from_values(
        items,
    )))))
}

fn reduce(args: &[Value]) -> Result<Value, SableError> {
    check_range("reduce", args, 2, 3)?;
    let f = &args[0];
    let (mut acc, coll) = match args.len() {
        2 => {
            let head = seqs::seq(&args[1])?;
            match head {
                Value::Nil => return call_value(f, &[]),
                _ => (seqs::first(&head)?, seqs::rest(&head)?),
            }
        }
        _ => (args[1].clone(), args[2].clone()),
    };
    for item in seqs::iter(&coll) {
        let item = item?;
        acc = call_value(f, &[acc, item])?;
        if let Value::Reduced(inner) = acc {
            return Ok((*inner).clone());
        }
    }
    Ok(acc)
}

fn reduce_kv(args: &[Value]) -> Result<Value, SableError> {
    check_exact("reduce-kv", args, 3)?;
    let entries: Vec<(Value, Value)> = match &args[2] {
        Value::Nil => vec![],
        Value::ArrayMap(m) => m.iter().cloned().collect(),
        Value::Map(m) => m.to_pairs(),
        Value::Vector(v) => v
            .iter()
            .enumerate()
            .map(|(i, item)| (Value::Int(i as i64), item.clone()))
            .collect(),
        other => {
            return Err(SableError::type_err(format!(
                "reduce-kv not supported on {}",
                other.type_name()
            )));
        }
    };
    let mut acc = args[1].clone();
    for (k, v) in entries {
        acc = call_value(&args[0], &[acc, k, v])?;
        if let Value::Reduced(inner) = acc {
            return Ok((*inner).clone());
        }
    }
    Ok(acc)
}

fn reduced(args: &[Value]) -> Result<Value, SableError> {
    check_exact("reduced", args, 1)?;
    Ok(gc::alloc(Value::Reduced(Arc::new(args[0].clone()))))
}

fn reduced_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("reduced?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Reduced(_))))
}

fn into(args: &[Value]) -> Result<Value, SableError> {
    check_range("into", args, 1, 2)?;
    if args.len() == 1 {
        return Ok(args[0].clone());
    }
    let mut acc = args[0].clone();
    for item in seqs::iter(&args[1]) {
        acc = super::coll::conj_one(&acc, item?)?;
    }
    Ok(acc)
}

fn apply(args: &[Value]) -> Result<Value, SableError> {
    let (f, call_args) = crate::call::spread_args(args)?;
    call_value(&f, &call_args)
}

fn doall(args: &[Value]) -> Result<Value, SableError> {
    check_exact("doall", args, 1)?;
    for item in seqs::iter(&args[0]) {
        item?;
    }
    Ok(args[0].clone())
}

fn dorun(args: &[Value]) -> Result<Value, SableError> {
    check_exact("dorun", args, 1)?;
    for item in seqs::iter(&args[0]) {
        item?;
    }
    Ok(Value::Nil)
}

fn sort(args: &[Value]) -> Result<Value, SableError> {
    check_range("sort", args, 1, 2)?;
    let (comparator, coll) = if args.len() == 2 {
        (Some(&args[0]), &args[1])
    } else {
        (None, &args[0])
    };
    let mut items = seqs::collect(coll)?;
    let mut failure: Option<SableError> = None;
    items.sort_by(|a, b| {
        if failure.is_some() {
            return std::cmp::Ordering::Equal;
        }
        let result = match comparator {
            Some(f) => call_value(f, &[a.clone(), b.clone()]).and_then(|v| match v {
                Value::Int(n) => Ok(n.cmp(&0)),
                Value::Bool(true) => Ok(std::cmp::Ordering::Less),
                Value::Bool(false) => Ok(std::cmp::Ordering::Greater),
                other => Err(SableError::type_err(format!(
                    "comparator must return an integer or boolean, got {}",
                    other.type_name()
                ))),
            }),
            None => sable_core::value_compare(a, b),
        };
        match result {
            Ok(o) => o,
            Err(e) => {
                failure = Some(e);
                std::cmp::Ordering::Equal
            }
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    Ok(gc::alloc(Value::List(Arc::new(PersistentList::from_values(
        items,
    )))))
}

fn sort_by(args: &[Value]) -> Result<Value, SableError> {
    check_exact("sort-by", args, 2)?;
    let mut keyed: Vec<(Value, Value)> = Vec::new();
    for item in seqs::iter(&args[1]) {
        let item = item?;
        let key = call_value(&args[0], &[item.clone()])?;
        keyed.push((key, item));
    }
    let mut failure: Option<SableError> = None;
    keyed.sort_by(|(ka, _), (kb, _)| match sable_core::value_compare(ka, kb) {
        Ok(o) => o,
        Err(e) => {
            failure = Some(e);
            std::cmp::Ordering::Equal
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    Ok(gc::alloc(Value::List(Arc::new(PersistentList::from_values(
        keyed.into_iter().map(|(_, v)| v).collect(),
    )))))
}

fn reverse(args: &[Value]) -> Result<Value, SableError> {
    check_exact("reverse", args, 1)?;
    let mut items = seqs::collect(&args[0])?;
    items.reverse();
    Ok(gc::alloc(Value::List(Arc::new(PersistentList::from_values(
        items,
    )))))
}

fn lazy_seq_ctor(args: &[Value]) -> Result<Value, SableError> {
    check_exact("-lazy-seq", args, 1)?;
    Ok(gc::alloc(Value::LazySeq(Arc::new(LazySeq::new(
        args[0].clone(),
    )))))
}

fn realized_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("realized?", args, 1)?;
    Ok(Value::Bool(match &args[0] {
        Value::LazySeq(l) => l.is_realized(),
        Value::Promise(p) => p.is_delivered(),
        _ => true,
    }))
}

fn seq_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("seq?", args, 1)?;
    Ok(Value::Bool(matches!(
        args[0],
        Value::List(_) | Value::Cons(_) | Value::LazySeq(_)
    )))
}

fn sequential_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("sequential?", args, 1)?;
    Ok(Value::Bool(sable_core::cmp::is_sequential(&args[0])))
}

fn identity(args: &[Value]) -> Result<Value, SableError> {
    check_exact("identity", args, 1)?;
    Ok(args[0].clone())
}

fn not(args: &[Value]) -> Result<Value, SableError> {
    check_exact("not", args, 1)?;
    Ok(Value::Bool(!args[0].is_truthy()))
}

fn boolean(args: &[Value]) -> Result<Value, SableError> {
    check_exact("boolean", args, 1)?;
    Ok(Value::Bool(args[0].is_truthy()))
}

fn nil_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("nil?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Nil)))
}

fn some_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("some?", args, 1)?;
    Ok(Value::Bool(!matches!(args[0], Value::Nil)))
}

fn true_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("true?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Bool(true))))
}

fn false_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("false?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Bool(false))))
}

fn fn_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("fn?", args, 1)?;
    Ok(Value::Bool(matches!(
        args[0],
        Value::Fn(_) | Value::Builtin(_) | Value::MultiFn(_) | Value::ProtocolFn(_)
    )))
}

fn ifn_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("ifn?", args, 1)?;
    Ok(Value::Bool(matches!(
        args[0],
        Value::Fn(_)
            | Value::Builtin(_)
            | Value::MultiFn(_)
            | Value::ProtocolFn(_)
            | Value::Keyword(_)
            | Value::Symbol(_)
            | Value::ArrayMap(_)
            | Value::Map(_)
            | Value::Set(_)
            | Value::Vector(_)
            | Value::Var(_)
    )))
}

fn string_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("string?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Str(_))))
}

fn keyword_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("keyword?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Keyword(_))))
}

fn symbol_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("symbol?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Symbol(_))))
}

fn char_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("char?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Char(_))))
}

fn boolean_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("boolean?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Bool(_))))
}

fn var_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("var?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Var(_))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_list(items: &[i64]) -> Value {
        Value::List(Arc::new(PersistentList::from_values(
            items.iter().map(|n| Value::Int(*n)).collect(),
        )))
    }

    #[test]
    fn test_reduce_with_and_without_init() {
        let plus = crate::builtins::arith::builtins()
            .into_iter()
            .find(|b| b.name == "+")
            .unwrap();
        let f = Value::Builtin(Arc::new(sable_core::fns::BuiltinFn {
            name: "+",
            f: plus.f,
            doc: "",
            arglists: "",
            is_macro: false,
        }));
        let coll = int_list(&[1, 2, 3, 4]);
        assert!(matches!(
            reduce(&[f.clone(), Value::Int(0), coll.clone()]).unwrap(),
            Value::Int(10)
        ));
        assert!(matches!(reduce(&[f, coll]).unwrap(), Value::Int(10)));
    }

    #[test]
    fn test_reduce_honors_reduced() {
        fn stop_at_two(args: &[Value]) -> Result<Value, SableError> {
            match &args[1] {
                Value::Int(2) => Ok(gc::alloc(Value::Reduced(Arc::new(Value::keyword("done"))))),
                _ => Ok(args[0].clone()),
            }
        }
        let f = Value::Builtin(Arc::new(sable_core::fns::BuiltinFn {
            name: "stop",
            f: stop_at_two,
            doc: "",
            arglists: "",
            is_macro: false,
        }));
        let result = reduce(&[f, Value::Int(0), int_list(&[1, 2, 3])]).unwrap();
        assert!(matches!(result, Value::Keyword(_)));
    }

    #[test]
    fn test_cons_and_list_star() {
        let c = cons(&[Value::Int(1), int_list(&[2, 3])]).unwrap();
        assert_eq!(sable_core::printer::pr_str(&c), "(1 2 3)");
        let ls = list_star(&[Value::Int(0), c]).unwrap();
        assert_eq!(sable_core::printer::pr_str(&ls), "(0 1 2 3)");
    }

    #[test]
    fn test_sort_default_ordering() {
        let sorted = sort(&[int_list(&[3, 1, 2])]).unwrap();
        assert_eq!(sable_core::printer::pr_str(&sorted), "(1 2 3)");
    }
}
