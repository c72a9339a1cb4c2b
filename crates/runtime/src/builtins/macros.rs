//! Native macro builtins: the bootstrap macro layer
//!
//! These receive unevaluated forms and return forms for re-analysis.
//! Destructuring is lowered here (in `fn`/`let`/`loop`/`doseq`) into nested
//! `let*` bindings over `nth`/`first`/`next`/`get` calls, so the analyzer
//! only ever sees simple symbols.

use super::{b, check_exact, check_min, check_range};
use crate::registry::BuiltinDef;
use sable_core::error::SableError;
use sable_core::list::PersistentList;
use sable_core::symbol::Symbol;
use sable_core::value::Value;
use sable_core::vector::PersistentVector;
use std::sync::Arc;

pub fn macro_builtins() -> Vec<BuiltinDef> {
    vec![
        b!("defn", defn, "([name doc? params & body])", "Defines a named fn."),
        b!("defn-", defn, "([name doc? params & body])", "Defines a named fn (private by convention)."),
        b!("defmacro", defmacro, "([name params & body])", "Defines a macro."),
        b!("fn", fn_macro, "([name? params & body])", "An anonymous fn with destructuring."),
        b!("let", let_macro, "([bindings & body])", "Binds names (with destructuring) over body."),
        b!("loop", loop_macro, "([bindings & body])", "A recur target with bindings."),
        b!("when", when, "([test & body])", "Evaluates body when test is truthy."),
        b!("when-not", when_not, "([test & body])", "Evaluates body when test is falsy."),
        b!("when-let", when_let, "([[binding test] & body])", "Binds and evaluates body when test is truthy."),
        b!("if-let", if_let, "([[binding test] then else?])", "Binds and branches on test."),
        b!("if-not", if_not, "([test then else?])", "Inverted if."),
        b!("if-some", if_some, "([[binding test] then else?])", "Branches on test being non-nil."),
        b!("when-some", when_some, "([[binding test] & body])", "Evaluates body when test is non-nil."),
        b!("cond", cond, "([& clauses])", "Test/result pairs evaluated in order."),
        b!("condp", condp, "([pred expr & clauses])", "Dispatches on (pred test expr)."),
        b!("case", case_macro, "([e & clauses])", "Constant-time dispatch on compile-time constants."),
        b!("and", and, "([& forms])", "Short-circuiting logical and."),
        b!("or", or, "([& forms])", "Short-circuiting logical or."),
        b!("->", thread_first, "([x & forms])", "Threads x as the first argument through forms."),
        b!("->>", thread_last, "([x & forms])", "Threads x as the last argument through forms."),
        b!("as->", as_thread, "([expr name & forms])", "Threads with an explicit name."),
        b!("some->", some_thread_first, "([x & forms])", "Threads while values are non-nil."),
        b!("some->>", some_thread_last, "([x & forms])", "Threads last while values are non-nil."),
        b!("cond->", cond_thread, "([x & clauses])", "Threads through forms whose tests pass."),
        b!("doto", doto, "([x & forms])", "Calls forms on x for effect, returning x."),
        b!("dotimes", dotimes, "([[i n] & body])", "Runs body n times with i bound."),
        b!("doseq", doseq, "([bindings & body])", "Runs body for every element, for side effects."),
        b!("while", while_macro, "([test & body])", "Loops while test is truthy."),
        b!("for", for_macro, "([seq-exprs body])", "Sequence comprehension with :let and :when."),
        b!("binding", binding, "([bindings & body])", "Dynamically binds vars around body."),
        b!("lazy-seq", lazy_seq, "([& body])", "Defers body into a memoized lazy seq."),
        b!("comment", comment, "([& _])", "Ignores its body."),
        b!("assert", assert_macro, "([x] [x message])", "Throws when x is falsy."),
        b!("declare", declare, "([& names])", "Interns unbound vars."),
        b!("defonce", defonce, "([name expr])", "Defines name only if not already bound."),
        b!("letfn", letfn, "([fnspecs & body])", "Binds local fns over body."),
        b!("ns", ns_macro, "([name & clauses])", "Switches namespace and processes :require clauses."),
        b!("time", time_macro, "([expr])", "Prints elapsed milliseconds, returns expr's value."),
        b!("dosync", dosync, "([& body])", "Runs body inside an STM transaction."),
        b!("defprotocol", defprotocol, "([name & sigs])", "Defines a protocol and its method fns."),
        b!("extend-type", extend_type, "([type-key & protos+methods])", "Implements protocols for one type key."),
        b!("extend-protocol", extend_protocol, "([proto & types+methods])", "Implements one protocol for many types."),
        b!("reify", reify, "([& protos+methods])", "An anonymous value implementing protocols."),
        b!("deftype", deftype, "([name fields & protos+methods])", "A named map-backed type with a constructor."),
        b!("defmulti", defmulti, "([name dispatch-fn])", "Defines a multimethod."),
        b!("defmethod", defmethod, "([name dispatch-val params & body])", "Adds a method to a multimethod."),
    ]
}

// -- form builders -----------------------------------------------------------

fn list_of(items: Vec<Value>) -> Value {
    Value::List(Arc::new(PersistentList::from_values(items)))
}

fn vec_of(items: Vec<Value>) -> Value {
    Value::Vector(Arc::new(PersistentVector::from_values(items)))
}

fn sym(name: &str) -> Value {
    Value::symbol(name)
}

fn gensym(prefix: &str) -> Value {
    Value::Symbol(Arc::new(Symbol::simple(&format!(
        "{}__{}",
        prefix,
        sable_compiler::next_gensym_id()
    ))))
}

fn quoted(form: Value) -> Value {
    list_of(vec![sym("quote"), form])
}

fn is_simple_symbol(v: &Value) -> bool {
    matches!(v, Value::Symbol(s) if s.ns.is_none())
}

fn symbol_named(v: &Value, name: &str) -> bool {
    matches!(v, Value::Symbol(s) if s.ns.is_none() && s.name_str() == name)
}

fn keyword_named(v: &Value, name: &str) -> bool {
    matches!(v, Value::Keyword(k) if k.ns_str().is_none() && k.name_str() == name)
}

fn form_items(v: &Value) -> Option<Vec<Value>> {
    match v {
        Value::List(l) => Some(l.iter().cloned().collect()),
        _ => None,
    }
}

fn vector_items(name: &str, v: &Value) -> Result<Vec<Value>, SableError> {
    match v {
        Value::Vector(items) => Ok(items.to_vec()),
        other => Err(SableError::compile(format!(
            "{} requires a vector, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn map_pairs(v: &Value) -> Vec<(Value, Value)> {
    match v {
        Value::ArrayMap(m) => m.iter().cloned().collect(),
        Value::Map(m) => m.to_pairs(),
        _ => vec![],
    }
}

// -- destructuring -----------------------------------------------------------

/// Lower one binding pattern to `(name, init)` pairs appended to `out`
pub fn destructure(pattern: &Value, init: Value, out: &mut Vec<Value>) -> Result<(), SableError> {
    match pattern {
        Value::Symbol(s) if s.ns.is_none() => {
            out.push(pattern.clone());
            out.push(init);
            Ok(())
        }
        Value::Vector(items) => destructure_sequential(&items.to_vec(), init, out),
        Value::ArrayMap(_) | Value::Map(_) => destructure_associative(pattern, init, out),
        other => Err(SableError::compile(format!(
            "unsupported binding form: {}",
            sable_core::printer::pr_str(other)
        ))),
    }
}

fn destructure_sequential(
    items: &[Value],
    init: Value,
    out: &mut Vec<Value>,
) -> Result<(), SableError> {
    let temp = gensym("vec");
    out.push(temp.clone());
    out.push(init);
    let mut idx = 0usize;
    let mut i = 0usize;
    while i < items.len() {
        let item = &items[i];
        if symbol_named(item, "&") {
            let rest_pattern = items.get(i + 1).ok_or_else(|| {
                SableError::compile("missing binding after & in destructuring")
            })?;
            destructure(
                rest_pattern,
                list_of(vec![
                    sym("sable.core/nthnext"),
                    temp.clone(),
                    Value::Int(idx as i64),
                ]),
                out,
            )?;
            i += 2;
            continue;
        }
        if keyword_named(item, "as") {
            let as_sym = items.get(i + 1).ok_or_else(|| {
                SableError::compile("missing binding after :as in destructuring")
            })?;
            out.push(as_sym.clone());
            out.push(temp.clone());
            i += 2;
            continue;
        }
        destructure(
            item,
            list_of(vec![
                sym("sable.core/nth"),
                temp.clone(),
                Value::Int(idx as i64),
                Value::Nil,
            ]),
            out,
        )?;
        idx += 1;
        i += 1;
    }
    Ok(())
}

fn destructure_associative(
    pattern: &Value,
    init: Value,
    out: &mut Vec<Value>,
) -> Result<(), SableError> {
    let temp = gensym("map");
    out.push(temp.clone());
    out.push(init);

    let pairs = map_pairs(pattern);
    let defaults: Vec<(Value, Value)> = pairs
        .iter()
        .find(|(k, _)| keyword_named(k, "or"))
        .map(|(_, v)| map_pairs(v))
        .unwrap_or_default();
    let default_for = |name: &str| -> Value {
        defaults
            .iter()
            .find(|(k, _)| matches!(k, Value::Symbol(s) if s.name_str() == name))
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Nil)
    };

    for (k, v) in &pairs {
        if keyword_named(k, "or") {
            continue;
        }
        if keyword_named(k, "as") {
            out.push(v.clone());
            out.push(temp.clone());
            continue;
        }
        let shorthand = if keyword_named(k, "keys") {
            Some("keys")
        } else if keyword_named(k, "strs") {
            Some("strs")
        } else if keyword_named(k, "syms") {
            Some("syms")
        } else {
            None
        };
        if let Some(kind) = shorthand {
            for name_sym in vector_items(":keys", v)? {
                let name = match &name_sym {
                    Value::Symbol(s) => s.name_str().to_string(),
                    other => {
                        return Err(SableError::compile(format!(
                            ":{} binding must be a symbol, got {}",
                            kind,
                            other.type_name()
                        )));
                    }
                };
                let key = match kind {
                    "keys" => Value::keyword(&name),
                    "strs" => Value::string(&name),
                    _ => quoted(sym(&name)),
                };
                out.push(sym(&name));
                out.push(list_of(vec![
                    sym("sable.core/get"),
                    temp.clone(),
                    key,
                    default_for(&name),
                ]));
            }
            continue;
        }
        // General form: {binding key-expr}
        let default = match k {
            Value::Symbol(s) => default_for(s.name_str()),
            _ => Value::Nil,
        };
        destructure(
            k,
            list_of(vec![
                sym("sable.core/get"),
                temp.clone(),
                v.clone(),
                default,
            ]),
            out,
        )?;
    }
    Ok(())
}

/// Lower a full binding vector (pattern/init pairs) for let/loop
fn destructure_bindings(bindings: &[Value]) -> Result<Vec<Value>, SableError> {
    if bindings.len() % 2 != 0 {
        return Err(SableError::compile(
            "binding vector must have an even number of forms",
        ));
    }
    let mut out = Vec::new();
    for pair in bindings.chunks(2) {
        destructure(&pair[0], pair[1].clone(), &mut out)?;
    }
    Ok(out)
}

// -- fns ---------------------------------------------------------------------

/// Rewrite one arity's params, destructuring non-symbol patterns into a
/// wrapping let*
fn lower_arity(params: &[Value], body: &[Value]) -> Result<Value, SableError> {
    let mut new_params = Vec::new();
    let mut let_bindings = Vec::new();
    let mut saw_amp = false;
    for p in params {
        if symbol_named(p, "&") {
            saw_amp = true;
            new_params.push(p.clone());
            continue;
        }
        if is_simple_symbol(p) {
            new_params.push(p.clone());
        } else {
            let temp = gensym(if saw_amp { "rest" } else { "p" });
            new_params.push(temp.clone());
            destructure(p, temp, &mut let_bindings)?;
        }
    }
    let mut arity = vec![vec_of(new_params)];
    if let_bindings.is_empty() {
        arity.extend_from_slice(body);
    } else {
        let mut let_form = vec![sym("let*"), vec_of(let_bindings)];
        let_form.extend_from_slice(body);
        arity.push(list_of(let_form));
    }
    Ok(list_of(arity))
}

// (fn name? [params] body...) or (fn name? ([params] body...)+) → fn*
fn fn_macro(args: &[Value]) -> Result<Value, SableError> {
    check_min("fn", args, 1)?;
    let mut idx = 0;
    let mut out = vec![sym("fn*")];
    if is_simple_symbol(&args[0]) {
        out.push(args[0].clone());
        idx = 1;
    }
    match args.get(idx) {
        Some(Value::Vector(params)) => {
            out.push(lower_arity(&params.to_vec(), &args[idx + 1..])?);
        }
        Some(Value::List(_)) => {
            for arity in &args[idx..] {
                let items = form_items(arity).ok_or_else(|| {
                    SableError::compile("fn arity must be a list")
                })?;
                let params = vector_items("fn", &items[0])?;
                out.push(lower_arity(&params, &items[1..])?);
            }
        }
        _ => return Err(SableError::compile("fn requires a parameter vector")),
    }
    Ok(list_of(out))
}

// (defn name doc? attr? params|arities body...) → (def name (fn name ...))
fn defn(args: &[Value]) -> Result<Value, SableError> {
    check_min("defn", args, 2)?;
    let name = args[0].clone();
    if !is_simple_symbol(&name) {
        return Err(SableError::compile("defn requires a symbol name"));
    }
    let mut rest = &args[1..];
    let mut def_form = vec![sym("def"), name.clone()];
    // Optional doc-string
    if let Some(Value::Str(doc)) = rest.first() {
        if rest.len() > 1 {
            def_form = vec![sym("def"), name.clone(), Value::string(doc.to_string())];
            rest = &rest[1..];
        }
    }
    // Optional attribute map, carried as var metadata by def
    if matches!(rest.first(), Some(Value::ArrayMap(_) | Value::Map(_))) && rest.len() > 1 {
        rest = &rest[1..];
    }
    let mut fn_args = vec![name];
    fn_args.extend_from_slice(rest);
    def_form.push(fn_macro(&fn_args)?);
    Ok(list_of(def_form))
}

// (defmacro name params body...) →
// (do (def name (fn ...)) (sable.core/-mark-macro! (var name)))
fn defmacro(args: &[Value]) -> Result<Value, SableError> {
    check_min("defmacro", args, 2)?;
    let name = args[0].clone();
    let def_form = defn(args)?;
    Ok(list_of(vec![
        sym("do"),
        def_form,
        list_of(vec![
            sym("sable.core/-mark-macro!"),
            list_of(vec![sym("var"), name.clone()]),
        ]),
        list_of(vec![sym("var"), name]),
    ]))
}

// -- let/loop ----------------------------------------------------------------

fn let_macro(args: &[Value]) -> Result<Value, SableError> {
    check_min("let", args, 1)?;
    let bindings = vector_items("let", &args[0])?;
    let lowered = destructure_bindings(&bindings)?;
    let mut out = vec![sym("let*"), vec_of(lowered)];
    out.extend_from_slice(&args[1..]);
    Ok(list_of(out))
}

fn loop_macro(args: &[Value]) -> Result<Value, SableError> {
    check_min("loop", args, 1)?;
    let bindings = vector_items("loop", &args[0])?;
    if bindings.len() % 2 != 0 {
        return Err(SableError::compile(
            "loop binding vector must have an even number of forms",
        ));
    }
    if bindings.chunks(2).all(|pair| is_simple_symbol(&pair[0])) {
        let mut out = vec![sym("loop*"), vec_of(bindings)];
        out.extend_from_slice(&args[1..]);
        return Ok(list_of(out));
    }
    // Destructuring loop: evaluate inits once, recur over plain slots,
    // re-destructure inside the body
    let mut outer = Vec::new();
    let mut loop_bindings = Vec::new();
    let mut inner = Vec::new();
    for pair in bindings.chunks(2) {
        let g = gensym("loop");
        outer.push(g.clone());
        outer.push(pair[1].clone());
        loop_bindings.push(g.clone());
        loop_bindings.push(g.clone());
        destructure(&pair[0], g, &mut inner)?;
    }
    let mut inner_form = vec![sym("let*"), vec_of(inner)];
    inner_form.extend_from_slice(&args[1..]);
    let loop_form = list_of(vec![
        sym("loop*"),
        vec_of(loop_bindings),
        list_of(inner_form),
    ]);
    Ok(list_of(vec![sym("let*"), vec_of(outer), loop_form]))
}

// -- conditionals ------------------------------------------------------------

fn when(args: &[Value]) -> Result<Value, SableError> {
    check_min("when", args, 1)?;
    let mut body = vec![sym("do")];
    body.extend_from_slice(&args[1..]);
    Ok(list_of(vec![
        sym("if"),
        args[0].clone(),
        list_of(body),
        Value::Nil,
    ]))
}

fn when_not(args: &[Value]) -> Result<Value, SableError> {
    check_min("when-not", args, 1)?;
    let mut body = vec![sym("do")];
    body.extend_from_slice(&args[1..]);
    Ok(list_of(vec![
        sym("if"),
        args[0].clone(),
        Value::Nil,
        list_of(body),
    ]))
}

fn binding_pair(name: &str, v: &Value) -> Result<(Value, Value), SableError> {
    let items = vector_items(name, v)?;
    if items.len() != 2 {
        return Err(SableError::compile(format!(
            "{} requires a [binding test] vector",
            name
        )));
    }
    Ok((items[0].clone(), items[1].clone()))
}

fn if_let(args: &[Value]) -> Result<Value, SableError> {
    check_range("if-let", args, 2, 3)?;
    let (pattern, test) = binding_pair("if-let", &args[0])?;
    let temp = gensym("test");
    let mut then_bindings = Vec::new();
    destructure(&pattern, temp.clone(), &mut then_bindings)?;
    let then = list_of(vec![
        sym("let*"),
        vec_of(then_bindings),
        args[1].clone(),
    ]);
    Ok(list_of(vec![
        sym("let*"),
        vec_of(vec![temp.clone(), test]),
        list_of(vec![
            sym("if"),
            temp,
            then,
            args.get(2).cloned().unwrap_or(Value::Nil),
        ]),
    ]))
}

fn when_let(args: &[Value]) -> Result<Value, SableError> {
    check_min("when-let", args, 1)?;
    let mut body = vec![sym("do")];
    body.extend_from_slice(&args[1..]);
    if_let(&[args[0].clone(), list_of(body)])
}

fn if_not(args: &[Value]) -> Result<Value, SableError> {
    check_range("if-not", args, 2, 3)?;
    Ok(list_of(vec![
        sym("if"),
        args[0].clone(),
        args.get(2).cloned().unwrap_or(Value::Nil),
        args[1].clone(),
    ]))
}

fn if_some(args: &[Value]) -> Result<Value, SableError> {
    check_range("if-some", args, 2, 3)?;
    let (pattern, test) = binding_pair("if-some", &args[0])?;
    let temp = gensym("some");
    let mut then_bindings = Vec::new();
    destructure(&pattern, temp.clone(), &mut then_bindings)?;
    let then = list_of(vec![sym("let*"), vec_of(then_bindings), args[1].clone()]);
    Ok(list_of(vec![
        sym("let*"),
        vec_of(vec![temp.clone(), test]),
        list_of(vec![
            sym("if"),
            list_of(vec![sym("sable.core/nil?"), temp]),
            args.get(2).cloned().unwrap_or(Value::Nil),
            then,
        ]),
    ]))
}

fn when_some(args: &[Value]) -> Result<Value, SableError> {
    check_min("when-some", args, 1)?;
    let mut body = vec![sym("do")];
    body.extend_from_slice(&args[1..]);
    if_some(&[args[0].clone(), list_of(body)])
}

fn cond(args: &[Value]) -> Result<Value, SableError> {
    if args.is_empty() {
        return Ok(Value::Nil);
    }
    if args.len() % 2 != 0 {
        return Err(SableError::compile("cond requires an even number of forms"));
    }
    let rest = cond(&args[2..])?;
    Ok(list_of(vec![
        sym("if"),
        args[0].clone(),
        args[1].clone(),
        rest,
    ]))
}

fn condp(args: &[Value]) -> Result<Value, SableError> {
    check_min("condp", args, 2)?;
    let pred = gensym("pred");
    let expr = gensym("expr");
    let clauses = &args[2..];

    fn build(pred: &Value, expr: &Value, clauses: &[Value]) -> Result<Value, SableError> {
        match clauses.len() {
            0 => Ok(list_of(vec![
                sym("throw"),
                list_of(vec![
                    sym("sable.core/ex-info"),
                    Value::string("no matching clause in condp"),
                    list_of(vec![sym("sable.core/hash-map")]),
                ]),
            ])),
            1 => Ok(clauses[0].clone()),
            _ => {
                let rest = build(pred, expr, &clauses[2..])?;
                Ok(list_of(vec![
                    sym("if"),
                    list_of(vec![pred.clone(), clauses[0].clone(), expr.clone()]),
                    clauses[1].clone(),
                    rest,
                ]))
            }
        }
    }

    let body = build(&pred, &expr, clauses)?;
    Ok(list_of(vec![
        sym("let*"),
        vec_of(vec![pred, args[0].clone(), expr, args[1].clone()]),
        body,
    ]))
}

// (case e t1 r1 (t2a t2b) r2 ... default?) → (case* e [[ts r]...] default?)
fn case_macro(args: &[Value]) -> Result<Value, SableError> {
    check_min("case", args, 1)?;
    let expr = args[0].clone();
    let rest = &args[1..];
    let has_default = rest.len() % 2 == 1;
    let pair_count = rest.len() / 2;
    let mut clauses = Vec::new();
    for pair in rest[..pair_count * 2].chunks(2) {
        let tests = match &pair[0] {
            Value::List(l) => l.iter().cloned().collect(),
            single => vec![single.clone()],
        };
        clauses.push(vec_of(vec![vec_of(tests), pair[1].clone()]));
    }
    let mut out = vec![sym("case*"), expr, vec_of(clauses)];
    if has_default {
        out.push(rest[rest.len() - 1].clone());
    }
    Ok(list_of(out))
}

fn and(args: &[Value]) -> Result<Value, SableError> {
    match args.len() {
        0 => Ok(Value::Bool(true)),
        1 => Ok(args[0].clone()),
        _ => {
            let temp = gensym("and");
            let rest = {
                let mut inner = vec![sym("sable.core/and")];
                inner.extend_from_slice(&args[1..]);
                list_of(inner)
            };
            Ok(list_of(vec![
                sym("let*"),
                vec_of(vec![temp.clone(), args[0].clone()]),
                list_of(vec![sym("if"), temp.clone(), rest, temp]),
            ]))
        }
    }
}

fn or(args: &[Value]) -> Result<Value, SableError> {
    match args.len() {
        0 => Ok(Value::Nil),
        1 => Ok(args[0].clone()),
        _ => {
            let temp = gensym("or");
            let rest = {
                let mut inner = vec![sym("sable.core/or")];
                inner.extend_from_slice(&args[1..]);
                list_of(inner)
            };
            Ok(list_of(vec![
                sym("let*"),
                vec_of(vec![temp.clone(), args[0].clone()]),
                list_of(vec![sym("if"), temp.clone(), temp, rest]),
            ]))
        }
    }
}

// -- threading ---------------------------------------------------------------

fn thread_one(acc: Value, form: &Value, first: bool) -> Value {
    match form_items(form) {
        Some(mut items) if !items.is_empty() => {
            if first {
                items.insert(1, acc);
            } else {
                items.push(acc);
            }
            list_of(items)
        }
        _ => list_of(vec![form.clone(), acc]),
    }
}

fn thread_first(args: &[Value]) -> Result<Value, SableError> {
    check_min("->", args, 1)?;
    let mut acc = args[0].clone();
    for form in &args[1..] {
        acc = thread_one(acc, form, true);
    }
    Ok(acc)
}

fn thread_last(args: &[Value]) -> Result<Value, SableError> {
    check_min("->>", args, 1)?;
    let mut acc = args[0].clone();
    for form in &args[1..] {
        acc = thread_one(acc, form, false);
    }
    Ok(acc)
}

fn as_thread(args: &[Value]) -> Result<Value, SableError> {
    check_min("as->", args, 2)?;
    let name = args[1].clone();
    let mut bindings = vec![name.clone(), args[0].clone()];
    for form in &args[2..] {
        bindings.push(name.clone());
        bindings.push(form.clone());
    }
    Ok(list_of(vec![sym("let*"), vec_of(bindings), name]))
}

fn some_thread(args: &[Value], first: bool) -> Result<Value, SableError> {
    check_min("some->", args, 1)?;
    let mut acc = args[0].clone();
    for form in &args[1..] {
        let temp = gensym("some");
        let threaded = thread_one(temp.clone(), form, first);
        acc = list_of(vec![
            sym("let*"),
            vec_of(vec![temp.clone(), acc]),
            list_of(vec![
                sym("if"),
                list_of(vec![sym("sable.core/nil?"), temp]),
                Value::Nil,
                threaded,
            ]),
        ]);
    }
    Ok(acc)
}

fn some_thread_first(args: &[Value]) -> Result<Value, SableError> {
    some_thread(args, true)
}

fn some_thread_last(args: &[Value]) -> Result<Value, SableError> {
    some_thread(args, false)
}

fn cond_thread(args: &[Value]) -> Result<Value, SableError> {
    check_min("cond->", args, 1)?;
    if (args.len() - 1) % 2 != 0 {
        return Err(SableError::compile(
            "cond-> requires test/form pairs after the initial value",
        ));
    }
    let mut acc = args[0].clone();
    for pair in args[1..].chunks(2) {
        let temp = gensym("cond");
        let threaded = thread_one(temp.clone(), &pair[1], true);
        acc = list_of(vec![
            sym("let*"),
            vec_of(vec![temp.clone(), acc]),
            list_of(vec![sym("if"), pair[0].clone(), threaded, temp]),
        ]);
    }
    Ok(acc)
}

fn doto(args: &[Value]) -> Result<Value, SableError> {
    check_min("doto", args, 1)?;
    let temp = gensym("doto");
    let mut out = vec![sym("let*"), vec_of(vec![temp.clone(), args[0].clone()])];
    for form in &args[1..] {
        out.push(thread_one(temp.clone(), form, true));
    }
    out.push(temp);
    Ok(list_of(out))
}

// -- iteration ---------------------------------------------------------------

fn dotimes(args: &[Value]) -> Result<Value, SableError> {
    check_min("dotimes", args, 1)?;
    let bindings = vector_items("dotimes", &args[0])?;
    if bindings.len() != 2 {
        return Err(SableError::compile("dotimes requires [i n] bindings"));
    }
    let i = bindings[0].clone();
    let n = gensym("n");
    let mut body = vec![sym("do")];
    body.extend_from_slice(&args[1..]);
    Ok(list_of(vec![
        sym("let*"),
        vec_of(vec![n.clone(), bindings[1].clone()]),
        list_of(vec![
            sym("loop*"),
            vec_of(vec![i.clone(), Value::Int(0)]),
            list_of(vec![
                sym("if"),
                list_of(vec![sym("sable.core/<"), i.clone(), n]),
                list_of(vec![
                    sym("do"),
                    list_of(body),
                    list_of(vec![
                        sym("recur"),
                        list_of(vec![sym("sable.core/inc"), i]),
                    ]),
                ]),
                Value::Nil,
            ]),
        ]),
    ]))
}

fn doseq(args: &[Value]) -> Result<Value, SableError> {
    check_min("doseq", args, 1)?;
    let bindings = vector_items("doseq", &args[0])?;
    if bindings.len() % 2 != 0 || bindings.is_empty() {
        return Err(SableError::compile("doseq requires pattern/coll pairs"));
    }
    let mut body = vec![sym("do")];
    body.extend_from_slice(&args[1..]);
    build_doseq(&bindings, list_of(body))
}

fn build_doseq(bindings: &[Value], body: Value) -> Result<Value, SableError> {
    if bindings.is_empty() {
        return Ok(body);
    }
    let inner = build_doseq(&bindings[2..], body)?;
    let pattern = &bindings[0];
    let coll = bindings[1].clone();
    let s = gensym("seq");
    let mut let_bindings = Vec::new();
    destructure(
        pattern,
        list_of(vec![sym("sable.core/first"), s.clone()]),
        &mut let_bindings,
    )?;
    Ok(list_of(vec![
        sym("loop*"),
        vec_of(vec![s.clone(), list_of(vec![sym("sable.core/seq"), coll])]),
        list_of(vec![
            sym("if"),
            s.clone(),
            list_of(vec![
                sym("do"),
                list_of(vec![sym("let*"), vec_of(let_bindings), inner]),
                list_of(vec![
                    sym("recur"),
                    list_of(vec![sym("sable.core/next"), s]),
                ]),
            ]),
            Value::Nil,
        ]),
    ]))
}

fn while_macro(args: &[Value]) -> Result<Value, SableError> {
    check_min("while", args, 1)?;
    let mut body = vec![sym("do")];
    body.extend_from_slice(&args[1..]);
    Ok(list_of(vec![
        sym("loop*"),
        vec_of(vec![]),
        list_of(vec![
            sym("if"),
            args[0].clone(),
            list_of(vec![sym("do"), list_of(body), list_of(vec![sym("recur")])]),
            Value::Nil,
        ]),
    ]))
}

fn for_macro(args: &[Value]) -> Result<Value, SableError> {
    check_exact("for", args, 2)?;
    let bindings = vector_items("for", &args[0])?;
    build_for(&bindings, args[1].clone())
}

fn build_for(bindings: &[Value], body: Value) -> Result<Value, SableError> {
    if bindings.is_empty() {
        return Ok(list_of(vec![sym("sable.core/list"), body]));
    }
    if keyword_named(&bindings[0], "when") {
        let inner = build_for(&bindings[2..], body)?;
        return Ok(list_of(vec![
            sym("if"),
            bindings[1].clone(),
            inner,
            list_of(vec![sym("sable.core/list")]),
        ]));
    }
    if keyword_named(&bindings[0], "let") {
        let let_bindings = vector_items("for :let", &bindings[1])?;
        let lowered = destructure_bindings(&let_bindings)?;
        let inner = build_for(&bindings[2..], body)?;
        return Ok(list_of(vec![sym("let*"), vec_of(lowered), inner]));
    }
    let pattern = &bindings[0];
    let coll = bindings[1].clone();
    let inner = build_for(&bindings[2..], body)?;
    let arg = gensym("item");
    let mut let_bindings = Vec::new();
    destructure(pattern, arg.clone(), &mut let_bindings)?;
    let fn_body = list_of(vec![sym("let*"), vec_of(let_bindings), inner]);
    Ok(list_of(vec![
        sym("sable.core/mapcat"),
        list_of(vec![sym("fn*"), vec_of(vec![arg]), fn_body]),
        coll,
    ]))
}

// -- dynamic binding and misc ------------------------------------------------

// (binding [v e ...] body...) → push/try/finally/pop
fn binding(args: &[Value]) -> Result<Value, SableError> {
    check_min("binding", args, 1)?;
    let bindings = vector_items("binding", &args[0])?;
    if bindings.len() % 2 != 0 {
        return Err(SableError::compile(
            "binding requires an even number of forms",
        ));
    }
    let mut map_args = vec![sym("sable.core/hash-map")];
    for pair in bindings.chunks(2) {
        map_args.push(list_of(vec![sym("var"), pair[0].clone()]));
        map_args.push(pair[1].clone());
    }
    let mut try_form = vec![sym("try")];
    try_form.extend_from_slice(&args[1..]);
    try_form.push(list_of(vec![
        sym("finally"),
        list_of(vec![sym("sable.core/pop-thread-bindings")]),
    ]));
    Ok(list_of(vec![
        sym("do"),
        list_of(vec![
            sym("sable.core/push-thread-bindings"),
            list_of(map_args),
        ]),
        list_of(try_form),
    ]))
}

fn lazy_seq(args: &[Value]) -> Result<Value, SableError> {
    let mut body = vec![sym("do")];
    body.extend_from_slice(args);
    Ok(list_of(vec![
        sym("sable.core/-lazy-seq"),
        list_of(vec![sym("fn*"), vec_of(vec![]), list_of(body)]),
    ]))
}

fn comment(_args: &[Value]) -> Result<Value, SableError> {
    Ok(Value::Nil)
}

fn assert_macro(args: &[Value]) -> Result<Value, SableError> {
    check_range("assert", args, 1, 2)?;
    let message = match args.get(1) {
        Some(m) => m.clone(),
        None => Value::string(format!(
            "Assert failed: {}",
            sable_core::printer::pr_str(&args[0])
        )),
    };
    Ok(list_of(vec![
        sym("if"),
        args[0].clone(),
        Value::Nil,
        list_of(vec![
            sym("throw"),
            list_of(vec![
                sym("sable.core/ex-info"),
                message,
                list_of(vec![sym("sable.core/hash-map")]),
            ]),
        ]),
    ]))
}

fn declare(args: &[Value]) -> Result<Value, SableError> {
    let mut out = vec![sym("do")];
    for name in args {
        out.push(list_of(vec![sym("def"), name.clone()]));
    }
    Ok(list_of(out))
}

fn defonce(args: &[Value]) -> Result<Value, SableError> {
    check_exact("defonce", args, 2)?;
    Ok(list_of(vec![
        sym("do"),
        list_of(vec![sym("def"), args[0].clone()]),
        list_of(vec![
            sym("if"),
            list_of(vec![
                sym("sable.core/bound?"),
                list_of(vec![sym("var"), args[0].clone()]),
            ]),
            Value::Nil,
            list_of(vec![sym("def"), args[0].clone(), args[1].clone()]),
        ]),
    ]))
}

// Sequential visibility only: each fn sees the ones bound before it and
// itself (through its self-name)
fn letfn(args: &[Value]) -> Result<Value, SableError> {
    check_min("letfn", args, 1)?;
    let specs = vector_items("letfn", &args[0])?;
    let mut bindings = Vec::new();
    for spec in &specs {
        let items = form_items(spec)
            .ok_or_else(|| SableError::compile("letfn spec must be a (name [params] body) list"))?;
        if items.is_empty() || !is_simple_symbol(&items[0]) {
            return Err(SableError::compile("letfn spec must start with a name"));
        }
        bindings.push(items[0].clone());
        bindings.push(fn_macro(&items)?);
    }
    let mut out = vec![sym("let*"), vec_of(bindings)];
    out.extend_from_slice(&args[1..]);
    Ok(list_of(out))
}

// (ns my.app (:require [some.ns :as x :refer [a b]]) ...)
fn ns_macro(args: &[Value]) -> Result<Value, SableError> {
    check_min("ns", args, 1)?;
    if !is_simple_symbol(&args[0]) {
        return Err(SableError::compile("ns requires a symbol name"));
    }
    let mut out = vec![
        sym("do"),
        list_of(vec![sym("sable.core/in-ns"), quoted(args[0].clone())]),
    ];
    for clause in &args[1..] {
        // A docstring is allowed and ignored
        if matches!(clause, Value::Str(_)) {
            continue;
        }
        let items = form_items(clause)
            .ok_or_else(|| SableError::compile("ns clause must be a list"))?;
        match items.first() {
            Some(k) if keyword_named(k, "require") => {
                for spec in &items[1..] {
                    out.push(list_of(vec![
                        sym("sable.core/require"),
                        quoted(spec.clone()),
                    ]));
                }
            }
            Some(k) if keyword_named(k, "use") => {
                for spec in &items[1..] {
                    out.push(list_of(vec![
                        sym("sable.core/require"),
                        quoted(spec.clone()),
                    ]));
                    out.push(list_of(vec![sym("sable.core/refer"), quoted(spec.clone())]));
                }
            }
            _ => {
                return Err(SableError::compile(
                    "unsupported ns clause (only :require and :use)",
                ));
            }
        }
    }
    Ok(list_of(out))
}

fn time_macro(args: &[Value]) -> Result<Value, SableError> {
    check_exact("time", args, 1)?;
    let start = gensym("start");
    let ret = gensym("ret");
    Ok(list_of(vec![
        sym("let*"),
        vec_of(vec![
            start.clone(),
            list_of(vec![sym("sable.core/nano-time")]),
            ret.clone(),
            args[0].clone(),
        ]),
        list_of(vec![
            sym("sable.core/println"),
            list_of(vec![
                sym("sable.core/str"),
                Value::string("Elapsed time: "),
                list_of(vec![
                    sym("sable.core//"),
                    list_of(vec![
                        sym("sable.core/-"),
                        list_of(vec![sym("sable.core/nano-time")]),
                        start,
                    ]),
                    Value::Float(1.0e6),
                ]),
                Value::string(" msecs"),
            ]),
        ]),
        ret,
    ]))
}

fn dosync(args: &[Value]) -> Result<Value, SableError> {
    let mut body = vec![sym("do")];
    body.extend_from_slice(args);
    Ok(list_of(vec![
        sym("sable.core/-run-in-transaction"),
        list_of(vec![sym("fn*"), vec_of(vec![]), list_of(body)]),
    ]))
}

// -- protocols, types, multimethods ------------------------------------------

fn defprotocol(args: &[Value]) -> Result<Value, SableError> {
    check_min("defprotocol", args, 1)?;
    let name = args[0].clone();
    if !is_simple_symbol(&name) {
        return Err(SableError::compile("defprotocol requires a symbol name"));
    }
    let mut extend_via_metadata = false;
    let mut sigs = Vec::new();
    let mut i = 1;
    while i < args.len() {
        if keyword_named(&args[i], "extend-via-metadata") {
            extend_via_metadata = args
                .get(i + 1)
                .map(|v| v.is_truthy())
                .unwrap_or(false);
            i += 2;
            continue;
        }
        if matches!(args[i], Value::Str(_)) {
            i += 1;
            continue;
        }
        sigs.push(args[i].clone());
        i += 1;
    }

    let name_str = match &name {
        Value::Symbol(s) => s.name_str().to_string(),
        _ => unreachable!(),
    };
    let opts = list_of(vec![
        sym("sable.core/hash-map"),
        Value::keyword("extend-via-metadata"),
        Value::Bool(extend_via_metadata),
    ]);
    let mut out = vec![
        sym("do"),
        list_of(vec![
            sym("def"),
            name.clone(),
            list_of(vec![
                sym("sable.core/-make-protocol"),
                Value::string(&name_str),
                quoted(list_of(sigs.clone())),
                opts,
            ]),
        ]),
    ];
    for sig in &sigs {
        let items = form_items(sig)
            .ok_or_else(|| SableError::compile("protocol signature must be a list"))?;
        let method = items
            .first()
            .cloned()
            .ok_or_else(|| SableError::compile("protocol signature must name a method"))?;
        let method_str = match &method {
            Value::Symbol(s) => s.name_str().to_string(),
            _ => return Err(SableError::compile("protocol method must be a symbol")),
        };
        out.push(list_of(vec![
            sym("def"),
            method,
            list_of(vec![
                sym("sable.core/-protocol-fn"),
                name.clone(),
                Value::string(&method_str),
            ]),
        ]));
    }
    out.push(name);
    Ok(list_of(out))
}

/// Split a run of `Proto (method ...)+ Proto2 (method ...)+` into groups
fn group_impls(forms: &[Value]) -> Result<Vec<(Value, Vec<Value>)>, SableError> {
    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
    for form in forms {
        match form {
            Value::Symbol(_) => groups.push((form.clone(), Vec::new())),
            Value::List(_) => match groups.last_mut() {
                Some((_, methods)) => methods.push(form.clone()),
                None => {
                    return Err(SableError::compile(
                        "method implementation before protocol name",
                    ));
                }
            },
            other => {
                return Err(SableError::compile(format!(
                    "unexpected {} in protocol implementation",
                    other.type_name()
                )));
            }
        }
    }
    Ok(groups)
}

fn method_map_form(methods: &[Value]) -> Result<Value, SableError> {
    let mut out = vec![sym("sable.core/hash-map")];
    for method in methods {
        let items = form_items(method)
            .ok_or_else(|| SableError::compile("method implementation must be a list"))?;
        if items.len() < 2 {
            return Err(SableError::compile(
                "method implementation requires a name and parameter vector",
            ));
        }
        let name = match &items[0] {
            Value::Symbol(s) => s.name_str().to_string(),
            other => {
                return Err(SableError::compile(format!(
                    "method name must be a symbol, got {}",
                    other.type_name()
                )));
            }
        };
        let mut fn_args = vec![items[1].clone()];
        fn_args.extend_from_slice(&items[2..]);
        out.push(Value::string(&name));
        out.push(fn_macro(&fn_args)?);
    }
    Ok(list_of(out))
}

fn extend_type(args: &[Value]) -> Result<Value, SableError> {
    check_min("extend-type", args, 2)?;
    let key = match &args[0] {
        Value::Symbol(s) => Value::string(s.name_str()),
        Value::Str(s) => Value::Str(s.clone()),
        other => {
            return Err(SableError::compile(format!(
                "extend-type key must be a symbol, got {}",
                other.type_name()
            )));
        }
    };
    let mut out = vec![sym("do")];
    for (proto, methods) in group_impls(&args[1..])? {
        out.push(list_of(vec![
            sym("sable.core/-extend!"),
            proto,
            key.clone(),
            method_map_form(&methods)?,
        ]));
    }
    Ok(list_of(out))
}

fn extend_protocol(args: &[Value]) -> Result<Value, SableError> {
    check_min("extend-protocol", args, 2)?;
    let proto = args[0].clone();
    let mut out = vec![sym("do")];
    for (key, methods) in group_impls(&args[1..])? {
        let key = match &key {
            Value::Symbol(s) => Value::string(s.name_str()),
            other => other.clone(),
        };
        out.push(list_of(vec![
            sym("sable.core/-extend!"),
            proto.clone(),
            key,
            method_map_form(&methods)?,
        ]));
    }
    Ok(list_of(out))
}

fn reify(args: &[Value]) -> Result<Value, SableError> {
    check_min("reify", args, 1)?;
    let type_key = format!("reify__{}", sable_compiler::next_gensym_id());
    let mut out = vec![sym("do")];
    for (proto, methods) in group_impls(args)? {
        out.push(list_of(vec![
            sym("sable.core/-extend!"),
            proto,
            Value::string(&type_key),
            method_map_form(&methods)?,
        ]));
    }
    out.push(list_of(vec![
        sym("sable.core/hash-map"),
        Value::keyword("__reify_type"),
        Value::string(&type_key),
    ]));
    Ok(list_of(out))
}

fn deftype(args: &[Value]) -> Result<Value, SableError> {
    check_min("deftype", args, 2)?;
    let name = match &args[0] {
        Value::Symbol(s) => s.name_str().to_string(),
        other => {
            return Err(SableError::compile(format!(
                "deftype requires a symbol name, got {}",
                other.type_name()
            )));
        }
    };
    let fields = vector_items("deftype", &args[1])?;
    let mut out = vec![sym("do")];
    for (proto, methods) in group_impls(&args[2..])? {
        out.push(list_of(vec![
            sym("sable.core/-extend!"),
            proto,
            Value::string(&name),
            method_map_form(&methods)?,
        ]));
    }
    // Constructor: (->Name f1 f2) builds the tagged map
    let mut ctor_body = vec![
        sym("sable.core/hash-map"),
        Value::keyword("__reify_type"),
        Value::string(&name),
    ];
    for field in &fields {
        let field_name = match field {
            Value::Symbol(s) => s.name_str().to_string(),
            other => {
                return Err(SableError::compile(format!(
                    "deftype field must be a symbol, got {}",
                    other.type_name()
                )));
            }
        };
        ctor_body.push(Value::keyword(&field_name));
        ctor_body.push(field.clone());
    }
    out.push(list_of(vec![
        sym("def"),
        sym(&format!("->{}", name)),
        list_of(vec![
            sym("fn*"),
            vec_of(fields),
            list_of(ctor_body),
        ]),
    ]));
    out.push(quoted(sym(&name)));
    Ok(list_of(out))
}

fn defmulti(args: &[Value]) -> Result<Value, SableError> {
    check_range("defmulti", args, 2, 2)?;
    let name = match &args[0] {
        Value::Symbol(s) => s.name_str().to_string(),
        other => {
            return Err(SableError::compile(format!(
                "defmulti requires a symbol name, got {}",
                other.type_name()
            )));
        }
    };
    Ok(list_of(vec![
        sym("def"),
        args[0].clone(),
        list_of(vec![
            sym("sable.core/-make-multi"),
            Value::string(&name),
            args[1].clone(),
            Value::keyword("default"),
        ]),
    ]))
}

fn defmethod(args: &[Value]) -> Result<Value, SableError> {
    check_min("defmethod", args, 3)?;
    let mut fn_args = vec![args[2].clone()];
    fn_args.extend_from_slice(&args[3..]);
    Ok(list_of(vec![
        sym("sable.core/-add-method!"),
        args[0].clone(),
        args[1].clone(),
        fn_macro(&fn_args)?,
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_core::map::ArrayMap;
    use sable_core::printer::pr_str;

    #[test]
    fn test_when_expands_to_if() {
        let out = when(&[sym("t"), Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(pr_str(&out), "(if t (do 1 2) nil)");
    }

    #[test]
    fn test_thread_first_and_last() {
        let first = thread_first(&[
            sym("x"),
            list_of(vec![sym("f"), sym("a")]),
            sym("g"),
        ])
        .unwrap();
        assert_eq!(pr_str(&first), "(g (f x a))");
        let last = thread_last(&[sym("x"), list_of(vec![sym("f"), sym("a")])]).unwrap();
        assert_eq!(pr_str(&last), "(f a x)");
    }

    #[test]
    fn test_sequential_destructuring() {
        let mut out = Vec::new();
        let pattern = vec_of(vec![sym("a"), sym("b")]);
        destructure(&pattern, sym("coll"), &mut out).unwrap();
        // temp binding plus two element bindings
        assert_eq!(out.len(), 6);
        let text = pr_str(&vec_of(out));
        assert!(text.contains("sable.core/nth"), "got {}", text);
    }

    #[test]
    fn test_associative_destructuring_keys_and_or() {
        let mut out = Vec::new();
        let pattern = Value::ArrayMap(Arc::new(ArrayMap::from_pairs(vec![
            (
                Value::keyword("keys"),
                vec_of(vec![sym("a"), sym("b")]),
            ),
            (
                Value::keyword("or"),
                Value::ArrayMap(Arc::new(ArrayMap::from_pairs(vec![(
                    sym("b"),
                    Value::Int(9),
                )]))),
            ),
        ])));
        destructure(&pattern, sym("m"), &mut out).unwrap();
        let text = pr_str(&vec_of(out));
        assert!(text.contains(":a"), "got {}", text);
        assert!(text.contains('9'), "got {}", text);
    }

    #[test]
    fn test_defn_builds_def_of_fn() {
        let out = defn(&[
            sym("add1"),
            vec_of(vec![sym("x")]),
            list_of(vec![sym("inc"), sym("x")]),
        ])
        .unwrap();
        let text = pr_str(&out);
        assert!(text.starts_with("(def add1 (fn* add1"), "got {}", text);
    }

    #[test]
    fn test_case_macro_normalizes_clauses() {
        let out = case_macro(&[
            sym("x"),
            Value::Int(1),
            Value::keyword("one"),
            list_of(vec![Value::Int(2), Value::Int(3)]),
            Value::keyword("few"),
            Value::keyword("other"),
        ])
        .unwrap();
        let text = pr_str(&out);
        assert!(text.starts_with("(case* x ["), "got {}", text);
        assert!(text.ends_with(":other)"), "got {}", text);
    }

    #[test]
    fn test_and_or_short_circuit_shapes() {
        assert_eq!(pr_str(&and(&[]).unwrap()), "true");
        assert_eq!(pr_str(&or(&[]).unwrap()), "nil");
        let two = and(&[sym("a"), sym("b")]).unwrap();
        assert!(pr_str(&two).contains("if"), "got {}", pr_str(&two));
    }
}
