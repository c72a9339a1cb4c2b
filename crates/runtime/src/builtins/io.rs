//! I/O, printing, evaluation, metadata, and namespace surface builtins

use super::{b, check_exact, check_min, check_range, str_arg};
use crate::call::call_value;
use crate::registry::BuiltinDef;
use sable_core::error::SableError;
use sable_core::gc;
use sable_core::list::PersistentList;
use sable_core::printer::{display_str, pr_str};
use sable_core::value::Value;
use std::io::Write;
use std::sync::Arc;

pub fn builtins() -> Vec<BuiltinDef> {
    vec![
        b!("pr", pr, "([& xs])", "Prints readable forms to stdout."),
        b!("prn", prn, "([& xs])", "Prints readable forms followed by a newline."),
        b!("print", print, "([& xs])", "Prints display forms to stdout."),
        b!("println", println_fn, "([& xs])", "Prints display forms followed by a newline."),
        b!("pr-str", pr_str_fn, "([& xs])", "The readable forms as a string."),
        b!("print-str", print_str_fn, "([& xs])", "The display forms as a string."),
        b!("newline", newline, "([])", "Writes a newline to stdout."),
        b!("flush", flush, "([])", "Flushes stdout."),
        b!("slurp", slurp, "([path])", "Reads a file into a string."),
        b!("spit", spit, "([path content])", "Writes the display form of content to a file."),
        b!("read-line", read_line, "([])", "Reads a line from stdin, or nil at EOF."),
        b!("eval", eval, "([form])", "Evaluates a form and returns its value."),
        b!("read-string", read_string, "([s])", "Reads one form from a string."),
        b!("load-string", load_string, "([s])", "Reads and evaluates every form in a string."),
        b!("load-file", load_file, "([path])", "Reads and evaluates a file."),
        b!("macroexpand-1", macroexpand_1, "([form])", "Expands a macro call form once."),
        b!("type", type_fn, "([x])", "The type keyword of x."),
        b!("hash", hash_fn, "([x])", "The structural hash of x."),
        b!("identical?", identical_p, "([x y])", "True if x and y are the same object."),
        b!("instance?", instance_p, "([class-key x])", "True if x's type key names class-key."),
        b!("meta", meta, "([x])", "The metadata of x, or nil."),
        b!("with-meta", with_meta, "([x m])", "x with m as its metadata."),
        b!("vary-meta", vary_meta, "([x f & args])", "x with (apply f (meta x) args) as metadata."),
        b!("alter-meta!", alter_meta_bang, "([ref f & args])", "Mutates the metadata of a var, atom, or ref."),
        b!("ex-info", ex_info, "([msg map] [msg map cause])", "An exception value carrying a data map."),
        b!("ex-data", ex_data_fn, "([ex])", "The data map of an exception value."),
        b!("ex-message", ex_message_fn, "([ex])", "The message of an exception value."),
        b!("throw-value", throw_value_fn, "([x])", "Throws x as an exception."),
        b!("system-time", system_time, "([])", "Milliseconds since the epoch."),
        b!("nano-time", nano_time, "([])", "A monotonic nanosecond counter."),
        b!("sleep", sleep, "([ms])", "Blocks the current thread for ms milliseconds."),
        b!("in-ns", in_ns, "([ns-sym])", "Switches the current namespace, creating it if needed."),
        b!("create-ns", create_ns, "([ns-sym])", "Creates a namespace."),
        b!("find-ns", find_ns, "([ns-sym])", "The namespace name symbol if it exists, else nil."),
        b!("all-ns", all_ns, "([])", "A seq of all namespace name symbols."),
        b!("ns-name", ns_name, "([ns-sym])", "The name symbol of a namespace."),
        b!("require", require, "([& specs])", "Loads namespaces; specs may carry :as and :refer."),
        b!("refer", refer, "([ns-sym & syms])", "Refers vars from another namespace."),
        b!("alias", alias, "([short ns-sym])", "Adds a namespace alias in the current namespace."),
        b!("resolve", resolve, "([sym])", "The var a symbol resolves to, or nil."),
        b!("intern", intern, "([ns-sym name-sym] [ns-sym name-sym val])", "Interns a var, optionally binding it."),
        b!("bound?", bound_p, "([var])", "True if the var has a root or thread binding."),
        b!("-mark-macro!", mark_macro, "([var])", "Flags a var as a macro."),
        b!("add-tag-reader!", add_tag_reader, "([tag-sym f])", "Installs a tagged-literal constructor."),
        b!("push-thread-bindings", push_thread_bindings, "([binding-map])", "Pushes a frame of var bindings on this thread."),
        b!("pop-thread-bindings", pop_thread_bindings, "([])", "Pops the innermost binding frame."),
        b!("gc", run_gc, "([])", "Requests a garbage collection at the next safe point."),
        b!("gc-stats", gc_stats, "([])", "Collector statistics map."),
    ]
}

fn join_str(args: &[Value], readable: bool) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&if readable {
            pr_str(arg)
        } else {
            display_str(arg)
        });
    }
    out
}

fn pr(args: &[Value]) -> Result<Value, SableError> {
    print!("{}", join_str(args, true));
    Ok(Value::Nil)
}

fn prn(args: &[Value]) -> Result<Value, SableError> {
    println!("{}", join_str(args, true));
    Ok(Value::Nil)
}

fn print(args: &[Value]) -> Result<Value, SableError> {
    print!("{}", join_str(args, false));
    Ok(Value::Nil)
}

fn println_fn(args: &[Value]) -> Result<Value, SableError> {
    println!("{}", join_str(args, false));
    Ok(Value::Nil)
}

fn pr_str_fn(args: &[Value]) -> Result<Value, SableError> {
    Ok(Value::string(join_str(args, true)))
}

fn print_str_fn(args: &[Value]) -> Result<Value, SableError> {
    Ok(Value::string(join_str(args, false)))
}

fn newline(_args: &[Value]) -> Result<Value, SableError> {
    println!();
    Ok(Value::Nil)
}

fn flush(_args: &[Value]) -> Result<Value, SableError> {
    std::io::stdout().flush()?;
    Ok(Value::Nil)
}

fn slurp(args: &[Value]) -> Result<Value, SableError> {
    check_exact("slurp", args, 1)?;
    let path = str_arg("slurp", args, 0)?;
    Ok(Value::string(std::fs::read_to_string(path)?))
}

fn spit(args: &[Value]) -> Result<Value, SableError> {
    check_exact("spit", args, 2)?;
    let path = str_arg("spit", args, 0)?;
    std::fs::write(path, display_str(&args[1]))?;
    Ok(Value::Nil)
}

fn read_line(args: &[Value]) -> Result<Value, SableError> {
    check_exact("read-line", args, 0)?;
    let mut line = String::new();
    let n = std::io::stdin().read_line(&mut line)?;
    if n == 0 {
        return Ok(Value::Nil);
    }
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(Value::string(line))
}

fn eval(args: &[Value]) -> Result<Value, SableError> {
    check_exact("eval", args, 1)?;
    crate::runtime::eval_form(&args[0])
}

fn read_string(args: &[Value]) -> Result<Value, SableError> {
    check_exact("read-string", args, 1)?;
    let src = str_arg("read-string", args, 0)?;
    let host = crate::runtime::host();
    match sable_compiler::read_one(src, &host)? {
        Some(form) => Ok(form),
        None => Err(SableError::reader(
            "EOF while reading",
            sable_core::error::SourcePos::default(),
        )),
    }
}

fn load_string(args: &[Value]) -> Result<Value, SableError> {
    check_exact("load-string", args, 1)?;
    crate::runtime::eval_str(str_arg("load-string", args, 0)?)
}

fn load_file(args: &[Value]) -> Result<Value, SableError> {
    check_exact("load-file", args, 1)?;
    let path = str_arg("load-file", args, 0)?;
    let src = std::fs::read_to_string(path)?;
    crate::runtime::eval_str(&src)
}

fn macroexpand_1(args: &[Value]) -> Result<Value, SableError> {
    check_exact("macroexpand-1", args, 1)?;
    crate::runtime::macroexpand_1(&args[0])
}

fn type_fn(args: &[Value]) -> Result<Value, SableError> {
    check_exact("type", args, 1)?;
    Ok(Value::keyword(args[0].type_name()))
}

fn hash_fn(args: &[Value]) -> Result<Value, SableError> {
    check_exact("hash", args, 1)?;
    Ok(Value::Int(sable_core::value_hash(&args[0]) as i64))
}

fn identical_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("identical?", args, 2)?;
    Ok(Value::Bool(args[0].identical(&args[1])))
}

fn instance_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("instance?", args, 2)?;
    let class = match &args[0] {
        Value::Str(s) => s.to_string(),
        Value::Symbol(s) => s.name_str().to_string(),
        Value::Keyword(k) => k.name_str().to_string(),
        other => {
            return Err(SableError::type_err(format!(
                "instance? expects a class name, got {}",
                other.type_name()
            )));
        }
    };
    Ok(Value::Bool(crate::call::type_key(&args[1]) == class))
}

fn meta(args: &[Value]) -> Result<Value, SableError> {
    check_exact("meta", args, 1)?;
    Ok(args[0].meta().unwrap_or(Value::Nil))
}

fn with_meta(args: &[Value]) -> Result<Value, SableError> {
    check_exact("with-meta", args, 2)?;
    let meta = match &args[1] {
        Value::Nil => None,
        other => Some(other.clone()),
    };
    args[0].with_meta(meta)
}

fn vary_meta(args: &[Value]) -> Result<Value, SableError> {
    check_min("vary-meta", args, 2)?;
    let current = args[0].meta().unwrap_or(Value::Nil);
    let mut call_args = vec![current];
    call_args.extend_from_slice(&args[2..]);
    let updated = call_value(&args[1], &call_args)?;
    args[0].with_meta(Some(updated))
}

fn alter_meta_bang(args: &[Value]) -> Result<Value, SableError> {
    check_min("alter-meta!", args, 2)?;
    let current = args[0].meta().unwrap_or(Value::Nil);
    let mut call_args = vec![current];
    call_args.extend_from_slice(&args[2..]);
    let updated = call_value(&args[1], &call_args)?;
    match &args[0] {
        Value::Var(v) => v.set_meta(Some(updated.clone())),
        Value::Atom(a) => a.set_meta(Some(updated.clone())),
        Value::Ref(r) => r.set_meta(Some(updated.clone())),
        Value::Fn(f) => f.set_meta(Some(updated.clone())),
        other => {
            return Err(SableError::type_err(format!(
                "alter-meta! not supported on {}",
                other.type_name()
            )));
        }
    }
    Ok(updated)
}

fn ex_info(args: &[Value]) -> Result<Value, SableError> {
    check_range("ex-info", args, 2, 3)?;
    Ok(crate::errors::make_ex_info(
        args[0].clone(),
        args[1].clone(),
        args.get(2).cloned(),
    ))
}

fn ex_data_fn(args: &[Value]) -> Result<Value, SableError> {
    check_exact("ex-data", args, 1)?;
    Ok(crate::errors::ex_data(&args[0]))
}

fn ex_message_fn(args: &[Value]) -> Result<Value, SableError> {
    check_exact("ex-message", args, 1)?;
    Ok(crate::errors::ex_message(&args[0]))
}

fn throw_value_fn(args: &[Value]) -> Result<Value, SableError> {
    check_exact("throw-value", args, 1)?;
    Err(crate::errors::throw_value(args[0].clone()))
}

fn system_time(_args: &[Value]) -> Result<Value, SableError> {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(Value::Int(millis))
}

fn nano_time(_args: &[Value]) -> Result<Value, SableError> {
    use std::sync::OnceLock;
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    Ok(Value::Int(start.elapsed().as_nanos() as i64))
}

fn sleep(args: &[Value]) -> Result<Value, SableError> {
    check_exact("sleep", args, 1)?;
    let ms = super::int_arg("sleep", args, 0)?;
    if ms > 0 {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }
    Ok(Value::Nil)
}

fn ns_sym_arg(name: &str, args: &[Value], idx: usize) -> Result<String, SableError> {
    match args.get(idx) {
        Some(Value::Symbol(s)) => Ok(s.name_str().to_string()),
        Some(Value::Str(s)) => Ok(s.to_string()),
        Some(other) => Err(SableError::type_err(format!(
            "{} expects a namespace symbol, got {}",
            name,
            other.type_name()
        ))),
        None => Err(SableError::arity(name, args.len())),
    }
}

fn in_ns(args: &[Value]) -> Result<Value, SableError> {
    check_exact("in-ns", args, 1)?;
    let name = ns_sym_arg("in-ns", args, 0)?;
    crate::env::global().set_current_ns(&name);
    Ok(Value::symbol(&name))
}

fn create_ns(args: &[Value]) -> Result<Value, SableError> {
    check_exact("create-ns", args, 1)?;
    let name = ns_sym_arg("create-ns", args, 0)?;
    crate::env::global().find_or_create_ns(&name);
    Ok(Value::symbol(&name))
}

fn find_ns(args: &[Value]) -> Result<Value, SableError> {
    check_exact("find-ns", args, 1)?;
    let name = ns_sym_arg("find-ns", args, 0)?;
    Ok(match crate::env::global().find_ns(&name) {
        Some(_) => Value::symbol(&name),
        None => Value::Nil,
    })
}

fn all_ns(args: &[Value]) -> Result<Value, SableError> {
    check_exact("all-ns", args, 0)?;
    let names: Vec<Value> = crate::env::global()
        .all_ns()
        .into_iter()
        .map(|ns| Value::symbol(&ns.name))
        .collect();
    Ok(gc::alloc(Value::List(Arc::new(PersistentList::from_values(
        names,
    )))))
}

fn ns_name(args: &[Value]) -> Result<Value, SableError> {
    check_exact("ns-name", args, 1)?;
    let name = ns_sym_arg("ns-name", args, 0)?;
    Ok(Value::symbol(&name))
}

fn require(args: &[Value]) -> Result<Value, SableError> {
    check_min("require", args, 1)?;
    for spec in args {
        crate::runtime::require_spec(spec)?;
    }
    Ok(Value::Nil)
}

fn refer(args: &[Value]) -> Result<Value, SableError> {
    check_min("refer", args, 1)?;
    let from = ns_sym_arg("refer", args, 0)?;
    crate::runtime::ensure_loaded(&from)?;
    let env = crate::env::global();
    let source = env
        .find_ns(&from)
        .ok_or_else(|| SableError::value_err(format!("no namespace: {}", from)))?;
    let target = env.current_ns();
    let names: Vec<String> = if args.len() == 1 {
        source.var_names()
    } else {
        args[1..]
            .iter()
            .map(|s| ns_sym_arg("refer", &[s.clone()], 0))
            .collect::<Result<_, _>>()?
    };
    for name in names {
        if let Some(var) = source.lookup(&name) {
            target.refer(&name, var);
        }
    }
    Ok(Value::Nil)
}

fn alias(args: &[Value]) -> Result<Value, SableError> {
    check_exact("alias", args, 2)?;
    let short = ns_sym_arg("alias", args, 0)?;
    let full = ns_sym_arg("alias", args, 1)?;
    crate::env::global().current_ns().add_alias(&short, &full);
    Ok(Value::Nil)
}

fn resolve(args: &[Value]) -> Result<Value, SableError> {
    check_exact("resolve", args, 1)?;
    match &args[0] {
        Value::Symbol(s) => Ok(crate::env::global().resolve(s).unwrap_or(Value::Nil)),
        other => Err(SableError::type_err(format!(
            "resolve expects a symbol, got {}",
            other.type_name()
        ))),
    }
}

fn intern(args: &[Value]) -> Result<Value, SableError> {
    check_range("intern", args, 2, 3)?;
    let ns_name = ns_sym_arg("intern", args, 0)?;
    let var_name = ns_sym_arg("intern", args, 1)?;
    let ns = crate::env::global()
        .find_ns(&ns_name)
        .ok_or_else(|| SableError::value_err(format!("no namespace: {}", ns_name)))?;
    let var = ns.intern(&var_name);
    if let (Some(value), Value::Var(v)) = (args.get(2), &var) {
        v.bind_root(value.clone());
    }
    Ok(var)
}

fn bound_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("bound?", args, 1)?;
    match &args[0] {
        Value::Var(v) => Ok(Value::Bool(v.is_bound())),
        other => Err(SableError::type_err(format!(
            "bound? expects a var, got {}",
            other.type_name()
        ))),
    }
}

fn mark_macro(args: &[Value]) -> Result<Value, SableError> {
    check_exact("-mark-macro!", args, 1)?;
    match &args[0] {
        Value::Var(v) => {
            v.set_macro(true);
            Ok(args[0].clone())
        }
        other => Err(SableError::type_err(format!(
            "-mark-macro! expects a var, got {}",
            other.type_name()
        ))),
    }
}

fn add_tag_reader(args: &[Value]) -> Result<Value, SableError> {
    check_exact("add-tag-reader!", args, 2)?;
    let tag = match &args[0] {
        Value::Symbol(s) => s.name_str().to_string(),
        Value::Str(s) => s.to_string(),
        other => {
            return Err(SableError::type_err(format!(
                "add-tag-reader! expects a tag symbol, got {}",
                other.type_name()
            )));
        }
    };
    crate::env::global().install_tag_reader(&tag, args[1].clone());
    Ok(Value::Nil)
}

fn push_thread_bindings(args: &[Value]) -> Result<Value, SableError> {
    check_exact("push-thread-bindings", args, 1)?;
    let mut frame = sable_core::refs::bindings::Frame::new();
    for item in sable_core::seqs::iter(&args[0]) {
        let entry = item?;
        let kv = match &entry {
            Value::Vector(kv) if kv.len() == 2 => kv.clone(),
            _ => {
                return Err(SableError::type_err(
                    "push-thread-bindings expects a map of vars to values",
                ));
            }
        };
        match kv.get(0) {
            Some(Value::Var(var)) => {
                if !var.is_dynamic() {
                    return Err(SableError::value_err(format!(
                        "can't dynamically bind non-dynamic var #'{}",
                        var.qualified_name()
                    )));
                }
                frame.insert(var.id, kv.get(1).cloned().unwrap_or(Value::Nil));
            }
            _ => {
                return Err(SableError::type_err(
                    "push-thread-bindings keys must be vars",
                ));
            }
        }
    }
    sable_core::refs::bindings::push(frame);
    Ok(Value::Nil)
}

fn pop_thread_bindings(args: &[Value]) -> Result<Value, SableError> {
    check_exact("pop-thread-bindings", args, 0)?;
    sable_core::refs::bindings::pop()?;
    Ok(Value::Nil)
}

fn run_gc(args: &[Value]) -> Result<Value, SableError> {
    check_exact("gc", args, 0)?;
    gc::heap().request();
    Ok(Value::Nil)
}

fn gc_stats(args: &[Value]) -> Result<Value, SableError> {
    check_exact("gc-stats", args, 0)?;
    Ok(super::coll::map_from_pairs(vec![
        (
            Value::keyword("tracked"),
            Value::Int(gc::heap().tracked_count() as i64),
        ),
        (
            Value::keyword("collections"),
            Value::Int(gc::heap().collections() as i64),
        ),
    ]))
}
