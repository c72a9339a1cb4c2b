//! Runtime facade: bootstrap, the eval pipeline, and the host glue
//!
//! `init` installs the dispatch vtable, registers the stdlib table, binds
//! the default tagged-literal readers, and evaluates the embedded core
//! source. `eval_str`/`eval_form` run text or forms through read → analyze
//! → (compile →) execute on the selected backend, with a GC safe point
//! between top-level forms.

use crate::env::{self, NsState};
use crate::registry::{self, Loading, NamespaceDef};
use crate::{call, errors, gc_roots, interrupt};
use sable_core::error::SableError;
use sable_core::fns::{BuiltinFn, FnHandle, NativeFn};
use sable_core::gc;
use sable_core::symbol::{Keyword, Symbol};
use sable_core::value::Value;
use sable_core::vtable;
use sable_compiler::analyzer::AnalyzerHost;
use sable_compiler::ast::FnProto;
use sable_compiler::reader::ReaderHost;
use std::any::Any;
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

const SPECIAL_FORMS: &[&str] = &[
    "def", "if", "do", "let*", "loop*", "recur", "fn*", "quote", "var", "throw", "try", "catch",
    "finally", "new", ".", "set!", "case*", "monitor-enter", "monitor-exit", "&",
];

/// Static interop rewrite table: `(ClassName, member)` → core var name
const INTEROP: &[(&str, &str, &str)] = &[
    ("Math", "abs", "abs"),
    ("Math", "sqrt", "sqrt"),
    ("Math", "floor", "floor"),
    ("Math", "ceil", "ceil"),
    ("Math", "pow", "pow"),
    ("System", "currentTimeMillis", "system-time"),
    ("System", "nanoTime", "nano-time"),
    ("Thread", "sleep", "sleep"),
    ("String", "valueOf", "str"),
];

/// Bootstrap the runtime. Idempotent and cheap after the first call.
pub fn init() {
    INIT.call_once(|| {
        interrupt::install();
        vtable::install(vtable::Vtable {
            call: call::call_value,
            type_key: vt_type_key,
            get_meta: vt_get_meta,
            exception_matches_class: errors::matches_class,
            trace_fn_proto,
        });
        gc_roots::register_global_roots();

        let environment = env::global();
        for def in registry::all() {
            match def.loading {
                Loading::Eager | Loading::EagerEval => {
                    if let Err(e) = materialize_def(&def) {
                        // Bootstrap failures are fatal invariant violations
                        panic!("failed to bootstrap {}: {}", def.name, e);
                    }
                }
                Loading::Lazy => environment.register_lazy(def),
            }
        }
        install_default_tag_readers();
        environment.set_current_ns("user");
    });
}

fn trace_fn_proto(proto: &(dyn Any + Send + Sync), visit: &mut dyn FnMut(&Value)) {
    if let Some(proto) = proto.downcast_ref::<FnProto>() {
        proto.trace(visit);
    }
}

fn vt_type_key(v: &Value) -> String {
    call::type_key(v)
}

fn vt_get_meta(v: &Value) -> Option<Value> {
    v.meta()
}

fn builtin_fn(name: &'static str, f: NativeFn) -> Value {
    gc::alloc(Value::Builtin(Arc::new(BuiltinFn {
        name,
        f,
        doc: "",
        arglists: "([form])",
        is_macro: false,
    })))
}

fn inst_reader(args: &[Value]) -> Result<Value, SableError> {
    match args.first() {
        Some(Value::Str(s)) => {
            let plausible = s.len() >= 10
                && s.as_bytes()[..4].iter().all(|b| b.is_ascii_digit())
                && s.as_bytes()[4] == b'-';
            if plausible {
                Ok(Value::Str(s.clone()))
            } else {
                Err(SableError::value_err(format!(
                    "invalid #inst timestamp \"{}\"",
                    s
                )))
            }
        }
        _ => Err(SableError::value_err("#inst requires a string literal")),
    }
}

fn uuid_reader(args: &[Value]) -> Result<Value, SableError> {
    match args.first() {
        Some(Value::Str(s)) => {
            let parsed = uuid::Uuid::parse_str(s)
                .map_err(|e| SableError::value_err(format!("invalid #uuid literal: {}", e)))?;
            Ok(Value::string(parsed.to_string()))
        }
        _ => Err(SableError::value_err("#uuid requires a string literal")),
    }
}

fn install_default_tag_readers() {
    let environment = env::global();
    environment.install_tag_reader("inst", builtin_fn("inst-reader", inst_reader));
    environment.install_tag_reader("uuid", builtin_fn("uuid-reader", uuid_reader));
}

/// Bind a namespace definition and evaluate its embedded source with the
/// current namespace switched to it
fn materialize_def(def: &NamespaceDef) -> Result<(), SableError> {
    let environment = env::global();
    registry::materialize(environment, def)?;
    if let Some(src) = def.embedded_source {
        if matches!(def.loading, Loading::EagerEval | Loading::Lazy) {
            let previous = environment.current_ns_name();
            environment.set_current_ns(def.name);
            let result = eval_str_inner(src);
            environment.set_current_ns(&previous);
            result?;
        }
    }
    environment
        .find_or_create_ns(def.name)
        .set_state(NsState::Loaded);
    Ok(())
}

// ---------------------------------------------------------------------------
// Namespace loading
// ---------------------------------------------------------------------------

/// Make a namespace resolvable if the registry or load path knows it.
/// Lenient: an existing namespace in any state is fine (resolution during
/// its own load must succeed).
pub fn ensure_loaded(name: &str) -> Result<(), SableError> {
    let environment = env::global();
    if environment.find_ns(name).is_some() {
        return Ok(());
    }
    if let Some(def) = environment.take_lazy(name) {
        return materialize_def(&def);
    }
    // Resolution may still fail; nothing to load is not an error here
    let _ = load_from_path(name)?;
    Ok(())
}

/// `require` semantics: load and error on circularity
pub fn require_ns(name: &str) -> Result<(), SableError> {
    let environment = env::global();
    if let Some(ns) = environment.find_ns(name) {
        return match ns.get_state() {
            NsState::Loaded => Ok(()),
            NsState::Loading => Err(SableError::value_err(format!(
                "circular require of namespace {}",
                name
            ))),
            NsState::Unloaded => Ok(()),
        };
    }
    if let Some(def) = environment.take_lazy(name) {
        return materialize_def(&def);
    }
    if load_from_path(name)? {
        return Ok(());
    }
    Err(SableError::value_err(format!(
        "could not locate namespace {} on the load path",
        name
    )))
}

/// Find `my.ns` as `my/ns.sbl` under the load path and evaluate it
fn load_from_path(name: &str) -> Result<bool, SableError> {
    let relative = format!("{}.sbl", name.replace('.', "/"));
    let environment = env::global();
    for root in environment.load_path() {
        let path = root.join(&relative);
        if path.is_file() {
            let src = std::fs::read_to_string(&path)?;
            let ns = environment.find_or_create_ns(name);
            ns.set_state(NsState::Loading);
            let previous = environment.current_ns_name();
            environment.set_current_ns(name);
            let result = eval_str_inner(&src);
            environment.set_current_ns(&previous);
            result?;
            ns.set_state(NsState::Loaded);
            return Ok(true);
        }
    }
    Ok(false)
}

/// One spec of `require`: a symbol or `[ns :as alias :refer [syms]]`
pub fn require_spec(spec: &Value) -> Result<(), SableError> {
    match spec {
        Value::Symbol(s) => require_ns(s.name_str()),
        Value::Vector(items) => {
            let items = items.to_vec();
            let ns_name = match items.first() {
                Some(Value::Symbol(s)) => s.name_str().to_string(),
                _ => {
                    return Err(SableError::value_err(
                        "require spec must start with a namespace symbol",
                    ));
                }
            };
            require_ns(&ns_name)?;
            let environment = env::global();
            let mut i = 1;
            while i < items.len() {
                match &items[i] {
                    Value::Keyword(k) if k.name_str() == "as" => {
                        match items.get(i + 1) {
                            Some(Value::Symbol(alias)) => {
                                environment
                                    .current_ns()
                                    .add_alias(alias.name_str(), &ns_name);
                            }
                            _ => {
                                return Err(SableError::value_err(
                                    ":as requires an alias symbol",
                                ));
                            }
                        }
                        i += 2;
                    }
                    Value::Keyword(k) if k.name_str() == "refer" => {
                        let source = environment.find_ns(&ns_name).ok_or_else(|| {
                            SableError::value_err(format!("no namespace: {}", ns_name))
                        })?;
                        let target = environment.current_ns();
                        match items.get(i + 1) {
                            Some(Value::Keyword(all)) if all.name_str() == "all" => {
                                for var_name in source.var_names() {
                                    if let Some(var) = source.lookup(&var_name) {
                                        target.refer(&var_name, var);
                                    }
                                }
                            }
                            Some(Value::Vector(syms)) => {
                                for s in syms.to_vec() {
                                    if let Value::Symbol(s) = &s {
                                        if let Some(var) = source.lookup(s.name_str()) {
                                            target.refer(s.name_str(), var);
                                        } else {
                                            return Err(SableError::value_err(format!(
                                                "{}/{} does not exist",
                                                ns_name,
                                                s.name_str()
                                            )));
                                        }
                                    }
                                }
                            }
                            _ => {
                                return Err(SableError::value_err(
                                    ":refer requires a vector of symbols or :all",
                                ));
                            }
                        }
                        i += 2;
                    }
                    other => {
                        return Err(SableError::value_err(format!(
                            "unsupported require option {}",
                            sable_core::printer::pr_str(other)
                        )));
                    }
                }
            }
            Ok(())
        }
        other => Err(SableError::value_err(format!(
            "require spec must be a symbol or vector, got {}",
            other.type_name()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Hosts
// ---------------------------------------------------------------------------

/// The runtime-side implementation of the reader and analyzer host traits
pub struct RuntimeHost;

pub fn host() -> RuntimeHost {
    RuntimeHost
}

impl ReaderHost for RuntimeHost {
    fn current_ns(&self) -> String {
        env::global().current_ns_name()
    }

    fn resolve_alias(&self, alias: &str) -> Option<String> {
        env::global().current_ns().resolve_alias(alias)
    }

    fn qualify_symbol(&self, sym: &Symbol) -> Symbol {
        if let Some(ns_or_alias) = sym.ns_str() {
            let full = env::global()
                .current_ns()
                .resolve_alias(ns_or_alias)
                .unwrap_or_else(|| ns_or_alias.to_string());
            return Symbol::qualified(&full, sym.name_str());
        }
        if SPECIAL_FORMS.contains(&sym.name_str()) {
            return sym.clone();
        }
        match env::global().resolve(sym) {
            Some(Value::Var(var)) => Symbol::qualified(&var.ns, &var.name),
            _ => Symbol::qualified(&env::global().current_ns_name(), sym.name_str()),
        }
    }

    fn features(&self) -> Vec<Keyword> {
        vec![Keyword::simple("sbl"), Keyword::simple("default")]
    }

    fn tagged_reader(&self, tag: &Symbol) -> Option<Value> {
        env::global().tag_reader(tag.name_str())
    }

    fn eval_form(&self, form: &Value) -> Result<Value, SableError> {
        eval_form(form)
    }
}

impl AnalyzerHost for RuntimeHost {
    fn resolve_var(&self, sym: &Symbol) -> Result<Option<Value>, SableError> {
        Ok(env::global().resolve(sym))
    }

    fn def_var(&self, sym: &Symbol) -> Result<Value, SableError> {
        env::global().def_var(sym)
    }

    fn interop_rewrite(&self, class: &str, member: &str) -> Option<Value> {
        let target = INTEROP
            .iter()
            .find(|(c, m, _)| *c == class && *m == member)
            .map(|(_, _, var)| *var)?;
        env::global().resolve(&Symbol::qualified(env::CORE_NS, target))
    }

    fn current_ns(&self) -> String {
        env::global().current_ns_name()
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate every top-level form in `src`, returning the last value
pub fn eval_str(src: &str) -> Result<Value, SableError> {
    init();
    eval_str_inner(src)
}

fn eval_str_inner(src: &str) -> Result<Value, SableError> {
    let host = RuntimeHost;
    let forms = sable_compiler::read_all(src, &host)?;
    let mut last = Value::Nil;
    for form in forms {
        last = eval_form_inner(&form)?;
        // Explicit safe point between top-level forms
        if gc::heap().should_collect() {
            let keep = last.clone();
            gc::heap().collect(&|visit| {
                visit(&keep);
                gc_roots::visit_thread_roots(visit);
            });
        }
    }
    Ok(last)
}

/// Evaluate one form
pub fn eval_form(form: &Value) -> Result<Value, SableError> {
    init();
    eval_form_inner(form)
}

fn eval_form_inner(form: &Value) -> Result<Value, SableError> {
    // A top-level (do ...) evaluates its children as sequential top-level
    // forms, so a macro defined by one child is visible to the next
    if let Value::List(l) = form {
        if let Some(Value::Symbol(s)) = l.first() {
            if s.ns.is_none() && s.name_str() == "do" {
                let mut last = Value::Nil;
                for child in l.iter().skip(1) {
                    last = eval_form_inner(child)?;
                }
                return Ok(last);
            }
        }
    }
    let host = RuntimeHost;
    let proto = sable_compiler::analyze_top(form, &host)?;
    run_top(proto)
}

fn run_top(proto: Arc<FnProto>) -> Result<Value, SableError> {
    let arity = &proto.arities[0];
    let locals = vec![Value::Nil; arity.slots];
    let any_proto: Arc<dyn Any + Send + Sync> = proto.clone();
    let handle = Arc::new(FnHandle::new(
        Some(Arc::from("top-level")),
        any_proto,
        Box::new([]),
    ));
    match call::backend() {
        call::Backend::Vm => crate::vm::run_fn(&handle, &proto, arity, locals),
        call::Backend::TreeWalk => crate::treewalk::run_fn(&handle, arity, locals),
    }
}

/// One step of macro expansion (the `macroexpand-1` builtin)
pub fn macroexpand_1(form: &Value) -> Result<Value, SableError> {
    init();
    let items = match form {
        Value::List(l) if !l.is_empty() => l.iter().cloned().collect::<Vec<_>>(),
        _ => return Ok(form.clone()),
    };
    if let Value::Symbol(sym) = &items[0] {
        if !SPECIAL_FORMS.contains(&sym.name_str()) {
            if let Some(Value::Var(var)) = env::global().resolve(sym) {
                if var.is_macro() {
                    let makro = var.deref()?;
                    return vtable::call_value(&makro, &items[1..]);
                }
            }
        }
    }
    Ok(form.clone())
}

/// Dump compiled bytecode for every top-level form (`--dump-bytecode`)
pub fn dump_bytecode(src: &str) -> Result<String, SableError> {
    init();
    let host = RuntimeHost;
    let forms = sable_compiler::read_all(src, &host)?;
    let mut out = String::new();
    for form in forms {
        let proto = sable_compiler::analyze_top(&form, &host)?;
        out.push_str(&sable_compiler::dump_proto(&proto)?);
        out.push('\n');
    }
    Ok(out)
}

/// Positioned top-level error reporting for the CLI
pub fn format_error(err: &SableError) -> String {
    let mut out = err.to_string();
    let trace = err.format_trace();
    if !trace.is_empty() {
        out.push('\n');
        out.push_str(trace.trim_end());
    }
    out
}

/// Whether `src` ends mid-form, for REPL multi-line continuation decisions
pub fn incomplete_input(src: &str) -> bool {
    let host = RuntimeHost;
    match sable_compiler::read_all(src, &host) {
        Err(e) => e.kind == sable_core::error::ErrorKind::Reader && e.message.contains("EOF"),
        Ok(_) => false,
    }
}
