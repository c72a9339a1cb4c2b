//! Analyzer: forms → typed AST
//!
//! Distinguishes special forms from ordinary calls, expands macros eagerly
//! (through the dispatch vtable), resolves locals to frame slots, closed-over
//! names to transitive upvalue chains, and globals to vars. `recur` is
//! validated against the innermost loop or fn frame at analysis time.

use crate::ast::{Ast, CaptureSource, CaseBranch, CatchClause, FnArity, FnProto};
use sable_core::error::{SableError, SourcePos};
use sable_core::symbol::Symbol;
use sable_core::value::Value;
use sable_core::vtable;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

const MAX_MACRO_EXPANSIONS: usize = 1000;

/// Namespace services the analyzer needs from the runtime
pub trait AnalyzerHost {
    /// Resolve a free symbol to a var (`Value::Var`)
    fn resolve_var(&self, sym: &Symbol) -> Result<Option<Value>, SableError>;
    /// Intern the var a `def` targets in the current namespace
    fn def_var(&self, sym: &Symbol) -> Result<Value, SableError>;
    /// Static interop rewrite `(ClassName, member) → var`
    fn interop_rewrite(&self, class: &str, member: &str) -> Option<Value>;
    fn current_ns(&self) -> String;
}

struct LoopCtx {
    first_slot: usize,
    arity: usize,
}

#[derive(Default)]
struct FnFrame {
    scopes: Vec<HashMap<String, usize>>,
    n_slots: usize,
    self_name: Option<String>,
    captures: Vec<(String, CaptureSource)>,
    loops: Vec<LoopCtx>,
}

impl FnFrame {
    fn lookup(&self, name: &str) -> Option<usize> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    fn alloc_slot(&mut self, name: &str) -> usize {
        let slot = self.n_slots;
        self.n_slots += 1;
        self.scopes
            .last_mut()
            .expect("no open scope")
            .insert(name.to_string(), slot);
        slot
    }
}

pub struct Analyzer<'h> {
    host: &'h dyn AnalyzerHost,
    frames: Vec<FnFrame>,
}

/// Analyze one top-level form into a zero-argument fn prototype
pub fn analyze_top(form: &Value, host: &dyn AnalyzerHost) -> Result<Arc<FnProto>, SableError> {
    let mut analyzer = Analyzer {
        host,
        frames: vec![FnFrame {
            scopes: vec![HashMap::new()],
            ..FnFrame::default()
        }],
    };
    let body = analyzer.analyze(form, true)?;
    let frame = analyzer.frames.pop().expect("top frame");
    Ok(Arc::new(FnProto {
        name: Some(Arc::from("top-level")),
        arities: vec![FnArity {
            params: vec![],
            required: 0,
            variadic: false,
            slots: frame.n_slots,
            body,
            chunk: OnceLock::new(),
        }],
        captures: vec![],
        pos: form_pos(form),
    }))
}

/// Position recorded by the reader in `{:line :column}` metadata
fn form_pos(form: &Value) -> Option<SourcePos> {
    let meta = form.meta()?;
    let line = meta_get_int(&meta, "line")?;
    let column = meta_get_int(&meta, "column").unwrap_or(1);
    Some(SourcePos::new(
        (line as usize).saturating_sub(1),
        (column as usize).saturating_sub(1),
    ))
}

fn meta_get_int(meta: &Value, key: &str) -> Option<i64> {
    let k = Value::keyword(key);
    let v = match meta {
        Value::ArrayMap(m) => m.get(&k).cloned(),
        Value::Map(m) => m.get(&k).cloned(),
        _ => None,
    }?;
    match v {
        Value::Int(n) => Some(n),
        _ => None,
    }
}

impl<'h> Analyzer<'h> {
    fn frame(&mut self) -> &mut FnFrame {
        self.frames.last_mut().expect("no fn frame")
    }

    /// Would this name resolve lexically (local, self-name, or enclosing
    /// frame's local reachable as an upvalue)?
    fn name_is_lexical(&self, name: &str) -> bool {
        self.frames
            .iter()
            .any(|f| f.lookup(name).is_some() || f.self_name.as_deref() == Some(name))
    }

    pub fn analyze(&mut self, form: &Value, tail: bool) -> Result<Ast, SableError> {
        match form {
            Value::Symbol(sym) => self.analyze_symbol(sym),
            Value::List(l) => {
                if l.is_empty() {
                    Ok(Ast::Const(form.clone()))
                } else {
                    self.analyze_list(form, tail)
                }
            }
            Value::Vector(v) => {
                let items: Vec<Value> = v.to_vec();
                self.analyze_collection_literal(&items, "vector", form)
            }
            Value::ArrayMap(m) => {
                let items: Vec<Value> = m
                    .iter()
                    .flat_map(|(k, v)| [k.clone(), v.clone()])
                    .collect();
                self.analyze_collection_literal(&items, "hash-map", form)
            }
            Value::Map(m) => {
                let items: Vec<Value> = m
                    .iter()
                    .flat_map(|(k, v)| [k.clone(), v.clone()])
                    .collect();
                self.analyze_collection_literal(&items, "hash-map", form)
            }
            Value::Set(s) => {
                let items = s.to_vec();
                self.analyze_collection_literal(&items, "hash-set", form)
            }
            // Scalars evaluate to themselves
            _ => Ok(Ast::Const(form.clone())),
        }
    }

    /// Vector/map/set literals with non-constant elements become builder calls
    fn analyze_collection_literal(
        &mut self,
        items: &[Value],
        builder: &str,
        original: &Value,
    ) -> Result<Ast, SableError> {
        let analyzed: Vec<Ast> = items
            .iter()
            .map(|item| self.analyze(item, false))
            .collect::<Result<_, _>>()?;
        if analyzed.iter().all(|a| matches!(a, Ast::Const(_))) {
            return Ok(Ast::Const(original.clone()));
        }
        let builder_sym = Symbol::qualified("sable.core", builder);
        let var = self.host.resolve_var(&builder_sym)?.ok_or_else(|| {
            SableError::compile(format!("collection builder sable.core/{} missing", builder))
        })?;
        Ok(Ast::Call {
            callee: Box::new(Ast::VarRef(var)),
            args: analyzed,
            tail: false,
            pos: form_pos(original),
        })
    }

    fn analyze_symbol(&mut self, sym: &Symbol) -> Result<Ast, SableError> {
        if sym.ns.is_none() {
            let name = sym.name_str().to_string();
            if let Some(slot) = self.frame().lookup(&name) {
                return Ok(Ast::Local(slot));
            }
            if self.frame().self_name.as_deref() == Some(name.as_str()) {
                return Ok(Ast::SelfRef);
            }
            let top = self.frames.len() - 1;
            if top > 0 {
                if let Some(idx) = self.resolve_capture(top, &name) {
                    return Ok(Ast::Upval(idx));
                }
            }
        }
        // Free symbol: namespace var, else static interop sugar (Math/abs)
        if let Some(var) = self.host.resolve_var(sym)? {
            return Ok(Ast::VarRef(var));
        }
        if let Some(ns) = sym.ns_str() {
            if ns.chars().next().is_some_and(|c| c.is_uppercase()) {
                if let Some(var) = self.host.interop_rewrite(ns, sym.name_str()) {
                    return Ok(Ast::VarRef(var));
                }
                return Err(SableError::new(
                    sable_core::error::Phase::Analyze,
                    sable_core::error::ErrorKind::Value,
                    format!("unknown static member {}/{}", ns, sym.name_str()),
                ));
            }
        }
        Err(SableError::compile_at(
            format!(
                "unable to resolve symbol: {} in this context",
                sym.name_str()
            ),
            sym.meta
                .as_deref()
                .and_then(|_| form_pos(&Value::Symbol(Arc::new(sym.clone())))),
        ))
    }

    /// Resolve `name` as an upvalue of `frame_idx`, registering transitive
    /// captures through every intermediate fn
    fn resolve_capture(&mut self, frame_idx: usize, name: &str) -> Option<usize> {
        if frame_idx == 0 {
            return None;
        }
        if let Some(idx) = self.frames[frame_idx]
            .captures
            .iter()
            .position(|(n, _)| n == name)
        {
            return Some(idx);
        }
        // Captured from the parent's locals, or from the parent's captures
        let source = if let Some(slot) = self.frames[frame_idx - 1].lookup(name) {
            CaptureSource::Local(slot)
        } else {
            let parent_idx = self.resolve_capture(frame_idx - 1, name)?;
            CaptureSource::Upval(parent_idx)
        };
        let frame = &mut self.frames[frame_idx];
        frame.captures.push((name.to_string(), source));
        Some(frame.captures.len() - 1)
    }

    fn analyze_list(&mut self, form: &Value, tail: bool) -> Result<Ast, SableError> {
        let mut form = form.clone();
        for _ in 0..MAX_MACRO_EXPANSIONS {
            // A macro may expand to a non-list (or empty) form
            let items: Vec<Value> = match &form {
                Value::List(l) if !l.is_empty() => l.iter().cloned().collect(),
                other => {
                    let expanded = other.clone();
                    return self.analyze(&expanded, tail);
                }
            };
            let head = &items[0];

            // Special forms are terminal; they are only special when the head
            // symbol is not shadowed by a lexical binding
            if let Value::Symbol(sym) = head {
                let shadowed = sym.ns.is_none() && self.name_is_lexical(sym.name_str());
                if !shadowed && sym.ns.is_none() {
                    match sym.name_str() {
                        "def" => return self.analyze_def(&items, &form),
                        "if" => return self.analyze_if(&items, tail, &form),
                        "do" => return self.analyze_do(&items[1..], tail),
                        "let*" => return self.analyze_let(&items, tail, false, &form),
                        "loop*" => return self.analyze_let(&items, tail, true, &form),
                        "recur" => return self.analyze_recur(&items, tail, &form),
                        "fn*" => return self.analyze_fn(&items, &form),
                        "quote" => {
                            return Ok(Ast::Const(
                                items.get(1).cloned().unwrap_or(Value::Nil),
                            ));
                        }
                        "var" => return self.analyze_var_form(&items, &form),
                        "throw" => {
                            let expr = self.expect_arg(&items, 1, "throw", &form)?;
                            return Ok(Ast::Throw {
                                expr: Box::new(self.analyze(&expr, false)?),
                                pos: form_pos(&form),
                            });
                        }
                        "try" => return self.analyze_try(&items[1..]),
                        "set!" => return self.analyze_set(&items, &form),
                        "case*" => return self.analyze_case(&items, tail, &form),
                        "new" => return self.analyze_new(&items, &form),
                        "." => return self.analyze_dot(&items, &form),
                        "monitor-enter" | "monitor-exit" => {
                            let expr = self.expect_arg(&items, 1, sym.name_str(), &form)?;
                            return Ok(Ast::Do(vec![
                                self.analyze(&expr, false)?,
                                Ast::Const(Value::Nil),
                            ]));
                        }
                        _ => {}
                    }
                }

                // Macro call (qualified or not): invoke with unevaluated arg
                // forms and re-analyze the expansion
                if !shadowed {
                    if let Some(var) = self.host.resolve_var(sym)? {
                        if let Value::Var(v) = &var {
                            if v.is_macro() {
                                let makro = v.deref()?;
                                let expanded = vtable::call_value(&makro, &items[1..])?;
                                form = expanded;
                                continue;
                            }
                        }
                    }
                }
            }

            // Ordinary call
            let callee = self.analyze(head, false)?;
            let args: Vec<Ast> = items[1..]
                .iter()
                .map(|a| self.analyze(a, false))
                .collect::<Result<_, _>>()?;
            return Ok(Ast::Call {
                callee: Box::new(callee),
                args,
                tail,
                pos: form_pos(&form),
            });
        }
        Err(SableError::compile_at(
            "macro expansion limit exceeded",
            form_pos(&form),
        ))
    }

    fn expect_arg(
        &self,
        items: &[Value],
        idx: usize,
        what: &str,
        form: &Value,
    ) -> Result<Value, SableError> {
        items.get(idx).cloned().ok_or_else(|| {
            SableError::compile_at(format!("{} requires an argument", what), form_pos(form))
        })
    }

    fn analyze_def(&mut self, items: &[Value], form: &Value) -> Result<Ast, SableError> {
        let sym = match items.get(1) {
            Some(Value::Symbol(s)) => s.clone(),
            _ => {
                return Err(SableError::compile_at(
                    "def requires a symbol name",
                    form_pos(form),
                ));
            }
        };
        // (def name), (def name init), (def name doc-string init)
        let (doc, init_form) = match items.len() {
            2 => (None, None),
            3 => (None, Some(items[2].clone())),
            4 => match &items[2] {
                Value::Str(s) => (Some(s.to_string()), Some(items[3].clone())),
                _ => {
                    return Err(SableError::compile_at(
                        "def doc-string must be a string",
                        form_pos(form),
                    ));
                }
            },
            _ => {
                return Err(SableError::compile_at(
                    "too many arguments to def",
                    form_pos(form),
                ));
            }
        };

        let var_value = self.host.def_var(&sym)?;
        let dynamic = sym
            .meta
            .as_deref()
            .map(|m| {
                matches!(
                    map_lookup(m, &Value::keyword("dynamic")),
                    Some(Value::Bool(true))
                )
            })
            .unwrap_or(false);
        if let Value::Var(v) = &var_value {
            if dynamic {
                v.set_dynamic(true);
            }
            let mut meta_pairs: Vec<(Value, Value)> = Vec::new();
            if let Some(doc) = doc {
                meta_pairs.push((Value::keyword("doc"), Value::string(doc)));
            }
            if let Some(m) = sym.meta.as_deref() {
                for item in sable_core::seqs::collect(m).unwrap_or_default() {
                    if let Value::Vector(kv) = &item {
                        if let (Some(k), Some(val)) = (kv.get(0), kv.get(1)) {
                            meta_pairs.push((k.clone(), val.clone()));
                        }
                    }
                }
            }
            if !meta_pairs.is_empty() {
                v.set_meta(Some(Value::ArrayMap(Arc::new(
                    sable_core::map::ArrayMap::from_pairs(meta_pairs),
                ))));
            }
        }

        let init = match init_form {
            Some(f) => Some(Box::new(self.analyze(&f, false)?)),
            None => None,
        };
        Ok(Ast::Def {
            var: var_value,
            init,
            dynamic,
            macro_flag: false,
        })
    }

    fn analyze_if(&mut self, items: &[Value], tail: bool, form: &Value) -> Result<Ast, SableError> {
        if items.len() < 3 || items.len() > 4 {
            return Err(SableError::compile_at(
                "if requires a test, a then-branch, and an optional else-branch",
                form_pos(form),
            ));
        }
        Ok(Ast::If {
            test: Box::new(self.analyze(&items[1], false)?),
            then: Box::new(self.analyze(&items[2], tail)?),
            els: Box::new(match items.get(3) {
                Some(e) => self.analyze(e, tail)?,
                None => Ast::Const(Value::Nil),
            }),
        })
    }

    fn analyze_do(&mut self, body: &[Value], tail: bool) -> Result<Ast, SableError> {
        if body.is_empty() {
            return Ok(Ast::Const(Value::Nil));
        }
        let mut items = Vec::with_capacity(body.len());
        for (i, form) in body.iter().enumerate() {
            let is_last = i == body.len() - 1;
            items.push(self.analyze(form, tail && is_last)?);
        }
        Ok(Ast::Do(items))
    }

    fn analyze_let(
        &mut self,
        items: &[Value],
        tail: bool,
        is_loop: bool,
        form: &Value,
    ) -> Result<Ast, SableError> {
        let name = if is_loop { "loop*" } else { "let*" };
        let bindings_vec = match items.get(1) {
            Some(Value::Vector(v)) => v.to_vec(),
            _ => {
                return Err(SableError::compile_at(
                    format!("{} requires a binding vector", name),
                    form_pos(form),
                ));
            }
        };
        if bindings_vec.len() % 2 != 0 {
            return Err(SableError::compile_at(
                format!("{} binding vector must have an even number of forms", name),
                form_pos(form),
            ));
        }

        self.frame().scopes.push(HashMap::new());
        let result = (|| {
            let mut bindings = Vec::new();
            let mut first_slot = None;
            for pair in bindings_vec.chunks(2) {
                let sym = match &pair[0] {
                    Value::Symbol(s) if s.ns.is_none() => s.name_str().to_string(),
                    other => {
                        return Err(SableError::compile_at(
                            format!("{} binding must be a simple symbol, got {}", name, other.type_name()),
                            form_pos(form),
                        ));
                    }
                };
                // Init sees previous bindings but not its own
                let init = self.analyze(&pair[1], false)?;
                let slot = self.frame().alloc_slot(&sym);
                first_slot.get_or_insert(slot);
                bindings.push((slot, init));
            }

            if is_loop {
                let first_slot = first_slot.unwrap_or(self.frame().n_slots);
                let arity = bindings.len();
                self.frame().loops.push(LoopCtx { first_slot, arity });
                let body = self.analyze_do(&items[2..], true)?;
                self.frame().loops.pop();
                Ok(Ast::Loop {
                    bindings,
                    body: Box::new(body),
                    first_slot,
                })
            } else {
                let body = self.analyze_do(&items[2..], tail)?;
                Ok(Ast::Let {
                    bindings,
                    body: Box::new(body),
                })
            }
        })();
        self.frame().scopes.pop();
        result
    }

    fn analyze_recur(
        &mut self,
        items: &[Value],
        tail: bool,
        form: &Value,
    ) -> Result<Ast, SableError> {
        let pos = form_pos(form);
        if !tail {
            return Err(SableError::compile_at(
                "recur can only appear in tail position",
                pos,
            ));
        }
        let args: Vec<Ast> = items[1..]
            .iter()
            .map(|a| self.analyze(a, false))
            .collect::<Result<_, _>>()?;
        let frame = self.frames.last().expect("no fn frame");
        let ctx = frame.loops.last().ok_or_else(|| {
            SableError::compile_at("recur outside of loop or fn body", pos)
        })?;
        if args.len() != ctx.arity {
            return Err(SableError::compile_at(
                format!(
                    "recur argument count ({}) does not match loop arity ({})",
                    args.len(),
                    ctx.arity
                ),
                pos,
            ));
        }
        Ok(Ast::Recur {
            args,
            first_slot: ctx.first_slot,
            pos,
        })
    }

    fn analyze_fn(&mut self, items: &[Value], form: &Value) -> Result<Ast, SableError> {
        // (fn* name? [params] body...) or (fn* name? ([params] body...)+)
        let mut idx = 1;
        let name = match items.get(idx) {
            Some(Value::Symbol(s)) if s.ns.is_none() => {
                idx += 1;
                Some(s.name_str().to_string())
            }
            _ => None,
        };
        let arity_forms: Vec<Vec<Value>> = match items.get(idx) {
            Some(Value::Vector(_)) => {
                vec![items[idx..].to_vec()]
            }
            Some(Value::List(_)) => items[idx..]
                .iter()
                .map(|arity| match arity {
                    Value::List(l) => Ok(l.iter().cloned().collect()),
                    other => Err(SableError::compile_at(
                        format!("fn* arity must be a list, got {}", other.type_name()),
                        form_pos(form),
                    )),
                })
                .collect::<Result<_, _>>()?,
            _ => {
                return Err(SableError::compile_at(
                    "fn* requires a parameter vector",
                    form_pos(form),
                ));
            }
        };

        self.frames.push(FnFrame {
            scopes: vec![],
            self_name: name.clone(),
            ..FnFrame::default()
        });

        let analyzed = (|| {
            let mut arities: Vec<FnArity> = Vec::new();
            for arity_form in &arity_forms {
                let params_vec = match arity_form.first() {
                    Some(Value::Vector(v)) => v.to_vec(),
                    _ => {
                        return Err(SableError::compile_at(
                            "fn* arity requires a parameter vector",
                            form_pos(form),
                        ));
                    }
                };

                // Fresh slot space per arity
                let frame = self.frame();
                frame.scopes = vec![HashMap::new()];
                frame.n_slots = 0;

                let mut params: Vec<Arc<str>> = Vec::new();
                let mut required = 0usize;
                let mut variadic = false;
                let mut after_amp = false;
                for p in &params_vec {
                    let pname = match p {
                        Value::Symbol(s) if s.ns.is_none() => s.name_str().to_string(),
                        other => {
                            return Err(SableError::compile_at(
                                format!("fn* parameter must be a simple symbol, got {}", other.type_name()),
                                form_pos(form),
                            ));
                        }
                    };
                    if pname == "&" {
                        if after_amp {
                            return Err(SableError::compile_at(
                                "only one & allowed in parameter vector",
                                form_pos(form),
                            ));
                        }
                        after_amp = true;
                        continue;
                    }
                    if after_amp && variadic {
                        return Err(SableError::compile_at(
                            "only one parameter allowed after &",
                            form_pos(form),
                        ));
                    }
                    self.frame().alloc_slot(&pname);
                    params.push(Arc::from(pname.as_str()));
                    if after_amp {
                        variadic = true;
                    } else {
                        required += 1;
                    }
                }
                if after_amp && !variadic {
                    return Err(SableError::compile_at(
                        "missing parameter after &",
                        form_pos(form),
                    ));
                }

                let slot_count = required + usize::from(variadic);
                self.frame().loops.push(LoopCtx {
                    first_slot: 0,
                    arity: slot_count,
                });
                let body = self.analyze_do(&arity_form[1..], true)?;
                self.frame().loops.pop();

                if arities
                    .iter()
                    .any(|a: &FnArity| a.required == required && a.variadic == variadic)
                {
                    return Err(SableError::compile_at(
                        "duplicate fn* arity",
                        form_pos(form),
                    ));
                }
                if variadic && arities.iter().any(|a| a.variadic) {
                    return Err(SableError::compile_at(
                        "only one variadic arity allowed",
                        form_pos(form),
                    ));
                }

                arities.push(FnArity {
                    params,
                    required,
                    variadic,
                    slots: self.frame().n_slots,
                    body,
                    chunk: OnceLock::new(),
                });
            }
            if let Some(max_required) = arities
                .iter()
                .filter(|a| a.variadic)
                .map(|a| a.required)
                .next()
            {
                if arities
                    .iter()
                    .any(|a| !a.variadic && a.required > max_required)
                {
                    return Err(SableError::compile_at(
                        "fixed arity exceeds variadic arity",
                        form_pos(form),
                    ));
                }
            }
            Ok(arities)
        })();

        let frame = self.frames.pop().expect("fn frame");
        let arities = analyzed?;
        let captures: Vec<CaptureSource> =
            frame.captures.iter().map(|(_, src)| *src).collect();
        Ok(Ast::Fn {
            proto: Arc::new(FnProto {
                name: name.map(|n| Arc::from(n.as_str())),
                arities,
                captures,
                pos: form_pos(form),
            }),
        })
    }

    fn analyze_var_form(&mut self, items: &[Value], form: &Value) -> Result<Ast, SableError> {
        let sym = match items.get(1) {
            Some(Value::Symbol(s)) => s,
            _ => {
                return Err(SableError::compile_at(
                    "var requires a symbol",
                    form_pos(form),
                ));
            }
        };
        let var = self.host.resolve_var(sym)?.ok_or_else(|| {
            SableError::compile_at(
                format!("unable to resolve var: {}", sym.name_str()),
                form_pos(form),
            )
        })?;
        Ok(Ast::TheVar(var))
    }

    fn analyze_set(&mut self, items: &[Value], form: &Value) -> Result<Ast, SableError> {
        if items.len() != 3 {
            return Err(SableError::compile_at(
                "set! requires a target and a value",
                form_pos(form),
            ));
        }
        let sym = match &items[1] {
            Value::Symbol(s) => s,
            other => {
                return Err(SableError::compile_at(
                    format!("set! target must be a symbol, got {}", other.type_name()),
                    form_pos(form),
                ));
            }
        };
        let var = self.host.resolve_var(sym)?.ok_or_else(|| {
            SableError::compile_at(
                format!("unable to resolve var: {}", sym.name_str()),
                form_pos(form),
            )
        })?;
        Ok(Ast::SetVar {
            var,
            expr: Box::new(self.analyze(&items[2], false)?),
        })
    }

    fn analyze_try(&mut self, body: &[Value]) -> Result<Ast, SableError> {
        let mut main = Vec::new();
        let mut catches = Vec::new();
        let mut finally = None;
        for form in body {
            if let Value::List(l) = form {
                match l.first() {
                    Some(Value::Symbol(s)) if s.name_str() == "catch" && s.ns.is_none() => {
                        let items: Vec<Value> = l.iter().cloned().collect();
                        if items.len() < 3 {
                            return Err(SableError::compile_at(
                                "catch requires a class and a binding",
                                form_pos(form),
                            ));
                        }
                        let class_name = match &items[1] {
                            Value::Symbol(s) => s.name_str().to_string(),
                            other => {
                                return Err(SableError::compile_at(
                                    format!("catch class must be a symbol, got {}", other.type_name()),
                                    form_pos(form),
                                ));
                            }
                        };
                        let bind_name = match &items[2] {
                            Value::Symbol(s) if s.ns.is_none() => s.name_str().to_string(),
                            other => {
                                return Err(SableError::compile_at(
                                    format!("catch binding must be a simple symbol, got {}", other.type_name()),
                                    form_pos(form),
                                ));
                            }
                        };
                        self.frame().scopes.push(HashMap::new());
                        let slot = self.frame().alloc_slot(&bind_name);
                        let catch_body = self.analyze_do(&items[3..], false);
                        self.frame().scopes.pop();
                        catches.push(CatchClause {
                            class_name,
                            slot,
                            body: catch_body?,
                        });
                        continue;
                    }
                    Some(Value::Symbol(s)) if s.name_str() == "finally" && s.ns.is_none() => {
                        let items: Vec<Value> = l.iter().cloned().collect();
                        finally = Some(Box::new(self.analyze_do(&items[1..], false)?));
                        continue;
                    }
                    _ => {}
                }
            }
            if !catches.is_empty() || finally.is_some() {
                return Err(SableError::compile(
                    "try body form after catch or finally clause",
                ));
            }
            main.push(form.clone());
        }
        // recur cannot cross a try boundary: body analyzed non-tail
        let body_ast = self.analyze_do(&main, false)?;
        Ok(Ast::Try {
            body: Box::new(body_ast),
            catches,
            finally,
        })
    }

    fn analyze_case(
        &mut self,
        items: &[Value],
        tail: bool,
        form: &Value,
    ) -> Result<Ast, SableError> {
        // (case* expr [[tests body]...] default?)
        if items.len() < 3 {
            return Err(SableError::compile_at(
                "case* requires an expression and a clause vector",
                form_pos(form),
            ));
        }
        let expr = self.analyze(&items[1], false)?;
        let clauses = match &items[2] {
            Value::Vector(v) => v.to_vec(),
            other => {
                return Err(SableError::compile_at(
                    format!("case* clauses must be a vector, got {}", other.type_name()),
                    form_pos(form),
                ));
            }
        };
        let mut branches = Vec::new();
        for clause in &clauses {
            let pair = match clause {
                Value::Vector(v) if v.len() == 2 => v.to_vec(),
                _ => {
                    return Err(SableError::compile_at(
                        "case* clause must be a [tests body] pair",
                        form_pos(form),
                    ));
                }
            };
            let tests = match &pair[0] {
                Value::Vector(v) => v.to_vec(),
                single => vec![single.clone()],
            };
            branches.push(CaseBranch {
                tests,
                body: self.analyze(&pair[1], tail)?,
            });
        }
        let default = match items.get(3) {
            Some(d) => Some(Box::new(self.analyze(d, tail)?)),
            None => None,
        };
        Ok(Ast::Case {
            expr: Box::new(expr),
            branches,
            default,
        })
    }

    fn analyze_new(&mut self, items: &[Value], form: &Value) -> Result<Ast, SableError> {
        let class = match items.get(1) {
            Some(Value::Symbol(s)) => s.name_str().to_string(),
            _ => {
                return Err(SableError::compile_at(
                    "new requires a class symbol",
                    form_pos(form),
                ));
            }
        };
        let var = self.host.interop_rewrite(&class, "new").ok_or_else(|| {
            SableError::new(
                sable_core::error::Phase::Analyze,
                sable_core::error::ErrorKind::Value,
                format!("unknown constructor {}", class),
            )
        })?;
        let args: Vec<Ast> = items[2..]
            .iter()
            .map(|a| self.analyze(a, false))
            .collect::<Result<_, _>>()?;
        Ok(Ast::Call {
            callee: Box::new(Ast::VarRef(var)),
            args,
            tail: false,
            pos: form_pos(form),
        })
    }

    fn analyze_dot(&mut self, items: &[Value], form: &Value) -> Result<Ast, SableError> {
        // (. ClassName member args...) static rewrites only
        let class = match items.get(1) {
            Some(Value::Symbol(s)) if s.ns.is_none() => s.name_str().to_string(),
            _ => {
                return Err(SableError::new(
                    sable_core::error::Phase::Analyze,
                    sable_core::error::ErrorKind::Value,
                    "host interop form requires a class symbol",
                ));
            }
        };
        let member = match items.get(2) {
            Some(Value::Symbol(s)) => s.name_str().to_string(),
            _ => {
                return Err(SableError::compile_at(
                    "host interop form requires a member symbol",
                    form_pos(form),
                ));
            }
        };
        let var = self.host.interop_rewrite(&class, &member).ok_or_else(|| {
            SableError::new(
                sable_core::error::Phase::Analyze,
                sable_core::error::ErrorKind::Value,
                format!("unknown static member {}/{}", class, member),
            )
        })?;
        let args: Vec<Ast> = items[3..]
            .iter()
            .map(|a| self.analyze(a, false))
            .collect::<Result<_, _>>()?;
        Ok(Ast::Call {
            callee: Box::new(Ast::VarRef(var)),
            args,
            tail: false,
            pos: form_pos(form),
        })
    }
}

fn map_lookup(m: &Value, key: &Value) -> Option<Value> {
    match m {
        Value::ArrayMap(am) => am.get(key).cloned(),
        Value::Map(hm) => hm.get(key).cloned(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{NullReaderHost, read_one};
    use sable_core::refs::Var;

    /// Host with one namespace of pre-interned vars and no macros
    struct TestHost {
        vars: std::sync::Mutex<HashMap<String, Value>>,
    }

    impl TestHost {
        fn new() -> TestHost {
            let host = TestHost {
                vars: std::sync::Mutex::new(HashMap::new()),
            };
            for name in ["+", "vector", "hash-map", "hash-set", "conj"] {
                host.intern(name);
            }
            host
        }

        fn intern(&self, name: &str) -> Value {
            let mut vars = self.vars.lock().unwrap();
            vars.entry(name.to_string())
                .or_insert_with(|| {
                    let var = Var::new(Arc::from("sable.core"), Arc::from(name));
                    var.bind_root(Value::Nil);
                    Value::Var(Arc::new(var))
                })
                .clone()
        }
    }

    impl AnalyzerHost for TestHost {
        fn resolve_var(&self, sym: &Symbol) -> Result<Option<Value>, SableError> {
            Ok(self.vars.lock().unwrap().get(sym.name_str()).cloned())
        }

        fn def_var(&self, sym: &Symbol) -> Result<Value, SableError> {
            Ok(self.intern(sym.name_str()))
        }

        fn interop_rewrite(&self, _class: &str, _member: &str) -> Option<Value> {
            None
        }

        fn current_ns(&self) -> String {
            "user".to_string()
        }
    }

    fn analyze_str(src: &str) -> Result<Arc<FnProto>, SableError> {
        let form = read_one(src, &NullReaderHost).unwrap().unwrap();
        analyze_top(&form, &TestHost::new())
    }

    fn body_of(proto: &FnProto) -> &Ast {
        &proto.arities[0].body
    }

    #[test]
    fn test_let_resolves_locals_to_slots() {
        let proto = analyze_str("(let* [a 1 b 2] b)").unwrap();
        match body_of(&proto) {
            Ast::Let { bindings, body } => {
                assert_eq!(bindings.len(), 2);
                assert_eq!(bindings[0].0, 0);
                assert_eq!(bindings[1].0, 1);
                match &**body {
                    Ast::Do(items) => assert!(matches!(items[0], Ast::Local(1))),
                    other => panic!("unexpected body {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unresolved_symbol_errors() {
        let err = analyze_str("missing-thing").unwrap_err();
        assert!(err.message.contains("unable to resolve symbol"));
    }

    #[test]
    fn test_fn_captures_enclosing_local() {
        let proto = analyze_str("(let* [x 1] (fn* [y] (+ x y)))").unwrap();
        // Find the nested fn and check it captured x from the parent frame
        fn find_fn(ast: &Ast) -> Option<&FnProto> {
            match ast {
                Ast::Fn { proto } => Some(proto),
                Ast::Let { bindings, body } => bindings
                    .iter()
                    .find_map(|(_, b)| find_fn(b))
                    .or_else(|| find_fn(body)),
                Ast::Do(items) => items.iter().find_map(find_fn),
                _ => None,
            }
        }
        let inner = find_fn(body_of(&proto)).expect("nested fn");
        assert_eq!(inner.captures, vec![CaptureSource::Local(0)]);
        assert_eq!(inner.arities[0].required, 1);
    }

    #[test]
    fn test_recur_outside_tail_position_is_an_error() {
        let err = analyze_str("(loop* [x 1] (+ (recur 2) 1))").unwrap_err();
        assert!(err.message.contains("tail position"), "got {}", err.message);
    }

    #[test]
    fn test_recur_arity_mismatch_is_an_error() {
        let err = analyze_str("(loop* [x 1] (recur 1 2))").unwrap_err();
        assert!(err.message.contains("does not match"), "got {}", err.message);
    }

    #[test]
    fn test_recur_in_loop_tail_is_valid() {
        let proto = analyze_str("(loop* [x 1] (if x (recur 2) x))").unwrap();
        match body_of(&proto) {
            Ast::Loop { first_slot, .. } => assert_eq!(*first_slot, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_multi_arity_fn() {
        let proto = analyze_str("(fn* f ([] 0) ([x] x) ([x & xs] x))").unwrap();
        match body_of(&proto) {
            Ast::Fn { proto } => {
                assert_eq!(proto.arities.len(), 3);
                assert!(proto.arities[2].variadic);
                assert_eq!(proto.name.as_deref(), Some("f"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_arity_rejected() {
        assert!(analyze_str("(fn* ([x] x) ([y] y))").is_err());
    }

    #[test]
    fn test_vector_literal_with_locals_becomes_builder_call() {
        let proto = analyze_str("(let* [x 1] [x 2])").unwrap();
        fn find_call(ast: &Ast) -> bool {
            match ast {
                Ast::Call { .. } => true,
                Ast::Let { body, .. } => find_call(body),
                Ast::Do(items) => items.iter().any(find_call),
                _ => false,
            }
        }
        assert!(find_call(body_of(&proto)));
        // Fully constant literals stay constant
        let proto = analyze_str("[1 2 3]").unwrap();
        assert!(matches!(body_of(&proto), Ast::Const(Value::Vector(_))));
    }

    #[test]
    fn test_try_catch_finally_shape() {
        let proto =
            analyze_str("(try 1 (catch Exception e 2) (finally 3))").unwrap();
        match body_of(&proto) {
            Ast::Try {
                catches, finally, ..
            } => {
                assert_eq!(catches.len(), 1);
                assert_eq!(catches[0].class_name, "Exception");
                assert!(finally.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_quote_is_terminal() {
        let proto = analyze_str("(quote (missing-thing 1))").unwrap();
        assert!(matches!(body_of(&proto), Ast::Const(Value::List(_))));
    }
}
