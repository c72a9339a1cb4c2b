//! Tree-walking interpreter: the reference backend
//!
//! Evaluates the analyzed AST directly. Semantics match the VM exactly;
//! `recur` propagates as a control value consumed by the innermost loop or
//! fn body, and exception handling mirrors the VM's class matcher.

use crate::call::call_value;
use crate::errors;
use sable_core::error::SableError;
use sable_core::fns::FnHandle;
use sable_core::gc;
use sable_core::value::Value;
use sable_compiler::ast::{Ast, CaptureSource, FnArity, FnProto};
use std::sync::Arc;

/// Either a value or an in-flight `recur` heading for its loop entry
enum Ev {
    Val(Value),
    Recur(Vec<Value>, usize),
}

struct Env<'a> {
    locals: &'a mut Vec<Value>,
    handle: &'a Arc<FnHandle>,
}

/// Run one arity of a user fn by walking its body
pub fn run_fn(
    handle: &Arc<FnHandle>,
    arity: &FnArity,
    mut locals: Vec<Value>,
) -> Result<Value, SableError> {
    // The fn body is a recur target rebinding the parameter slots
    loop {
        let mut env = Env {
            locals: &mut locals,
            handle,
        };
        match eval(&arity.body, &mut env)? {
            Ev::Val(v) => return Ok(v),
            Ev::Recur(args, first_slot) => {
                for (i, arg) in args.into_iter().enumerate() {
                    locals[first_slot + i] = arg;
                }
            }
        }
    }
}

fn eval(ast: &Ast, env: &mut Env<'_>) -> Result<Ev, SableError> {
    match ast {
        Ast::Const(v) => Ok(Ev::Val(v.clone())),
        Ast::Local(slot) => Ok(Ev::Val(env.locals[*slot].clone())),
        Ast::Upval(idx) => Ok(Ev::Val(env.handle.captures[*idx].clone())),
        Ast::SelfRef => Ok(Ev::Val(Value::Fn(env.handle.clone()))),
        Ast::VarRef(var) => match var {
            Value::Var(v) => Ok(Ev::Val(v.deref()?)),
            other => Ok(Ev::Val(other.clone())),
        },
        Ast::TheVar(var) => Ok(Ev::Val(var.clone())),
        Ast::If { test, then, els } => {
            let t = eval_value(test, env)?;
            if t.is_truthy() {
                eval(then, env)
            } else {
                eval(els, env)
            }
        }
        Ast::Do(items) => {
            if items.is_empty() {
                return Ok(Ev::Val(Value::Nil));
            }
            for item in &items[..items.len() - 1] {
                eval_value(item, env)?;
            }
            eval(&items[items.len() - 1], env)
        }
        Ast::Let { bindings, body } => {
            for (slot, init) in bindings {
                let v = eval_value(init, env)?;
                env.locals[*slot] = v;
            }
            eval(body, env)
        }
        Ast::Loop {
            bindings,
            body,
            first_slot,
        } => {
            for (slot, init) in bindings {
                let v = eval_value(init, env)?;
                env.locals[*slot] = v;
            }
            loop {
                match eval(body, env)? {
                    Ev::Recur(args, fs) if fs == *first_slot => {
                        for (i, arg) in args.into_iter().enumerate() {
                            env.locals[first_slot + i] = arg;
                        }
                    }
                    other => return Ok(other),
                }
            }
        }
        Ast::Recur {
            args, first_slot, ..
        } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_value(arg, env)?);
            }
            Ok(Ev::Recur(values, *first_slot))
        }
        Ast::Fn { proto } => Ok(Ev::Val(make_closure(proto, env))),
        Ast::Call { callee, args, .. } => {
            let f = eval_value(callee, env)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_value(arg, env)?);
            }
            Ok(Ev::Val(call_value(&f, &values)?))
        }
        Ast::Def {
            var,
            init,
            dynamic,
            macro_flag,
        } => {
            if let Value::Var(v) = var {
                if let Some(init) = init {
                    let value = eval_value(init, env)?;
                    v.bind_root(value);
                }
                if *dynamic {
                    v.set_dynamic(true);
                }
                if *macro_flag {
                    v.set_macro(true);
                }
            }
            Ok(Ev::Val(var.clone()))
        }
        Ast::SetVar { var, expr } => {
            let value = eval_value(expr, env)?;
            if let Value::Var(v) = var {
                v.set_thread_binding(value.clone())?;
            }
            Ok(Ev::Val(value))
        }
        Ast::Throw { expr, .. } => {
            let v = eval_value(expr, env)?;
            Err(errors::throw_value(v))
        }
        Ast::Try {
            body,
            catches,
            finally,
        } => {
            let outcome = eval_value(body, env);
            let result = match outcome {
                Ok(v) => Ok(v),
                Err(err) if err.kind != sable_core::error::ErrorKind::StmRetry => {
                    let mut handled = None;
                    for catch in catches {
                        if errors::matches_class(&err, &catch.class_name) {
                            env.locals[catch.slot] = errors::error_to_value(&err);
                            handled = Some(eval_value(&catch.body, env));
                            break;
                        }
                    }
                    handled.unwrap_or(Err(err))
                }
                Err(err) => Err(err),
            };
            if let Some(finally) = finally {
                // Finally runs on both paths; its value is discarded
                eval_value(finally, env)?;
            }
            result.map(Ev::Val)
        }
        Ast::Case {
            expr,
            branches,
            default,
        } => {
            let v = eval_value(expr, env)?;
            for branch in branches {
                if branch
                    .tests
                    .iter()
                    .any(|t| sable_core::value_equals(t, &v))
                {
                    return eval(&branch.body, env);
                }
            }
            match default {
                Some(d) => eval(d, env),
                None => Err(SableError::value_err(format!(
                    "no matching case clause: {}",
                    sable_core::printer::pr_str(&v)
                ))),
            }
        }
    }
}

/// Evaluate in a non-tail position where recur cannot appear
fn eval_value(ast: &Ast, env: &mut Env<'_>) -> Result<Value, SableError> {
    match eval(ast, env)? {
        Ev::Val(v) => Ok(v),
        Ev::Recur(..) => Err(SableError::compile(
            "recur escaped its loop (analyzer invariant violated)",
        )),
    }
}

fn make_closure(proto: &Arc<FnProto>, env: &Env<'_>) -> Value {
    let captures: Vec<Value> = proto
        .captures
        .iter()
        .map(|src| match src {
            CaptureSource::Local(slot) => env.locals[*slot].clone(),
            CaptureSource::Upval(idx) => env.handle.captures[*idx].clone(),
        })
        .collect();
    let any_proto: Arc<dyn std::any::Any + Send + Sync> = proto.clone();
    gc::alloc(Value::Fn(Arc::new(FnHandle::new(
        proto.name.clone(),
        any_proto,
        captures.into_boxed_slice(),
    ))))
}
