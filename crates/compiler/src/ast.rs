//! Typed AST produced by the analyzer
//!
//! Locals are resolved to frame slot indices and closed-over names to
//! upvalue indices at analysis time; no runtime name lookup remains. Fn
//! prototypes carry both the AST bodies (tree-walking backend) and a
//! lazily compiled bytecode chunk per arity (VM backend).

use crate::bytecode::Chunk;
use sable_core::error::SourcePos;
use sable_core::value::Value;
use std::sync::{Arc, OnceLock};

/// Where a closure capture comes from at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    /// A local slot of the enclosing frame
    Local(usize),
    /// An upvalue of the enclosing closure
    Upval(usize),
}

/// One arity of a fn
#[derive(Debug)]
pub struct FnArity {
    /// Parameter names, for diagnostics
    pub params: Vec<Arc<str>>,
    /// Required positional count (variadic tail excluded)
    pub required: usize,
    pub variadic: bool,
    /// Local slot count for the frame (params first)
    pub slots: usize,
    pub body: Ast,
    /// Compiled on first VM invocation
    pub chunk: OnceLock<Arc<Chunk>>,
}

impl FnArity {
    /// Does a call with `argc` arguments land here?
    pub fn accepts(&self, argc: usize) -> bool {
        if self.variadic {
            argc >= self.required
        } else {
            argc == self.required
        }
    }
}

/// A fn prototype: one body per arity, at most one variadic
#[derive(Debug)]
pub struct FnProto {
    pub name: Option<Arc<str>>,
    pub arities: Vec<FnArity>,
    /// How to fill the capture array when the closure is created
    pub captures: Vec<CaptureSource>,
    pub pos: Option<SourcePos>,
}

impl FnProto {
    /// Select the arity for an argument count: exact fixed match first,
    /// then the variadic body.
    pub fn select_arity(&self, argc: usize) -> Option<&FnArity> {
        self.arities
            .iter()
            .find(|a| !a.variadic && a.required == argc)
            .or_else(|| self.arities.iter().find(|a| a.variadic && argc >= a.required))
    }

    /// Walk every constant value reachable from this prototype (GC tracing)
    pub fn trace(&self, visit: &mut dyn FnMut(&Value)) {
        for arity in &self.arities {
            arity.body.trace(visit);
            if let Some(chunk) = arity.chunk.get() {
                chunk.trace(visit);
            }
        }
    }
}

/// A try's catch clause, matched by class name
#[derive(Debug)]
pub struct CatchClause {
    pub class_name: String,
    /// Slot the thrown value binds to
    pub slot: usize,
    pub body: Ast,
}

/// One group of case tests sharing a body
#[derive(Debug)]
pub struct CaseBranch {
    pub tests: Vec<Value>,
    pub body: Ast,
}

/// The analyzed expression tree
#[derive(Debug)]
pub enum Ast {
    Const(Value),
    /// Lexical local, resolved to a frame slot
    Local(usize),
    /// Closed-over local, resolved to a capture index
    Upval(usize),
    /// The executing closure itself (named fn self-recursion)
    SelfRef,
    /// Deref of a namespace var at runtime
    VarRef(Value),
    /// The var object itself (`(var x)`)
    TheVar(Value),
    If {
        test: Box<Ast>,
        then: Box<Ast>,
        els: Box<Ast>,
    },
    Do(Vec<Ast>),
    Let {
        bindings: Vec<(usize, Ast)>,
        body: Box<Ast>,
    },
    Loop {
        bindings: Vec<(usize, Ast)>,
        body: Box<Ast>,
        first_slot: usize,
    },
    Recur {
        args: Vec<Ast>,
        /// First slot of the enclosing loop/fn frame being rebound
        first_slot: usize,
        pos: Option<SourcePos>,
    },
    Fn {
        proto: Arc<FnProto>,
    },
    Call {
        callee: Box<Ast>,
        args: Vec<Ast>,
        tail: bool,
        pos: Option<SourcePos>,
    },
    Def {
        var: Value,
        init: Option<Box<Ast>>,
        dynamic: bool,
        macro_flag: bool,
    },
    /// `set!` on a dynamic var's thread binding
    SetVar {
        var: Value,
        expr: Box<Ast>,
    },
    Throw {
        expr: Box<Ast>,
        pos: Option<SourcePos>,
    },
    Try {
        body: Box<Ast>,
        catches: Vec<CatchClause>,
        finally: Option<Box<Ast>>,
    },
    Case {
        expr: Box<Ast>,
        branches: Vec<CaseBranch>,
        default: Option<Box<Ast>>,
    },
}

impl Ast {
    /// Walk constant values embedded in the tree (GC tracing)
    pub fn trace(&self, visit: &mut dyn FnMut(&Value)) {
        match self {
            Ast::Const(v) => visit(v),
            Ast::Local(_) | Ast::Upval(_) | Ast::SelfRef => {}
            Ast::VarRef(v) | Ast::TheVar(v) => visit(v),
            Ast::If { test, then, els } => {
                test.trace(visit);
                then.trace(visit);
                els.trace(visit);
            }
            Ast::Do(items) => {
                for item in items {
                    item.trace(visit);
                }
            }
            Ast::Let { bindings, body } | Ast::Loop { bindings, body, .. } => {
                for (_, init) in bindings {
                    init.trace(visit);
                }
                body.trace(visit);
            }
            Ast::Recur { args, .. } => {
                for arg in args {
                    arg.trace(visit);
                }
            }
            Ast::Fn { proto } => proto.trace(visit),
            Ast::Call { callee, args, .. } => {
                callee.trace(visit);
                for arg in args {
                    arg.trace(visit);
                }
            }
            Ast::Def { var, init, .. } => {
                visit(var);
                if let Some(init) = init {
                    init.trace(visit);
                }
            }
            Ast::SetVar { var, expr } => {
                visit(var);
                expr.trace(visit);
            }
            Ast::Throw { expr, .. } => expr.trace(visit),
            Ast::Try {
                body,
                catches,
                finally,
            } => {
                body.trace(visit);
                for c in catches {
                    c.body.trace(visit);
                }
                if let Some(f) = finally {
                    f.trace(visit);
                }
            }
            Ast::Case {
                expr,
                branches,
                default,
            } => {
                expr.trace(visit);
                for b in branches {
                    for t in &b.tests {
                        visit(t);
                    }
                    b.body.trace(visit);
                }
                if let Some(d) = default {
                    d.trace(visit);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arity(required: usize, variadic: bool) -> FnArity {
        FnArity {
            params: vec![],
            required,
            variadic,
            slots: required,
            body: Ast::Const(Value::Nil),
            chunk: OnceLock::new(),
        }
    }

    #[test]
    fn test_select_arity_prefers_exact_match() {
        let proto = FnProto {
            name: None,
            arities: vec![arity(1, false), arity(2, false), arity(2, true)],
            captures: vec![],
            pos: None,
        };
        assert_eq!(proto.select_arity(1).unwrap().required, 1);
        let two = proto.select_arity(2).unwrap();
        assert!(!two.variadic);
        // Five args fall through to the variadic body
        let five = proto.select_arity(5).unwrap();
        assert!(five.variadic);
        assert!(proto.select_arity(0).is_none());
    }
}
