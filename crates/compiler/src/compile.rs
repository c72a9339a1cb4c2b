//! Single-pass compiler: AST → bytecode chunks
//!
//! Each fn arity compiles to one chunk. Nested fns compile eagerly and land
//! in the parent chunk's template table for `MakeFn`. `finally` bodies are
//! duplicated along the normal, catch, and unwind paths; tail calls inside
//! an active handler region degrade to plain calls so the handler stack
//! stays balanced.

use crate::ast::{Ast, CaptureSource, FnArity, FnProto};
use crate::bytecode::{Chunk, CodeBuf, ExcEntry, NO_CLASS, Op, disassemble};
use sable_core::cmp::value_equals;
use sable_core::error::SableError;
use sable_core::value::Value;
use std::sync::Arc;

/// Dense integer dispatch is used when every test is an int within a span
/// this wide
const MAX_INT_SPAN: i64 = 128;

/// Fast-path arithmetic: sable.core var name → opcode
const FAST_OPS: &[(&str, Op)] = &[
    ("+", Op::AddInt),
    ("-", Op::SubInt),
    ("*", Op::MulInt),
    ("<", Op::LtInt),
    ("<=", Op::LteInt),
    (">", Op::GtInt),
    (">=", Op::GteInt),
    ("==", Op::EqNum),
];

/// Compile every not-yet-compiled arity of a prototype (idempotent)
pub fn compile_proto(proto: &Arc<FnProto>) -> Result<(), SableError> {
    for arity in &proto.arities {
        if arity.chunk.get().is_some() {
            continue;
        }
        let chunk = compile_arity(proto, arity)?;
        let _ = arity.chunk.set(Arc::new(chunk));
    }
    Ok(())
}

/// Disassemble a prototype and (recursively) its nested templates
pub fn dump_proto(proto: &Arc<FnProto>) -> Result<String, SableError> {
    compile_proto(proto)?;
    let mut out = String::new();
    for arity in &proto.arities {
        let chunk = arity.chunk.get().expect("compiled above");
        out.push_str(&disassemble(chunk));
        for template in &chunk.fn_templates {
            out.push('\n');
            out.push_str(&dump_proto(template)?);
        }
    }
    Ok(out)
}

fn compile_arity(proto: &FnProto, arity: &FnArity) -> Result<Chunk, SableError> {
    let name: Arc<str> = match &proto.name {
        Some(n) => {
            if arity.variadic {
                Arc::from(format!("{}/[{}+]", n, arity.required).as_str())
            } else {
                Arc::from(format!("{}/[{}]", n, arity.required).as_str())
            }
        }
        None => Arc::from("anonymous"),
    };
    let mut c = Compiler {
        buf: CodeBuf::default(),
        consts: Vec::new(),
        fn_templates: Vec::new(),
        exc_table: Vec::new(),
        lines: Vec::new(),
        loop_entries: Vec::new(),
        handler_depth: 0,
        depth: 0,
        max_depth: 0,
        name: name.clone(),
    };

    // The arity body is itself a recur target
    c.emit(Op::LoopEntry, 0);
    c.loop_entries.push(c.buf.pc());
    c.compile(&arity.body)?;
    c.loop_entries.pop();
    c.emit(Op::Ret, -1);

    Ok(Chunk {
        code: c.buf.code,
        consts: c.consts,
        fn_templates: c.fn_templates,
        n_locals: arity.slots,
        max_stack: c.max_depth.max(4),
        exc_table: c.exc_table,
        lines: c.lines,
        name,
    })
}

struct Compiler {
    buf: CodeBuf,
    consts: Vec<Value>,
    fn_templates: Vec<Arc<FnProto>>,
    exc_table: Vec<ExcEntry>,
    lines: Vec<(usize, usize)>,
    /// Innermost-last loop entry pcs (fn body entry included)
    loop_entries: Vec<usize>,
    /// Open `PushHandler` regions; tail calls degrade while nonzero
    handler_depth: usize,
    depth: i64,
    max_depth: usize,
    name: Arc<str>,
}

impl Compiler {
    fn emit(&mut self, op: Op, effect: i64) {
        self.buf.op(op);
        self.bump(effect);
    }

    fn bump(&mut self, effect: i64) {
        self.depth = (self.depth + effect).max(0);
        self.max_depth = self.max_depth.max(self.depth as usize);
    }

    fn const_idx(&mut self, v: &Value) -> Result<u16, SableError> {
        if let Some(idx) = self.consts.iter().position(|c| value_equals(c, v)) {
            return Ok(idx as u16);
        }
        let idx = self.consts.len();
        if idx > u16::MAX as usize {
            return Err(SableError::compile(format!(
                "constant pool overflow in {}",
                self.name
            )));
        }
        self.consts.push(v.clone());
        Ok(idx as u16)
    }

    fn note_line(&mut self, pos: Option<sable_core::error::SourcePos>) {
        if let Some(pos) = pos {
            let line = pos.line + 1;
            if self.lines.last().map(|(_, l)| *l) != Some(line) {
                self.lines.push((self.buf.pc(), line));
            }
        }
    }

    fn compile(&mut self, ast: &Ast) -> Result<(), SableError> {
        match ast {
            Ast::Const(v) => self.compile_const(v)?,
            Ast::Local(slot) => {
                self.emit(Op::LoadLocal, 1);
                self.buf.u16(*slot as u16);
            }
            Ast::Upval(idx) => {
                self.emit(Op::LoadUpval, 1);
                self.buf.u16(*idx as u16);
            }
            Ast::SelfRef => self.emit(Op::LoadSelf, 1),
            Ast::VarRef(var) => {
                let idx = self.const_idx(var)?;
                self.emit(Op::LoadVar, 1);
                self.buf.u16(idx);
            }
            Ast::TheVar(var) => {
                let idx = self.const_idx(var)?;
                self.emit(Op::Const, 1);
                self.buf.u16(idx);
            }
            Ast::If { test, then, els } => {
                self.compile(test)?;
                self.emit(Op::JumpIfFalse, -1);
                let to_else = self.buf.jump_site();
                self.compile(then)?;
                self.emit(Op::Jump, 0);
                let to_end = self.buf.jump_site();
                let else_target = self.buf.pc();
                self.buf.patch_jump(to_else, else_target);
                // Both branches leave one value; the simulator sees them
                // sequentially, so compensate for the then-branch's push
                self.bump(-1);
                self.compile(els)?;
                let end = self.buf.pc();
                self.buf.patch_jump(to_end, end);
            }
            Ast::Do(items) => {
                if items.is_empty() {
                    self.emit(Op::Nil, 1);
                } else {
                    for (i, item) in items.iter().enumerate() {
                        self.compile(item)?;
                        if i < items.len() - 1 {
                            self.emit(Op::Pop, -1);
                        }
                    }
                }
            }
            Ast::Let { bindings, body } => {
                for (slot, init) in bindings {
                    self.compile(init)?;
                    self.emit(Op::StoreLocal, -1);
                    self.buf.u16(*slot as u16);
                }
                self.compile(body)?;
            }
            Ast::Loop {
                bindings,
                body,
                first_slot: _,
            } => {
                for (slot, init) in bindings {
                    self.compile(init)?;
                    self.emit(Op::StoreLocal, -1);
                    self.buf.u16(*slot as u16);
                }
                self.emit(Op::LoopEntry, 0);
                self.loop_entries.push(self.buf.pc());
                self.compile(body)?;
                self.loop_entries.pop();
            }
            Ast::Recur {
                args,
                first_slot,
                pos,
            } => {
                self.note_line(*pos);
                for arg in args {
                    self.compile(arg)?;
                }
                let entry = *self
                    .loop_entries
                    .last()
                    .expect("recur validated by the analyzer");
                self.emit(Op::Recur, -(args.len() as i64));
                self.buf.u16(*first_slot as u16);
                self.buf.u8(args.len() as u8);
                let off = self.buf.back_offset(entry);
                self.buf.i16(off);
                // The jump never falls through; leave a value for the simulator
                self.bump(1);
            }
            Ast::Fn { proto } => {
                compile_proto(proto)?;
                let idx = self.fn_templates.len();
                if idx > u16::MAX as usize {
                    return Err(SableError::compile("fn template table overflow"));
                }
                self.fn_templates.push(proto.clone());
                self.emit(Op::MakeFn, 1);
                self.buf.u16(idx as u16);
                self.buf.u8(proto.captures.len() as u8);
                for cap in &proto.captures {
                    match cap {
                        CaptureSource::Local(slot) => {
                            self.buf.u8(0);
                            self.buf.u16(*slot as u16);
                        }
                        CaptureSource::Upval(i) => {
                            self.buf.u8(1);
                            self.buf.u16(*i as u16);
                        }
                    }
                }
            }
            Ast::Call {
                callee,
                args,
                tail,
                pos,
            } => self.compile_call(callee, args, *tail, *pos)?,
            Ast::Def {
                var,
                init,
                dynamic,
                macro_flag,
            } => {
                let has_init = init.is_some();
                if let Some(init) = init {
                    self.compile(init)?;
                }
                let idx = self.const_idx(var)?;
                let mut flags = 0u8;
                if *dynamic {
                    flags |= 1;
                }
                if *macro_flag {
                    flags |= 2;
                }
                if has_init {
                    flags |= 4;
                }
                self.emit(Op::DefVar, if has_init { 0 } else { 1 });
                self.buf.u16(idx);
                self.buf.u8(flags);
            }
            Ast::SetVar { var, expr } => {
                self.compile(expr)?;
                let idx = self.const_idx(var)?;
                self.emit(Op::SetVar, 0);
                self.buf.u16(idx);
            }
            Ast::Throw { expr, pos } => {
                self.note_line(*pos);
                self.compile(expr)?;
                self.emit(Op::Throw, -1);
                // Unwinds; keep the simulator's one-value invariant
                self.bump(1);
            }
            Ast::Try {
                body,
                catches,
                finally,
            } => self.compile_try(body, catches, finally.as_deref())?,
            Ast::Case {
                expr,
                branches,
                default,
            } => self.compile_case(expr, branches, default.as_deref())?,
        }
        Ok(())
    }

    fn compile_const(&mut self, v: &Value) -> Result<(), SableError> {
        match v {
            Value::Nil => self.emit(Op::Nil, 1),
            Value::Bool(true) => self.emit(Op::True, 1),
            Value::Bool(false) => self.emit(Op::False, 1),
            other => {
                let idx = self.const_idx(other)?;
                self.emit(Op::Const, 1);
                self.buf.u16(idx);
            }
        }
        Ok(())
    }

    fn compile_call(
        &mut self,
        callee: &Ast,
        args: &[Ast],
        tail: bool,
        pos: Option<sable_core::error::SourcePos>,
    ) -> Result<(), SableError> {
        self.note_line(pos);

        // (:kw m), (:kw m default)
        if let Ast::Const(Value::Keyword(_)) = callee {
            if (1..=2).contains(&args.len()) {
                let Ast::Const(kw) = callee else { unreachable!() };
                let idx = self.const_idx(kw)?;
                for arg in args {
                    self.compile(arg)?;
                }
                self.emit(Op::KeywordInvoke, -(args.len() as i64) + 1);
                self.buf.u16(idx);
                self.buf.u8(args.len() as u8);
                return Ok(());
            }
        }

        if let Ast::VarRef(var_value) = callee {
            if let Value::Var(var) = var_value {
                if &*var.ns == "sable.core" {
                    // Integer fast paths with builtin fallback
                    if args.len() == 2 {
                        if let Some((_, op)) =
                            FAST_OPS.iter().find(|(n, _)| *n == &*var.name)
                        {
                            self.compile(&args[0])?;
                            self.compile(&args[1])?;
                            let idx = self.const_idx(var_value)?;
                            self.emit(*op, -1);
                            self.buf.u16(idx);
                            return Ok(());
                        }
                    }
                    // (apply f a b coll) spreads on the VM stack
                    if &*var.name == "apply" && args.len() >= 2 {
                        for arg in args {
                            self.compile(arg)?;
                        }
                        self.emit(Op::Apply, -(args.len() as i64) + 1);
                        self.buf.u8(args.len() as u8);
                        return Ok(());
                    }
                }
            }
        }

        for arg in args {
            self.compile(arg)?;
        }
        self.compile(callee)?;
        let op = if tail && self.handler_depth == 0 {
            Op::TailCall
        } else {
            Op::Call
        };
        self.emit(op, -(args.len() as i64));
        self.buf.u8(args.len() as u8);
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &Ast,
        catches: &[crate::ast::CatchClause],
        finally: Option<&Ast>,
    ) -> Result<(), SableError> {
        let has_fin = finally.is_some();
        let mut fin_site = None;
        if has_fin {
            self.emit(Op::PushHandler, 0);
            self.buf.u16(NO_CLASS);
            fin_site = Some(self.buf.jump_site());
            self.handler_depth += 1;
        }
        // First clause matches first, so it is pushed last (innermost)
        let mut catch_sites = Vec::new();
        for catch in catches.iter().rev() {
            let class_idx = self.const_idx(&Value::string(&catch.class_name))?;
            self.emit(Op::PushHandler, 0);
            self.buf.u16(class_idx);
            catch_sites.push((catch, self.buf.jump_site()));
            self.handler_depth += 1;
        }
        catch_sites.reverse();

        let body_start = self.buf.pc();
        self.compile(body)?;
        let body_end = self.buf.pc();

        for _ in catches {
            self.emit(Op::PopHandler, 0);
            self.handler_depth -= 1;
        }
        if has_fin {
            self.emit(Op::PopHandler, 0);
            self.handler_depth -= 1;
            self.compile(finally.unwrap())?;
            self.emit(Op::Pop, -1);
        }
        self.emit(Op::Jump, 0);
        let mut end_sites = vec![self.buf.jump_site()];
        self.bump(-1); // each alternative path re-pushes one value

        for (catch, site) in catch_sites {
            let handler_pc = self.buf.pc();
            self.buf.patch_jump(site, handler_pc);
            self.exc_table.push(ExcEntry {
                start: body_start,
                end: body_end,
                handler_pc,
                class: Some(catch.class_name.clone()),
            });
            // Unwind pushed the thrown value
            self.bump(1);
            self.emit(Op::StoreLocal, -1);
            self.buf.u16(catch.slot as u16);
            self.compile(&catch.body)?;
            if has_fin {
                self.emit(Op::PopHandler, 0);
                self.compile(finally.unwrap())?;
                self.emit(Op::Pop, -1);
            }
            self.emit(Op::Jump, 0);
            end_sites.push(self.buf.jump_site());
            self.bump(-1);
        }

        if let Some(site) = fin_site {
            let handler_pc = self.buf.pc();
            self.buf.patch_jump(site, handler_pc);
            self.exc_table.push(ExcEntry {
                start: body_start,
                end: body_end,
                handler_pc,
                class: None,
            });
            // Discard the pushed thrown value, run finally, re-raise
            self.bump(1);
            self.emit(Op::Pop, -1);
            self.compile(finally.unwrap())?;
            self.emit(Op::Pop, -1);
            self.emit(Op::Rethrow, 0);
        }

        let end = self.buf.pc();
        for site in end_sites {
            self.buf.patch_jump(site, end);
        }
        self.bump(1);
        Ok(())
    }

    fn compile_case(
        &mut self,
        expr: &Ast,
        branches: &[crate::ast::CaseBranch],
        default: Option<&Ast>,
    ) -> Result<(), SableError> {
        self.compile(expr)?;

        // Dense integer dispatch when every test is an int in a small span
        let all_ints: Option<Vec<i64>> = branches
            .iter()
            .flat_map(|b| b.tests.iter())
            .map(|t| match t {
                Value::Int(n) => Some(*n),
                _ => None,
            })
            .collect();
        let dense = match &all_ints {
            Some(ints) if !ints.is_empty() => {
                let min = *ints.iter().min().expect("nonempty");
                let max = *ints.iter().max().expect("nonempty");
                let span = max - min + 1;
                if span <= MAX_INT_SPAN && i32::try_from(min).is_ok() {
                    Some((min, span as usize))
                } else {
                    None
                }
            }
            _ => None,
        };

        // Operand layouts place every offset relative to the end of the
        // whole instruction block
        let mut branch_offset_sites: Vec<(usize, usize)> = Vec::new(); // (site, branch idx)
        let default_site;
        let block_end;

        if let Some((min, span)) = dense {
            self.emit(Op::CaseInt, -1);
            self.buf.i32(min as i32);
            self.buf.u16(span as u16);
            let table_start = self.buf.pc();
            for _ in 0..span {
                self.buf.i16(i16::MIN); // gap → default
            }
            default_site = self.buf.pc();
            self.buf.i16(0);
            block_end = self.buf.pc();

            for (bi, branch) in branches.iter().enumerate() {
                for test in &branch.tests {
                    let Value::Int(n) = test else { unreachable!() };
                    let slot = (n - min) as usize;
                    branch_offset_sites.push((table_start + slot * 2, bi));
                }
            }
        } else {
            let tests: Vec<(u16, usize)> = {
                let mut out = Vec::new();
                for (bi, branch) in branches.iter().enumerate() {
                    for test in &branch.tests {
                        out.push((self.const_idx(test)?, bi));
                    }
                }
                out
            };
            self.emit(Op::CaseHash, -1);
            self.buf.u16(tests.len() as u16);
            let mut entry_sites = Vec::new();
            for (const_idx, bi) in &tests {
                self.buf.u16(*const_idx);
                entry_sites.push((self.buf.pc(), *bi));
                self.buf.i16(0);
            }
            default_site = self.buf.pc();
            self.buf.i16(0);
            block_end = self.buf.pc();
            branch_offset_sites = entry_sites;
        }

        // Branch bodies
        let mut branch_pcs = Vec::new();
        let mut end_sites = Vec::new();
        for branch in branches {
            branch_pcs.push(self.buf.pc());
            self.compile(&branch.body)?;
            self.emit(Op::Jump, 0);
            end_sites.push(self.buf.jump_site());
            self.bump(-1);
        }

        let default_pc = self.buf.pc();
        match default {
            Some(d) => self.compile(d)?,
            None => {
                // No matching clause: value error
                self.emit(Op::Const, 1);
                let idx = self.const_idx(&Value::string("no matching case clause"))?;
                self.buf.u16(idx);
                self.emit(Op::Throw, -1);
                self.bump(1);
            }
        }
        let end = self.buf.pc();
        for site in end_sites {
            self.buf.patch_jump(site, end);
        }

        // Patch dispatch offsets (base = end of operand block)
        let patch = |code: &mut Vec<u8>, site: usize, target: usize| {
            let off = i16::try_from(target as i64 - block_end as i64)
                .expect("case offset exceeds i16 range");
            code[site..site + 2].copy_from_slice(&off.to_le_bytes());
        };
        for (site, bi) in branch_offset_sites {
            patch(&mut self.buf.code, site, branch_pcs[bi]);
        }
        patch(&mut self.buf.code, default_site, default_pc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{AnalyzerHost, analyze_top};
    use crate::reader::{NullReaderHost, read_one};
    use sable_core::refs::Var;
    use sable_core::symbol::Symbol;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct TestHost {
        vars: Mutex<HashMap<String, Value>>,
    }

    impl TestHost {
        fn new() -> TestHost {
            let h = TestHost {
                vars: Mutex::new(HashMap::new()),
            };
            for name in ["+", "-", "*", "<", "apply", "vector", "hash-map", "hash-set", "conj"] {
                h.intern(name);
            }
            h
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
        fn resolve_var(
            &self,
            sym: &Symbol,
        ) -> Result<Option<Value>, SableError> {
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

    fn compile_str(src: &str) -> Arc<Chunk> {
        let form = read_one(src, &NullReaderHost).unwrap().unwrap();
        let proto = analyze_top(&form, &TestHost::new()).unwrap();
        compile_proto(&proto).unwrap();
        proto.arities[0].chunk.get().unwrap().clone()
    }

    #[test]
    fn test_constant_compiles_to_const_ret() {
        let chunk = compile_str("42");
        assert_eq!(chunk.code[0], Op::LoopEntry as u8);
        assert_eq!(chunk.code[1], Op::Const as u8);
        assert!(matches!(chunk.consts[0], Value::Int(42)));
        assert_eq!(*chunk.code.last().unwrap(), Op::Ret as u8);
    }

    #[test]
    fn test_fast_path_add() {
        let chunk = compile_str("(+ 1 2)");
        assert!(chunk.code.contains(&(Op::AddInt as u8)));
    }

    #[test]
    fn test_if_produces_conditional_jumps() {
        let chunk = compile_str("(if true 1 2)");
        assert!(chunk.code.contains(&(Op::JumpIfFalse as u8)));
        assert!(chunk.code.contains(&(Op::Jump as u8)));
    }

    #[test]
    fn test_let_stores_locals() {
        let chunk = compile_str("(let* [a 1] a)");
        assert!(chunk.code.contains(&(Op::StoreLocal as u8)));
        assert_eq!(chunk.n_locals, 1);
    }

    #[test]
    fn test_loop_recur_round_trip() {
        let chunk = compile_str("(loop* [i 0] (if (< i 3) (recur (+ i 1)) i))");
        assert!(chunk.code.contains(&(Op::Recur as u8)));
    }

    #[test]
    fn test_nested_fn_becomes_template() {
        let chunk = compile_str("(fn* [x] x)");
        assert_eq!(chunk.fn_templates.len(), 1);
        let inner = chunk.fn_templates[0].arities[0].chunk.get().unwrap();
        assert_eq!(inner.n_locals, 1);
    }

    #[test]
    fn test_try_emits_handler_table() {
        let chunk = compile_str("(try 1 (catch Exception e 2))");
        assert_eq!(chunk.exc_table.len(), 1);
        assert_eq!(chunk.exc_table[0].class.as_deref(), Some("Exception"));
        assert!(chunk.code.contains(&(Op::PushHandler as u8)));
        assert!(chunk.code.contains(&(Op::PopHandler as u8)));
    }

    #[test]
    fn test_finally_duplicated_on_both_paths() {
        let chunk = compile_str("(try 1 (finally 9))");
        // The 9 constant appears once in the pool but is loaded on two paths
        let const_loads = chunk
            .code
            .iter()
            .filter(|b| **b == Op::Const as u8)
            .count();
        assert!(const_loads >= 2);
        assert!(chunk.code.contains(&(Op::Rethrow as u8)));
        assert_eq!(chunk.exc_table.len(), 1);
        assert!(chunk.exc_table[0].class.is_none());
    }

    #[test]
    fn test_dense_int_case() {
        let chunk = compile_str("(case* 2 [[[1 2] :small] [[9] :big]] :other)");
        assert!(chunk.code.contains(&(Op::CaseInt as u8)));
    }

    #[test]
    fn test_keyword_case_uses_hash_dispatch() {
        let chunk = compile_str("(case* :b [[[:a] 1] [[:b] 2]] 0)");
        assert!(chunk.code.contains(&(Op::CaseHash as u8)));
    }

    #[test]
    fn test_keyword_invoke_emission() {
        let chunk = compile_str("(:k {:k 1})");
        assert!(chunk.code.contains(&(Op::KeywordInvoke as u8)));
    }

    #[test]
    fn test_dump_renders_every_instruction() {
        let form = read_one("(fn* [x] (if x 1 2))", &NullReaderHost)
            .unwrap()
            .unwrap();
        let proto = analyze_top(&form, &TestHost::new()).unwrap();
        let dump = dump_proto(&proto).unwrap();
        assert!(dump.contains("make_fn"));
        assert!(dump.contains("jmp_if_false"));
    }
}
