//! The bytecode virtual machine
//!
//! One dispatch loop over the top frame's opcode stream. Frames share a
//! single operand stack (per-frame bases); exception handlers live on the
//! frame that pushed them; unwinding walks handler stacks innermost-first
//! and consults the class matcher. Each OS thread keeps a pool of VM
//! instances so native code calling back into bytecode (reduce and friends)
//! reuses a warm stack instead of allocating a fresh interpreter.

use crate::errors;
use crate::{call, gc_roots, interrupt};
use sable_core::error::{ErrorKind, SableError};
use sable_core::fns::FnHandle;
use sable_core::gc;
use sable_core::list::PersistentList;
use sable_core::value::Value;
use sable_compiler::ast::{FnArity, FnProto};
use sable_compiler::bytecode::{Chunk, NO_CLASS, Op};
use std::cell::RefCell;
use std::sync::Arc;

struct Handler {
    /// Absolute operand-stack length at push time
    sp: usize,
    target: usize,
    /// None matches anything (finally and catch-all)
    class: Option<String>,
}

struct Frame {
    handle: Arc<FnHandle>,
    chunk: Arc<Chunk>,
    locals: Vec<Value>,
    pc: usize,
    base: usize,
    handlers: Vec<Handler>,
}

#[derive(Default)]
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
}

thread_local! {
    /// Reusable VM instances for native→bytecode bridge calls
    static VM_POOL: RefCell<Vec<Vm>> = const { RefCell::new(Vec::new()) };

    /// Exception being unwound, for `Rethrow` after a finally block
    static PENDING: RefCell<Option<SableError>> = const { RefCell::new(None) };
}

/// Run one arity of a user fn to completion on this thread's pooled VM
pub fn run_fn(
    handle: &Arc<FnHandle>,
    proto: &Arc<FnProto>,
    arity: &FnArity,
    locals: Vec<Value>,
) -> Result<Value, SableError> {
    sable_compiler::compile::compile_proto(proto)?;
    let chunk = arity.chunk.get().expect("compiled above").clone();

    let mut vm = VM_POOL
        .with(|pool| pool.borrow_mut().pop())
        .unwrap_or_default();
    vm.frames.push(Frame {
        handle: handle.clone(),
        chunk,
        locals,
        pc: 0,
        base: 0,
        handlers: Vec::new(),
    });
    let result = vm.run();
    vm.stack.clear();
    vm.frames.clear();
    VM_POOL.with(|pool| pool.borrow_mut().push(vm));
    result
}

/// Trace the in-flight exception payload (GC root scanning)
pub fn trace_pending(visit: &mut dyn FnMut(&Value)) {
    PENDING.with(|p| {
        if let Some(err) = &*p.borrow() {
            if let Some(payload) = &err.payload {
                visit(payload);
            }
            if let Some(data) = &err.data {
                visit(data);
            }
        }
    });
}

enum Step {
    Continue,
    Return(Value),
}

impl Vm {
    fn run(&mut self) -> Result<Value, SableError> {
        let mut ticks: u32 = 0;
        loop {
            ticks = ticks.wrapping_add(1);
            if ticks & 0xFF == 0 {
                // Safe point: interrupts and GC between instructions
                if interrupt::take() {
                    match self.unwind(SableError::interrupted()) {
                        Ok(()) => continue,
                        Err(e) => return Err(e),
                    }
                }
                if gc::heap().should_collect() {
                    self.collect_garbage();
                }
            }
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Return(v)) => return Ok(v),
                Err(e) => self.unwind(e)?,
            }
        }
    }

    /// Mark-sweep with this VM's frames as extra roots
    fn collect_garbage(&self) {
        let stack = &self.stack;
        let frames = &self.frames;
        gc::heap().collect(&|visit| {
            for v in stack.iter() {
                visit(v);
            }
            for frame in frames.iter() {
                for v in frame.locals.iter() {
                    visit(v);
                }
                visit(&Value::Fn(frame.handle.clone()));
            }
            gc_roots::visit_thread_roots(visit);
        });
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn step(&mut self) -> Result<Step, SableError> {
        let (chunk, pc) = {
            let frame = self.frames.last().expect("no frame");
            (frame.chunk.clone(), frame.pc)
        };
        let op = match Op::from_u8(chunk.code[pc]) {
            Some(op) => op,
            // Corrupted bytecode is a fatal invariant violation
            None => panic!("unknown opcode {:#x} at pc {}", chunk.code[pc], pc),
        };
        let mut next_pc = pc + 1;

        macro_rules! frame_mut {
            () => {
                self.frames.last_mut().expect("no frame")
            };
        }

        match op {
            Op::Const => {
                let idx = chunk.read_u16(next_pc);
                next_pc += 2;
                self.stack.push(chunk.consts[idx as usize].clone());
            }
            Op::Nil => self.stack.push(Value::Nil),
            Op::True => self.stack.push(Value::Bool(true)),
            Op::False => self.stack.push(Value::Bool(false)),
            Op::Pop => {
                self.pop();
            }
            Op::Dup => {
                let top = self.stack.last().expect("operand stack underflow").clone();
                self.stack.push(top);
            }
            Op::LoadLocal => {
                let slot = chunk.read_u16(next_pc) as usize;
                next_pc += 2;
                let v = frame_mut!().locals[slot].clone();
                self.stack.push(v);
            }
            Op::StoreLocal => {
                let slot = chunk.read_u16(next_pc) as usize;
                next_pc += 2;
                let v = self.pop();
                frame_mut!().locals[slot] = v;
            }
            Op::LoadUpval => {
                let idx = chunk.read_u16(next_pc) as usize;
                next_pc += 2;
                let v = frame_mut!().handle.captures[idx].clone();
                self.stack.push(v);
            }
            Op::LoadSelf => {
                let handle = frame_mut!().handle.clone();
                self.stack.push(Value::Fn(handle));
            }
            Op::LoadVar => {
                let idx = chunk.read_u16(next_pc);
                next_pc += 2;
                match &chunk.consts[idx as usize] {
                    Value::Var(var) => self.stack.push(var.deref()?),
                    other => panic!("load_var constant is {}", other.type_name()),
                }
            }
            Op::SetVar => {
                let idx = chunk.read_u16(next_pc);
                next_pc += 2;
                let v = self.pop();
                match &chunk.consts[idx as usize] {
                    Value::Var(var) => var.set_thread_binding(v.clone())?,
                    other => panic!("set_var constant is {}", other.type_name()),
                }
                self.stack.push(v);
            }
            Op::DefVar => {
                let idx = chunk.read_u16(next_pc);
                let flags = chunk.read_u8(next_pc + 2);
                next_pc += 3;
                let var_value = chunk.consts[idx as usize].clone();
                match &var_value {
                    Value::Var(var) => {
                        if flags & 4 != 0 {
                            let init = self.pop();
                            var.bind_root(init);
                        }
                        if flags & 1 != 0 {
                            var.set_dynamic(true);
                        }
                        if flags & 2 != 0 {
                            var.set_macro(true);
                        }
                    }
                    other => panic!("def_var constant is {}", other.type_name()),
                }
                self.stack.push(var_value);
            }
            Op::Jump => {
                let off = chunk.read_i16(next_pc);
                next_pc = offset_pc(next_pc + 2, off);
            }
            Op::JumpIfFalse => {
                let off = chunk.read_i16(next_pc);
                let after = next_pc + 2;
                let v = self.pop();
                next_pc = if v.is_truthy() { after } else { offset_pc(after, off) };
            }
            Op::JumpIfTrue => {
                let off = chunk.read_i16(next_pc);
                let after = next_pc + 2;
                let v = self.pop();
                next_pc = if v.is_truthy() { offset_pc(after, off) } else { after };
            }
            Op::LoopEntry => {}
            Op::Recur => {
                let first_slot = chunk.read_u16(next_pc) as usize;
                let n = chunk.read_u8(next_pc + 2) as usize;
                let off = chunk.read_i16(next_pc + 3);
                let after = next_pc + 5;
                let start = self.stack.len() - n;
                let args: Vec<Value> = self.stack.drain(start..).collect();
                let frame = frame_mut!();
                for (i, arg) in args.into_iter().enumerate() {
                    frame.locals[first_slot + i] = arg;
                }
                next_pc = offset_pc(after, off);
            }
            Op::Call => {
                let n = chunk.read_u8(next_pc) as usize;
                next_pc += 1;
                frame_mut!().pc = next_pc;
                let callee = self.pop();
                let start = self.stack.len() - n;
                let args: Vec<Value> = self.stack.drain(start..).collect();
                self.invoke(callee, args)?;
                return Ok(Step::Continue);
            }
            Op::TailCall => {
                let n = chunk.read_u8(next_pc) as usize;
                next_pc += 1;
                frame_mut!().pc = next_pc;
                let callee = self.pop();
                let start = self.stack.len() - n;
                let args: Vec<Value> = self.stack.drain(start..).collect();
                // The caller's frame is replaced, not stacked
                let frame = self.frames.pop().expect("no frame");
                self.stack.truncate(frame.base);
                if let Some(v) = self.invoke_tail(callee, args)? {
                    if self.frames.is_empty() {
                        return Ok(Step::Return(v));
                    }
                    self.stack.push(v);
                }
                return Ok(Step::Continue);
            }
            Op::Apply => {
                let n = chunk.read_u8(next_pc) as usize;
                next_pc += 1;
                frame_mut!().pc = next_pc;
                let start = self.stack.len() - n;
                let items: Vec<Value> = self.stack.drain(start..).collect();
                let (f, args) = call::spread_args(&items)?;
                self.invoke(f, args)?;
                return Ok(Step::Continue);
            }
            Op::MakeFn => {
                let idx = chunk.read_u16(next_pc) as usize;
                let n_caps = chunk.read_u8(next_pc + 2) as usize;
                let mut at = next_pc + 3;
                let proto = chunk.fn_templates[idx].clone();
                let mut captures = Vec::with_capacity(n_caps);
                {
                    let frame = self.frames.last().expect("no frame");
                    for _ in 0..n_caps {
                        let kind = chunk.read_u8(at);
                        let src = chunk.read_u16(at + 1) as usize;
                        at += 3;
                        captures.push(match kind {
                            0 => frame.locals[src].clone(),
                            1 => frame.handle.captures[src].clone(),
                            other => panic!("unknown capture kind {}", other),
                        });
                    }
                }
                next_pc = at;
                let name = proto.name.clone();
                let any_proto: Arc<dyn std::any::Any + Send + Sync> = proto;
                let handle = FnHandle::new(name, any_proto, captures.into_boxed_slice());
                self.stack
                    .push(gc::alloc(Value::Fn(Arc::new(handle))));
            }
            Op::Throw => {
                frame_mut!().pc = next_pc;
                let v = self.pop();
                return Err(errors::throw_value(v));
            }
            Op::Rethrow => {
                let pending = PENDING.with(|p| p.borrow_mut().take());
                return Err(pending.unwrap_or_else(|| {
                    SableError::value_err("rethrow without a pending exception")
                }));
            }
            Op::PushHandler => {
                let class_idx = chunk.read_u16(next_pc);
                let off = chunk.read_i16(next_pc + 2);
                let after = next_pc + 4;
                next_pc = after;
                let class = if class_idx == NO_CLASS {
                    None
                } else {
                    match &chunk.consts[class_idx as usize] {
                        Value::Str(s) => Some(s.to_string()),
                        other => panic!("handler class constant is {}", other.type_name()),
                    }
                };
                let sp = self.stack.len();
                frame_mut!().handlers.push(Handler {
                    sp,
                    target: offset_pc(after, off),
                    class,
                });
            }
            Op::PopHandler => {
                frame_mut!().handlers.pop();
            }
            Op::KeywordInvoke => {
                let idx = chunk.read_u16(next_pc);
                let argc = chunk.read_u8(next_pc + 2) as usize;
                next_pc += 3;
                frame_mut!().pc = next_pc;
                let start = self.stack.len() - argc;
                let args: Vec<Value> = self.stack.drain(start..).collect();
                let kw = chunk.consts[idx as usize].clone();
                let result = call::call_value(&kw, &args)?;
                self.stack.push(result);
            }
            Op::CaseInt => {
                let min = chunk.read_i32(next_pc) as i64;
                let count = chunk.read_u16(next_pc + 4) as usize;
                let table = next_pc + 6;
                let default_at = table + count * 2;
                let block_end = default_at + 2;
                let v = self.pop();
                let off = match v {
                    Value::Int(n) if n >= min && n < min + count as i64 => {
                        let entry = chunk.read_i16(table + (n - min) as usize * 2);
                        if entry == i16::MIN {
                            chunk.read_i16(default_at)
                        } else {
                            entry
                        }
                    }
                    _ => chunk.read_i16(default_at),
                };
                next_pc = offset_pc(block_end, off);
            }
            Op::CaseHash => {
                let count = chunk.read_u16(next_pc) as usize;
                let entries = next_pc + 2;
                let default_at = entries + count * 4;
                let block_end = default_at + 2;
                let v = self.pop();
                let v_hash = sable_core::value_hash(&v);
                let mut off = chunk.read_i16(default_at);
                for i in 0..count {
                    let const_idx = chunk.read_u16(entries + i * 4) as usize;
                    let candidate = &chunk.consts[const_idx];
                    if sable_core::value_hash(candidate) == v_hash
                        && sable_core::value_equals(candidate, &v)
                    {
                        off = chunk.read_i16(entries + i * 4 + 2);
                        break;
                    }
                }
                next_pc = offset_pc(block_end, off);
            }
            Op::Ret => {
                let result = self.pop();
                let frame = self.frames.pop().expect("no frame");
                self.stack.truncate(frame.base);
                if self.frames.is_empty() {
                    return Ok(Step::Return(result));
                }
                self.stack.push(result);
                return Ok(Step::Continue);
            }
            Op::AddInt | Op::SubInt | Op::MulInt | Op::LtInt | Op::LteInt | Op::GtInt
            | Op::GteInt | Op::EqNum => {
                let idx = chunk.read_u16(next_pc);
                next_pc += 2;
                frame_mut!().pc = next_pc;
                let b = self.pop();
                let a = self.pop();
                let fast = match (op, &a, &b) {
                    (Op::AddInt, Value::Int(x), Value::Int(y)) => {
                        x.checked_add(*y).map(Value::Int)
                    }
                    (Op::SubInt, Value::Int(x), Value::Int(y)) => {
                        x.checked_sub(*y).map(Value::Int)
                    }
                    (Op::MulInt, Value::Int(x), Value::Int(y)) => {
                        x.checked_mul(*y).map(Value::Int)
                    }
                    (Op::LtInt, Value::Int(x), Value::Int(y)) => Some(Value::Bool(x < y)),
                    (Op::LteInt, Value::Int(x), Value::Int(y)) => Some(Value::Bool(x <= y)),
                    (Op::GtInt, Value::Int(x), Value::Int(y)) => Some(Value::Bool(x > y)),
                    (Op::GteInt, Value::Int(x), Value::Int(y)) => Some(Value::Bool(x >= y)),
                    (Op::EqNum, Value::Int(x), Value::Int(y)) => Some(Value::Bool(x == y)),
                    _ => None,
                };
                match fast {
                    Some(v) => self.stack.push(v),
                    None => {
                        // Overflow or non-int operands: builtin fallback
                        let f = match &chunk.consts[idx as usize] {
                            Value::Var(var) => var.deref()?,
                            other => panic!("fast-path constant is {}", other.type_name()),
                        };
                        let result = call::call_value(&f, &[a, b])?;
                        self.stack.push(result);
                    }
                }
            }
        }

        self.frames.last_mut().expect("no frame").pc = next_pc;
        Ok(Step::Continue)
    }

    /// Dispatch a call: bytecode fns push a frame, everything else goes
    /// through the shared dispatcher
    fn invoke(&mut self, callee: Value, args: Vec<Value>) -> Result<(), SableError> {
        match callee {
            Value::Fn(handle) => self.push_fn_frame(handle, args),
            other => {
                let result = call::call_value(&other, &args)?;
                self.stack.push(result);
                Ok(())
            }
        }
    }

    /// Like `invoke` after the caller's frame is gone; returns a value for
    /// non-frame callees
    fn invoke_tail(
        &mut self,
        callee: Value,
        args: Vec<Value>,
    ) -> Result<Option<Value>, SableError> {
        match callee {
            Value::Fn(handle) => {
                self.push_fn_frame(handle, args)?;
                Ok(None)
            }
            other => Ok(Some(call::call_value(&other, &args)?)),
        }
    }

    fn push_fn_frame(&mut self, handle: Arc<FnHandle>, args: Vec<Value>) -> Result<(), SableError> {
        let proto = handle
            .proto
            .clone()
            .downcast::<FnProto>()
            .map_err(|_| SableError::type_err("corrupt fn prototype"))?;
        sable_compiler::compile::compile_proto(&proto)?;
        let arity = proto.select_arity(args.len()).ok_or_else(|| {
            SableError::arity(handle.name.as_deref().unwrap_or("anonymous"), args.len())
        })?;

        let mut locals =
            vec![Value::Nil; arity.slots.max(arity.required + usize::from(arity.variadic))];
        locals[..arity.required].clone_from_slice(&args[..arity.required]);
        if arity.variadic {
            let rest = &args[arity.required..];
            locals[arity.required] = if rest.is_empty() {
                Value::Nil
            } else {
                Value::List(Arc::new(PersistentList::from_values(rest.to_vec())))
            };
        }
        let chunk = arity.chunk.get().expect("compiled above").clone();
        let base = self.stack.len();
        self.frames.push(Frame {
            handle,
            chunk,
            locals,
            pc: 0,
            base,
            handlers: Vec::new(),
        });
        Ok(())
    }

    /// Walk handler stacks innermost-first; uncaught errors accumulate a
    /// frame trace and propagate
    fn unwind(&mut self, mut err: SableError) -> Result<(), SableError> {
        // The internal STM conflict signal is never caught by user handlers
        let catchable = err.kind != ErrorKind::StmRetry;
        while !self.frames.is_empty() {
            if catchable {
                let matched = {
                    let frame = self.frames.last_mut().expect("nonempty");
                    let mut found = None;
                    while let Some(handler) = frame.handlers.pop() {
                        let hit = match &handler.class {
                            None => true,
                            Some(class) => errors::matches_class(&err, class),
                        };
                        if hit {
                            frame.pc = handler.target;
                            found = Some(handler);
                            break;
                        }
                    }
                    found
                };
                if let Some(handler) = matched {
                    PENDING.with(|p| *p.borrow_mut() = Some(err.clone()));
                    self.stack.truncate(handler.sp);
                    self.stack.push(errors::error_to_value(&err));
                    return Ok(());
                }
            }
            let (name, line, base) = {
                let frame = self.frames.last().expect("nonempty");
                (
                    frame.chunk.name.clone(),
                    frame.chunk.line_for_pc(frame.pc),
                    frame.base,
                )
            };
            match line {
                Some(line) => err.push_frame(format!("{} (line {})", name, line)),
                None => err.push_frame(name.to_string()),
            }
            self.frames.pop();
            self.stack.truncate(base);
        }
        Err(err)
    }
}

fn offset_pc(base: usize, off: i16) -> usize {
    (base as i64 + off as i64) as usize
}
