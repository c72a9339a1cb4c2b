//! Bytecode: opcodes, compiled chunks, and the disassembler
//!
//! A chunk is a flat byte stream of opcodes with inline little-endian
//! operands, a constant pool, nested fn templates, an exception table, and
//! a pc → source-line table. Jump operands are signed offsets relative to
//! the pc after the operand is read.

use crate::ast::FnProto;
use sable_core::value::Value;
use std::fmt::Write;
use std::sync::Arc;

/// Sentinel constant index meaning "no class filter" on a handler
pub const NO_CLASS: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    // Stack
    Const = 0,
    Nil,
    True,
    False,
    Pop,
    Dup,
    // Locals
    LoadLocal,
    StoreLocal,
    LoadUpval,
    // Globals
    LoadVar,
    SetVar,
    // Control
    Jump,
    JumpIfFalse,
    JumpIfTrue,
    LoopEntry,
    Recur,
    // Calls
    Call,
    TailCall,
    Apply,
    // Closures
    MakeFn,
    // Exceptions
    Throw,
    PushHandler,
    PopHandler,
    // Specialized dispatch
    KeywordInvoke,
    CaseInt,
    CaseHash,
    // Return
    Ret,
    // Integer fast paths (operand: fallback var constant)
    AddInt,
    SubInt,
    MulInt,
    LtInt,
    LteInt,
    GtInt,
    GteInt,
    EqNum,
    // The executing closure itself (named fn self-recursion)
    LoadSelf,
    // Root-bind a var, with dynamic/macro flags
    DefVar,
    // Re-raise the pending exception after a finally block
    Rethrow,
}

impl Op {
    pub fn from_u8(byte: u8) -> Option<Op> {
        if byte <= Op::Rethrow as u8 {
            // Contiguous discriminants from 0
            Some(unsafe { std::mem::transmute::<u8, Op>(byte) })
        } else {
            None
        }
    }
}

/// One `(start, end, handler_pc, class?)` row of the exception table
#[derive(Debug, Clone)]
pub struct ExcEntry {
    pub start: usize,
    pub end: usize,
    pub handler_pc: usize,
    pub class: Option<String>,
}

/// A compiled fn body
#[derive(Debug)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub consts: Vec<Value>,
    /// Templates for nested `MakeFn`
    pub fn_templates: Vec<Arc<FnProto>>,
    pub n_locals: usize,
    /// Conservative operand-stack depth estimate
    pub max_stack: usize,
    pub exc_table: Vec<ExcEntry>,
    /// pc → source line, sorted by pc
    pub lines: Vec<(usize, usize)>,
    pub name: Arc<str>,
}

impl Chunk {
    /// Source line covering `pc`, for error reporting
    pub fn line_for_pc(&self, pc: usize) -> Option<usize> {
        let mut found = None;
        for (start, line) in &self.lines {
            if *start <= pc {
                found = Some(*line);
            } else {
                break;
            }
        }
        found
    }

    /// Walk constants and nested templates (GC tracing)
    pub fn trace(&self, visit: &mut dyn FnMut(&Value)) {
        for c in &self.consts {
            visit(c);
        }
        for t in &self.fn_templates {
            t.trace(visit);
        }
    }

    // Operand readers used by the VM and the disassembler

    pub fn read_u8(&self, pc: usize) -> u8 {
        self.code[pc]
    }

    pub fn read_u16(&self, pc: usize) -> u16 {
        u16::from_le_bytes([self.code[pc], self.code[pc + 1]])
    }

    pub fn read_i16(&self, pc: usize) -> i16 {
        i16::from_le_bytes([self.code[pc], self.code[pc + 1]])
    }

    pub fn read_i32(&self, pc: usize) -> i32 {
        i32::from_le_bytes([
            self.code[pc],
            self.code[pc + 1],
            self.code[pc + 2],
            self.code[pc + 3],
        ])
    }
}

/// Growable code buffer with patchable jump sites
#[derive(Debug, Default)]
pub struct CodeBuf {
    pub code: Vec<u8>,
}

impl CodeBuf {
    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn op(&mut self, op: Op) {
        self.code.push(op as u8);
    }

    pub fn u8(&mut self, v: u8) {
        self.code.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i16(&mut self, v: i16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit a placeholder i16 jump operand; returns the patch site
    pub fn jump_site(&mut self) -> usize {
        let site = self.pc();
        self.i16(0);
        site
    }

    /// Patch `site` with the offset from just-past-the-operand to `target`
    pub fn patch_jump(&mut self, site: usize, target: usize) {
        let base = site + 2;
        let offset = target as i64 - base as i64;
        let offset = i16::try_from(offset).expect("jump offset exceeds i16 range");
        self.code[site..site + 2].copy_from_slice(&offset.to_le_bytes());
    }

    /// Offset value for a backward jump to `target` emitted at the current pc
    pub fn back_offset(&self, target: usize) -> i16 {
        let base = self.pc() + 2;
        i16::try_from(target as i64 - base as i64).expect("jump offset exceeds i16 range")
    }
}

/// Render a chunk one instruction per line (`--dump-bytecode`)
pub fn disassemble(chunk: &Chunk) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        ";; {} (locals {}, stack {}, consts {})",
        chunk.name,
        chunk.n_locals,
        chunk.max_stack,
        chunk.consts.len()
    );
    let mut pc = 0;
    while pc < chunk.code.len() {
        let at = pc;
        let op = match Op::from_u8(chunk.code[pc]) {
            Some(op) => op,
            None => {
                let _ = writeln!(out, "{:04}  ?? {:#x}", at, chunk.code[pc]);
                pc += 1;
                continue;
            }
        };
        pc += 1;
        match op {
            Op::Const => {
                let idx = chunk.read_u16(pc);
                pc += 2;
                let _ = writeln!(
                    out,
                    "{:04}  const {} ; {}",
                    at,
                    idx,
                    sable_core::printer::pr_str(&chunk.consts[idx as usize])
                );
            }
            Op::Nil | Op::True | Op::False | Op::Pop | Op::Dup | Op::LoopEntry | Op::Throw
            | Op::PopHandler | Op::Ret | Op::LoadSelf | Op::Rethrow => {
                let _ = writeln!(out, "{:04}  {}", at, op_name(op));
            }
            Op::LoadLocal | Op::StoreLocal | Op::LoadUpval => {
                let slot = chunk.read_u16(pc);
                pc += 2;
                let _ = writeln!(out, "{:04}  {} {}", at, op_name(op), slot);
            }
            Op::DefVar => {
                let idx = chunk.read_u16(pc);
                let flags = chunk.read_u8(pc + 2);
                pc += 3;
                let _ = writeln!(
                    out,
                    "{:04}  def_var {} flags={:#x} ; {}",
                    at,
                    idx,
                    flags,
                    sable_core::printer::pr_str(&chunk.consts[idx as usize])
                );
            }
            Op::LoadVar | Op::SetVar => {
                let idx = chunk.read_u16(pc);
                pc += 2;
                let _ = writeln!(
                    out,
                    "{:04}  {} {} ; {}",
                    at,
                    op_name(op),
                    idx,
                    sable_core::printer::pr_str(&chunk.consts[idx as usize])
                );
            }
            Op::Jump | Op::JumpIfFalse | Op::JumpIfTrue => {
                let off = chunk.read_i16(pc);
                pc += 2;
                let target = (pc as i64 + off as i64) as usize;
                let _ = writeln!(out, "{:04}  {} -> {:04}", at, op_name(op), target);
            }
            Op::Recur => {
                let first = chunk.read_u16(pc);
                let n = chunk.read_u8(pc + 2);
                let off = chunk.read_i16(pc + 3);
                pc += 5;
                let target = (pc as i64 + off as i64) as usize;
                let _ = writeln!(out, "{:04}  recur {} [{}..] -> {:04}", at, n, first, target);
            }
            Op::Call | Op::TailCall | Op::Apply => {
                let n = chunk.read_u8(pc);
                pc += 1;
                let _ = writeln!(out, "{:04}  {} {}", at, op_name(op), n);
            }
            Op::MakeFn => {
                let idx = chunk.read_u16(pc);
                let n_caps = chunk.read_u8(pc + 2);
                pc += 3 + n_caps as usize * 3;
                let name = chunk.fn_templates[idx as usize]
                    .name
                    .clone()
                    .unwrap_or_else(|| Arc::from("anonymous"));
                let _ = writeln!(out, "{:04}  make_fn {} ; {} ({} captures)", at, idx, name, n_caps);
            }
            Op::PushHandler => {
                let class = chunk.read_u16(pc);
                let off = chunk.read_i16(pc + 2);
                pc += 4;
                let target = (pc as i64 + off as i64) as usize;
                let class_desc = if class == NO_CLASS {
                    "*".to_string()
                } else {
                    sable_core::printer::pr_str(&chunk.consts[class as usize])
                };
                let _ = writeln!(out, "{:04}  push_handler {} -> {:04}", at, class_desc, target);
            }
            Op::KeywordInvoke => {
                let idx = chunk.read_u16(pc);
                let n = chunk.read_u8(pc + 2);
                pc += 3;
                let _ = writeln!(
                    out,
                    "{:04}  keyword_invoke {} {}",
                    at,
                    sable_core::printer::pr_str(&chunk.consts[idx as usize]),
                    n
                );
            }
            Op::CaseInt => {
                let min = chunk.read_i32(pc);
                let count = chunk.read_u16(pc + 4);
                pc += 6 + count as usize * 2 + 2;
                let _ = writeln!(out, "{:04}  case_int min={} span={}", at, min, count);
            }
            Op::CaseHash => {
                let count = chunk.read_u16(pc);
                pc += 2 + count as usize * 4 + 2;
                let _ = writeln!(out, "{:04}  case_hash {} branches", at, count);
            }
            Op::AddInt | Op::SubInt | Op::MulInt | Op::LtInt | Op::LteInt | Op::GtInt
            | Op::GteInt | Op::EqNum => {
                pc += 2;
                let _ = writeln!(out, "{:04}  {}", at, op_name(op));
            }
        }
    }
    out
}

fn op_name(op: Op) -> &'static str {
    match op {
        Op::Const => "const",
        Op::Nil => "nil",
        Op::True => "true",
        Op::False => "false",
        Op::Pop => "pop",
        Op::Dup => "dup",
        Op::LoadLocal => "load_local",
        Op::StoreLocal => "store_local",
        Op::LoadUpval => "load_up",
        Op::LoadVar => "load_var",
        Op::SetVar => "set_var",
        Op::Jump => "jmp",
        Op::JumpIfFalse => "jmp_if_false",
        Op::JumpIfTrue => "jmp_if_true",
        Op::LoopEntry => "loop_entry",
        Op::Recur => "recur",
        Op::Call => "call",
        Op::TailCall => "tail_call",
        Op::Apply => "apply",
        Op::MakeFn => "make_fn",
        Op::Throw => "throw",
        Op::PushHandler => "push_handler",
        Op::PopHandler => "pop_handler",
        Op::KeywordInvoke => "keyword_invoke",
        Op::CaseInt => "case_switch_int",
        Op::CaseHash => "case_switch_hash",
        Op::Ret => "ret",
        Op::AddInt => "add_int",
        Op::SubInt => "sub_int",
        Op::MulInt => "mul_int",
        Op::LtInt => "lt_int",
        Op::LteInt => "lte_int",
        Op::GtInt => "gt_int",
        Op::GteInt => "gte_int",
        Op::EqNum => "eq_num",
        Op::LoadSelf => "load_self",
        Op::DefVar => "def_var",
        Op::Rethrow => "rethrow",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_round_trip() {
        for byte in 0..=Op::Rethrow as u8 {
            let op = Op::from_u8(byte).expect("contiguous opcode space");
            assert_eq!(op as u8, byte);
        }
        assert!(Op::from_u8(200).is_none());
    }

    #[test]
    fn test_jump_patching() {
        let mut buf = CodeBuf::default();
        buf.op(Op::JumpIfFalse);
        let site = buf.jump_site();
        buf.op(Op::Nil);
        let target = buf.pc();
        buf.op(Op::Ret);
        buf.patch_jump(site, target);
        let off = i16::from_le_bytes([buf.code[site], buf.code[site + 1]]);
        // Offset lands exactly on the Ret
        assert_eq!(site + 2 + off as usize, target);
    }

    #[test]
    fn test_line_for_pc() {
        let chunk = Chunk {
            code: vec![],
            consts: vec![],
            fn_templates: vec![],
            n_locals: 0,
            max_stack: 0,
            exc_table: vec![],
            lines: vec![(0, 1), (10, 2), (20, 5)],
            name: Arc::from("test"),
        };
        assert_eq!(chunk.line_for_pc(0), Some(1));
        assert_eq!(chunk.line_for_pc(12), Some(2));
        assert_eq!(chunk.line_for_pc(99), Some(5));
    }
}
