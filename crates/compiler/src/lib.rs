//! Sable compiler: reader, analyzer, and bytecode backend
//!
//! The pipeline is text → forms ([`reader`]) → typed AST ([`analyzer`]) →
//! chunks ([`compile`]). Namespace-dependent services are injected through
//! the [`reader::ReaderHost`] and [`analyzer::AnalyzerHost`] traits so this
//! crate never depends on the runtime above it.

pub mod analyzer;
pub mod ast;
pub mod bytecode;
pub mod compile;
pub mod reader;

pub use analyzer::{Analyzer, AnalyzerHost, analyze_top};
pub use ast::{Ast, CaptureSource, CaseBranch, CatchClause, FnArity, FnProto};
pub use bytecode::{Chunk, CodeBuf, ExcEntry, NO_CLASS, Op, disassemble};
pub use compile::{compile_proto, dump_proto};
pub use reader::{NullReaderHost, Reader, ReaderHost, next_gensym_id, read_all, read_one};
