//! Bytecode compiler: symbol classification and AST lowering to the stack
//! instruction set.

#[allow(clippy::module_inception)]
pub mod compiler;
pub mod instr;
pub mod symbols;

pub use compiler::{compile_program, compile_source};
pub use instr::Instr;
pub use symbols::{SymbolTables, VarDesc, VarKind};
