//! MITScript Language Engine
//!
//! This crate is the complete execution pipeline for MITScript, a small
//! dynamically typed scripting language with first-class closures, mutable
//! records, lexical capture by reference, and garbage collection:
//! - **Parser**: logos lexer and recursive-descent parser (`parser` module)
//! - **Compiler**: symbol classification and stack bytecode (`compiler`)
//! - **Bytecode**: textual bytecode loader and printer (`bytecode`)
//! - **VM**: tagged values, mark-sweep heap, interpreter (`vm`)
//! - **JIT**: linear IR, linear-scan allocation, x86-64 emission (`jit`)
//!
//! # Example
//!
//! ```rust,ignore
//! use mitscript_engine::{compile_source, Vm, VmOptions};
//!
//! let mut vm = Vm::new(VmOptions::default());
//! let main = compile_source(&mut vm, "print(1 + 2);")?;
//! vm.run(main)?;
//! ```

#![warn(rust_2018_idioms)]

pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod jit;
pub mod parser;
pub mod vm;

pub use bytecode::{load_bytecode, print_function};
pub use compiler::{compile_program, compile_source, Instr};
pub use error::Error;
pub use parser::{ast, parse_program};
pub use vm::{ExecMode, Value, Vm, VmOptions};
