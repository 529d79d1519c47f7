//! Native compilation tier: bytecode → linear IR → linear-scan register
//! allocation → x86-64 emission, with runtime helpers as the boundary back
//! into the VM.

pub mod codegen;
pub mod helpers;
pub mod ir;
pub mod lower;
pub mod regalloc;

pub use codegen::{compile, NativeCode, NativeEntry};
pub use ir::{IrFunction, IrInstr, Temp, TempId};
pub use lower::lower;
pub use regalloc::{allocate_registers, ALLOCATABLE};
