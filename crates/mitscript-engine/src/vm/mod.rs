//! MITScript virtual machine: tagged values, the collected heap, frames,
//! and the bytecode interpreter.

pub mod frame;
pub mod gc;
pub mod interpreter;
pub mod native;
pub mod object;
pub mod strings;
pub mod value;

pub use frame::Frame;
pub use gc::{CollectedHeap, GcHeader, RootSet};
pub use interpreter::Vm;
pub use object::{Cell, Closure, Function, FunctionKind, HeapObj, ObjData, ObjRef, Record};
pub use strings::StringArena;
pub use value::{Tag, Value};

/// Which execution engine runs the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Stack-based bytecode interpreter.
    #[default]
    Interpret,
    /// Lower to IR and run native x86-64 code.
    Compile,
}

/// Configuration for a VM instance.
#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    /// Heap byte budget in megabytes.
    pub max_heap_mb: usize,
    /// Execution engine.
    pub mode: ExecMode,
}

impl Default for VmOptions {
    fn default() -> VmOptions {
        VmOptions {
            max_heap_mb: 1000,
            mode: ExecMode::Interpret,
        }
    }
}
