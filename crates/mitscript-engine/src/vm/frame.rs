//! Call frames
//!
//! A frame is itself a heap object (rooted while on the frame stack) holding
//! the function being executed, the program counter, the operand stack, and
//! the name-to-cell map for locals and free references. Compiled code also
//! parks values it needs kept alive in `jit_temps`, which the collector
//! traverses like any other frame field.

use crate::compiler::instr::Instr;
use crate::error::Error;
use crate::vm::gc::CollectedHeap;
use crate::vm::object::{Function, MAP_ENTRY_COST};
use crate::vm::value::Value;
use rustc_hash::FxHashMap;

/// A live call activation.
pub struct Frame {
    /// The function this frame executes.
    pub func: Value,
    /// Index of the current instruction.
    pub pc: usize,
    /// Operand stack.
    pub op_stack: Vec<Value>,
    /// Local and free-reference cells by name.
    pub vars: FxHashMap<String, Value>,
    /// Extra live temporaries registered by compiled code; keeps values in
    /// machine registers reachable across safe-points.
    pub jit_temps: Vec<Value>,
}

impl Frame {
    pub fn new(func: Value) -> Frame {
        Frame {
            func,
            pc: 0,
            op_stack: Vec::new(),
            vars: FxHashMap::default(),
            jit_temps: Vec::new(),
        }
    }

    /// The function metadata this frame runs.
    pub fn func(&self) -> &Function {
        self.func
            .as_obj()
            .and_then(|o| o.as_function())
            .expect("frame function")
    }

    pub fn num_instructions(&self) -> usize {
        self.func().instructions.len()
    }

    /// Current instruction, or an error when the program counter has run off
    /// the end of the body.
    pub fn current_instr(&self) -> Result<Instr, Error> {
        let f = self.func();
        f.instructions.get(self.pc).copied().ok_or_else(|| {
            Error::RuntimeError(format!("instruction {} out of bounds", self.pc))
        })
    }

    // ------------------------------------------------------------------
    // Function metadata lookups
    // ------------------------------------------------------------------

    pub fn constant_by_index(&self, index: usize) -> Result<Value, Error> {
        self.func()
            .constants
            .get(index)
            .copied()
            .ok_or_else(|| Error::RuntimeError(format!("constant {index} out of bounds")))
    }

    pub fn function_by_index(&self, index: usize) -> Result<Value, Error> {
        self.func()
            .functions
            .get(index)
            .copied()
            .ok_or_else(|| Error::RuntimeError(format!("function {index} out of bounds")))
    }

    pub fn local_by_index(&self, index: usize) -> Result<&str, Error> {
        self.func()
            .local_vars
            .get(index)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::RuntimeError(format!("var {index} out of bounds")))
    }

    pub fn name_by_index(&self, index: usize) -> Result<&str, Error> {
        self.func()
            .names
            .get(index)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::RuntimeError(format!("name {index} out of bounds")))
    }

    /// Reference index space: local reference vars first, then free vars.
    pub fn ref_name_by_index(&self, index: usize) -> Result<&str, Error> {
        let f = self.func();
        let n_local = f.local_ref_vars.len();
        if index < n_local {
            Ok(f.local_ref_vars[index].as_str())
        } else {
            f.free_vars
                .get(index - n_local)
                .map(|s| s.as_str())
                .ok_or_else(|| Error::RuntimeError(format!("ref var {index} out of bounds")))
        }
    }

    // ------------------------------------------------------------------
    // Variable map
    // ------------------------------------------------------------------

    /// Value of a variable, read through its cell.
    pub fn get_var(&self, name: &str) -> Result<Value, Error> {
        let cell = self
            .vars
            .get(name)
            .copied()
            .ok_or_else(|| Error::UninitializedVariable(format!("{name} is not defined")))?;
        let v = cell.as_obj()?.as_cell()?.slot;
        if v.is_null() {
            return Err(Error::UninitializedVariable(format!("{name} is not defined")));
        }
        Ok(v)
    }

    /// The cell backing a variable.
    pub fn get_ref(&self, name: &str) -> Result<Value, Error> {
        self.vars.get(name).copied().ok_or_else(|| {
            Error::RuntimeError(format!("{name} has not been created in its frame's vars"))
        })
    }

    /// Install a cell for `name`, charging the heap for the new entry.
    pub fn insert_cell(&mut self, heap: &mut CollectedHeap, name: &str, cell: Value) {
        if self.vars.insert(name.to_string(), cell).is_none() {
            heap.charge(name.len() + MAP_ENTRY_COST);
        }
    }

    // ------------------------------------------------------------------
    // Operand stack
    // ------------------------------------------------------------------

    pub fn op_push(&mut self, heap: &mut CollectedHeap, v: Value) {
        heap.charge(8);
        self.op_stack.push(v);
    }

    pub fn op_pop(&mut self, heap: &mut CollectedHeap) -> Result<Value, Error> {
        let v = self
            .op_stack
            .pop()
            .ok_or_else(|| Error::InsufficientStack("pop from empty stack".to_string()))?;
        heap.uncharge(8);
        Ok(v)
    }

    /// Peek `depth` entries below the top (0 is the top).
    pub fn op_peek(&self, depth: usize) -> Result<Value, Error> {
        let len = self.op_stack.len();
        if depth >= len {
            return Err(Error::InsufficientStack("peek at empty stack".to_string()));
        }
        Ok(self.op_stack[len - 1 - depth])
    }
}
