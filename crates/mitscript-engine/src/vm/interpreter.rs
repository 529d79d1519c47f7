//! The virtual machine and its bytecode dispatch loop
//!
//! The interpreter executes one instruction per step out of the top frame.
//! Operands are peeked (not popped) until any allocation for the step has
//! completed, so every live value stays visible to the collector; the pops
//! happen at the end of the step. After each step the heap gets a chance to
//! collect.

use crate::compiler::instr::Instr;
use crate::error::Error;
use crate::jit;
use crate::vm::frame::Frame;
use crate::vm::gc::CollectedHeap;
use crate::vm::object::{Cell, Closure, FunctionKind, ObjData, ObjRef};
use crate::vm::strings::StringArena;
use crate::vm::value::{Tag, Value};
use crate::vm::{ExecMode, VmOptions};

/// Where `print` output goes; tests capture it in a buffer.
pub(crate) enum OutputSink {
    Stdout,
    Buffer(Vec<u8>),
}

/// A complete MITScript virtual machine: collected heap, string arena,
/// frame stack, and configuration.
///
/// The VM is boxed so its address is stable: compiled code embeds the VM
/// pointer as an immediate, and every runtime helper receives it as its
/// first argument. Independent `Vm` instances are fully isolated.
pub struct Vm {
    pub heap: CollectedHeap,
    pub strings: StringArena,
    mode: ExecMode,
    none: Value,
    finished: bool,
    pub(crate) output: OutputSink,
}

impl Vm {
    pub fn new(options: VmOptions) -> Box<Vm> {
        Self::with_output(options, OutputSink::Stdout)
    }

    /// A VM whose `print` output is captured for inspection.
    pub fn new_captured(options: VmOptions) -> Box<Vm> {
        Self::with_output(options, OutputSink::Buffer(Vec::new()))
    }

    fn with_output(options: VmOptions, output: OutputSink) -> Box<Vm> {
        let mut heap = CollectedHeap::new(options.max_heap_mb);
        let none = heap.allocate_permanent(ObjData::None);
        Box::new(Vm {
            heap,
            strings: StringArena::new(),
            mode: options.mode,
            none,
            finished: false,
            output,
        })
    }

    /// The `None` singleton.
    #[inline]
    pub fn none(&self) -> Value {
        self.none
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Captured output so far, if this VM was built with `new_captured`.
    pub fn captured_output(&self) -> Option<&[u8]> {
        match &self.output {
            OutputSink::Buffer(b) => Some(b),
            OutputSink::Stdout => None,
        }
    }

    pub(crate) fn write_line(&mut self, s: &str) {
        match &mut self.output {
            OutputSink::Stdout => println!("{s}"),
            OutputSink::Buffer(b) => {
                b.extend_from_slice(s.as_bytes());
                b.push(b'\n');
            }
        }
    }

    // ------------------------------------------------------------------
    // Program execution
    // ------------------------------------------------------------------

    /// Execute a compiled root function to completion. The root frame
    /// doubles as the global frame and stays rooted for the VM's lifetime.
    pub fn run(&mut self, main_func: Value) -> Result<(), Error> {
        let frame_v = self.heap.allocate(ObjData::Frame(Frame::new(main_func)));
        let fr = frame_v.as_obj()?;
        self.heap.roots.push(fr);

        match self.mode {
            ExecMode::Interpret => {
                self.finished = fr.as_frame()?.num_instructions() == 0;
                while !self.finished {
                    self.step()?;
                }
                Ok(())
            }
            ExecMode::Compile => {
                let clos = self.heap.allocate(ObjData::Closure(Closure {
                    func: main_func,
                    cells: Vec::new(),
                }));
                // Root the main closure in the global frame before calling.
                fr.as_frame_mut()?.jit_temps.push(clos);
                self.call_compiled(clos, &[])?;
                Ok(())
            }
        }
    }

    fn top_frame(&self) -> ObjRef {
        self.heap.roots.top().expect("live frame")
    }

    fn global_frame(&self) -> ObjRef {
        self.heap.roots.bottom().expect("global frame")
    }

    fn push_operand(&mut self, fr: ObjRef, v: Value) -> Result<(), Error> {
        fr.as_frame_mut()?.op_push(&mut self.heap, v);
        Ok(())
    }

    fn pop_operand(&mut self, fr: ObjRef) -> Result<Value, Error> {
        fr.as_frame_mut()?.op_pop(&mut self.heap)
    }

    fn advance(&self, fr: ObjRef) -> Result<(), Error> {
        fr.as_frame_mut()?.pc += 1;
        Ok(())
    }

    /// Install `v` into a variable of `fr`, creating the backing cell on
    /// first assignment. `v` must be collector-visible when this is called.
    fn frame_set_var(&mut self, fr: ObjRef, name: &str, v: Value) -> Result<(), Error> {
        let existing = fr.as_frame()?.vars.get(name).copied();
        match existing {
            Some(cell) => {
                cell.as_obj()?.as_cell_mut()?.slot = v;
            }
            None => {
                let cell = self.heap.allocate(ObjData::Cell(Cell { slot: v }));
                fr.as_frame_mut()?.insert_cell(&mut self.heap, name, cell);
            }
        }
        Ok(())
    }

    /// Read a global from the global frame.
    pub(crate) fn load_global(&self, name: &str) -> Result<Value, Error> {
        self.global_frame().as_frame()?.get_var(name)
    }

    /// Write a global into the global frame.
    pub(crate) fn store_global(&mut self, name: &str, v: Value) -> Result<(), Error> {
        self.frame_set_var(self.global_frame(), name, v)
    }

    // ------------------------------------------------------------------
    // Value operations shared by both execution engines
    // ------------------------------------------------------------------

    /// Polymorphic add: string concatenation when either side is a string,
    /// otherwise integer addition with wrapping.
    pub(crate) fn value_add(&mut self, l: Value, r: Value) -> Result<Value, Error> {
        if l.is_str() || r.is_str() {
            let s = format!("{}{}", l.display_string()?, r.display_string()?);
            Ok(self.strings.intern(&s))
        } else {
            let a = l.as_int()?;
            let b = r.as_int()?;
            Ok(Value::from_int(a.wrapping_add(b)))
        }
    }

    /// Total equality: values of different tags are never equal; scalars
    /// compare by payload, strings by content, heap objects per kind.
    pub(crate) fn value_eq(&self, l: Value, r: Value) -> Result<Value, Error> {
        if l.tag() != r.tag() {
            return Ok(Value::from_bool(false));
        }
        let eq = match l.tag() {
            Tag::Int | Tag::Bool => l == r,
            Tag::Str => l.as_str()? == r.as_str()?,
            Tag::Ptr => {
                if l.is_null() || r.is_null() {
                    return Err(Error::RuntimeError(
                        "equality on uninitialized value".to_string(),
                    ));
                }
                l.as_obj()?.obj().equals(r.as_obj()?.obj())?
            }
        };
        Ok(Value::from_bool(eq))
    }

    /// String coercion used by `index_load`/`index_store` and `cast_string`.
    pub(crate) fn value_cast_string(&mut self, v: Value) -> Result<Value, Error> {
        let s = v.display_string()?;
        Ok(self.strings.intern(&s))
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Shared call setup: validates the closure and arity, then either
    /// pushes a bytecode frame (binding parameters, locals, and free-var
    /// cells) or short-circuits native builtins. Returns `None` when a
    /// frame was pushed and interpretation should continue, `Some(result)`
    /// for natives and empty bodies.
    ///
    /// `args` must all be collector-visible at the call.
    fn call_interp(&mut self, closure: Value, args: &[Value]) -> Result<Option<Value>, Error> {
        let clos = closure.as_obj()?.as_closure()?;
        let funcv = clos.func;
        let cells = clos.cells.clone();
        let func = funcv.as_obj()?.as_function()?;
        if args.len() != func.parameter_count {
            return Err(Error::RuntimeError(format!(
                "expected {} arguments, got {}",
                func.parameter_count,
                args.len()
            )));
        }

        if func.kind != FunctionKind::Normal {
            let result = self.eval_native(func.kind, args)?;
            return Ok(Some(result));
        }

        let local_vars = func.local_vars.clone();
        let free_vars = func.free_vars.clone();
        let empty_body = func.instructions.is_empty();
        let none = self.none;

        let frame_v = self.heap.allocate(ObjData::Frame(Frame::new(funcv)));
        let nfr = frame_v.as_obj()?;
        self.heap.roots.push(nfr);

        for (i, name) in local_vars.iter().enumerate() {
            let v = if i < args.len() { args[i] } else { none };
            self.frame_set_var(nfr, name, v)?;
        }
        for (i, name) in free_vars.iter().enumerate() {
            let cell = cells.get(i).copied().ok_or_else(|| {
                Error::RuntimeError(format!("closure missing cell for free var {name}"))
            })?;
            nfr.as_frame_mut()?.insert_cell(&mut self.heap, name, cell);
        }

        if empty_body {
            self.heap.roots.pop();
            return Ok(Some(none));
        }
        Ok(None)
    }

    /// Call through the native path: lazily compile the function, root a
    /// frame for the activation, and invoke the generated entry point.
    pub(crate) fn call_compiled(&mut self, closure: Value, args: &[Value]) -> Result<Value, Error> {
        let clos = closure.as_obj()?.as_closure()?;
        let funcv = clos.func;
        let func_ref = funcv.as_obj()?;
        let func = func_ref.as_function()?;
        if args.len() != func.parameter_count {
            return Err(Error::RuntimeError(format!(
                "expected {} arguments, got {}",
                func.parameter_count,
                args.len()
            )));
        }

        if func.kind != FunctionKind::Normal {
            let result = self.eval_native(func.kind, args)?;
            self.pin(result);
            return Ok(result);
        }

        if func.native.get().is_none() {
            let mut ir = jit::lower(self, func_ref)?;
            jit::allocate_registers(&mut ir);
            let code = jit::compile(self as *mut Vm, &ir)?;
            // The slot transitions at most once; a second set is a bug.
            if func.native.set(code).is_err() {
                return Err(Error::RuntimeError(
                    "native code slot set twice".to_string(),
                ));
            }
        }
        let entry = func.native.get().expect("native code").entry();

        // Root the activation: the frame keeps the closure (and with it the
        // free-var cells) plus every helper-produced temporary alive while
        // generated code runs.
        let frame_v = self.heap.allocate(ObjData::Frame(Frame::new(funcv)));
        let nfr = frame_v.as_obj()?;
        nfr.as_frame_mut()?.jit_temps.push(closure);
        self.heap.roots.push(nfr);

        let cells_ptr = closure.as_obj()?.as_closure()?.cells.as_ptr();
        let result = entry(args.as_ptr(), cells_ptr);

        self.heap.roots.pop();
        self.pin(result);
        Ok(result)
    }

    /// Keep a value produced for generated code alive by parking it in the
    /// current frame's temp list.
    pub(crate) fn pin(&mut self, v: Value) {
        if let Some(fr) = self.heap.roots.top() {
            if let Ok(f) = fr.as_frame_mut() {
                f.jit_temps.push(v);
                self.heap.charge(8);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    fn step(&mut self) -> Result<(), Error> {
        let fr = self.top_frame();
        let inst = fr.as_frame()?.current_instr()?;
        match inst {
            Instr::LoadConst(i) => {
                let c = fr.as_frame()?.constant_by_index(i)?;
                self.push_operand(fr, c)?;
                self.advance(fr)?;
            }
            Instr::LoadFunc(i) => {
                let f = fr.as_frame()?.function_by_index(i)?;
                self.push_operand(fr, f)?;
                self.advance(fr)?;
            }
            Instr::LoadLocal(i) => {
                let name = fr.as_frame()?.local_by_index(i)?.to_string();
                let v = fr.as_frame()?.get_var(&name)?;
                self.push_operand(fr, v)?;
                self.advance(fr)?;
            }
            Instr::StoreLocal(i) => {
                let name = fr.as_frame()?.local_by_index(i)?.to_string();
                let v = fr.as_frame()?.op_peek(0)?;
                self.frame_set_var(fr, &name, v)?;
                self.pop_operand(fr)?;
                self.advance(fr)?;
            }
            Instr::LoadGlobal(i) => {
                let name = fr.as_frame()?.name_by_index(i)?.to_string();
                let v = self.load_global(&name)?;
                self.push_operand(fr, v)?;
                self.advance(fr)?;
            }
            Instr::StoreGlobal(i) => {
                let name = fr.as_frame()?.name_by_index(i)?.to_string();
                let v = fr.as_frame()?.op_peek(0)?;
                self.store_global(&name, v)?;
                self.pop_operand(fr)?;
                self.advance(fr)?;
            }
            Instr::PushReference(i) => {
                let name = fr.as_frame()?.ref_name_by_index(i)?.to_string();
                let cell = fr.as_frame()?.get_ref(&name)?;
                self.push_operand(fr, cell)?;
                self.advance(fr)?;
            }
            Instr::LoadReference => {
                let cellv = fr.as_frame()?.op_peek(0)?;
                let v = cellv.as_obj()?.as_cell()?.slot;
                if v.is_null() {
                    return Err(Error::UninitializedVariable(
                        "reference read before assignment".to_string(),
                    ));
                }
                self.pop_operand(fr)?;
                self.push_operand(fr, v)?;
                self.advance(fr)?;
            }
            Instr::StoreReference => {
                let v = fr.as_frame()?.op_peek(0)?;
                let cellv = fr.as_frame()?.op_peek(1)?;
                cellv.as_obj()?.as_cell_mut()?.slot = v;
                self.pop_operand(fr)?;
                self.pop_operand(fr)?;
                self.advance(fr)?;
            }
            Instr::AllocRecord => {
                let r = self.heap.allocate(ObjData::Record(Default::default()));
                self.push_operand(fr, r)?;
                self.advance(fr)?;
            }
            Instr::FieldLoad(i) => {
                let name = fr.as_frame()?.name_by_index(i)?.to_string();
                let rec = fr.as_frame()?.op_peek(0)?;
                let v = rec
                    .as_obj()?
                    .as_record()?
                    .get(&name)
                    .unwrap_or(self.none);
                self.pop_operand(fr)?;
                self.push_operand(fr, v)?;
                self.advance(fr)?;
            }
            Instr::FieldStore(i) => {
                let name = fr.as_frame()?.name_by_index(i)?.to_string();
                let v = fr.as_frame()?.op_peek(0)?;
                let rec = fr.as_frame()?.op_peek(1)?;
                let delta = rec.as_obj()?.as_record_mut()?.set(&name, v);
                self.heap.charge(delta);
                self.pop_operand(fr)?;
                self.pop_operand(fr)?;
                self.advance(fr)?;
            }
            Instr::IndexLoad => {
                let idx = fr.as_frame()?.op_peek(0)?;
                let rec = fr.as_frame()?.op_peek(1)?;
                let key = idx.display_string()?;
                let v = rec.as_obj()?.as_record()?.get(&key).unwrap_or(self.none);
                self.pop_operand(fr)?;
                self.pop_operand(fr)?;
                self.push_operand(fr, v)?;
                self.advance(fr)?;
            }
            Instr::IndexStore => {
                let v = fr.as_frame()?.op_peek(0)?;
                let idx = fr.as_frame()?.op_peek(1)?;
                let rec = fr.as_frame()?.op_peek(2)?;
                let key = idx.display_string()?;
                let delta = rec.as_obj()?.as_record_mut()?.set(&key, v);
                self.heap.charge(delta);
                self.pop_operand(fr)?;
                self.pop_operand(fr)?;
                self.pop_operand(fr)?;
                self.advance(fr)?;
            }
            Instr::AllocClosure(n) => {
                // Stack top is the first free-var cell; the function sits
                // below all the cells.
                let mut cells = Vec::with_capacity(n);
                for k in 0..n {
                    let cell = fr.as_frame()?.op_peek(k)?;
                    cell.as_obj()?.as_cell()?;
                    cells.push(cell);
                }
                let funcv = fr.as_frame()?.op_peek(n)?;
                let func = funcv.as_obj()?.as_function()?;
                if n != func.free_vars.len() {
                    return Err(Error::RuntimeError(format!(
                        "expected {} reference variables but got {}",
                        func.free_vars.len(),
                        n
                    )));
                }
                let clos = self.heap.allocate(ObjData::Closure(Closure {
                    func: funcv,
                    cells,
                }));
                for _ in 0..n + 1 {
                    self.pop_operand(fr)?;
                }
                self.push_operand(fr, clos)?;
                self.advance(fr)?;
            }
            Instr::Call(n) => {
                let mut args = Vec::with_capacity(n);
                for i in 0..n {
                    args.push(fr.as_frame()?.op_peek(n - 1 - i)?);
                }
                let closure = fr.as_frame()?.op_peek(n)?;
                self.advance(fr)?;
                match self.call_interp(closure, &args)? {
                    Some(result) => {
                        for _ in 0..n + 1 {
                            self.pop_operand(fr)?;
                        }
                        self.push_operand(fr, result)?;
                    }
                    None => {
                        // A frame was pushed; clear the caller's operands
                        // now that the callee roots the arguments.
                        for _ in 0..n + 1 {
                            self.pop_operand(fr)?;
                        }
                    }
                }
            }
            Instr::Return => {
                let ret = fr.as_frame()?.op_peek(0)?;
                self.heap.roots.pop();
                if self.heap.roots.is_empty() {
                    self.finished = true;
                    return Ok(());
                }
                let parent = self.top_frame();
                self.push_operand(parent, ret)?;
            }
            Instr::Add => {
                let r = self.pop_operand(fr)?;
                let l = self.pop_operand(fr)?;
                let v = self.value_add(l, r)?;
                self.push_operand(fr, v)?;
                self.advance(fr)?;
            }
            Instr::Sub => {
                let r = self.pop_operand(fr)?.as_int()?;
                let l = self.pop_operand(fr)?.as_int()?;
                self.push_operand(fr, Value::from_int(l.wrapping_sub(r)))?;
                self.advance(fr)?;
            }
            Instr::Mul => {
                let r = self.pop_operand(fr)?.as_int()?;
                let l = self.pop_operand(fr)?.as_int()?;
                self.push_operand(fr, Value::from_int(l.wrapping_mul(r)))?;
                self.advance(fr)?;
            }
            Instr::Div => {
                let r = self.pop_operand(fr)?.as_int()?;
                let l = self.pop_operand(fr)?.as_int()?;
                if r == 0 {
                    return Err(Error::ArithmeticError("cannot divide by 0".to_string()));
                }
                self.push_operand(fr, Value::from_int(l.wrapping_div(r)))?;
                self.advance(fr)?;
            }
            Instr::Neg => {
                let v = self.pop_operand(fr)?.as_int()?;
                self.push_operand(fr, Value::from_int(v.wrapping_neg()))?;
                self.advance(fr)?;
            }
            Instr::Gt => {
                let r = self.pop_operand(fr)?.as_int()?;
                let l = self.pop_operand(fr)?.as_int()?;
                self.push_operand(fr, Value::from_bool(l > r))?;
                self.advance(fr)?;
            }
            Instr::Geq => {
                let r = self.pop_operand(fr)?.as_int()?;
                let l = self.pop_operand(fr)?.as_int()?;
                self.push_operand(fr, Value::from_bool(l >= r))?;
                self.advance(fr)?;
            }
            Instr::Eq => {
                let r = self.pop_operand(fr)?;
                let l = self.pop_operand(fr)?;
                let v = self.value_eq(l, r)?;
                self.push_operand(fr, v)?;
                self.advance(fr)?;
            }
            Instr::And => {
                let r = self.pop_operand(fr)?.as_bool()?;
                let l = self.pop_operand(fr)?.as_bool()?;
                self.push_operand(fr, Value::from_bool(l && r))?;
                self.advance(fr)?;
            }
            Instr::Or => {
                let r = self.pop_operand(fr)?.as_bool()?;
                let l = self.pop_operand(fr)?.as_bool()?;
                self.push_operand(fr, Value::from_bool(l || r))?;
                self.advance(fr)?;
            }
            Instr::Not => {
                let v = self.pop_operand(fr)?.as_bool()?;
                self.push_operand(fr, Value::from_bool(!v))?;
                self.advance(fr)?;
            }
            Instr::Goto(l) => {
                let target = self.label_target(fr, l)?;
                fr.as_frame_mut()?.pc = target;
            }
            Instr::If(l) => {
                let cond = self.pop_operand(fr)?.as_bool()?;
                if cond {
                    let target = self.label_target(fr, l)?;
                    fr.as_frame_mut()?.pc = target;
                } else {
                    self.advance(fr)?;
                }
            }
            Instr::Label(_) => {
                self.advance(fr)?;
            }
            Instr::Dup => {
                let v = fr.as_frame()?.op_peek(0)?;
                self.push_operand(fr, v)?;
                self.advance(fr)?;
            }
            Instr::Swap => {
                let top = self.pop_operand(fr)?;
                let next = self.pop_operand(fr)?;
                self.push_operand(fr, top)?;
                self.push_operand(fr, next)?;
                self.advance(fr)?;
            }
            Instr::Pop => {
                self.pop_operand(fr)?;
                self.advance(fr)?;
            }
        }

        // Safe-point: every step gives the heap a chance to collect.
        self.heap.collect_if_needed();

        // Implicit None return when a body runs off its end.
        let fr = self.top_frame();
        let f = fr.as_frame()?;
        if f.pc >= f.num_instructions() {
            if self.heap.roots.len() == 1 {
                self.finished = true;
                return Ok(());
            }
            let none = self.none;
            self.heap.roots.pop();
            let parent = self.top_frame();
            self.push_operand(parent, none)?;
        }
        Ok(())
    }

    fn label_target(&self, fr: ObjRef, label: i32) -> Result<usize, Error> {
        fr.as_frame()?
            .func()
            .labels
            .get(&label)
            .copied()
            .ok_or_else(|| Error::RuntimeError(format!("unknown label {label}")))
    }
}
