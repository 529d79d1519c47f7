//! x86-64 code generation from IR
//!
//! Emits one native body per function with dynasm. Frame layout after the
//! prologue, growing downward from rbp:
//!
//! ```text
//! [rbp -  8] .. [rbp - 40]  five saved callee-saved registers
//! [rbp - 48]                pointer to the closure's free-var cell array
//! [rbp - 56] ..             spill slot 0, spill slot 1, ...
//! ```
//!
//! rsp is kept 16-byte aligned after the prologue and at every helper call.
//! Helper calls follow one protocol: save the eight non-rax caller-saved
//! registers, marshal immediates then temps into the SysV argument
//! registers (temps never live in argument registers, so marshaling cannot
//! clobber), optionally pass a caller-chosen register as the final argument
//! via a push/pop, call indirectly through r10, restore, and move rax into
//! the destination temp. Pushes and pops are counted and must balance at
//! every instruction boundary.

use crate::error::Error;
use crate::jit::helpers;
use crate::jit::ir::{IrFunction, IrInstr, TempId};
use crate::vm::value::Value;
use crate::vm::Vm;
use dynasmrt::x64::{Assembler, Rq};
use dynasmrt::{dynasm, AssemblyOffset, DynamicLabel, DynasmApi, DynasmLabelApi, ExecutableBuffer, Register};
use rustc_hash::FxHashMap;

/// Signature of a compiled function body: the argument array and the
/// closure's free-var cell array. The VM pointer is baked in as an
/// immediate at compile time.
pub type NativeEntry = extern "sysv64" fn(*const Value, *const Value) -> Value;

/// A finished native body. Owning the buffer keeps the code executable and
/// at a stable address for the life of the function object.
pub struct NativeCode {
    buf: ExecutableBuffer,
    entry: AssemblyOffset,
}

impl NativeCode {
    pub fn entry(&self) -> NativeEntry {
        // SAFETY: `entry` is the start of a complete function emitted by
        // `compile` with exactly the NativeEntry ABI.
        unsafe { std::mem::transmute::<*const u8, NativeEntry>(self.buf.ptr(self.entry)) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }
}

const CALLEE_SAVED: [Rq; 5] = [Rq::RBX, Rq::R12, Rq::R13, Rq::R14, Rq::R15];
/// Caller-saved registers preserved around helper calls; rax is excluded
/// because it carries the return value.
const SAVED_AROUND_CALLS: [Rq; 8] = [
    Rq::RCX,
    Rq::RDX,
    Rq::RSI,
    Rq::RDI,
    Rq::R8,
    Rq::R9,
    Rq::R10,
    Rq::R11,
];
const ARG_REGS: [Rq; 6] = [Rq::RDI, Rq::RSI, Rq::RDX, Rq::RCX, Rq::R8, Rq::R9];

/// Displacement of the free-var cell array slot.
const CELLS_DISP: i32 = -(8 * (1 + CALLEE_SAVED.len() as i32));

/// Compile an allocated IR function to native code. `vm` must be the boxed
/// VM this function will run under; its address is embedded in the code.
pub fn compile(vm: *mut Vm, ir: &IrFunction) -> Result<NativeCode, Error> {
    let ops = Assembler::new()
        .map_err(|e| Error::RuntimeError(format!("assembler creation failed: {e}")))?;
    let none = unsafe { (*vm).none() };

    let mut gen = CodeGen {
        ops,
        ir,
        vm: vm as usize,
        none: none.raw(),
        labels: FxHashMap::default(),
        frame_bytes: frame_bytes(ir.spill_slots),
        push_count: 0,
    };

    gen.prologue()?;
    for instr in &ir.instrs {
        gen.instr(instr)?;
        debug_assert_eq!(gen.push_count, 0, "unbalanced pushes at {instr}");
    }
    // Fall off the end: implicit None return.
    let none_bits = gen.none;
    dynasm!(gen.ops ; mov rax, QWORD none_bits as i64);
    gen.epilogue();

    let buf = gen
        .ops
        .finalize()
        .map_err(|_| Error::RuntimeError("failed to finalize generated code".to_string()))?;
    Ok(NativeCode {
        buf,
        entry: AssemblyOffset(0),
    })
}

/// Temp area size: one slot for the cell-array pointer plus the spill
/// slots, padded so rsp ends up 16-byte aligned after the prologue (six
/// pushes have happened by then).
fn frame_bytes(spill_slots: usize) -> i32 {
    let mut bytes = 8 * (1 + spill_slots as i32);
    if bytes % 16 == 0 {
        bytes += 8;
    }
    bytes
}

/// Where a temp lives.
#[derive(Debug, Clone, Copy)]
enum Loc {
    Reg(Rq),
    /// rbp-relative displacement.
    Slot(i32),
}

struct CodeGen<'a> {
    ops: Assembler,
    ir: &'a IrFunction,
    vm: usize,
    none: u64,
    labels: FxHashMap<i32, DynamicLabel>,
    frame_bytes: i32,
    push_count: i32,
}

impl<'a> CodeGen<'a> {
    fn loc(&self, t: TempId) -> Result<Loc, Error> {
        let temp = &self.ir.temps[t];
        if let Some(r) = temp.reg {
            Ok(Loc::Reg(r))
        } else if let Some(s) = temp.slot {
            Ok(Loc::Slot(-(8 * (1 + CALLEE_SAVED.len() as i32 + 1 + s as i32))))
        } else {
            Err(Error::RuntimeError(format!(
                "temp {t} has no allocated location"
            )))
        }
    }

    fn label(&mut self, id: i32) -> DynamicLabel {
        if let Some(&l) = self.labels.get(&id) {
            return l;
        }
        let l = self.ops.new_dynamic_label();
        self.labels.insert(id, l);
        l
    }

    // ------------------------------------------------------------------
    // Temp moves
    // ------------------------------------------------------------------

    fn load_temp(&mut self, dst: Rq, t: TempId) -> Result<(), Error> {
        match self.loc(t)? {
            Loc::Reg(r) => dynasm!(self.ops ; mov Rq(dst.code()), Rq(r.code())),
            Loc::Slot(d) => dynasm!(self.ops ; mov Rq(dst.code()), [rbp + d]),
        }
        Ok(())
    }

    fn store_temp(&mut self, t: TempId, src: Rq) -> Result<(), Error> {
        match self.loc(t)? {
            Loc::Reg(r) => dynasm!(self.ops ; mov Rq(r.code()), Rq(src.code())),
            Loc::Slot(d) => dynasm!(self.ops ; mov [rbp + d], Rq(src.code())),
        }
        Ok(())
    }

    fn load_temp32(&mut self, dst: Rq, t: TempId) -> Result<(), Error> {
        match self.loc(t)? {
            Loc::Reg(r) => dynasm!(self.ops ; mov Rd(dst.code()), Rd(r.code())),
            Loc::Slot(d) => dynasm!(self.ops ; mov Rd(dst.code()), [rbp + d]),
        }
        Ok(())
    }

    fn store_temp32(&mut self, t: TempId, src: Rq) -> Result<(), Error> {
        match self.loc(t)? {
            Loc::Reg(r) => dynasm!(self.ops ; mov Rd(r.code()), Rd(src.code())),
            Loc::Slot(d) => dynasm!(self.ops ; mov [rbp + d], Rd(src.code())),
        }
        Ok(())
    }

    /// Sign-extending 32-bit load into a 64-bit register.
    fn load_temp_sx(&mut self, dst: Rq, t: TempId) -> Result<(), Error> {
        match self.loc(t)? {
            Loc::Reg(r) => dynasm!(self.ops ; movsxd Rq(dst.code()), Rd(r.code())),
            Loc::Slot(d) => dynasm!(self.ops ; movsxd Rq(dst.code()), DWORD [rbp + d]),
        }
        Ok(())
    }

    fn mov_imm(&mut self, t: TempId, imm: u64) -> Result<(), Error> {
        match self.loc(t)? {
            Loc::Reg(r) => dynasm!(self.ops ; mov Rq(r.code()), QWORD imm as i64),
            Loc::Slot(d) => {
                dynasm!(self.ops
                    ; mov rax, QWORD imm as i64
                    ; mov [rbp + d], rax
                );
            }
        }
        Ok(())
    }

    fn move_temp(&mut self, dest: TempId, src: TempId) -> Result<(), Error> {
        match (self.loc(dest)?, self.loc(src)?) {
            (Loc::Reg(d), _) => self.load_temp(d, src),
            (Loc::Slot(dd), Loc::Reg(s)) => {
                dynasm!(self.ops ; mov [rbp + dd], Rq(s.code()));
                Ok(())
            }
            (Loc::Slot(dd), Loc::Slot(sd)) => {
                dynasm!(self.ops
                    ; mov rax, [rbp + sd]
                    ; mov [rbp + dd], rax
                );
                Ok(())
            }
        }
    }

    fn push_reg(&mut self, r: Rq) {
        dynasm!(self.ops ; push Rq(r.code()));
        self.push_count += 1;
    }

    fn pop_reg(&mut self, r: Rq) {
        dynasm!(self.ops ; pop Rq(r.code()));
        self.push_count -= 1;
    }

    /// Push a temp's value, forming part of a contiguous argument array.
    fn push_temp(&mut self, t: TempId) -> Result<(), Error> {
        match self.loc(t)? {
            Loc::Reg(r) => self.push_reg(r),
            Loc::Slot(d) => {
                dynasm!(self.ops ; mov rax, [rbp + d]);
                dynasm!(self.ops ; push rax);
                self.push_count += 1;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helper calls
    // ------------------------------------------------------------------

    /// Call a runtime helper. `imms` are 64-bit immediates (the VM pointer,
    /// interned names), `temps` follow as value arguments, and `last_arg`
    /// optionally passes a caller-chosen register (the argument-array
    /// pointer) as the final argument via the push-last/pop-into-slot path.
    /// `outer_pushes` is how many argument-array words are currently pushed
    /// at the call site, for alignment.
    fn call_helper(
        &mut self,
        fn_addr: usize,
        imms: &[u64],
        temps: &[TempId],
        last_arg: Option<Rq>,
        dest: Option<TempId>,
        outer_pushes: usize,
    ) -> Result<(), Error> {
        let total_args = imms.len() + temps.len() + usize::from(last_arg.is_some());
        debug_assert!(total_args <= ARG_REGS.len());

        for r in SAVED_AROUND_CALLS {
            self.push_reg(r);
        }
        if let Some(la) = last_arg {
            self.push_reg(la);
        }

        let mut argi = 0;
        for &imm in imms {
            let r = ARG_REGS[argi];
            dynasm!(self.ops ; mov Rq(r.code()), QWORD imm as i64);
            argi += 1;
        }
        for &t in temps {
            // Temps never live in argument registers, and r11 homes are
            // still intact here, so direct loads are safe.
            let r = ARG_REGS[argi];
            self.load_temp(r, t)?;
            argi += 1;
        }
        if last_arg.is_some() {
            let r = ARG_REGS[argi];
            self.pop_reg(r);
        }

        // Eight saves are stack-neutral mod 16; pad for the outer pushes.
        let pad = outer_pushes % 2 == 1;
        if pad {
            dynasm!(self.ops ; sub rsp, 8);
        }
        dynasm!(self.ops
            ; mov r10, QWORD fn_addr as i64
            ; call r10
        );
        if pad {
            dynasm!(self.ops ; add rsp, 8);
        }

        for r in SAVED_AROUND_CALLS.iter().rev() {
            self.pop_reg(*r);
        }

        if let Some(d) = dest {
            self.store_temp(d, Rq::RAX)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Prologue / epilogue
    // ------------------------------------------------------------------

    fn prologue(&mut self) -> Result<(), Error> {
        let frame_bytes = self.frame_bytes;
        dynasm!(self.ops
            ; push rbp
            ; mov rbp, rsp
        );
        for r in CALLEE_SAVED {
            dynasm!(self.ops ; push Rq(r.code()));
        }
        dynasm!(self.ops
            ; sub rsp, frame_bytes
            // Incoming second argument: the free-var cell array.
            ; mov [rbp + CELLS_DISP], rsi
        );

        // Install parameters from the argument array (first argument, rdi).
        for i in 0..self.ir.parameter_count {
            if !self.ir.temps[i].is_referenced() {
                continue;
            }
            let disp = (8 * i) as i32;
            if self.ir.is_local_ref[i] {
                // Captured parameter: box into a cell.
                dynasm!(self.ops ; mov rcx, [rdi + disp]);
                self.call_helper(
                    helpers::helper_new_cell as usize,
                    &[self.vm as u64],
                    &[],
                    Some(Rq::RCX),
                    Some(i),
                    0,
                )?;
            } else {
                match self.loc(i)? {
                    Loc::Reg(r) => dynasm!(self.ops ; mov Rq(r.code()), [rdi + disp]),
                    Loc::Slot(d) => {
                        dynasm!(self.ops
                            ; mov rax, [rdi + disp]
                            ; mov [rbp + d], rax
                        );
                    }
                }
            }
        }

        // Remaining locals start as None (boxed when captured).
        for i in self.ir.parameter_count..self.ir.local_count {
            if !self.ir.temps[i].is_referenced() {
                continue;
            }
            if self.ir.is_local_ref[i] {
                let none = self.none;
                dynasm!(self.ops ; mov rcx, QWORD none as i64);
                self.call_helper(
                    helpers::helper_new_cell as usize,
                    &[self.vm as u64],
                    &[],
                    Some(Rq::RCX),
                    Some(i),
                    0,
                )?;
            } else {
                self.mov_imm(i, self.none)?;
            }
        }
        Ok(())
    }

    fn epilogue(&mut self) {
        let frame_bytes = self.frame_bytes;
        dynasm!(self.ops ; add rsp, frame_bytes);
        for r in CALLEE_SAVED.iter().rev() {
            dynasm!(self.ops ; pop Rq(r.code()));
        }
        dynasm!(self.ops
            ; pop rbp
            ; ret
        );
    }

    // ------------------------------------------------------------------
    // Per-opcode emission
    // ------------------------------------------------------------------

    fn instr(&mut self, instr: &IrInstr) -> Result<(), Error> {
        let vm = self.vm as u64;
        match instr {
            IrInstr::LoadConst { dest, index } => {
                let c = self.ir.constants[*index];
                self.mov_imm(*dest, c.raw())?;
            }
            IrInstr::LoadFunc { dest, index } => {
                let f = self.ir.functions[*index];
                self.mov_imm(*dest, f.raw())?;
            }
            IrInstr::LoadGlobal { dest, name } => {
                self.call_helper(
                    helpers::helper_load_global as usize,
                    &[vm, name.raw()],
                    &[],
                    None,
                    Some(*dest),
                    0,
                )?;
            }
            IrInstr::StoreGlobal { src, name } => {
                self.call_helper(
                    helpers::helper_store_global as usize,
                    &[vm, name.raw()],
                    &[*src],
                    None,
                    None,
                    0,
                )?;
            }
            IrInstr::LoadLocal { dest, src }
            | IrInstr::StoreLocal { dest, src }
            | IrInstr::PushLocalRef { dest, src } => {
                self.move_temp(*dest, *src)?;
            }
            IrInstr::PushFreeRef { dest, index } => {
                let disp = (8 * index) as i32;
                dynasm!(self.ops
                    ; mov rax, [rbp + CELLS_DISP]
                    ; mov rax, [rax + disp]
                );
                self.store_temp(*dest, Rq::RAX)?;
            }
            IrInstr::LoadReference { dest, cell } => {
                self.call_helper(
                    helpers::helper_unbox_cell as usize,
                    &[vm],
                    &[*cell],
                    None,
                    Some(*dest),
                    0,
                )?;
            }
            IrInstr::StoreLocalRef { cell, src } => {
                self.call_helper(
                    helpers::helper_store_cell as usize,
                    &[vm],
                    &[*src, *cell],
                    None,
                    None,
                    0,
                )?;
            }
            IrInstr::AllocRecord { dest } => {
                self.call_helper(
                    helpers::helper_new_record as usize,
                    &[vm],
                    &[],
                    None,
                    Some(*dest),
                    0,
                )?;
            }
            IrInstr::FieldLoad { dest, record, name } => {
                self.call_helper(
                    helpers::helper_get_field as usize,
                    &[vm, name.raw()],
                    &[*record],
                    None,
                    Some(*dest),
                    0,
                )?;
            }
            IrInstr::FieldStore { record, value, name } => {
                self.call_helper(
                    helpers::helper_set_field as usize,
                    &[vm, name.raw()],
                    &[*record, *value],
                    None,
                    None,
                    0,
                )?;
            }
            IrInstr::IndexLoad { dest, record, key } => {
                self.call_helper(
                    helpers::helper_get_index as usize,
                    &[vm],
                    &[*key, *record],
                    None,
                    Some(*dest),
                    0,
                )?;
            }
            IrInstr::IndexStore { record, key, value } => {
                self.call_helper(
                    helpers::helper_set_index as usize,
                    &[vm],
                    &[*key, *record, *value],
                    None,
                    None,
                    0,
                )?;
            }
            IrInstr::AllocClosure { dest, func, refs } => {
                // Build the contiguous cell array on the stack, first cell
                // at the lowest address.
                for &r in refs.iter().rev() {
                    self.push_temp(r)?;
                }
                dynasm!(self.ops ; mov r10, rsp);
                self.call_helper(
                    helpers::helper_new_closure as usize,
                    &[vm, refs.len() as u64],
                    &[*func],
                    Some(Rq::R10),
                    Some(*dest),
                    refs.len(),
                )?;
                let bytes = (8 * refs.len()) as i32;
                if bytes > 0 {
                    dynasm!(self.ops ; add rsp, bytes);
                }
                self.push_count -= refs.len() as i32;
            }
            IrInstr::Call { dest, closure, args } => {
                for &a in args.iter().rev() {
                    self.push_temp(a)?;
                }
                dynasm!(self.ops ; mov r10, rsp);
                self.call_helper(
                    helpers::helper_call as usize,
                    &[vm, args.len() as u64],
                    &[*closure],
                    Some(Rq::R10),
                    Some(*dest),
                    args.len(),
                )?;
                let bytes = (8 * args.len()) as i32;
                if bytes > 0 {
                    dynasm!(self.ops ; add rsp, bytes);
                }
                self.push_count -= args.len() as i32;
            }
            IrInstr::Return { src } => {
                self.load_temp(Rq::RAX, *src)?;
                self.epilogue();
            }
            IrInstr::Add { dest, left, right } => {
                self.call_helper(
                    helpers::helper_add as usize,
                    &[vm],
                    &[*left, *right],
                    None,
                    Some(*dest),
                    0,
                )?;
            }
            IrInstr::Eq { dest, left, right } => {
                self.call_helper(
                    helpers::helper_eq as usize,
                    &[vm],
                    &[*left, *right],
                    None,
                    Some(*dest),
                    0,
                )?;
            }
            IrInstr::Sub { dest, left, right } => {
                self.load_temp32(Rq::RAX, *left)?;
                self.load_temp32(Rq::RCX, *right)?;
                dynasm!(self.ops ; sub eax, ecx);
                self.store_temp32(*dest, Rq::RAX)?;
            }
            IrInstr::Mul { dest, left, right } => {
                self.load_temp32(Rq::RAX, *left)?;
                self.load_temp32(Rq::RCX, *right)?;
                dynasm!(self.ops ; imul eax, ecx);
                self.store_temp32(*dest, Rq::RAX)?;
            }
            IrInstr::Div { dest, left, right } => {
                // The zero check runs before any division state is set up.
                self.call_helper(
                    helpers::helper_assert_nonzero as usize,
                    &[vm],
                    &[*right],
                    None,
                    None,
                    0,
                )?;
                self.load_temp32(Rq::RAX, *left)?;
                self.load_temp32(Rq::RCX, *right)?;
                // idiv faults on INT_MIN / -1; under wrapping semantics a
                // -1 divisor is a wrapping negation, so take that path
                // without dividing.
                dynasm!(self.ops
                    ; cmp ecx, -1
                    ; jne >quot
                    ; neg eax
                    ; jmp >done
                    ; quot:
                    ; cdq
                    ; idiv ecx
                    ; done:
                );
                self.store_temp32(*dest, Rq::RAX)?;
            }
            IrInstr::Neg { dest, src } => {
                self.load_temp32(Rq::RAX, *src)?;
                dynasm!(self.ops ; neg eax);
                self.store_temp32(*dest, Rq::RAX)?;
            }
            IrInstr::Gt { dest, left, right } => {
                self.compare(*dest, *left, *right, true)?;
            }
            IrInstr::Geq { dest, left, right } => {
                self.compare(*dest, *left, *right, false)?;
            }
            IrInstr::And { dest, left, right } => {
                self.load_temp32(Rq::RAX, *left)?;
                self.load_temp32(Rq::RCX, *right)?;
                dynasm!(self.ops ; and eax, ecx);
                self.store_temp32(*dest, Rq::RAX)?;
            }
            IrInstr::Or { dest, left, right } => {
                self.load_temp32(Rq::RAX, *left)?;
                self.load_temp32(Rq::RCX, *right)?;
                dynasm!(self.ops ; or eax, ecx);
                self.store_temp32(*dest, Rq::RAX)?;
            }
            IrInstr::Not { dest, src } => {
                self.load_temp32(Rq::RAX, *src)?;
                dynasm!(self.ops ; xor eax, 1);
                self.store_temp32(*dest, Rq::RAX)?;
            }
            IrInstr::Goto { label } => {
                let l = self.label(*label);
                dynasm!(self.ops ; jmp =>l);
            }
            IrInstr::If { cond, label } => {
                let l = self.label(*label);
                self.load_temp32(Rq::RCX, *cond)?;
                dynasm!(self.ops
                    ; cmp ecx, 1
                    ; je =>l
                );
            }
            IrInstr::AddLabel { label } => {
                let l = self.label(*label);
                dynasm!(self.ops ; =>l);
            }
            IrInstr::AssertInteger { src } => {
                self.assert_helper(helpers::helper_assert_int as usize, *src)?;
            }
            IrInstr::AssertBoolean { src } => {
                self.assert_helper(helpers::helper_assert_bool as usize, *src)?;
            }
            IrInstr::AssertString { src } => {
                self.assert_helper(helpers::helper_assert_str as usize, *src)?;
            }
            IrInstr::AssertRecord { src } => {
                self.assert_helper(helpers::helper_assert_record as usize, *src)?;
            }
            IrInstr::AssertFunction { src } => {
                self.assert_helper(helpers::helper_assert_function as usize, *src)?;
            }
            IrInstr::AssertClosure { src } => {
                self.assert_helper(helpers::helper_assert_closure as usize, *src)?;
            }
            IrInstr::AssertCell { src } => {
                self.assert_helper(helpers::helper_assert_cell as usize, *src)?;
            }
            IrInstr::UnboxInteger { dest, src } => {
                self.load_temp(Rq::RAX, *src)?;
                dynasm!(self.ops ; sar rax, 2);
                self.store_temp32(*dest, Rq::RAX)?;
            }
            IrInstr::UnboxBoolean { dest, src } => {
                self.load_temp(Rq::RAX, *src)?;
                dynasm!(self.ops ; shr rax, 2);
                self.store_temp32(*dest, Rq::RAX)?;
            }
            IrInstr::NewInteger { dest, src } => {
                // (i << 2) | 1 — integers box inline.
                self.load_temp_sx(Rq::RAX, *src)?;
                dynasm!(self.ops
                    ; shl rax, 2
                    ; or rax, 1
                );
                self.store_temp(*dest, Rq::RAX)?;
            }
            IrInstr::NewBoolean { dest, src } => {
                // (b << 2) | 2.
                self.load_temp32(Rq::RAX, *src)?;
                dynasm!(self.ops
                    ; shl rax, 2
                    ; or rax, 2
                );
                self.store_temp(*dest, Rq::RAX)?;
            }
            IrInstr::CastString { dest, src } => {
                self.call_helper(
                    helpers::helper_cast_string as usize,
                    &[vm],
                    &[*src],
                    None,
                    Some(*dest),
                    0,
                )?;
            }
            IrInstr::GarbageCollect => {
                self.call_helper(helpers::helper_gc as usize, &[vm], &[], None, None, 0)?;
            }
        }
        Ok(())
    }

    /// Compare 32-bit values and materialize 0/1 with a conditional move.
    fn compare(&mut self, dest: TempId, left: TempId, right: TempId, strict: bool) -> Result<(), Error> {
        self.load_temp32(Rq::RAX, left)?;
        self.load_temp32(Rq::RCX, right)?;
        dynasm!(self.ops
            ; cmp eax, ecx
            ; mov eax, 0
            ; mov edx, 1
        );
        if strict {
            dynasm!(self.ops ; cmovg eax, edx);
        } else {
            dynasm!(self.ops ; cmovge eax, edx);
        }
        self.store_temp32(dest, Rq::RAX)
    }

    fn assert_helper(&mut self, fn_addr: usize, src: TempId) -> Result<(), Error> {
        let vm = self.vm as u64;
        self.call_helper(fn_addr, &[vm], &[src], None, None, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;
    use crate::jit::{allocate_registers, lower};
    use crate::vm::VmOptions;

    #[test]
    fn test_frame_bytes_keeps_alignment() {
        // After six pushes rsp is 8 off alignment; the temp area must
        // contribute an odd number of 8-byte words.
        for spills in 0..10 {
            let bytes = frame_bytes(spills);
            assert_eq!(bytes % 16, 8, "spills={spills}");
            assert!(bytes >= 8 * (1 + spills as i32));
        }
    }

    // Assembles (without running) a program touching every opcode family;
    // the push/pop symmetry assertion fires during emission if any helper
    // call site is unbalanced.
    #[test]
    fn test_assembles_representative_program() {
        let src = "\
            r = { a: 1; }; \
            r[\"b\"] = 2; \
            f = fun(x) { g = fun() { return x; }; return g; }; \
            i = 0; \
            while (i < 3) { i = i + 1; } \
            if (i == 3) { r.c = -i; } else { r.c = i / 1; } \
            s = \"v: \" + r.c; \
            b = !(1 > 2) & true | false; \
            print(s);";
        let mut vm = crate::vm::Vm::new_captured(VmOptions::default());
        let main = compile_source(&mut vm, src).unwrap();
        let mut ir = lower(&mut vm, main.as_obj().unwrap()).unwrap();
        allocate_registers(&mut ir);
        let code = compile(&mut *vm as *mut Vm, &ir).unwrap();
        assert!(!code.is_empty());
    }

    #[test]
    fn test_assembles_function_with_spills() {
        let src = "f = fun(a1, a2, a3, a4, a5, a6, a7, a8) { \
                       return a1 + a2 + a3 + a4 + a5 + a6 + a7 + a8; \
                   }; \
                   print(f(1, 2, 3, 4, 5, 6, 7, 8));";
        let mut vm = crate::vm::Vm::new_captured(VmOptions::default());
        let main = compile_source(&mut vm, src).unwrap();
        // Compile the inner function, which has more live temps than
        // allocatable registers.
        let main_fn = main.as_obj().unwrap().as_function().unwrap();
        let inner = main_fn.functions[3];
        let mut ir = lower(&mut vm, inner.as_obj().unwrap()).unwrap();
        allocate_registers(&mut ir);
        assert!(ir.spill_slots > 0);
        let code = compile(&mut *vm as *mut Vm, &ir).unwrap();
        assert!(!code.is_empty());
    }
}
