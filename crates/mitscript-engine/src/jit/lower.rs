//! Bytecode to IR lowering
//!
//! Walks a function's bytecode linearly with a virtual operand stack of temp
//! indices. Stack effects become temp moves; primitive arithmetic gets
//! assert/unbox before and box after; `add` and `eq` remain polymorphic and
//! lower to helper-backed instructions. Labels get a `GarbageCollect`
//! safe-point so loops cannot run unboundedly without collection.
//!
//! Every temp records the first and last instruction that references it.
//! After lowering, intervals of temps live across a backward branch are
//! extended to that branch, so linear-scan allocation stays sound in loops.

use crate::compiler::instr::Instr;
use crate::error::Error;
use crate::jit::ir::{IrFunction, IrInstr, Temp, TempId};
use crate::vm::object::ObjRef;
use crate::vm::value::Value;
use crate::vm::Vm;
use rustc_hash::FxHashMap;

/// Lower one function's bytecode to IR.
pub fn lower(vm: &mut Vm, func_ref: ObjRef) -> Result<IrFunction, Error> {
    let func = func_ref.as_function()?;
    let local_count = func.local_vars.len();
    let is_local_ref: Vec<bool> = (0..local_count).map(|i| func.is_local_ref(i)).collect();

    let mut lw = Lowerer {
        instrs: Vec::new(),
        temps: (0..local_count).map(Temp::new).collect(),
        stack: Vec::new(),
        local_count,
    };

    for instr in &func.instructions {
        lw.lower_instr(vm, func, *instr)?;
    }

    let mut ir = IrFunction {
        instrs: lw.instrs,
        temps: lw.temps,
        constants: func.constants.clone(),
        functions: func.functions.clone(),
        parameter_count: func.parameter_count,
        local_count,
        is_local_ref,
        spill_slots: 0,
    };
    extend_over_back_edges(&mut ir);
    Ok(ir)
}

struct Lowerer {
    instrs: Vec<IrInstr>,
    temps: Vec<Temp>,
    /// Virtual operand stack of temp indices.
    stack: Vec<TempId>,
    local_count: usize,
}

impl Lowerer {
    fn new_temp(&mut self) -> TempId {
        let id = self.temps.len();
        self.temps.push(Temp::new(id));
        id
    }

    /// Record a reference to `t` by the instruction about to be emitted.
    /// Locals are live from entry (the prologue installs them).
    fn touch(&mut self, t: TempId) {
        let idx = self.instrs.len() as i32;
        let temp = &mut self.temps[t];
        if temp.start < 0 {
            temp.start = if t < self.local_count { 0 } else { idx };
        }
        temp.end = idx;
    }

    fn push(&mut self, t: TempId) {
        self.stack.push(t);
    }

    fn pop(&mut self) -> Result<TempId, Error> {
        self.stack
            .pop()
            .ok_or_else(|| Error::InsufficientStack("pop from empty stack".to_string()))
    }

    fn peek(&self) -> Result<TempId, Error> {
        self.stack
            .last()
            .copied()
            .ok_or_else(|| Error::InsufficientStack("peek at empty stack".to_string()))
    }

    fn emit(&mut self, instr: IrInstr) {
        self.instrs.push(instr);
    }

    fn emit1(&mut self, t0: TempId, make: impl FnOnce(TempId) -> IrInstr) {
        self.touch(t0);
        let i = make(t0);
        self.emit(i);
    }

    fn emit2(&mut self, t0: TempId, t1: TempId, make: impl FnOnce(TempId, TempId) -> IrInstr) {
        self.touch(t0);
        self.touch(t1);
        let i = make(t0, t1);
        self.emit(i);
    }

    fn emit3(
        &mut self,
        t0: TempId,
        t1: TempId,
        t2: TempId,
        make: impl FnOnce(TempId, TempId, TempId) -> IrInstr,
    ) {
        self.touch(t0);
        self.touch(t1);
        self.touch(t2);
        let i = make(t0, t1, t2);
        self.emit(i);
    }

    /// Assert + unbox an integer operand, yielding a raw temp.
    fn unbox_int(&mut self, boxed: TempId) -> TempId {
        self.emit1(boxed, |src| IrInstr::AssertInteger { src });
        let raw = self.new_temp();
        self.emit2(raw, boxed, |dest, src| IrInstr::UnboxInteger { dest, src });
        raw
    }

    fn unbox_bool(&mut self, boxed: TempId) -> TempId {
        self.emit1(boxed, |src| IrInstr::AssertBoolean { src });
        let raw = self.new_temp();
        self.emit2(raw, boxed, |dest, src| IrInstr::UnboxBoolean { dest, src });
        raw
    }

    /// Box a raw i32 temp back into a tagged value.
    fn box_int(&mut self, raw: TempId) -> TempId {
        let boxed = self.new_temp();
        self.emit2(boxed, raw, |dest, src| IrInstr::NewInteger { dest, src });
        boxed
    }

    fn box_bool(&mut self, raw: TempId) -> TempId {
        let boxed = self.new_temp();
        self.emit2(boxed, raw, |dest, src| IrInstr::NewBoolean { dest, src });
        boxed
    }

    /// Integer binary op: assert/unbox both sides, apply, box.
    fn int_binop(
        &mut self,
        make: impl FnOnce(TempId, TempId, TempId) -> IrInstr,
        boxed_result: impl FnOnce(&mut Self, TempId) -> TempId,
    ) -> Result<(), Error> {
        let right = self.pop()?;
        let left = self.pop()?;
        let lraw = self.unbox_int(left);
        let rraw = self.unbox_int(right);
        let raw = self.new_temp();
        self.emit3(raw, lraw, rraw, |dest, left, right| make(dest, left, right));
        let out = boxed_result(self, raw);
        self.push(out);
        Ok(())
    }

    fn bool_binop(
        &mut self,
        make: impl FnOnce(TempId, TempId, TempId) -> IrInstr,
    ) -> Result<(), Error> {
        let right = self.pop()?;
        let left = self.pop()?;
        let lraw = self.unbox_bool(left);
        let rraw = self.unbox_bool(right);
        let raw = self.new_temp();
        self.emit3(raw, lraw, rraw, |dest, left, right| make(dest, left, right));
        let out = self.box_bool(raw);
        self.push(out);
        Ok(())
    }

    fn lower_instr(
        &mut self,
        vm: &mut Vm,
        func: &crate::vm::object::Function,
        instr: Instr,
    ) -> Result<(), Error> {
        match instr {
            Instr::LoadConst(i) => {
                let t = self.new_temp();
                self.emit1(t, |dest| IrInstr::LoadConst { dest, index: i });
                self.push(t);
            }
            Instr::LoadFunc(i) => {
                let t = self.new_temp();
                self.emit1(t, |dest| IrInstr::LoadFunc { dest, index: i });
                self.push(t);
            }
            Instr::LoadLocal(i) => {
                let t = self.new_temp();
                if func.is_local_ref(i) {
                    self.emit2(t, i, |dest, cell| IrInstr::LoadReference { dest, cell });
                } else {
                    self.emit2(t, i, |dest, src| IrInstr::LoadLocal { dest, src });
                }
                self.push(t);
            }
            Instr::StoreLocal(i) => {
                let v = self.pop()?;
                if func.is_local_ref(i) {
                    self.emit2(i, v, |cell, src| IrInstr::StoreLocalRef { cell, src });
                } else {
                    self.emit2(i, v, |dest, src| IrInstr::StoreLocal { dest, src });
                }
            }
            Instr::LoadGlobal(i) => {
                let name = intern_name(vm, func, i)?;
                let t = self.new_temp();
                self.emit1(t, |dest| IrInstr::LoadGlobal { dest, name });
                self.push(t);
            }
            Instr::StoreGlobal(i) => {
                let name = intern_name(vm, func, i)?;
                let v = self.pop()?;
                self.emit1(v, |src| IrInstr::StoreGlobal { src, name });
            }
            Instr::PushReference(i) => {
                let t = self.new_temp();
                let n_local_refs = func.local_ref_vars.len();
                if i < n_local_refs {
                    // The cell already sits in the captured local's temp.
                    let name = &func.local_ref_vars[i];
                    let local = func
                        .local_vars
                        .iter()
                        .position(|v| v == name)
                        .ok_or_else(|| {
                            Error::RuntimeError(format!("{name} is not a local"))
                        })?;
                    self.emit2(t, local, |dest, src| IrInstr::PushLocalRef { dest, src });
                } else {
                    let index = i - n_local_refs;
                    self.emit1(t, |dest| IrInstr::PushFreeRef { dest, index });
                }
                self.push(t);
            }
            Instr::LoadReference => {
                let c = self.pop()?;
                self.emit1(c, |src| IrInstr::AssertCell { src });
                let t = self.new_temp();
                self.emit2(t, c, |dest, cell| IrInstr::LoadReference { dest, cell });
                self.push(t);
            }
            Instr::StoreReference => {
                let v = self.pop()?;
                let c = self.pop()?;
                self.emit1(c, |src| IrInstr::AssertCell { src });
                self.emit2(c, v, |cell, src| IrInstr::StoreLocalRef { cell, src });
            }
            Instr::AllocRecord => {
                let t = self.new_temp();
                self.emit1(t, |dest| IrInstr::AllocRecord { dest });
                self.push(t);
            }
            Instr::FieldLoad(i) => {
                let name = intern_name(vm, func, i)?;
                let r = self.pop()?;
                self.emit1(r, |src| IrInstr::AssertRecord { src });
                let t = self.new_temp();
                self.emit2(t, r, |dest, record| IrInstr::FieldLoad { dest, record, name });
                self.push(t);
            }
            Instr::FieldStore(i) => {
                let name = intern_name(vm, func, i)?;
                let v = self.pop()?;
                let r = self.pop()?;
                self.emit1(r, |src| IrInstr::AssertRecord { src });
                self.emit2(r, v, |record, value| IrInstr::FieldStore {
                    record,
                    value,
                    name,
                });
            }
            Instr::IndexLoad => {
                let idx = self.pop()?;
                let r = self.pop()?;
                self.emit1(r, |src| IrInstr::AssertRecord { src });
                let key = self.new_temp();
                self.emit2(key, idx, |dest, src| IrInstr::CastString { dest, src });
                let t = self.new_temp();
                self.emit3(t, r, key, |dest, record, key| IrInstr::IndexLoad {
                    dest,
                    record,
                    key,
                });
                self.push(t);
            }
            Instr::IndexStore => {
                let v = self.pop()?;
                let idx = self.pop()?;
                let r = self.pop()?;
                self.emit1(r, |src| IrInstr::AssertRecord { src });
                let key = self.new_temp();
                self.emit2(key, idx, |dest, src| IrInstr::CastString { dest, src });
                self.emit3(r, key, v, |record, key, value| IrInstr::IndexStore {
                    record,
                    key,
                    value,
                });
            }
            Instr::AllocClosure(n) => {
                // Stack top is the first cell.
                let mut refs = Vec::with_capacity(n);
                for _ in 0..n {
                    refs.push(self.pop()?);
                }
                let funcv = self.pop()?;
                self.emit1(funcv, |src| IrInstr::AssertFunction { src });
                for &r in &refs {
                    self.emit1(r, |src| IrInstr::AssertCell { src });
                }
                let t = self.new_temp();
                self.touch(t);
                self.touch(funcv);
                for &r in &refs {
                    self.touch(r);
                }
                self.emit(IrInstr::AllocClosure {
                    dest: t,
                    func: funcv,
                    refs,
                });
                self.push(t);
            }
            Instr::Call(n) => {
                let mut args = Vec::with_capacity(n);
                for _ in 0..n {
                    args.push(self.pop()?);
                }
                args.reverse();
                let closure = self.pop()?;
                self.emit1(closure, |src| IrInstr::AssertClosure { src });
                let t = self.new_temp();
                self.touch(t);
                self.touch(closure);
                for &a in &args {
                    self.touch(a);
                }
                self.emit(IrInstr::Call {
                    dest: t,
                    closure,
                    args,
                });
                self.push(t);
            }
            Instr::Return => {
                let v = self.pop()?;
                self.emit1(v, |src| IrInstr::Return { src });
            }
            Instr::Add => {
                let right = self.pop()?;
                let left = self.pop()?;
                let t = self.new_temp();
                self.emit3(t, left, right, |dest, left, right| IrInstr::Add {
                    dest,
                    left,
                    right,
                });
                self.push(t);
            }
            Instr::Eq => {
                let right = self.pop()?;
                let left = self.pop()?;
                let t = self.new_temp();
                self.emit3(t, left, right, |dest, left, right| IrInstr::Eq {
                    dest,
                    left,
                    right,
                });
                self.push(t);
            }
            Instr::Sub => self.int_binop(
                |dest, left, right| IrInstr::Sub { dest, left, right },
                |lw, raw| lw.box_int(raw),
            )?,
            Instr::Mul => self.int_binop(
                |dest, left, right| IrInstr::Mul { dest, left, right },
                |lw, raw| lw.box_int(raw),
            )?,
            Instr::Div => self.int_binop(
                |dest, left, right| IrInstr::Div { dest, left, right },
                |lw, raw| lw.box_int(raw),
            )?,
            Instr::Gt => self.int_binop(
                |dest, left, right| IrInstr::Gt { dest, left, right },
                |lw, raw| lw.box_bool(raw),
            )?,
            Instr::Geq => self.int_binop(
                |dest, left, right| IrInstr::Geq { dest, left, right },
                |lw, raw| lw.box_bool(raw),
            )?,
            Instr::Neg => {
                let v = self.pop()?;
                let raw = self.unbox_int(v);
                let out = self.new_temp();
                self.emit2(out, raw, |dest, src| IrInstr::Neg { dest, src });
                let boxed = self.box_int(out);
                self.push(boxed);
            }
            Instr::And => self.bool_binop(|dest, left, right| IrInstr::And {
                dest,
                left,
                right,
            })?,
            Instr::Or => self.bool_binop(|dest, left, right| IrInstr::Or {
                dest,
                left,
                right,
            })?,
            Instr::Not => {
                let v = self.pop()?;
                let raw = self.unbox_bool(v);
                let out = self.new_temp();
                self.emit2(out, raw, |dest, src| IrInstr::Not { dest, src });
                let boxed = self.box_bool(out);
                self.push(boxed);
            }
            Instr::Goto(label) => self.emit(IrInstr::Goto { label }),
            Instr::If(label) => {
                let c = self.pop()?;
                let raw = self.unbox_bool(c);
                self.emit1(raw, |cond| IrInstr::If { cond, label });
            }
            Instr::Label(label) => {
                self.emit(IrInstr::AddLabel { label });
                // Loop headers are safe-points.
                self.emit(IrInstr::GarbageCollect);
            }
            Instr::Dup => {
                let t = self.peek()?;
                self.push(t);
            }
            Instr::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a);
                self.push(b);
            }
            Instr::Pop => {
                self.pop()?;
            }
        }
        Ok(())
    }
}

fn intern_name(
    vm: &mut Vm,
    func: &crate::vm::object::Function,
    index: usize,
) -> Result<Value, Error> {
    let name = func
        .names
        .get(index)
        .ok_or_else(|| Error::RuntimeError(format!("name {index} out of bounds")))?;
    Ok(vm.strings.intern(name))
}

/// Extend the interval of every temp live across a backward branch to cover
/// that branch. Linear intervals otherwise underestimate loop lifetimes and
/// the allocator would hand a looping temp's register to a later temp.
fn extend_over_back_edges(ir: &mut IrFunction) {
    let mut label_index: FxHashMap<i32, usize> = FxHashMap::default();
    for (i, instr) in ir.instrs.iter().enumerate() {
        if let IrInstr::AddLabel { label } = instr {
            label_index.insert(*label, i);
        }
    }
    for i in 0..ir.instrs.len() {
        let label = match &ir.instrs[i] {
            IrInstr::Goto { label } => *label,
            IrInstr::If { label, .. } => *label,
            _ => continue,
        };
        let Some(&target) = label_index.get(&label) else {
            continue;
        };
        if target > i {
            continue;
        }
        let branch = i as i32;
        let target = target as i32;
        for t in &mut ir.temps {
            if t.is_referenced() && t.start <= branch && t.end >= target && t.end < branch {
                t.end = branch;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;
    use crate::vm::{Vm, VmOptions};

    fn lower_src(src: &str) -> (Box<Vm>, IrFunction) {
        let mut vm = Vm::new_captured(VmOptions::default());
        let main = compile_source(&mut vm, src).unwrap();
        let ir = lower(&mut vm, main.as_obj().unwrap()).unwrap();
        (vm, ir)
    }

    #[test]
    fn test_sub_gets_asserts_and_unboxes() {
        let (_vm, ir) = lower_src("x = 3 - 1;");
        let text: Vec<String> = ir.instrs.iter().map(|i| i.to_string()).collect();
        let joined = text.join("\n");
        assert!(joined.contains("assert_int"));
        assert!(joined.contains("unbox_int"));
        assert!(joined.contains("box_int"));
        assert!(joined.contains(" - "));
    }

    #[test]
    fn test_add_stays_polymorphic() {
        let (_vm, ir) = lower_src("x = \"a\" + 1;");
        let joined: String = ir
            .instrs
            .iter()
            .map(|i| i.to_string() + "\n")
            .collect();
        // The add itself must not be preceded by integer unboxing.
        assert!(joined.contains(" + "));
        assert!(!joined.contains("unbox_int"));
    }

    #[test]
    fn test_every_referenced_temp_has_interval() {
        let (_vm, ir) = lower_src("x = 1; y = x + 2; print(y);");
        for t in &ir.temps {
            if t.is_referenced() {
                assert!(t.end >= t.start, "t{} interval", t.index);
            }
        }
    }

    #[test]
    fn test_labels_emit_gc_safepoint() {
        let (_vm, ir) = lower_src("while (1 > 0) { x = 1; }");
        let mut found = false;
        for w in ir.instrs.windows(2) {
            if matches!(w[0], IrInstr::AddLabel { .. })
                && matches!(w[1], IrInstr::GarbageCollect)
            {
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn test_back_edge_extends_intervals() {
        let (_vm, ir) = lower_src("i = 10; while (i > 0) { i = i - 1; }");
        // Find the backward branch.
        let mut labels = FxHashMap::default();
        for (i, instr) in ir.instrs.iter().enumerate() {
            if let IrInstr::AddLabel { label } = instr {
                labels.insert(*label, i);
            }
        }
        let mut back_edge = None;
        for (i, instr) in ir.instrs.iter().enumerate() {
            if let IrInstr::If { label, .. } = instr {
                if labels[label] <= i {
                    back_edge = Some((labels[label], i));
                }
            }
        }
        let (target, branch) = back_edge.expect("loop has a back edge");
        // Every temp live into the loop reaches the branch.
        for t in &ir.temps {
            if t.is_referenced() && (t.start as usize) < target && t.end >= target as i32 {
                assert!(t.end >= branch as i32, "t{} not extended", t.index);
            }
        }
    }
}
