//! Linear-scan register allocation over IR temporaries
//!
//! Temps are walked in ascending interval start. Expired intervals return
//! their registers to the pool; when the active set is full, the
//! latest-ending interval loses its register (the classic steal-or-spill
//! choice). Spill slots are handed out contiguously from zero.
//!
//! The roster holds general-purpose registers excluding rsp/rbp, rax (the
//! return register), r10 (the reserved call scratch), and the six SysV
//! argument registers — keeping argument marshaling clobber-free. Scratch
//! needs inside code generation use rax/rcx/rdx, which are never temp homes.

use crate::jit::ir::IrFunction;
use dynasmrt::x64::Rq;

/// Allocatable registers. All but r11 are callee-saved, so temps survive
/// helper calls for free; r11 is preserved by the helper-call save/restore
/// protocol.
pub const ALLOCATABLE: [Rq; 6] = [Rq::RBX, Rq::R12, Rq::R13, Rq::R14, Rq::R15, Rq::R11];

/// Annotate every referenced temp with a register or a spill slot and
/// record the spill-slot count on the function.
pub fn allocate_registers(ir: &mut IrFunction) {
    let mut order: Vec<usize> = ir
        .temps
        .iter()
        .filter(|t| t.is_referenced())
        .map(|t| t.index)
        .collect();
    order.sort_by_key(|&i| ir.temps[i].start);

    let mut free: Vec<Rq> = ALLOCATABLE.to_vec();
    // Active temps, kept sorted by ascending interval end.
    let mut active: Vec<usize> = Vec::new();
    let mut next_slot = 0usize;

    for &i in &order {
        let start = ir.temps[i].start;

        // Expire intervals that ended before this one starts.
        let mut kept = Vec::with_capacity(active.len());
        for &j in &active {
            if ir.temps[j].end < start {
                if let Some(r) = ir.temps[j].reg {
                    free.push(r);
                }
            } else {
                kept.push(j);
            }
        }
        active = kept;

        if let Some(r) = free.pop() {
            ir.temps[i].reg = Some(r);
            insert_by_end(&mut active, ir, i);
        } else {
            // Steal from the latest-ending active interval, or spill the
            // newcomer if it ends even later.
            let &last = active.last().expect("active set is full");
            if ir.temps[last].end > ir.temps[i].end {
                ir.temps[i].reg = ir.temps[last].reg.take();
                ir.temps[last].slot = Some(next_slot);
                next_slot += 1;
                active.pop();
                insert_by_end(&mut active, ir, i);
            } else {
                ir.temps[i].slot = Some(next_slot);
                next_slot += 1;
            }
        }
    }

    ir.spill_slots = next_slot;
}

fn insert_by_end(active: &mut Vec<usize>, ir: &IrFunction, i: usize) {
    let pos = active
        .binary_search_by_key(&(ir.temps[i].end, i), |&j| (ir.temps[j].end, j))
        .unwrap_or_else(|p| p);
    active.insert(pos, i);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;
    use crate::jit::lower::lower;
    use crate::vm::{Vm, VmOptions};

    fn allocated(src: &str) -> IrFunction {
        let mut vm = Vm::new_captured(VmOptions::default());
        let main = compile_source(&mut vm, src).unwrap();
        let mut ir = lower(&mut vm, main.as_obj().unwrap()).unwrap();
        allocate_registers(&mut ir);
        ir
    }

    #[test]
    fn test_every_referenced_temp_has_one_location() {
        let ir = allocated("x = 1; y = x + 2; z = y * y; print(z);");
        for t in &ir.temps {
            if t.is_referenced() {
                assert!(
                    t.reg.is_some() ^ t.slot.is_some(),
                    "t{} must have exactly one location",
                    t.index
                );
            } else {
                assert!(t.reg.is_none() && t.slot.is_none());
            }
        }
    }

    #[test]
    fn test_spill_slots_contiguous() {
        // Enough simultaneously-live values to overflow six registers.
        let src = "r = { a: 1; b: 2; }; \
                   f = fun(a1, a2, a3, a4, a5, a6, a7, a8) { \
                       return a1 + a2 + a3 + a4 + a5 + a6 + a7 + a8; \
                   }; \
                   print(f(1, 2, 3, 4, 5, 6, 7, 8));";
        let ir = allocated(src);
        let mut slots: Vec<usize> = ir.temps.iter().filter_map(|t| t.slot).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), ir.spill_slots);
        for (i, s) in slots.iter().enumerate() {
            assert_eq!(i, *s, "slots must be contiguous from zero");
        }
    }

    #[test]
    fn test_no_overlapping_register_assignment() {
        let ir = allocated("i = 20; s = 0; while (i > 0) { s = s + i; i = i - 1; } print(s);");
        let temps = &ir.temps;
        for a in temps {
            for b in temps {
                if a.index >= b.index || a.reg.is_none() || a.reg != b.reg {
                    continue;
                }
                let disjoint = a.end < b.start || b.end < a.start;
                assert!(
                    disjoint,
                    "t{} and t{} share {:?} with overlapping intervals",
                    a.index, b.index, a.reg
                );
            }
        }
    }
}
