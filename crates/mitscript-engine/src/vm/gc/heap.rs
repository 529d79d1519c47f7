//! Collected heap: allocation tracking and mark-sweep collection
//!
//! All heap objects are created through [`CollectedHeap::allocate`] (or
//! [`CollectedHeap::allocate_permanent`] for objects that live for the whole
//! program: the `None` singleton and compiled function metadata). Allocation
//! charges the object's size against the configured budget; when an
//! allocation would push the total over the budget, a collection runs first
//! and the allocation then proceeds unconditionally.

use super::header::GcHeader;
use super::roots::RootSet;
use crate::vm::object::{HeapObj, ObjData, ObjRef};
use crate::vm::value::Value;
use std::mem;
use std::ptr::NonNull;

/// Mark-sweep collected heap with a strict byte budget.
pub struct CollectedHeap {
    /// Collectable allocations.
    allocated: Vec<ObjRef>,
    /// Never-swept allocations: the None singleton and function metadata.
    /// These only reference other permanent objects or inline/interned
    /// values, so stale mark bits on them are harmless.
    permanent: Vec<ObjRef>,
    /// Live byte total, including post-allocation growth charges.
    bytes: usize,
    /// Budget in bytes; exceeding it triggers collection at the next
    /// safe-point or allocation.
    max_bytes: usize,
    /// Live frames; externally maintained by the interpreter and the JIT
    /// call path.
    pub roots: RootSet,
}

impl CollectedHeap {
    /// Budget given in megabytes, as on the command line.
    pub fn new(max_mb: usize) -> CollectedHeap {
        CollectedHeap {
            allocated: Vec::new(),
            permanent: Vec::new(),
            bytes: 0,
            max_bytes: max_mb * 1_000_000,
            roots: RootSet::new(),
        }
    }

    fn total_size(data: &ObjData) -> usize {
        mem::size_of::<HeapObj>() + data.size_bytes()
    }

    /// Allocate a collectable object, collecting first if the budget would
    /// be exceeded. Every value reachable from `data` must be visible to the
    /// collector (on an operand stack, in a rooted frame, or permanent) when
    /// this is called.
    pub fn allocate(&mut self, data: ObjData) -> Value {
        let size = Self::total_size(&data);
        if self.bytes + size > self.max_bytes {
            self.collect();
        }
        self.register(data, size, false)
    }

    /// Allocate an object exempt from sweeping.
    pub fn allocate_permanent(&mut self, data: ObjData) -> Value {
        let size = Self::total_size(&data);
        self.register(data, size, true)
    }

    fn register(&mut self, data: ObjData, size: usize, permanent: bool) -> Value {
        let raw = Box::into_raw(Box::new(HeapObj {
            header: GcHeader::new(size),
            data,
        }));
        // SAFETY: Box::into_raw never returns null.
        let r = unsafe { ObjRef::from_ptr(NonNull::new_unchecked(raw)) };
        if permanent {
            self.permanent.push(r);
        } else {
            self.allocated.push(r);
        }
        self.bytes += size;
        r.value()
    }

    /// Charge growth of an existing object (record insert, frame var,
    /// operand push).
    pub fn charge(&mut self, delta: usize) {
        self.bytes += delta;
    }

    /// Release bytes charged earlier (operand pop).
    pub fn uncharge(&mut self, delta: usize) {
        self.bytes = self.bytes.saturating_sub(delta);
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Number of collectable objects currently live.
    pub fn count(&self) -> usize {
        self.allocated.len()
    }

    /// Safe-point entry: collect only when over budget.
    pub fn collect_if_needed(&mut self) {
        if self.bytes > self.max_bytes {
            self.collect();
        }
    }

    /// Run a full mark-sweep collection from the frame roots.
    pub fn collect(&mut self) {
        // Mark.
        let mut worklist: Vec<ObjRef> = self.roots.iter().collect();
        while let Some(r) = worklist.pop() {
            let obj = r.obj_mut();
            if obj.header.is_marked() {
                continue;
            }
            obj.header.mark();
            obj.data.trace(&mut worklist);
        }

        // Sweep: free unmarked objects, clear marks on survivors.
        let mut survivors = Vec::with_capacity(self.allocated.len());
        for &r in &self.allocated {
            if r.obj().header.is_marked() {
                r.obj_mut().header.unmark();
                survivors.push(r);
            } else {
                let size = Self::total_size(&r.obj().data);
                self.bytes = self.bytes.saturating_sub(size);
                // SAFETY: the object was created by Box::into_raw in
                // `register` and is unreachable from any root.
                unsafe { drop(Box::from_raw(r.as_ptr())) };
            }
        }
        self.allocated = survivors;
    }
}

impl Drop for CollectedHeap {
    fn drop(&mut self) {
        for &r in self.allocated.iter().chain(self.permanent.iter()) {
            // SAFETY: every entry came from Box::into_raw and is freed
            // exactly once here.
            unsafe { drop(Box::from_raw(r.as_ptr())) };
        }
        self.allocated.clear();
        self.permanent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::frame::Frame;
    use crate::vm::object::{Cell, Record};

    fn record() -> ObjData {
        ObjData::Record(Record::default())
    }

    #[test]
    fn test_allocate_tracks_bytes_and_count() {
        let mut heap = CollectedHeap::new(1);
        assert_eq!(heap.bytes(), 0);
        let v = heap.allocate(record());
        assert!(v.is_heap());
        assert_eq!(heap.count(), 1);
        assert!(heap.bytes() > 0);
    }

    #[test]
    fn test_collect_frees_unrooted() {
        let mut heap = CollectedHeap::new(1);
        for _ in 0..10 {
            heap.allocate(record());
        }
        assert_eq!(heap.count(), 10);
        heap.collect();
        assert_eq!(heap.count(), 0);
        assert_eq!(heap.bytes(), 0);
    }

    #[test]
    fn test_rooted_frame_keeps_stack_values_alive() {
        let mut heap = CollectedHeap::new(1);
        let func = heap.allocate_permanent(ObjData::Function(
            crate::vm::object::Function::with_arity(0, crate::vm::object::FunctionKind::Normal),
        ));
        let frame_v = heap.allocate(ObjData::Frame(Frame::new(func)));
        let frame = frame_v.as_obj().unwrap();
        heap.roots.push(frame);

        let rec = heap.allocate(record());
        frame.as_frame_mut().unwrap().op_stack.push(rec);
        let garbage = heap.allocate(record());
        let _ = garbage;

        heap.collect();
        // Frame and the record on its stack survive; the garbage record dies.
        assert_eq!(heap.count(), 2);
        assert_eq!(rec.as_obj().unwrap().obj().type_name(), "record");
    }

    #[test]
    fn test_second_collect_reclaims_nothing() {
        let mut heap = CollectedHeap::new(1);
        let func = heap.allocate_permanent(ObjData::Function(
            crate::vm::object::Function::with_arity(0, crate::vm::object::FunctionKind::Normal),
        ));
        let frame_v = heap.allocate(ObjData::Frame(Frame::new(func)));
        heap.roots.push(frame_v.as_obj().unwrap());
        for _ in 0..5 {
            heap.allocate(record());
        }
        heap.collect();
        let bytes = heap.bytes();
        let count = heap.count();
        heap.collect();
        assert_eq!(heap.bytes(), bytes);
        assert_eq!(heap.count(), count);
    }

    #[test]
    fn test_cells_follow_their_slot() {
        let mut heap = CollectedHeap::new(1);
        let func = heap.allocate_permanent(ObjData::Function(
            crate::vm::object::Function::with_arity(0, crate::vm::object::FunctionKind::Normal),
        ));
        let frame_v = heap.allocate(ObjData::Frame(Frame::new(func)));
        let frame = frame_v.as_obj().unwrap();
        heap.roots.push(frame);

        let rec = heap.allocate(record());
        let cell = heap.allocate(ObjData::Cell(Cell { slot: rec }));
        frame.as_frame_mut().unwrap().jit_temps.push(cell);

        heap.collect();
        assert_eq!(heap.count(), 3);
    }

    #[test]
    fn test_over_budget_allocation_collects_first() {
        // A zero-megabyte heap collects on every allocation.
        let mut heap = CollectedHeap::new(0);
        for _ in 0..100 {
            heap.allocate(record());
        }
        // No roots, so at most the newest allocation survives each cycle.
        assert!(heap.count() <= 1 + 1);
    }
}
