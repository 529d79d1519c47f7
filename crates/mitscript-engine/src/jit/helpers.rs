//! Runtime helpers callable from generated code
//!
//! Every helper takes the VM pointer first and uses the SysV ABI. Helpers
//! that hand a possibly-heap value back to generated code pin it in the
//! current frame's temp list first: generated code keeps values in machine
//! registers the collector cannot scan, so pinning for the activation's
//! lifetime is the sound over-approximation of liveness. An error inside a
//! helper cannot unwind through generated frames; it prints the
//! `Kind: message` line and exits with status 1, which is the same
//! user-visible contract as the interpreter path.

use crate::error::Error;
use crate::vm::object::{Cell, Closure, ObjData};
use crate::vm::value::Value;
use crate::vm::Vm;

/// SAFETY: helpers run strictly inside a call from `Vm::call_compiled`, so
/// the pointer is the live boxed VM and no other reference is active.
fn vm_mut<'a>(vm: *mut Vm) -> &'a mut Vm {
    unsafe { &mut *vm }
}

fn bail(e: Error) -> ! {
    eprintln!("{e}");
    std::process::exit(1);
}

fn ok<T>(r: Result<T, Error>) -> T {
    match r {
        Ok(v) => v,
        Err(e) => bail(e),
    }
}

// ----------------------------------------------------------------------
// Globals
// ----------------------------------------------------------------------

pub extern "sysv64" fn helper_load_global(vm: *mut Vm, name: Value) -> Value {
    let vm = vm_mut(vm);
    let name = ok(name.as_str());
    let v = ok(vm.load_global(name));
    vm.pin(v);
    v
}

pub extern "sysv64" fn helper_store_global(vm: *mut Vm, name: Value, val: Value) {
    let vm = vm_mut(vm);
    let name = ok(name.as_str());
    ok(vm.store_global(name, val));
}

// ----------------------------------------------------------------------
// Polymorphic arithmetic
// ----------------------------------------------------------------------

pub extern "sysv64" fn helper_add(vm: *mut Vm, left: Value, right: Value) -> Value {
    let vm = vm_mut(vm);
    ok(vm.value_add(left, right))
}

pub extern "sysv64" fn helper_eq(vm: *mut Vm, left: Value, right: Value) -> Value {
    let vm = vm_mut(vm);
    ok(vm.value_eq(left, right))
}

pub extern "sysv64" fn helper_cast_string(vm: *mut Vm, v: Value) -> Value {
    let vm = vm_mut(vm);
    ok(vm.value_cast_string(v))
}

// ----------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------

pub extern "sysv64" fn helper_new_record(vm: *mut Vm) -> Value {
    let vm = vm_mut(vm);
    let r = vm.heap.allocate(ObjData::Record(Default::default()));
    vm.pin(r);
    r
}

pub extern "sysv64" fn helper_get_field(vm: *mut Vm, name: Value, record: Value) -> Value {
    let vm = vm_mut(vm);
    let name = ok(name.as_str());
    let rec = ok(ok(record.as_obj()).as_record());
    let v = rec.get(name).unwrap_or_else(|| vm.none());
    vm.pin(v);
    v
}

pub extern "sysv64" fn helper_set_field(vm: *mut Vm, name: Value, record: Value, val: Value) {
    let vm = vm_mut(vm);
    let name = ok(name.as_str());
    let rec = ok(ok(record.as_obj()).as_record_mut());
    let delta = rec.set(name, val);
    vm.heap.charge(delta);
}

pub extern "sysv64" fn helper_get_index(vm: *mut Vm, key: Value, record: Value) -> Value {
    let vm = vm_mut(vm);
    let key = ok(key.as_str());
    let rec = ok(ok(record.as_obj()).as_record());
    let v = rec.get(key).unwrap_or_else(|| vm.none());
    vm.pin(v);
    v
}

pub extern "sysv64" fn helper_set_index(vm: *mut Vm, key: Value, record: Value, val: Value) {
    let vm = vm_mut(vm);
    let key = ok(key.as_str());
    let rec = ok(ok(record.as_obj()).as_record_mut());
    let delta = rec.set(key, val);
    vm.heap.charge(delta);
}

// ----------------------------------------------------------------------
// Cells, closures, calls
// ----------------------------------------------------------------------

pub extern "sysv64" fn helper_new_cell(vm: *mut Vm, val: Value) -> Value {
    let vm = vm_mut(vm);
    let cell = vm.heap.allocate(ObjData::Cell(Cell { slot: val }));
    vm.pin(cell);
    cell
}

pub extern "sysv64" fn helper_store_cell(vm: *mut Vm, val: Value, cell: Value) {
    let _ = vm;
    ok(ok(cell.as_obj()).as_cell_mut()).slot = val;
}

pub extern "sysv64" fn helper_unbox_cell(vm: *mut Vm, cell: Value) -> Value {
    let vm = vm_mut(vm);
    let v = ok(ok(cell.as_obj()).as_cell()).slot;
    if v.is_null() {
        bail(Error::UninitializedVariable(
            "reference read before assignment".to_string(),
        ));
    }
    vm.pin(v);
    v
}

pub extern "sysv64" fn helper_new_closure(
    vm: *mut Vm,
    n: u64,
    func: Value,
    cells: *const Value,
) -> Value {
    let vm = vm_mut(vm);
    // SAFETY: generated code pushed exactly `n` cell words contiguously and
    // passes rsp; the array outlives this call.
    let cells = unsafe { std::slice::from_raw_parts(cells, n as usize) };
    let f = ok(ok(func.as_obj()).as_function());
    if f.free_vars.len() != n as usize {
        bail(Error::RuntimeError(format!(
            "expected {} reference variables but got {}",
            f.free_vars.len(),
            n
        )));
    }
    for &c in cells {
        ok(ok(c.as_obj()).as_cell());
    }
    let clos = vm.heap.allocate(ObjData::Closure(Closure {
        func,
        cells: cells.to_vec(),
    }));
    vm.pin(clos);
    clos
}

pub extern "sysv64" fn helper_call(
    vm: *mut Vm,
    n: u64,
    closure: Value,
    args: *const Value,
) -> Value {
    let vm = vm_mut(vm);
    // SAFETY: as in `helper_new_closure`, the argument array sits on the
    // caller's generated frame and stays valid for the whole call.
    let args = unsafe { std::slice::from_raw_parts(args, n as usize) };
    ok(vm.call_compiled(closure, args))
}

pub extern "sysv64" fn helper_gc(vm: *mut Vm) {
    vm_mut(vm).heap.collect_if_needed();
}

// ----------------------------------------------------------------------
// Type assertions and division precondition
// ----------------------------------------------------------------------

pub extern "sysv64" fn helper_assert_int(vm: *mut Vm, v: Value) {
    let _ = vm;
    if !v.is_int() {
        bail(Error::type_error("integer", v.type_name()));
    }
}

pub extern "sysv64" fn helper_assert_bool(vm: *mut Vm, v: Value) {
    let _ = vm;
    if !v.is_bool() {
        bail(Error::type_error("boolean", v.type_name()));
    }
}

pub extern "sysv64" fn helper_assert_str(vm: *mut Vm, v: Value) {
    let _ = vm;
    if !v.is_str() {
        bail(Error::type_error("string", v.type_name()));
    }
}

pub extern "sysv64" fn helper_assert_record(vm: *mut Vm, v: Value) {
    let _ = vm;
    ok(ok(v.as_obj()).as_record());
}

pub extern "sysv64" fn helper_assert_function(vm: *mut Vm, v: Value) {
    let _ = vm;
    ok(ok(v.as_obj()).as_function());
}

pub extern "sysv64" fn helper_assert_closure(vm: *mut Vm, v: Value) {
    let _ = vm;
    ok(ok(v.as_obj()).as_closure());
}

pub extern "sysv64" fn helper_assert_cell(vm: *mut Vm, v: Value) {
    let _ = vm;
    ok(ok(v.as_obj()).as_cell());
}

pub extern "sysv64" fn helper_assert_nonzero(vm: *mut Vm, v: i64) {
    let _ = vm;
    if v as i32 == 0 {
        bail(Error::ArithmeticError("cannot divide by 0".to_string()));
    }
}
