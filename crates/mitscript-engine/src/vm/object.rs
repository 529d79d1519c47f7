//! Heap-resident value variants
//!
//! Every collectable object is a [`HeapObj`]: a GC header followed by one of
//! the closed set of variants in [`ObjData`]. The variant discriminant plus
//! the inline pointer tag replace the dynamic downcasts of a class-based
//! object model; every cast is a discriminant check that fails cleanly with
//! `TypeError`.

use crate::compiler::instr::Instr;
use crate::error::Error;
use crate::jit::NativeCode;
use crate::vm::frame::Frame;
use crate::vm::gc::GcHeader;
use crate::vm::value::Value;
use once_cell::unsync::OnceCell;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// Per-entry byte cost of a string-keyed map slot, shared by the record and
/// frame size accounting so charges and sweep-time sizes agree.
pub(crate) const MAP_ENTRY_COST: usize = 40;

/// A heap allocation: header plus variant payload.
pub struct HeapObj {
    pub(crate) header: GcHeader,
    pub data: ObjData,
}

/// The closed set of heap variants.
pub enum ObjData {
    /// Singleton sentinel for the absence of a value.
    None,
    /// Mutable ordered mapping from string key to value.
    Record(Record),
    /// A single mutable slot; the unit of sharing for captured locals.
    Cell(Cell),
    /// Immutable compiled function metadata.
    Function(Function),
    /// A function plus the cells captured for its free variables.
    Closure(Closure),
    /// A live call activation, rooted in the GC while on the frame stack.
    Frame(Frame),
}

/// Record object: key-sorted so the printed form is deterministic.
#[derive(Default)]
pub struct Record {
    pub fields: BTreeMap<String, Value>,
}

/// One mutable tagged slot.
pub struct Cell {
    pub slot: Value,
}

/// A function plus its captured reference cells, one per free variable and
/// in the same order as the function's free-variable list.
pub struct Closure {
    pub func: Value,
    pub cells: Vec<Value>,
}

/// Which body a function runs when called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Ordinary bytecode body.
    Normal,
    /// `print(s)` builtin.
    Print,
    /// `input()` builtin.
    Input,
    /// `intcast(s)` builtin.
    Intcast,
}

/// Compiled function metadata. Immutable after compilation except for the
/// `native` slot, which transitions at most once from absent to present.
pub struct Function {
    /// Functions defined directly within this one.
    pub functions: Vec<Value>,
    /// Constants referenced by this function's instructions.
    pub constants: Vec<Value>,
    /// Number of parameters; the first `parameter_count` locals are the
    /// parameters in declaration order.
    pub parameter_count: usize,
    /// All local variable names.
    pub local_vars: Vec<String>,
    /// Subset of locals captured by reference from nested functions.
    pub local_ref_vars: Vec<String>,
    /// Names of non-global, non-local variables this function reads.
    pub free_vars: Vec<String>,
    /// Global variable and record field names used by the instructions.
    pub names: Vec<String>,
    /// Bytecode body.
    pub instructions: Vec<Instr>,
    /// Label id to instruction index.
    pub labels: FxHashMap<i32, usize>,
    /// Bytecode body or one of the native builtins.
    pub kind: FunctionKind,
    /// Lazily compiled machine code.
    pub native: OnceCell<NativeCode>,
}

impl Function {
    /// Empty function shell with a given arity; used for the builtins and as
    /// the starting point of the bytecode compiler.
    pub fn with_arity(parameter_count: usize, kind: FunctionKind) -> Function {
        Function {
            functions: Vec::new(),
            constants: Vec::new(),
            parameter_count,
            local_vars: Vec::new(),
            local_ref_vars: Vec::new(),
            free_vars: Vec::new(),
            names: Vec::new(),
            instructions: Vec::new(),
            labels: FxHashMap::default(),
            kind,
            native: OnceCell::new(),
        }
    }

    /// True when local `index` is captured by reference.
    pub fn is_local_ref(&self, index: usize) -> bool {
        self.local_ref_vars.contains(&self.local_vars[index])
    }
}

impl Record {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.fields.get(key).copied()
    }

    /// Insert or overwrite a field. Returns the byte delta to charge to the
    /// heap (nonzero only for new keys).
    pub fn set(&mut self, key: &str, val: Value) -> usize {
        if self.fields.insert(key.to_string(), val).is_none() {
            key.len() + MAP_ENTRY_COST
        } else {
            0
        }
    }
}

impl HeapObj {
    /// Variant name used in `TypeError` messages and by `intcast`.
    pub fn type_name(&self) -> &'static str {
        match self.data {
            ObjData::None => "none",
            ObjData::Record(_) => "record",
            ObjData::Cell(_) => "cell",
            ObjData::Function(_) => "function",
            ObjData::Closure(_) => "closure",
            ObjData::Frame(_) => "frame",
        }
    }

    /// Printable representation. Functions, cells, and frames have none.
    pub fn display_string(&self) -> Result<String, Error> {
        match &self.data {
            ObjData::None => Ok("None".to_string()),
            ObjData::Record(r) => {
                let mut out = String::from("{");
                for (k, v) in &r.fields {
                    out.push_str(k);
                    out.push(':');
                    out.push_str(&v.display_string()?);
                    out.push(' ');
                }
                out.push('}');
                Ok(out)
            }
            ObjData::Closure(_) => Ok("FUNCTION".to_string()),
            ObjData::Function(_) => Err(Error::RuntimeError(
                "can't cast function to a string (try a closure instead)".to_string(),
            )),
            ObjData::Cell(_) => {
                Err(Error::RuntimeError("can't cast cell to a string".to_string()))
            }
            ObjData::Frame(_) => {
                Err(Error::RuntimeError("can't cast frame to a string".to_string()))
            }
        }
    }

    /// Structural equality between two heap objects: records pointwise by
    /// word, closures by identity of function and cell vector. Functions,
    /// cells, and frames are not comparable.
    pub fn equals(&self, other: &HeapObj) -> Result<bool, Error> {
        match (&self.data, &other.data) {
            (ObjData::None, ObjData::None) => Ok(true),
            (ObjData::Record(a), ObjData::Record(b)) => Ok(a.fields == b.fields),
            (ObjData::Closure(a), ObjData::Closure(b)) => {
                Ok(a.func == b.func && a.cells == b.cells)
            }
            (ObjData::Function(_), _) | (_, ObjData::Function(_)) => Err(Error::RuntimeError(
                "can't call equals on a function".to_string(),
            )),
            (ObjData::Cell(_), _) | (_, ObjData::Cell(_)) => {
                Err(Error::RuntimeError("can't call equals on a cell".to_string()))
            }
            (ObjData::Frame(_), _) | (_, ObjData::Frame(_)) => {
                Err(Error::RuntimeError("can't call equals on a frame".to_string()))
            }
            _ => Ok(false),
        }
    }
}

impl ObjData {
    /// Bytes this variant occupies beyond the fixed `HeapObj` overhead.
    /// The formulas match the incremental charges made as objects grow, so
    /// the heap counter stays consistent at sweep time.
    pub fn size_bytes(&self) -> usize {
        match self {
            ObjData::None => 0,
            ObjData::Cell(_) => 0,
            ObjData::Record(r) => r
                .fields
                .keys()
                .map(|k| k.len() + MAP_ENTRY_COST)
                .sum(),
            ObjData::Closure(c) => 8 * c.cells.capacity(),
            ObjData::Function(f) => {
                let strings: usize = f
                    .local_vars
                    .iter()
                    .chain(&f.local_ref_vars)
                    .chain(&f.free_vars)
                    .chain(&f.names)
                    .map(|s| s.len() + 24)
                    .sum();
                8 * f.functions.capacity()
                    + 8 * f.constants.capacity()
                    + strings
                    + f.instructions.capacity() * std::mem::size_of::<Instr>()
                    + f.labels.len() * 16
            }
            ObjData::Frame(fr) => {
                let vars: usize = fr
                    .vars
                    .keys()
                    .map(|k| k.len() + MAP_ENTRY_COST)
                    .sum();
                8 * fr.op_stack.len() + vars + 8 * fr.jit_temps.len()
            }
        }
    }

    /// Push every heap successor of this object onto the mark worklist.
    pub fn trace(&self, worklist: &mut Vec<ObjRef>) {
        let mut follow = |v: Value| {
            if v.is_heap() {
                // A heap-tagged word always holds a live object pointer.
                worklist.push(v.as_obj().expect("heap-tagged word"));
            }
        };
        match self {
            ObjData::None => {}
            ObjData::Record(r) => {
                for &v in r.fields.values() {
                    follow(v);
                }
            }
            ObjData::Cell(c) => follow(c.slot),
            ObjData::Function(f) => {
                for &c in &f.constants {
                    follow(c);
                }
                for &nested in &f.functions {
                    follow(nested);
                }
            }
            ObjData::Closure(c) => {
                follow(c.func);
                for &cell in &c.cells {
                    follow(cell);
                }
            }
            ObjData::Frame(fr) => {
                follow(fr.func);
                for &v in &fr.op_stack {
                    follow(v);
                }
                for &cell in fr.vars.values() {
                    follow(cell);
                }
                for &v in &fr.jit_temps {
                    follow(v);
                }
            }
        }
    }
}

/// Copyable reference to a heap object.
///
/// The VM is strictly single-threaded and the collected heap never moves
/// objects, so a raw pointer wrapper with narrowly-scoped borrows is sound
/// as long as no two live references to the same object overlap. All access
/// goes through `obj`/`obj_mut`, which callers keep short-lived.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(NonNull<HeapObj>);

impl ObjRef {
    /// Wrap a heap pointer.
    ///
    /// # Safety
    ///
    /// `p` must point at a live `HeapObj` owned by the collected heap (or
    /// its permanent list).
    pub unsafe fn from_ptr(p: NonNull<HeapObj>) -> ObjRef {
        ObjRef(p)
    }

    /// The tagged word for this object.
    #[inline]
    pub fn value(self) -> Value {
        Value::from_obj(self.0)
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> *mut HeapObj {
        self.0.as_ptr()
    }

    /// Borrow the object.
    #[inline]
    pub fn obj<'a>(self) -> &'a HeapObj {
        // SAFETY: single-threaded VM, object is live, borrow kept short.
        unsafe { &*self.0.as_ptr() }
    }

    /// Borrow the object mutably.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub fn obj_mut<'a>(self) -> &'a mut HeapObj {
        // SAFETY: single-threaded VM, object is live, borrow kept short and
        // never overlapped with another reference to the same object.
        unsafe { &mut *self.0.as_ptr() }
    }

    pub fn as_record<'a>(self) -> Result<&'a Record, Error> {
        match &self.obj().data {
            ObjData::Record(r) => Ok(r),
            _ => Err(Error::type_error("record", self.obj().type_name())),
        }
    }

    pub fn as_record_mut<'a>(self) -> Result<&'a mut Record, Error> {
        let name = self.obj().type_name();
        match &mut self.obj_mut().data {
            ObjData::Record(r) => Ok(r),
            _ => Err(Error::type_error("record", name)),
        }
    }

    pub fn as_cell<'a>(self) -> Result<&'a Cell, Error> {
        match &self.obj().data {
            ObjData::Cell(c) => Ok(c),
            _ => Err(Error::type_error("cell", self.obj().type_name())),
        }
    }

    pub fn as_cell_mut<'a>(self) -> Result<&'a mut Cell, Error> {
        let name = self.obj().type_name();
        match &mut self.obj_mut().data {
            ObjData::Cell(c) => Ok(c),
            _ => Err(Error::type_error("cell", name)),
        }
    }

    pub fn as_function<'a>(self) -> Result<&'a Function, Error> {
        match &self.obj().data {
            ObjData::Function(f) => Ok(f),
            _ => Err(Error::type_error("function", self.obj().type_name())),
        }
    }

    pub fn as_closure<'a>(self) -> Result<&'a Closure, Error> {
        match &self.obj().data {
            ObjData::Closure(c) => Ok(c),
            _ => Err(Error::type_error("closure", self.obj().type_name())),
        }
    }

    pub fn as_frame<'a>(self) -> Result<&'a Frame, Error> {
        match &self.obj().data {
            ObjData::Frame(f) => Ok(f),
            _ => Err(Error::type_error("frame", self.obj().type_name())),
        }
    }

    pub fn as_frame_mut<'a>(self) -> Result<&'a mut Frame, Error> {
        let name = self.obj().type_name();
        match &mut self.obj_mut().data {
            ObjData::Frame(f) => Ok(f),
            _ => Err(Error::type_error("frame", name)),
        }
    }
}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjRef({:p}: {})", self.0.as_ptr(), self.obj().type_name())
    }
}
