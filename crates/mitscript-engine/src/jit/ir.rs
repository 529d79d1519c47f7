//! Linear, register-oriented intermediate representation
//!
//! Each function lowers to a flat list of instructions over an unbounded
//! pool of virtual temporaries. The first `local_count` temps are the
//! function's locals (for captured locals the temp holds the Cell pointer).
//! Temps carry the live interval the allocator consumes and, afterwards,
//! exactly one storage location: a machine register or a spill slot.

use crate::vm::value::Value;
use dynasmrt::x64::Rq;
use std::fmt;

/// Index into [`IrFunction::temps`].
pub type TempId = usize;

/// A virtual register with its live interval and allocated location.
#[derive(Debug, Clone)]
pub struct Temp {
    pub index: TempId,
    /// Machine register, when allocated one.
    pub reg: Option<Rq>,
    /// Spill slot index (contiguous from 0), when spilled.
    pub slot: Option<usize>,
    /// First instruction index referencing this temp; -1 when never
    /// referenced.
    pub start: i32,
    /// Last instruction index referencing this temp.
    pub end: i32,
}

impl Temp {
    pub fn new(index: TempId) -> Temp {
        Temp {
            index,
            reg: None,
            slot: None,
            start: -1,
            end: -1,
        }
    }

    pub fn is_referenced(&self) -> bool {
        self.start >= 0
    }
}

/// One IR instruction. Temps holding raw unboxed scalars only ever appear
/// between an unbox and the following box, never across a helper call.
#[derive(Debug, Clone)]
pub enum IrInstr {
    // Values
    LoadConst { dest: TempId, index: usize },
    LoadFunc { dest: TempId, index: usize },
    LoadGlobal { dest: TempId, name: Value },
    StoreGlobal { src: TempId, name: Value },
    LoadLocal { dest: TempId, src: TempId },
    StoreLocal { dest: TempId, src: TempId },

    // Cells
    PushLocalRef { dest: TempId, src: TempId },
    PushFreeRef { dest: TempId, index: usize },
    LoadReference { dest: TempId, cell: TempId },
    StoreLocalRef { cell: TempId, src: TempId },

    // Records
    AllocRecord { dest: TempId },
    FieldLoad { dest: TempId, record: TempId, name: Value },
    FieldStore { record: TempId, value: TempId, name: Value },
    IndexLoad { dest: TempId, record: TempId, key: TempId },
    IndexStore { record: TempId, key: TempId, value: TempId },

    // Closures and calls
    AllocClosure { dest: TempId, func: TempId, refs: Vec<TempId> },
    Call { dest: TempId, closure: TempId, args: Vec<TempId> },
    Return { src: TempId },

    // Arithmetic and logic; Add and Eq stay polymorphic and go to helpers,
    // the rest operate on raw unboxed temps.
    Add { dest: TempId, left: TempId, right: TempId },
    Eq { dest: TempId, left: TempId, right: TempId },
    Sub { dest: TempId, left: TempId, right: TempId },
    Mul { dest: TempId, left: TempId, right: TempId },
    Div { dest: TempId, left: TempId, right: TempId },
    Neg { dest: TempId, src: TempId },
    Gt { dest: TempId, left: TempId, right: TempId },
    Geq { dest: TempId, left: TempId, right: TempId },
    And { dest: TempId, left: TempId, right: TempId },
    Or { dest: TempId, left: TempId, right: TempId },
    Not { dest: TempId, src: TempId },

    // Control
    Goto { label: i32 },
    If { cond: TempId, label: i32 },
    AddLabel { label: i32 },

    // Type narrowing
    AssertInteger { src: TempId },
    AssertBoolean { src: TempId },
    AssertString { src: TempId },
    AssertRecord { src: TempId },
    AssertFunction { src: TempId },
    AssertClosure { src: TempId },
    AssertCell { src: TempId },
    UnboxInteger { dest: TempId, src: TempId },
    UnboxBoolean { dest: TempId, src: TempId },
    NewInteger { dest: TempId, src: TempId },
    NewBoolean { dest: TempId, src: TempId },
    CastString { dest: TempId, src: TempId },

    // Safe-point
    GarbageCollect,
}

/// A lowered function ready for allocation and code generation.
pub struct IrFunction {
    pub instrs: Vec<IrInstr>,
    pub temps: Vec<Temp>,
    /// Constant pool, shared bit-for-bit with the bytecode function.
    pub constants: Vec<Value>,
    /// Nested function objects.
    pub functions: Vec<Value>,
    pub parameter_count: usize,
    pub local_count: usize,
    /// Per-local: captured by reference, so the local temp holds a Cell.
    pub is_local_ref: Vec<bool>,
    /// Number of spill slots the allocator assigned.
    pub spill_slots: usize,
}

impl fmt::Display for IrInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use IrInstr::*;
        match self {
            LoadConst { dest, index } => write!(f, "t{dest} = const[{index}]"),
            LoadFunc { dest, index } => write!(f, "t{dest} = func[{index}]"),
            LoadGlobal { dest, .. } => write!(f, "t{dest} = load_global"),
            StoreGlobal { src, .. } => write!(f, "store_global t{src}"),
            LoadLocal { dest, src } => write!(f, "t{dest} = t{src}"),
            StoreLocal { dest, src } => write!(f, "t{dest} := t{src}"),
            PushLocalRef { dest, src } => write!(f, "t{dest} = ref t{src}"),
            PushFreeRef { dest, index } => write!(f, "t{dest} = freeref[{index}]"),
            LoadReference { dest, cell } => write!(f, "t{dest} = *t{cell}"),
            StoreLocalRef { cell, src } => write!(f, "*t{cell} = t{src}"),
            AllocRecord { dest } => write!(f, "t{dest} = record{{}}"),
            FieldLoad { dest, record, .. } => write!(f, "t{dest} = t{record}.field"),
            FieldStore { record, value, .. } => write!(f, "t{record}.field = t{value}"),
            IndexLoad { dest, record, key } => write!(f, "t{dest} = t{record}[t{key}]"),
            IndexStore { record, key, value } => write!(f, "t{record}[t{key}] = t{value}"),
            AllocClosure { dest, func, refs } => {
                write!(f, "t{dest} = closure t{func} ({} refs)", refs.len())
            }
            Call { dest, closure, args } => {
                write!(f, "t{dest} = call t{closure} ({} args)", args.len())
            }
            Return { src } => write!(f, "return t{src}"),
            Add { dest, left, right } => write!(f, "t{dest} = t{left} + t{right}"),
            Eq { dest, left, right } => write!(f, "t{dest} = t{left} == t{right}"),
            Sub { dest, left, right } => write!(f, "t{dest} = t{left} - t{right}"),
            Mul { dest, left, right } => write!(f, "t{dest} = t{left} * t{right}"),
            Div { dest, left, right } => write!(f, "t{dest} = t{left} / t{right}"),
            Neg { dest, src } => write!(f, "t{dest} = -t{src}"),
            Gt { dest, left, right } => write!(f, "t{dest} = t{left} > t{right}"),
            Geq { dest, left, right } => write!(f, "t{dest} = t{left} >= t{right}"),
            And { dest, left, right } => write!(f, "t{dest} = t{left} & t{right}"),
            Or { dest, left, right } => write!(f, "t{dest} = t{left} | t{right}"),
            Not { dest, src } => write!(f, "t{dest} = !t{src}"),
            Goto { label } => write!(f, "goto L{label}"),
            If { cond, label } => write!(f, "if t{cond} goto L{label}"),
            AddLabel { label } => write!(f, "L{label}:"),
            AssertInteger { src } => write!(f, "assert_int t{src}"),
            AssertBoolean { src } => write!(f, "assert_bool t{src}"),
            AssertString { src } => write!(f, "assert_str t{src}"),
            AssertRecord { src } => write!(f, "assert_record t{src}"),
            AssertFunction { src } => write!(f, "assert_function t{src}"),
            AssertClosure { src } => write!(f, "assert_closure t{src}"),
            AssertCell { src } => write!(f, "assert_cell t{src}"),
            UnboxInteger { dest, src } => write!(f, "t{dest} = unbox_int t{src}"),
            UnboxBoolean { dest, src } => write!(f, "t{dest} = unbox_bool t{src}"),
            NewInteger { dest, src } => write!(f, "t{dest} = box_int t{src}"),
            NewBoolean { dest, src } => write!(f, "t{dest} = box_bool t{src}"),
            CastString { dest, src } => write!(f, "t{dest} = string t{src}"),
            GarbageCollect => write!(f, "gc"),
        }
    }
}
