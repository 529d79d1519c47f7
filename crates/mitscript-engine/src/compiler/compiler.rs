//! AST to bytecode lowering
//!
//! Walks the AST with the symbol tables in hand and emits one `Function`
//! object per function expression, plus the root function. The root's
//! prologue binds the three builtins into globals. Function metadata objects
//! are permanent heap allocations; they are never swept.

use crate::compiler::instr::Instr;
use crate::compiler::symbols::{self, SymbolTables, VarKind};
use crate::error::Error;
use crate::parser::ast::{BinOp, Block, Expr, Stmt, UnOp};
use crate::parser::parse_program;
use crate::vm::object::{Function, FunctionKind, ObjData};
use crate::vm::value::Value;
use crate::vm::Vm;

/// Parse and compile MITScript source into a root `Function` value.
pub fn compile_source(vm: &mut Vm, src: &str) -> Result<Value, Error> {
    let program = parse_program(src)?;
    compile_program(vm, &program)
}

/// Compile an already-parsed program.
pub fn compile_program(vm: &mut Vm, program: &Block) -> Result<Value, Error> {
    let tables = symbols::build(program)?;
    let mut c = Compiler {
        vm,
        tables,
        cur_table: 0,
        table_counter: 0,
        label_counter: 0,
        func: Function::with_arity(0, FunctionKind::Normal),
    };

    // Lay out the global frame: every variable is a global name.
    let names: Vec<String> = c.tables.scopes[0].vars.keys().cloned().collect();
    for name in names {
        c.put_var_in_func(0, &name);
    }

    c.load_builtins()?;
    c.visit_block(program)?;

    let main = std::mem::replace(&mut c.func, Function::with_arity(0, FunctionKind::Normal));
    Ok(c.vm.heap.allocate_permanent(ObjData::Function(main)))
}

struct Compiler<'a> {
    vm: &'a mut Vm,
    tables: SymbolTables,
    cur_table: usize,
    /// Index of the most recently entered function scope; scopes were
    /// created in the same order function expressions are compiled.
    table_counter: usize,
    label_counter: i32,
    /// Function currently under construction.
    func: Function,
}

impl<'a> Compiler<'a> {
    fn emit(&mut self, i: Instr) {
        self.func.instructions.push(i);
    }

    fn fresh_label(&mut self) -> i32 {
        let l = self.label_counter;
        self.label_counter += 1;
        l
    }

    fn bind_label(&mut self, label: i32) {
        self.emit(Instr::Label(label));
        // Jump targets land just past the marker.
        self.func.labels.insert(label, self.func.instructions.len());
    }

    fn alloc_constant(&mut self, c: Value) -> usize {
        let i = self.func.constants.len();
        self.func.constants.push(c);
        i
    }

    fn alloc_name(&mut self, name: &str) -> usize {
        let i = self.func.names.len();
        self.func.names.push(name.to_string());
        i
    }

    fn load_constant(&mut self, c: Value) {
        let i = self.alloc_constant(c);
        self.emit(Instr::LoadConst(i));
    }

    /// Assign the table slot for one variable of the current function,
    /// returning whether it became a local.
    fn put_var_in_func(&mut self, table: usize, name: &str) -> bool {
        let desc = self.tables.scopes[table]
            .vars
            .get_mut(name)
            .expect("classified variable");
        match desc.kind {
            VarKind::Global => {
                desc.index = self.func.names.len();
                self.func.names.push(name.to_string());
                false
            }
            VarKind::Local => {
                desc.index = self.func.local_vars.len();
                self.func.local_vars.push(name.to_string());
                if desc.captured {
                    desc.ref_index = self.func.local_ref_vars.len();
                    self.func.local_ref_vars.push(name.to_string());
                }
                true
            }
            VarKind::Free => {
                desc.index = self.func.free_vars.len();
                self.func.free_vars.push(name.to_string());
                false
            }
        }
    }

    /// Emit the root prologue binding `print`, `input`, and `intcast`.
    fn load_builtins(&mut self) -> Result<(), Error> {
        let builtins = [
            ("print", 1, FunctionKind::Print),
            ("input", 0, FunctionKind::Input),
            ("intcast", 1, FunctionKind::Intcast),
        ];
        for (name, arity, kind) in builtins {
            let fv = self
                .vm
                .heap
                .allocate_permanent(ObjData::Function(Function::with_arity(arity, kind)));
            let idx = self.func.functions.len();
            self.func.functions.push(fv);
            self.emit(Instr::LoadFunc(idx));
            self.emit(Instr::AllocClosure(0));
            self.write_var(name)?;
        }
        Ok(())
    }

    fn desc(&self, name: &str) -> Result<(VarKind, bool, usize, usize), Error> {
        let d = self.tables.scopes[self.cur_table]
            .vars
            .get(name)
            .ok_or_else(|| Error::RuntimeError(format!("unclassified variable {name}")))?;
        Ok((d.kind, d.captured, d.index, d.ref_index))
    }

    /// Emit the store for a bare identifier.
    fn write_var(&mut self, name: &str) -> Result<(), Error> {
        let (kind, _, index, _) = self.desc(name)?;
        match kind {
            VarKind::Global => self.emit(Instr::StoreGlobal(index)),
            VarKind::Local => self.emit(Instr::StoreLocal(index)),
            VarKind::Free => {
                // Captured variables are written only by their owning frame.
                return Err(Error::UninitializedVariable(format!(
                    "{name} is not initialized"
                )));
            }
        }
        Ok(())
    }

    fn visit_block(&mut self, block: &Block) -> Result<(), Error> {
        for s in &block.stmts {
            self.visit_stmt(s)?;
        }
        Ok(())
    }

    fn visit_stmt(&mut self, stmt: &Stmt) -> Result<(), Error> {
        match stmt {
            Stmt::Global(_) => Ok(()),
            Stmt::Assign { lhs, value } => {
                self.visit_expr(value)?;
                self.write_assignment(lhs)
            }
            Stmt::Call(e) => {
                self.visit_expr(e)?;
                self.emit(Instr::Pop);
                Ok(())
            }
            Stmt::If { cond, then, els } => {
                let then_label = self.fresh_label();
                let end_label = self.fresh_label();
                self.visit_expr(cond)?;
                self.emit(Instr::If(then_label));
                if let Some(els) = els {
                    self.visit_block(els)?;
                }
                self.emit(Instr::Goto(end_label));
                self.bind_label(then_label);
                self.visit_block(then)?;
                self.bind_label(end_label);
                Ok(())
            }
            Stmt::While { cond, body } => {
                let cond_label = self.fresh_label();
                let body_label = self.fresh_label();
                self.emit(Instr::Goto(cond_label));
                self.bind_label(body_label);
                self.visit_block(body)?;
                self.bind_label(cond_label);
                self.visit_expr(cond)?;
                self.emit(Instr::If(body_label));
                Ok(())
            }
            Stmt::Return(e) => {
                self.visit_expr(e)?;
                self.emit(Instr::Return);
                Ok(())
            }
        }
    }

    /// The value to store is already on the stack.
    fn write_assignment(&mut self, lhs: &Expr) -> Result<(), Error> {
        match lhs {
            Expr::Ident(name) => self.write_var(name),
            Expr::Field { base, name } => {
                self.visit_expr(base)?;
                let i = self.alloc_name(name);
                // Want S :: record :: value.
                self.emit(Instr::Swap);
                self.emit(Instr::FieldStore(i));
                Ok(())
            }
            Expr::Index { base, index } => {
                // Want S :: record :: index :: value, so two swaps.
                self.visit_expr(base)?;
                self.emit(Instr::Swap);
                self.visit_expr(index)?;
                self.emit(Instr::Swap);
                self.emit(Instr::IndexStore);
                Ok(())
            }
            _ => Err(Error::RuntimeError("invalid assignment target".to_string())),
        }
    }

    fn visit_expr(&mut self, expr: &Expr) -> Result<(), Error> {
        match expr {
            Expr::None => {
                let none = self.vm.none();
                self.load_constant(none);
                Ok(())
            }
            Expr::Int(i) => {
                self.load_constant(Value::from_int(*i));
                Ok(())
            }
            Expr::Bool(b) => {
                self.load_constant(Value::from_bool(*b));
                Ok(())
            }
            Expr::Str(s) => {
                let v = self.vm.strings.intern(s);
                self.load_constant(v);
                Ok(())
            }
            Expr::Ident(name) => {
                let (kind, _, index, _) = self.desc(name)?;
                match kind {
                    VarKind::Global => self.emit(Instr::LoadGlobal(index)),
                    VarKind::Local => self.emit(Instr::LoadLocal(index)),
                    VarKind::Free => {
                        // Free-var references sit after the local refs in
                        // the reference index space.
                        let i = index + self.func.local_ref_vars.len();
                        self.emit(Instr::PushReference(i));
                        self.emit(Instr::LoadReference);
                    }
                }
                Ok(())
            }
            Expr::Field { base, name } => {
                self.visit_expr(base)?;
                let i = self.alloc_name(name);
                self.emit(Instr::FieldLoad(i));
                Ok(())
            }
            Expr::Index { base, index } => {
                self.visit_expr(base)?;
                self.visit_expr(index)?;
                self.emit(Instr::IndexLoad);
                Ok(())
            }
            Expr::Call { target, args } => {
                self.visit_expr(target)?;
                for a in args {
                    self.visit_expr(a)?;
                }
                self.emit(Instr::Call(args.len()));
                Ok(())
            }
            Expr::Record(fields) => {
                self.emit(Instr::AllocRecord);
                for (name, value) in fields {
                    self.emit(Instr::Dup);
                    self.visit_expr(value)?;
                    let i = self.alloc_name(name);
                    self.emit(Instr::FieldStore(i));
                }
                Ok(())
            }
            Expr::Unary { op, expr } => {
                self.visit_expr(expr)?;
                self.emit(match op {
                    UnOp::Not => Instr::Not,
                    UnOp::Neg => Instr::Neg,
                });
                Ok(())
            }
            Expr::Binary { op, lhs, rhs } => {
                self.visit_expr(lhs)?;
                self.visit_expr(rhs)?;
                match op {
                    BinOp::Or => self.emit(Instr::Or),
                    BinOp::And => self.emit(Instr::And),
                    BinOp::EqEq => self.emit(Instr::Eq),
                    BinOp::Add => self.emit(Instr::Add),
                    BinOp::Sub => self.emit(Instr::Sub),
                    BinOp::Mul => self.emit(Instr::Mul),
                    BinOp::Div => self.emit(Instr::Div),
                    BinOp::Gt => self.emit(Instr::Gt),
                    BinOp::GtEq => self.emit(Instr::Geq),
                    // No lt/leq instructions; swap and reuse gt/geq.
                    BinOp::Lt => {
                        self.emit(Instr::Swap);
                        self.emit(Instr::Gt);
                    }
                    BinOp::LtEq => {
                        self.emit(Instr::Swap);
                        self.emit(Instr::Geq);
                    }
                }
                Ok(())
            }
            Expr::Function { params, body } => self.compile_function(params, body),
        }
    }

    fn compile_function(&mut self, params: &[String], body: &Block) -> Result<(), Error> {
        self.table_counter += 1;
        let child_table = self.table_counter;

        let parent_func = std::mem::replace(
            &mut self.func,
            Function::with_arity(params.len(), FunctionKind::Normal),
        );
        let parent_table = self.cur_table;
        self.cur_table = child_table;

        // Parameters first, in declaration order, then the remaining
        // variables in sorted order.
        for arg in params {
            self.put_var_in_func(child_table, arg);
        }
        let rest: Vec<String> = self.tables.scopes[child_table]
            .vars
            .keys()
            .filter(|n| !params.contains(n))
            .cloned()
            .collect();
        for name in rest {
            self.put_var_in_func(child_table, &name);
        }

        self.visit_block(body)?;

        let child = std::mem::replace(&mut self.func, parent_func);
        self.cur_table = parent_table;
        let child_free_vars = child.free_vars.clone();

        let childv = self.vm.heap.allocate_permanent(ObjData::Function(child));
        let idx = self.func.functions.len();
        self.func.functions.push(childv);
        self.emit(Instr::LoadFunc(idx));

        // Push references to the child's free variables in reverse, so the
        // first free var ends up on top for alloc_closure.
        for var in child_free_vars.iter().rev() {
            let (kind, captured, index, ref_index) = self.desc(var)?;
            let i = match kind {
                VarKind::Local if captured => ref_index,
                VarKind::Free => index + self.func.local_ref_vars.len(),
                _ => {
                    return Err(Error::RuntimeError(format!(
                        "free variable {var} is neither captured nor free in parent"
                    )))
                }
            };
            self.emit(Instr::PushReference(i));
        }
        self.emit(Instr::AllocClosure(child_free_vars.len()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmOptions;

    fn compile(src: &str) -> (Box<Vm>, Value) {
        let mut vm = Vm::new_captured(VmOptions::default());
        let main = compile_source(&mut vm, src).unwrap();
        (vm, main)
    }

    fn main_instrs(main: Value) -> Vec<Instr> {
        main.as_obj()
            .unwrap()
            .as_function()
            .unwrap()
            .instructions
            .clone()
    }

    // The root prologue binds the three builtins: three load_func /
    // alloc_closure / store_global triples.
    const PROLOGUE_LEN: usize = 9;

    #[test]
    fn test_simple_assignment() {
        let (_vm, main) = compile("x = 1;");
        let instrs = main_instrs(main);
        assert_eq!(
            &instrs[PROLOGUE_LEN..],
            &[Instr::LoadConst(0), Instr::StoreGlobal(3)][..]
        );
        // Global layout is sorted: input intcast print x.
        let f = main.as_obj().unwrap().as_function().unwrap();
        assert_eq!(f.names, vec!["input", "intcast", "print", "x"]);
    }

    #[test]
    fn test_call_statement_pops() {
        let (_vm, main) = compile("print(1);");
        let instrs = main_instrs(main);
        assert_eq!(
            &instrs[PROLOGUE_LEN..],
            &[
                Instr::LoadGlobal(2),
                Instr::LoadConst(0),
                Instr::Call(1),
                Instr::Pop
            ][..]
        );
    }

    #[test]
    fn test_lt_compiles_to_swap_gt() {
        let (_vm, main) = compile("x = 1 < 2;");
        let instrs = main_instrs(main);
        assert_eq!(
            &instrs[PROLOGUE_LEN..],
            &[
                Instr::LoadConst(0),
                Instr::LoadConst(1),
                Instr::Swap,
                Instr::Gt,
                Instr::StoreGlobal(3)
            ][..]
        );
    }

    #[test]
    fn test_while_shape() {
        let (_vm, main) = compile("while (true) { x = 1; }");
        let instrs = main_instrs(main);
        let body = &instrs[PROLOGUE_LEN..];
        assert_eq!(body[0], Instr::Goto(0));
        assert_eq!(body[1], Instr::Label(1));
        assert!(matches!(body[body.len() - 1], Instr::If(1)));
    }

    #[test]
    fn test_if_else_emits_else_first() {
        let (_vm, main) = compile("if (true) { x = 1; } else { x = 2; }");
        let instrs = main_instrs(main);
        let body = &instrs[PROLOGUE_LEN..];
        // cond, if, else-block, goto, label, then-block, label
        assert!(matches!(body[1], Instr::If(0)));
        assert!(matches!(body[4], Instr::Goto(1)));
        assert_eq!(body[5], Instr::Label(0));
    }

    #[test]
    fn test_closure_capture_emits_push_ref() {
        let (_vm, main) = compile("f = fun(x) { return fun() { return x; }; };");
        let outer = main.as_obj().unwrap().as_function().unwrap().functions[3];
        let f = outer.as_obj().unwrap().as_function().unwrap();
        assert_eq!(f.local_vars, vec!["x"]);
        assert_eq!(f.local_ref_vars, vec!["x"]);
        // Inside the outer function: load_func, push_ref x, alloc_closure 1,
        // then the return.
        let n = f.instructions.len();
        assert_eq!(
            &f.instructions[n - 4..],
            &[
                Instr::LoadFunc(0),
                Instr::PushReference(0),
                Instr::AllocClosure(1),
                Instr::Return
            ][..]
        );
        let inner = f.functions[0].as_obj().unwrap().as_function().unwrap();
        assert_eq!(inner.free_vars, vec!["x"]);
    }

    #[test]
    fn test_record_literal() {
        let (_vm, main) = compile("r = { a: 1; b: 2; };");
        let instrs = main_instrs(main);
        let body = &instrs[PROLOGUE_LEN..];
        assert_eq!(body[0], Instr::AllocRecord);
        assert_eq!(body[1], Instr::Dup);
        assert!(matches!(body[3], Instr::FieldStore(_)));
    }

    #[test]
    fn test_labels_point_past_marker() {
        let (_vm, main) = compile("while (true) { y = 1; }");
        let f = main.as_obj().unwrap().as_function().unwrap();
        for (label, target) in &f.labels {
            let idx = *target;
            assert!(idx <= f.instructions.len());
            assert_eq!(f.instructions[idx - 1], Instr::Label(*label));
        }
    }
}
