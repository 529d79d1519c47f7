//! Symbol table builder
//!
//! A pass over the AST collects, for every function scope, the names it
//! assigns, declares global, and references. Classification then runs over
//! the whole program: global-frame assignments and `global` declarations are
//! global program-wide, parameters and remaining assignments are locals, and
//! leftover references resolve upward through the scope chain — marking the
//! owning local captured and threading a free entry through every
//! intermediate scope. An unresolvable reference fails compilation with
//! `UninitializedVariable`.

use crate::error::Error;
use crate::parser::ast::{Block, Expr, Stmt};
use std::collections::{BTreeMap, BTreeSet};

/// Scope classification of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Global,
    Local,
    Free,
}

/// Descriptor of one variable in one scope. Slot indices are filled in by
/// the bytecode compiler when it lays out the function's tables.
#[derive(Debug, Clone)]
pub struct VarDesc {
    pub kind: VarKind,
    /// For locals: referenced by a nested function, so it needs a shared
    /// cell.
    pub captured: bool,
    /// Index into the owning function's local/name/free table.
    pub index: usize,
    /// For captured locals: index into the local-reference table.
    pub ref_index: usize,
}

impl VarDesc {
    fn new(kind: VarKind) -> VarDesc {
        VarDesc {
            kind,
            captured: false,
            index: 0,
            ref_index: 0,
        }
    }
}

/// One function scope. Sorted maps keep table layout deterministic.
#[derive(Debug, Default)]
pub struct Scope {
    pub vars: BTreeMap<String, VarDesc>,
    pub parent: Option<usize>,
    // Raw facts from the collection pass.
    params: Vec<String>,
    assigned: BTreeSet<String>,
    global_decls: BTreeSet<String>,
    referenced: BTreeSet<String>,
}

/// All scopes of a program, indexed in the order function expressions are
/// compiled (pre-order; scope 0 is the global frame).
#[derive(Debug, Default)]
pub struct SymbolTables {
    pub scopes: Vec<Scope>,
}

/// Build and resolve the symbol tables for a program.
pub fn build(program: &Block) -> Result<SymbolTables, Error> {
    let mut b = Collector {
        scopes: vec![Scope::default()],
        cur: 0,
    };
    b.visit_block(program);
    let mut tables = SymbolTables { scopes: b.scopes };

    // Global names are program-wide: everything assigned in the global
    // frame, everything declared `global` anywhere, and the builtins.
    let mut globals: BTreeSet<String> =
        ["print", "input", "intcast"].iter().map(|s| s.to_string()).collect();
    globals.extend(tables.scopes[0].assigned.iter().cloned());
    for scope in &tables.scopes {
        globals.extend(scope.global_decls.iter().cloned());
    }
    for name in &globals {
        tables.scopes[0]
            .vars
            .insert(name.clone(), VarDesc::new(VarKind::Global));
    }

    // Per-scope classification: parameters shadow globals, other assigned
    // names are locals unless the name is global program-wide.
    for scope in tables.scopes.iter_mut().skip(1) {
        for p in scope.params.clone() {
            scope.vars.insert(p, VarDesc::new(VarKind::Local));
        }
        for name in scope.assigned.clone() {
            if scope.vars.contains_key(&name) {
                continue;
            }
            let kind = if globals.contains(&name) {
                VarKind::Global
            } else {
                VarKind::Local
            };
            scope.vars.insert(name, VarDesc::new(kind));
        }
        for name in scope.global_decls.clone() {
            scope.vars.insert(name, VarDesc::new(VarKind::Global));
        }
    }

    // Unresolved references in the global frame fail immediately.
    let unresolved: Vec<String> = tables.scopes[0]
        .referenced
        .iter()
        .filter(|n| !tables.scopes[0].vars.contains_key(*n))
        .cloned()
        .collect();
    if let Some(name) = unresolved.first() {
        return Err(Error::UninitializedVariable(format!(
            "{name} is not initialized"
        )));
    }

    // Resolve remaining references upward.
    for t in 1..tables.scopes.len() {
        let pending: Vec<String> = tables.scopes[t]
            .referenced
            .iter()
            .filter(|name| !tables.scopes[t].vars.contains_key(*name))
            .cloned()
            .collect();
        for name in pending {
            let kind = resolve_upward(&mut tables, t, &name)?;
            let desc = if kind == VarKind::Global {
                VarDesc::new(VarKind::Global)
            } else {
                VarDesc::new(VarKind::Free)
            };
            tables.scopes[t].vars.insert(name, desc);
        }
    }

    Ok(tables)
}

/// Walk the parent chain looking for `name`. The owning entry is marked
/// captured; when the result is not global, every intermediate scope gets a
/// free entry so the capture can be threaded through closure after closure.
fn resolve_upward(tables: &mut SymbolTables, from: usize, name: &str) -> Result<VarKind, Error> {
    let mut chain = Vec::new();
    let mut idx = tables.scopes[from].parent;
    let (found, kind) = loop {
        let i = idx.ok_or_else(|| {
            Error::UninitializedVariable(format!("{name} is not initialized"))
        })?;
        if let Some(desc) = tables.scopes[i].vars.get(name) {
            break (i, desc.kind);
        }
        chain.push(i);
        idx = tables.scopes[i].parent;
    };

    let desc = tables.scopes[found].vars.get_mut(name).expect("found desc");
    desc.captured = true;

    if kind != VarKind::Global {
        for &i in &chain {
            let mut d = VarDesc::new(VarKind::Free);
            d.captured = true;
            tables.scopes[i].vars.insert(name.to_string(), d);
        }
    }
    Ok(kind)
}

struct Collector {
    scopes: Vec<Scope>,
    cur: usize,
}

impl Collector {
    fn visit_block(&mut self, block: &Block) {
        for s in &block.stmts {
            self.visit_stmt(s);
        }
    }

    // Traversal order must match the bytecode compiler's emission order so
    // that nested function expressions meet their scopes by index: if
    // statements lower the else block before the then block, and while
    // loops lower the body before the condition.
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Global(name) => {
                self.scopes[self.cur].global_decls.insert(name.clone());
            }
            Stmt::Assign { lhs, value } => {
                self.visit_expr(value);
                if let Expr::Ident(name) = lhs {
                    self.scopes[self.cur].assigned.insert(name.clone());
                } else {
                    self.visit_expr(lhs);
                }
            }
            Stmt::Call(e) => self.visit_expr(e),
            Stmt::If { cond, then, els } => {
                self.visit_expr(cond);
                if let Some(els) = els {
                    self.visit_block(els);
                }
                self.visit_block(then);
            }
            Stmt::While { cond, body } => {
                self.visit_block(body);
                self.visit_expr(cond);
            }
            Stmt::Return(e) => self.visit_expr(e),
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Ident(name) => {
                self.scopes[self.cur].referenced.insert(name.clone());
            }
            Expr::Function { params, body } => {
                let idx = self.scopes.len();
                self.scopes.push(Scope {
                    parent: Some(self.cur),
                    params: params.to_vec(),
                    ..Scope::default()
                });
                let parent = self.cur;
                self.cur = idx;
                self.visit_block(body);
                self.cur = parent;
            }
            Expr::Binary { lhs, rhs, .. } => {
                self.visit_expr(lhs);
                self.visit_expr(rhs);
            }
            Expr::Unary { expr, .. } => self.visit_expr(expr),
            Expr::Field { base, .. } => self.visit_expr(base),
            Expr::Index { base, index } => {
                self.visit_expr(base);
                self.visit_expr(index);
            }
            Expr::Call { target, args } => {
                self.visit_expr(target);
                for a in args {
                    self.visit_expr(a);
                }
            }
            Expr::Record(fields) => {
                for (_, v) in fields {
                    self.visit_expr(v);
                }
            }
            Expr::None | Expr::Int(_) | Expr::Bool(_) | Expr::Str(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    fn tables(src: &str) -> SymbolTables {
        build(&parse_program(src).unwrap()).unwrap()
    }

    #[test]
    fn test_global_frame_promotes_assignments() {
        let t = tables("x = 1; y = x;");
        assert_eq!(t.scopes[0].vars["x"].kind, VarKind::Global);
        assert_eq!(t.scopes[0].vars["y"].kind, VarKind::Global);
    }

    #[test]
    fn test_assignment_to_toplevel_name_is_global_in_function() {
        // Assignments target the global when the name is global
        // program-wide; this is what makes a top-level counter mutable from
        // inside a function.
        let t = tables("x = 0; f = fun() { x = x + 1; return x; };");
        assert_eq!(t.scopes[1].vars["x"].kind, VarKind::Global);
    }

    #[test]
    fn test_params_shadow_globals() {
        let t = tables("x = 1; f = fun(x) { return x; };");
        assert_eq!(t.scopes[1].vars["x"].kind, VarKind::Local);
    }

    #[test]
    fn test_function_local_assignment() {
        let t = tables("f = fun() { n = 0; return n; };");
        assert_eq!(t.scopes[1].vars["n"].kind, VarKind::Local);
        assert!(!t.scopes[1].vars["n"].captured);
    }

    #[test]
    fn test_free_variable_marks_owner_captured() {
        let t = tables("f = fun(x) { return fun() { return x; }; };");
        assert_eq!(t.scopes[2].vars["x"].kind, VarKind::Free);
        let outer = &t.scopes[1];
        assert_eq!(outer.vars["x"].kind, VarKind::Local);
        assert!(outer.vars["x"].captured);
    }

    #[test]
    fn test_capture_threads_through_intermediate_scope() {
        let t = tables("f = fun(x) { return fun() { return fun() { return x; }; }; };");
        assert_eq!(t.scopes[2].vars["x"].kind, VarKind::Free);
        assert_eq!(t.scopes[3].vars["x"].kind, VarKind::Free);
        assert!(t.scopes[1].vars["x"].captured);
    }

    #[test]
    fn test_reference_to_global_stays_global() {
        let t = tables("x = 1; f = fun() { return x; };");
        assert_eq!(t.scopes[1].vars["x"].kind, VarKind::Global);
        // Globals are not captured through cells.
        assert!(!t.scopes[1].vars["x"].captured);
    }

    #[test]
    fn test_sneaky_global() {
        let t = tables("f = fun() { global z; z = 3; };");
        assert_eq!(t.scopes[0].vars["z"].kind, VarKind::Global);
        assert_eq!(t.scopes[1].vars["z"].kind, VarKind::Global);
    }

    #[test]
    fn test_unknown_name_is_uninitialized() {
        let err = build(&parse_program("y = missing;").unwrap()).unwrap_err();
        assert!(err.to_string().starts_with("UninitializedVariable:"));
    }

    #[test]
    fn test_unknown_name_in_function_is_uninitialized() {
        let err = build(&parse_program("f = fun() { return missing; };").unwrap()).unwrap_err();
        assert!(err.to_string().starts_with("UninitializedVariable:"));
    }

    #[test]
    fn test_builtins_are_preseeded() {
        let t = tables("print(1);");
        assert_eq!(t.scopes[0].vars["print"].kind, VarKind::Global);
    }
}
