//! Bytecode pretty-printer
//!
//! Emits the same textual grammar the loader consumes, so printed functions
//! round-trip.

use crate::error::Error;
use crate::vm::object::Function;
use crate::vm::value::{Tag, Value};
use std::fmt::Write;

/// Render a function (and its nested functions) as textual bytecode.
pub fn print_function(func: &Function) -> Result<String, Error> {
    let mut out = String::new();
    write_function(&mut out, func, 0)?;
    out.push('\n');
    Ok(out)
}

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("  ");
    }
}

fn write_function(out: &mut String, func: &Function, level: usize) -> Result<(), Error> {
    out.push_str("function {\n");

    indent(out, level + 1);
    out.push_str("functions = [");
    for (i, f) in func.functions.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('\n');
        indent(out, level + 2);
        write_function(out, f.as_obj()?.as_function()?, level + 2)?;
    }
    if !func.functions.is_empty() {
        out.push('\n');
        indent(out, level + 1);
    }
    out.push_str("],\n");

    indent(out, level + 1);
    out.push_str("constants = [");
    for (i, c) in func.constants.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&constant_text(*c)?);
    }
    out.push_str("],\n");

    indent(out, level + 1);
    let _ = writeln!(out, "parameter_count = {},", func.parameter_count);

    name_list(out, level + 1, "local_vars", &func.local_vars);
    name_list(out, level + 1, "local_ref_vars", &func.local_ref_vars);
    name_list(out, level + 1, "free_vars", &func.free_vars);
    name_list(out, level + 1, "names", &func.names);

    indent(out, level + 1);
    out.push_str("instructions = [");
    for (i, instr) in func.instructions.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('\n');
        indent(out, level + 2);
        let _ = write!(out, "{instr}");
    }
    if !func.instructions.is_empty() {
        out.push('\n');
        indent(out, level + 1);
    }
    out.push_str("]\n");

    indent(out, level);
    out.push('}');
    Ok(())
}

fn name_list(out: &mut String, level: usize, keyword: &str, names: &[String]) {
    indent(out, level);
    out.push_str(keyword);
    out.push_str(" = [");
    for (i, n) in names.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(n);
    }
    out.push_str("],\n");
}

fn constant_text(v: Value) -> Result<String, Error> {
    match v.tag() {
        Tag::Int => Ok(v.as_int()?.to_string()),
        Tag::Bool => Ok(if v.as_bool()? { "true" } else { "false" }.to_string()),
        Tag::Str => Ok(format!("\"{}\"", v.as_str()?)),
        Tag::Ptr => Ok("None".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::parser::load_bytecode;
    use crate::compiler::compile_source;
    use crate::vm::{Vm, VmOptions};

    #[test]
    fn test_round_trip_through_printer_and_loader() {
        let mut vm = Vm::new_captured(VmOptions::default());
        let main = compile_source(&mut vm, "x = 1; y = x + 2; print(y);").unwrap();
        let printed = print_function(main.as_obj().unwrap().as_function().unwrap()).unwrap();

        let reloaded = load_bytecode(&mut vm, &printed).unwrap();
        let reprinted =
            print_function(reloaded.as_obj().unwrap().as_function().unwrap()).unwrap();
        assert_eq!(printed, reprinted);
    }

    #[test]
    fn test_prints_constants_in_grammar_form() {
        let mut vm = Vm::new_captured(VmOptions::default());
        let main = compile_source(&mut vm, "a = None; b = true; c = \"s\"; d = -1;").unwrap();
        let printed = print_function(main.as_obj().unwrap().as_function().unwrap()).unwrap();
        assert!(printed.contains("None"));
        assert!(printed.contains("true"));
        assert!(printed.contains("\"s\""));
        assert!(printed.contains("parameter_count = 0"));
    }
}
