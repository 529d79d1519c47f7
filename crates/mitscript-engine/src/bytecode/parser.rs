//! Textual bytecode loader (the `-b` input path)
//!
//! Grammar: `function { functions = [...], constants = [...],
//! parameter_count = N, local_vars = [...], local_ref_vars = [...],
//! free_vars = [...], names = [...], instructions = [...] }`. Constants are
//! `None`, `true`, `false`, signed decimal integers, or double-quoted
//! strings; instructions are the mnemonics of the stack ISA with `label n`
//! binding labels inline.

use crate::compiler::instr::Instr;
use crate::error::Error;
use crate::vm::object::{Function, FunctionKind, ObjData};
use crate::vm::value::Value;
use crate::vm::Vm;
use logos::Logos;

/// Parse textual bytecode into a root `Function` value.
pub fn load_bytecode(vm: &mut Vm, text: &str) -> Result<Value, Error> {
    let mut tokens = Vec::new();
    let mut lexer = BcToken::lexer(text);
    while let Some(item) = lexer.next() {
        match item {
            Ok(t) => tokens.push(t),
            Err(()) => {
                return Err(Error::ParseError(format!(
                    "unexpected bytecode token {:?}",
                    lexer.slice()
                )))
            }
        }
    }
    let mut p = BcParser { tokens, pos: 0 };
    let func = p.function(vm)?;
    if !p.at_end() {
        return Err(Error::ParseError("trailing input after function".to_string()));
    }
    Ok(func)
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum BcToken {
    #[token("function")]
    Function,
    #[token("functions")]
    Functions,
    #[token("constants")]
    Constants,
    #[token("parameter_count")]
    ParameterCount,
    #[token("local_vars")]
    LocalVars,
    #[token("local_ref_vars")]
    LocalRefVars,
    #[token("free_vars")]
    FreeVars,
    #[token("names")]
    Names,
    #[token("instructions")]
    Instructions,

    #[token("None")]
    None,
    #[token("true")]
    True,
    #[token("false")]
    False,

    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    Str(String),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string(), priority = 1)]
    Ident(String),

    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("=")]
    Eq,
    #[token(",")]
    Comma,
}

struct BcParser {
    tokens: Vec<BcToken>,
    pos: usize,
}

impl BcParser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&BcToken> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<BcToken> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, t: &BcToken) -> Result<(), Error> {
        match self.advance() {
            Some(found) if &found == t => Ok(()),
            found => Err(Error::ParseError(format!(
                "expected {t:?} in bytecode, found {found:?}"
            ))),
        }
    }

    fn eat(&mut self, t: &BcToken) -> bool {
        if self.peek() == Some(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn usize_value(&mut self) -> Result<usize, Error> {
        match self.advance() {
            Some(BcToken::Int(i)) if i >= 0 => Ok(i as usize),
            found => Err(Error::ParseError(format!(
                "expected nonnegative integer, found {found:?}"
            ))),
        }
    }

    fn i32_value(&mut self) -> Result<i32, Error> {
        match self.advance() {
            Some(BcToken::Int(i)) => i32::try_from(i)
                .map_err(|_| Error::ParseError(format!("integer {i} out of range"))),
            found => Err(Error::ParseError(format!(
                "expected integer, found {found:?}"
            ))),
        }
    }

    fn function(&mut self, vm: &mut Vm) -> Result<Value, Error> {
        self.expect(&BcToken::Function)?;
        self.expect(&BcToken::LBrace)?;

        let mut func = Function::with_arity(0, FunctionKind::Normal);

        self.section(&BcToken::Functions)?;
        self.expect(&BcToken::LBracket)?;
        while self.peek() == Some(&BcToken::Function) {
            let f = self.function(vm)?;
            func.functions.push(f);
            if !self.eat(&BcToken::Comma) {
                break;
            }
        }
        self.expect(&BcToken::RBracket)?;
        self.expect(&BcToken::Comma)?;

        self.section(&BcToken::Constants)?;
        self.expect(&BcToken::LBracket)?;
        while self.peek() != Some(&BcToken::RBracket) {
            let c = match self.advance() {
                Some(BcToken::None) => vm.none(),
                Some(BcToken::True) => Value::from_bool(true),
                Some(BcToken::False) => Value::from_bool(false),
                Some(BcToken::Int(i)) => Value::from_int(
                    i32::try_from(i)
                        .map_err(|_| Error::ParseError(format!("constant {i} out of range")))?,
                ),
                Some(BcToken::Str(s)) => vm.strings.intern(&s),
                found => {
                    return Err(Error::ParseError(format!(
                        "expected constant, found {found:?}"
                    )))
                }
            };
            func.constants.push(c);
            if !self.eat(&BcToken::Comma) {
                break;
            }
        }
        self.expect(&BcToken::RBracket)?;
        self.expect(&BcToken::Comma)?;

        self.section(&BcToken::ParameterCount)?;
        func.parameter_count = self.usize_value()?;
        self.expect(&BcToken::Comma)?;

        func.local_vars = self.name_list(&BcToken::LocalVars)?;
        self.expect(&BcToken::Comma)?;
        func.local_ref_vars = self.name_list(&BcToken::LocalRefVars)?;
        self.expect(&BcToken::Comma)?;
        func.free_vars = self.name_list(&BcToken::FreeVars)?;
        self.expect(&BcToken::Comma)?;
        func.names = self.name_list(&BcToken::Names)?;
        self.expect(&BcToken::Comma)?;

        self.section(&BcToken::Instructions)?;
        self.expect(&BcToken::LBracket)?;
        while self.peek() != Some(&BcToken::RBracket) {
            let instr = self.instruction()?;
            func.instructions.push(instr);
            if let Instr::Label(l) = instr {
                func.labels.insert(l, func.instructions.len());
            }
            if !self.eat(&BcToken::Comma) {
                break;
            }
        }
        self.expect(&BcToken::RBracket)?;

        self.expect(&BcToken::RBrace)?;
        Ok(vm.heap.allocate_permanent(ObjData::Function(func)))
    }

    fn section(&mut self, keyword: &BcToken) -> Result<(), Error> {
        self.expect(keyword)?;
        self.expect(&BcToken::Eq)
    }

    fn name_list(&mut self, keyword: &BcToken) -> Result<Vec<String>, Error> {
        self.section(keyword)?;
        self.expect(&BcToken::LBracket)?;
        let mut names = Vec::new();
        while self.peek() != Some(&BcToken::RBracket) {
            match self.advance() {
                Some(BcToken::Ident(s)) => names.push(s),
                found => {
                    return Err(Error::ParseError(format!(
                        "expected name, found {found:?}"
                    )))
                }
            }
            if !self.eat(&BcToken::Comma) {
                break;
            }
        }
        self.expect(&BcToken::RBracket)?;
        Ok(names)
    }

    fn instruction(&mut self) -> Result<Instr, Error> {
        let mnemonic = match self.advance() {
            Some(BcToken::Ident(s)) => s,
            found => {
                return Err(Error::ParseError(format!(
                    "expected instruction mnemonic, found {found:?}"
                )))
            }
        };
        let instr = match mnemonic.as_str() {
            "load_const" => Instr::LoadConst(self.usize_value()?),
            "load_func" => Instr::LoadFunc(self.usize_value()?),
            "load_local" => Instr::LoadLocal(self.usize_value()?),
            "store_local" => Instr::StoreLocal(self.usize_value()?),
            "load_global" => Instr::LoadGlobal(self.usize_value()?),
            "store_global" => Instr::StoreGlobal(self.usize_value()?),
            "push_ref" => Instr::PushReference(self.usize_value()?),
            "load_ref" => Instr::LoadReference,
            "store_ref" => Instr::StoreReference,
            "alloc_record" => Instr::AllocRecord,
            "field_load" => Instr::FieldLoad(self.usize_value()?),
            "field_store" => Instr::FieldStore(self.usize_value()?),
            "index_load" => Instr::IndexLoad,
            "index_store" => Instr::IndexStore,
            "alloc_closure" => Instr::AllocClosure(self.usize_value()?),
            "call" => Instr::Call(self.usize_value()?),
            "return" => Instr::Return,
            "add" => Instr::Add,
            "sub" => Instr::Sub,
            "mul" => Instr::Mul,
            "div" => Instr::Div,
            "neg" => Instr::Neg,
            "gt" => Instr::Gt,
            "geq" => Instr::Geq,
            "eq" => Instr::Eq,
            "and" => Instr::And,
            "or" => Instr::Or,
            "not" => Instr::Not,
            "goto" => Instr::Goto(self.i32_value()?),
            "if" => Instr::If(self.i32_value()?),
            "label" => Instr::Label(self.i32_value()?),
            "dup" => Instr::Dup,
            "swap" => Instr::Swap,
            "pop" => Instr::Pop,
            other => {
                return Err(Error::ParseError(format!(
                    "unknown instruction mnemonic {other}"
                )))
            }
        };
        Ok(instr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmOptions;

    const SIMPLE: &str = r#"
function {
  functions = [],
  constants = [1, 2],
  parameter_count = 0,
  local_vars = [],
  local_ref_vars = [],
  free_vars = [],
  names = [],
  instructions = [
    load_const 0,
    load_const 1,
    add,
    return
  ]
}
"#;

    #[test]
    fn test_load_simple_function() {
        let mut vm = Vm::new_captured(VmOptions::default());
        let f = load_bytecode(&mut vm, SIMPLE).unwrap();
        let func = f.as_obj().unwrap().as_function().unwrap();
        assert_eq!(func.constants.len(), 2);
        assert_eq!(func.instructions.len(), 4);
        assert_eq!(func.instructions[2], Instr::Add);
    }

    #[test]
    fn test_labels_are_indexed() {
        let text = r#"
function {
  functions = [],
  constants = [true],
  parameter_count = 0,
  local_vars = [],
  local_ref_vars = [],
  free_vars = [],
  names = [],
  instructions = [goto 0, label 0, load_const 0, pop]
}
"#;
        let mut vm = Vm::new_captured(VmOptions::default());
        let f = load_bytecode(&mut vm, text).unwrap();
        let func = f.as_obj().unwrap().as_function().unwrap();
        assert_eq!(func.labels[&0], 2);
    }

    #[test]
    fn test_nested_functions_and_strings() {
        let text = r#"
function {
  functions = [
    function {
      functions = [],
      constants = ["hi\n"],
      parameter_count = 1,
      local_vars = [x],
      local_ref_vars = [],
      free_vars = [],
      names = [],
      instructions = [load_const 0, return]
    }
  ],
  constants = [None, false, -3],
  parameter_count = 0,
  local_vars = [],
  local_ref_vars = [],
  free_vars = [],
  names = [f],
  instructions = []
}
"#;
        let mut vm = Vm::new_captured(VmOptions::default());
        let f = load_bytecode(&mut vm, text).unwrap();
        let func = f.as_obj().unwrap().as_function().unwrap();
        assert_eq!(func.functions.len(), 1);
        let inner = func.functions[0].as_obj().unwrap().as_function().unwrap();
        assert_eq!(inner.parameter_count, 1);
        assert_eq!(inner.constants[0].as_str().unwrap(), r"hi\n");
        assert_eq!(func.constants[2].as_int().unwrap(), -3);
    }

    #[test]
    fn test_bad_mnemonic_rejected() {
        let text = "function { functions = [], constants = [], parameter_count = 0, local_vars = [], local_ref_vars = [], free_vars = [], names = [], instructions = [frobnicate] }";
        let mut vm = Vm::new_captured(VmOptions::default());
        assert!(load_bytecode(&mut vm, text).is_err());
    }
}
