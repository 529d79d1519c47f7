//! Recursive-descent parser for MITScript.
//!
//! Precedence, low to high: `|`, `&`, unary `!`, comparison (non-associative),
//! additive, multiplicative, unary `-`, postfix (field/index/call), primary.

use crate::error::Error;
use crate::parser::ast::{BinOp, Block, Expr, Stmt, UnOp};
use crate::parser::lexer::tokenize;
use crate::parser::token::{Span, Token};

/// Parse a whole program.
pub fn parse_program(src: &str) -> Result<Block, Error> {
    let tokens = tokenize(src)?;
    let mut p = Parser {
        src,
        tokens,
        pos: 0,
    };
    let block = p.block_body(false)?;
    if !p.at_end() {
        return Err(p.unexpected("statement"));
    }
    Ok(block)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Token) -> bool {
        if self.peek() == Some(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: &Token) -> Result<(), Error> {
        if self.eat(t) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{t}`")))
        }
    }

    fn line(&self) -> usize {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|(_, s)| s.start)
            .unwrap_or(self.src.len());
        self.src[..offset].bytes().filter(|&b| b == b'\n').count() + 1
    }

    fn unexpected(&self, wanted: &str) -> Error {
        match self.peek() {
            Some(t) => Error::ParseError(format!(
                "expected {wanted}, found `{t}` at line {}",
                self.line()
            )),
            None => Error::ParseError(format!("expected {wanted}, found end of input")),
        }
    }

    fn ident(&mut self) -> Result<String, Error> {
        match self.peek() {
            Some(Token::Ident(_)) => match self.advance() {
                Some(Token::Ident(s)) => Ok(s),
                _ => unreachable!(),
            },
            _ => Err(self.unexpected("identifier")),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Statements until end of input (`braced == false`) or a closing brace.
    fn block_body(&mut self, braced: bool) -> Result<Block, Error> {
        let mut stmts = Vec::new();
        loop {
            if braced {
                if self.peek() == Some(&Token::RBrace) {
                    break;
                }
                if self.at_end() {
                    return Err(self.unexpected("`}`"));
                }
            } else if self.at_end() {
                break;
            }
            stmts.push(self.statement()?);
        }
        Ok(Block { stmts })
    }

    fn braced_block(&mut self) -> Result<Block, Error> {
        self.expect(&Token::LBrace)?;
        let b = self.block_body(true)?;
        self.expect(&Token::RBrace)?;
        Ok(b)
    }

    fn statement(&mut self) -> Result<Stmt, Error> {
        match self.peek() {
            Some(Token::Global) => {
                self.advance();
                let name = self.ident()?;
                self.expect(&Token::Semicolon)?;
                Ok(Stmt::Global(name))
            }
            Some(Token::If) => {
                self.advance();
                self.expect(&Token::LParen)?;
                let cond = self.expression()?;
                self.expect(&Token::RParen)?;
                let then = self.braced_block()?;
                let els = if self.eat(&Token::Else) {
                    Some(self.braced_block()?)
                } else {
                    None
                };
                Ok(Stmt::If { cond, then, els })
            }
            Some(Token::While) => {
                self.advance();
                self.expect(&Token::LParen)?;
                let cond = self.expression()?;
                self.expect(&Token::RParen)?;
                let body = self.braced_block()?;
                Ok(Stmt::While { cond, body })
            }
            Some(Token::Return) => {
                self.advance();
                let e = self.expression()?;
                self.expect(&Token::Semicolon)?;
                Ok(Stmt::Return(e))
            }
            _ => {
                // Assignment or call statement.
                let e = self.expression()?;
                if self.eat(&Token::Assign) {
                    if !e.is_lhs() {
                        return Err(Error::ParseError(format!(
                            "invalid assignment target at line {}",
                            self.line()
                        )));
                    }
                    let value = self.expression()?;
                    self.expect(&Token::Semicolon)?;
                    Ok(Stmt::Assign { lhs: e, value })
                } else {
                    self.expect(&Token::Semicolon)?;
                    match e {
                        Expr::Call { .. } => Ok(Stmt::Call(e)),
                        _ => Err(Error::ParseError(format!(
                            "expected call or assignment statement at line {}",
                            self.line()
                        ))),
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expression(&mut self) -> Result<Expr, Error> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::Pipe) {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.not_expr()?;
        while self.eat(&Token::Amp) {
            let rhs = self.not_expr()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, Error> {
        if self.eat(&Token::Bang) {
            let e = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnOp::Not,
                expr: Box::new(e),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, Error> {
        let lhs = self.arith()?;
        let op = match self.peek() {
            Some(Token::Lt) => Some(BinOp::Lt),
            Some(Token::Gt) => Some(BinOp::Gt),
            Some(Token::LtEq) => Some(BinOp::LtEq),
            Some(Token::GtEq) => Some(BinOp::GtEq),
            Some(Token::EqEq) => Some(BinOp::EqEq),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let rhs = self.arith()?;
            Ok(Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            })
        } else {
            Ok(lhs)
        }
    }

    fn arith(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.product()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn product(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, Error> {
        if self.eat(&Token::Minus) {
            let e = self.unary()?;
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                expr: Box::new(e),
            });
        }
        self.postfix()
    }

    /// Field derefs, indexing, and calls bind tightest.
    fn postfix(&mut self) -> Result<Expr, Error> {
        let mut e = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let name = self.ident()?;
                    e = Expr::Field {
                        base: Box::new(e),
                        name,
                    };
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    e = Expr::Index {
                        base: Box::new(e),
                        index: Box::new(index),
                    };
                }
                Some(Token::LParen) => {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen)?;
                    e = Expr::Call {
                        target: Box::new(e),
                        args,
                    };
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn primary(&mut self) -> Result<Expr, Error> {
        match self.peek() {
            Some(Token::None) => {
                self.advance();
                Ok(Expr::None)
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Some(Token::Int(_)) => match self.advance() {
                Some(Token::Int(i)) => Ok(Expr::Int(i)),
                _ => unreachable!(),
            },
            Some(Token::Str(_)) => match self.advance() {
                Some(Token::Str(s)) => Ok(Expr::Str(s)),
                _ => unreachable!(),
            },
            Some(Token::Ident(_)) => Ok(Expr::Ident(self.ident()?)),
            Some(Token::Fun) => {
                self.advance();
                self.expect(&Token::LParen)?;
                let mut params = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        params.push(self.ident()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RParen)?;
                let body = self.braced_block()?;
                Ok(Expr::Function { params, body })
            }
            Some(Token::LBrace) => {
                // Record literal: `{ a: expr; b: expr; }`.
                self.advance();
                let mut fields = Vec::new();
                while self.peek() != Some(&Token::RBrace) {
                    let name = self.ident()?;
                    self.expect(&Token::Colon)?;
                    let value = self.expression()?;
                    // Fields are terminated by `;`; a `,` is tolerated.
                    if !self.eat(&Token::Semicolon) {
                        self.eat(&Token::Comma);
                    }
                    fields.push((name, value));
                }
                self.expect(&Token::RBrace)?;
                Ok(Expr::Record(fields))
            }
            Some(Token::LParen) => {
                self.advance();
                let e = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            _ => Err(self.unexpected("expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment() {
        let b = parse_program("x = 1 + 2;").unwrap();
        assert_eq!(b.stmts.len(), 1);
        match &b.stmts[0] {
            Stmt::Assign { lhs, value } => {
                assert_eq!(*lhs, Expr::Ident("x".to_string()));
                assert!(matches!(value, Expr::Binary { op: BinOp::Add, .. }));
            }
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let b = parse_program("x = 1 + 2 * 3;").unwrap();
        match &b.stmts[0] {
            Stmt::Assign { value, .. } => match value {
                Expr::Binary { op: BinOp::Add, rhs, .. } => {
                    assert!(matches!(**rhs, Expr::Binary { op: BinOp::Mul, .. }));
                }
                other => panic!("unexpected expr {other:?}"),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_call_statement_required() {
        assert!(parse_program("f();").is_ok());
        assert!(parse_program("1 + 2;").is_err());
    }

    #[test]
    fn test_if_else_and_while() {
        let src = "while (x > 0) { if (y) { x = x - 1; } else { x = 0; } }";
        let b = parse_program(src).unwrap();
        assert!(matches!(b.stmts[0], Stmt::While { .. }));
    }

    #[test]
    fn test_fun_and_record() {
        let src = "f = fun (a, b) { return { x: a; y: b; }; };";
        let b = parse_program(src).unwrap();
        match &b.stmts[0] {
            Stmt::Assign { value, .. } => {
                assert!(matches!(value, Expr::Function { params, .. } if params.len() == 2));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_postfix_chain() {
        let b = parse_program("x = r.a[0](1).b;").unwrap();
        assert!(matches!(&b.stmts[0], Stmt::Assign { .. }));
    }

    #[test]
    fn test_unary_minus_is_distinct_from_literal() {
        let b = parse_program("x = -5;").unwrap();
        match &b.stmts[0] {
            Stmt::Assign { value, .. } => {
                assert!(matches!(value, Expr::Unary { op: UnOp::Neg, .. }));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_missing_semicolon_is_parse_error() {
        let err = parse_program("x = 1").unwrap_err();
        assert!(err.to_string().starts_with("ParseError:"));
    }
}
