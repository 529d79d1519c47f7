//! Lexer for MITScript source, built on logos.

use crate::error::Error;
use crate::parser::token::{Span, Token};
use logos::Logos;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
enum LogosToken {
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("global")]
    Global,
    #[token("return")]
    Return,
    #[token("fun")]
    Fun,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("None")]
    None,

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i32>().ok())]
    Int(i32),

    // Contents keep their escape pairs verbatim; expansion happens at
    // display time.
    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    Str(String),

    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,

    #[token("==")]
    EqEq,
    #[token("=")]
    Assign,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("!")]
    Bang,
}

/// 1-based line number of a byte offset, for error messages.
fn line_of(src: &str, offset: usize) -> usize {
    src[..offset.min(src.len())].bytes().filter(|&b| b == b'\n').count() + 1
}

/// Tokenize the whole source up front.
pub fn tokenize(src: &str) -> Result<Vec<(Token, Span)>, Error> {
    let mut out = Vec::new();
    let mut lexer = LogosToken::lexer(src);
    while let Some(item) = lexer.next() {
        let span = Span::new(lexer.span().start, lexer.span().end);
        let tok = match item {
            Ok(t) => t,
            Err(()) => {
                // An Int variant that failed to parse also lands here.
                let slice = lexer.slice();
                if slice.bytes().next().is_some_and(|b| b.is_ascii_digit()) {
                    return Err(Error::ParseError(format!(
                        "integer literal out of range at line {}",
                        line_of(src, span.start)
                    )));
                }
                return Err(Error::ParseError(format!(
                    "unexpected character {:?} at line {}",
                    slice,
                    line_of(src, span.start)
                )));
            }
        };
        let tok = match tok {
            LogosToken::If => Token::If,
            LogosToken::Else => Token::Else,
            LogosToken::While => Token::While,
            LogosToken::Global => Token::Global,
            LogosToken::Return => Token::Return,
            LogosToken::Fun => Token::Fun,
            LogosToken::True => Token::True,
            LogosToken::False => Token::False,
            LogosToken::None => Token::None,
            LogosToken::Ident(s) => Token::Ident(s),
            LogosToken::Int(i) => Token::Int(i),
            LogosToken::Str(s) => Token::Str(s),
            LogosToken::LBrace => Token::LBrace,
            LogosToken::RBrace => Token::RBrace,
            LogosToken::LParen => Token::LParen,
            LogosToken::RParen => Token::RParen,
            LogosToken::LBracket => Token::LBracket,
            LogosToken::RBracket => Token::RBracket,
            LogosToken::Semicolon => Token::Semicolon,
            LogosToken::Colon => Token::Colon,
            LogosToken::Comma => Token::Comma,
            LogosToken::Dot => Token::Dot,
            LogosToken::EqEq => Token::EqEq,
            LogosToken::Assign => Token::Assign,
            LogosToken::LtEq => Token::LtEq,
            LogosToken::GtEq => Token::GtEq,
            LogosToken::Lt => Token::Lt,
            LogosToken::Gt => Token::Gt,
            LogosToken::Plus => Token::Plus,
            LogosToken::Minus => Token::Minus,
            LogosToken::Star => Token::Star,
            LogosToken::Slash => Token::Slash,
            LogosToken::Amp => Token::Amp,
            LogosToken::Pipe => Token::Pipe,
            LogosToken::Bang => Token::Bang,
        };
        out.push((tok, span));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_keywords_and_idents() {
        assert_eq!(
            toks("if ifx while fun x_1"),
            vec![
                Token::If,
                Token::Ident("ifx".to_string()),
                Token::While,
                Token::Fun,
                Token::Ident("x_1".to_string()),
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            toks("== = <= >= < >"),
            vec![
                Token::EqEq,
                Token::Assign,
                Token::LtEq,
                Token::GtEq,
                Token::Lt,
                Token::Gt
            ]
        );
    }

    #[test]
    fn test_string_keeps_escapes() {
        assert_eq!(
            toks(r#"x = "a\nb";"#),
            vec![
                Token::Ident("x".to_string()),
                Token::Assign,
                Token::Str(r"a\nb".to_string()),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            toks("x; // trailing comment\ny;"),
            vec![
                Token::Ident("x".to_string()),
                Token::Semicolon,
                Token::Ident("y".to_string()),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn test_int_overflow_rejected() {
        assert!(tokenize("x = 99999999999;").is_err());
    }

    #[test]
    fn test_unknown_character_rejected() {
        let err = tokenize("x = @;").unwrap_err();
        assert!(err.to_string().starts_with("ParseError:"));
    }
}
