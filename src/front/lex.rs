//! The tokenizer.
//!
//! Produces tokens on demand with a single token of lookahead, backed by a
//! table of `(Regex, TokenKind)` matchers tried in priority order — the
//! same shape the teacher's lexer uses, generalized from one token class per
//! keyword to the full MPSL surface. The character classifier for
//! identifiers is ASCII-only, as spec.md §4.2 requires (Unicode is not
//! handled).

use derive_more::Display;
use regex::Regex;
use std::sync::OnceLock;

use crate::common::error::Error;
use crate::common::Position;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{kind:?} {text:?} @ {pos}")]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub text: &'src str,
    pub pos: Position,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Ident,
    IntLit,
    HexIntLit,
    FloatLit,
    DoubleLit,
    // Keywords
    If,
    Else,
    For,
    While,
    Do,
    Break,
    Continue,
    Return,
    Const,
    // Punctuation / operators, longest-match-first.
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Semi,
    Comma,
    Dot,
    At,
    PlusPlus,
    MinusMinus,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    AmpEq,
    PipeEq,
    CaretEq,
    ShlEq,
    ShrEq,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
    LtEq,
    GtEq,
    Shl,
    Shr,
    Lt,
    Gt,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Assign,
    Question,
    Colon,
    Eof,
}

struct Matcher {
    regex: Regex,
    kind: TokenKind,
}

fn matcher_table() -> &'static Vec<Matcher> {
    static TABLE: OnceLock<Vec<Matcher>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use TokenKind::*;
        // Order matters: longer/more specific patterns before their
        // prefixes (e.g. hex before decimal int, `<=` before `<`).
        let specs: &[(&str, TokenKind)] = &[
            (r"\A0[xX][0-9a-fA-F]+", HexIntLit),
            (r"\A[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?f", FloatLit),
            (r"\A[0-9]+(\.[0-9]+([eE][+-]?[0-9]+)?|[eE][+-]?[0-9]+)", DoubleLit),
            (r"\A[0-9]+", IntLit),
            (r"\Aif\b", If),
            (r"\Aelse\b", Else),
            (r"\Afor\b", For),
            (r"\Awhile\b", While),
            (r"\Ado\b", Do),
            (r"\Abreak\b", Break),
            (r"\Acontinue\b", Continue),
            (r"\Areturn\b", Return),
            (r"\Aconst\b", Const),
            (r"\A[A-Za-z_][A-Za-z0-9_]*", Ident),
            (r"\A\{", LBrace),
            (r"\A\}", RBrace),
            (r"\A\(", LParen),
            (r"\A\)", RParen),
            (r"\A\[", LBracket),
            (r"\A\]", RBracket),
            (r"\A;", Semi),
            (r"\A,", Comma),
            (r"\A\.", Dot),
            (r"\A@", At),
            (r"\A\+\+", PlusPlus),
            (r"\A--", MinusMinus),
            (r"\A\+=", PlusEq),
            (r"\A-=", MinusEq),
            (r"\A\*=", StarEq),
            (r"\A/=", SlashEq),
            (r"\A%=", PercentEq),
            (r"\A&=", AmpEq),
            (r"\A\|=", PipeEq),
            (r"\A\^=", CaretEq),
            (r"\A<<=", ShlEq),
            (r"\A>>=", ShrEq),
            (r"\A&&", AndAnd),
            (r"\A\|\|", OrOr),
            (r"\A==", EqEq),
            (r"\A!=", NotEq),
            (r"\A<=", LtEq),
            (r"\A>=", GtEq),
            (r"\A<<", Shl),
            (r"\A>>", Shr),
            (r"\A<", Lt),
            (r"\A>", Gt),
            (r"\A\+", Plus),
            (r"\A-", Minus),
            (r"\A\*", Star),
            (r"\A/", Slash),
            (r"\A%", Percent),
            (r"\A&", Amp),
            (r"\A\|", Pipe),
            (r"\A\^", Caret),
            (r"\A~", Tilde),
            (r"\A!", Bang),
            (r"\A=", Assign),
            (r"\A\?", Question),
            (r"\A:", Colon),
        ];
        specs
            .iter()
            .map(|(re, kind)| Matcher { regex: Regex::new(re).unwrap(), kind: *kind })
            .collect()
    })
}

fn whitespace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\A(?:[ \t\r\n\x0b\x0c]|//[^\n]*)*").unwrap())
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    line: u32,
    col: u32,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Lexer<'input> {
        Lexer { input, pos: 0, line: 1, col: 1 }
    }

    pub fn end_of_input(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn advance_pos(&mut self, n: usize) {
        for ch in self.input[self.pos..self.pos + n].chars() {
            if ch == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
        self.pos += n;
    }

    fn skip_trivia(&mut self) -> Result<(), Error> {
        loop {
            if let Some(m) = whitespace_regex().find(&self.input[self.pos..]) {
                if m.end() > 0 {
                    self.advance_pos(m.end());
                    continue;
                }
            }
            if self.input[self.pos..].starts_with("/*") {
                match self.input[self.pos + 2..].find("*/") {
                    Some(end) => self.advance_pos(end + 4),
                    None => {
                        return Err(Error::SyntaxError {
                            pos: self.position(),
                            message: "unterminated block comment".into(),
                        })
                    }
                }
                continue;
            }
            return Ok(());
        }
    }

    fn position(&self) -> Position {
        Position { line: self.line, column: self.col, offset: self.pos as u32 }
    }

    /// Get the next token, or `None` at end of input.
    pub fn next(&mut self) -> Result<Option<Token<'input>>, Error> {
        self.skip_trivia()?;
        if self.end_of_input() {
            return Ok(None);
        }
        let start = self.position();
        let rest = &self.input[self.pos..];
        for m in matcher_table() {
            if let Some(found) = m.regex.find(rest) {
                if found.start() == 0 && found.end() > 0 {
                    let text = &rest[..found.end()];
                    self.advance_pos(found.end());
                    return Ok(Some(Token { kind: m.kind, text, pos: start }));
                }
            }
        }
        let bad = rest.chars().next().unwrap();
        Err(Error::SyntaxError { pos: start, message: format!("unexpected character {bad:?}") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        while let Some(tok) = lexer.next().unwrap() {
            out.push(tok.kind);
        }
        out
    }

    #[test]
    fn classifies_numeric_literal_forms() {
        use TokenKind::*;
        assert_eq!(kinds("42"), vec![IntLit]);
        assert_eq!(kinds("0xFF"), vec![HexIntLit]);
        assert_eq!(kinds("1.5f"), vec![FloatLit]);
        assert_eq!(kinds("1.5"), vec![DoubleLit]);
        assert_eq!(kinds("1e10"), vec![DoubleLit]);
    }

    #[test]
    fn skips_line_and_block_comments() {
        use TokenKind::*;
        assert_eq!(kinds("1 // comment\n2"), vec![IntLit, IntLit]);
        assert_eq!(kinds("1 /* c */ 2"), vec![IntLit, IntLit]);
    }

    #[test]
    fn reports_unterminated_block_comment() {
        let mut lexer = Lexer::new("/* never closes");
        assert!(lexer.next().is_err());
    }

    #[test]
    fn reports_invalid_character() {
        let mut lexer = Lexer::new("$");
        assert!(lexer.next().is_err());
    }

    #[test]
    fn identifies_keywords_distinctly_from_identifiers() {
        use TokenKind::*;
        assert_eq!(kinds("if ifx"), vec![If, Ident]);
    }
}
