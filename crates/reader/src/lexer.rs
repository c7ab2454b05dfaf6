//! Lexical analysis for textual LLVM IR.
//!
//! The token stream is line-oriented: newlines are tokens, which lets the
//! parser recover from constructs it does not model by skipping to the end
//! of the line.

use crate::error::Location;

/// One token with its source location.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Newline,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LAngle,
    RAngle,
    Comma,
    Equal,
    Star,
    Ellipsis,
    /// A bare identifier or keyword (`define`, `i32`, `alloca`, ...).
    Ident(String),
    /// `%name`, `%"quoted"`, or `%42`.
    LocalId(String),
    /// `@name`, `@"quoted"`, or `@42`.
    GlobalId(String),
    /// `!42`.
    MetadataRef(u32),
    /// `!name` (includes node kinds such as `!DILocation`).
    MetadataName(String),
    /// A `!` immediately followed by `{` or `"` (anonymous metadata).
    Bang,
    /// `#42`.
    AttrGroupRef(u32),
    /// `#dbg_declare`-style record heads.
    HashIdent(String),
    /// An integer literal (decimal or `0x` hexadecimal, possibly signed).
    Integer(i128),
    /// A floating-point literal, kept as text.
    FloatLit(String),
    /// `"..."` with escapes decoded to bytes.
    Str(Vec<u8>),
    /// `name:` introducing a basic block.
    LabelDecl(String),
}

/// The lexer itself.
pub struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
    line_number: usize,
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'.' || c == b'$'
}

fn is_ident_cont(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'$'
}

fn is_sym_cont(c: u8) -> bool {
    // Characters allowed in unquoted %/@/! names.
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'$' || c == b'-'
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos: 0,
            line_number: 1,
        }
    }

    pub fn location(&self) -> Location {
        Location {
            line_number: self.line_number,
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_horizontal_space(&mut self) {
        while let Some(b) = self.peek_byte() {
            match b {
                b' ' | b'\t' | b'\r' => {
                    self.pos += 1;
                }
                b';' => {
                    // Comment to end of line.
                    while let Some(b) = self.peek_byte() {
                        if b == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_quoted(&mut self) -> Vec<u8> {
        // Opening quote already consumed.
        let mut out = Vec::new();
        while let Some(b) = self.bump() {
            match b {
                b'"' => break,
                b'\\' => {
                    let hi = self.peek_byte();
                    match hi {
                        Some(b'\\') => {
                            self.pos += 1;
                            out.push(b'\\');
                        }
                        Some(h) if h.is_ascii_hexdigit() => {
                            self.pos += 1;
                            let lo = self.peek_byte().unwrap_or(b'0');
                            if lo.is_ascii_hexdigit() {
                                self.pos += 1;
                                let hex =
                                    [h, lo].iter().fold(0u8, |acc, &d| {
                                        acc * 16 + (d as char).to_digit(16).unwrap() as u8
                                    });
                                out.push(hex);
                            } else {
                                out.push(h);
                            }
                        }
                        _ => out.push(b'\\'),
                    }
                }
                _ => out.push(b),
            }
        }
        out
    }

    fn lex_symbol_name(&mut self) -> String {
        // Called after the %/@/! sigil; handles quoted and plain names.
        if self.peek_byte() == Some(b'"') {
            self.pos += 1;
            let bytes = self.lex_quoted();
            return String::from_utf8_lossy(&bytes).into_owned();
        }
        let start = self.pos;
        while let Some(b) = self.peek_byte() {
            if is_sym_cont(b) {
                self.pos += 1;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
    }

    fn lex_number(&mut self) -> Token {
        let start = self.pos;
        if self.peek_byte() == Some(b'-') {
            self.pos += 1;
        }
        if self.peek_byte() == Some(b'0')
            && matches!(self.bytes.get(self.pos + 1), Some(b'x' | b'X'))
        {
            self.pos += 2;
            // LLVM hex float payloads can carry a kind letter (0xK..., 0xL...).
            if matches!(self.peek_byte(), Some(b'K' | b'L' | b'M' | b'H' | b'R')) {
                self.pos += 1;
            }
            let digits_start = self.pos;
            while let Some(b) = self.peek_byte() {
                if b.is_ascii_hexdigit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            let text = &self.bytes[digits_start..self.pos];
            let text = String::from_utf8_lossy(text);
            return match u128::from_str_radix(&text, 16) {
                Ok(v) => Token::Integer(v as i128),
                Err(_) => Token::FloatLit(text.into_owned()),
            };
        }
        let mut is_float = false;
        while let Some(b) = self.peek_byte() {
            match b {
                b'0'..=b'9' => self.pos += 1,
                b'.' => {
                    is_float = true;
                    self.pos += 1;
                }
                b'e' | b'E' => {
                    is_float = true;
                    self.pos += 1;
                    if matches!(self.peek_byte(), Some(b'+' | b'-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let text = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
        if is_float {
            Token::FloatLit(text)
        } else {
            match text.parse::<i128>() {
                Ok(v) => Token::Integer(v),
                Err(_) => Token::FloatLit(text),
            }
        }
    }

    /// Produce the next token, or `None` at end of input.
    pub fn next_token(&mut self) -> Option<(Location, Token)> {
        self.skip_horizontal_space();
        let loc = self.location();
        let b = self.peek_byte()?;
        let token = match b {
            b'\n' => {
                self.pos += 1;
                self.line_number += 1;
                Token::Newline
            }
            b'(' => {
                self.pos += 1;
                Token::LParen
            }
            b')' => {
                self.pos += 1;
                Token::RParen
            }
            b'{' => {
                self.pos += 1;
                Token::LBrace
            }
            b'}' => {
                self.pos += 1;
                Token::RBrace
            }
            b'[' => {
                self.pos += 1;
                Token::LBracket
            }
            b']' => {
                self.pos += 1;
                Token::RBracket
            }
            b'<' => {
                self.pos += 1;
                Token::LAngle
            }
            b'>' => {
                self.pos += 1;
                Token::RAngle
            }
            b',' => {
                self.pos += 1;
                Token::Comma
            }
            b'=' => {
                self.pos += 1;
                Token::Equal
            }
            b'*' => {
                self.pos += 1;
                Token::Star
            }
            b'%' => {
                self.pos += 1;
                Token::LocalId(self.lex_symbol_name())
            }
            b'@' => {
                self.pos += 1;
                Token::GlobalId(self.lex_symbol_name())
            }
            b'!' => {
                self.pos += 1;
                match self.peek_byte() {
                    Some(b'{') | Some(b'"') => Token::Bang,
                    Some(c) if c.is_ascii_digit() => {
                        let name = self.lex_symbol_name();
                        match name.parse::<u32>() {
                            Ok(n) => Token::MetadataRef(n),
                            Err(_) => Token::MetadataName(name),
                        }
                    }
                    _ => Token::MetadataName(self.lex_symbol_name()),
                }
            }
            b'#' => {
                self.pos += 1;
                let name = self.lex_symbol_name();
                match name.parse::<u32>() {
                    Ok(n) => Token::AttrGroupRef(n),
                    Err(_) => Token::HashIdent(name),
                }
            }
            b'"' => {
                self.pos += 1;
                Token::Str(self.lex_quoted())
            }
            b'.' if self.bytes.get(self.pos..self.pos + 3) == Some(b"...") => {
                self.pos += 3;
                Token::Ellipsis
            }
            b'0'..=b'9' => {
                let tok = self.lex_number();
                // Unnamed basic blocks are introduced as `5:`.
                if let Token::Integer(n) = tok {
                    if self.peek_byte() == Some(b':') {
                        self.pos += 1;
                        return Some((loc, Token::LabelDecl(n.to_string())));
                    }
                }
                tok
            }
            b'-' => self.lex_number(),
            c if is_ident_start(c) => {
                let start = self.pos;
                while let Some(b) = self.peek_byte() {
                    if is_ident_cont(b) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
                if self.peek_byte() == Some(b':') {
                    self.pos += 1;
                    Token::LabelDecl(text)
                } else {
                    Token::Ident(text)
                }
            }
            _ => {
                // Unknown byte: skip it so the parser can keep going.
                self.pos += 1;
                return self.next_token();
            }
        };
        Some((loc, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(text: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(text);
        let mut out = Vec::new();
        while let Some((_, tok)) = lexer.next_token() {
            out.push(tok);
        }
        out
    }

    #[test]
    fn basic_line() {
        let toks = tokens("%t = alloca [10 x i8], align 1 ; comment\n");
        assert_eq!(
            toks,
            vec![
                Token::LocalId("t".to_string()),
                Token::Equal,
                Token::Ident("alloca".to_string()),
                Token::LBracket,
                Token::Integer(10),
                Token::Ident("x".to_string()),
                Token::Ident("i8".to_string()),
                Token::RBracket,
                Token::Comma,
                Token::Ident("align".to_string()),
                Token::Integer(1),
                Token::Newline,
            ]
        );
    }

    #[test]
    fn metadata_and_labels() {
        let toks = tokens("entry:\n  br label %if.end, !dbg !42\n");
        assert_eq!(
            toks,
            vec![
                Token::LabelDecl("entry".to_string()),
                Token::Newline,
                Token::Ident("br".to_string()),
                Token::Ident("label".to_string()),
                Token::LocalId("if.end".to_string()),
                Token::Comma,
                Token::MetadataName("dbg".to_string()),
                Token::MetadataRef(42),
                Token::Newline,
            ]
        );
    }

    #[test]
    fn negative_and_hex_numbers() {
        let toks = tokens("i64 -12 0x10");
        assert_eq!(
            toks,
            vec![
                Token::Ident("i64".to_string()),
                Token::Integer(-12),
                Token::Integer(16),
            ]
        );
    }

    #[test]
    fn quoted_string_escapes() {
        let toks = tokens("c\"ab\\00\"");
        assert_eq!(
            toks,
            vec![
                Token::Ident("c".to_string()),
                Token::Str(vec![b'a', b'b', 0]),
            ]
        );
    }

    #[test]
    fn dbg_record_head() {
        let toks = tokens("#dbg_declare(ptr %t, !14, !DIExpression(), !16)");
        assert_eq!(toks[0], Token::HashIdent("dbg_declare".to_string()));
        assert!(toks.contains(&Token::MetadataName("DIExpression".to_string())));
    }
}
