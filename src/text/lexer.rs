// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Tokenization of the WebAssembly text format.

use super::{ParseError, ParseErrorKind};

/// A token with its source position (1-based line and column).
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct Token {
    pub(super) kind: TokenKind,
    pub(super) line: u32,
    pub(super) col: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) enum TokenKind {
    LParen,
    RParen,
    /// A keyword: an atom starting with a lowercase letter (`func`,
    /// `i32.add`, `offset=8`, `nan:0x7f`).
    Keyword(Box<str>),
    /// An identifier: `$name`, stored without the sigil.
    Id(Box<str>),
    /// A numeric literal, stored as written (sign, radix prefix, and digit
    /// separators included); interpreted by the parser in context.
    Num(Box<str>),
    /// A string literal, decoded to bytes (escapes applied). Not necessarily
    /// UTF-8: data segments may carry arbitrary bytes.
    Str(Vec<u8>),
}

impl TokenKind {
    /// A short description for error messages.
    pub(super) fn describe(&self) -> String {
        match self {
            TokenKind::LParen => "`(`".to_string(),
            TokenKind::RParen => "`)`".to_string(),
            TokenKind::Keyword(kw) => format!("`{kw}`"),
            TokenKind::Id(id) => format!("`${id}`"),
            TokenKind::Num(text) => format!("`{text}`"),
            TokenKind::Str(_) => "string literal".to_string(),
        }
    }
}

// Characters permitted in atoms (keywords, identifiers, numbers).
fn is_idchar(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '.'
                | '/'
                | ':'
                | '<'
                | '='
                | '>'
                | '?'
                | '@'
                | '\\'
                | '^'
                | '_'
                | '`'
                | '|'
                | '~'
        )
}

struct Lexer<'a> {
    chars: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn error(&self, kind: ParseErrorKind) -> ParseError {
        ParseError {
            kind,
            line: self.line,
            col: self.col,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(byte)
    }

    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.bump();
                }
                Some(b';') if self.peek_at(1) == Some(b';') => {
                    while let Some(byte) = self.peek() {
                        if byte == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'(') if self.peek_at(1) == Some(b';') => {
                    self.skip_block_comment()?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), ParseError> {
        let (line, col) = (self.line, self.col);
        self.bump(); // '('
        self.bump(); // ';'
        let mut depth = 1u32;
        while depth > 0 {
            match self.peek() {
                Some(b'(') if self.peek_at(1) == Some(b';') => {
                    self.bump();
                    self.bump();
                    depth += 1;
                }
                Some(b';') if self.peek_at(1) == Some(b')') => {
                    self.bump();
                    self.bump();
                    depth -= 1;
                }
                Some(_) => {
                    self.bump();
                }
                None => {
                    return Err(ParseError {
                        kind: ParseErrorKind::UnterminatedComment,
                        line,
                        col,
                    });
                }
            }
        }
        Ok(())
    }

    fn lex_string(&mut self) -> Result<Vec<u8>, ParseError> {
        let (line, col) = (self.line, self.col);
        self.bump(); // opening quote
        let mut bytes = Vec::new();
        loop {
            let Some(byte) = self.bump() else {
                return Err(ParseError {
                    kind: ParseErrorKind::UnterminatedString,
                    line,
                    col,
                });
            };
            match byte {
                b'"' => return Ok(bytes),
                b'\\' => {
                    let escape = self
                        .bump()
                        .ok_or(ParseError {
                            kind: ParseErrorKind::UnterminatedString,
                            line,
                            col,
                        })?;
                    match escape {
                        b't' => bytes.push(b'\t'),
                        b'n' => bytes.push(b'\n'),
                        b'r' => bytes.push(b'\r'),
                        b'"' => bytes.push(b'"'),
                        b'\'' => bytes.push(b'\''),
                        b'\\' => bytes.push(b'\\'),
                        b'u' => {
                            // \u{hex}: a Unicode scalar, encoded as UTF-8.
                            if self.bump() != Some(b'{') {
                                return Err(self.error(ParseErrorKind::InvalidEscape));
                            }
                            let mut value: u32 = 0;
                            let mut digits = 0;
                            loop {
                                match self.bump() {
                                    Some(b'}') => break,
                                    Some(d) => {
                                        let digit = (d as char)
                                            .to_digit(16)
                                            .ok_or_else(|| self.error(ParseErrorKind::InvalidEscape))?;
                                        value = value
                                            .checked_mul(16)
                                            .and_then(|v| v.checked_add(digit))
                                            .ok_or_else(|| self.error(ParseErrorKind::InvalidEscape))?;
                                        digits += 1;
                                    }
                                    None => {
                                        return Err(self.error(ParseErrorKind::UnterminatedString));
                                    }
                                }
                            }
                            if digits == 0 {
                                return Err(self.error(ParseErrorKind::InvalidEscape));
                            }
                            let c = char::from_u32(value)
                                .ok_or_else(|| self.error(ParseErrorKind::InvalidEscape))?;
                            let mut buf = [0u8; 4];
                            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                        }
                        _ => {
                            // Two hex digits name a raw byte.
                            let hi = (escape as char).to_digit(16);
                            let lo = self
                                .bump()
                                .and_then(|b| (b as char).to_digit(16));
                            match (hi, lo) {
                                (Some(hi), Some(lo)) => bytes.push((hi * 16 + lo) as u8),
                                _ => return Err(self.error(ParseErrorKind::InvalidEscape)),
                            }
                        }
                    }
                }
                _ => bytes.push(byte),
            }
        }
    }

    fn lex_atom(&mut self) -> (Box<str>, char) {
        let start = self.pos;
        let first = self.chars[self.pos] as char;
        while let Some(byte) = self.peek() {
            if is_idchar(byte as char) {
                self.bump();
            } else {
                break;
            }
        }
        // Atoms are drawn from the ASCII idchar set, so the byte range is
        // valid UTF-8.
        let text = core::str::from_utf8(&self.chars[start..self.pos]).unwrap();
        (text.into(), first)
    }
}

/// Tokenizes a complete source string, stripping comments.
pub(super) fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        lexer.skip_trivia()?;
        let (line, col) = (lexer.line, lexer.col);
        let Some(byte) = lexer.peek() else {
            return Ok(tokens);
        };
        let kind = match byte {
            b'(' => {
                lexer.bump();
                TokenKind::LParen
            }
            b')' => {
                lexer.bump();
                TokenKind::RParen
            }
            b'"' => TokenKind::Str(lexer.lex_string()?),
            _ if is_idchar(byte as char) => {
                let (text, first) = lexer.lex_atom();
                match first {
                    '$' => TokenKind::Id(text[1..].into()),
                    '0'..='9' | '+' | '-' => TokenKind::Num(text),
                    'a'..='z' => TokenKind::Keyword(text),
                    _ => {
                        return Err(ParseError {
                            kind: ParseErrorKind::UnexpectedCharacter(first),
                            line,
                            col,
                        });
                    }
                }
            }
            _ => {
                return Err(ParseError {
                    kind: ParseErrorKind::UnexpectedCharacter(byte as char),
                    line,
                    col,
                });
            }
        };
        tokens.push(Token { kind, line, col });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn basic_tokens() {
        assert_eq!(
            kinds("(module $m)"),
            vec![
                TokenKind::LParen,
                TokenKind::Keyword("module".into()),
                TokenKind::Id("m".into()),
                TokenKind::RParen,
            ]
        );
    }

    #[test]
    fn numbers_keep_their_text() {
        assert_eq!(
            kinds("42 -1 0x1f 1_000 +2.5e3"),
            vec![
                TokenKind::Num("42".into()),
                TokenKind::Num("-1".into()),
                TokenKind::Num("0x1f".into()),
                TokenKind::Num("1_000".into()),
                TokenKind::Num("+2.5e3".into()),
            ]
        );
    }

    #[test]
    fn nan_forms_are_keywords() {
        assert_eq!(
            kinds("nan inf nan:0x400"),
            vec![
                TokenKind::Keyword("nan".into()),
                TokenKind::Keyword("inf".into()),
                TokenKind::Keyword("nan:0x400".into()),
            ]
        );
    }

    #[test]
    fn comments_are_stripped() {
        assert_eq!(
            kinds(";; line\n(func (; inner (; nested ;) still ;) )"),
            vec![
                TokenKind::LParen,
                TokenKind::Keyword("func".into()),
                TokenKind::RParen,
            ]
        );
    }

    #[test]
    fn unterminated_block_comment() {
        let err = tokenize("(; never closed").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnterminatedComment);
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            kinds(r#""a\n\74\"""#),
            vec![TokenKind::Str(b"a\nt\"".to_vec())]
        );
    }

    #[test]
    fn unicode_escape() {
        assert_eq!(
            kinds(r#""\u{2764}""#),
            vec![TokenKind::Str("\u{2764}".as_bytes().to_vec())]
        );
    }

    #[test]
    fn positions_track_lines() {
        let tokens = tokenize("(\n  func").unwrap();
        assert_eq!((tokens[0].line, tokens[0].col), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].col), (2, 3));
    }
}
