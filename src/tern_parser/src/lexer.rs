//! The lexer.
//!
//! Callable in blocks: the caller hands a growing buffer and the lexer
//! consumes a prefix ending at the last complete line, leaving an
//! incomplete trailing line for the next call. Lexical errors become
//! recovered error tokens; the lexer resumes at the next whitespace.

use log::trace;

use tern_syntax::{SymbolTable, Token, TokenKind, TokenPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Latin1,
    Ascii,
}

#[derive(Debug)]
pub struct Lexer {
    pub encoding: Encoding,
    line: u32,
    at_file_start: bool,
}

impl Default for Lexer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

impl Lexer {
    pub fn new() -> Lexer {
        Lexer {
            encoding: Encoding::Utf8,
            line: 1,
            at_file_start: true,
        }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    /// Tokenize a prefix of `buf`, appending to `out`. Returns the number
    /// of bytes consumed. Unless `is_eof` is set, consumption stops after
    /// the last complete line.
    pub fn tokenize_block(
        &mut self,
        symbols: &mut SymbolTable,
        buf: &[u8],
        is_eof: bool,
        out: &mut Vec<Token>,
    ) -> usize {
        let limit = if is_eof {
            buf.len()
        } else {
            match buf.iter().rposition(|&b| b == b'\n') {
                Some(p) => p + 1,
                None => return 0,
            }
        };
        trace!("lexing block of {limit} bytes at line {}", self.line);

        let mut i = 0usize;
        if self.at_file_start {
            if buf.len() >= 3 && &buf[..3] == [0xef, 0xbb, 0xbf] {
                out.push(Token::new(TokenKind::Bom, self.line));
                i = 3;
            }
            self.at_file_start = false;
        }

        while i < limit {
            let b = buf[i];
            match b {
                b'\n' => {
                    self.push_newline(out);
                    self.line += 1;
                    i += 1;
                }
                b' ' | b'\t' | b'\r' => i += 1,
                b'-' if i + 1 < limit && buf[i + 1] == b'-' => {
                    i = self.lex_comment(buf, i + 2, limit, out);
                }
                b'\'' | b'"' => {
                    i = self.lex_string(buf, i, limit, out);
                }
                _ if b.is_ascii_digit() => {
                    i = self.lex_number(buf, i, limit, out);
                }
                _ if is_ident_start(b) => {
                    let start = i;
                    while i < limit && is_ident_continue(buf[i]) {
                        i += 1;
                    }
                    let text = std::str::from_utf8(&buf[start..i]).unwrap();
                    let sym = symbols.intern(text);
                    let kind = symbols.get(sym).reserved.unwrap_or(TokenKind::Ident);
                    out.push(Token {
                        kind,
                        line: self.line,
                        payload: TokenPayload::Symbol(sym),
                    });
                }
                _ => {
                    i = self.lex_punctuator(buf, i, limit, out);
                }
            }
        }

        if is_eof {
            self.push_newline(out);
            out.push(Token::new(TokenKind::Eof, self.line));
        }
        limit
    }

    fn push_newline(&mut self, out: &mut Vec<Token>) {
        match out.last() {
            None => {}
            Some(t) if t.kind == TokenKind::Newline => {}
            _ => out.push(Token::new(TokenKind::Newline, self.line)),
        }
    }

    fn error_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.line)
    }

    /// Skip forward to the next whitespace byte after a lexical error.
    fn recover(&self, buf: &[u8], mut i: usize, limit: usize) -> usize {
        while i < limit && !matches!(buf[i], b' ' | b'\t' | b'\r' | b'\n') {
            i += 1;
        }
        i
    }

    fn lex_comment(
        &mut self,
        buf: &[u8],
        mut i: usize,
        limit: usize,
        out: &mut Vec<Token>,
    ) -> usize {
        let mut reported = false;
        while i < limit && buf[i] != b'\n' {
            let b = buf[i];
            if b >= 0x80 {
                match self.encoding {
                    Encoding::Ascii => {
                        if !reported {
                            out.push(self.error_token(TokenKind::ErrNonAsciiCommentChar));
                            reported = true;
                        }
                        i += 1;
                    }
                    Encoding::Latin1 => i += 1,
                    Encoding::Utf8 => match utf8_sequence_len(buf, i, limit) {
                        Some(n) => i += n,
                        None => {
                            if !reported {
                                out.push(self.error_token(TokenKind::ErrInvalidUtf8Sequence));
                                reported = true;
                            }
                            i += 1;
                        }
                    },
                }
            } else {
                i += 1;
            }
        }
        i
    }

    fn lex_string(&mut self, buf: &[u8], start: usize, limit: usize, out: &mut Vec<Token>) -> usize {
        let quote = buf[start];
        let mut value = String::new();
        let mut i = start + 1;
        loop {
            if i >= limit || buf[i] == b'\n' {
                out.push(self.error_token(TokenKind::ErrStringUnterminated));
                return i;
            }
            let b = buf[i];
            if b == quote {
                // A doubled quote is a literal quote character.
                if i + 1 < limit && buf[i + 1] == quote {
                    value.push(quote as char);
                    i += 2;
                    continue;
                }
                i += 1;
                break;
            }
            if b >= 0x80 {
                match self.encoding {
                    Encoding::Ascii => {
                        out.push(self.error_token(TokenKind::ErrNonAsciiStringChar));
                        return self.recover(buf, i, limit);
                    }
                    Encoding::Latin1 => {
                        value.push(b as char);
                        i += 1;
                    }
                    Encoding::Utf8 => match utf8_sequence_len(buf, i, limit) {
                        Some(n) => {
                            let s = std::str::from_utf8(&buf[i..i + n]).unwrap();
                            value.push_str(s);
                            i += n;
                        }
                        None => {
                            out.push(self.error_token(TokenKind::ErrInvalidUtf8Sequence));
                            return self.recover(buf, i, limit);
                        }
                    },
                }
            } else {
                value.push(b as char);
                i += 1;
            }
        }
        out.push(Token {
            kind: TokenKind::StrLit,
            line: self.line,
            payload: TokenPayload::Str(value),
        });
        i
    }

    fn lex_number(&mut self, buf: &[u8], start: usize, limit: usize, out: &mut Vec<Token>) -> usize {
        let mut i = start;
        if buf[i] == b'0' && i + 1 < limit && (buf[i + 1] | 0x20) == b'x' {
            i += 2;
            let digits_start = i;
            let mut value: i64 = 0;
            let mut overflow = false;
            while i < limit && buf[i].is_ascii_hexdigit() {
                let digit = (buf[i] as char).to_digit(16).unwrap() as i64;
                value = match value.checked_mul(16).and_then(|v| v.checked_add(digit)) {
                    Some(v) => v,
                    None => {
                        overflow = true;
                        0
                    }
                };
                i += 1;
            }
            if i == digits_start || overflow || (i < limit && is_ident_continue(buf[i])) {
                out.push(self.error_token(TokenKind::ErrInvalidNumeric));
                return self.recover(buf, i, limit);
            }
            out.push(Token {
                kind: TokenKind::IntLit,
                line: self.line,
                payload: TokenPayload::Int(value),
            });
            return i;
        }

        while i < limit && buf[i].is_ascii_digit() {
            i += 1;
        }
        let mut is_float = false;
        if i < limit && buf[i] == b'.' && i + 1 < limit && buf[i + 1].is_ascii_digit() {
            is_float = true;
            i += 1;
            while i < limit && buf[i].is_ascii_digit() {
                i += 1;
            }
        }
        if i < limit && (buf[i] | 0x20) == b'e' {
            let mut j = i + 1;
            if j < limit && (buf[j] == b'+' || buf[j] == b'-') {
                j += 1;
            }
            if j < limit && buf[j].is_ascii_digit() {
                is_float = true;
                i = j;
                while i < limit && buf[i].is_ascii_digit() {
                    i += 1;
                }
            }
        }
        if i < limit && is_ident_continue(buf[i]) {
            out.push(self.error_token(TokenKind::ErrInvalidNumeric));
            return self.recover(buf, i, limit);
        }
        let text = std::str::from_utf8(&buf[start..i]).unwrap();
        if is_float {
            match text.parse::<f64>() {
                Ok(v) => out.push(Token {
                    kind: TokenKind::FloatLit,
                    line: self.line,
                    payload: TokenPayload::Float(v),
                }),
                Err(_) => out.push(self.error_token(TokenKind::ErrInvalidNumeric)),
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) => out.push(Token {
                    kind: TokenKind::IntLit,
                    line: self.line,
                    payload: TokenPayload::Int(v),
                }),
                Err(_) => out.push(self.error_token(TokenKind::ErrInvalidNumeric)),
            }
        }
        i
    }

    fn lex_punctuator(
        &mut self,
        buf: &[u8],
        i: usize,
        limit: usize,
        out: &mut Vec<Token>,
    ) -> usize {
        let rest = &buf[i..limit];
        let two = |a: u8, b: u8| rest.len() >= 2 && rest[0] == a && rest[1] == b;
        let three = |a: u8, b: u8, c: u8| {
            rest.len() >= 3 && rest[0] == a && rest[1] == b && rest[2] == c
        };
        let (kind, len) = if three(b'*', b'*', b'=') {
            (TokenKind::AssignPow, 3)
        } else if two(b'*', b'*') {
            (TokenKind::Pow, 2)
        } else if two(b'=', b'=') {
            (TokenKind::Eq, 2)
        } else if two(b'!', b'=') {
            (TokenKind::Neq, 2)
        } else if two(b'<', b'=') {
            (TokenKind::Lte, 2)
        } else if two(b'>', b'=') {
            (TokenKind::Gte, 2)
        } else if two(b':', b':') {
            (TokenKind::ScopeOp, 2)
        } else if two(b'+', b'=') {
            (TokenKind::AssignAdd, 2)
        } else if two(b'-', b'=') {
            (TokenKind::AssignSub, 2)
        } else if two(b'*', b'=') {
            (TokenKind::AssignMul, 2)
        } else if two(b'/', b'=') {
            (TokenKind::AssignDiv, 2)
        } else {
            match rest[0] {
                b'+' => (TokenKind::Plus, 1),
                b'-' => (TokenKind::Minus, 1),
                b'*' => (TokenKind::Star, 1),
                b'/' => (TokenKind::Slash, 1),
                b'=' => (TokenKind::Assign, 1),
                b'<' => (TokenKind::Lt, 1),
                b'>' => (TokenKind::Gt, 1),
                b',' => (TokenKind::Comma, 1),
                b'(' => (TokenKind::LParen, 1),
                b')' => (TokenKind::RParen, 1),
                b'[' => (TokenKind::LBracket, 1),
                b']' => (TokenKind::RBracket, 1),
                b':' => (TokenKind::Colon, 1),
                b'.' => (TokenKind::Dot, 1),
                _ => {
                    out.push(self.error_token(TokenKind::ErrUnrecognizedChar));
                    return self.recover(buf, i + 1, limit);
                }
            }
        };
        out.push(Token::new(kind, self.line));
        i + len
    }
}

/// The byte length of a valid UTF-8 sequence starting at `i`, or None.
fn utf8_sequence_len(buf: &[u8], i: usize, limit: usize) -> Option<usize> {
    let b = buf[i];
    let len = match b {
        0xc2..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf4 => 4,
        _ => return None,
    };
    if i + len > limit {
        return None;
    }
    std::str::from_utf8(&buf[i..i + len]).ok().map(|_| len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Token> {
        let mut symbols = SymbolTable::new();
        let mut lexer = Lexer::new();
        let mut out = Vec::new();
        let n = lexer.tokenize_block(&mut symbols, src.as_bytes(), true, &mut out);
        assert_eq!(n, src.len());
        out
    }

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_idents_and_punctuators() {
        let tokens = lex("def Main()\n  WriteLn(\"hi\")\nend\n");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Def,
                TokenKind::Ident,
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::Newline,
                TokenKind::Ident,
                TokenKind::LParen,
                TokenKind::StrLit,
                TokenKind::RParen,
                TokenKind::Newline,
                TokenKind::End,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
        assert_eq!(tokens[7].payload, TokenPayload::Str("hi".to_string()));
    }

    #[test]
    fn block_interface_leaves_partial_lines() {
        let mut symbols = SymbolTable::new();
        let mut lexer = Lexer::new();
        let mut out = Vec::new();
        let consumed = lexer.tokenize_block(&mut symbols, b"var x = 1\nvar y", false, &mut out);
        assert_eq!(consumed, 10);
        let more = lexer.tokenize_block(&mut symbols, b"var y = 2\n", true, &mut out);
        assert_eq!(more, 10);
        let var_count = out.iter().filter(|t| t.kind == TokenKind::Var).count();
        assert_eq!(var_count, 2);
        assert_eq!(out.last().unwrap().kind, TokenKind::Eof);
        // The second `var y` starts on line 2.
        assert_eq!(out[out.len() - 2].line, 2);
    }

    #[test]
    fn doubled_quote_escapes() {
        let tokens = lex("var s = \"a\"\"b\"\n");
        let lit = tokens.iter().find(|t| t.kind == TokenKind::StrLit).unwrap();
        assert_eq!(lit.payload, TokenPayload::Str("a\"b".to_string()));
    }

    #[test]
    fn unterminated_string_is_recovered() {
        let tokens = lex("var s = \"oops\nvar t = 1\n");
        assert!(tokens
            .iter()
            .any(|t| t.kind == TokenKind::ErrStringUnterminated));
        // Lexing resumed: the second statement is intact.
        assert_eq!(
            tokens.iter().filter(|t| t.kind == TokenKind::Var).count(),
            2
        );
    }

    #[test]
    fn numeric_literals() {
        let tokens = lex("1 42 0x1f 3.25 1e3 2.5e-2\n");
        let payloads: Vec<_> = tokens
            .iter()
            .filter_map(|t| match &t.payload {
                TokenPayload::Int(v) => Some(format!("i{v}")),
                TokenPayload::Float(v) => Some(format!("f{v}")),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec!["i1", "i42", "i31", "f3.25", "f1000", "f0.025"]);
    }

    #[test]
    fn invalid_numeric_is_an_error_token() {
        let tokens = lex("var x = 1abc\n");
        assert!(tokens.iter().any(|t| t.kind == TokenKind::ErrInvalidNumeric));
    }

    #[test]
    fn ascii_encoding_rejects_high_bytes_in_strings() {
        let mut symbols = SymbolTable::new();
        let mut lexer = Lexer::new();
        lexer.encoding = Encoding::Ascii;
        let mut out = Vec::new();
        lexer.tokenize_block(&mut symbols, b"var s = \"\xc3\xa9\"\n", true, &mut out);
        assert!(out
            .iter()
            .any(|t| t.kind == TokenKind::ErrNonAsciiStringChar));
    }

    #[test]
    fn latin1_passes_high_bytes_through() {
        let mut symbols = SymbolTable::new();
        let mut lexer = Lexer::new();
        lexer.encoding = Encoding::Latin1;
        let mut out = Vec::new();
        lexer.tokenize_block(&mut symbols, b"var s = \"\xe9\"\n", true, &mut out);
        let lit = out.iter().find(|t| t.kind == TokenKind::StrLit).unwrap();
        assert_eq!(lit.payload, TokenPayload::Str("\u{e9}".to_string()));
    }

    #[test]
    fn invalid_utf8_is_an_error_token() {
        let mut symbols = SymbolTable::new();
        let mut lexer = Lexer::new();
        let mut out = Vec::new();
        lexer.tokenize_block(&mut symbols, b"var s = \"\xc3\x28\"\n", true, &mut out);
        assert!(out
            .iter()
            .any(|t| t.kind == TokenKind::ErrInvalidUtf8Sequence));
    }

    #[test]
    fn bom_is_its_own_token() {
        let mut symbols = SymbolTable::new();
        let mut lexer = Lexer::new();
        let mut out = Vec::new();
        lexer.tokenize_block(&mut symbols, b"\xef\xbb\xbfvar x = 1\n", true, &mut out);
        assert_eq!(out[0].kind, TokenKind::Bom);
        assert_eq!(out[1].kind, TokenKind::Var);
    }

    #[test]
    fn word_operators_are_reserved_kinds() {
        let tokens = lex("a div b mod c and d or not e in f is g to h\n");
        for kind in [
            TokenKind::Div,
            TokenKind::Mod,
            TokenKind::And,
            TokenKind::Or,
            TokenKind::Not,
            TokenKind::In,
            TokenKind::Is,
            TokenKind::To,
        ] {
            assert!(kinds(&tokens).contains(&kind));
        }
    }
}
