//! Annotation elision.
//!
//! Type annotations never reach the parser: this pass re-tags their
//! tokens to the neutral `Annotation` kind, preserving line numbers for
//! error messages. Recognized forms are `as <one-line expression>`,
//! `as < ... >` (bracketed, may span lines), generic parameter lists on
//! definitions, and explicit generic argument lists at call sites.

use tern_syntax::{Token, TokenKind};

pub fn elide_annotations(tokens: &mut [Token]) {
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::As => {
                i = elide_as(tokens, i);
            }
            TokenKind::Def | TokenKind::Sub | TokenKind::Class | TokenKind::Interface => {
                // A generic parameter list directly after the defined name.
                if i + 2 < tokens.len()
                    && tokens[i + 1].kind == TokenKind::Ident
                    && tokens[i + 2].kind == TokenKind::Lt
                {
                    if let Some(end) = balanced_angle_end(tokens, i + 2) {
                        retag(tokens, i + 2, end);
                        i = end;
                        continue;
                    }
                }
                i += 1;
            }
            TokenKind::Ident => {
                // Call-site generic arguments: `name < ... > (`.
                if i + 1 < tokens.len() && tokens[i + 1].kind == TokenKind::Lt {
                    if let Some(end) = balanced_angle_end(tokens, i + 1) {
                        if end < tokens.len() && tokens[end].kind == TokenKind::LParen {
                            retag(tokens, i + 1, end);
                            i = end;
                            continue;
                        }
                    }
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
}

fn retag(tokens: &mut [Token], start: usize, end: usize) {
    for token in &mut tokens[start..end] {
        token.kind = TokenKind::Annotation;
    }
}

/// Re-tag an `as` annotation starting at index `at`; returns the index
/// after the annotation.
fn elide_as(tokens: &mut [Token], at: usize) -> usize {
    let mut i = at + 1;
    if i < tokens.len() && tokens[i].kind == TokenKind::Lt {
        // Bracketed form: everything up to the matching `>`, newlines
        // included.
        if let Some(end) = balanced_angle_end(tokens, i) {
            retag(tokens, at, end);
            return end;
        }
    }
    // One-line expression form.
    let mut angle_depth = 0u32;
    let mut paren_depth = 0u32;
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::Newline | TokenKind::Eof => break,
            TokenKind::Lt => angle_depth += 1,
            TokenKind::Gt => {
                if angle_depth == 0 {
                    break;
                }
                angle_depth -= 1;
            }
            TokenKind::LParen => paren_depth += 1,
            TokenKind::RParen => {
                if paren_depth == 0 {
                    break;
                }
                paren_depth -= 1;
            }
            TokenKind::Comma => {
                if angle_depth == 0 && paren_depth == 0 {
                    break;
                }
            }
            TokenKind::Ident
            | TokenKind::Dot
            | TokenKind::ScopeOp
            | TokenKind::Dynamic
            | TokenKind::Nil
            | TokenKind::LBracket
            | TokenKind::RBracket => {}
            _ => break,
        }
        i += 1;
    }
    retag(tokens, at, i);
    i
}

/// Index just past a balanced `< ... >` starting at `open`, provided the
/// bracketed range only holds tokens legal inside an annotation. Newlines
/// are allowed; anything else unexpected fails the scan.
fn balanced_angle_end(tokens: &[Token], open: usize) -> Option<usize> {
    debug_assert_eq!(tokens[open].kind, TokenKind::Lt);
    let mut depth = 0u32;
    let mut i = open;
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::Lt => depth += 1,
            TokenKind::Gt => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            TokenKind::Ident
            | TokenKind::Comma
            | TokenKind::Dot
            | TokenKind::ScopeOp
            | TokenKind::Newline
            | TokenKind::Dynamic
            | TokenKind::Nil
            | TokenKind::LParen
            | TokenKind::RParen
            | TokenKind::LBracket
            | TokenKind::RBracket
            | TokenKind::Annotation => {}
            _ => return None,
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use tern_syntax::SymbolTable;

    fn lex_and_elide(src: &str) -> Vec<Token> {
        let mut symbols = SymbolTable::new();
        let mut lexer = Lexer::new();
        let mut out = Vec::new();
        lexer.tokenize_block(&mut symbols, src.as_bytes(), true, &mut out);
        elide_annotations(&mut out);
        out
    }

    fn count(tokens: &[Token], kind: TokenKind) -> usize {
        tokens.iter().filter(|t| t.kind == kind).count()
    }

    #[test]
    fn var_annotation_is_elided_up_to_the_initializer() {
        let tokens = lex_and_elide("var x as Int = 5\n");
        // `as Int` gone; `= 5` intact.
        assert_eq!(count(&tokens, TokenKind::Annotation), 2);
        assert_eq!(count(&tokens, TokenKind::Assign), 1);
        assert_eq!(count(&tokens, TokenKind::IntLit), 1);
    }

    #[test]
    fn parameter_annotations_stop_at_commas_and_paren() {
        let tokens = lex_and_elide("def f(a as Int, b as Str)\nend\n");
        assert_eq!(count(&tokens, TokenKind::Comma), 1);
        assert_eq!(count(&tokens, TokenKind::RParen), 1);
        assert_eq!(count(&tokens, TokenKind::Annotation), 4);
    }

    #[test]
    fn generic_parameter_list_on_definition_is_elided() {
        let tokens = lex_and_elide("def f<T>(x)\nend\n");
        assert_eq!(count(&tokens, TokenKind::Annotation), 3);
        assert_eq!(count(&tokens, TokenKind::Lt), 0);
        // The parameter list survives.
        assert_eq!(count(&tokens, TokenKind::LParen), 1);
    }

    #[test]
    fn comparison_is_not_an_annotation() {
        let tokens = lex_and_elide("if x < y\nend\n");
        assert_eq!(count(&tokens, TokenKind::Annotation), 0);
        assert_eq!(count(&tokens, TokenKind::Lt), 1);
    }

    #[test]
    fn bracketed_as_annotation_may_span_lines() {
        let tokens = lex_and_elide("def f() as <Map<Int,\n  Str>>\nend\n");
        assert_eq!(count(&tokens, TokenKind::As), 0);
        assert_eq!(count(&tokens, TokenKind::Lt), 0);
    }
}
