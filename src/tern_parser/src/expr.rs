//! Expression parsing and emission.
//!
//! A parsed expression is a small discriminator describing where its
//! value lives. `Partial` means the last-emitted opcode already computes
//! the value but still lacks its destination operand; the consumer
//! patches the destination when it knows it, fusing evaluation into
//! assignments, constructor element lists and call arguments.

use tern_bytecode::{Opcode, TypeId};
use tern_syntax::{DiagnosticCode, MeaningPayload, SymbolId, SymbolInfo, SymbolKind, TokenKind};

use crate::parse::Parser;

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedExpr {
    Local(u32),
    LocalExposed(u32),
    Global {
        gidx: u32,
        /// Declared argument range when the global is a function
        /// definition, for compile-time call checking.
        arity: Option<(u32, u32)>,
    },
    /// A bare member of the enclosing class, read through self.
    SelfMember(u32),
    Member {
        obj: u32,
        member: u32,
    },
    MemberFn {
        obj: u32,
        member: u32,
    },
    Partial {
        dst_patch: usize,
    },
    Int(i64),
    Nil,
    Error,
}

/// A parsed assignment target.
#[derive(Debug, Clone, PartialEq)]
pub enum Lvalue {
    Local(u32),
    LocalExposed(u32),
    Global(u32),
    SelfMember(u32),
    Member { obj: u32, member: u32 },
    Index { base: u32, index: u32 },
    Error,
}

const INT_IMM_MIN: i64 = i32::MIN as i64;
const INT_IMM_MAX: i64 = i32::MAX as i64;

impl<'a> Parser<'a> {
    // ----- value plumbing -----

    pub fn expr_into_slot(&mut self, e: ParsedExpr, dst: u32) {
        match e {
            ParsedExpr::Local(s) => {
                if s != dst {
                    self.fx.em.emit(Opcode::AssignLocal, &[dst, s]);
                }
            }
            ParsedExpr::LocalExposed(cell) => {
                self.fx.em.emit(Opcode::AssignExposed, &[dst, cell]);
            }
            ParsedExpr::Global { gidx, .. } => {
                self.fx.em.emit(Opcode::AssignGlobal, &[dst, gidx]);
            }
            ParsedExpr::SelfMember(member) => {
                let self_slot = self.self_slot_or_zero();
                self.fx
                    .em
                    .emit(Opcode::AssignMember, &[dst, self_slot, member]);
            }
            ParsedExpr::Member { obj, member } => {
                self.fx.em.emit(Opcode::AssignMember, &[dst, obj, member]);
            }
            ParsedExpr::MemberFn { obj, member } => {
                self.fx.em.emit(Opcode::AssignMemberFn, &[dst, obj, member]);
            }
            ParsedExpr::Partial { dst_patch } => {
                self.fx.em.patch(dst_patch, dst);
            }
            ParsedExpr::Int(v) => {
                if (INT_IMM_MIN..=INT_IMM_MAX).contains(&v) {
                    self.fx.em.emit(Opcode::AssignInt, &[dst, v as i32 as u32]);
                } else {
                    let gidx = self.comp.literal_int(v, self.module_tag);
                    self.fx.em.emit(Opcode::AssignGlobal, &[dst, gidx]);
                }
            }
            ParsedExpr::Nil => {
                self.fx.em.emit(Opcode::AssignNil, &[dst]);
            }
            ParsedExpr::Error => {
                self.fx.em.emit(Opcode::AssignNil, &[dst]);
            }
        }
    }

    /// The slot holding the expression's value, materializing into a
    /// fresh temporary unless it already sits in a local.
    pub fn expr_to_slot(&mut self, e: ParsedExpr) -> u32 {
        if let ParsedExpr::Local(s) = e {
            return s;
        }
        let t = self.fx.push_temp();
        self.expr_into_slot(e, t);
        t
    }

    pub fn parse_expr_to_slot(&mut self) -> u32 {
        let e = self.parse_expression();
        self.expr_to_slot(e)
    }

    /// Parse a boolean condition into a slot.
    pub fn parse_condition(&mut self) -> u32 {
        self.parse_expr_to_slot()
    }

    fn self_slot_or_zero(&mut self) -> u32 {
        match self.fx.self_slot {
            Some(s) => s,
            None => {
                let line = self.line();
                self.comp.error(
                    line,
                    DiagnosticCode::UndefinedName,
                    "self used outside a method",
                );
                0
            }
        }
    }

    // ----- precedence levels, loosest first -----

    pub fn parse_expression(&mut self) -> ParsedExpr {
        self.parse_or()
    }

    fn parse_or(&mut self) -> ParsedExpr {
        let first = self.parse_and();
        if self.kind() != TokenKind::Or {
            return first;
        }
        let t = self.fx.push_temp();
        self.expr_into_slot(first, t);
        let mut patches = Vec::new();
        while self.accept(TokenKind::Or) {
            let j = self.fx.em.emit(Opcode::IfTrue, &[t, 0]);
            patches.push(j + 2);
            let rhs = self.parse_and();
            self.expr_into_slot(rhs, t);
        }
        let here = self.fx.em.offset();
        for p in patches {
            self.fx.em.patch(p, here);
        }
        ParsedExpr::Local(t)
    }

    fn parse_and(&mut self) -> ParsedExpr {
        let first = self.parse_not();
        if self.kind() != TokenKind::And {
            return first;
        }
        let t = self.fx.push_temp();
        self.expr_into_slot(first, t);
        let mut patches = Vec::new();
        while self.accept(TokenKind::And) {
            let j = self.fx.em.emit(Opcode::IfFalse, &[t, 0]);
            patches.push(j + 2);
            let rhs = self.parse_not();
            self.expr_into_slot(rhs, t);
        }
        let here = self.fx.em.offset();
        for p in patches {
            self.fx.em.patch(p, here);
        }
        ParsedExpr::Local(t)
    }

    fn parse_not(&mut self) -> ParsedExpr {
        // Prefix `not`; `not in` and `not is` are handled by the
        // comparison level.
        if self.kind() == TokenKind::Not
            && !matches!(self.peek_kind(1), TokenKind::In | TokenKind::Is)
        {
            self.advance();
            let operand = self.parse_not();
            let s = self.expr_to_slot(operand);
            let dst = self.fx.push_temp();
            let j = self.fx.em.emit(Opcode::IfTrue, &[s, 0]);
            self.fx.em.emit(Opcode::AssignTrue, &[dst]);
            let j2 = self.fx.em.emit(Opcode::Jmp, &[0]);
            let false_at = self.fx.em.offset();
            self.fx.em.patch(j + 2, false_at);
            self.fx.em.emit(Opcode::AssignFalse, &[dst]);
            let here = self.fx.em.offset();
            self.fx.em.patch(j2 + 1, here);
            return ParsedExpr::Local(dst);
        }
        self.parse_comparison()
    }

    fn comparison_op(&mut self) -> Option<Opcode> {
        let op = match self.kind() {
            TokenKind::Eq => Opcode::CmpEq,
            TokenKind::Neq => Opcode::CmpNeq,
            TokenKind::Lt => Opcode::CmpLt,
            TokenKind::Lte => Opcode::CmpLte,
            TokenKind::Gt => Opcode::CmpGt,
            TokenKind::Gte => Opcode::CmpGte,
            TokenKind::In => Opcode::CmpIn,
            TokenKind::Is => Opcode::CmpIs,
            TokenKind::Not if self.peek_kind(1) == TokenKind::In => {
                self.advance();
                self.advance();
                return Some(Opcode::CmpNotIn);
            }
            TokenKind::Not if self.peek_kind(1) == TokenKind::Is => {
                self.advance();
                self.advance();
                return Some(Opcode::CmpIsNot);
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_comparison(&mut self) -> ParsedExpr {
        let left = self.parse_range();
        let Some(op) = self.comparison_op() else {
            return left;
        };
        let mut left = left;
        let mut right = self.parse_range();
        // Comparing against the nil literal bypasses any overloaded _eq
        // method: nil becomes the left operand.
        if matches!(op, Opcode::CmpEq | Opcode::CmpNeq)
            && right == ParsedExpr::Nil
            && left != ParsedExpr::Nil
        {
            std::mem::swap(&mut left, &mut right);
        }
        let a = self.expr_to_slot(left);
        let b = self.expr_to_slot(right);
        let at = self.fx.em.emit(op, &[0, a, b]);
        if self.comparison_op().is_some() {
            self.parse_error("comparison operators do not chain");
        }
        ParsedExpr::Partial { dst_patch: at + 1 }
    }

    fn parse_range(&mut self) -> ParsedExpr {
        let left = self.parse_pair();
        if !self.accept(TokenKind::To) {
            return left;
        }
        let a = self.expr_to_slot(left);
        let right = self.parse_pair();
        let b = self.expr_to_slot(right);
        let at = self.fx.em.emit(Opcode::CreateRange, &[0, a, b]);
        ParsedExpr::Partial { dst_patch: at + 1 }
    }

    fn parse_pair(&mut self) -> ParsedExpr {
        let left = self.parse_add();
        if self.kind() != TokenKind::Colon {
            return left;
        }
        self.advance();
        let a = self.expr_to_slot(left);
        let right = self.parse_add();
        let b = self.expr_to_slot(right);
        let at = self.fx.em.emit(Opcode::CreatePair, &[0, a, b]);
        ParsedExpr::Partial { dst_patch: at + 1 }
    }

    fn parse_add(&mut self) -> ParsedExpr {
        let mut left = self.parse_mul();
        loop {
            let op = match self.kind() {
                TokenKind::Plus => Opcode::Add,
                TokenKind::Minus => Opcode::Sub,
                _ => return left,
            };
            self.advance();
            let a = self.expr_to_slot(left);
            let right = self.parse_mul();
            let b = self.expr_to_slot(right);
            let at = self.fx.em.emit(op, &[0, a, b]);
            left = ParsedExpr::Partial { dst_patch: at + 1 };
        }
    }

    fn parse_mul(&mut self) -> ParsedExpr {
        let mut left = self.parse_pow();
        loop {
            let op = match self.kind() {
                TokenKind::Star => Opcode::Mul,
                TokenKind::Slash => Opcode::Div,
                TokenKind::Div => Opcode::IntDiv,
                TokenKind::Mod => Opcode::Mod,
                _ => return left,
            };
            self.advance();
            let a = self.expr_to_slot(left);
            let right = self.parse_pow();
            let b = self.expr_to_slot(right);
            let at = self.fx.em.emit(op, &[0, a, b]);
            left = ParsedExpr::Partial { dst_patch: at + 1 };
        }
    }

    fn parse_pow(&mut self) -> ParsedExpr {
        let left = self.parse_unary();
        if self.kind() != TokenKind::Pow {
            return left;
        }
        self.advance();
        let a = self.expr_to_slot(left);
        // Right associative.
        let right = self.parse_pow();
        let b = self.expr_to_slot(right);
        let at = self.fx.em.emit(Opcode::Pow, &[0, a, b]);
        ParsedExpr::Partial { dst_patch: at + 1 }
    }

    fn parse_unary(&mut self) -> ParsedExpr {
        if self.accept(TokenKind::Minus) {
            let operand = self.parse_unary();
            if let ParsedExpr::Int(v) = operand {
                return ParsedExpr::Int(-v);
            }
            let s = self.expr_to_slot(operand);
            let at = self.fx.em.emit(Opcode::Neg, &[0, s]);
            return ParsedExpr::Partial { dst_patch: at + 1 };
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ParsedExpr {
        let mut e = self.parse_primary();
        loop {
            match self.kind() {
                TokenKind::LParen => {
                    e = self.parse_call(e);
                }
                TokenKind::LBracket => {
                    self.advance();
                    let base = self.expr_to_slot(e);
                    let index = self.parse_expr_to_slot();
                    self.expect(TokenKind::RBracket);
                    let at = self.fx.em.emit(Opcode::GetItem, &[0, base, index]);
                    e = ParsedExpr::Partial { dst_patch: at + 1 };
                }
                TokenKind::Dot => {
                    self.advance();
                    self.skip_annotations();
                    let Some(sym) = self.token_sym() else {
                        self.parse_error("expected a member name");
                        return ParsedExpr::Error;
                    };
                    let name = self.comp.symbols.name(sym).to_string();
                    let member = self.comp.members.intern(&name).0;
                    self.advance();
                    let obj = self.expr_to_slot(e);
                    if self.kind() == TokenKind::LParen {
                        e = self.parse_method_call(obj, member);
                    } else {
                        e = ParsedExpr::Member { obj, member };
                    }
                }
                _ => return e,
            }
        }
    }

    fn parse_call_args(&mut self) -> Vec<u32> {
        // Caller has seen `(` but not consumed it.
        self.advance();
        let mut args = Vec::new();
        self.skip_annotations();
        if self.accept(TokenKind::RParen) {
            return args;
        }
        loop {
            let slot = self.parse_expr_to_slot();
            args.push(slot);
            self.skip_annotations();
            if self.accept(TokenKind::Comma) {
                continue;
            }
            self.expect(TokenKind::RParen);
            return args;
        }
    }

    fn parse_call(&mut self, callee: ParsedExpr) -> ParsedExpr {
        let line = self.line();
        match callee {
            ParsedExpr::Global { gidx, arity } => {
                let args = self.parse_call_args();
                if let Some((min, max)) = arity {
                    let max_pos = max & !tern_bytecode::VARARG_FLAG;
                    let vararg = max & tern_bytecode::VARARG_FLAG != 0;
                    let n = args.len() as u32;
                    if n < min || (!vararg && n > max_pos) {
                        self.comp.error(
                            line,
                            DiagnosticCode::WrongArgumentCount,
                            format!("wrong number of arguments ({} to {} expected)", min, max_pos),
                        );
                    }
                }
                let mut operands = vec![0, gidx, args.len() as u32];
                operands.extend_from_slice(&args);
                let at = self.fx.em.emit(Opcode::CallGlobal, &operands);
                ParsedExpr::Partial { dst_patch: at + 1 }
            }
            ParsedExpr::SelfMember(member) => {
                let self_slot = self.self_slot_or_zero();
                self.parse_method_call(self_slot, member)
            }
            other => {
                let f = self.expr_to_slot(other);
                let args = self.parse_call_args();
                let mut operands = vec![0, f, args.len() as u32];
                operands.extend_from_slice(&args);
                let at = self.fx.em.emit(Opcode::CallLocal, &operands);
                ParsedExpr::Partial { dst_patch: at + 1 }
            }
        }
    }

    fn parse_method_call(&mut self, obj: u32, member: u32) -> ParsedExpr {
        let args = self.parse_call_args();
        let mut operands = vec![0, obj, member, args.len() as u32];
        operands.extend_from_slice(&args);
        let at = self.fx.em.emit(Opcode::CallMethod, &operands);
        ParsedExpr::Partial { dst_patch: at + 1 }
    }

    fn parse_primary(&mut self) -> ParsedExpr {
        self.skip_annotations();
        match self.kind() {
            TokenKind::IntLit => {
                let v = match self.tokens[self.pos].payload {
                    tern_syntax::TokenPayload::Int(v) => v,
                    _ => 0,
                };
                self.advance();
                ParsedExpr::Int(v)
            }
            TokenKind::FloatLit => {
                let v = match self.tokens[self.pos].payload {
                    tern_syntax::TokenPayload::Float(v) => v,
                    _ => 0.0,
                };
                self.advance();
                let gidx = self.comp.literal_float(v, self.module_tag);
                ParsedExpr::Global { gidx, arity: None }
            }
            TokenKind::StrLit => {
                let v = match &self.tokens[self.pos].payload {
                    tern_syntax::TokenPayload::Str(s) => s.clone(),
                    _ => String::new(),
                };
                self.advance();
                let gidx = self.comp.literal_str(&v, self.module_tag);
                ParsedExpr::Global { gidx, arity: None }
            }
            TokenKind::Nil => {
                self.advance();
                ParsedExpr::Nil
            }
            TokenKind::SelfKw => {
                self.advance();
                let slot = self.self_slot_or_zero();
                ParsedExpr::Local(slot)
            }
            TokenKind::Super => self.parse_super(),
            TokenKind::LParen => {
                self.advance();
                let e = self.parse_expression();
                self.expect(TokenKind::RParen);
                e
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elems = Vec::new();
                self.skip_annotations();
                if !self.accept(TokenKind::RBracket) {
                    loop {
                        let slot = self.parse_expr_to_slot();
                        elems.push(slot);
                        self.skip_annotations();
                        if self.accept(TokenKind::Comma) {
                            continue;
                        }
                        self.expect(TokenKind::RBracket);
                        break;
                    }
                }
                let mut operands = vec![0, elems.len() as u32];
                operands.extend_from_slice(&elems);
                let at = self.fx.em.emit(Opcode::CreateArray, &operands);
                ParsedExpr::Partial { dst_patch: at + 1 }
            }
            TokenKind::Def | TokenKind::Sub => self.parse_anonymous_function(),
            TokenKind::Ident | TokenKind::IdentExposed => self.resolve_name_expr(),
            kind if kind.is_error() => {
                let msg = kind.display().to_string();
                self.parse_error(&msg);
                self.advance();
                ParsedExpr::Error
            }
            kind => {
                self.parse_error(&format!("unexpected {}", kind.display()));
                self.advance();
                ParsedExpr::Error
            }
        }
    }

    fn parse_super(&mut self) -> ParsedExpr {
        self.advance();
        self.expect(TokenKind::Dot);
        let Some(sym) = self.token_sym() else {
            self.parse_error("expected a member name after super");
            return ParsedExpr::Error;
        };
        let name = self.comp.symbols.name(sym).to_string();
        let member = self.comp.members.intern(&name).0;
        self.advance();
        let Some(class) = self.class.clone() else {
            let line = self.line();
            self.comp.error(
                line,
                DiagnosticCode::UndefinedName,
                "super used outside a class",
            );
            return ParsedExpr::Error;
        };
        let self_slot = self.self_slot_or_zero();
        if self.kind() == TokenKind::LParen {
            let args = self.parse_call_args();
            let mut operands = vec![0, class.tid.0, member, args.len() as u32 + 1, self_slot];
            operands.extend_from_slice(&args);
            let at = self.fx.em.emit(Opcode::CallSuper, &operands);
            ParsedExpr::Partial { dst_patch: at + 1 }
        } else {
            let at = self
                .fx
                .em
                .emit(Opcode::AssignSuper, &[0, class.tid.0, member]);
            ParsedExpr::Partial { dst_patch: at + 1 }
        }
    }

    // ----- name resolution -----

    /// Resolve the identifier at the current position into an expression,
    /// consuming a dotted module path when one applies.
    fn resolve_name_expr(&mut self) -> ParsedExpr {
        let sym = self.token_sym().unwrap();
        let line = self.line();

        // Innermost local meaning wins.
        let mut local_hit: Option<(SymbolKind, u32)> = None;
        let mut err_hit = false;
        for info in self.comp.symbols.get(sym).meanings.iter().rev() {
            if info.kind.is_local() {
                local_hit = Some((info.kind, info.num));
                break;
            }
            if matches!(info.kind, SymbolKind::ErrUndefined | SymbolKind::ErrParse) {
                err_hit = true;
                break;
            }
        }
        if let Some((kind, slot)) = local_hit {
            self.advance();
            return if kind.is_exposed_local() {
                ParsedExpr::LocalExposed(slot)
            } else {
                ParsedExpr::Local(slot)
            };
        }
        if err_hit {
            self.advance();
            return ParsedExpr::Error;
        }

        // A module-qualified reference.
        if self.comp.is_module_root(sym) && self.peek_kind(1) == TokenKind::ScopeOp {
            return match self.resolve_qualified_global() {
                Some((kind, gidx)) => self.global_expr(kind, gidx),
                None => ParsedExpr::Error,
            };
        }

        // Visible global meanings.
        let visible = self.comp.visible_globals(sym);
        match visible.len() {
            1 => {
                self.advance();
                let (kind, gidx, arity) = visible[0];
                let _ = kind;
                ParsedExpr::Global { gidx, arity }
            }
            0 => {
                // A bare member of the enclosing class.
                if let Some(class) = self.class.clone() {
                    if self.fx.self_slot.is_some() {
                        let name = self.comp.symbols.name(sym).to_string();
                        if let Some(member) = self.comp.members.get(&name) {
                            if self.comp.class_has_member(class.tid, member) {
                                self.advance();
                                return ParsedExpr::SelfMember(member.0);
                            }
                        }
                    }
                }
                let name = self.comp.symbols.name(sym).to_string();
                self.comp.error(
                    line,
                    DiagnosticCode::UndefinedName,
                    format!("\"{}\" undefined", name),
                );
                self.comp.symbols.push_meaning(
                    sym,
                    SymbolInfo {
                        kind: SymbolKind::ErrUndefined,
                        num: 0,
                        scope: None,
                        payload: MeaningPayload::None,
                    },
                );
                self.advance();
                ParsedExpr::Error
            }
            _ => {
                let name = self.comp.symbols.name(sym).to_string();
                self.comp.error(
                    line,
                    DiagnosticCode::AmbiguousName,
                    format!("\"{}\" ambiguous", name),
                );
                self.advance();
                ParsedExpr::Error
            }
        }
    }

    fn global_expr(&mut self, kind: SymbolKind, gidx: u32) -> ParsedExpr {
        let _ = kind;
        ParsedExpr::Global { gidx, arity: None }
    }

    /// Resolve a possibly module-qualified global name, consuming its
    /// tokens. Returns the meaning kind and global index.
    pub fn resolve_qualified_global(&mut self) -> Option<(SymbolKind, u32)> {
        self.skip_annotations();
        let sym = self.token_sym()?;
        if self.comp.is_module_root(sym) && self.peek_kind(1) == TokenKind::ScopeOp {
            // Greedily consume the longest known module path.
            let mut path = self.comp.symbols.name(sym).to_string();
            self.advance();
            let mut module = self.comp.module_by_path(&path);
            while self.kind() == TokenKind::ScopeOp {
                let Some(next_sym) = (match self.tokens.get(self.pos + 1).map(|t| &t.payload) {
                    Some(tern_syntax::TokenPayload::Symbol(s)) => Some(*s),
                    _ => None,
                }) else {
                    break;
                };
                let longer = format!("{}::{}", path, self.comp.symbols.name(next_sym));
                if self.comp.module_by_path(&longer).is_some() {
                    path = longer;
                    module = self.comp.module_by_path(&path);
                    self.advance();
                    self.advance();
                } else {
                    break;
                }
            }
            let module = module?;
            if !self.accept(TokenKind::ScopeOp) {
                self.parse_error("expected :: after module name");
                return None;
            }
            let name_sym = self.token_sym()?;
            self.advance();
            return self.comp.global_in_module(name_sym, module).or_else(|| {
                let name = self.comp.symbols.name(name_sym).to_string();
                let line = self.line();
                self.comp.error(
                    line,
                    DiagnosticCode::UndefinedName,
                    format!("\"{}\" undefined in module {}", name, path),
                );
                None
            });
        }
        let visible = self.comp.visible_globals(sym);
        if visible.len() == 1 {
            self.advance();
            return Some((visible[0].0, visible[0].1));
        }
        None
    }

    // ----- assignment statements -----

    /// Whether the rest of the line contains a top-level assignment
    /// operator.
    fn line_has_assignment(&self) -> Option<TokenKind> {
        let mut depth = 0u32;
        let mut i = self.pos;
        while let Some(token) = self.tokens.get(i) {
            match token.kind {
                TokenKind::LParen | TokenKind::LBracket => depth += 1,
                TokenKind::RParen | TokenKind::RBracket => depth = depth.saturating_sub(1),
                TokenKind::Assign
                | TokenKind::AssignAdd
                | TokenKind::AssignSub
                | TokenKind::AssignMul
                | TokenKind::AssignDiv
                | TokenKind::AssignPow
                    if depth == 0 =>
                {
                    return Some(token.kind)
                }
                TokenKind::Newline | TokenKind::Eof => return None,
                // An anonymous function body may contain assignments of
                // its own; they do not make this line an assignment.
                TokenKind::Def | TokenKind::Sub => return None,
                _ => {}
            }
            i += 1;
        }
        None
    }

    pub fn parse_assignment_or_call(&mut self) {
        match self.line_has_assignment() {
            Some(TokenKind::Assign) => self.parse_assignment(),
            Some(op) => self.parse_operator_assignment(op),
            None => {
                let e = self.parse_expression();
                // A statement-level Partial still needs a destination.
                if let ParsedExpr::Partial { .. } = e {
                    let t = self.fx.push_temp();
                    self.expr_into_slot(e, t);
                }
                self.expect_newline();
            }
        }
    }

    fn parse_assignment(&mut self) {
        let mut targets = vec![self.parse_lvalue()];
        while self.accept(TokenKind::Comma) {
            targets.push(self.parse_lvalue());
        }
        self.expect(TokenKind::Assign);
        if targets.len() == 1 {
            match &targets[0] {
                Lvalue::Local(slot) => {
                    // Fuse the destination straight into the rvalue.
                    let slot = *slot;
                    let e = self.parse_expression();
                    self.expr_into_slot(e, slot);
                }
                lv => {
                    let lv = lv.clone();
                    let src = self.parse_expr_to_slot();
                    self.emit_store(&lv, src);
                }
            }
            self.expect_newline();
            return;
        }

        // Multiple assignment.
        let all_locals: Option<Vec<u32>> = targets
            .iter()
            .map(|t| match t {
                Lvalue::Local(s) => Some(*s),
                _ => None,
            })
            .collect();
        if let Some(slots) = all_locals {
            self.parse_values_into(&slots);
        } else {
            let arity = targets.len();
            if self.kind() == TokenKind::LBracket {
                // Peephole: matching bracket literal assigns through
                // temporaries, element by element.
                self.advance();
                let mut temps = Vec::with_capacity(arity);
                for i in 0..arity {
                    let t = self.fx.push_temp();
                    let e = self.parse_expression();
                    self.expr_into_slot(e, t);
                    temps.push(t);
                    if i + 1 < arity {
                        self.expect(TokenKind::Comma);
                    }
                }
                self.expect(TokenKind::RBracket);
                for (t, lv) in temps.iter().zip(targets.iter()) {
                    self.emit_store(lv, *t);
                }
            } else {
                let first = self.parse_expression();
                if self.kind() == TokenKind::Comma {
                    let mut temps = Vec::with_capacity(arity);
                    let t0 = self.fx.push_temp();
                    self.expr_into_slot(first, t0);
                    temps.push(t0);
                    while self.accept(TokenKind::Comma) {
                        let t = self.fx.push_temp();
                        let e = self.parse_expression();
                        self.expr_into_slot(e, t);
                        temps.push(t);
                    }
                    if temps.len() != arity {
                        self.parse_error("wrong number of values in multiple assignment");
                    } else {
                        for (t, lv) in temps.iter().zip(targets.iter()) {
                            self.emit_store(lv, *t);
                        }
                    }
                } else {
                    let src = self.expr_to_slot(first);
                    let mut temps = Vec::with_capacity(arity);
                    for _ in 0..arity {
                        temps.push(self.fx.push_temp());
                    }
                    let mut operands = vec![src, arity as u32];
                    operands.extend_from_slice(&temps);
                    self.fx.em.emit(Opcode::Expand, &operands);
                    for (t, lv) in temps.iter().zip(targets.iter()) {
                        self.emit_store(lv, *t);
                    }
                }
            }
        }
        self.expect_newline();
    }

    fn parse_operator_assignment(&mut self, op_token: TokenKind) {
        let lv = self.parse_lvalue();
        self.expect(op_token);
        let current = self.fx.push_temp();
        self.emit_read(&lv, current);
        let rhs = self.parse_expr_to_slot();
        let op = match op_token {
            TokenKind::AssignAdd => Opcode::Add,
            TokenKind::AssignSub => Opcode::Sub,
            TokenKind::AssignMul => Opcode::Mul,
            TokenKind::AssignDiv => Opcode::Div,
            TokenKind::AssignPow => Opcode::Pow,
            _ => unreachable!("not an operator assignment"),
        };
        let result = self.fx.push_temp();
        self.fx.em.emit(op, &[result, current, rhs]);
        self.emit_store(&lv, result);
        self.expect_newline();
    }

    /// Parse an assignment target. The target's base expressions are
    /// evaluated here; the final projection is kept unevaluated so the
    /// store form can be emitted later.
    pub fn parse_lvalue(&mut self) -> Lvalue {
        self.skip_annotations();
        let line = self.line();
        let mut e: ParsedExpr = match self.kind() {
            TokenKind::SelfKw | TokenKind::Super => self.parse_primary(),
            TokenKind::Ident | TokenKind::IdentExposed => {
                let sym = self.token_sym().unwrap();
                let resolved = self.resolve_name_expr();
                match resolved {
                    ParsedExpr::Local(slot) => {
                        // A const local cannot be stored to.
                        if self.is_const_local(sym) {
                            self.comp.error(
                                line,
                                DiagnosticCode::InvalidLvalue,
                                "cannot assign to a constant",
                            );
                            return Lvalue::Error;
                        }
                        if !matches!(self.kind(), TokenKind::Dot | TokenKind::LBracket) {
                            return Lvalue::Local(slot);
                        }
                        ParsedExpr::Local(slot)
                    }
                    ParsedExpr::LocalExposed(cell) => {
                        if !matches!(self.kind(), TokenKind::Dot | TokenKind::LBracket) {
                            if self.is_const_local(sym) {
                                self.comp.error(
                                    line,
                                    DiagnosticCode::InvalidLvalue,
                                    "cannot assign to a constant",
                                );
                                return Lvalue::Error;
                            }
                            return Lvalue::LocalExposed(cell);
                        }
                        ParsedExpr::LocalExposed(cell)
                    }
                    ParsedExpr::Global { gidx, .. } => {
                        if !matches!(self.kind(), TokenKind::Dot | TokenKind::LBracket) {
                            if !self.comp.is_assignable_global(sym) {
                                self.comp.error(
                                    line,
                                    DiagnosticCode::InvalidLvalue,
                                    "invalid assignment target",
                                );
                                return Lvalue::Error;
                            }
                            return Lvalue::Global(gidx);
                        }
                        ParsedExpr::Global { gidx, arity: None }
                    }
                    ParsedExpr::SelfMember(member) => {
                        if !matches!(self.kind(), TokenKind::Dot | TokenKind::LBracket) {
                            return Lvalue::SelfMember(member);
                        }
                        ParsedExpr::SelfMember(member)
                    }
                    ParsedExpr::Error => return Lvalue::Error,
                    other => other,
                }
            }
            _ => {
                self.parse_error("invalid assignment target");
                return Lvalue::Error;
            }
        };

        loop {
            match self.kind() {
                TokenKind::Dot => {
                    self.advance();
                    let Some(sym) = self.token_sym() else {
                        self.parse_error("expected a member name");
                        return Lvalue::Error;
                    };
                    let name = self.comp.symbols.name(sym).to_string();
                    let member = self.comp.members.intern(&name).0;
                    self.advance();
                    let obj = self.expr_to_slot(e);
                    if matches!(self.kind(), TokenKind::Dot | TokenKind::LBracket) {
                        e = ParsedExpr::Member { obj, member };
                        continue;
                    }
                    if self.kind() == TokenKind::LParen {
                        e = self.parse_method_call(obj, member);
                        continue;
                    }
                    return Lvalue::Member { obj, member };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let base = self.expr_to_slot(e);
                    let index = self.parse_expr_to_slot();
                    self.expect(TokenKind::RBracket);
                    if matches!(self.kind(), TokenKind::Dot | TokenKind::LBracket) {
                        let at = self.fx.em.emit(Opcode::GetItem, &[0, base, index]);
                        e = ParsedExpr::Partial { dst_patch: at + 1 };
                        continue;
                    }
                    return Lvalue::Index { base, index };
                }
                TokenKind::LParen => {
                    e = self.parse_call(e);
                }
                _ => {
                    self.parse_error("invalid assignment target");
                    return Lvalue::Error;
                }
            }
        }
    }

    fn is_const_local(&self, sym: SymbolId) -> bool {
        for info in self.comp.symbols.get(sym).meanings.iter().rev() {
            if info.kind.is_local() {
                return matches!(
                    info.kind,
                    SymbolKind::LocalConst | SymbolKind::LocalConstExposed
                );
            }
        }
        false
    }

    pub fn emit_read(&mut self, lv: &Lvalue, into: u32) {
        match lv {
            Lvalue::Local(s) => {
                self.fx.em.emit(Opcode::AssignLocal, &[into, *s]);
            }
            Lvalue::LocalExposed(cell) => {
                self.fx.em.emit(Opcode::AssignExposed, &[into, *cell]);
            }
            Lvalue::Global(g) => {
                self.fx.em.emit(Opcode::AssignGlobal, &[into, *g]);
            }
            Lvalue::SelfMember(m) => {
                let s = self.self_slot_or_zero();
                self.fx.em.emit(Opcode::AssignMember, &[into, s, *m]);
            }
            Lvalue::Member { obj, member } => {
                self.fx.em.emit(Opcode::AssignMember, &[into, *obj, *member]);
            }
            Lvalue::Index { base, index } => {
                self.fx.em.emit(Opcode::GetItem, &[into, *base, *index]);
            }
            Lvalue::Error => {}
        }
    }

    pub fn emit_store(&mut self, lv: &Lvalue, src: u32) {
        match lv {
            Lvalue::Local(s) => {
                if *s != src {
                    self.fx.em.emit(Opcode::AssignLocal, &[*s, src]);
                }
            }
            Lvalue::LocalExposed(cell) => {
                self.fx.em.emit(Opcode::StoreExposed, &[*cell, src]);
            }
            Lvalue::Global(g) => {
                self.fx.em.emit(Opcode::StoreGlobal, &[*g, src]);
            }
            Lvalue::SelfMember(m) => {
                let s = self.self_slot_or_zero();
                self.fx.em.emit(Opcode::StoreMember, &[s, *m, src]);
            }
            Lvalue::Member { obj, member } => {
                self.fx.em.emit(Opcode::StoreMember, &[*obj, *member, src]);
            }
            Lvalue::Index { base, index } => {
                self.fx.em.emit(Opcode::SetItem, &[*base, *index, src]);
            }
            Lvalue::Error => {}
        }
    }
}
