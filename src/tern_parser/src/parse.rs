//! Compilation pass 2: statement parsing and bytecode emission.
//!
//! Statements lower to jumps and branch-list patching. The try statement
//! follows the original scheme: three consecutive hidden locals per try
//! (discriminator, payload, scratch), break and return sequences whose
//! operands are patched when the enclosing finally or direct-try end is
//! emitted, and a `LeaveFinally` opcode that routes control out of a
//! finally block by the discriminator.

use log::trace;

use tern_bytecode::{
    ExceptionRange, FileId, FunctionCode, FunctionId, GlobalInit, HandlerKind, Opcode, TypeId,
    FINALLY_BREAK, FINALLY_FALL, FINALLY_RETURN, NO_TARGET,
};
use tern_syntax::{
    DiagnosticCode, MeaningPayload, SymbolId, SymbolInfo, SymbolKind, Token, TokenKind,
    TokenPayload,
};

use crate::compiler::Compiler;
use crate::emitter::{BreakRecord, FnCtx, LoopCtx, ReturnRecord, TryCtx};

#[derive(Debug, Clone)]
pub struct ClassCtx {
    pub tid: TypeId,
    pub name: String,
}

pub struct Parser<'a> {
    pub comp: &'a mut Compiler,
    pub tokens: &'a [Token],
    pub pos: usize,
    pub fx: FnCtx,
    pub class: Option<ClassCtx>,
    pub file: FileId,
    pub module_tag: u32,
    last_error_line: u32,
}

impl<'a> Parser<'a> {
    pub fn new(
        comp: &'a mut Compiler,
        tokens: &'a [Token],
        file: FileId,
        module_tag: u32,
    ) -> Parser<'a> {
        Parser {
            comp,
            tokens,
            pos: 0,
            fx: FnCtx::new("#init".to_string(), file),
            class: None,
            file,
            module_tag,
            last_error_line: 0,
        }
    }

    // ----- token helpers -----

    pub fn kind(&self) -> TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    pub fn peek_kind(&self, ahead: usize) -> TokenKind {
        self.tokens
            .get(self.pos + ahead)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    pub fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .map(|t| t.line)
            .unwrap_or_else(|| self.tokens.last().map(|t| t.line).unwrap_or(1))
    }

    pub fn token_sym(&self) -> Option<SymbolId> {
        match self.tokens.get(self.pos).map(|t| &t.payload) {
            Some(TokenPayload::Symbol(s)) => Some(*s),
            _ => None,
        }
    }

    pub fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    pub fn accept(&mut self, kind: TokenKind) -> bool {
        if self.kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Skip annotation tokens; they are invisible to the parser.
    pub fn skip_annotations(&mut self) {
        while self.kind() == TokenKind::Annotation {
            self.advance();
        }
    }

    pub fn expect(&mut self, kind: TokenKind) {
        self.skip_annotations();
        if !self.accept(kind) {
            self.parse_error(&format!(
                "expected {} but found {}",
                kind.display(),
                self.kind().display()
            ));
        }
    }

    pub fn expect_newline(&mut self) {
        self.skip_annotations();
        if !self.accept(TokenKind::Newline) {
            self.parse_error("expected end of line");
            self.skip_to_newline();
        }
    }

    /// Report a parse error (once per source line) and leave the position
    /// unchanged; callers decide how far to skip.
    pub fn parse_error(&mut self, message: &str) {
        let line = self.line();
        if line != self.last_error_line {
            self.last_error_line = line;
            self.comp
                .error(line, DiagnosticCode::ParseError, message.to_string());
        }
    }

    pub fn skip_to_newline(&mut self) {
        while !matches!(self.kind(), TokenKind::Newline | TokenKind::Eof) {
            self.advance();
        }
        self.accept(TokenKind::Newline);
    }

    // ----- scopes -----

    pub fn enter_block(&mut self) -> (u16, u32) {
        self.fx.block_depth += 1;
        (self.fx.block_depth, self.fx.num_locals())
    }

    pub fn leave_block(&mut self, mark: (u16, u32)) {
        let (depth, watermark) = mark;
        while let Some(&sym) = self.fx.locals_chain.last() {
            let is_current = match self.comp.symbols.meaning(sym) {
                Some(info) => match info.payload {
                    MeaningPayload::Local { block_depth } => block_depth >= depth,
                    _ => false,
                },
                None => false,
            };
            if !is_current {
                break;
            }
            self.fx.locals_chain.pop();
            self.comp.symbols.pop_meaning(sym);
        }
        self.fx.release_locals_to(watermark);
        self.fx.block_depth = depth - 1;
    }

    /// Bind `sym` as a local in the current block.
    pub fn add_local(&mut self, sym: SymbolId, kind: SymbolKind, slot: u32) {
        self.comp.symbols.push_meaning(
            sym,
            SymbolInfo {
                kind,
                num: slot,
                scope: None,
                payload: MeaningPayload::Local {
                    block_depth: self.fx.block_depth,
                },
            },
        );
        self.fx.locals_chain.push(sym);
    }

    // ----- statements -----

    /// Parse statements until one of `stops` (or end of file) is the
    /// current token. The stop token is not consumed.
    pub fn parse_block_until(&mut self, stops: &[TokenKind]) {
        loop {
            self.skip_annotations();
            let kind = self.kind();
            if kind == TokenKind::Eof || stops.contains(&kind) {
                return;
            }
            match kind {
                TokenKind::Newline => {
                    self.advance();
                }
                _ => self.parse_statement(),
            }
        }
    }

    fn parse_statement(&mut self) {
        let mark = self.fx.temp_mark();
        self.fx.em.set_line(self.line());
        match self.kind() {
            TokenKind::Var | TokenKind::Const => self.parse_local_variables(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Repeat => self.parse_repeat(),
            TokenKind::For => self.parse_for(),
            TokenKind::Switch => self.parse_switch(),
            TokenKind::Try => self.parse_try(),
            TokenKind::Return => self.parse_return(),
            TokenKind::Break => self.parse_break(),
            TokenKind::Raise => self.parse_raise(),
            _ if self.kind().is_error() => {
                let msg = self.kind().display().to_string();
                self.parse_error(&msg);
                self.skip_to_newline();
            }
            _ => self.parse_assignment_or_call(),
        }
        self.fx.release_temps_to(mark);
    }

    fn parse_local_variables(&mut self) {
        let is_const = self.kind() == TokenKind::Const;
        self.advance();
        let mut slots: Vec<(u32, bool)> = Vec::new();
        loop {
            self.skip_annotations();
            match self.kind() {
                TokenKind::Ident | TokenKind::IdentExposed => {
                    let exposed = self.kind() == TokenKind::IdentExposed;
                    let sym = self.token_sym().unwrap();
                    self.advance();
                    let slot = self.fx.alloc_local();
                    let kind = match (is_const, exposed) {
                        (false, false) => SymbolKind::Local,
                        (false, true) => SymbolKind::LocalExposed,
                        (true, false) => SymbolKind::LocalConst,
                        (true, true) => SymbolKind::LocalConstExposed,
                    };
                    self.add_local(sym, kind, slot);
                    slots.push((slot, exposed));
                }
                _ => {
                    self.parse_error("expected a variable name");
                    self.skip_to_newline();
                    return;
                }
            }
            self.skip_annotations();
            if !self.accept(TokenKind::Comma) {
                break;
            }
        }
        self.skip_annotations();
        if self.accept(TokenKind::Assign) {
            self.parse_values_into(&slots.iter().map(|s| s.0).collect::<Vec<_>>());
        } else {
            for (slot, _) in &slots {
                self.fx.em.emit(Opcode::AssignNil, &[*slot]);
            }
        }
        for (slot, exposed) in &slots {
            if *exposed {
                self.fx.em.emit(Opcode::CreateExposed, &[*slot]);
            }
        }
        self.expect_newline();
    }

    /// Evaluate a comma-separated right-hand side into `dsts`. When the
    /// arity matches, assignment is element by element (one stack slot
    /// per destination); a single sequence value is destructured with
    /// `Expand`.
    pub fn parse_values_into(&mut self, dsts: &[u32]) {
        if dsts.len() == 1 {
            let e = self.parse_expression();
            self.expr_into_slot(e, dsts[0]);
            return;
        }
        // A bracket literal of matching arity loses its array-creation
        // opcode and assigns element by element.
        if self.kind() == TokenKind::LBracket {
            let arity = self.bracket_list_arity();
            if arity == Some(dsts.len()) {
                self.advance();
                for (i, dst) in dsts.iter().enumerate() {
                    let e = self.parse_expression();
                    self.expr_into_slot(e, *dst);
                    if i + 1 < dsts.len() {
                        self.expect(TokenKind::Comma);
                    }
                }
                self.expect(TokenKind::RBracket);
                return;
            }
        }
        let first = self.parse_expression();
        if self.kind() == TokenKind::Comma {
            // A plain comma list: evaluate every element into a fresh
            // temporary, then move into the destinations, so that swaps
            // read their sources before any store.
            let mut temps = Vec::with_capacity(dsts.len());
            let t0 = self.fx.push_temp();
            self.expr_into_slot(first, t0);
            temps.push(t0);
            while self.accept(TokenKind::Comma) {
                let t = self.fx.push_temp();
                let e = self.parse_expression();
                self.expr_into_slot(e, t);
                temps.push(t);
            }
            if temps.len() != dsts.len() {
                self.parse_error("wrong number of values in multiple assignment");
                return;
            }
            for (t, dst) in temps.iter().zip(dsts) {
                self.fx.em.emit(Opcode::AssignLocal, &[*dst, *t]);
            }
        } else {
            let src = self.expr_to_slot(first);
            let mut operands = vec![src, dsts.len() as u32];
            operands.extend_from_slice(dsts);
            self.fx.em.emit(Opcode::Expand, &operands);
        }
    }

    /// Arity of a bracketed literal starting at the current `[`, if it is
    /// a simple one-line list.
    fn bracket_list_arity(&self) -> Option<usize> {
        let mut depth = 0u32;
        let mut arity = 1usize;
        let mut i = self.pos;
        loop {
            let kind = self.tokens.get(i).map(|t| t.kind)?;
            match kind {
                TokenKind::LBracket | TokenKind::LParen => depth += 1,
                TokenKind::RParen => depth -= 1,
                TokenKind::RBracket => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(arity);
                    }
                }
                TokenKind::Comma if depth == 1 => arity += 1,
                TokenKind::Newline | TokenKind::Eof => return None,
                _ => {}
            }
            i += 1;
        }
    }

    fn parse_if(&mut self) {
        self.advance();
        let mut end_patches: Vec<usize> = Vec::new();
        loop {
            let cond = self.parse_condition();
            let skip = self.fx.em.emit(Opcode::IfFalse, &[cond, 0]);
            let skip_target = skip + 2;
            self.expect_newline();
            let mark = self.enter_block();
            self.parse_block_until(&[TokenKind::Elif, TokenKind::Else, TokenKind::End]);
            self.leave_block(mark);
            match self.kind() {
                TokenKind::Elif => {
                    self.advance();
                    let j = self.fx.em.emit(Opcode::Jmp, &[0]);
                    end_patches.push(j + 1);
                    self.fx.em.patch(skip_target, self.fx.em.offset());
                    continue;
                }
                TokenKind::Else => {
                    self.advance();
                    self.expect_newline();
                    let j = self.fx.em.emit(Opcode::Jmp, &[0]);
                    end_patches.push(j + 1);
                    self.fx.em.patch(skip_target, self.fx.em.offset());
                    let mark = self.enter_block();
                    self.parse_block_until(&[TokenKind::End]);
                    self.leave_block(mark);
                    self.expect(TokenKind::End);
                    self.expect_newline();
                    break;
                }
                _ => {
                    self.fx.em.patch(skip_target, self.fx.em.offset());
                    self.expect(TokenKind::End);
                    self.expect_newline();
                    break;
                }
            }
        }
        let here = self.fx.em.offset();
        for p in end_patches {
            self.fx.em.patch(p, here);
        }
    }

    fn parse_while(&mut self) {
        self.advance();
        let top = self.fx.em.offset();
        let cond = self.parse_condition();
        let out = self.fx.em.emit(Opcode::IfFalse, &[cond, 0]);
        self.expect_newline();
        self.fx.loops.push(LoopCtx::default());
        let mark = self.enter_block();
        self.parse_block_until(&[TokenKind::End]);
        self.leave_block(mark);
        self.expect(TokenKind::End);
        self.expect_newline();
        self.fx.em.emit(Opcode::Jmp, &[top]);
        let here = self.fx.em.offset();
        self.fx.em.patch(out + 2, here);
        self.end_loop(here);
    }

    fn parse_repeat(&mut self) {
        self.advance();
        self.expect_newline();
        let top = self.fx.em.offset();
        self.fx.loops.push(LoopCtx::default());
        let mark = self.enter_block();
        self.parse_block_until(&[TokenKind::Until]);
        self.leave_block(mark);
        self.expect(TokenKind::Until);
        let cond = self.parse_condition();
        self.fx.em.emit(Opcode::IfFalse, &[cond, top]);
        self.expect_newline();
        let here = self.fx.em.offset();
        self.end_loop(here);
    }

    fn parse_for(&mut self) {
        self.advance();
        let mark = self.enter_block();
        let mut vars: Vec<(u32, bool)> = Vec::new();
        loop {
            self.skip_annotations();
            match self.kind() {
                TokenKind::Ident | TokenKind::IdentExposed => {
                    let exposed = self.kind() == TokenKind::IdentExposed;
                    let sym = self.token_sym().unwrap();
                    self.advance();
                    let slot = self.fx.alloc_local();
                    let kind = if exposed {
                        SymbolKind::LocalExposed
                    } else {
                        SymbolKind::Local
                    };
                    self.add_local(sym, kind, slot);
                    vars.push((slot, exposed));
                }
                _ => {
                    self.parse_error("expected a loop variable");
                    self.skip_to_newline();
                    self.leave_block(mark);
                    return;
                }
            }
            if !self.accept(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::In);
        let m_iterator = member_id(self.comp, "iterator");
        let m_has_next = member_id(self.comp, "hasNext");
        let m_next = member_id(self.comp, "next");
        let seq = self.parse_expr_to_slot();
        let iter = self.fx.alloc_local();
        self.fx
            .em
            .emit(Opcode::CallMethod, &[iter, seq, m_iterator, 0]);
        self.expect_newline();

        let top = self.fx.em.offset();
        let tmark = self.fx.temp_mark();
        let cond = self.fx.push_temp();
        self.fx
            .em
            .emit(Opcode::CallMethod, &[cond, iter, m_has_next, 0]);
        let out = self.fx.em.emit(Opcode::IfFalse, &[cond, 0]);
        if vars.len() == 1 {
            self.fx
                .em
                .emit(Opcode::CallMethod, &[vars[0].0, iter, m_next, 0]);
        } else {
            let v = self.fx.push_temp();
            self.fx
                .em
                .emit(Opcode::CallMethod, &[v, iter, m_next, 0]);
            let mut operands = vec![v, vars.len() as u32];
            operands.extend(vars.iter().map(|v| v.0));
            self.fx.em.emit(Opcode::Expand, &operands);
        }
        for (slot, exposed) in &vars {
            if *exposed {
                self.fx.em.emit(Opcode::CreateExposed, &[*slot]);
            }
        }
        self.fx.release_temps_to(tmark);

        self.fx.loops.push(LoopCtx::default());
        self.parse_block_until(&[TokenKind::End]);
        self.expect(TokenKind::End);
        self.expect_newline();
        self.fx.em.emit(Opcode::Jmp, &[top]);
        let here = self.fx.em.offset();
        self.fx.em.patch(out + 2, here);
        self.end_loop(here);
        self.leave_block(mark);
    }

    fn parse_switch(&mut self) {
        self.advance();
        let subject = self.fx.alloc_local();
        let e = self.parse_expression();
        self.expr_into_slot(e, subject);
        self.expect_newline();
        let mut end_patches: Vec<usize> = Vec::new();
        loop {
            self.skip_annotations();
            match self.kind() {
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Case => {
                    self.advance();
                    let mut body_patches: Vec<usize> = Vec::new();
                    loop {
                        let tmark = self.fx.temp_mark();
                        let v = self.parse_expr_to_slot();
                        let c = self.fx.push_temp();
                        self.fx.em.emit(Opcode::CmpEq, &[c, subject, v]);
                        let j = self.fx.em.emit(Opcode::IfTrue, &[c, 0]);
                        body_patches.push(j + 2);
                        self.fx.release_temps_to(tmark);
                        if !self.accept(TokenKind::Comma) {
                            break;
                        }
                    }
                    let next = self.fx.em.emit(Opcode::Jmp, &[0]);
                    let body = self.fx.em.offset();
                    for p in body_patches {
                        self.fx.em.patch(p, body);
                    }
                    self.expect_newline();
                    let mark = self.enter_block();
                    self.parse_block_until(&[TokenKind::Case, TokenKind::Else, TokenKind::End]);
                    self.leave_block(mark);
                    let j = self.fx.em.emit(Opcode::Jmp, &[0]);
                    end_patches.push(j + 1);
                    self.fx.em.patch(next + 1, self.fx.em.offset());
                }
                TokenKind::Else => {
                    self.advance();
                    self.expect_newline();
                    let mark = self.enter_block();
                    self.parse_block_until(&[TokenKind::End]);
                    self.leave_block(mark);
                }
                TokenKind::End | TokenKind::Eof => break,
                _ => {
                    self.parse_error("expected case, else or end");
                    self.skip_to_newline();
                }
            }
        }
        self.expect(TokenKind::End);
        self.expect_newline();
        let here = self.fx.em.offset();
        for p in end_patches {
            self.fx.em.patch(p, here);
        }
    }

    /// Bind the pending exits of the innermost loop to `exit`.
    fn end_loop(&mut self, exit: u32) {
        let ctx = self.fx.loops.pop().expect("loop stack underflow");
        for p in ctx.exit_patches {
            self.fx.em.patch(p, exit);
        }
        let loop_index = self.fx.loops.len();
        for i in 0..self.fx.break_records.len() {
            if self.fx.break_records[i].loop_index == loop_index && !self.fx.break_records[i].is_set
            {
                let patch = self.fx.break_records[i].jmp_patch;
                self.fx.em.patch(patch, exit);
                self.fx.break_records[i].is_set = true;
            }
        }
    }

    fn parse_break(&mut self) {
        let line = self.line();
        self.advance();
        self.expect_newline();
        if self.fx.loops.is_empty() {
            self.comp.error(
                line,
                DiagnosticCode::BreakOutsideLoop,
                "break statement outside loop",
            );
            return;
        }
        if self.fx.trys.is_empty() {
            let j = self.fx.em.emit(Opcode::Jmp, &[0]);
            self.fx
                .loops
                .last_mut()
                .unwrap()
                .exit_patches
                .push(j + 1);
            return;
        }
        // Inside a try statement: the break may have to travel through a
        // finally block. The discriminator slot, pop count and jump
        // target are patched later, when the enclosing finally or direct
        // try end is emitted.
        let slot = self.fx.trys.last().unwrap().slot;
        let a1 = self
            .fx
            .em
            .emit(Opcode::AssignInt, &[slot, FINALLY_BREAK as u32]);
        let a2 = self.fx.em.emit(Opcode::EndTry, &[0]);
        let a3 = self.fx.em.emit(Opcode::Jmp, &[0]);
        self.fx.break_records.push(BreakRecord {
            start: a1 as u32,
            disc_dst_patch: a1 + 1,
            pops_patch: a2 + 1,
            jmp_patch: a3 + 1,
            loop_index: self.fx.loops.len() - 1,
            is_set: false,
        });
    }

    fn parse_return(&mut self) {
        self.advance();
        let src = if matches!(self.kind(), TokenKind::Newline | TokenKind::Eof) {
            let t = self.fx.push_temp();
            self.fx.em.emit(Opcode::AssignNil, &[t]);
            t
        } else {
            self.parse_expr_to_slot()
        };
        self.expect_newline();
        if self.fx.trys.is_empty() {
            self.fx.em.emit(Opcode::RetLocal, &[src]);
            return;
        }
        let slot = self.fx.trys.last().unwrap().slot;
        let a1 = self.fx.em.emit(Opcode::AssignLocal, &[slot + 1, src]);
        let a2 = self
            .fx
            .em
            .emit(Opcode::AssignInt, &[slot, FINALLY_RETURN as u32]);
        let a3 = self.fx.em.emit(Opcode::EndTry, &[0]);
        let a4 = self.fx.em.emit(Opcode::Jmp, &[0]);
        self.fx.return_records.push(ReturnRecord {
            start: a1 as u32,
            value_dst_patch: a1 + 1,
            disc_dst_patch: a2 + 1,
            pops_patch: a3 + 1,
            jmp_patch: a4 + 1,
            src_slot: src,
            is_set: false,
        });
    }

    /// Complete return statements that never bound to a finally block:
    /// their trailing jump becomes a plain return of the stored value.
    pub fn complete_returns(&mut self) {
        for i in 0..self.fx.return_records.len() {
            if self.fx.return_records[i].is_set {
                continue;
            }
            let jmp_patch = self.fx.return_records[i].jmp_patch;
            let src = self.fx.return_records[i].src_slot;
            self.fx.em.patch(jmp_patch - 1, Opcode::RetLocal as u32);
            self.fx.em.patch(jmp_patch, src);
            self.fx.return_records[i].is_set = true;
        }
    }

    fn parse_raise(&mut self) {
        self.advance();
        let src = self.parse_expr_to_slot();
        self.expect_newline();
        self.fx.em.emit(Opcode::RaiseLocal, &[src]);
    }

    /// Whether any except clause ahead names a runtime-raised exception
    /// type (or the statement has a finally block), making this a direct
    /// try block.
    fn scan_try_directness(&self) -> bool {
        let mut depth = 0u32;
        let mut i = self.pos;
        while let Some(token) = self.tokens.get(i) {
            match token.kind {
                TokenKind::Def
                | TokenKind::Sub
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Switch
                | TokenKind::Try
                | TokenKind::Repeat => depth += 1,
                TokenKind::End | TokenKind::Until => {
                    if depth == 0 {
                        return false;
                    }
                    depth -= 1;
                }
                TokenKind::Finally if depth == 0 => return true,
                TokenKind::Except if depth == 0 => {
                    // Look at the caught type name.
                    let mut j = i + 1;
                    if matches!(
                        self.tokens.get(j).map(|t| t.kind),
                        Some(TokenKind::Ident | TokenKind::IdentExposed)
                    ) && self.tokens.get(j + 1).map(|t| t.kind) == Some(TokenKind::Is)
                    {
                        j += 2;
                    }
                    if let Some(Token {
                        payload: TokenPayload::Symbol(sym),
                        ..
                    }) = self.tokens.get(j)
                    {
                        if self.comp.is_direct_exception_name(*sym) {
                            return true;
                        }
                    }
                }
                TokenKind::Eof => return false,
                _ => {}
            }
            i += 1;
        }
        false
    }

    fn parse_try(&mut self) {
        self.advance();
        self.expect_newline();

        let direct = self.scan_try_directness();
        let slot = self.fx.alloc_local();
        self.fx.alloc_local();
        self.fx.alloc_local();
        let outer_ctx = self.fx.direct_try_depth();
        let begin = self.fx.em.offset();
        trace!("try at {begin}, direct={direct}");
        if direct {
            self.fx.em.emit(Opcode::BeginTry, &[1]);
        }
        self.fx.trys.push(TryCtx {
            begin_offset: begin,
            slot,
            direct,
        });

        let mark = self.enter_block();
        self.parse_block_until(&[TokenKind::Except, TokenKind::Finally, TokenKind::End]);
        self.leave_block(mark);

        if direct {
            self.fx.em.emit(Opcode::EndTry, &[1]);
            // Post-pass: breaks, returns and finally exits inside this
            // direct try must pop one more context on their way out.
            for record in &mut self.fx.break_records {
                if record.start >= begin && !record.is_set {
                    let n = self.fx.em.get(record.pops_patch);
                    self.fx.em.patch(record.pops_patch, n + 1);
                }
            }
            for record in &mut self.fx.return_records {
                if record.start >= begin && !record.is_set {
                    let n = self.fx.em.get(record.pops_patch);
                    self.fx.em.patch(record.pops_patch, n + 1);
                }
            }
            for record in &mut self.fx.finally_records {
                if record.offset >= begin {
                    let n = self.fx.em.get(record.pops_patch);
                    self.fx.em.patch(record.pops_patch, n + 1);
                }
            }
        }
        let body_end = self.fx.em.offset();

        let mut descriptors: Vec<ExceptionRange> = Vec::new();
        match self.kind() {
            TokenKind::Except => {
                let mut out_patches: Vec<usize> = Vec::new();
                while self.kind() == TokenKind::Except {
                    self.advance();
                    let j = self.fx.em.emit(Opcode::Jmp, &[0]);
                    out_patches.push(j + 1);
                    let handler = self.fx.em.offset();
                    let mark = self.enter_block();

                    // Optional binding: `except v is Type`.
                    let mut exposed_binding = false;
                    if matches!(self.kind(), TokenKind::Ident | TokenKind::IdentExposed)
                        && self.peek_kind(1) == TokenKind::Is
                    {
                        exposed_binding = self.kind() == TokenKind::IdentExposed;
                        let sym = self.token_sym().unwrap();
                        let kind = if exposed_binding {
                            SymbolKind::LocalConstExposed
                        } else {
                            SymbolKind::LocalConst
                        };
                        self.add_local(sym, kind, slot);
                        self.advance();
                        self.advance();
                    }

                    let caught_global = self.parse_exception_type();
                    descriptors.push(ExceptionRange {
                        start: begin,
                        end: body_end,
                        ctx_depth: outer_ctx,
                        kind: HandlerKind::Except {
                            slot,
                            handler,
                            caught_global,
                        },
                    });
                    if exposed_binding {
                        self.fx.em.emit(Opcode::CreateExposed, &[slot]);
                    }
                    self.expect_newline();
                    self.parse_block_until(&[TokenKind::Except, TokenKind::End]);
                    self.leave_block(mark);
                }
                let here = self.fx.em.offset();
                for p in out_patches {
                    self.fx.em.patch(p, here);
                }
                self.expect(TokenKind::End);
                self.expect_newline();
            }
            TokenKind::Finally => {
                self.advance();
                self.expect_newline();
                self.fx
                    .em
                    .emit(Opcode::AssignInt, &[slot, FINALLY_FALL as u32]);
                let handler = self.fx.em.offset();
                descriptors.push(ExceptionRange {
                    start: begin,
                    end: body_end,
                    ctx_depth: outer_ctx,
                    kind: HandlerKind::Finally { slot, handler },
                });

                // Bind the break and return statements of the try body to
                // this finally block.
                for record in &mut self.fx.break_records {
                    if record.start >= begin && !record.is_set {
                        self.fx.em.patch(record.disc_dst_patch, slot);
                        self.fx.em.patch(record.jmp_patch, handler);
                        record.is_set = true;
                    }
                }
                for record in &mut self.fx.return_records {
                    if record.start >= begin && !record.is_set {
                        self.fx.em.patch(record.value_dst_patch, slot + 1);
                        self.fx.em.patch(record.disc_dst_patch, slot);
                        self.fx.em.patch(record.jmp_patch, handler);
                        record.is_set = true;
                    }
                }

                let mark = self.enter_block();
                self.parse_block_until(&[TokenKind::End]);
                self.leave_block(mark);
                self.expect(TokenKind::End);
                self.expect_newline();

                let lf = self
                    .fx
                    .em
                    .emit(Opcode::LeaveFinally, &[slot, 0, NO_TARGET]);
                self.fx.finally_records.push(crate::emitter::FinallyRecord {
                    offset: lf as u32,
                    pops_patch: lf + 2,
                });
                // Any finally inside a loop gets a break stub: a break
                // from a nested try chains through every enclosing
                // finally before it reaches the loop exit.
                if !self.fx.loops.is_empty() {
                    let skip = self.fx.em.emit(Opcode::Jmp, &[0]);
                    let stub = self.fx.em.emit(Opcode::Jmp, &[0]);
                    self.fx.em.patch(lf + 3, stub as u32);
                    self.fx
                        .loops
                        .last_mut()
                        .unwrap()
                        .exit_patches
                        .push(stub + 1);
                    let here = self.fx.em.offset();
                    self.fx.em.patch(skip + 1, here);
                }
            }
            _ => {
                self.parse_error("expected except or finally");
                self.accept(TokenKind::End);
                self.expect_newline();
            }
        }

        let try_end = self.fx.em.offset();
        self.fx.trys.pop();
        self.fx.em.exceptions.push(ExceptionRange {
            start: begin,
            end: try_end,
            ctx_depth: outer_ctx,
            kind: HandlerKind::BeginTry { direct },
        });
        self.fx.em.exceptions.extend(descriptors);

        if self.fx.trys.is_empty() {
            self.complete_returns();
        }
    }

    /// Parse the exception type of an except clause; returns the global
    /// index of the caught class (0 on error).
    fn parse_exception_type(&mut self) -> u32 {
        let line = self.line();
        match self.resolve_qualified_global() {
            Some((kind, gidx)) if kind == SymbolKind::GlobalClass => gidx,
            Some(_) | None => {
                self.comp.error(
                    line,
                    DiagnosticCode::InvalidExceptionType,
                    "invalid exception type",
                );
                self.skip_to_newline_keep();
                0
            }
        }
    }

    fn skip_to_newline_keep(&mut self) {
        while !matches!(self.kind(), TokenKind::Newline | TokenKind::Eof) {
            self.advance();
        }
    }
}

pub(crate) fn member_id(comp: &mut Compiler, name: &str) -> u32 {
    comp.members.intern(name).0
}

/// Build a `FunctionCode` from a finished function context.
pub fn finish_function(
    comp: &mut Compiler,
    fx: FnCtx,
    min_args: u32,
    max_args: u32,
    num_hidden_args: u32,
    synthetic: bool,
) -> FunctionId {
    let name = fx.name.clone();
    let file = fx.file;
    let frame = fx.frame_size();
    let sym = None;
    let (code, lines, exceptions) = fx.em.finish_lines();
    let id = FunctionId(comp.functions.len() as u32);
    comp.functions.push(FunctionCode {
        name,
        sym,
        code,
        min_args,
        max_args,
        num_hidden_args,
        frame_size: frame,
        file,
        exceptions,
        lines,
        synthetic,
    });
    id
}

/// Install a compiled function into an already-allocated global slot.
pub fn set_function_global(comp: &mut Compiler, gidx: u32, id: FunctionId) {
    comp.globals.set(gidx, GlobalInit::Function(id));
}
