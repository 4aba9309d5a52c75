//! Pass 2 for definitions: functions, methods, accessors, class bodies
//! and anonymous functions.

use log::trace;

use tern_bytecode::{
    FunctionId, GlobalInit, MemberFlags, MemberTableKind, Opcode, TypeId, VARARG_FLAG,
};
use tern_syntax::{DiagnosticContext, MemberId, SymbolId, SymbolKind, TokenKind};

use crate::compiler::Compiler;
use crate::emitter::FnCtx;
use crate::parse::{finish_function, ClassCtx, Parser};

/// What kind of member a `def` inside a class body declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefForm {
    Method,
    Getter,
    Setter,
}

impl<'a> Parser<'a> {
    /// Parse a parameter list into the current function context,
    /// emitting default-argument prologues. Returns (min, max, vararg)
    /// over the declared parameters only.
    fn parse_parameters(&mut self) -> (u32, u32, bool) {
        let mut min = 0u32;
        let mut max = 0u32;
        let mut vararg = false;
        let mut exposed_slots: Vec<u32> = Vec::new();
        self.skip_annotations();
        if !self.accept(TokenKind::LParen) {
            return (0, 0, false);
        }
        self.skip_annotations();
        if self.accept(TokenKind::RParen) {
            return (0, 0, false);
        }
        loop {
            self.skip_annotations();
            let is_rest = self.accept(TokenKind::Star);
            self.skip_annotations();
            match self.kind() {
                TokenKind::Ident | TokenKind::IdentExposed => {
                    let is_exposed = self.kind() == TokenKind::IdentExposed;
                    let sym = self.token_sym().unwrap();
                    self.advance();
                    let slot = self.fx.alloc_local();
                    let kind = if is_exposed {
                        SymbolKind::LocalExposed
                    } else {
                        SymbolKind::Local
                    };
                    self.add_local(sym, kind, slot);
                    if is_rest {
                        vararg = true;
                    } else {
                        max += 1;
                    }
                    self.skip_annotations();
                    if self.accept(TokenKind::Assign) {
                        // Optional parameter: evaluate the default when
                        // the caller left the slot at the sentinel.
                        let tmark = self.fx.temp_mark();
                        let d = self.fx.push_temp();
                        self.fx.em.emit(Opcode::IsDefault, &[d, slot]);
                        let skip = self.fx.em.emit(Opcode::IfFalse, &[d, 0]);
                        let e = self.parse_expression();
                        self.expr_into_slot(e, slot);
                        let here = self.fx.em.offset();
                        self.fx.em.patch(skip + 2, here);
                        self.fx.release_temps_to(tmark);
                    } else if !is_rest {
                        min = max;
                    }
                    if is_exposed {
                        exposed_slots.push(slot);
                    }
                }
                _ => {
                    self.parse_error("expected a parameter name");
                    break;
                }
            }
            self.skip_annotations();
            if self.accept(TokenKind::Comma) {
                continue;
            }
            self.expect(TokenKind::RParen);
            break;
        }
        for slot in exposed_slots {
            self.fx.em.emit(Opcode::CreateExposed, &[slot]);
        }
        (min, max, vararg)
    }

    /// Tear down the function scope: pop every local meaning bound while
    /// compiling the current function.
    fn pop_function_scope(&mut self) {
        while let Some(sym) = self.fx.locals_chain.pop() {
            self.comp.symbols.pop_meaning(sym);
        }
    }

    /// Parse a function body (after the header) up to its `end`, then
    /// build the `FunctionCode`.
    fn finish_body(
        &mut self,
        min_args: u32,
        max_args: u32,
        num_hidden_args: u32,
        synthetic: bool,
    ) -> FunctionId {
        self.parse_block_until(&[TokenKind::End]);
        self.expect(TokenKind::End);
        self.expect_newline();
        self.complete_returns();
        self.fx.em.emit(Opcode::RetNil, &[]);
        self.pop_function_scope();
        let fx = std::mem::replace(&mut self.fx, FnCtx::new(String::new(), self.file));
        finish_function(self.comp, fx, min_args, max_args, num_hidden_args, synthetic)
    }

    /// A top-level `def`. The global slot was allocated in pass 1.
    pub fn parse_named_function(&mut self) {
        let def_line = self.line();
        self.advance();
        let Some(sym) = self.token_sym() else {
            self.parse_error("expected a function name");
            self.skip_to_newline();
            return;
        };
        let name = self.comp.symbols.name(sym).to_string();
        self.advance();

        let saved_fx = std::mem::replace(&mut self.fx, FnCtx::new(name.clone(), self.file));
        let saved_ctx = self.comp.set_context(DiagnosticContext::Function(name.clone()));
        self.fx.block_depth = 1;
        let (min, max, vararg) = self.parse_parameters();
        self.expect_newline();
        let max_field = if vararg { max | VARARG_FLAG } else { max };
        let id = self.finish_body(min, max_field, 0, false);
        self.comp.restore_context(saved_ctx);
        self.fx = saved_fx;

        if let Some(gidx) = self.comp.own_global(sym) {
            if *self.comp.globals.get(gidx) == GlobalInit::Nil {
                self.comp.globals.set(gidx, GlobalInit::Function(id));
            }
            if name == "Main" && self.comp.in_main_module() {
                self.comp.set_main(gidx, max > 0);
            }
        } else {
            trace!("no global for def {} at line {}", name, def_line);
        }
    }

    /// An anonymous function in an expression. Captured exposed locals
    /// (and self, inside a method) become hidden leading parameters;
    /// the creation site lists their cell slots.
    pub fn parse_anonymous_function(&mut self) -> crate::expr::ParsedExpr {
        self.advance();

        // Capture every exposed local visible at the creation site, in
        // scope-chain order.
        let mut captured: Vec<(SymbolId, u32)> = Vec::new();
        for &sym in &self.fx.locals_chain {
            let Some(info) = self.comp.symbols.meaning(sym) else {
                continue;
            };
            if info.kind.is_exposed_local() && !captured.iter().any(|(s, _)| *s == sym) {
                captured.push((sym, info.num));
            }
        }
        let outer_self = self.fx.self_slot;

        let saved_fx = std::mem::replace(
            &mut self.fx,
            FnCtx::new("anonymous function".to_string(), self.file),
        );
        self.fx.block_depth = 1;
        let mut cell_sources: Vec<u32> = Vec::new();
        for (sym, outer_slot) in &captured {
            let slot = self.fx.alloc_local();
            self.add_local(*sym, SymbolKind::LocalExposed, slot);
            cell_sources.push(*outer_slot);
        }
        if let Some(outer_self_slot) = outer_self {
            let slot = self.fx.alloc_local();
            self.fx.self_slot = Some(slot);
            cell_sources.push(outer_self_slot);
        }
        let hidden = cell_sources.len() as u32;

        let (min, max, vararg) = self.parse_parameters();
        self.expect_newline();
        let max_field = if vararg {
            (hidden + max) | VARARG_FLAG
        } else {
            hidden + max
        };
        // Anonymous-function plumbing is filtered from tracebacks.
        let id = self.finish_body(hidden + min, max_field, hidden, true);
        self.fx = saved_fx;

        let gidx = self
            .comp
            .globals
            .alloc(self.module_tag, GlobalInit::Function(id));
        let mut operands = vec![0, gidx, hidden];
        operands.extend_from_slice(&cell_sources);
        let at = self.fx.em.emit(Opcode::CreateAnon, &operands);
        crate::expr::ParsedExpr::Partial { dst_patch: at + 1 }
    }

    /// A `def` inside a class body in pass 2.
    fn parse_member_def(&mut self, tid: TypeId, class_name: &str, is_private: bool) {
        self.advance();
        let Some(sym) = self.token_sym() else {
            self.parse_error("expected a member name");
            self.skip_to_newline();
            return;
        };
        let name = self.comp.symbols.name(sym).to_string();
        let key = self.comp.members.intern(&name);
        self.advance();

        let form = match self.kind() {
            TokenKind::LParen => DefForm::Method,
            TokenKind::Assign => DefForm::Setter,
            _ => DefForm::Getter,
        };
        let gidx = self.member_global(tid, key, form, is_private);

        let display = format!("{} of {}", name, class_name);
        let saved_fx = std::mem::replace(&mut self.fx, FnCtx::new(display, self.file));
        let saved_ctx = self.comp.set_context(DiagnosticContext::Member {
            class: class_name.to_string(),
            member: name.clone(),
        });
        self.fx.block_depth = 1;
        let self_slot = self.fx.alloc_local();
        self.fx.self_slot = Some(self_slot);

        let (min, max, vararg) = match form {
            DefForm::Method => self.parse_parameters(),
            DefForm::Getter => (0, 0, false),
            DefForm::Setter => {
                // `def name = value`
                self.advance();
                self.skip_annotations();
                match self.kind() {
                    TokenKind::Ident | TokenKind::IdentExposed => {
                        let is_exposed = self.kind() == TokenKind::IdentExposed;
                        let psym = self.token_sym().unwrap();
                        self.advance();
                        let slot = self.fx.alloc_local();
                        let kind = if is_exposed {
                            SymbolKind::LocalExposed
                        } else {
                            SymbolKind::Local
                        };
                        self.add_local(psym, kind, slot);
                        if is_exposed {
                            self.fx.em.emit(Opcode::CreateExposed, &[slot]);
                        }
                    }
                    _ => self.parse_error("expected a setter parameter name"),
                }
                (1, 1, false)
            }
        };
        self.expect_newline();
        let max_field = if vararg {
            (1 + max) | VARARG_FLAG
        } else {
            1 + max
        };
        let id = self.finish_body(1 + min, max_field, 0, false);
        self.comp.restore_context(saved_ctx);
        self.fx = saved_fx;

        if let Some(gidx) = gidx {
            // The first definition wins; a redefinition was reported in
            // pass 1 and must not clobber the original body.
            if *self.comp.globals.get(gidx) == GlobalInit::Nil {
                self.comp.globals.set(gidx, GlobalInit::Function(id));
            }
        }
    }

    /// The global slot pass 1 allocated for this member, if the member
    /// survived redefinition checking.
    fn member_global(
        &mut self,
        tid: TypeId,
        key: MemberId,
        form: DefForm,
        is_private: bool,
    ) -> Option<u32> {
        let t = self.comp.types.get(tid);
        let (public, private) = match form {
            DefForm::Method => (MemberTableKind::MethodPublic, MemberTableKind::MethodPrivate),
            DefForm::Getter => (MemberTableKind::GetterPublic, MemberTableKind::GetterPrivate),
            DefForm::Setter => (MemberTableKind::SetterPublic, MemberTableKind::SetterPrivate),
        };
        let table = if is_private { private } else { public };
        let entry = t.table(table).lookup(key)?;
        if form != DefForm::Method && !entry.flags.contains(MemberFlags::ACCESSOR) {
            return None;
        }
        Some(entry.item)
    }

    /// A class body in pass 2: compile methods and accessors, then build
    /// the member-initializer function from the `var` initializers.
    pub fn parse_class_pass2(&mut self) {
        self.advance();
        let Some(sym) = self.token_sym() else {
            self.skip_to_newline();
            return;
        };
        let name = self.comp.symbols.name(sym).to_string();
        self.advance();
        let Some(tid) = self.comp.class_type(sym) else {
            // Pass 1 failed to register the class; recover past its body.
            self.skip_to_newline();
            return;
        };
        self.skip_to_newline();

        let saved_class = self.class.replace(ClassCtx {
            tid,
            name: name.clone(),
        });

        // (member id, token position of the initializer expression)
        let mut initializers: Vec<(u32, usize)> = Vec::new();
        let mut is_private = false;
        loop {
            self.skip_annotations();
            match self.kind() {
                TokenKind::End => {
                    self.advance();
                    self.expect_newline();
                    break;
                }
                TokenKind::Eof => break,
                TokenKind::Newline => {
                    self.advance();
                    is_private = false;
                }
                TokenKind::Private => {
                    is_private = true;
                    self.advance();
                }
                TokenKind::Var | TokenKind::Const => {
                    self.advance();
                    let mut members: Vec<u32> = Vec::new();
                    loop {
                        self.skip_annotations();
                        match self.kind() {
                            TokenKind::Ident | TokenKind::IdentExposed => {
                                let msym = self.token_sym().unwrap();
                                let mname = self.comp.symbols.name(msym).to_string();
                                members.push(self.comp.members.intern(&mname).0);
                                self.advance();
                            }
                            _ => break,
                        }
                        self.skip_annotations();
                        if !self.accept(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.skip_annotations();
                    if self.kind() == TokenKind::Assign {
                        self.advance();
                        // One initializer expression per declared name.
                        for (i, member) in members.iter().enumerate() {
                            initializers.push((*member, self.pos));
                            self.skip_expression();
                            if i + 1 < members.len() && !self.accept(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.skip_to_newline();
                }
                TokenKind::Def | TokenKind::Sub => {
                    self.parse_member_def(tid, &name, is_private);
                    is_private = false;
                }
                _ => {
                    self.parse_error("expected a member definition");
                    self.skip_to_newline();
                }
            }
        }

        if !initializers.is_empty() {
            self.build_member_initializer(tid, &name, &initializers);
        }
        self.class = saved_class;
    }

    /// Skip one expression without emitting code, tracking bracket depth
    /// and anonymous function bodies.
    fn skip_expression(&mut self) {
        let mut depth = 0u32;
        loop {
            match self.kind() {
                TokenKind::LParen | TokenKind::LBracket => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::RParen | TokenKind::RBracket => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                    self.advance();
                }
                TokenKind::Comma if depth == 0 => return,
                TokenKind::Newline | TokenKind::Eof => return,
                TokenKind::Def | TokenKind::Sub => {
                    // An anonymous function: skip its whole body.
                    let end = crate::scan::skip_block(self.tokens, self.pos + 1);
                    self.pos = end;
                }
                _ => self.advance(),
            }
        }
    }

    /// Emit the synthetic member initializer: one store per declared
    /// initializer, in declaration order.
    fn build_member_initializer(
        &mut self,
        tid: TypeId,
        class_name: &str,
        initializers: &[(u32, usize)],
    ) {
        let return_pos = self.pos;
        let display = format!("#i of {}", class_name);
        let saved_fx = std::mem::replace(&mut self.fx, FnCtx::new(display, self.file));
        let saved_ctx = self.comp.set_context(DiagnosticContext::Class(
            class_name.to_string(),
        ));
        self.fx.block_depth = 1;
        let self_slot = self.fx.alloc_local();
        self.fx.self_slot = Some(self_slot);

        for (member, pos) in initializers {
            self.pos = *pos;
            self.fx.em.set_line(self.line());
            let tmark = self.fx.temp_mark();
            let src = self.parse_expr_to_slot();
            self.fx
                .em
                .emit(Opcode::StoreMember, &[self_slot, *member, src]);
            self.fx.release_temps_to(tmark);
        }
        self.fx.em.emit(Opcode::RetNil, &[]);
        self.pop_function_scope();
        let fx = std::mem::replace(&mut self.fx, FnCtx::new(String::new(), self.file));
        let id = finish_function(self.comp, fx, 1, 1, 0, true);
        self.comp.restore_context(saved_ctx);
        self.fx = saved_fx;
        self.pos = return_pos;

        let gidx = self
            .comp
            .globals
            .alloc(self.module_tag, GlobalInit::Function(id));
        self.comp.types.get_mut(tid).member_initializer = Some(gidx);
    }
}

/// Pass 2 over one file: compile every definition and collect the
/// module-initialization code (top-level variable initializers).
pub fn parse_file_pass2(
    comp: &mut Compiler,
    tokens: &[tern_syntax::Token],
    file: tern_bytecode::FileId,
    module_tag: u32,
) -> Option<FunctionId> {
    let mut parser = Parser::new(comp, tokens, file, module_tag);
    loop {
        parser.skip_annotations();
        match parser.kind() {
            TokenKind::Eof => break,
            TokenKind::Newline | TokenKind::Bom => parser.advance(),
            TokenKind::Module | TokenKind::Encoding | TokenKind::Import => {
                parser.skip_to_newline();
            }
            TokenKind::Private => parser.advance(),
            TokenKind::Var | TokenKind::Const => {
                parse_global_initializers(&mut parser);
            }
            TokenKind::Def | TokenKind::Sub => parser.parse_named_function(),
            TokenKind::Class => parser.parse_class_pass2(),
            TokenKind::Interface => {
                // Interfaces carry no executable bodies.
                parser.advance();
                skip_interface(&mut parser);
            }
            _ => {
                parser.parse_error("expected a definition");
                parser.skip_to_newline();
            }
        }
    }

    if parser.fx.em.offset() == 0 {
        return None;
    }
    parser.fx.em.emit(Opcode::RetNil, &[]);
    parser.fx.name = "#init".to_string();
    let fx = std::mem::replace(&mut parser.fx, FnCtx::new(String::new(), file));
    Some(finish_function(parser.comp, fx, 0, 0, 0, true))
}

fn skip_interface(parser: &mut Parser<'_>) {
    loop {
        match parser.kind() {
            TokenKind::End => {
                parser.advance();
                parser.expect_newline();
                return;
            }
            TokenKind::Eof => return,
            _ => parser.skip_to_newline(),
        }
    }
}

/// Top-level `var`/`const` with initializers: stores into the globals
/// registered by pass 1, emitted into the module init function.
fn parse_global_initializers(parser: &mut Parser<'_>) {
    parser.advance();
    let mut globals: Vec<u32> = Vec::new();
    loop {
        parser.skip_annotations();
        match parser.kind() {
            TokenKind::Ident | TokenKind::IdentExposed => {
                let sym = parser.token_sym().unwrap();
                if let Some(gidx) = parser.comp.own_global(sym) {
                    globals.push(gidx);
                }
                parser.advance();
            }
            _ => break,
        }
        parser.skip_annotations();
        if !parser.accept(TokenKind::Comma) {
            break;
        }
    }
    parser.skip_annotations();
    if parser.accept(TokenKind::Assign) {
        parser.fx.em.set_line(parser.line());
        let tmark = parser.fx.temp_mark();
        if globals.len() == 1 {
            let src = parser.parse_expr_to_slot();
            parser.fx.em.emit(Opcode::StoreGlobal, &[globals[0], src]);
        } else {
            let mut temps = Vec::with_capacity(globals.len());
            for _ in 0..globals.len() {
                temps.push(parser.fx.push_temp());
            }
            parser.parse_values_into(&temps);
            for (t, g) in temps.iter().zip(&globals) {
                parser.fx.em.emit(Opcode::StoreGlobal, &[*g, *t]);
            }
        }
        parser.fx.release_temps_to(tmark);
    }
    parser.skip_to_newline();
}
