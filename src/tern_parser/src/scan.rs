//! Compilation pass 1: the definition scanner.
//!
//! Before any bytecode is emitted, every global name, class, interface,
//! member and supertype reference is collected so that forward references
//! resolve in pass 2. The scanner also runs the exposed-variable pass,
//! re-tagging the defining token of any local captured by a nested
//! anonymous function.

use log::trace;

use tern_bytecode::{GlobalInit, MemberFlags, MemberTableKind, SuperRef, TypeInfo, UnresolvedSuper};
use tern_syntax::{
    DiagnosticCode, MemberId, SymbolId, SymbolKind, Token, TokenKind, TokenPayload,
};

use crate::compiler::Compiler;

#[derive(Debug, Clone)]
pub struct ImportDecl {
    pub path: String,
    pub line: u32,
}

#[derive(Debug, Default)]
pub struct FileScan {
    pub imports: Vec<ImportDecl>,
}

/// Skip from the token after a block starter to just past its matching
/// `end` (or `until`), accounting for nested blocks.
pub fn skip_block(tokens: &[Token], mut i: usize) -> usize {
    let mut depth = 1u32;
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::Def
            | TokenKind::Sub
            | TokenKind::If
            | TokenKind::While
            | TokenKind::For
            | TokenKind::Switch
            | TokenKind::Try
            | TokenKind::Repeat
            | TokenKind::Class
            | TokenKind::Interface => depth += 1,
            TokenKind::End | TokenKind::Until => {
                depth -= 1;
                if depth == 0 {
                    return i + 1;
                }
            }
            TokenKind::Eof => return i,
            _ => {}
        }
        i += 1;
    }
    i
}

/// Skip to the token after the next newline, stepping over any block
/// forms (anonymous functions in initializers) on the way.
fn skip_line(tokens: &[Token], mut i: usize) -> usize {
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::Newline => return i + 1,
            TokenKind::Eof => return i,
            TokenKind::Def | TokenKind::Sub => {
                i = skip_block(tokens, i + 1);
            }
            _ => i += 1,
        }
    }
    i
}

fn token_sym(token: &Token) -> Option<SymbolId> {
    match token.payload {
        TokenPayload::Symbol(s) => Some(s),
        _ => None,
    }
}

/// Scan one file's top level, registering globals, classes and members.
pub fn scan_file(comp: &mut Compiler, tokens: &mut Vec<Token>) -> FileScan {
    let mut scan = FileScan::default();
    let mut i = 0usize;
    let mut is_private = false;
    while i < tokens.len() {
        let kind = tokens[i].kind;
        match kind {
            TokenKind::Eof => break,
            TokenKind::Newline | TokenKind::Bom | TokenKind::Annotation => {
                i += 1;
                continue;
            }
            TokenKind::Module | TokenKind::Encoding => {
                i = skip_line(tokens, i + 1);
            }
            TokenKind::Import => {
                i = scan_import(comp, tokens, i + 1, &mut scan);
            }
            TokenKind::Private => {
                is_private = true;
                i += 1;
                continue;
            }
            TokenKind::Var | TokenKind::Const => {
                i = scan_global_variables(comp, tokens, i, kind == TokenKind::Const, is_private);
            }
            TokenKind::Def | TokenKind::Sub => {
                i = scan_global_def(comp, tokens, i, is_private);
            }
            TokenKind::Class | TokenKind::Interface => {
                i = scan_class(comp, tokens, i, kind == TokenKind::Interface, is_private);
            }
            _ => {
                // Pass 2 reports the parse error; pass 1 just recovers.
                i = skip_line(tokens, i + 1);
            }
        }
        is_private = false;
    }
    scan
}

fn scan_import(comp: &mut Compiler, tokens: &[Token], mut i: usize, scan: &mut FileScan) -> usize {
    loop {
        let line = tokens.get(i).map(|t| t.line).unwrap_or(0);
        let (path, next) = scan_dotted_name(comp, tokens, i);
        i = next;
        if let Some(path) = path {
            comp.note_import(&path);
            scan.imports.push(ImportDecl { path, line });
        } else {
            break;
        }
        if i < tokens.len() && tokens[i].kind == TokenKind::Comma {
            i += 1;
            continue;
        }
        break;
    }
    skip_line(tokens, i)
}

fn scan_global_variables(
    comp: &mut Compiler,
    tokens: &[Token],
    start: usize,
    is_const: bool,
    is_private: bool,
) -> usize {
    let mut i = start + 1;
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::Ident => {
                let sym = token_sym(&tokens[i]).unwrap();
                let line = tokens[i].line;
                let kind = if is_const {
                    SymbolKind::GlobalConst
                } else {
                    SymbolKind::Global
                };
                comp.define_global(sym, kind, is_private, 0, 0, GlobalInit::Nil, line);
                i += 1;
            }
            TokenKind::Annotation => i += 1,
            TokenKind::Comma => i += 1,
            _ => break,
        }
    }
    skip_line(tokens, i)
}

/// Argument counts scanned from a definition header. `max` has the
/// vararg flag bit clear; varargs are reported separately.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArityScan {
    pub min: u32,
    pub max: u32,
    pub vararg: bool,
}

/// Scan `( params )` starting at the opening parenthesis (if present).
/// Returns the arity and the index just past the closing parenthesis.
pub fn scan_arity(tokens: &[Token], mut i: usize) -> (ArityScan, usize) {
    let mut arity = ArityScan::default();
    if i >= tokens.len() || tokens[i].kind != TokenKind::LParen {
        return (arity, i);
    }
    i += 1;
    let mut seen_default = false;
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::RParen => return (arity, i + 1),
            TokenKind::Star => {
                arity.vararg = true;
                i += 1;
            }
            TokenKind::Ident | TokenKind::IdentExposed => {
                if !arity.vararg {
                    arity.max += 1;
                    if !seen_default {
                        arity.min += 1;
                    }
                }
                i += 1;
                // Default value: everything to the comma or paren.
                if i < tokens.len() && tokens[i].kind == TokenKind::Assign {
                    if !arity.vararg {
                        seen_default = true;
                        arity.min -= 1;
                    }
                    let mut depth = 0u32;
                    while i < tokens.len() {
                        match tokens[i].kind {
                            TokenKind::LParen | TokenKind::LBracket => depth += 1,
                            TokenKind::RParen | TokenKind::RBracket => {
                                if depth == 0 {
                                    break;
                                }
                                depth -= 1;
                            }
                            TokenKind::Comma if depth == 0 => break,
                            TokenKind::Newline | TokenKind::Eof => break,
                            _ => {}
                        }
                        i += 1;
                    }
                }
            }
            TokenKind::Comma | TokenKind::Annotation | TokenKind::Newline => i += 1,
            _ => break,
        }
    }
    (arity, i)
}

fn scan_global_def(comp: &mut Compiler, tokens: &mut [Token], start: usize, is_private: bool) -> usize {
    let name_at = start + 1;
    if name_at >= tokens.len() || tokens[name_at].kind != TokenKind::Ident {
        return skip_line(tokens, name_at);
    }
    let sym = token_sym(&tokens[name_at]).unwrap();
    let line = tokens[name_at].line;
    let (arity, after_header) = scan_arity(tokens, name_at + 1);
    trace!(
        "pass1: def {} ({}..{}{})",
        comp.symbols.name(sym),
        arity.min,
        arity.max,
        if arity.vararg { "+" } else { "" }
    );
    comp.define_global(
        sym,
        SymbolKind::GlobalDef,
        is_private,
        arity.min,
        if arity.vararg {
            arity.max | tern_bytecode::VARARG_FLAG
        } else {
            arity.max
        },
        GlobalInit::Nil,
        line,
    );
    let end = skip_block(tokens, after_header);
    scan_exposed_if_needed(tokens, start, end);
    skip_line(tokens, end)
}

/// A member definition collected from a class body before the member
/// tables are built.
struct PendingMember {
    table: MemberTableKind,
    key: MemberId,
    item: u32,
    flags: MemberFlags,
    line: u32,
    name: String,
}

fn scan_class(
    comp: &mut Compiler,
    tokens: &mut [Token],
    start: usize,
    is_interface: bool,
    is_private: bool,
) -> usize {
    let name_at = start + 1;
    if name_at >= tokens.len() || tokens[name_at].kind != TokenKind::Ident {
        return skip_line(tokens, name_at);
    }
    let sym = token_sym(&tokens[name_at]).unwrap();
    let class_name = comp.symbols.name(sym).to_string();
    let line = tokens[name_at].line;

    // Header clauses: `is Super` and `implements A, B`. Names are kept
    // as raw dotted strings with the import context active right now;
    // resolution is deferred until every module has finished pass 1.
    let mut i = name_at + 1;
    let mut super_name: Option<String> = None;
    let mut interface_names: Vec<String> = Vec::new();
    while i < tokens.len() && tokens[i].kind != TokenKind::Newline {
        match tokens[i].kind {
            TokenKind::Is => {
                let (name, next) = scan_dotted_name(comp, tokens, i + 1);
                super_name = name;
                i = next;
            }
            TokenKind::Implements => {
                let mut j = i + 1;
                loop {
                    let (name, next) = scan_dotted_name(comp, tokens, j);
                    if let Some(name) = name {
                        interface_names.push(name);
                    } else {
                        break;
                    }
                    j = next;
                    if j < tokens.len() && tokens[j].kind == TokenKind::Comma {
                        j += 1;
                    } else {
                        break;
                    }
                }
                i = j;
            }
            _ => i += 1,
        }
    }
    i += 1; // newline

    let type_info = TypeInfo::new(class_name.clone(), Some(sym), is_interface);
    let tid = comp.types.alloc(type_info);
    comp.types.get_mut(tid).super_ref = SuperRef::Unresolved(Box::new(UnresolvedSuper {
        super_name,
        interface_names,
        imports: comp.active_import_syms(),
        line,
    }));
    let gidx = comp.define_global(
        sym,
        if is_interface {
            SymbolKind::GlobalInterface
        } else {
            SymbolKind::GlobalClass
        },
        is_private,
        0,
        0,
        GlobalInit::Type(tid),
        line,
    );
    let _ = gidx;

    // Body scan: collect members, then build the hash tables sized from
    // the counts.
    let mut pending: Vec<PendingMember> = Vec::new();
    let mut num_vars = 0u32;
    let mut member_private = false;
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::End => {
                i += 1;
                break;
            }
            TokenKind::Eof => break,
            TokenKind::Newline | TokenKind::Annotation => {
                i += 1;
                member_private = false;
                continue;
            }
            TokenKind::Private => {
                member_private = true;
                if is_interface {
                    comp.error(
                        tokens[i].line,
                        DiagnosticCode::InvalidInterfaceMember,
                        "interface members cannot be private",
                    );
                }
                i += 1;
                continue;
            }
            TokenKind::Var | TokenKind::Const => {
                if is_interface {
                    comp.error(
                        tokens[i].line,
                        DiagnosticCode::InvalidInterfaceMember,
                        "interfaces cannot declare member variables",
                    );
                    i = skip_line(tokens, i + 1);
                    member_private = false;
                    continue;
                }
                let is_const = tokens[i].kind == TokenKind::Const;
                i += 1;
                while i < tokens.len() {
                    match tokens[i].kind {
                        TokenKind::Ident | TokenKind::IdentExposed => {
                            let msym = token_sym(&tokens[i]).unwrap();
                            let name = comp.symbols.name(msym).to_string();
                            let key = comp.members.intern(&name);
                            let mline = tokens[i].line;
                            let slot = num_vars;
                            num_vars += 1;
                            let (get_table, set_table) = if member_private {
                                (MemberTableKind::GetterPrivate, MemberTableKind::SetterPrivate)
                            } else {
                                (MemberTableKind::GetterPublic, MemberTableKind::SetterPublic)
                            };
                            pending.push(PendingMember {
                                table: get_table,
                                key,
                                item: slot,
                                flags: MemberFlags::empty(),
                                line: mline,
                                name: name.clone(),
                            });
                            if !is_const {
                                pending.push(PendingMember {
                                    table: set_table,
                                    key,
                                    item: slot,
                                    flags: MemberFlags::empty(),
                                    line: mline,
                                    name,
                                });
                            }
                            i += 1;
                        }
                        TokenKind::Comma | TokenKind::Annotation => i += 1,
                        _ => break,
                    }
                }
                i = skip_line(tokens, i);
            }
            TokenKind::Def | TokenKind::Sub => {
                let def_at = i;
                let mname_at = i + 1;
                if mname_at >= tokens.len()
                    || !matches!(
                        tokens[mname_at].kind,
                        TokenKind::Ident | TokenKind::IdentExposed
                    )
                {
                    i = skip_line(tokens, mname_at);
                    member_private = false;
                    continue;
                }
                let msym = token_sym(&tokens[mname_at]).unwrap();
                let name = comp.symbols.name(msym).to_string();
                let key = comp.members.intern(&name);
                let mline = tokens[mname_at].line;
                let after_name = mname_at + 1;
                let next_kind = tokens
                    .get(after_name)
                    .map(|t| t.kind)
                    .unwrap_or(TokenKind::Eof);
                match next_kind {
                    TokenKind::LParen => {
                        // A method.
                        let table = if member_private {
                            MemberTableKind::MethodPrivate
                        } else {
                            MemberTableKind::MethodPublic
                        };
                        let item = if is_interface {
                            0
                        } else {
                            comp.alloc_method_global()
                        };
                        pending.push(PendingMember {
                            table,
                            key,
                            item,
                            flags: MemberFlags::empty(),
                            line: mline,
                            name,
                        });
                        let (_, after_header) = scan_arity(tokens, after_name);
                        if is_interface {
                            i = skip_line(tokens, after_header);
                        } else {
                            let end = skip_block(tokens, after_header);
                            scan_exposed_if_needed(tokens, def_at, end);
                            i = skip_line(tokens, end);
                        }
                    }
                    TokenKind::Assign => {
                        // A setter: `def name = value`.
                        let table = if member_private {
                            MemberTableKind::SetterPrivate
                        } else {
                            MemberTableKind::SetterPublic
                        };
                        let item = if is_interface {
                            0
                        } else {
                            comp.alloc_method_global()
                        };
                        pending.push(PendingMember {
                            table,
                            key,
                            item,
                            flags: MemberFlags::ACCESSOR,
                            line: mline,
                            name,
                        });
                        if is_interface {
                            i = skip_line(tokens, after_name);
                        } else {
                            let end = skip_block(tokens, skip_line(tokens, after_name));
                            scan_exposed_if_needed(tokens, def_at, end);
                            i = skip_line(tokens, end);
                        }
                    }
                    _ => {
                        // A getter: `def name`.
                        let table = if member_private {
                            MemberTableKind::GetterPrivate
                        } else {
                            MemberTableKind::GetterPublic
                        };
                        let item = if is_interface {
                            0
                        } else {
                            comp.alloc_method_global()
                        };
                        pending.push(PendingMember {
                            table,
                            key,
                            item,
                            flags: MemberFlags::ACCESSOR,
                            line: mline,
                            name,
                        });
                        if is_interface {
                            i = skip_line(tokens, after_name);
                        } else {
                            let end = skip_block(tokens, skip_line(tokens, after_name));
                            scan_exposed_if_needed(tokens, def_at, end);
                            i = skip_line(tokens, end);
                        }
                    }
                }
            }
            _ => {
                i = skip_line(tokens, i + 1);
            }
        }
        member_private = false;
    }

    install_members(comp, tid, &class_name, pending, num_vars);
    i
}

/// Build the six member tables from the counts, then insert every pending
/// entry with redefinition checking.
fn install_members(
    comp: &mut Compiler,
    tid: tern_bytecode::TypeId,
    class_name: &str,
    pending: Vec<PendingMember>,
    num_vars: u32,
) {
    let mut counts = [0usize; tern_bytecode::NUM_MEMBER_TABLES];
    for p in &pending {
        counts[p.table as usize] += 1;
    }
    comp.types.get_mut(tid).build_tables(counts);
    comp.types.get_mut(tid).num_vars = num_vars;

    for p in pending {
        let dup = {
            let t = comp.types.get(tid);
            let in_methods = t
                .table(MemberTableKind::MethodPublic)
                .lookup(p.key)
                .is_some()
                || t.table(MemberTableKind::MethodPrivate).lookup(p.key).is_some();
            match p.table {
                MemberTableKind::MethodPublic | MemberTableKind::MethodPrivate => {
                    in_methods
                        || t.table(MemberTableKind::GetterPublic).lookup(p.key).is_some()
                        || t.table(MemberTableKind::GetterPrivate).lookup(p.key).is_some()
                        || t.table(MemberTableKind::SetterPublic).lookup(p.key).is_some()
                        || t.table(MemberTableKind::SetterPrivate).lookup(p.key).is_some()
                }
                MemberTableKind::GetterPublic | MemberTableKind::GetterPrivate => {
                    in_methods
                        || t.table(MemberTableKind::GetterPublic).lookup(p.key).is_some()
                        || t.table(MemberTableKind::GetterPrivate).lookup(p.key).is_some()
                }
                MemberTableKind::SetterPublic | MemberTableKind::SetterPrivate => {
                    in_methods
                        || t.table(MemberTableKind::SetterPublic).lookup(p.key).is_some()
                        || t.table(MemberTableKind::SetterPrivate).lookup(p.key).is_some()
                }
            }
        };
        if dup {
            comp.error_in_class(
                p.line,
                DiagnosticCode::Redefined,
                format!("\"{}\" multiply defined", p.name),
                class_name,
            );
            continue;
        }
        comp.types.get_mut(tid).table_mut(p.table).add(p.key, p.item, p.flags);
    }
    comp.types.get_mut(tid).finalize_tables();
}

fn scan_dotted_name(
    comp: &Compiler,
    tokens: &[Token],
    mut i: usize,
) -> (Option<String>, usize) {
    let mut parts: Vec<String> = Vec::new();
    while i < tokens.len() && tokens[i].kind == TokenKind::Ident {
        if let Some(sym) = token_sym(&tokens[i]) {
            parts.push(comp.symbols.name(sym).to_string());
        }
        i += 1;
        if i < tokens.len() && tokens[i].kind == TokenKind::ScopeOp {
            i += 1;
        } else {
            break;
        }
    }
    if parts.is_empty() {
        (None, i)
    } else {
        (Some(parts.join("::")), i)
    }
}

/// Run the exposed-variable pass over `tokens[def_at..end]` when the
/// range contains a nested anonymous function.
fn scan_exposed_if_needed(tokens: &mut [Token], def_at: usize, end: usize) {
    let has_anon = tokens[def_at + 1..end]
        .iter()
        .any(|t| matches!(t.kind, TokenKind::Def | TokenKind::Sub));
    if has_anon {
        scan_exposed_definitions(tokens, def_at, end);
    }
}

const MAX_ANON_DEPTH: usize = 32;

/// The exposed-variable pass.
///
/// Walks the token range of one function definition, tracking block
/// depth and local definitions, and re-tags the defining token of every
/// local that is referenced from inside a nested anonymous function (not
/// preceded by `::` or `.` and not followed by `::`). Annotation tokens
/// were re-tagged by the elision pass and never trigger the marker.
pub fn scan_exposed_definitions(tokens: &mut [Token], def_at: usize, end: usize) {
    struct LocalDef {
        sym: SymbolId,
        depth: u32,
        def_token: usize,
    }
    let mut locals: Vec<LocalDef> = Vec::new();
    let mut block_depth: u32 = 1;
    let mut fun_depth_blocks = [0u32; MAX_ANON_DEPTH];
    let mut fun_depth = 0usize;

    let top_sym = |locals: &[LocalDef], sym: SymbolId| -> Option<usize> {
        locals.iter().rposition(|l| l.sym == sym)
    };

    // Register parameter names of the function header starting at `at`
    // (pointing at the def/sub token) at the current block depth.
    let add_function_args = |tokens: &[Token], at: usize, depth: u32, locals: &mut Vec<LocalDef>| {
        let mut j = at + 1;
        // Skip the (optional) name.
        if j < tokens.len() && matches!(tokens[j].kind, TokenKind::Ident | TokenKind::IdentExposed)
        {
            j += 1;
        }
        if j >= tokens.len() || tokens[j].kind != TokenKind::LParen {
            return;
        }
        j += 1;
        let mut paren_depth = 0u32;
        while j < tokens.len() {
            match tokens[j].kind {
                TokenKind::RParen => {
                    if paren_depth == 0 {
                        return;
                    }
                    paren_depth -= 1;
                }
                TokenKind::LParen => paren_depth += 1,
                TokenKind::Ident | TokenKind::IdentExposed if paren_depth == 0 => {
                    // Only parameter names at the top level of the list;
                    // skip identifiers inside default value expressions.
                    let prev = tokens[j - 1].kind;
                    if matches!(prev, TokenKind::LParen | TokenKind::Comma | TokenKind::Star) {
                        if let Some(sym) = token_sym(&tokens[j]) {
                            locals.push(LocalDef {
                                sym,
                                depth,
                                def_token: j,
                            });
                        }
                    }
                }
                TokenKind::Newline | TokenKind::Eof => return,
                _ => {}
            }
            j += 1;
        }
    };

    // Register a comma-separated variable list starting at `at`; returns
    // the index after the list.
    let add_variable_list =
        |tokens: &[Token], mut at: usize, depth: u32, locals: &mut Vec<LocalDef>| -> usize {
            while at < tokens.len() {
                match tokens[at].kind {
                    TokenKind::Ident | TokenKind::IdentExposed => {
                        if let Some(sym) = token_sym(&tokens[at]) {
                            locals.push(LocalDef {
                                sym,
                                depth,
                                def_token: at,
                            });
                        }
                        at += 1;
                    }
                    TokenKind::Comma | TokenKind::Annotation => at += 1,
                    _ => break,
                }
            }
            at
        };

    fun_depth_blocks[0] = 0;
    add_function_args(tokens, def_at, block_depth, &mut locals);

    // Position after the function header: skip name and parameter list.
    let mut i = def_at + 1;
    if i < end && matches!(tokens[i].kind, TokenKind::Ident | TokenKind::IdentExposed) {
        i += 1;
    }
    if i < end && tokens[i].kind == TokenKind::LParen {
        let mut depth = 1u32;
        i += 1;
        while i < end && depth > 0 {
            match tokens[i].kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => depth -= 1,
                _ => {}
            }
            i += 1;
        }
    }

    let mut prev = TokenKind::Def;
    while i < end && tokens[i].kind != TokenKind::Eof && block_depth > 0 {
        // Statement-start handling.
        match tokens[i].kind {
            TokenKind::Var => {
                i = add_variable_list(tokens, i + 1, block_depth, &mut locals);
            }
            TokenKind::Except => {
                i += 1;
                if i + 1 < end
                    && matches!(tokens[i].kind, TokenKind::Ident | TokenKind::IdentExposed)
                    && tokens[i + 1].kind == TokenKind::Is
                {
                    if let Some(sym) = token_sym(&tokens[i]) {
                        locals.push(LocalDef {
                            sym,
                            depth: block_depth,
                            def_token: i,
                        });
                    }
                    i += 2;
                }
            }
            TokenKind::For => {
                block_depth += 1;
                i = add_variable_list(tokens, i + 1, block_depth, &mut locals);
            }
            TokenKind::If
            | TokenKind::While
            | TokenKind::Repeat
            | TokenKind::Switch
            | TokenKind::Try => {
                block_depth += 1;
            }
            TokenKind::End | TokenKind::Until => {
                if fun_depth > 0 && fun_depth_blocks[fun_depth] == block_depth {
                    fun_depth -= 1;
                }
                while let Some(last) = locals.last() {
                    if last.depth == block_depth {
                        locals.pop();
                    } else {
                        break;
                    }
                }
                block_depth = block_depth.saturating_sub(1);
            }
            _ => {}
        }

        // Process tokens until the end of the line, handling identifier
        // references and anonymous function starts.
        while i < end && tokens[i].kind != TokenKind::Newline {
            match tokens[i].kind {
                TokenKind::Def | TokenKind::Sub => {
                    block_depth += 1;
                    if fun_depth + 1 < MAX_ANON_DEPTH {
                        fun_depth += 1;
                        fun_depth_blocks[fun_depth] = block_depth;
                        add_function_args(tokens, i, block_depth, &mut locals);
                    }
                }
                TokenKind::Ident | TokenKind::IdentExposed => {
                    if fun_depth > 0 {
                        if let Some(sym) = token_sym(&tokens[i]) {
                            if let Some(pos) = top_sym(&locals, sym) {
                                let defined_below = locals[pos].depth < fun_depth_blocks[fun_depth];
                                let next_kind = tokens
                                    .get(i + 1)
                                    .map(|t| t.kind)
                                    .unwrap_or(TokenKind::Eof);
                                if defined_below
                                    && prev != TokenKind::ScopeOp
                                    && prev != TokenKind::Dot
                                    && next_kind != TokenKind::ScopeOp
                                {
                                    let def_token = locals[pos].def_token;
                                    tokens[def_token].kind = TokenKind::IdentExposed;
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
            prev = tokens[i].kind;
            i += 1;
        }
        prev = tokens.get(i).map(|t| t.kind).unwrap_or(TokenKind::Eof);
        i += 1;
    }
}
