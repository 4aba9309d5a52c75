//! The compile driver.
//!
//! Owns everything that outlives one file: the symbol table, member ids,
//! globals, the type arena, the module registry and the diagnostic
//! accumulator. Compilation runs pass 1 over every module (transitively
//! following imports), then pass 2, then the deferred supertype
//! resolution and interface verification, and finally assembles the
//! initialization-call chain into the program's entry function.

use std::path::{Path, PathBuf};

use fxhash::{FxHashMap, FxHashSet};
use log::{debug, info};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::DiGraph;

use tern_bytecode::{
    FileId, FunctionCode, FunctionId, GlobalInit, GlobalTable, MemberTableKind, NativeItemDef,
    NativeMemberDef, NativeModuleDef, Opcode, Program, SuperRef, TypeArena, TypeId, TypeInfo,
    MEMBER_TABLE_VAR_KINDS,
};
use tern_syntax::{
    members::MEMBER_CREATE, Diagnostic, DiagnosticCode, DiagnosticCollection, DiagnosticContext,
    MeaningPayload, MemberId, MemberNames, NativeModuleState, Severity, SymbolId, SymbolInfo,
    SymbolKind, SymbolTable, Token,
};

use crate::annotations::elide_annotations;
use crate::emitter::FnCtx;
use crate::errors::{CompileError, CompileResult};
use crate::lexer::{Encoding, Lexer};
use crate::parse::finish_function;
use crate::scan::{scan_file, FileScan};

const LEX_BLOCK_SIZE: usize = 64 * 1024;

/// Exception types the runtime can raise without allocating; a try block
/// catching one of these is flagged direct.
const DIRECT_EXCEPTION_NAMES: &[&str] = &[
    "ValueError",
    "TypeError",
    "MemberError",
    "ArithmeticError",
    "IndexError",
    "KeyError",
    "CastError",
    "ArgumentError",
];

#[derive(Debug, Default)]
pub struct CompileOptions {
    /// Extra module search paths, tried after the main file's directory.
    pub search_paths: Vec<PathBuf>,
    /// Modules compiled into the runtime.
    pub native_modules: Vec<NativeModuleDef>,
}

#[derive(Debug)]
pub struct ModuleEntry {
    pub path: String,
    pub sym: SymbolId,
    /// Whether the module is visible to the file being compiled.
    pub active: bool,
    pub imported: bool,
    pub native: NativeModuleState,
    pub dynamic: bool,
    pub init_global: Option<u32>,
    pub imports: Vec<u32>,
}

/// A scanned file waiting for pass 2.
struct PendingSource {
    module: u32,
    file: FileId,
    tokens: Vec<Token>,
    imports: Vec<u32>,
}

pub struct Compiler {
    pub symbols: SymbolTable,
    pub members: MemberNames,
    pub globals: GlobalTable,
    pub types: TypeArena,
    pub functions: Vec<FunctionCode>,
    pub diags: DiagnosticCollection,
    pub files: Vec<String>,
    pub modules: Vec<ModuleEntry>,

    module_by_path: FxHashMap<String, u32>,
    module_by_sym: FxHashMap<SymbolId, u32>,
    module_roots: FxHashSet<SymbolId>,
    lit_ints: FxHashMap<i64, u32>,
    lit_floats: FxHashMap<u64, u32>,
    lit_strs: FxHashMap<String, u32>,
    direct_exception_syms: FxHashSet<SymbolId>,

    search_paths: Vec<PathBuf>,
    pending: Vec<PendingSource>,

    cur_module: u32,
    main_module: u32,
    cur_file_name: String,
    /// Path symbols of the modules imported so far in the file being
    /// scanned, in declaration order.
    cur_file_imports: Vec<SymbolId>,
    context: DiagnosticContext,

    pub main_global: Option<u32>,
    pub main_takes_args: bool,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Compiler {
        let mut comp = Compiler {
            symbols: SymbolTable::new(),
            members: MemberNames::new(),
            globals: GlobalTable::new(),
            types: TypeArena::new(),
            functions: Vec::new(),
            diags: DiagnosticCollection::new(),
            files: Vec::new(),
            modules: Vec::new(),
            module_by_path: FxHashMap::default(),
            module_by_sym: FxHashMap::default(),
            module_roots: FxHashSet::default(),
            lit_ints: FxHashMap::default(),
            lit_floats: FxHashMap::default(),
            lit_strs: FxHashMap::default(),
            direct_exception_syms: FxHashSet::default(),
            search_paths: options.search_paths,
            pending: Vec::new(),
            cur_module: 0,
            main_module: 0,
            cur_file_name: String::new(),
            cur_file_imports: Vec::new(),
            context: DiagnosticContext::None,
            main_global: None,
            main_takes_args: false,
        };
        // The main module occupies registry slot 0.
        let main_sym = comp.symbols.intern("#main");
        comp.modules.push(ModuleEntry {
            path: String::new(),
            sym: main_sym,
            active: true,
            imported: true,
            native: NativeModuleState::None,
            dynamic: false,
            init_global: None,
            imports: Vec::new(),
        });
        comp.module_by_sym.insert(main_sym, 0);
        for def in &options.native_modules {
            comp.realize_native_module(def);
        }
        for name in DIRECT_EXCEPTION_NAMES {
            if let Some(sym) = comp.symbols.lookup(name) {
                comp.direct_exception_syms.insert(sym);
            }
        }
        comp
    }

    // ----- diagnostics -----

    pub fn error(&mut self, line: u32, code: DiagnosticCode, message: impl Into<String>) {
        let d = Diagnostic {
            code,
            severity: Severity::Error,
            message: message.into(),
            file: self.cur_file_name.clone(),
            line,
            context: self.context.clone(),
        };
        self.diags.add(d);
    }

    pub fn error_in_class(
        &mut self,
        line: u32,
        code: DiagnosticCode,
        message: impl Into<String>,
        class_name: &str,
    ) {
        let d = Diagnostic {
            code,
            severity: Severity::Error,
            message: message.into(),
            file: self.cur_file_name.clone(),
            line,
            context: DiagnosticContext::Class(class_name.to_string()),
        };
        self.diags.add(d);
    }

    pub fn set_context(&mut self, context: DiagnosticContext) -> DiagnosticContext {
        std::mem::replace(&mut self.context, context)
    }

    pub fn restore_context(&mut self, context: DiagnosticContext) {
        self.context = context;
    }

    // ----- globals and name visibility -----

    /// Register a global name owned by the current module. Reports a
    /// redefinition when the module already binds the name.
    pub fn define_global(
        &mut self,
        sym: SymbolId,
        kind: SymbolKind,
        is_private: bool,
        min_args: u32,
        max_args: u32,
        init: GlobalInit,
        line: u32,
    ) -> u32 {
        let scope = self.modules[self.cur_module as usize].sym;
        let existing = self
            .symbols
            .get(sym)
            .meanings
            .iter()
            .find(|m| m.kind.is_global() && m.scope == Some(scope))
            .map(|m| m.num);
        if let Some(gidx) = existing {
            let name = self.symbols.name(sym).to_string();
            self.error(
                line,
                DiagnosticCode::Redefined,
                format!("\"{}\" multiply defined", name),
            );
            return gidx;
        }
        let gidx = self.globals.alloc(self.cur_module, init);
        self.symbols.push_meaning(
            sym,
            SymbolInfo {
                kind,
                num: gidx,
                scope: Some(scope),
                payload: MeaningPayload::Global {
                    is_private,
                    min_args,
                    max_args,
                },
            },
        );
        gidx
    }

    pub fn alloc_method_global(&mut self) -> u32 {
        self.globals.alloc(self.cur_module, GlobalInit::Nil)
    }

    fn module_of_scope(&self, scope: Option<SymbolId>) -> Option<u32> {
        scope.and_then(|s| self.module_by_sym.get(&s).copied())
    }

    fn scope_visible(&self, scope: Option<SymbolId>, is_private: bool) -> bool {
        match self.module_of_scope(scope) {
            Some(m) if m == self.cur_module => true,
            Some(m) if !is_private => self.modules[m as usize].active,
            _ => false,
        }
    }

    /// Global meanings of `sym` visible from the current file:
    /// (kind, global index, declared arity for defs).
    pub fn visible_globals(&self, sym: SymbolId) -> Vec<(SymbolKind, u32, Option<(u32, u32)>)> {
        let mut out = Vec::new();
        for info in &self.symbols.get(sym).meanings {
            if !info.kind.is_global() {
                continue;
            }
            if let MeaningPayload::Global {
                is_private,
                min_args,
                max_args,
            } = info.payload
            {
                if self.scope_visible(info.scope, is_private) {
                    let arity = if info.kind == SymbolKind::GlobalDef {
                        Some((min_args, max_args))
                    } else {
                        None
                    };
                    out.push((info.kind, info.num, arity));
                }
            }
        }
        out
    }

    /// The meaning of `sym` inside module `module`, for qualified
    /// references.
    pub fn global_in_module(&self, sym: SymbolId, module: u32) -> Option<(SymbolKind, u32)> {
        let scope = self.modules[module as usize].sym;
        for info in &self.symbols.get(sym).meanings {
            if info.kind.is_global() && info.scope == Some(scope) {
                if let MeaningPayload::Global { is_private, .. } = info.payload {
                    if is_private && module != self.cur_module {
                        return None;
                    }
                }
                return Some((info.kind, info.num));
            }
        }
        None
    }

    /// The global index `sym` binds in the current module.
    pub fn own_global(&self, sym: SymbolId) -> Option<u32> {
        let scope = self.modules[self.cur_module as usize].sym;
        self.symbols
            .get(sym)
            .meanings
            .iter()
            .find(|m| m.kind.is_global() && m.scope == Some(scope))
            .map(|m| m.num)
    }

    pub fn is_assignable_global(&self, sym: SymbolId) -> bool {
        self.visible_globals(sym)
            .iter()
            .any(|(kind, _, _)| *kind == SymbolKind::Global)
    }

    pub fn class_type(&self, sym: SymbolId) -> Option<TypeId> {
        let gidx = self.own_global(sym)?;
        match self.globals.get(gidx) {
            GlobalInit::Type(tid) => Some(*tid),
            _ => None,
        }
    }

    /// Whether `tid` or an ancestor defines the member. Optimistic when
    /// the supertype chain is not resolved yet.
    pub fn class_has_member(&self, tid: TypeId, member: MemberId) -> bool {
        let mut cursor = Some(tid);
        while let Some(t) = cursor {
            let info = self.types.get(t);
            if !info.entries_for_key(member).is_empty() {
                return true;
            }
            match &info.super_ref {
                SuperRef::Resolved(next) => cursor = Some(*next),
                SuperRef::Unresolved(_) => return true,
                SuperRef::None => return false,
            }
        }
        false
    }

    pub fn is_direct_exception_name(&self, sym: SymbolId) -> bool {
        self.direct_exception_syms.contains(&sym)
    }

    // ----- modules -----

    pub fn is_module_root(&self, sym: SymbolId) -> bool {
        self.module_roots.contains(&sym)
    }

    pub fn module_by_path(&self, path: &str) -> Option<u32> {
        self.module_by_path.get(path).copied()
    }

    pub fn in_main_module(&self) -> bool {
        self.cur_module == self.main_module
    }

    pub fn set_main(&mut self, gidx: u32, takes_args: bool) {
        self.main_global = Some(gidx);
        self.main_takes_args = takes_args;
    }

    /// Module path symbols imported so far in the file being scanned;
    /// the supertype clauses record this context for deferred
    /// resolution.
    pub fn active_import_syms(&self) -> Vec<SymbolId> {
        self.cur_file_imports.clone()
    }

    /// Note an import declaration while scanning a file. The target may
    /// not be loaded yet; the driver follows it afterwards.
    pub fn note_import(&mut self, path: &str) {
        let sym = self.symbols.intern(path);
        if !self.cur_file_imports.contains(&sym) {
            self.cur_file_imports.push(sym);
        }
        if let Some(&module) = self.module_by_path.get(path) {
            self.modules[module as usize].imported = true;
        }
    }

    fn register_module(&mut self, path: &str, native: NativeModuleState) -> u32 {
        if let Some(&m) = self.module_by_path.get(path) {
            return m;
        }
        let sym = self.symbols.intern(path);
        let id = self.modules.len() as u32;
        self.modules.push(ModuleEntry {
            path: path.to_string(),
            sym,
            active: matches!(native, NativeModuleState::AutoImport),
            imported: false,
            native,
            dynamic: matches!(native, NativeModuleState::None),
            init_global: None,
            imports: Vec::new(),
        });
        self.module_by_path.insert(path.to_string(), id);
        self.module_by_sym.insert(sym, id);

        // Component symbols: the root gets a module meaning, inner parts
        // link to their parent.
        let mut parent: Option<SymbolId> = None;
        for (i, part) in path.split("::").enumerate() {
            let part_sym = self.symbols.intern(part);
            let kind = if i == 0 {
                SymbolKind::GlobalModule
            } else {
                SymbolKind::GlobalModuleSub
            };
            let already = self
                .symbols
                .get(part_sym)
                .meanings
                .iter()
                .any(|m| m.kind.is_module() && m.scope == parent);
            if !already {
                self.symbols.push_meaning(
                    part_sym,
                    SymbolInfo {
                        kind,
                        num: id,
                        scope: parent,
                        payload: MeaningPayload::Module {
                            is_active: false,
                            is_imported: false,
                            native,
                        },
                    },
                );
            }
            if i == 0 {
                self.module_roots.insert(part_sym);
            }
            parent = Some(part_sym);
        }
        id
    }

    /// Make exactly the given dynamic modules (plus auto-imports and the
    /// current module) visible.
    fn set_active_imports(&mut self, module: u32, imports: &[u32]) {
        for (i, entry) in self.modules.iter_mut().enumerate() {
            entry.active = matches!(entry.native, NativeModuleState::AutoImport)
                || i as u32 == module
                || imports.contains(&(i as u32));
        }
    }

    // ----- literals -----

    pub fn literal_int(&mut self, v: i64, module: u32) -> u32 {
        if let Some(&g) = self.lit_ints.get(&v) {
            return g;
        }
        let g = self.globals.alloc(module, GlobalInit::Int(v));
        self.lit_ints.insert(v, g);
        g
    }

    pub fn literal_float(&mut self, v: f64, module: u32) -> u32 {
        let key = v.to_bits();
        if let Some(&g) = self.lit_floats.get(&key) {
            return g;
        }
        let g = self.globals.alloc(module, GlobalInit::Float(v));
        self.lit_floats.insert(key, g);
        g
    }

    pub fn literal_str(&mut self, v: &str, module: u32) -> u32 {
        if let Some(&g) = self.lit_strs.get(v) {
            return g;
        }
        let g = self.globals.alloc(module, GlobalInit::Str(v.to_string()));
        self.lit_strs.insert(v.to_string(), g);
        g
    }

    // ----- native module realization -----

    /// Realize a module compiled into the runtime, mirroring the two
    /// source compilation passes.
    fn realize_native_module(&mut self, def: &NativeModuleDef) {
        let state = if def.auto_import {
            NativeModuleState::AutoImport
        } else {
            NativeModuleState::Active
        };
        let module = self.register_module(def.name, state);
        let saved = self.cur_module;
        self.cur_module = module;

        // Pass 1: names, types and member tables.
        let mut class_types: Vec<(TypeId, Option<&'static str>)> = Vec::new();
        for item in def.items {
            match item {
                NativeItemDef::Def {
                    name,
                    min_args,
                    max_args,
                    func,
                } => {
                    let sym = self.symbols.intern(name);
                    self.define_global(
                        sym,
                        SymbolKind::GlobalDef,
                        false,
                        *min_args,
                        *max_args,
                        GlobalInit::Native(*func),
                        0,
                    );
                }
                NativeItemDef::Class {
                    name,
                    supertype,
                    has_finalizer,
                    members,
                } => {
                    let sym = self.symbols.intern(name);
                    let mut info = TypeInfo::new((*name).to_string(), Some(sym), false);
                    info.has_finalizer = *has_finalizer;
                    let tid = self.types.alloc(info);
                    self.define_global(
                        sym,
                        SymbolKind::GlobalClass,
                        false,
                        0,
                        0,
                        GlobalInit::Type(tid),
                        0,
                    );
                    let mut counts = [0usize; tern_bytecode::NUM_MEMBER_TABLES];
                    for m in *members {
                        match m {
                            NativeMemberDef::Method { .. } => {
                                counts[MemberTableKind::MethodPublic as usize] += 1
                            }
                            NativeMemberDef::Var { .. } => {
                                counts[MemberTableKind::GetterPublic as usize] += 1;
                                counts[MemberTableKind::SetterPublic as usize] += 1;
                            }
                            NativeMemberDef::Getter { .. } => {
                                counts[MemberTableKind::GetterPublic as usize] += 1
                            }
                            NativeMemberDef::Setter { .. } => {
                                counts[MemberTableKind::SetterPublic as usize] += 1
                            }
                        }
                    }
                    self.types.get_mut(tid).build_tables(counts);
                    let mut num_vars = 0u32;
                    for m in *members {
                        match m {
                            NativeMemberDef::Method {
                                name,
                                min_args,
                                max_args,
                                func,
                            } => {
                                let key = self.members.intern(name);
                                let g = self.globals.alloc(module, GlobalInit::Native(*func));
                                let _ = (min_args, max_args);
                                self.types
                                    .get_mut(tid)
                                    .table_mut(MemberTableKind::MethodPublic)
                                    .add(key, g, tern_bytecode::MemberFlags::empty());
                            }
                            NativeMemberDef::Var { name } => {
                                let key = self.members.intern(name);
                                let slot = num_vars;
                                num_vars += 1;
                                self.types
                                    .get_mut(tid)
                                    .table_mut(MemberTableKind::GetterPublic)
                                    .add(key, slot, tern_bytecode::MemberFlags::empty());
                                self.types
                                    .get_mut(tid)
                                    .table_mut(MemberTableKind::SetterPublic)
                                    .add(key, slot, tern_bytecode::MemberFlags::empty());
                            }
                            NativeMemberDef::Getter { name, func } => {
                                let key = self.members.intern(name);
                                let g = self.globals.alloc(module, GlobalInit::Native(*func));
                                self.types
                                    .get_mut(tid)
                                    .table_mut(MemberTableKind::GetterPublic)
                                    .add(key, g, tern_bytecode::MemberFlags::ACCESSOR);
                            }
                            NativeMemberDef::Setter { name, func } => {
                                let key = self.members.intern(name);
                                let g = self.globals.alloc(module, GlobalInit::Native(*func));
                                self.types
                                    .get_mut(tid)
                                    .table_mut(MemberTableKind::SetterPublic)
                                    .add(key, g, tern_bytecode::MemberFlags::ACCESSOR);
                            }
                        }
                    }
                    self.types.get_mut(tid).num_vars = num_vars;
                    self.types.get_mut(tid).finalize_tables();
                    class_types.push((tid, *supertype));
                }
            }
        }

        // Pass 2: supertypes, slot bases and constructors.
        for (tid, supertype) in class_types {
            if let Some(super_name) = supertype {
                let super_sym = self.symbols.intern(super_name);
                if let Some((SymbolKind::GlobalClass, gidx)) =
                    self.global_in_module_or_visible(super_sym)
                {
                    if let GlobalInit::Type(sup) = self.globals.get(gidx) {
                        self.types.get_mut(tid).super_ref = SuperRef::Resolved(*sup);
                    }
                }
            }
            let base = self
                .types
                .get(tid)
                .resolved_super()
                .map(|s| self.types.get(s).total_num_vars)
                .unwrap_or(0);
            for kind in MEMBER_TABLE_VAR_KINDS {
                self.types.get_mut(tid).table_mut(kind).adjust_slot_items(base);
            }
            self.types.update_total_num_vars(tid);
            self.types.update_inherited_misc(tid);
            self.types.get_mut(tid).super_resolved = true;
            if let Some((_, entry)) =
                self.types
                    .lookup_member(tid, MemberTableKind::MethodPublic, MEMBER_CREATE)
            {
                self.types.get_mut(tid).create_global = entry.item;
            }
        }
        self.cur_module = saved;
    }

    fn global_in_module_or_visible(&self, sym: SymbolId) -> Option<(SymbolKind, u32)> {
        if let Some(g) = self.global_in_module(sym, self.cur_module) {
            return Some(g);
        }
        let visible = self.visible_globals(sym);
        visible.first().map(|(k, g, _)| (*k, *g))
    }

    // ----- source loading -----

    fn read_source(&mut self, path: &Path) -> CompileResult<Vec<u8>> {
        std::fs::read(path).map_err(|e| CompileError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Lex one source file, handling the encoding declaration and BOM,
    /// then elide annotations and run pass 1.
    fn scan_source(&mut self, display_name: String, bytes: &[u8]) -> (FileId, Vec<Token>, FileScan) {
        let file = FileId(self.files.len() as u32);
        self.files.push(display_name.clone());
        self.cur_file_name = display_name;

        let mut lexer = Lexer::new();
        let (encoding, bom_error) = detect_encoding(bytes);
        if let Some(line) = bom_error {
            self.error(
                line,
                DiagnosticCode::InvalidEncoding,
                "byte order mark requires an explicit encoding utf8 declaration",
            );
        }
        lexer.encoding = encoding;

        let mut tokens = Vec::new();
        let mut consumed = 0usize;
        loop {
            let remaining = &bytes[consumed..];
            let mut take = remaining.len().min(LEX_BLOCK_SIZE);
            loop {
                let is_last = take == remaining.len();
                let n = lexer.tokenize_block(&mut self.symbols, &remaining[..take], is_last, &mut tokens);
                if n > 0 || is_last {
                    consumed += n;
                    break;
                }
                // No complete line inside the block: widen it.
                take = remaining.len().min(take * 2);
            }
            if consumed >= bytes.len() {
                break;
            }
        }

        elide_annotations(&mut tokens);
        let mut tokens = tokens;
        let scan = scan_file(self, &mut tokens);
        (file, tokens, scan)
    }

    /// Locate and load a dynamic module by dotted name, pass 1 only;
    /// recursively follows its imports.
    fn load_module(&mut self, path: &str, line: u32) {
        if self.module_by_path.contains_key(path) {
            return;
        }
        let rel: PathBuf = path.split("::").collect();
        let mut dir = None;
        for sp in &self.search_paths {
            let candidate = sp.join(&rel);
            if candidate.is_dir() {
                dir = Some(candidate);
                break;
            }
        }
        let Some(dir) = dir else {
            self.error(
                line,
                DiagnosticCode::ModuleNotFound,
                format!("module \"{}\" could not be found", path.replace("::", ".")),
            );
            return;
        };
        let mut source_files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().map(|x| x == "tn").unwrap_or(false))
                    .collect()
            })
            .unwrap_or_default();
        source_files.sort();
        if source_files.is_empty() {
            self.error(
                line,
                DiagnosticCode::ModuleNotFound,
                format!("module \"{}\" has no source files", path.replace("::", ".")),
            );
            return;
        }

        let module = self.register_module(path, NativeModuleState::None);
        info!("loading module {} from {}", path, dir.display());
        let saved_module = self.cur_module;
        let saved_file = self.cur_file_name.clone();
        self.cur_module = module;
        for sf in source_files {
            let bytes = match self.read_source(&sf) {
                Ok(b) => b,
                Err(e) => {
                    self.error(0, DiagnosticCode::ModuleNotFound, e.to_string());
                    continue;
                }
            };
            let saved_imports = std::mem::take(&mut self.cur_file_imports);
            let (file, tokens, scan) = self.scan_source(sf.display().to_string(), &bytes);
            self.cur_file_imports = saved_imports;
            let mut imports: Vec<u32> = Vec::new();
            for decl in &scan.imports {
                self.load_module(&decl.path, decl.line);
                if let Some(m) = self.module_by_path(&decl.path) {
                    self.modules[m as usize].imported = true;
                    imports.push(m);
                }
            }
            self.modules[module as usize]
                .imports
                .extend(imports.iter().copied());
            self.pending.push(PendingSource {
                module,
                file,
                tokens,
                imports,
            });
        }
        self.cur_module = saved_module;
        self.cur_file_name = saved_file;
    }

    // ----- deferred supertype resolution -----

    /// Resolve a dotted or bare type name in the current activation
    /// context.
    fn lookup_type_name(&mut self, name: &str) -> Option<TypeId> {
        let (kind, gidx) = if let Some((prefix, last)) = name.rsplit_once("::") {
            let module = self.module_by_path(prefix)?;
            let sym = self.symbols.intern(last);
            self.global_in_module(sym, module)?
        } else {
            let sym = self.symbols.intern(name);
            let visible = self.visible_globals(sym);
            if visible.len() != 1 {
                return None;
            }
            (visible[0].0, visible[0].1)
        };
        if !matches!(kind, SymbolKind::GlobalClass | SymbolKind::GlobalInterface) {
            return None;
        }
        match self.globals.get(gidx) {
            GlobalInit::Type(tid) => Some(*tid),
            _ => None,
        }
    }

    /// Install every deferred supertype reference, reject cycles, then
    /// fix slot bases, verify interfaces and record constructors.
    fn resolve_supertypes(&mut self) {
        // First resolve names to proposed edges under each recorded
        // import context.
        struct Proposed {
            tid: TypeId,
            super_tid: Option<TypeId>,
            interfaces: Vec<TypeId>,
            line: u32,
        }
        let mut proposals: Vec<Proposed> = Vec::new();
        for tid in self.types.ids().collect::<Vec<_>>() {
            let unresolved = match &self.types.get(tid).super_ref {
                SuperRef::Unresolved(u) => (**u).clone(),
                _ => continue,
            };
            // Reactivate the import context recorded with the clause.
            let imports: Vec<u32> = unresolved
                .imports
                .iter()
                .filter_map(|s| self.module_by_sym.get(s).copied())
                .collect();
            self.set_active_imports(self.cur_module, &imports);

            let super_tid = match &unresolved.super_name {
                Some(name) => {
                    let resolved = self.lookup_type_name(name);
                    if resolved.is_none() {
                        let type_name = self.types.get(tid).name.clone();
                        self.error_in_class(
                            unresolved.line,
                            DiagnosticCode::UndefinedName,
                            format!("\"{}\" undefined", name),
                            &type_name,
                        );
                    }
                    resolved
                }
                None => None,
            };
            let mut interfaces = Vec::new();
            for iname in &unresolved.interface_names {
                match self.lookup_type_name(iname) {
                    Some(iid) if self.types.get(iid).is_interface => interfaces.push(iid),
                    Some(_) | None => {
                        let type_name = self.types.get(tid).name.clone();
                        self.error_in_class(
                            unresolved.line,
                            DiagnosticCode::UndefinedName,
                            format!("\"{}\" undefined", iname),
                            &type_name,
                        );
                    }
                }
            }
            proposals.push(Proposed {
                tid,
                super_tid,
                interfaces,
                line: unresolved.line,
            });
        }

        // Cycle check over the proposed supertype edges. Types on a
        // cycle keep their supertype unset; one error per cycle, at the
        // type that was resolved last.
        let mut graph: DiGraph<TypeId, ()> = DiGraph::new();
        let mut nodes = FxHashMap::default();
        for tid in self.types.ids() {
            nodes.insert(tid, graph.add_node(tid));
        }
        for p in &proposals {
            if let Some(sup) = p.super_tid {
                graph.add_edge(nodes[&p.tid], nodes[&sup], ());
            }
        }
        for tid in self.types.ids() {
            if let Some(sup) = self.types.get(tid).resolved_super() {
                graph.add_edge(nodes[&tid], nodes[&sup], ());
            }
        }
        // Types on a cycle keep their supertype unset; one error per
        // cycle, reported on the class that was resolved last.
        let mut cyclic: FxHashSet<TypeId> = FxHashSet::default();
        for scc in tarjan_scc(&graph) {
            if scc.len() <= 1 {
                continue;
            }
            let members: FxHashSet<TypeId> = scc.iter().map(|n| graph[*n]).collect();
            if let Some(p) = proposals.iter().rev().find(|p| members.contains(&p.tid)) {
                let type_name = self.types.get(p.tid).name.clone();
                self.error_in_class(
                    p.line,
                    DiagnosticCode::CycleInSupertype,
                    "cycle in supertype hierarchy",
                    &type_name,
                );
            }
            cyclic.extend(members);
        }

        for p in &proposals {
            let info = self.types.get_mut(p.tid);
            if cyclic.contains(&p.tid) {
                info.super_ref = SuperRef::None;
            } else {
                info.super_ref = match p.super_tid {
                    Some(sup) => SuperRef::Resolved(sup),
                    None => SuperRef::None,
                };
            }
            info.interfaces = p.interfaces.clone();
            info.super_resolved = true;
        }

        // Slot bases and inherited counters, supertypes first. The
        // installed graph is acyclic, so the sort cannot fail.
        let mut resolved_graph: DiGraph<TypeId, ()> = DiGraph::new();
        let mut resolved_nodes = FxHashMap::default();
        for tid in self.types.ids() {
            resolved_nodes.insert(tid, resolved_graph.add_node(tid));
        }
        for tid in self.types.ids() {
            if let Some(sup) = self.types.get(tid).resolved_super() {
                resolved_graph.add_edge(resolved_nodes[&tid], resolved_nodes[&sup], ());
            }
        }
        let order = toposort(&resolved_graph, None).unwrap_or_default();
        for node in order.into_iter().rev() {
            let tid = resolved_graph[node];
            // Only adjust the types resolved in this pass.
            if proposals.iter().any(|p| p.tid == tid) {
                let base = self
                    .types
                    .get(tid)
                    .resolved_super()
                    .map(|s| self.types.get(s).total_num_vars)
                    .unwrap_or(0);
                for kind in MEMBER_TABLE_VAR_KINDS {
                    self.types.get_mut(tid).table_mut(kind).adjust_slot_items(base);
                }
                self.types.update_total_num_vars(tid);
                self.types.update_inherited_misc(tid);
                if let Some((_, entry)) =
                    self.types
                        .lookup_member(tid, MemberTableKind::MethodPublic, MEMBER_CREATE)
                {
                    self.types.get_mut(tid).create_global = entry.item;
                }
            }
        }

        self.verify_interfaces();
    }

    /// Every member an interface (or its super-interfaces) declares must
    /// be present, in the same partition kind, on the class or an
    /// ancestor.
    fn verify_interfaces(&mut self) {
        const CHECKED: [MemberTableKind; 3] = [
            MemberTableKind::MethodPublic,
            MemberTableKind::GetterPublic,
            MemberTableKind::SetterPublic,
        ];
        let mut errors: Vec<(String, String, String)> = Vec::new();
        for tid in self.types.ids() {
            let info = self.types.get(tid);
            if info.is_interface {
                continue;
            }
            for &iface in &info.interfaces {
                for itype in self.types.chain(iface) {
                    for kind in CHECKED {
                        for entry in self.types.get(itype).table(kind).entries() {
                            let found = self.types.lookup_member(tid, kind, entry.key).is_some();
                            if !found {
                                // Relaxed when the key exists in another
                                // partition: the kind mismatch was already
                                // reported at definition time.
                                let elsewhere = CHECKED.iter().any(|k| {
                                    *k != kind
                                        && self.types.lookup_member(tid, *k, entry.key).is_some()
                                });
                                if !elsewhere {
                                    errors.push((
                                        info.name.clone(),
                                        self.types.get(iface).name.clone(),
                                        self.member_name(entry.key),
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }
        for (class, iface, member) in errors {
            self.error_in_class(
                0,
                DiagnosticCode::InterfaceNotImplemented,
                format!(
                    "\"{}\" does not implement \"{}\" of interface \"{}\"",
                    class, member, iface
                ),
                &class,
            );
        }
    }

    fn member_name(&self, key: MemberId) -> String {
        self.members.name(key).to_string()
    }

    // ----- the driver -----

    /// Compile `main_path` and everything it imports into a program.
    pub fn compile_file(&mut self, main_path: &Path) -> CompileResult<Program> {
        let bytes = self.read_source(main_path)?;
        if let Some(dir) = main_path.parent() {
            self.search_paths.insert(0, dir.to_path_buf());
        }

        // Pass 1 of the main file, then transitively of every import.
        self.cur_module = self.main_module;
        self.cur_file_imports.clear();
        let (file, tokens, scan) =
            self.scan_source(main_path.display().to_string(), &bytes);
        self.cur_file_imports.clear();
        let mut main_imports: Vec<u32> = Vec::new();
        for decl in &scan.imports {
            self.load_module(&decl.path, decl.line);
            if let Some(m) = self.module_by_path(&decl.path) {
                self.modules[m as usize].imported = true;
                main_imports.push(m);
            }
        }
        self.pending.push(PendingSource {
            module: self.main_module,
            file,
            tokens,
            imports: main_imports,
        });

        // Pass 2 per file; imported modules were queued first, the main
        // file last.
        let pending = std::mem::take(&mut self.pending);
        let mut init_functions: Vec<(u32, FunctionId)> = Vec::new();
        for src in &pending {
            self.cur_module = src.module;
            self.cur_file_name = self.files[src.file.0 as usize].clone();
            self.set_active_imports(src.module, &src.imports);
            debug!("pass 2: {}", self.cur_file_name);
            if let Some(init) = crate::defs::parse_file_pass2(self, &src.tokens, src.file, src.module)
            {
                init_functions.push((src.module, init));
            }
        }

        self.cur_module = self.main_module;
        self.resolve_supertypes();

        // The initialization-call chain and the entry function.
        let mut init_chain = Vec::new();
        for (module, id) in init_functions {
            let g = self.globals.alloc(module, GlobalInit::Function(id));
            self.modules[module as usize].init_global = Some(g);
            init_chain.push(g);
        }
        let entry = self.emit_entry(&init_chain);

        if self.diags.has_errors() {
            return Err(CompileError::HasErrors(self.diags.error_count()));
        }

        let modules = self
            .modules
            .iter()
            .enumerate()
            .map(|(tag, m)| tern_bytecode::ProgramModule {
                name: if m.path.is_empty() {
                    "<program>".to_string()
                } else {
                    m.path.clone()
                },
                tag: tag as u32,
                native: !matches!(m.native, NativeModuleState::None),
                dynamic: m.dynamic,
            })
            .collect();

        Ok(Program {
            functions: std::mem::take(&mut self.functions),
            globals: std::mem::replace(&mut self.globals, GlobalTable::new()),
            types: std::mem::take(&mut self.types),
            modules,
            files: std::mem::take(&mut self.files),
            member_names: self.members.to_vec(),
            init_chain,
            main_global: self.main_global,
            main_takes_args: self.main_takes_args,
            entry,
        })
    }

    /// The synthetic entry function: run each module initializer, then
    /// `Main`, then halt. Filtered from tracebacks.
    fn emit_entry(&mut self, init_chain: &[u32]) -> FunctionId {
        let mut fx = FnCtx::new("Main wrapper".to_string(), FileId(0));
        let args_slot = fx.alloc_local();
        let t = fx.alloc_local();
        for g in init_chain {
            fx.em.emit(Opcode::CallGlobal, &[t, *g, 0]);
        }
        if let Some(main) = self.main_global {
            if self.main_takes_args {
                fx.em.emit(Opcode::CallGlobal, &[t, main, 1, args_slot]);
            } else {
                fx.em.emit(Opcode::CallGlobal, &[t, main, 0]);
            }
        }
        fx.em.emit(Opcode::Halt, &[]);
        finish_function(self, fx, 1, 1, 0, true)
    }
}

/// Inspect the first line for a BOM and an encoding declaration.
/// Returns the encoding and, when the BOM lacks its required matching
/// declaration, the error line.
fn detect_encoding(bytes: &[u8]) -> (Encoding, Option<u32>) {
    let has_bom = bytes.len() >= 3 && bytes[..3] == [0xef, 0xbb, 0xbf];
    let body = if has_bom { &bytes[3..] } else { bytes };
    let first_line_end = body
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(body.len());
    let line = String::from_utf8_lossy(&body[..first_line_end]);
    let mut words = line.split_whitespace();
    let declared = if words.next() == Some("encoding") {
        match words.next() {
            Some("utf8") => Some(Encoding::Utf8),
            Some("latin1") => Some(Encoding::Latin1),
            Some("ascii") => Some(Encoding::Ascii),
            _ => None,
        }
    } else {
        None
    };
    if has_bom {
        return match declared {
            Some(Encoding::Utf8) => (Encoding::Utf8, None),
            _ => (Encoding::Utf8, Some(1)),
        };
    }
    (declared.unwrap_or(Encoding::Utf8), None)
}
