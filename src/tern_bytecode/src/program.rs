//! The compiled program handed from the compiler to the interpreter, and
//! the definition format for modules backed by native code.

use crate::function::{FileId, FunctionCode, FunctionId};
use crate::globals::GlobalTable;
use crate::types::TypeArena;

/// One registry entry carried into the compiled program, for the
/// runtime's dynamic-module bookkeeping.
#[derive(Debug, Clone)]
pub struct ProgramModule {
    pub name: String,
    /// The global-table bucket tag this module allocates under.
    pub tag: u32,
    /// Compiled into the runtime; never reclaimed.
    pub native: bool,
    /// Compiled from sources at run time; eligible for the sweep.
    pub dynamic: bool,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub functions: Vec<FunctionCode>,
    pub globals: GlobalTable,
    pub types: TypeArena,
    pub modules: Vec<ProgramModule>,
    /// Source file paths indexed by `FileId`.
    pub files: Vec<String>,
    /// Member names indexed by member id, for error messages.
    pub member_names: Vec<String>,
    /// Global indices of the module initializer functions, in
    /// initialization order (imports first).
    pub init_chain: Vec<u32>,
    /// Global index of the program's `Main` function, if one exists.
    pub main_global: Option<u32>,
    /// Whether `Main` declares the one optional argument receiving the
    /// program arguments.
    pub main_takes_args: bool,
    /// The synthetic entry function calling the init chain and `Main`.
    pub entry: FunctionId,
}

impl Program {
    pub fn function(&self, id: FunctionId) -> &FunctionCode {
        &self.functions[id.0 as usize]
    }

    pub fn file_name(&self, id: FileId) -> &str {
        self.files
            .get(id.0 as usize)
            .map(String::as_str)
            .unwrap_or("<unknown>")
    }
}

/// A member of a native class definition.
#[derive(Debug, Clone, Copy)]
pub enum NativeMemberDef {
    Method {
        name: &'static str,
        min_args: u32,
        max_args: u32,
        func: u32,
    },
    Var {
        name: &'static str,
    },
    Getter {
        name: &'static str,
        func: u32,
    },
    Setter {
        name: &'static str,
        func: u32,
    },
}

/// An item of a native module definition.
#[derive(Debug, Clone, Copy)]
pub enum NativeItemDef {
    Def {
        name: &'static str,
        min_args: u32,
        max_args: u32,
        func: u32,
    },
    Class {
        name: &'static str,
        supertype: Option<&'static str>,
        has_finalizer: bool,
        members: &'static [NativeMemberDef],
    },
}

/// A module compiled into the runtime. Realized through the same two
/// passes as source modules: pass 1 registers names and builds member
/// tables, pass 2 resolves supertypes and finalizes constructors.
#[derive(Debug, Clone, Copy)]
pub struct NativeModuleDef {
    pub name: &'static str,
    /// Auto-imported modules are active in every compiled file without an
    /// import declaration.
    pub auto_import: bool,
    pub items: &'static [NativeItemDef],
}
