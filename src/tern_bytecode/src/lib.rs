pub mod debug;
pub mod exceptions;
pub mod function;
pub mod globals;
pub mod lines;
pub mod opcode;
pub mod program;
pub mod types;

pub use crate::exceptions::{ExceptionRange, ExceptionTable, HandlerKind};
pub use crate::function::{FileId, FunctionCode, FunctionId, VARARG_FLAG};
pub use crate::globals::{GlobalInit, GlobalTable, CORE_MODULE, GLOBAL_BLOCK_SIZE};
pub use crate::lines::{LineTable, LineTableBuilder};
pub use crate::opcode::{
    CodeWord, Opcode, FINALLY_BREAK, FINALLY_FALL, FINALLY_RAISE, FINALLY_RETURN, NO_TARGET,
};
pub use crate::program::{NativeItemDef, NativeMemberDef, NativeModuleDef, Program, ProgramModule};
pub use crate::types::{
    MemberEntry, MemberFlags, MemberTable, MemberTableKind, SuperRef, TypeArena, TypeId, TypeInfo,
    UnresolvedSuper, MEMBER_TABLE_VAR_KINDS, NUM_MEMBER_TABLES,
};
