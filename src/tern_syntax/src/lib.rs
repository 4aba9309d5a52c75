pub mod diagnostics;
pub mod members;
pub mod symbols;
pub mod token;

pub use crate::diagnostics::{
    Diagnostic, DiagnosticCode, DiagnosticCollection, DiagnosticContext, Severity,
};
pub use crate::members::{MemberId, MemberNames};
pub use crate::symbols::{
    MeaningPayload, NativeModuleState, Symbol, SymbolId, SymbolInfo, SymbolKind, SymbolTable,
};
pub use crate::token::{Token, TokenKind, TokenPayload, RESERVED_WORDS};
