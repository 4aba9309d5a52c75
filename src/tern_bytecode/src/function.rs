//! Compiled function objects.

use tern_syntax::SymbolId;

use crate::exceptions::ExceptionTable;
use crate::lines::LineTable;
use crate::opcode::CodeWord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u32);

/// High bit of `max_args` marks a varargs function.
pub const VARARG_FLAG: u32 = 1 << 31;

#[derive(Debug, Clone)]
pub struct FunctionCode {
    /// Display name used in tracebacks, e.g. `Main` or `Point create`.
    pub name: String,
    pub sym: Option<SymbolId>,
    pub code: Vec<CodeWord>,
    pub min_args: u32,
    /// Maximum argument count; `VARARG_FLAG` set for varargs. Hidden
    /// arguments (captured cells, self) are included in both bounds.
    pub max_args: u32,
    /// Number of hidden leading arguments (exposed-variable cells, plus
    /// self for anonymous functions inside methods). Zero for ordinary
    /// functions and methods' implicit self.
    pub num_hidden_args: u32,
    pub frame_size: u32,
    pub file: FileId,
    pub exceptions: ExceptionTable,
    pub lines: LineTable,
    /// True for compiler-synthesized functions that are filtered from
    /// tracebacks (module initializers, the Main wrapper, anonymous
    /// function plumbing).
    pub synthetic: bool,
}

impl FunctionCode {
    pub fn max_positional(&self) -> u32 {
        self.max_args & !VARARG_FLAG
    }

    pub fn is_vararg(&self) -> bool {
        self.max_args & VARARG_FLAG != 0
    }

    /// Whether `nargs` actual arguments (hidden included) are acceptable.
    pub fn accepts(&self, nargs: u32) -> bool {
        nargs >= self.min_args && (self.is_vararg() || nargs <= self.max_positional())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vararg_flag_is_separate_from_the_count() {
        let f = FunctionCode {
            name: "f".into(),
            sym: None,
            code: Vec::new(),
            min_args: 1,
            max_args: 2 | VARARG_FLAG,
            num_hidden_args: 0,
            frame_size: 4,
            file: FileId(0),
            exceptions: ExceptionTable::default(),
            lines: LineTable::default(),
            synthetic: false,
        };
        assert!(f.is_vararg());
        assert_eq!(f.max_positional(), 2);
        assert!(f.accepts(1));
        assert!(f.accepts(9));
        assert!(!f.accepts(0));
    }
}
