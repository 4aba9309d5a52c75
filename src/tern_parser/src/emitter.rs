//! Code emission for one function.
//!
//! `FnEmitter` owns the code array, the line-table builder and the
//! exception-descriptor list. `FnCtx` adds the parser-side bookkeeping:
//! local slot allocation, block scopes, loop exit lists and the break,
//! return and finally-exit records whose operands are patched after the
//! fact (break context-pop counts are patched when the enclosing finally
//! or direct try end is emitted, not when the break is parsed).

use tern_bytecode::{
    CodeWord, ExceptionRange, ExceptionTable, FileId, LineTable, LineTableBuilder, Opcode,
};
use tern_syntax::SymbolId;

#[derive(Debug, Default)]
pub struct FnEmitter {
    pub code: Vec<CodeWord>,
    lines: LineTableBuilder,
    pub exceptions: Vec<ExceptionRange>,
}

impl FnEmitter {
    pub fn new() -> FnEmitter {
        FnEmitter::default()
    }

    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    /// Emit one instruction; returns the code offset of its opcode word.
    pub fn emit(&mut self, op: Opcode, operands: &[CodeWord]) -> usize {
        let at = self.code.len();
        self.code.push(op as CodeWord);
        self.code.extend_from_slice(operands);
        at
    }

    pub fn patch(&mut self, index: usize, value: CodeWord) {
        self.code[index] = value;
    }

    pub fn get(&self, index: usize) -> CodeWord {
        self.code[index]
    }

    pub fn set_line(&mut self, line: u32) {
        self.lines.push(self.code.len() as u32, line);
    }

    pub fn finish_lines(self) -> (Vec<CodeWord>, LineTable, ExceptionTable) {
        (
            self.code,
            self.lines.build(),
            ExceptionTable {
                entries: self.exceptions,
            },
        )
    }
}

/// One loop statement's pending exits.
#[derive(Debug, Default)]
pub struct LoopCtx {
    /// Patch indices of `Jmp` targets to be bound to the loop exit.
    pub exit_patches: Vec<usize>,
}

/// One try statement in progress.
#[derive(Debug)]
pub struct TryCtx {
    pub begin_offset: u32,
    /// First of the three consecutive locals owned by the statement:
    /// discriminator, payload, scratch.
    pub slot: u32,
    pub direct: bool,
}

/// A `break` that may need to run finally blocks on the way out.
#[derive(Debug)]
pub struct BreakRecord {
    pub start: u32,
    /// Operand index of the discriminator store destination.
    pub disc_dst_patch: usize,
    /// Operand index of the `EndTry` pop count.
    pub pops_patch: usize,
    /// Operand index of the `Jmp` target.
    pub jmp_patch: usize,
    /// Index into the loop stack at emission time.
    pub loop_index: usize,
    pub is_set: bool,
}

/// A `return` inside a try statement.
#[derive(Debug)]
pub struct ReturnRecord {
    pub start: u32,
    pub value_dst_patch: usize,
    pub disc_dst_patch: usize,
    pub pops_patch: usize,
    pub jmp_patch: usize,
    pub src_slot: u32,
    pub is_set: bool,
}

/// A `LeaveFinally` site, so that enclosing direct try ends can bump its
/// context-pop count.
#[derive(Debug)]
pub struct FinallyRecord {
    pub offset: u32,
    pub pops_patch: usize,
}

#[derive(Debug)]
pub struct FnCtx {
    pub em: FnEmitter,
    pub name: String,
    pub file: FileId,
    pub min_args: u32,
    pub max_args: u32,
    pub num_hidden_args: u32,
    pub synthetic: bool,
    pub self_slot: Option<u32>,

    num_locals: u32,
    temp_depth: u32,
    max_slots: u32,
    pub block_depth: u16,
    /// Scope chain: each entry is the symbol of a live local, innermost
    /// last. Leaving a block pops every entry at the current depth.
    pub locals_chain: Vec<SymbolId>,

    pub loops: Vec<LoopCtx>,
    pub trys: Vec<TryCtx>,
    pub break_records: Vec<BreakRecord>,
    pub return_records: Vec<ReturnRecord>,
    pub finally_records: Vec<FinallyRecord>,
}

impl FnCtx {
    pub fn new(name: String, file: FileId) -> FnCtx {
        FnCtx {
            em: FnEmitter::new(),
            name,
            file,
            min_args: 0,
            max_args: 0,
            num_hidden_args: 0,
            synthetic: false,
            self_slot: None,
            num_locals: 0,
            temp_depth: 0,
            max_slots: 0,
            block_depth: 0,
            locals_chain: Vec::new(),
            loops: Vec::new(),
            trys: Vec::new(),
            break_records: Vec::new(),
            return_records: Vec::new(),
            finally_records: Vec::new(),
        }
    }

    /// Allocate a named or hidden local slot that lives until its block
    /// ends.
    pub fn alloc_local(&mut self) -> u32 {
        let slot = self.num_locals;
        self.num_locals += 1;
        self.max_slots = self.max_slots.max(self.num_locals + self.temp_depth);
        slot
    }

    pub fn num_locals(&self) -> u32 {
        self.num_locals
    }

    /// Release locals down to a watermark when a scope ends.
    pub fn release_locals_to(&mut self, watermark: u32) {
        self.num_locals = watermark;
    }

    /// Allocate an expression temporary above the named locals. Must be
    /// released in LIFO order before the statement ends.
    pub fn push_temp(&mut self) -> u32 {
        let slot = self.num_locals + self.temp_depth;
        self.temp_depth += 1;
        self.max_slots = self.max_slots.max(self.num_locals + self.temp_depth);
        slot
    }

    pub fn pop_temp(&mut self) {
        debug_assert!(self.temp_depth > 0);
        self.temp_depth -= 1;
    }

    pub fn temp_mark(&self) -> u32 {
        self.temp_depth
    }

    pub fn release_temps_to(&mut self, mark: u32) {
        self.temp_depth = mark;
    }

    pub fn frame_size(&self) -> u32 {
        self.max_slots
    }

    /// Direct try contexts currently entered, for descriptor depth and
    /// pop counts.
    pub fn direct_try_depth(&self) -> u32 {
        self.trys.iter().filter(|t| t.direct).count() as u32
    }
}
