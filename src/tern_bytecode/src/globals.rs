//! The global value table.
//!
//! Globals live in fixed-size blocks. Every module allocates its globals
//! into blocks tagged with its registry number, so the dynamic-module
//! sweep can enumerate exactly the indices a module owns. Index 0 is nil
//! and never reallocated.

use fxhash::FxHashMap;

use crate::function::FunctionId;
use crate::types::TypeId;

pub const GLOBAL_BLOCK_SIZE: u32 = 256;

/// Module registry number of the runtime core; its globals are never
/// swept.
pub const CORE_MODULE: u32 = 0;

#[derive(Debug, Clone, PartialEq)]
pub enum GlobalInit {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Function(FunctionId),
    Type(TypeId),
    /// Index into the runtime's native function registry.
    Native(u32),
}

#[derive(Debug, Clone)]
struct GlobalBlock {
    module: u32,
    values: Vec<GlobalInit>,
}

#[derive(Debug, Clone)]
pub struct GlobalTable {
    blocks: Vec<GlobalBlock>,
    current: FxHashMap<u32, usize>,
}

impl Default for GlobalTable {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalTable {
    pub fn new() -> GlobalTable {
        let mut table = GlobalTable {
            blocks: Vec::new(),
            current: FxHashMap::default(),
        };
        // Reserve index 0 for nil.
        let nil = table.alloc(CORE_MODULE, GlobalInit::Nil);
        debug_assert_eq!(nil, 0);
        table
    }

    /// Append a new global owned by `module` and return its index.
    pub fn alloc(&mut self, module: u32, init: GlobalInit) -> u32 {
        let block_index = match self.current.get(&module) {
            Some(&b) if self.blocks[b].values.len() < GLOBAL_BLOCK_SIZE as usize => b,
            _ => {
                self.blocks.push(GlobalBlock {
                    module,
                    values: Vec::new(),
                });
                let b = self.blocks.len() - 1;
                self.current.insert(module, b);
                b
            }
        };
        let block = &mut self.blocks[block_index];
        let index = block_index as u32 * GLOBAL_BLOCK_SIZE + block.values.len() as u32;
        block.values.push(init);
        index
    }

    pub fn get(&self, index: u32) -> &GlobalInit {
        let block = &self.blocks[(index / GLOBAL_BLOCK_SIZE) as usize];
        &block.values[(index % GLOBAL_BLOCK_SIZE) as usize]
    }

    pub fn set(&mut self, index: u32, init: GlobalInit) {
        let block = &mut self.blocks[(index / GLOBAL_BLOCK_SIZE) as usize];
        block.values[(index % GLOBAL_BLOCK_SIZE) as usize] = init;
    }

    /// Total index space, including gaps at the ends of partial blocks.
    pub fn index_span(&self) -> u32 {
        self.blocks.len() as u32 * GLOBAL_BLOCK_SIZE
    }

    /// Whether `index` refers to an allocated global.
    pub fn is_allocated(&self, index: u32) -> bool {
        let b = (index / GLOBAL_BLOCK_SIZE) as usize;
        b < self.blocks.len() && (index % GLOBAL_BLOCK_SIZE) < self.blocks[b].values.len() as u32
    }

    /// Indices owned by `module`.
    pub fn module_indices(&self, module: u32) -> Vec<u32> {
        let mut out = Vec::new();
        for (b, block) in self.blocks.iter().enumerate() {
            if block.module != module {
                continue;
            }
            for i in 0..block.values.len() as u32 {
                out.push(b as u32 * GLOBAL_BLOCK_SIZE + i);
            }
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &GlobalInit)> {
        self.blocks.iter().enumerate().flat_map(|(b, block)| {
            block
                .values
                .iter()
                .enumerate()
                .map(move |(i, v)| (b as u32 * GLOBAL_BLOCK_SIZE + i as u32, v))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_zero_is_nil() {
        let t = GlobalTable::new();
        assert_eq!(*t.get(0), GlobalInit::Nil);
    }

    #[test]
    fn modules_allocate_into_their_own_blocks() {
        let mut t = GlobalTable::new();
        let a = t.alloc(1, GlobalInit::Int(1));
        let b = t.alloc(2, GlobalInit::Int(2));
        let c = t.alloc(1, GlobalInit::Int(3));
        assert_eq!(a / GLOBAL_BLOCK_SIZE, c / GLOBAL_BLOCK_SIZE);
        assert_ne!(a / GLOBAL_BLOCK_SIZE, b / GLOBAL_BLOCK_SIZE);
        assert_eq!(t.module_indices(1), vec![a, c]);
    }

    #[test]
    fn blocks_roll_over_when_full() {
        let mut t = GlobalTable::new();
        let mut last = 0;
        for i in 0..(GLOBAL_BLOCK_SIZE * 2) {
            last = t.alloc(3, GlobalInit::Int(i as i64));
        }
        assert!(t.is_allocated(last));
        assert_eq!(t.module_indices(3).len(), (GLOBAL_BLOCK_SIZE * 2) as usize);
    }
}
