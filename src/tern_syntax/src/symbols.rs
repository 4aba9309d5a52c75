//! Interned identifier names and their per-scope meanings.
//!
//! Every identifier spelling is interned exactly once into a chained hash
//! table whose size is a power of two; the table doubles when the load
//! factor reaches 1.0. A symbol carries a stack of meanings, innermost
//! last. Local meanings additionally participate in a scope chain owned by
//! the compiler so that leaving a block pops every local defined at the
//! current depth.

use fxhash::hash64;

use crate::token::{TokenKind, RESERVED_WORDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

/// What a name means in the scope where it was bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    ReservedWord,
    Member,
    GlobalModule,
    GlobalModuleSub,
    GlobalDef,
    GlobalClass,
    GlobalInterface,
    GlobalConst,
    Global,
    LocalConst,
    LocalConstExposed,
    LocalExposed,
    Local,
    ErrParse,
    ErrUndefined,
}

impl SymbolKind {
    pub fn is_local(self) -> bool {
        matches!(
            self,
            SymbolKind::Local
                | SymbolKind::LocalConst
                | SymbolKind::LocalExposed
                | SymbolKind::LocalConstExposed
        )
    }

    pub fn is_exposed_local(self) -> bool {
        matches!(
            self,
            SymbolKind::LocalExposed | SymbolKind::LocalConstExposed
        )
    }

    pub fn is_global(self) -> bool {
        matches!(
            self,
            SymbolKind::GlobalDef
                | SymbolKind::GlobalClass
                | SymbolKind::GlobalInterface
                | SymbolKind::GlobalConst
                | SymbolKind::Global
        )
    }

    pub fn is_module(self) -> bool {
        matches!(self, SymbolKind::GlobalModule | SymbolKind::GlobalModuleSub)
    }
}

/// Realization state of a module backed by native code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeModuleState {
    None,
    AutoImport,
    Active,
    Registered(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeaningPayload {
    None,
    Local {
        block_depth: u16,
    },
    Global {
        is_private: bool,
        min_args: u32,
        max_args: u32,
    },
    Module {
        is_active: bool,
        is_imported: bool,
        native: NativeModuleState,
    },
}

/// One meaning of a symbol. `num` is a global index, a local frame slot or
/// a member id depending on `kind`. `scope` points at the owning module
/// symbol for globals and members, and at the symbol of the next outer
/// local for local meanings.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInfo {
    pub kind: SymbolKind,
    pub num: u32,
    pub scope: Option<SymbolId>,
    pub payload: MeaningPayload,
}

#[derive(Debug)]
pub struct Symbol {
    name: String,
    hash: u64,
    next_in_bucket: Option<SymbolId>,
    pub reserved: Option<TokenKind>,
    pub meanings: Vec<SymbolInfo>,
}

impl Symbol {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The innermost meaning, if any.
    pub fn top(&self) -> Option<&SymbolInfo> {
        self.meanings.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut SymbolInfo> {
        self.meanings.last_mut()
    }
}

const INITIAL_TABLE_SIZE: usize = 512;

#[derive(Debug)]
pub struct SymbolTable {
    buckets: Vec<Option<SymbolId>>,
    symbols: Vec<Symbol>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    /// An empty table with every reserved word pre-interned and marked.
    pub fn new() -> SymbolTable {
        let mut table = SymbolTable {
            buckets: vec![None; INITIAL_TABLE_SIZE],
            symbols: Vec::new(),
        };
        for (spelling, kind) in RESERVED_WORDS.entries() {
            let id = table.intern(spelling);
            table.symbols[id.0 as usize].reserved = Some(*kind);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    pub fn name(&self, id: SymbolId) -> &str {
        self.get(id).name()
    }

    /// Intern `name`, returning the existing symbol when the exact byte
    /// content was seen before.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        let hash = hash64(name.as_bytes());
        let mask = self.buckets.len() as u64 - 1;
        let mut cursor = self.buckets[(hash & mask) as usize];
        while let Some(id) = cursor {
            let sym = &self.symbols[id.0 as usize];
            if sym.hash == hash && sym.name == name {
                return id;
            }
            cursor = sym.next_in_bucket;
        }

        if self.symbols.len() >= self.buckets.len() {
            self.grow();
        }
        let mask = self.buckets.len() as u64 - 1;
        let bucket = (hash & mask) as usize;
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            name: name.to_string(),
            hash,
            next_in_bucket: self.buckets[bucket],
            reserved: None,
            meanings: Vec::new(),
        });
        self.buckets[bucket] = Some(id);
        id
    }

    /// Look up without interning.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        let hash = hash64(name.as_bytes());
        let mask = self.buckets.len() as u64 - 1;
        let mut cursor = self.buckets[(hash & mask) as usize];
        while let Some(id) = cursor {
            let sym = &self.symbols[id.0 as usize];
            if sym.hash == hash && sym.name == name {
                return Some(id);
            }
            cursor = sym.next_in_bucket;
        }
        None
    }

    fn grow(&mut self) {
        let new_size = self.buckets.len() * 2;
        let mask = new_size as u64 - 1;
        let mut buckets: Vec<Option<SymbolId>> = vec![None; new_size];
        for (index, sym) in self.symbols.iter_mut().enumerate() {
            let bucket = (sym.hash & mask) as usize;
            sym.next_in_bucket = buckets[bucket];
            buckets[bucket] = Some(SymbolId(index as u32));
        }
        self.buckets = buckets;
    }

    pub fn push_meaning(&mut self, id: SymbolId, info: SymbolInfo) {
        self.get_mut(id).meanings.push(info);
    }

    pub fn pop_meaning(&mut self, id: SymbolId) -> Option<SymbolInfo> {
        self.get_mut(id).meanings.pop()
    }

    /// The innermost meaning of `id`, skipping nothing.
    pub fn meaning(&self, id: SymbolId) -> Option<&SymbolInfo> {
        self.get(id).top()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_identity_on_spelling() {
        let mut t = SymbolTable::new();
        let a = t.intern("value");
        let b = t.intern("value");
        let c = t.intern("Value");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(t.name(a), "value");
    }

    #[test]
    fn reserved_words_are_marked() {
        let t = SymbolTable::new();
        let id = t.lookup("while").unwrap();
        assert_eq!(t.get(id).reserved, Some(TokenKind::While));
        assert!(t.lookup("definitely_not_reserved").is_none());
    }

    #[test]
    fn table_grows_past_initial_size() {
        let mut t = SymbolTable::new();
        let mut ids = Vec::new();
        for i in 0..2000 {
            ids.push(t.intern(&format!("sym_{i}")));
        }
        // All symbols must still resolve to their original ids after the
        // table has doubled several times.
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(t.lookup(&format!("sym_{i}")), Some(*id));
        }
    }

    #[test]
    fn meanings_stack_innermost_last() {
        let mut t = SymbolTable::new();
        let id = t.intern("x");
        t.push_meaning(
            id,
            SymbolInfo {
                kind: SymbolKind::Global,
                num: 7,
                scope: None,
                payload: MeaningPayload::Global {
                    is_private: false,
                    min_args: 0,
                    max_args: 0,
                },
            },
        );
        t.push_meaning(
            id,
            SymbolInfo {
                kind: SymbolKind::Local,
                num: 2,
                scope: None,
                payload: MeaningPayload::Local { block_depth: 1 },
            },
        );
        assert_eq!(t.meaning(id).unwrap().kind, SymbolKind::Local);
        t.pop_meaning(id);
        assert_eq!(t.meaning(id).unwrap().kind, SymbolKind::Global);
    }
}
