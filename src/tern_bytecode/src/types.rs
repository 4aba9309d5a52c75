//! The type arena and per-type member hash tables.
//!
//! Types live in one arena and refer to each other by `TypeId` only;
//! supertype references start out unresolved and are installed by the
//! deferred resolution pass after every module has finished its first
//! compilation pass.
//!
//! Each type owns six member tables, one per (partition, visibility)
//! pair. A table is sized to the smallest power of two that holds its
//! entry count; colliding entries chain from their home slot through
//! separately stored overflow entries.

use bitflags::bitflags;
use tern_syntax::{MemberId, SymbolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TypeId(pub u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemberFlags: u32 {
        /// The entry's item is a global index of an accessor method
        /// rather than an instance slot index.
        const ACCESSOR = 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MemberTableKind {
    MethodPublic = 0,
    MethodPrivate = 1,
    GetterPublic = 2,
    GetterPrivate = 3,
    SetterPublic = 4,
    SetterPrivate = 5,
}

pub const NUM_MEMBER_TABLES: usize = 6;

/// The partitions holding member-variable slot entries.
pub const MEMBER_TABLE_VAR_KINDS: [MemberTableKind; 4] = [
    MemberTableKind::GetterPublic,
    MemberTableKind::GetterPrivate,
    MemberTableKind::SetterPublic,
    MemberTableKind::SetterPrivate,
];

const NO_NEXT: u32 = u32::MAX;

#[derive(Debug, Clone)]
struct MemberSlot {
    key: u32,
    item: u32,
    flags: MemberFlags,
    next: u32,
    used: bool,
}

impl MemberSlot {
    fn empty() -> MemberSlot {
        MemberSlot {
            key: 0,
            item: 0,
            flags: MemberFlags::empty(),
            next: NO_NEXT,
            used: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemberTable {
    home: Vec<MemberSlot>,
    overflow: Vec<MemberSlot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberEntry {
    pub key: MemberId,
    pub item: u32,
    pub flags: MemberFlags,
}

impl MemberTable {
    /// Size the home array for `count` entries.
    pub fn with_capacity(count: usize) -> MemberTable {
        let size = if count == 0 {
            0
        } else {
            count.next_power_of_two()
        };
        MemberTable {
            home: (0..size).map(|_| MemberSlot::empty()).collect(),
            overflow: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.home.iter().filter(|s| s.used).count() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&mut self, key: MemberId, item: u32, flags: MemberFlags) {
        if self.home.is_empty() {
            self.home.push(MemberSlot::empty());
        }
        let bucket = (key.0 as usize) & (self.home.len() - 1);
        if !self.home[bucket].used {
            self.home[bucket] = MemberSlot {
                key: key.0,
                item,
                flags,
                next: NO_NEXT,
                used: true,
            };
            return;
        }
        let overflow_index = self.overflow.len() as u32;
        self.overflow.push(MemberSlot {
            key: key.0,
            item,
            flags,
            next: NO_NEXT,
            used: true,
        });
        // Find the chain tail by index; the tail is either the home slot
        // itself or an overflow cell.
        let mut tail: Option<usize> = None;
        let mut next = self.home[bucket].next;
        while next != NO_NEXT {
            tail = Some(next as usize);
            next = self.overflow[next as usize].next;
        }
        match tail {
            None => self.home[bucket].next = overflow_index,
            Some(i) => self.overflow[i].next = overflow_index,
        }
    }

    /// The first entry for `key` in chain order.
    pub fn lookup(&self, key: MemberId) -> Option<MemberEntry> {
        if self.home.is_empty() {
            return None;
        }
        let bucket = (key.0 as usize) & (self.home.len() - 1);
        let mut slot = &self.home[bucket];
        if !slot.used {
            return None;
        }
        loop {
            if slot.key == key.0 {
                return Some(MemberEntry {
                    key,
                    item: slot.item,
                    flags: slot.flags,
                });
            }
            if slot.next == NO_NEXT {
                return None;
            }
            slot = &self.overflow[slot.next as usize];
        }
    }

    /// Every entry for `key`, in chain order.
    pub fn lookup_all(&self, key: MemberId) -> Vec<MemberEntry> {
        let mut out = Vec::new();
        if self.home.is_empty() {
            return out;
        }
        let bucket = (key.0 as usize) & (self.home.len() - 1);
        let mut slot = &self.home[bucket];
        if !slot.used {
            return out;
        }
        loop {
            if slot.key == key.0 {
                out.push(MemberEntry {
                    key,
                    item: slot.item,
                    flags: slot.flags,
                });
            }
            if slot.next == NO_NEXT {
                return out;
            }
            slot = &self.overflow[slot.next as usize];
        }
    }

    pub fn entries(&self) -> Vec<MemberEntry> {
        let mut out = Vec::new();
        for bucket in 0..self.home.len() {
            if !self.home[bucket].used {
                continue;
            }
            let mut slot = &self.home[bucket];
            loop {
                out.push(MemberEntry {
                    key: MemberId(slot.key),
                    item: slot.item,
                    flags: slot.flags,
                });
                if slot.next == NO_NEXT {
                    break;
                }
                slot = &self.overflow[slot.next as usize];
            }
        }
        out
    }

    /// Add `base` to every slot entry (non-accessor), used once the
    /// supertype is resolved and the inherited slot count is known.
    pub fn adjust_slot_items(&mut self, base: u32) {
        for slot in self.home.iter_mut().chain(self.overflow.iter_mut()) {
            if slot.used && !slot.flags.contains(MemberFlags::ACCESSOR) {
                slot.item += base;
            }
        }
    }

    /// Reorder every chain so that accessor entries precede slot entries
    /// sharing the same key. Run once when the type is finalized;
    /// guarantees that an accessor defined in a subclass shadows an
    /// inherited variable slot.
    pub fn finalize(&mut self) {
        if self.home.is_empty() {
            return;
        }
        for bucket in 0..self.home.len() {
            if !self.home[bucket].used {
                continue;
            }
            let mut chain = Vec::new();
            {
                let mut slot = &self.home[bucket];
                loop {
                    chain.push(slot.clone());
                    if slot.next == NO_NEXT {
                        break;
                    }
                    slot = &self.overflow[slot.next as usize];
                }
            }
            let mut reordered: Vec<MemberSlot> = Vec::with_capacity(chain.len());
            let mut emitted = vec![false; chain.len()];
            for i in 0..chain.len() {
                if emitted[i] {
                    continue;
                }
                let key = chain[i].key;
                for (j, slot) in chain.iter().enumerate() {
                    if !emitted[j] && slot.key == key && slot.flags.contains(MemberFlags::ACCESSOR)
                    {
                        reordered.push(slot.clone());
                        emitted[j] = true;
                    }
                }
                for (j, slot) in chain.iter().enumerate() {
                    if !emitted[j] && slot.key == key {
                        reordered.push(slot.clone());
                        emitted[j] = true;
                    }
                }
            }
            // Rewrite the chain in place: head in the home slot, the rest
            // in their existing overflow cells.
            let mut overflow_cells: Vec<u32> = Vec::new();
            {
                let mut slot = &self.home[bucket];
                while slot.next != NO_NEXT {
                    overflow_cells.push(slot.next);
                    slot = &self.overflow[slot.next as usize];
                }
            }
            let mut head = reordered[0].clone();
            head.next = *overflow_cells.first().unwrap_or(&NO_NEXT);
            self.home[bucket] = head;
            for (i, cell) in overflow_cells.iter().enumerate() {
                let mut entry = reordered[i + 1].clone();
                entry.next = *overflow_cells.get(i + 1).unwrap_or(&NO_NEXT);
                self.overflow[*cell as usize] = entry;
            }
        }
    }
}

/// A supertype reference, possibly not yet resolved. Unresolved entries
/// carry the import context that was active where the class header was
/// parsed so the deferred pass can reactivate it.
#[derive(Debug, Clone)]
pub enum SuperRef {
    None,
    Unresolved(Box<UnresolvedSuper>),
    Resolved(TypeId),
}

#[derive(Debug, Clone)]
pub struct UnresolvedSuper {
    pub super_name: Option<String>,
    pub interface_names: Vec<String>,
    pub imports: Vec<SymbolId>,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub name: String,
    pub sym: Option<SymbolId>,
    tables: [MemberTable; NUM_MEMBER_TABLES],
    pub super_ref: SuperRef,
    pub interfaces: Vec<TypeId>,
    /// Member variable slots declared by this type alone.
    pub num_vars: u32,
    /// Slots including every transitive supertype.
    pub total_num_vars: u32,
    /// Global index of the class constructor, 0 when absent.
    pub create_global: u32,
    /// Global index of the synthetic member initializer, if any.
    pub member_initializer: Option<u32>,
    pub is_interface: bool,
    pub has_finalizer: bool,
    pub ext_data_member: Option<u32>,
    pub super_resolved: bool,
}

impl TypeInfo {
    pub fn new(name: String, sym: Option<SymbolId>, is_interface: bool) -> TypeInfo {
        TypeInfo {
            name,
            sym,
            tables: Default::default(),
            super_ref: SuperRef::None,
            interfaces: Vec::new(),
            num_vars: 0,
            total_num_vars: 0,
            create_global: 0,
            member_initializer: None,
            is_interface,
            has_finalizer: false,
            ext_data_member: None,
            super_resolved: false,
        }
    }

    pub fn table(&self, kind: MemberTableKind) -> &MemberTable {
        &self.tables[kind as usize]
    }

    pub fn table_mut(&mut self, kind: MemberTableKind) -> &mut MemberTable {
        &mut self.tables[kind as usize]
    }

    /// Presize every table from the member counts gathered in pass 1.
    pub fn build_tables(&mut self, counts: [usize; NUM_MEMBER_TABLES]) {
        for (i, count) in counts.iter().enumerate() {
            self.tables[i] = MemberTable::with_capacity(*count);
        }
    }

    pub fn finalize_tables(&mut self) {
        for table in &mut self.tables {
            table.finalize();
        }
    }

    /// Entries for `key` across every partition, for redefinition checks
    /// and the member-table invariant.
    pub fn entries_for_key(&self, key: MemberId) -> Vec<(MemberTableKind, MemberEntry)> {
        const KINDS: [MemberTableKind; NUM_MEMBER_TABLES] = [
            MemberTableKind::MethodPublic,
            MemberTableKind::MethodPrivate,
            MemberTableKind::GetterPublic,
            MemberTableKind::GetterPrivate,
            MemberTableKind::SetterPublic,
            MemberTableKind::SetterPrivate,
        ];
        let mut out = Vec::new();
        for kind in KINDS {
            for entry in self.table(kind).lookup_all(key) {
                out.push((kind, entry));
            }
        }
        out
    }

    pub fn resolved_super(&self) -> Option<TypeId> {
        match self.super_ref {
            SuperRef::Resolved(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeArena {
    types: Vec<TypeInfo>,
}

impl TypeArena {
    pub fn new() -> TypeArena {
        TypeArena::default()
    }

    pub fn alloc(&mut self, info: TypeInfo) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(info);
        id
    }

    pub fn get(&self, id: TypeId) -> &TypeInfo {
        &self.types[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TypeId) -> &mut TypeInfo {
        &mut self.types[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TypeId> {
        (0..self.types.len() as u32).map(TypeId)
    }

    /// The supertype chain starting at `id` itself.
    pub fn chain(&self, id: TypeId) -> Vec<TypeId> {
        let mut out = vec![id];
        let mut cursor = id;
        while let Some(sup) = self.get(cursor).resolved_super() {
            out.push(sup);
            cursor = sup;
        }
        out
    }

    /// Member lookup starting at the deepest subclass and walking the
    /// supertype chain.
    pub fn lookup_member(
        &self,
        id: TypeId,
        kind: MemberTableKind,
        key: MemberId,
    ) -> Option<(TypeId, MemberEntry)> {
        let mut cursor = Some(id);
        while let Some(t) = cursor {
            if let Some(entry) = self.get(t).table(kind).lookup(key) {
                return Some((t, entry));
            }
            cursor = self.get(t).resolved_super();
        }
        None
    }

    /// Subtype test used by `is`, `except` matching and casts; walks the
    /// class chain and each type's transitively implemented interfaces.
    pub fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        let mut cursor = Some(sub);
        while let Some(t) = cursor {
            if t == sup {
                return true;
            }
            for &iface in &self.get(t).interfaces {
                if self.is_subtype(iface, sup) {
                    return true;
                }
            }
            cursor = self.get(t).resolved_super();
        }
        false
    }

    /// Recompute `total_num_vars` from the resolved supertype.
    pub fn update_total_num_vars(&mut self, id: TypeId) {
        let inherited = self
            .get(id)
            .resolved_super()
            .map(|s| self.get(s).total_num_vars)
            .unwrap_or(0);
        let own = self.get(id).num_vars;
        self.get_mut(id).total_num_vars = own + inherited;
    }

    /// Propagate the inherited finalizer and external-data flags.
    pub fn update_inherited_misc(&mut self, id: TypeId) {
        if let Some(sup) = self.get(id).resolved_super() {
            let sup_fin = self.get(sup).has_finalizer;
            let sup_ext = self.get(sup).ext_data_member;
            let t = self.get_mut(id);
            t.has_finalizer |= sup_fin;
            if t.ext_data_member.is_none() {
                t.ext_data_member = sup_ext;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_syntax::members::FIRST_USER_MEMBER;

    fn key(n: u32) -> MemberId {
        MemberId(FIRST_USER_MEMBER + n)
    }

    #[test]
    fn chained_entries_share_their_home_bucket() {
        let mut table = MemberTable::with_capacity(4);
        let size = 4;
        // Two keys that collide modulo the table size.
        let a = MemberId(3);
        let b = MemberId(3 + size);
        table.add(a, 10, MemberFlags::empty());
        table.add(b, 20, MemberFlags::empty());
        assert_eq!(table.lookup(a).unwrap().item, 10);
        assert_eq!(table.lookup(b).unwrap().item, 20);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn finalize_orders_accessors_before_slots() {
        let mut table = MemberTable::with_capacity(2);
        let k = key(0);
        table.add(k, 5, MemberFlags::empty());
        table.add(k, 99, MemberFlags::ACCESSOR);
        table.finalize();
        let first = table.lookup(k).unwrap();
        assert!(first.flags.contains(MemberFlags::ACCESSOR));
        assert_eq!(first.item, 99);
        assert_eq!(table.lookup_all(k).len(), 2);
    }

    #[test]
    fn lookup_walks_the_supertype_chain() {
        let mut arena = TypeArena::new();
        let base = arena.alloc(TypeInfo::new("Base".into(), None, false));
        arena
            .get_mut(base)
            .build_tables([1, 0, 0, 0, 0, 0]);
        arena
            .get_mut(base)
            .table_mut(MemberTableKind::MethodPublic)
            .add(key(1), 42, MemberFlags::empty());
        let derived = arena.alloc(TypeInfo::new("Derived".into(), None, false));
        arena.get_mut(derived).super_ref = SuperRef::Resolved(base);
        let (owner, entry) = arena
            .lookup_member(derived, MemberTableKind::MethodPublic, key(1))
            .unwrap();
        assert_eq!(owner, base);
        assert_eq!(entry.item, 42);
        assert!(arena.is_subtype(derived, base));
        assert!(!arena.is_subtype(base, derived));
    }

    #[test]
    fn total_num_vars_sums_the_chain() {
        let mut arena = TypeArena::new();
        let base = arena.alloc(TypeInfo::new("Base".into(), None, false));
        arena.get_mut(base).num_vars = 2;
        arena.update_total_num_vars(base);
        let derived = arena.alloc(TypeInfo::new("Derived".into(), None, false));
        arena.get_mut(derived).num_vars = 3;
        arena.get_mut(derived).super_ref = SuperRef::Resolved(base);
        arena.update_total_num_vars(derived);
        assert_eq!(arena.get(derived).total_num_vars, 5);
        assert_eq!(
            arena.get(derived).total_num_vars,
            arena.get(derived).num_vars + arena.get(base).total_num_vars
        );
    }
}
