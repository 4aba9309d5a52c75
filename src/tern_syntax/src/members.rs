//! Process-wide dense member ids.
//!
//! Every distinct member name receives one integer id on first reference,
//! in allocation order. Ids 0 to 2 are reserved; the predefined special
//! method names follow so that the runtime can address them without a
//! lookup.

use fxhash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub u32);

pub const MEMBER_NONE: MemberId = MemberId(0);
pub const MEMBER_INITIALIZER: MemberId = MemberId(1);
pub const MEMBER_FINALIZER: MemberId = MemberId(2);
pub const MEMBER_CREATE: MemberId = MemberId(3);
pub const MEMBER_CALL: MemberId = MemberId(4);
pub const MEMBER_ADD: MemberId = MemberId(5);
pub const MEMBER_SUB: MemberId = MemberId(6);
pub const MEMBER_MUL: MemberId = MemberId(7);
pub const MEMBER_DIV: MemberId = MemberId(8);
pub const MEMBER_IDIV: MemberId = MemberId(9);
pub const MEMBER_MOD: MemberId = MemberId(10);
pub const MEMBER_POW: MemberId = MemberId(11);
pub const MEMBER_EQ: MemberId = MemberId(12);
pub const MEMBER_LT: MemberId = MemberId(13);
pub const MEMBER_GT: MemberId = MemberId(14);
pub const MEMBER_GET_ITEM: MemberId = MemberId(15);
pub const MEMBER_SET_ITEM: MemberId = MemberId(16);
pub const MEMBER_NEG: MemberId = MemberId(17);
pub const MEMBER_IN: MemberId = MemberId(18);
pub const MEMBER_STR: MemberId = MemberId(19);
pub const MEMBER_REPR: MemberId = MemberId(20);
pub const MEMBER_HASH: MemberId = MemberId(21);
pub const MEMBER_ITERATOR: MemberId = MemberId(22);
pub const MEMBER_HAS_NEXT: MemberId = MemberId(23);
pub const MEMBER_NEXT: MemberId = MemberId(24);
pub const MEMBER_LENGTH: MemberId = MemberId(25);
pub const FIRST_USER_MEMBER: u32 = 26;

const PREDEFINED: &[(&str, MemberId)] = &[
    ("create", MEMBER_CREATE),
    ("_call", MEMBER_CALL),
    ("_add", MEMBER_ADD),
    ("_sub", MEMBER_SUB),
    ("_mul", MEMBER_MUL),
    ("_div", MEMBER_DIV),
    ("_idiv", MEMBER_IDIV),
    ("_mod", MEMBER_MOD),
    ("_pow", MEMBER_POW),
    ("_eq", MEMBER_EQ),
    ("_lt", MEMBER_LT),
    ("_gt", MEMBER_GT),
    ("_get", MEMBER_GET_ITEM),
    ("_set", MEMBER_SET_ITEM),
    ("_neg", MEMBER_NEG),
    ("_in", MEMBER_IN),
    ("_str", MEMBER_STR),
    ("_repr", MEMBER_REPR),
    ("_hash", MEMBER_HASH),
    ("iterator", MEMBER_ITERATOR),
    ("hasNext", MEMBER_HAS_NEXT),
    ("next", MEMBER_NEXT),
    ("length", MEMBER_LENGTH),
];

#[derive(Debug)]
pub struct MemberNames {
    ids: FxHashMap<String, MemberId>,
    names: Vec<String>,
}

impl Default for MemberNames {
    fn default() -> Self {
        Self::new()
    }
}

impl MemberNames {
    pub fn new() -> MemberNames {
        let mut names = vec![String::new(); FIRST_USER_MEMBER as usize];
        names[MEMBER_NONE.0 as usize] = "<none>".to_string();
        names[MEMBER_INITIALIZER.0 as usize] = "#i".to_string();
        names[MEMBER_FINALIZER.0 as usize] = "#f".to_string();
        let mut ids = FxHashMap::default();
        for (name, id) in PREDEFINED {
            names[id.0 as usize] = (*name).to_string();
            ids.insert((*name).to_string(), *id);
        }
        MemberNames { ids, names }
    }

    /// The id of `name`, assigning the next dense id on first reference.
    pub fn intern(&mut self, name: &str) -> MemberId {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = MemberId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, name: &str) -> Option<MemberId> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: MemberId) -> &str {
        &self.names[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Snapshot of all names in id order, for the compiled program.
    pub fn to_vec(&self) -> Vec<String> {
        self.names.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_ids_are_stable() {
        let mut m = MemberNames::new();
        assert_eq!(m.intern("create"), MEMBER_CREATE);
        assert_eq!(m.intern("_eq"), MEMBER_EQ);
        assert_eq!(m.intern("hasNext"), MEMBER_HAS_NEXT);
    }

    #[test]
    fn user_members_are_dense_in_first_reference_order() {
        let mut m = MemberNames::new();
        let a = m.intern("alpha");
        let b = m.intern("beta");
        assert_eq!(a.0, FIRST_USER_MEMBER);
        assert_eq!(b.0, FIRST_USER_MEMBER + 1);
        assert_eq!(m.intern("alpha"), a);
        assert_eq!(m.name(b), "beta");
    }
}
