//! Operator semantics: arithmetic with long-integer promotion, value
//! equality and ordering, containment, type tests and indexing. Class
//! instances dispatch to their operator methods (`_add`, `_eq`, ...).

use tern_syntax::members::{
    MEMBER_ADD, MEMBER_DIV, MEMBER_EQ, MEMBER_GET_ITEM, MEMBER_GT, MEMBER_IDIV, MEMBER_IN,
    MEMBER_LT, MEMBER_MOD, MEMBER_MUL, MEMBER_NEG, MEMBER_POW, MEMBER_SET_ITEM, MEMBER_SUB,
};
use tern_syntax::MemberId;

use crate::exceptions::Pending;
use crate::value::{HeapObject, Value};
use crate::vm::Vm;

/// Normalize an i128 back into the short carrier when it fits.
fn norm_long(vm: &mut Vm, v: i128) -> Value {
    if let Ok(short) = i64::try_from(v) {
        Value::Int(short)
    } else {
        vm.alloc_value(HeapObject::LongInt(v))
    }
}

impl Vm {
    fn wide_int(&self, v: Value) -> Option<i128> {
        match v {
            Value::Int(n) => Some(n as i128),
            Value::Obj(h) => match self.heap.get(h) {
                HeapObject::LongInt(n) => Some(*n),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_float(&self, v: Value) -> Option<f64> {
        match v {
            Value::Int(n) => Some(n as f64),
            Value::Float(f) => Some(f),
            Value::Obj(h) => match self.heap.get(h) {
                HeapObject::LongInt(n) => Some(*n as f64),
                _ => None,
            },
            _ => None,
        }
    }

    fn is_instance(&self, v: Value) -> bool {
        matches!(
            v.handle().map(|h| self.heap.get(h)),
            Some(HeapObject::Instance { .. })
        )
    }

    fn binop_error(&self, op: &str, a: Value, b: Value) -> Pending {
        self.type_error(&format!(
            "unsupported operand types for {} ({} and {})",
            op,
            self.program.types.get(self.type_of(a)).name,
            self.program.types.get(self.type_of(b)).name
        ))
    }

    pub(crate) fn op_add(&mut self, a: Value, b: Value) -> Result<Value, Pending> {
        if let (Value::Int(x), Value::Int(y)) = (a, b) {
            return Ok(match x.checked_add(y) {
                Some(v) => Value::Int(v),
                None => norm_long(self, x as i128 + y as i128),
            });
        }
        if let (Some(x), Some(y)) = (self.wide_int(a), self.wide_int(b)) {
            return Ok(norm_long(self, x + y));
        }
        if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
            if let (Some(x), Some(y)) = (self.as_float(a), self.as_float(b)) {
                return Ok(Value::Float(x + y));
            }
        }
        if let (Some(x), Some(y)) = (self.string_value(a), self.string_value(b)) {
            return Ok(self.alloc_value(HeapObject::Str(x + &y)));
        }
        let arrays = (
            a.handle().map(|h| self.heap.get(h).clone()),
            b.handle().map(|h| self.heap.get(h).clone()),
        );
        if let (Some(HeapObject::Array(mut x)), Some(HeapObject::Array(y))) = arrays {
            x.extend(y);
            return Ok(self.alloc_value(HeapObject::Array(x)));
        }
        if self.is_instance(a) {
            return self.call_method_sync(a, MEMBER_ADD, &[b]);
        }
        Err(self.binop_error("+", a, b))
    }

    pub(crate) fn op_sub(&mut self, a: Value, b: Value) -> Result<Value, Pending> {
        if let (Value::Int(x), Value::Int(y)) = (a, b) {
            return Ok(match x.checked_sub(y) {
                Some(v) => Value::Int(v),
                None => norm_long(self, x as i128 - y as i128),
            });
        }
        if let (Some(x), Some(y)) = (self.wide_int(a), self.wide_int(b)) {
            return Ok(norm_long(self, x - y));
        }
        if let (Some(x), Some(y)) = (self.as_float(a), self.as_float(b)) {
            if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
                return Ok(Value::Float(x - y));
            }
        }
        if self.is_instance(a) {
            return self.call_method_sync(a, MEMBER_SUB, &[b]);
        }
        Err(self.binop_error("-", a, b))
    }

    pub(crate) fn op_mul(&mut self, a: Value, b: Value) -> Result<Value, Pending> {
        if let (Value::Int(x), Value::Int(y)) = (a, b) {
            return Ok(match x.checked_mul(y) {
                Some(v) => Value::Int(v),
                None => norm_long(self, x as i128 * y as i128),
            });
        }
        if let (Some(x), Some(y)) = (self.wide_int(a), self.wide_int(b)) {
            return match x.checked_mul(y) {
                Some(v) => Ok(norm_long(self, v)),
                None => Err(self.arithmetic_error("integer overflow")),
            };
        }
        if let (Some(x), Some(y)) = (self.as_float(a), self.as_float(b)) {
            if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
                return Ok(Value::Float(x * y));
            }
        }
        // A string or array repeated an integral number of times.
        if let (Some(s), Value::Int(n)) = (self.string_value(a), b) {
            if n >= 0 {
                return Ok(self.alloc_value(HeapObject::Str(s.repeat(n as usize))));
            }
        }
        if self.is_instance(a) {
            return self.call_method_sync(a, MEMBER_MUL, &[b]);
        }
        Err(self.binop_error("*", a, b))
    }

    pub(crate) fn op_div(&mut self, a: Value, b: Value) -> Result<Value, Pending> {
        if self.is_instance(a) {
            return self.call_method_sync(a, MEMBER_DIV, &[b]);
        }
        let (Some(x), Some(y)) = (self.as_float(a), self.as_float(b)) else {
            return Err(self.binop_error("/", a, b));
        };
        if y == 0.0 && !matches!(a, Value::Float(_)) && !matches!(b, Value::Float(_)) {
            return Err(self.arithmetic_error("division by zero"));
        }
        Ok(Value::Float(x / y))
    }

    pub(crate) fn op_int_div(&mut self, a: Value, b: Value) -> Result<Value, Pending> {
        if let (Some(x), Some(y)) = (self.wide_int(a), self.wide_int(b)) {
            if y == 0 {
                return Err(self.arithmetic_error("integer division by zero"));
            }
            return Ok(norm_long(self, x.div_euclid(y)));
        }
        if let (Some(x), Some(y)) = (self.as_float(a), self.as_float(b)) {
            if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
                return Ok(Value::Float((x / y).floor()));
            }
        }
        if self.is_instance(a) {
            return self.call_method_sync(a, MEMBER_IDIV, &[b]);
        }
        Err(self.binop_error("div", a, b))
    }

    pub(crate) fn op_mod(&mut self, a: Value, b: Value) -> Result<Value, Pending> {
        if let (Some(x), Some(y)) = (self.wide_int(a), self.wide_int(b)) {
            if y == 0 {
                return Err(self.arithmetic_error("integer modulo by zero"));
            }
            return Ok(norm_long(self, x.rem_euclid(y)));
        }
        if self.is_instance(a) {
            return self.call_method_sync(a, MEMBER_MOD, &[b]);
        }
        Err(self.binop_error("mod", a, b))
    }

    pub(crate) fn op_pow(&mut self, a: Value, b: Value) -> Result<Value, Pending> {
        if let (Some(x), Some(y)) = (self.wide_int(a), self.wide_int(b)) {
            if y >= 0 {
                let exp = u32::try_from(y)
                    .map_err(|_| self.arithmetic_error("exponent too large"))?;
                return match x.checked_pow(exp) {
                    Some(v) => Ok(norm_long(self, v)),
                    None => Err(self.arithmetic_error("integer overflow")),
                };
            }
            return Ok(Value::Float((x as f64).powf(y as f64)));
        }
        if let (Some(x), Some(y)) = (self.as_float(a), self.as_float(b)) {
            return Ok(Value::Float(x.powf(y)));
        }
        if self.is_instance(a) {
            return self.call_method_sync(a, MEMBER_POW, &[b]);
        }
        Err(self.binop_error("**", a, b))
    }

    pub(crate) fn op_neg(&mut self, a: Value) -> Result<Value, Pending> {
        match a {
            Value::Int(n) => Ok(match n.checked_neg() {
                Some(v) => Value::Int(v),
                None => norm_long(self, -(n as i128)),
            }),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => {
                if let Some(x) = self.wide_int(a) {
                    return Ok(norm_long(self, -x));
                }
                if self.is_instance(a) {
                    return self.call_method_sync(a, MEMBER_NEG, &[]);
                }
                Err(self.type_error("bad operand for unary minus"))
            }
        }
    }

    /// Structural equality. A nil left operand never dispatches to a
    /// user `_eq` method.
    pub(crate) fn value_eq(&mut self, a: Value, b: Value) -> Result<bool, Pending> {
        if a.is_nil() {
            return Ok(b.is_nil());
        }
        match (a, b) {
            (Value::Int(_), _) | (_, Value::Int(_)) | (Value::Float(_), Value::Float(_)) => {
                if let (Some(x), Some(y)) = (self.wide_int(a), self.wide_int(b)) {
                    return Ok(x == y);
                }
                if let (Some(x), Some(y)) = (self.as_float(a), self.as_float(b)) {
                    return Ok(x == y);
                }
                Ok(false)
            }
            (Value::True, v) | (v, Value::True) => Ok(matches!(v, Value::True)),
            (Value::False, v) | (v, Value::False) => Ok(matches!(v, Value::False)),
            (Value::Default, v) | (v, Value::Default) => Ok(matches!(v, Value::Default)),
            (Value::Function(x), Value::Function(y)) => Ok(x == y),
            (Value::NativeFn(x), Value::NativeFn(y)) => Ok(x == y),
            (Value::Type(x), Value::Type(y)) => Ok(x == y),
            (Value::Obj(ha), Value::Obj(hb)) => {
                if ha == hb {
                    return Ok(true);
                }
                if let (Some(x), Some(y)) = (self.wide_int(a), self.wide_int(b)) {
                    return Ok(x == y);
                }
                if let (Some(x), Some(y)) = (self.string_value(a), self.string_value(b)) {
                    return Ok(x == y);
                }
                let pair = (self.heap.get(ha).clone(), self.heap.get(hb).clone());
                match pair {
                    (HeapObject::Array(xs), HeapObject::Array(ys))
                    | (HeapObject::Tuple(xs), HeapObject::Tuple(ys)) => {
                        if xs.len() != ys.len() {
                            return Ok(false);
                        }
                        for (x, y) in xs.iter().zip(ys.iter()) {
                            if !self.value_eq(*x, *y)? {
                                return Ok(false);
                            }
                        }
                        Ok(true)
                    }
                    (HeapObject::Pair(x1, x2), HeapObject::Pair(y1, y2))
                    | (HeapObject::Range(x1, x2), HeapObject::Range(y1, y2)) => {
                        Ok(self.value_eq(x1, y1)? && self.value_eq(x2, y2)?)
                    }
                    (HeapObject::Instance { type_id, .. }, _) => {
                        if self
                            .lookup_method_entry(type_id, MEMBER_EQ)
                            .is_some()
                        {
                            let r = self.call_method_sync(a, MEMBER_EQ, &[b])?;
                            return Ok(matches!(r, Value::True));
                        }
                        Ok(false)
                    }
                    _ => Ok(false),
                }
            }
            (Value::Obj(ha), _) => {
                if let HeapObject::Instance { type_id, .. } = self.heap.get(ha) {
                    let tid = *type_id;
                    if self.lookup_method_entry(tid, MEMBER_EQ).is_some() {
                        let r = self.call_method_sync(a, MEMBER_EQ, &[b])?;
                        return Ok(matches!(r, Value::True));
                    }
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// `a < b`; the basis for all four orderings.
    pub(crate) fn value_lt(&mut self, a: Value, b: Value) -> Result<bool, Pending> {
        if let (Some(x), Some(y)) = (self.wide_int(a), self.wide_int(b)) {
            return Ok(x < y);
        }
        if let (Some(x), Some(y)) = (self.as_float(a), self.as_float(b)) {
            return Ok(x < y);
        }
        if let (Some(x), Some(y)) = (self.string_value(a), self.string_value(b)) {
            return Ok(x < y);
        }
        if self.is_instance(a) {
            let r = self.call_method_sync(a, MEMBER_LT, &[b])?;
            return r
                .as_bool()
                .ok_or_else(|| self.type_error("_lt must return a boolean"));
        }
        Err(self.binop_error("<", a, b))
    }

    pub(crate) fn value_gt(&mut self, a: Value, b: Value) -> Result<bool, Pending> {
        if self.is_instance(a) {
            let r = self.call_method_sync(a, MEMBER_GT, &[b])?;
            return r
                .as_bool()
                .ok_or_else(|| self.type_error("_gt must return a boolean"));
        }
        self.value_lt(b, a)
    }

    /// `a in b`.
    pub(crate) fn op_in(&mut self, a: Value, b: Value) -> Result<bool, Pending> {
        if let Some(h) = b.handle() {
            match self.heap.get(h).clone() {
                HeapObject::Array(items) | HeapObject::Tuple(items) => {
                    for item in items {
                        if self.value_eq(a, item)? {
                            return Ok(true);
                        }
                    }
                    return Ok(false);
                }
                HeapObject::Range(lo, hi) => {
                    if let (Some(x), Some(l), Some(u)) =
                        (self.wide_int(a), self.wide_int(lo), self.wide_int(hi))
                    {
                        return Ok(l <= x && x < u);
                    }
                    return Ok(false);
                }
                HeapObject::Str(_) | HeapObject::Substr { .. } => {
                    if let (Some(needle), Some(hay)) =
                        (self.string_value(a), self.string_value(b))
                    {
                        return Ok(hay.contains(&needle));
                    }
                    return Err(self.type_error("in expects a string operand"));
                }
                HeapObject::Instance { .. } => {
                    let r = self.call_method_sync(b, MEMBER_IN, &[a])?;
                    return r
                        .as_bool()
                        .ok_or_else(|| self.type_error("_in must return a boolean"));
                }
                _ => {}
            }
        }
        Err(self.binop_error("in", a, b))
    }

    /// `a is T`.
    pub(crate) fn op_is(&mut self, a: Value, b: Value) -> Result<bool, Pending> {
        let Value::Type(t) = b else {
            return Err(self.type_error("is expects a type"));
        };
        if t == self.well_known.object {
            return Ok(true);
        }
        Ok(self.program.types.is_subtype(self.type_of(a), t))
    }

    /// An integral range's bounds, if `v` is one.
    fn range_bounds(&self, v: Value) -> Option<(i64, i64)> {
        match v.handle().map(|h| self.heap.get(h)) {
            Some(HeapObject::Range(Value::Int(l), Value::Int(u))) => Some((*l, *u)),
            _ => None,
        }
    }

    /// Indexed read; strings index by character and slice into views.
    pub(crate) fn index_get(&mut self, base: Value, index: Value) -> Result<Value, Pending> {
        let Some(h) = base.handle() else {
            return Err(self.type_error("value is not indexable"));
        };
        enum Shape {
            Seq(Vec<Value>),
            Text,
            Instance,
            Other,
        }
        let shape = match self.heap.get(h) {
            HeapObject::Array(items) | HeapObject::Tuple(items) => Shape::Seq(items.clone()),
            HeapObject::Str(_) | HeapObject::Substr { .. } => Shape::Text,
            HeapObject::Instance { .. } => Shape::Instance,
            _ => Shape::Other,
        };
        match shape {
            Shape::Seq(items) => {
                if let Value::Int(i) = index {
                    return usize::try_from(i)
                        .ok()
                        .and_then(|i| items.get(i).copied())
                        .ok_or_else(|| self.raise_index_error("index out of range"));
                }
                if let Some((l, u)) = self.range_bounds(index) {
                    let l = l.max(0) as usize;
                    let u = (u.max(0) as usize).min(items.len());
                    let slice = items.get(l..u).unwrap_or(&[]).to_vec();
                    return Ok(self.alloc_value(HeapObject::Array(slice)));
                }
                Err(self.type_error("bad index"))
            }
            Shape::Text => {
                if let Value::Int(i) = index {
                    let text = self.string_value(base).unwrap_or_default();
                    let ch = usize::try_from(i)
                        .ok()
                        .and_then(|i| text.chars().nth(i))
                        .ok_or_else(|| self.raise_index_error("string index out of range"))?;
                    return Ok(self.alloc_value(HeapObject::Str(ch.to_string())));
                }
                if let Some((l, u)) = self.range_bounds(index) {
                    let l = l.max(0) as u32;
                    let len = (u.max(0) as u32).saturating_sub(l);
                    // Slicing a view re-anchors on the underlying string.
                    let (anchor, start) = match self.heap.get(h) {
                        HeapObject::Substr { base, start, .. } => (*base, *start + l),
                        _ => (h, l),
                    };
                    return Ok(self.alloc_value(HeapObject::Substr {
                        base: anchor,
                        start,
                        len,
                    }));
                }
                Err(self.type_error("bad index"))
            }
            Shape::Instance => self.call_method_sync(base, MEMBER_GET_ITEM, &[index]),
            Shape::Other => Err(self.type_error("value is not indexable")),
        }
    }

    pub(crate) fn index_set(
        &mut self,
        base: Value,
        index: Value,
        value: Value,
    ) -> Result<(), Pending> {
        if let Some(h) = base.handle() {
            let is_array = matches!(self.heap.get(h), HeapObject::Array(_));
            if is_array {
                let Value::Int(i) = index else {
                    return Err(self.type_error("bad index"));
                };
                let i = usize::try_from(i)
                    .ok()
                    .ok_or_else(|| self.raise_index_error("index out of range"))?;
                match self.heap.get_mut(h) {
                    HeapObject::Array(items) => {
                        if i >= items.len() {
                            return Err(self.raise_index_error("index out of range"));
                        }
                        items[i] = value;
                    }
                    _ => unreachable!(),
                }
                self.heap.record_write(h, i as u32, value);
                return Ok(());
            }
            if self.is_instance(base) {
                self.call_method_sync(base, MEMBER_SET_ITEM, &[index, value])?;
                return Ok(());
            }
        }
        Err(self.type_error("value does not support indexed assignment"))
    }

    /// Boolean test for branch opcodes; anything but a boolean raises.
    pub(crate) fn truthiness(&self, v: Value) -> Result<bool, Pending> {
        v.as_bool()
            .ok_or_else(|| self.type_error("boolean expected"))
    }

    pub(crate) fn lookup_method_entry(
        &self,
        tid: tern_bytecode::TypeId,
        member: MemberId,
    ) -> Option<u32> {
        use tern_bytecode::MemberTableKind;
        self.program
            .types
            .lookup_member(tid, MemberTableKind::MethodPublic, member)
            .or_else(|| {
                self.program
                    .types
                    .lookup_member(tid, MemberTableKind::MethodPrivate, member)
            })
            .map(|(_, e)| e.item)
    }
}
