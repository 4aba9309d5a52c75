//! The generational heap.
//!
//! Fresh allocations go to the nursery; objects above the big-block
//! threshold go straight to the old generation flagged new until their
//! first collection. A minor collection retires live nursery objects
//! into the old generation, leaving forwarding entries behind and
//! rewriting every recorded reference. The old generation is collected
//! by an incremental mark-sweep whose work is metered against
//! allocation, with a write barrier feeding both the minor root set and
//! the untraced set retraced during an incremental mark.
//!
//! The heap never walks roots itself; the owning runtime feeds them in
//! through `forward` (minor) and `mark_value` (major).

use log::{debug, trace};

use crate::value::{Gen, HeapObject, ObjectHandle, Value};

/// Allocation-unit threshold above which an object bypasses the nursery.
pub const MIN_BIG_BLOCK_UNITS: usize = 64;

/// Allocation units per incremental work quantum.
pub const INCREMENTALITY: usize = 512;

/// Old-generation growth factor that triggers an incremental collection.
const GROWTH_FACTOR: usize = 2;

const NURSERY_INITIAL: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Idle,
    Mark,
    Sweep,
}

#[derive(Debug)]
enum NurserySlot {
    Obj(HeapObject),
    Forwarded(u32),
    Taken,
}

#[derive(Debug)]
struct OldSlot {
    obj: Option<HeapObject>,
    new_gen: bool,
}

#[derive(Debug)]
pub struct Heap {
    nursery: Vec<NurserySlot>,
    nursery_capacity: usize,
    old: Vec<OldSlot>,
    free_list: Vec<u32>,
    marks: Vec<u64>,

    pub phase: GcPhase,
    mark_stack: Vec<u32>,
    untraced: Vec<Value>,
    sweep_pos: usize,
    last_live_units: usize,
    old_units: usize,
    allocated_since_trigger: usize,
    work_debt: usize,

    /// Pins the heap across multi-step operations; while non-zero no
    /// incremental old-generation work runs.
    pub disallow_count: u32,

    /// Write-barrier lists: the slots written (old index, field index)
    /// and, in parallel, the values written.
    pub new_ref_ptrs: Vec<(u32, u32)>,
    pub new_ref_values: Vec<Value>,
    /// Set when a collection was aborted and the barrier lists may point
    /// at stale memory; only a forced full collection recovers.
    pub barrier_invalid: bool,

    finalizer_nursery: Vec<u32>,
    finalizer_old: Vec<u32>,
    /// Dead finalizable instances waiting for the interpreter to run
    /// their finalizers at its next safe point.
    pub pending_finalizers: Vec<ObjectHandle>,

    copy_queue: Vec<u32>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            nursery: Vec::new(),
            nursery_capacity: NURSERY_INITIAL,
            old: Vec::new(),
            free_list: Vec::new(),
            marks: Vec::new(),
            phase: GcPhase::Idle,
            mark_stack: Vec::new(),
            untraced: Vec::new(),
            sweep_pos: 0,
            last_live_units: NURSERY_INITIAL,
            old_units: 0,
            allocated_since_trigger: 0,
            work_debt: 0,
            disallow_count: 0,
            new_ref_ptrs: Vec::new(),
            new_ref_values: Vec::new(),
            barrier_invalid: false,
            finalizer_nursery: Vec::new(),
            finalizer_old: Vec::new(),
            pending_finalizers: Vec::new(),
            copy_queue: Vec::new(),
        }
    }

    // ----- allocation -----

    pub fn alloc(&mut self, obj: HeapObject, finalizable: bool) -> ObjectHandle {
        let units = obj.size_units();
        self.allocated_since_trigger += units;
        if units >= MIN_BIG_BLOCK_UNITS {
            let index = self.push_old(obj, true);
            if finalizable {
                self.finalizer_old.push(index);
            }
            return ObjectHandle::old(index);
        }
        let index = self.nursery.len() as u32;
        self.nursery.push(NurserySlot::Obj(obj));
        if finalizable {
            self.finalizer_nursery.push(index);
        }
        ObjectHandle::nursery(index)
    }

    /// Allocate directly in the old generation; compile-time objects and
    /// the preallocated out-of-memory exception are unmovable.
    pub fn alloc_unmovable(&mut self, obj: HeapObject) -> ObjectHandle {
        let index = self.push_old(obj, false);
        ObjectHandle::old(index)
    }

    fn push_old(&mut self, obj: HeapObject, new_gen: bool) -> u32 {
        self.old_units += obj.size_units();
        let index = match self.free_list.pop() {
            Some(i) => {
                self.old[i as usize] = OldSlot {
                    obj: Some(obj),
                    new_gen,
                };
                i
            }
            None => {
                self.old.push(OldSlot {
                    obj: Some(obj),
                    new_gen,
                });
                let i = (self.old.len() - 1) as u32;
                if self.marks.len() * 64 < self.old.len() {
                    self.marks.push(0);
                }
                i
            }
        };
        // Objects born during an incremental mark start out marked.
        if self.phase == GcPhase::Mark {
            self.set_mark(index);
        }
        index
    }

    pub fn nursery_full(&self) -> bool {
        self.nursery.len() >= self.nursery_capacity
    }

    pub fn grow_nursery(&mut self) {
        self.nursery_capacity *= 2;
        debug!("nursery grown to {} slots", self.nursery_capacity);
    }

    // ----- access -----

    pub fn get(&self, h: ObjectHandle) -> &HeapObject {
        match h.generation {
            Gen::Nursery => match &self.nursery[h.index as usize] {
                NurserySlot::Obj(o) => o,
                _ => panic!("access to a moved nursery object"),
            },
            Gen::Old => self.old[h.index as usize]
                .obj
                .as_ref()
                .expect("access to a freed object"),
        }
    }

    pub fn get_mut(&mut self, h: ObjectHandle) -> &mut HeapObject {
        match h.generation {
            Gen::Nursery => match &mut self.nursery[h.index as usize] {
                NurserySlot::Obj(o) => o,
                _ => panic!("access to a moved nursery object"),
            },
            Gen::Old => self.old[h.index as usize]
                .obj
                .as_mut()
                .expect("access to a freed object"),
        }
    }

    pub fn is_live(&self, h: ObjectHandle) -> bool {
        match h.generation {
            Gen::Nursery => matches!(self.nursery.get(h.index as usize), Some(NurserySlot::Obj(_))),
            Gen::Old => self
                .old
                .get(h.index as usize)
                .map(|s| s.obj.is_some())
                .unwrap_or(false),
        }
    }

    // ----- the write barrier -----

    /// Record a store of `value` into field `field` of `target`. Old to
    /// new references land on the barrier lists; during a mark phase the
    /// value joins the untraced set so the marker retraces it.
    pub fn record_write(&mut self, target: ObjectHandle, field: u32, value: Value) {
        if target.generation == Gen::Old {
            if let Value::Obj(h) = value {
                if h.generation == Gen::Nursery {
                    self.new_ref_ptrs.push((target.index, field));
                    self.new_ref_values.push(value);
                }
            }
            if self.phase == GcPhase::Mark {
                self.untraced.push(value);
            }
        }
    }

    // ----- minor collection -----

    /// Rewrite a root slot, retiring the referenced nursery object.
    pub fn forward(&mut self, v: &mut Value) {
        if let Value::Obj(h) = v {
            if h.generation == Gen::Nursery {
                let ni = self.copy_out(h.index);
                *v = Value::Obj(ObjectHandle::old(ni));
            }
        }
    }

    fn copy_out(&mut self, i: u32) -> u32 {
        match &self.nursery[i as usize] {
            NurserySlot::Forwarded(ni) => *ni,
            NurserySlot::Taken => panic!("copy of a taken nursery slot"),
            NurserySlot::Obj(_) => {
                let slot = std::mem::replace(&mut self.nursery[i as usize], NurserySlot::Taken);
                let obj = match slot {
                    NurserySlot::Obj(o) => o,
                    _ => unreachable!(),
                };
                let ni = self.push_old(obj, false);
                self.nursery[i as usize] = NurserySlot::Forwarded(ni);
                self.copy_queue.push(ni);
                ni
            }
        }
    }

    /// Seed the minor collection: every old object still flagged new has
    /// its fields treated as part of the nursery root set.
    pub fn begin_minor(&mut self) {
        for i in 0..self.old.len() {
            if self.old[i].new_gen && self.old[i].obj.is_some() {
                self.copy_queue.push(i as u32);
            }
        }
        // The barrier value list is a root set contribution; the owner
        // forwards it and replays the pointer list afterwards.
    }

    /// Scan the fields of every object copied so far, copying whatever
    /// they reach.
    pub fn drain_copy_queue(&mut self) {
        while let Some(oi) = self.copy_queue.pop() {
            let mut obj = self.old[oi as usize].obj.take().expect("queued slot is free");
            obj.for_each_value(|v| self.forward(v));
            self.old[oi as usize].obj = Some(obj);
        }
    }

    /// Replay the write-barrier pointer list, rewriting the recorded
    /// old-generation slots to the moved locations.
    pub fn replay_barrier(&mut self) {
        let ptrs = std::mem::take(&mut self.new_ref_ptrs);
        for (index, field) in ptrs {
            let mut obj = match self.old[index as usize].obj.take() {
                Some(o) => o,
                None => continue,
            };
            let mut n = 0u32;
            obj.for_each_value(|v| {
                if n == field {
                    self.forward(v);
                }
                n += 1;
            });
            self.old[index as usize].obj = Some(obj);
        }
    }

    /// Promote surviving finalizable instances to the old queue; dead
    /// ones are resurrected long enough for the interpreter to run
    /// their finalizers.
    pub fn promote_finalizers(&mut self) {
        let queue = std::mem::take(&mut self.finalizer_nursery);
        for i in queue {
            match &self.nursery[i as usize] {
                NurserySlot::Forwarded(ni) => {
                    self.finalizer_old.push(*ni);
                }
                NurserySlot::Obj(_) => {
                    let ni = self.copy_out(i);
                    self.drain_copy_queue();
                    self.pending_finalizers.push(ObjectHandle::old(ni));
                }
                NurserySlot::Taken => {}
            }
        }
    }

    /// Finish the minor collection: reset the nursery, clear the new
    /// flags and the barrier lists.
    pub fn finish_minor(&mut self) {
        let survived = self.nursery.len();
        self.nursery.clear();
        if survived >= self.nursery_capacity {
            self.grow_nursery();
        }
        for slot in &mut self.old {
            slot.new_gen = false;
        }
        self.new_ref_ptrs.clear();
        self.new_ref_values.clear();
        self.barrier_invalid = false;
        trace!("minor collection done, {survived} nursery slots scanned");
    }

    pub fn nursery_is_empty(&self) -> bool {
        self.nursery.is_empty()
    }

    // ----- incremental mark-sweep -----

    fn mark_bit(&self, i: u32) -> bool {
        self.marks[(i / 64) as usize] & (1 << (i % 64)) != 0
    }

    fn set_mark(&mut self, i: u32) {
        while self.marks.len() * 64 <= i as usize {
            self.marks.push(0);
        }
        self.marks[(i / 64) as usize] |= 1 << (i % 64);
    }

    fn clear_mark(&mut self, i: u32) {
        self.marks[(i / 64) as usize] &= !(1 << (i % 64));
    }

    /// Whether enough allocation has happened to owe collection work.
    pub fn should_start_major(&self) -> bool {
        self.phase == GcPhase::Idle
            && self.disallow_count == 0
            && self.old_units > GROWTH_FACTOR * self.last_live_units
    }

    pub fn begin_major(&mut self) {
        debug!(
            "incremental mark begins ({} old units, {} last live)",
            self.old_units, self.last_live_units
        );
        self.phase = GcPhase::Mark;
        self.mark_stack.clear();
        for w in &mut self.marks {
            *w = 0;
        }
        self.sweep_pos = 0;
    }

    /// Add a root to the major collection's mark stack.
    pub fn mark_value(&mut self, v: Value) {
        if let Value::Obj(h) = v {
            if h.generation == Gen::Old
                && self.old[h.index as usize].obj.is_some()
                && !self.mark_bit(h.index)
            {
                self.set_mark(h.index);
                self.mark_stack.push(h.index);
            }
        }
    }

    /// One bounded quantum of collection work. Returns true while more
    /// work remains.
    pub fn major_step(&mut self, mut budget: usize) -> bool {
        match self.phase {
            GcPhase::Idle => false,
            GcPhase::Mark => {
                while budget > 0 {
                    if let Some(i) = self.mark_stack.pop() {
                        let mut obj = match self.old[i as usize].obj.take() {
                            Some(o) => o,
                            None => continue,
                        };
                        budget = budget.saturating_sub(obj.size_units());
                        let mut reached: Vec<Value> = Vec::new();
                        obj.for_each_value(|v| reached.push(*v));
                        self.old[i as usize].obj = Some(obj);
                        for v in reached {
                            self.mark_value(v);
                        }
                    } else if let Some(v) = self.untraced.pop() {
                        // Objects written to since mark began are
                        // retraced from the untraced set.
                        budget = budget.saturating_sub(1);
                        self.mark_value(v);
                    } else {
                        self.phase = GcPhase::Sweep;
                        self.sweep_pos = 0;
                        debug!("mark complete, sweeping");
                        break;
                    }
                }
                true
            }
            GcPhase::Sweep => {
                while budget > 0 && self.sweep_pos < self.old.len() {
                    let i = self.sweep_pos as u32;
                    self.sweep_pos += 1;
                    budget -= 1;
                    let occupied = self.old[i as usize].obj.is_some();
                    if !occupied {
                        continue;
                    }
                    if self.mark_bit(i) {
                        self.clear_mark(i);
                        continue;
                    }
                    if self.old[i as usize].new_gen {
                        continue;
                    }
                    if let Some(pos) = self.finalizer_old.iter().position(|&f| f == i) {
                        // Finalizer runs before the slot is freed; keep
                        // the object until the interpreter drains it.
                        self.finalizer_old.swap_remove(pos);
                        self.pending_finalizers.push(ObjectHandle::old(i));
                        continue;
                    }
                    self.free_slot(i);
                }
                if self.sweep_pos >= self.old.len() {
                    self.phase = GcPhase::Idle;
                    self.last_live_units = self.old_units;
                    self.allocated_since_trigger = 0;
                    debug!("sweep complete, {} live units", self.old_units);
                    return false;
                }
                true
            }
        }
    }

    pub fn free_slot(&mut self, i: u32) {
        if let Some(obj) = self.old[i as usize].obj.take() {
            self.old_units -= obj.size_units();
            self.free_list.push(i);
        }
    }

    /// Allocation-driven pacing: one quantum of work per
    /// `INCREMENTALITY` units allocated.
    pub fn owed_work(&mut self) -> usize {
        if self.disallow_count > 0 {
            return 0;
        }
        self.work_debt += self.allocated_since_trigger;
        self.allocated_since_trigger = 0;
        let quanta = self.work_debt / INCREMENTALITY;
        self.work_debt %= INCREMENTALITY;
        quanta * INCREMENTALITY
    }

    /// Run the current collection to completion (mark drain plus a full
    /// sweep) in one pass.
    pub fn drain_major(&mut self) {
        while self.major_step(usize::MAX) {}
    }

    /// Every mark bit must be clear outside a collection; the sweep
    /// clears the bits of live objects as it passes them.
    #[cfg(test)]
    pub fn all_marks_clear(&self) -> bool {
        self.marks.iter().all(|w| *w == 0)
    }

    #[cfg(test)]
    pub fn old_len(&self) -> usize {
        self.old.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_str(s: &str) -> HeapObject {
        HeapObject::Str(s.to_string())
    }

    #[test]
    fn small_objects_go_to_the_nursery() {
        let mut heap = Heap::new();
        let h = heap.alloc(small_str("x"), false);
        assert_eq!(h.generation, Gen::Nursery);
        let big = HeapObject::Array(vec![Value::Nil; 200]);
        let h2 = heap.alloc(big, false);
        assert_eq!(h2.generation, Gen::Old);
    }

    #[test]
    fn minor_collection_retires_reachable_objects() {
        let mut heap = Heap::new();
        let a = heap.alloc(small_str("live"), false);
        let _dead = heap.alloc(small_str("dead"), false);
        let mut root = Value::Obj(a);
        heap.begin_minor();
        heap.forward(&mut root);
        heap.drain_copy_queue();
        heap.replay_barrier();
        heap.promote_finalizers();
        heap.finish_minor();
        let h = root.handle().unwrap();
        assert_eq!(h.generation, Gen::Old);
        assert!(matches!(heap.get(h), HeapObject::Str(s) if s == "live"));
        assert!(heap.nursery_is_empty());
    }

    #[test]
    fn minor_collection_rewrites_interior_references() {
        let mut heap = Heap::new();
        let inner = heap.alloc(small_str("inner"), false);
        let outer = heap.alloc(HeapObject::Pair(Value::Obj(inner), Value::Int(1)), false);
        let mut root = Value::Obj(outer);
        heap.begin_minor();
        heap.forward(&mut root);
        heap.drain_copy_queue();
        heap.finish_minor();
        let outer = root.handle().unwrap();
        match heap.get(outer) {
            HeapObject::Pair(Value::Obj(h), _) => {
                assert_eq!(h.generation, Gen::Old);
                assert!(matches!(heap.get(*h), HeapObject::Str(s) if s == "inner"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn write_barrier_keeps_old_to_new_references_alive() {
        let mut heap = Heap::new();
        let old = heap.alloc_unmovable(HeapObject::Cell(Value::Nil));
        let young = heap.alloc(small_str("young"), false);
        // Store young into the old cell, with the barrier.
        if let HeapObject::Cell(v) = heap.get_mut(old) {
            *v = Value::Obj(young);
        }
        heap.record_write(old, 0, Value::Obj(young));
        assert_eq!(heap.new_ref_ptrs.len(), 1);
        assert_eq!(heap.new_ref_values.len(), 1);

        // Minor collection with no other roots: the barrier value list
        // is the root set.
        heap.begin_minor();
        let mut values = std::mem::take(&mut heap.new_ref_values);
        for v in &mut values {
            heap.forward(v);
        }
        heap.drain_copy_queue();
        heap.replay_barrier();
        heap.promote_finalizers();
        heap.finish_minor();

        match heap.get(old) {
            HeapObject::Cell(Value::Obj(h)) => {
                assert_eq!(h.generation, Gen::Old);
                assert!(matches!(heap.get(*h), HeapObject::Str(s) if s == "young"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn major_collection_frees_unreachable_old_objects() {
        let mut heap = Heap::new();
        let live = heap.alloc_unmovable(small_str("live"));
        let dead = heap.alloc_unmovable(small_str("dead"));
        heap.begin_major();
        heap.mark_value(Value::Obj(live));
        heap.drain_major();
        assert!(heap.is_live(live));
        assert!(!heap.is_live(dead));
        // After a collection every mark bit is clear again.
        assert!(heap.all_marks_clear());
    }

    #[test]
    fn objects_written_during_mark_are_retraced() {
        let mut heap = Heap::new();
        let holder = heap.alloc_unmovable(HeapObject::Cell(Value::Nil));
        let target = heap.alloc_unmovable(small_str("stored later"));
        heap.begin_major();
        heap.mark_value(Value::Obj(holder));
        // Mutator stores a reference mid-mark; the barrier queues it
        // into the untraced set.
        if let HeapObject::Cell(v) = heap.get_mut(holder) {
            *v = Value::Obj(target);
        }
        heap.record_write(holder, 0, Value::Obj(target));
        heap.drain_major();
        assert!(heap.is_live(target));
    }

    #[test]
    fn dead_finalizable_objects_queue_their_finalizers() {
        let mut heap = Heap::new();
        let inst = heap.alloc(
            HeapObject::Instance {
                type_id: tern_bytecode::TypeId(0),
                slots: vec![Value::Nil],
            },
            true,
        );
        let _ = inst;
        heap.begin_minor();
        heap.drain_copy_queue();
        heap.replay_barrier();
        heap.promote_finalizers();
        heap.finish_minor();
        assert_eq!(heap.pending_finalizers.len(), 1);
    }
}
