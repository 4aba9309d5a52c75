//! The virtual machine: globals, heap, thread state and the collection
//! orchestration. The dispatch loop lives in `interp`, the operator
//! semantics in `ops`.

use fxhash::FxHashMap;
use log::{debug, info};

use tern_bytecode::{FunctionId, GlobalInit, Program, TypeId};

use crate::exceptions::{elide_middle, Pending};
use crate::heap::{GcPhase, Heap, INCREMENTALITY};
use crate::natives::{NativeFn, NATIVE_TABLE};
use crate::value::{HeapObject, ObjectHandle, Value};

#[derive(Debug, Clone)]
pub struct Frame {
    pub func: FunctionId,
    pub ip: usize,
    pub base: usize,
    /// Caller slot receiving the return value.
    pub ret_dst: u32,
    /// The caller's context index at entry; descriptor depths are
    /// relative to this.
    pub ctx_base: u32,
}

/// Per-thread interpreter state. The barrier lists live in the heap;
/// everything else a collection needs from a thread is here.
#[derive(Debug, Default)]
pub struct ThreadState {
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    pub context_index: u32,
}

/// Type ids and exception globals the runtime addresses directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct WellKnown {
    pub object: TypeId,
    pub boolean: TypeId,
    pub int: TypeId,
    pub float: TypeId,
    pub str_: TypeId,
    pub array: TypeId,
    pub tuple: TypeId,
    pub pair: TypeId,
    pub range: TypeId,
    pub function: TypeId,
    pub type_obj: TypeId,
    pub exception: TypeId,
    pub array_iterator: TypeId,
    pub range_iterator: TypeId,
    pub exit_exception: TypeId,
    pub memory_error: TypeId,

    pub value_error_g: u32,
    pub type_error_g: u32,
    pub member_error_g: u32,
    pub arithmetic_error_g: u32,
    pub index_error_g: u32,
    pub cast_error_g: u32,
    pub argument_error_g: u32,
    pub runtime_error_g: u32,
    pub io_error_g: u32,
    pub exit_exception_g: u32,
}

#[derive(Debug, Clone)]
pub struct VmModule {
    pub name: String,
    pub tag: u32,
    pub dynamic: bool,
    /// Modules backed by native code are never reclaimed.
    pub native: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    ExitRequested(i32),
    Uncaught(String),
}

pub struct Vm {
    pub program: Program,
    pub globals: Vec<Value>,
    pub heap: Heap,
    pub thread: ThreadState,
    pub well_known: WellKnown,
    pub(crate) natives: &'static [NativeFn],
    /// Inline caches: (function, call site) to (receiver type, member
    /// table item, accessor flag). Invalidated when a module unloads.
    pub(crate) cache: FxHashMap<(u32, u32), (TypeId, u32, bool)>,
    pub output: Box<dyn std::io::Write>,
    pub modules: Vec<VmModule>,
    preallocated_oom: Value,
}

impl Vm {
    pub fn new(program: Program) -> Vm {
        let mut heap = Heap::new();
        let span = program.globals.index_span();
        let mut globals = vec![Value::Nil; span as usize];
        for (gidx, init) in program.globals.iter() {
            globals[gidx as usize] = match init {
                GlobalInit::Nil => Value::Nil,
                GlobalInit::Bool(b) => Value::from_bool(*b),
                GlobalInit::Int(v) => Value::Int(*v),
                GlobalInit::Float(v) => Value::Float(*v),
                GlobalInit::Str(s) => {
                    Value::Obj(heap.alloc_unmovable(HeapObject::Str(s.clone())))
                }
                GlobalInit::Function(fid) => Value::Function(*fid),
                GlobalInit::Type(tid) => Value::Type(*tid),
                GlobalInit::Native(i) => Value::NativeFn(*i),
            };
        }

        let mut well_known = WellKnown::default();
        for (gidx, init) in program.globals.iter() {
            if let GlobalInit::Type(tid) = init {
                let slot = match program.types.get(*tid).name.as_str() {
                    "Object" => Some(&mut well_known.object),
                    "Boolean" => Some(&mut well_known.boolean),
                    "Int" => Some(&mut well_known.int),
                    "Float" => Some(&mut well_known.float),
                    "Str" => Some(&mut well_known.str_),
                    "Array" => Some(&mut well_known.array),
                    "Tuple" => Some(&mut well_known.tuple),
                    "Pair" => Some(&mut well_known.pair),
                    "Range" => Some(&mut well_known.range),
                    "Function" => Some(&mut well_known.function),
                    "Type" => Some(&mut well_known.type_obj),
                    "Exception" => Some(&mut well_known.exception),
                    "ArrayIterator" => Some(&mut well_known.array_iterator),
                    "RangeIterator" => Some(&mut well_known.range_iterator),
                    "ExitException" => Some(&mut well_known.exit_exception),
                    "MemoryError" => Some(&mut well_known.memory_error),
                    _ => None,
                };
                if let Some(slot) = slot {
                    *slot = *tid;
                }
                let gslot = match program.types.get(*tid).name.as_str() {
                    "ValueError" => Some(&mut well_known.value_error_g),
                    "TypeError" => Some(&mut well_known.type_error_g),
                    "MemberError" => Some(&mut well_known.member_error_g),
                    "ArithmeticError" => Some(&mut well_known.arithmetic_error_g),
                    "IndexError" => Some(&mut well_known.index_error_g),
                    "CastError" => Some(&mut well_known.cast_error_g),
                    "ArgumentError" => Some(&mut well_known.argument_error_g),
                    "RuntimeError" => Some(&mut well_known.runtime_error_g),
                    "IoError" => Some(&mut well_known.io_error_g),
                    "ExitException" => Some(&mut well_known.exit_exception_g),
                    _ => None,
                };
                if let Some(gslot) = gslot {
                    *gslot = gidx;
                }
            }
        }

        // The out-of-memory exception is allocated once, up front, and
        // reused with its traceback cleared.
        let oom_slots = if program.types.is_empty() {
            2
        } else {
            (program.types.get(well_known.memory_error).total_num_vars as usize).max(2)
        };
        let oom = heap.alloc_unmovable(HeapObject::Instance {
            type_id: well_known.memory_error,
            slots: vec![Value::Nil; oom_slots],
        });

        let modules = program
            .modules
            .iter()
            .map(|m| VmModule {
                name: m.name.clone(),
                tag: m.tag,
                dynamic: m.dynamic,
                native: m.native,
            })
            .collect();

        Vm {
            program,
            globals,
            heap,
            thread: ThreadState::default(),
            well_known,
            natives: NATIVE_TABLE,
            cache: FxHashMap::default(),
            output: Box::new(std::io::stdout()),
            modules,
            preallocated_oom: Value::Obj(oom),
        }
    }

    pub fn write_output(&mut self, text: &str) {
        let _ = std::io::Write::write_all(&mut self.output, text.as_bytes());
    }

    // ----- allocation and collection -----

    /// Allocate with a safe point first: a full nursery triggers a minor
    /// collection, and owed incremental work runs.
    pub fn alloc(&mut self, mut obj: HeapObject) -> ObjectHandle {
        if self.heap.nursery_full() && self.heap.disallow_count == 0 {
            // The object being allocated is not yet reachable from any
            // root; forward its fields explicitly.
            self.collect_minor_with_extra(Some(&mut obj));
        }
        self.gc_tick();
        let finalizable = match &obj {
            HeapObject::Instance { type_id, .. } => self.program.types.get(*type_id).has_finalizer,
            _ => false,
        };
        self.heap.alloc(obj, finalizable)
    }

    pub fn alloc_value(&mut self, obj: HeapObject) -> Value {
        Value::Obj(self.alloc(obj))
    }

    /// Run owed incremental mark-sweep quanta, starting a collection
    /// when growth warrants one.
    fn gc_tick(&mut self) {
        if self.heap.disallow_count > 0 {
            return;
        }
        if self.heap.should_start_major() {
            self.heap.begin_major();
            self.mark_roots();
        }
        if self.heap.phase != GcPhase::Idle {
            let work = self.heap.owed_work();
            if work > 0 {
                self.heap.major_step(work.max(INCREMENTALITY));
            }
        }
    }

    fn mark_roots(&mut self) {
        for v in &self.globals {
            self.heap.mark_value(*v);
        }
        for v in &self.thread.stack {
            self.heap.mark_value(*v);
        }
        let untraced: Vec<Value> = self.heap.new_ref_values.clone();
        for v in untraced {
            self.heap.mark_value(v);
        }
    }

    pub fn collect_minor(&mut self) {
        self.collect_minor_with_extra(None);
    }

    fn collect_minor_with_extra(&mut self, extra: Option<&mut HeapObject>) {
        debug!("minor collection");
        self.heap.begin_minor();
        let mut globals = std::mem::take(&mut self.globals);
        for v in &mut globals {
            self.heap.forward(v);
        }
        self.globals = globals;
        let mut stack = std::mem::take(&mut self.thread.stack);
        for v in &mut stack {
            self.heap.forward(v);
        }
        self.thread.stack = stack;
        let mut values = std::mem::take(&mut self.heap.new_ref_values);
        for v in &mut values {
            self.heap.forward(v);
        }
        self.heap.new_ref_values = values;
        if let Some(obj) = extra {
            obj.for_each_value(|v| self.heap.forward(v));
        }
        if let Value::Obj(h) = self.preallocated_oom {
            // Unmovable, but its slots may point into the nursery.
            let mut obj =
                std::mem::replace(self.heap.get_mut(h), HeapObject::Cell(Value::Nil));
            obj.for_each_value(|v| self.heap.forward(v));
            *self.heap.get_mut(h) = obj;
        }
        self.heap.drain_copy_queue();
        self.heap.replay_barrier();
        self.heap.promote_finalizers();
        self.heap.finish_minor();
    }

    /// Forced full collection: finish any incremental work, run a
    /// complete mark and sweep, then release unreferenced dynamically
    /// compiled modules.
    pub fn collect_full(&mut self) {
        info!("forced full collection");
        self.collect_minor();
        self.heap.drain_major();
        self.heap.begin_major();
        self.mark_roots();
        self.heap.drain_major();
        self.sweep_modules();
    }

    /// A module is alive when any of its globals is still referenced;
    /// native modules are never reclaimed. Unloading invalidates every
    /// inline cache.
    fn sweep_modules(&mut self) {
        let mut unloaded = false;
        let candidates: Vec<VmModule> = self
            .modules
            .iter()
            .filter(|m| m.dynamic && !m.native)
            .cloned()
            .collect();
        for module in candidates {
            let indices = self.program.globals.module_indices(module.tag);
            let alive = indices.iter().any(|&g| {
                matches!(self.globals[g as usize], Value::Obj(h) if self.heap.is_live(h))
                    || matches!(
                        self.globals[g as usize],
                        Value::Function(_) | Value::Type(_)
                    )
            });
            if !alive {
                info!("unloading module {}", module.name);
                for g in indices {
                    self.globals[g as usize] = Value::Nil;
                }
                self.modules.retain(|m| m.tag != module.tag);
                unloaded = true;
            }
        }
        if unloaded {
            self.cache.clear();
        }
    }

    /// Pin the heap across a multi-step operation. Incrementing forces
    /// in-progress incremental collection to finish synchronously.
    pub fn disallow_oldgen_gc(&mut self) {
        if self.heap.phase != GcPhase::Idle {
            self.heap.drain_major();
        }
        self.heap.disallow_count += 1;
    }

    pub fn allow_oldgen_gc(&mut self) {
        debug_assert!(self.heap.disallow_count > 0);
        self.heap.disallow_count -= 1;
        if self.heap.disallow_count == 0 && self.heap.should_start_major() {
            self.collect_full();
        }
    }

    // ----- exception constructors -----

    pub fn type_error(&self, message: &str) -> Pending {
        Pending::Unalloc {
            type_global: self.well_known.type_error_g,
            message: message.to_string(),
        }
    }

    pub fn value_error(&self, message: &str) -> Pending {
        Pending::Unalloc {
            type_global: self.well_known.value_error_g,
            message: message.to_string(),
        }
    }

    pub fn member_error(&self, member: u32) -> Pending {
        let name = self
            .program
            .member_names
            .get(member as usize)
            .cloned()
            .unwrap_or_default();
        Pending::Unalloc {
            type_global: self.well_known.member_error_g,
            message: format!("member \"{}\" not found", name),
        }
    }

    pub fn arithmetic_error(&self, message: &str) -> Pending {
        Pending::Unalloc {
            type_global: self.well_known.arithmetic_error_g,
            message: message.to_string(),
        }
    }

    pub fn raise_index_error(&self, message: &str) -> Pending {
        Pending::Unalloc {
            type_global: self.well_known.index_error_g,
            message: message.to_string(),
        }
    }

    pub fn argument_error(&self, message: &str) -> Pending {
        Pending::Unalloc {
            type_global: self.well_known.argument_error_g,
            message: message.to_string(),
        }
    }

    pub fn raise_io_error(&self, message: &str) -> Pending {
        Pending::Unalloc {
            type_global: self.well_known.io_error_g,
            message: message.to_string(),
        }
    }

    /// The preallocated out-of-memory exception, traceback cleared.
    pub fn raise_preallocated_oom(&mut self) -> Pending {
        if let Value::Obj(h) = self.preallocated_oom {
            if let HeapObject::Instance { slots, .. } = self.heap.get_mut(h) {
                if slots.len() > 1 {
                    slots[1] = Value::Nil;
                }
            }
        }
        Pending::Value(self.preallocated_oom)
    }

    pub fn make_exit_exception(&mut self, code: Value) -> Value {
        let tid = self.well_known.exit_exception;
        let total = self.program.types.get(tid).total_num_vars as usize;
        let mut slots = vec![Value::Nil; total.max(3)];
        slots[2] = code;
        self.alloc_value(HeapObject::Instance {
            type_id: tid,
            slots,
        })
    }

    // ----- value helpers -----

    pub fn type_of(&self, v: Value) -> TypeId {
        match v {
            Value::Nil | Value::Default => self.well_known.object,
            Value::True | Value::False => self.well_known.boolean,
            Value::Int(_) => self.well_known.int,
            Value::Float(_) => self.well_known.float,
            Value::Function(_) | Value::NativeFn(_) => self.well_known.function,
            Value::Type(_) => self.well_known.type_obj,
            Value::Obj(h) => match self.heap.get(h) {
                HeapObject::LongInt(_) => self.well_known.int,
                HeapObject::Str(_) | HeapObject::Substr { .. } => self.well_known.str_,
                HeapObject::Array(_) => self.well_known.array,
                HeapObject::Tuple(_) => self.well_known.tuple,
                HeapObject::Pair(..) => self.well_known.pair,
                HeapObject::Range(..) => self.well_known.range,
                HeapObject::Cell(_) => self.well_known.object,
                HeapObject::Instance { type_id, .. } => *type_id,
                HeapObject::BoundMethod { .. } | HeapObject::Closure { .. } => {
                    self.well_known.function
                }
            },
        }
    }

    /// The text of a string value, resolving substring views.
    pub fn string_value(&self, v: Value) -> Option<String> {
        let h = v.handle()?;
        match self.heap.get(h) {
            HeapObject::Str(s) => Some(s.clone()),
            HeapObject::Substr { base, start, len } => match self.heap.get(*base) {
                HeapObject::Str(s) => Some(
                    s.chars()
                        .skip(*start as usize)
                        .take(*len as usize)
                        .collect(),
                ),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn display_value(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::True => "True".to_string(),
            Value::False => "False".to_string(),
            Value::Default => "default".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => format_float(f),
            Value::Function(fid) => {
                format!("<function {}>", self.program.function(fid).name)
            }
            Value::NativeFn(_) => "<function>".to_string(),
            Value::Type(tid) => self.program.types.get(tid).name.clone(),
            Value::Obj(h) => match self.heap.get(h) {
                HeapObject::LongInt(n) => n.to_string(),
                HeapObject::Str(_) | HeapObject::Substr { .. } => {
                    self.string_value(v).unwrap_or_default()
                }
                HeapObject::Array(items) => {
                    let parts: Vec<String> =
                        items.iter().map(|i| self.repr_value(*i)).collect();
                    format!("[{}]", parts.join(", "))
                }
                HeapObject::Tuple(items) => {
                    let parts: Vec<String> =
                        items.iter().map(|i| self.repr_value(*i)).collect();
                    format!("({})", parts.join(", "))
                }
                HeapObject::Pair(a, b) => {
                    format!("{} : {}", self.repr_value(*a), self.repr_value(*b))
                }
                HeapObject::Range(a, b) => {
                    format!("{} to {}", self.repr_value(*a), self.repr_value(*b))
                }
                HeapObject::Cell(v) => self.display_value(*v),
                HeapObject::Instance { type_id, .. } => {
                    format!("<{} instance>", self.program.types.get(*type_id).name)
                }
                HeapObject::BoundMethod { .. } => "<bound method>".to_string(),
                HeapObject::Closure { .. } => "<anonymous function>".to_string(),
            },
        }
    }

    pub fn repr_value(&self, v: Value) -> String {
        match v {
            Value::Obj(h) => match self.heap.get(h) {
                HeapObject::Str(_) | HeapObject::Substr { .. } => {
                    format!("\"{}\"", self.string_value(v).unwrap_or_default())
                }
                _ => self.display_value(v),
            },
            _ => self.display_value(v),
        }
    }

    pub fn set_instance_slot(&mut self, v: Value, slot: u32, value: Value) {
        if let Some(h) = v.handle() {
            if let HeapObject::Instance { slots, .. } = self.heap.get_mut(h) {
                if (slot as usize) < slots.len() {
                    slots[slot as usize] = value;
                }
            }
            self.heap.record_write(h, slot, value);
        }
    }

    pub fn instance_slot(&self, v: Value, slot: u32) -> Value {
        match v.handle().map(|h| self.heap.get(h)) {
            Some(HeapObject::Instance { slots, .. }) => {
                slots.get(slot as usize).copied().unwrap_or(Value::Nil)
            }
            _ => Value::Nil,
        }
    }

    // ----- tracebacks -----

    /// Append one frame's entry to the exception's traceback array
    /// (instance slot 1). Synthetic functions are filtered here.
    pub fn traceback_append(&mut self, exc: Value, func: FunctionId, offset: u32) {
        let f = self.program.function(func);
        if f.synthetic {
            return;
        }
        let line = f.lines.line_for_offset(offset);
        let file = self.program.file_name(f.file).to_string();
        let entry = format!("{} ({}, line {})", f.name, file, line);
        let entry_val = self.alloc_value(HeapObject::Str(entry));
        let current = self.instance_slot(exc, 1);
        let is_array = matches!(
            current.handle().map(|h| self.heap.get(h)),
            Some(HeapObject::Array(_))
        );
        if is_array {
            let h = current.handle().unwrap();
            let field = match self.heap.get_mut(h) {
                HeapObject::Array(items) => {
                    items.push(entry_val);
                    items.len() as u32 - 1
                }
                _ => return,
            };
            self.heap.record_write(h, field, entry_val);
        } else {
            let arr = self.alloc_value(HeapObject::Array(vec![entry_val]));
            self.set_instance_slot(exc, 1, arr);
        }
    }

    /// The formatted traceback lines of an exception, capped with
    /// middle elision.
    pub fn traceback_lines(&self, exc: Value) -> Vec<String> {
        let tb = self.instance_slot(exc, 1);
        let entries = match tb.handle().map(|h| self.heap.get(h)) {
            Some(HeapObject::Array(items)) => items
                .iter()
                .filter_map(|v| self.string_value(*v))
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        };
        elide_middle(&entries)
    }

    /// Render an uncaught exception the way the default display callback
    /// does.
    pub fn render_uncaught(&self, exc: Value) -> String {
        let tid = self.type_of(exc);
        let name = self.program.types.get(tid).name.clone();
        let message = self.instance_slot(exc, 0);
        let mut out = String::new();
        out.push_str("Traceback (most recent call last):\n");
        for line in self.traceback_lines(exc).iter().rev() {
            out.push_str(&format!("  {line}\n"));
        }
        match self.string_value(message) {
            Some(m) => out.push_str(&format!("{name}: {m}\n")),
            None => out.push_str(&format!("{name}\n")),
        }
        out
    }
}

fn format_float(f: f64) -> String {
    if f == f.trunc() && f.is_finite() && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}
