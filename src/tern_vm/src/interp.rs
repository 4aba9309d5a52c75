//! The bytecode dispatch loop, call machinery and the exception
//! unwinder.
//!
//! Language-level exceptions never use host unwinding: every fallible
//! operation produces a tagged result and `unwind` interprets the
//! per-function exception descriptor blocks, maintaining the direct-try
//! context index and finally-block resumption.

use log::trace;

use tern_bytecode::{
    FunctionId, HandlerKind, MemberFlags, MemberTableKind, Opcode, TypeId, FINALLY_BREAK,
    FINALLY_FALL, FINALLY_RAISE, FINALLY_RETURN, NO_TARGET,
};
use tern_syntax::members::{MEMBER_CALL, MEMBER_FINALIZER};
use tern_syntax::MemberId;

use crate::exceptions::Pending;
use crate::value::{HeapObject, Value};
use crate::vm::{Frame, Outcome, Vm};

const MAX_CALL_DEPTH: usize = 8000;

pub(crate) enum CallFlow {
    /// A bytecode frame was pushed; the dispatch loop continues there.
    Pushed,
    /// The call completed synchronously (native, constructor, ...).
    Completed(Value),
}

impl Vm {
    fn code_word(&self, fid: FunctionId, i: usize) -> u32 {
        self.program.functions[fid.0 as usize].code[i]
    }

    fn slot(&self, base: usize, s: u32) -> Value {
        self.thread.stack[base + s as usize]
    }

    fn set_slot(&mut self, base: usize, s: u32, v: Value) {
        self.thread.stack[base + s as usize] = v;
    }

    // ----- program entry -----

    pub fn run(&mut self, args: &[String]) -> Outcome {
        // Build the argument array with every element rooted.
        let mark = self.thread.stack.len();
        for a in args {
            let v = self.alloc_value(HeapObject::Str(a.clone()));
            self.thread.stack.push(v);
        }
        let rooted: Vec<Value> = self.thread.stack[mark..].to_vec();
        let args_array = self.alloc_value(HeapObject::Array(rooted));
        self.thread.stack.truncate(mark);

        let entry = self.program.entry;
        if let Err(pending) = self.push_frame(entry, &[args_array], 0) {
            let exc = self.materialize(pending);
            return Outcome::Uncaught(self.render_uncaught(exc));
        }
        match self.execute(0) {
            Ok(_) => Outcome::Finished,
            Err(pending) => {
                let exc = self.materialize(pending);
                let tid = self.type_of(exc);
                if self
                    .program
                    .types
                    .is_subtype(tid, self.well_known.exit_exception)
                {
                    let code = match self.instance_slot(exc, 2) {
                        Value::Int(n) => n as i32,
                        _ => 0,
                    };
                    return Outcome::ExitRequested(code);
                }
                Outcome::Uncaught(self.render_uncaught(exc))
            }
        }
    }

    // ----- calls -----

    pub(crate) fn push_frame(
        &mut self,
        fid: FunctionId,
        args: &[Value],
        ret_dst: u32,
    ) -> Result<(), Pending> {
        if self.thread.frames.len() >= MAX_CALL_DEPTH {
            // Stack overflow reuses the no-allocation raise path.
            return Err(Pending::Unalloc {
                type_global: self.well_known.runtime_error_g,
                message: "call depth limit exceeded".to_string(),
            });
        }
        let (min, maxp, vararg, frame_size, name_ok) = {
            let f = self.program.function(fid);
            (
                f.min_args,
                f.max_positional(),
                f.is_vararg(),
                f.frame_size,
                f.accepts(args.len() as u32),
            )
        };
        if !name_ok {
            let f = self.program.function(fid);
            return Err(self.argument_error(&format!(
                "{} expects {} to {} arguments but got {}",
                f.name,
                min,
                maxp,
                args.len()
            )));
        }
        let base = self.thread.stack.len();
        self.thread.stack.extend_from_slice(args);
        if vararg {
            let n = args.len() as u32;
            if n > maxp {
                let rest_array = self.alloc_value(HeapObject::Array(Vec::new()));
                // Re-read the extras after the allocation; a collection
                // may have moved them.
                let extras: Vec<Value> =
                    self.thread.stack[base + maxp as usize..base + n as usize].to_vec();
                if let Value::Obj(h) = rest_array {
                    if let HeapObject::Array(items) = self.heap.get_mut(h) {
                        *items = extras;
                    }
                }
                self.thread.stack.truncate(base + maxp as usize);
                self.thread.stack.push(rest_array);
            } else {
                while self.thread.stack.len() < base + maxp as usize {
                    self.thread.stack.push(Value::Default);
                }
                let empty = self.alloc_value(HeapObject::Array(Vec::new()));
                self.thread.stack.push(empty);
            }
        } else {
            while self.thread.stack.len() < base + maxp as usize {
                self.thread.stack.push(Value::Default);
            }
        }
        let target = base + frame_size as usize;
        if self.thread.stack.len() < target {
            self.thread.stack.resize(target, Value::Nil);
        }
        self.thread.frames.push(Frame {
            func: fid,
            ip: 0,
            base,
            ret_dst,
            ctx_base: self.thread.context_index,
        });
        Ok(())
    }

    /// Dispatch a call on any callable value.
    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        args: &[Value],
        ret_dst: u32,
    ) -> Result<CallFlow, Pending> {
        match callee {
            Value::Function(fid) => {
                self.push_frame(fid, args, ret_dst)?;
                Ok(CallFlow::Pushed)
            }
            Value::NativeFn(i) => {
                let f = self.natives[i as usize];
                let v = f(self, args)?;
                Ok(CallFlow::Completed(v))
            }
            Value::Type(tid) => {
                let v = self.instantiate(tid, args)?;
                Ok(CallFlow::Completed(v))
            }
            Value::Obj(h) => match self.heap.get(h).clone() {
                HeapObject::Closure { func, captured } => {
                    let mut full = captured;
                    full.extend_from_slice(args);
                    self.push_frame(func, &full, ret_dst)?;
                    Ok(CallFlow::Pushed)
                }
                HeapObject::BoundMethod {
                    receiver,
                    func_global,
                } => {
                    let mut full = vec![receiver];
                    full.extend_from_slice(args);
                    let callee = self.globals[func_global as usize];
                    self.call_value(callee, &full, ret_dst)
                }
                HeapObject::Instance { type_id, .. } => {
                    match self.lookup_method_entry(type_id, MEMBER_CALL) {
                        Some(item) => {
                            let mut full = vec![callee];
                            full.extend_from_slice(args);
                            let target = self.globals[item as usize];
                            self.call_value(target, &full, ret_dst)
                        }
                        None => Err(self.type_error("value is not callable")),
                    }
                }
                _ => Err(self.type_error("value is not callable")),
            },
            _ => Err(self.type_error("value is not callable")),
        }
    }

    /// Call and run to completion inside a nested dispatch loop; used by
    /// operator methods, accessors, constructors and finalizers.
    pub(crate) fn call_sync(&mut self, callee: Value, args: &[Value]) -> Result<Value, Pending> {
        let floor = self.thread.frames.len();
        match self.call_value(callee, args, 0)? {
            CallFlow::Completed(v) => Ok(v),
            CallFlow::Pushed => self.execute(floor),
        }
    }

    pub(crate) fn call_method_sync(
        &mut self,
        obj: Value,
        member: MemberId,
        args: &[Value],
    ) -> Result<Value, Pending> {
        let tid = self.type_of(obj);
        let Some(item) = self.lookup_method_entry(tid, member) else {
            return Err(self.member_error(member.0));
        };
        let callee = self.globals[item as usize];
        let mut full = vec![obj];
        full.extend_from_slice(args);
        self.call_sync(callee, &full)
    }

    // ----- instantiation -----

    fn instantiate(&mut self, tid: TypeId, args: &[Value]) -> Result<Value, Pending> {
        if self.program.types.get(tid).is_interface {
            return Err(self.type_error("interfaces cannot be instantiated"));
        }
        if let Some(v) = self.convert_primitive(tid, args)? {
            return Ok(v);
        }

        // Root the constructor arguments across the allocation.
        let mark = self.thread.stack.len();
        self.thread.stack.extend_from_slice(args);
        let total = self.program.types.get(tid).total_num_vars as usize;
        let inst = self.alloc_value(HeapObject::Instance {
            type_id: tid,
            slots: vec![Value::Nil; total],
        });
        self.thread.stack.push(inst);
        let n_args = self.thread.stack.len() - mark - 1;
        let args: Vec<Value> = self.thread.stack[mark..mark + n_args].to_vec();
        let inst = *self.thread.stack.last().unwrap();

        // Ancestor member initializers run root first, then create,
        // then the instance itself is the result.
        let chain = self.program.types.chain(tid);
        for &t in chain.iter().rev() {
            if let Some(g) = self.program.types.get(t).member_initializer {
                let callee = self.globals[g as usize];
                self.call_sync(callee, &[inst])?;
            }
        }
        let create_global = self.program.types.get(tid).create_global;
        if create_global != 0 {
            let callee = self.globals[create_global as usize];
            let mut full = vec![inst];
            full.extend_from_slice(&args);
            self.call_sync(callee, &full)?;
        } else if !args.is_empty() {
            let name = self.program.types.get(tid).name.clone();
            self.thread.stack.truncate(mark);
            return Err(self.argument_error(&format!("{} expects no arguments", name)));
        }
        let inst = *self.thread.stack.last().unwrap();
        self.thread.stack.truncate(mark);
        Ok(inst)
    }

    /// Calling a primitive type performs a conversion.
    fn convert_primitive(&mut self, tid: TypeId, args: &[Value]) -> Result<Option<Value>, Pending> {
        let wk = self.well_known;
        let arg = args.first().copied().unwrap_or(Value::Nil);
        if tid == wk.int {
            let v = match arg {
                Value::Int(_) => arg,
                Value::Float(f) => Value::Int(f.trunc() as i64),
                _ => match self.string_value(arg) {
                    Some(s) => s
                        .trim()
                        .parse::<i64>()
                        .map(Value::Int)
                        .map_err(|_| self.value_error("invalid integer literal"))?,
                    None => return Err(self.type_error("cannot convert to Int")),
                },
            };
            return Ok(Some(v));
        }
        if tid == wk.float {
            let v = match arg {
                Value::Float(_) => arg,
                Value::Int(n) => Value::Float(n as f64),
                _ => match self.string_value(arg) {
                    Some(s) => s
                        .trim()
                        .parse::<f64>()
                        .map(Value::Float)
                        .map_err(|_| self.value_error("invalid float literal"))?,
                    None => return Err(self.type_error("cannot convert to Float")),
                },
            };
            return Ok(Some(v));
        }
        if tid == wk.str_ {
            let text = self.display_value(arg);
            return Ok(Some(self.alloc_value(HeapObject::Str(text))));
        }
        if tid == wk.boolean
            || tid == wk.array
            || tid == wk.tuple
            || tid == wk.pair
            || tid == wk.range
            || tid == wk.function
            || tid == wk.type_obj
            || tid == wk.object
        {
            return Err(self.type_error("type is not instantiable"));
        }
        Ok(None)
    }

    // ----- member access -----

    /// Cached (type, member) to member-table item lookup per call site.
    fn method_item(&mut self, tid: TypeId, member: MemberId, site: (u32, u32)) -> Option<u32> {
        if let Some((cached_tid, item, _)) = self.cache.get(&site) {
            if *cached_tid == tid {
                return Some(*item);
            }
        }
        let item = self.lookup_method_entry(tid, member)?;
        self.cache.insert(site, (tid, item, false));
        Some(item)
    }

    pub(crate) fn member_get(&mut self, obj: Value, member: MemberId) -> Result<Value, Pending> {
        let tid = self.type_of(obj);
        for kind in [MemberTableKind::GetterPublic, MemberTableKind::GetterPrivate] {
            if let Some((_, entry)) = self.program.types.lookup_member(tid, kind, member) {
                if entry.flags.contains(MemberFlags::ACCESSOR) {
                    let callee = self.globals[entry.item as usize];
                    return self.call_sync(callee, &[obj]);
                }
                return Ok(self.instance_slot(obj, entry.item));
            }
        }
        // A method referenced without a call binds the receiver.
        if let Some(item) = self.lookup_method_entry(tid, member) {
            return Ok(self.alloc_value(HeapObject::BoundMethod {
                receiver: obj,
                func_global: item,
            }));
        }
        Err(self.member_error(member.0))
    }

    pub(crate) fn member_set(
        &mut self,
        obj: Value,
        member: MemberId,
        value: Value,
    ) -> Result<(), Pending> {
        let tid = self.type_of(obj);
        for kind in [MemberTableKind::SetterPublic, MemberTableKind::SetterPrivate] {
            if let Some((_, entry)) = self.program.types.lookup_member(tid, kind, member) {
                if entry.flags.contains(MemberFlags::ACCESSOR) {
                    let callee = self.globals[entry.item as usize];
                    self.call_sync(callee, &[obj, value])?;
                    return Ok(());
                }
                self.set_instance_slot(obj, entry.item, value);
                return Ok(());
            }
        }
        Err(self.member_error(member.0))
    }

    // ----- exceptions -----

    fn pending_type(&self, pending: &Pending) -> TypeId {
        match pending {
            Pending::Value(v) => self.type_of(*v),
            Pending::Unalloc { type_global, .. } => {
                match self.globals[*type_global as usize] {
                    Value::Type(t) => t,
                    _ => self.well_known.exception,
                }
            }
        }
    }

    pub(crate) fn materialize(&mut self, pending: Pending) -> Value {
        match pending {
            Pending::Value(v) => v,
            Pending::Unalloc {
                type_global,
                message,
            } => {
                let tid = match self.globals[type_global as usize] {
                    Value::Type(t) => t,
                    _ => self.well_known.exception,
                };
                let total = self.program.types.get(tid).total_num_vars.max(2) as usize;
                let msg = HeapObject::Str(message);
                let mark = self.thread.stack.len();
                let msg_v = self.alloc_value(msg);
                self.thread.stack.push(msg_v);
                let inst = self.alloc_value(HeapObject::Instance {
                    type_id: tid,
                    slots: {
                        let mut slots = vec![Value::Nil; total];
                        slots[0] = *self.thread.stack.last().unwrap();
                        slots
                    },
                });
                self.thread.stack.truncate(mark);
                inst
            }
        }
    }

    /// Search the current frame's descriptors from the raise site and
    /// resume in a handler, or tear the frame down and retry in the
    /// caller. Returns the still-pending exception when unwinding would
    /// cross `floor`.
    fn unwind(&mut self, pending: Pending, floor: usize) -> Result<(), Pending> {
        let mut pending = pending;
        // The raising frame's ip is the raise site itself; caller frames
        // hold the resume address, one word past their call instruction.
        let mut raise_frame = true;
        loop {
            if self.thread.frames.len() <= floor {
                return Err(pending);
            }
            let frame = self.thread.frames.last().unwrap().clone();
            let offset = if raise_frame {
                frame.ip as u32
            } else {
                (frame.ip as u32).saturating_sub(1)
            };
            raise_frame = false;
            let exc_tid = self.pending_type(&pending);

            let mut action: Option<(HandlerKind, u32)> = None;
            {
                let table = &self.program.function(frame.func).exceptions;
                for e in table.covering(offset) {
                    match &e.kind {
                        HandlerKind::Except { caught_global, .. } => {
                            let caught = match self
                                .globals
                                .get(*caught_global as usize)
                            {
                                Some(Value::Type(t)) => Some(*t),
                                _ => None,
                            };
                            if let Some(caught) = caught {
                                if self.program.types.is_subtype(exc_tid, caught) {
                                    action = Some((e.kind.clone(), e.ctx_depth));
                                    break;
                                }
                            }
                        }
                        HandlerKind::Finally { .. } => {
                            action = Some((e.kind.clone(), e.ctx_depth));
                            break;
                        }
                        HandlerKind::BeginTry { .. } => {}
                    }
                }
            }

            match action {
                Some((HandlerKind::Except { slot, handler, .. }, ctx_depth)) => {
                    let exc = self.materialize(pending);
                    self.set_slot(frame.base, slot, exc);
                    self.thread.context_index = frame.ctx_base + ctx_depth;
                    self.thread.frames.last_mut().unwrap().ip = handler as usize;
                    return Ok(());
                }
                Some((HandlerKind::Finally { slot, handler }, ctx_depth)) => {
                    let exc = self.materialize(pending);
                    // A partial traceback is built before the finally
                    // block runs.
                    self.traceback_append(exc, frame.func, offset);
                    self.set_slot(frame.base, slot, Value::Int(FINALLY_RAISE));
                    self.set_slot(frame.base, slot + 1, exc);
                    self.thread.context_index = frame.ctx_base + ctx_depth;
                    self.thread.frames.last_mut().unwrap().ip = handler as usize;
                    return Ok(());
                }
                _ => {
                    // No handler here: record the frame in the traceback
                    // and propagate to the caller.
                    let exc = self.materialize(pending);
                    self.traceback_append(exc, frame.func, offset);
                    pending = Pending::Value(exc);
                    self.thread.context_index = frame.ctx_base;
                    self.thread.stack.truncate(frame.base);
                    self.thread.frames.pop();
                }
            }
        }
    }

    /// Run queued finalizers, then release their objects.
    fn drain_finalizers(&mut self) {
        while let Some(h) = self.heap.pending_finalizers.pop() {
            let tid = match self.heap.get(h) {
                HeapObject::Instance { type_id, .. } => *type_id,
                _ => continue,
            };
            if let Some(item) = self.lookup_method_entry(tid, MEMBER_FINALIZER) {
                let callee = self.globals[item as usize];
                // A finalizer cannot stop the reclamation; errors are
                // dropped.
                let _ = self.call_sync(callee, &[Value::Obj(h)]);
            }
            self.heap.free_slot(h.index);
        }
    }

    // ----- the dispatch loop -----

    pub(crate) fn execute(&mut self, floor: usize) -> Result<Value, Pending> {
        macro_rules! raise {
            ($self:ident, $pending:expr) => {{
                $self.unwind($pending, floor)?;
                continue;
            }};
        }

        loop {
            if !self.heap.pending_finalizers.is_empty() {
                self.drain_finalizers();
            }
            debug_assert!(self.thread.frames.len() > floor);
            let (fid, base, ip) = {
                let f = self.thread.frames.last().unwrap();
                (f.func, f.base, f.ip)
            };
            let opw = self.code_word(fid, ip);
            let op = match Opcode::try_from(opw) {
                Ok(op) => op,
                Err(_) => {
                    raise!(self, Pending::Unalloc {
                        type_global: self.well_known.runtime_error_g,
                        message: format!("invalid opcode {opw}"),
                    });
                }
            };
            let len = Opcode::instruction_len(&self.program.functions[fid.0 as usize].code, ip);
            // The frame keeps the offset of the executing instruction;
            // the unwinder searches descriptors from it.
            let next_ip = ip + len;
            trace!("{} @{}: {}", fid.0, ip, op.mnemonic());

            match op {
                Opcode::Nop => {
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::AssignInt => {
                    let dst = self.code_word(fid, ip + 1);
                    let imm = self.code_word(fid, ip + 2) as i32 as i64;
                    self.set_slot(base, dst, Value::Int(imm));
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::AssignNil | Opcode::AssignTrue | Opcode::AssignFalse
                | Opcode::AssignDefault => {
                    let dst = self.code_word(fid, ip + 1);
                    let v = match op {
                        Opcode::AssignNil => Value::Nil,
                        Opcode::AssignTrue => Value::True,
                        Opcode::AssignFalse => Value::False,
                        _ => Value::Default,
                    };
                    self.set_slot(base, dst, v);
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::AssignLocal => {
                    let dst = self.code_word(fid, ip + 1);
                    let src = self.code_word(fid, ip + 2);
                    let v = self.slot(base, src);
                    self.set_slot(base, dst, v);
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::AssignGlobal => {
                    let dst = self.code_word(fid, ip + 1);
                    let g = self.code_word(fid, ip + 2);
                    let v = self.globals[g as usize];
                    self.set_slot(base, dst, v);
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::StoreGlobal => {
                    let g = self.code_word(fid, ip + 1);
                    let src = self.code_word(fid, ip + 2);
                    self.globals[g as usize] = self.slot(base, src);
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::AssignMember => {
                    let dst = self.code_word(fid, ip + 1);
                    let obj = self.slot(base, self.code_word(fid, ip + 2));
                    let member = MemberId(self.code_word(fid, ip + 3));
                    match self.member_get(obj, member) {
                        Ok(v) => {
                            self.set_slot(base, dst, v);
                            self.thread.frames.last_mut().unwrap().ip = next_ip;
                        }
                        Err(p) => raise!(self, p),
                    }
                }
                Opcode::StoreMember => {
                    let obj = self.slot(base, self.code_word(fid, ip + 1));
                    let member = MemberId(self.code_word(fid, ip + 2));
                    let src = self.slot(base, self.code_word(fid, ip + 3));
                    match self.member_set(obj, member, src) {
                        Ok(()) => self.thread.frames.last_mut().unwrap().ip = next_ip,
                        Err(p) => raise!(self, p),
                    }
                }
                Opcode::AssignMemberFn => {
                    let dst = self.code_word(fid, ip + 1);
                    let obj = self.slot(base, self.code_word(fid, ip + 2));
                    let member = MemberId(self.code_word(fid, ip + 3));
                    let tid = self.type_of(obj);
                    match self.lookup_method_entry(tid, member) {
                        Some(item) => {
                            let bm = self.alloc_value(HeapObject::BoundMethod {
                                receiver: obj,
                                func_global: item,
                            });
                            self.set_slot(base, dst, bm);
                            self.thread.frames.last_mut().unwrap().ip = next_ip;
                        }
                        None => raise!(self, self.member_error(member.0)),
                    }
                }
                Opcode::AssignSuper => {
                    let dst = self.code_word(fid, ip + 1);
                    let owner = TypeId(self.code_word(fid, ip + 2));
                    let member = MemberId(self.code_word(fid, ip + 3));
                    let this = self.slot(base, 0);
                    let result = match self.program.types.get(owner).resolved_super() {
                        Some(sup) => self.super_member_get(this, sup, member),
                        None => Err(self.member_error(member.0)),
                    };
                    match result {
                        Ok(v) => {
                            self.set_slot(base, dst, v);
                            self.thread.frames.last_mut().unwrap().ip = next_ip;
                        }
                        Err(p) => raise!(self, p),
                    }
                }
                Opcode::AssignExposed => {
                    let dst = self.code_word(fid, ip + 1);
                    let cell = self.slot(base, self.code_word(fid, ip + 2));
                    let v = match cell.handle().map(|h| self.heap.get(h)) {
                        Some(HeapObject::Cell(v)) => *v,
                        _ => Value::Nil,
                    };
                    self.set_slot(base, dst, v);
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::StoreExposed => {
                    let cell = self.slot(base, self.code_word(fid, ip + 1));
                    let src = self.slot(base, self.code_word(fid, ip + 2));
                    if let Some(h) = cell.handle() {
                        if let HeapObject::Cell(v) = self.heap.get_mut(h) {
                            *v = src;
                        }
                        self.heap.record_write(h, 0, src);
                    }
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::CreateExposed => {
                    let s = self.code_word(fid, ip + 1);
                    let v = self.slot(base, s);
                    let cell = self.alloc_value(HeapObject::Cell(v));
                    self.set_slot(base, s, cell);
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::CreateAnon => {
                    let dst = self.code_word(fid, ip + 1);
                    let g = self.code_word(fid, ip + 2);
                    let n = self.code_word(fid, ip + 3);
                    let mut captured = Vec::with_capacity(n as usize);
                    for i in 0..n {
                        let s = self.code_word(fid, ip + 4 + i as usize);
                        captured.push(self.slot(base, s));
                    }
                    let func = match self.globals[g as usize] {
                        Value::Function(f) => f,
                        _ => {
                            raise!(self, self.type_error("bad anonymous function global"));
                        }
                    };
                    let closure = self.alloc_value(HeapObject::Closure { func, captured });
                    self.set_slot(base, dst, closure);
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::CreateArray | Opcode::CreateTuple => {
                    let dst = self.code_word(fid, ip + 1);
                    let n = self.code_word(fid, ip + 2);
                    let mut items = Vec::with_capacity(n as usize);
                    for i in 0..n {
                        let s = self.code_word(fid, ip + 3 + i as usize);
                        items.push(self.slot(base, s));
                    }
                    let obj = if op == Opcode::CreateArray {
                        HeapObject::Array(items)
                    } else {
                        HeapObject::Tuple(items)
                    };
                    let v = self.alloc_value(obj);
                    self.set_slot(base, dst, v);
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::CreatePair | Opcode::CreateRange => {
                    let dst = self.code_word(fid, ip + 1);
                    let a = self.slot(base, self.code_word(fid, ip + 2));
                    let b = self.slot(base, self.code_word(fid, ip + 3));
                    let v = if op == Opcode::CreatePair {
                        self.alloc_value(HeapObject::Pair(a, b))
                    } else {
                        self.alloc_value(HeapObject::Range(a, b))
                    };
                    self.set_slot(base, dst, v);
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::Expand => {
                    let src = self.slot(base, self.code_word(fid, ip + 1));
                    let n = self.code_word(fid, ip + 2);
                    let items: Option<Vec<Value>> =
                        match src.handle().map(|h| self.heap.get(h)) {
                            Some(HeapObject::Array(v)) | Some(HeapObject::Tuple(v)) => {
                                Some(v.clone())
                            }
                            Some(HeapObject::Pair(a, b)) => Some(vec![*a, *b]),
                            _ => None,
                        };
                    match items {
                        Some(items) if items.len() == n as usize => {
                            for (i, v) in items.into_iter().enumerate() {
                                let dst = self.code_word(fid, ip + 3 + i);
                                self.set_slot(base, dst, v);
                            }
                            self.thread.frames.last_mut().unwrap().ip = next_ip;
                        }
                        Some(_) => {
                            raise!(
                                self,
                                self.value_error("wrong number of values to expand")
                            );
                        }
                        None => {
                            raise!(self, self.type_error("cannot expand a non-sequence"));
                        }
                    }
                }
                Opcode::Neg => {
                    let dst = self.code_word(fid, ip + 1);
                    let a = self.slot(base, self.code_word(fid, ip + 2));
                    match self.op_neg(a) {
                        Ok(v) => {
                            self.set_slot(base, dst, v);
                            self.thread.frames.last_mut().unwrap().ip = next_ip;
                        }
                        Err(p) => raise!(self, p),
                    }
                }
                Opcode::IsDefault => {
                    let dst = self.code_word(fid, ip + 1);
                    let src = self.slot(base, self.code_word(fid, ip + 2));
                    self.set_slot(base, dst, Value::from_bool(matches!(src, Value::Default)));
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::IntDiv
                | Opcode::Mod
                | Opcode::Pow => {
                    let dst = self.code_word(fid, ip + 1);
                    let a = self.slot(base, self.code_word(fid, ip + 2));
                    let b = self.slot(base, self.code_word(fid, ip + 3));
                    let result = match op {
                        Opcode::Add => self.op_add(a, b),
                        Opcode::Sub => self.op_sub(a, b),
                        Opcode::Mul => self.op_mul(a, b),
                        Opcode::Div => self.op_div(a, b),
                        Opcode::IntDiv => self.op_int_div(a, b),
                        Opcode::Mod => self.op_mod(a, b),
                        _ => self.op_pow(a, b),
                    };
                    match result {
                        Ok(v) => {
                            self.set_slot(base, dst, v);
                            self.thread.frames.last_mut().unwrap().ip = next_ip;
                        }
                        Err(p) => raise!(self, p),
                    }
                }
                Opcode::CmpEq
                | Opcode::CmpNeq
                | Opcode::CmpLt
                | Opcode::CmpGte
                | Opcode::CmpGt
                | Opcode::CmpLte
                | Opcode::CmpIn
                | Opcode::CmpNotIn
                | Opcode::CmpIs
                | Opcode::CmpIsNot => {
                    let dst = self.code_word(fid, ip + 1);
                    let a = self.slot(base, self.code_word(fid, ip + 2));
                    let b = self.slot(base, self.code_word(fid, ip + 3));
                    let result = match op {
                        Opcode::CmpEq => self.value_eq(a, b),
                        Opcode::CmpNeq => self.value_eq(a, b).map(|r| !r),
                        Opcode::CmpLt => self.value_lt(a, b),
                        Opcode::CmpGte => self.value_lt(a, b).map(|r| !r),
                        Opcode::CmpGt => self.value_gt(a, b),
                        Opcode::CmpLte => self.value_gt(a, b).map(|r| !r),
                        Opcode::CmpIn => self.op_in(a, b),
                        Opcode::CmpNotIn => self.op_in(a, b).map(|r| !r),
                        Opcode::CmpIs => self.op_is(a, b),
                        _ => self.op_is(a, b).map(|r| !r),
                    };
                    match result {
                        Ok(v) => {
                            self.set_slot(base, dst, Value::from_bool(v));
                            self.thread.frames.last_mut().unwrap().ip = next_ip;
                        }
                        Err(p) => raise!(self, p),
                    }
                }
                Opcode::IfTrue | Opcode::IfFalse => {
                    let src = self.slot(base, self.code_word(fid, ip + 1));
                    let target = self.code_word(fid, ip + 2) as usize;
                    match self.truthiness(src) {
                        Ok(b) => {
                            let jump = if op == Opcode::IfTrue { b } else { !b };
                            self.thread.frames.last_mut().unwrap().ip =
                                if jump { target } else { next_ip };
                        }
                        Err(p) => raise!(self, p),
                    }
                }
                Opcode::Jmp => {
                    let target = self.code_word(fid, ip + 1) as usize;
                    self.thread.frames.last_mut().unwrap().ip = target;
                }
                Opcode::GetItem => {
                    let dst = self.code_word(fid, ip + 1);
                    let b = self.slot(base, self.code_word(fid, ip + 2));
                    let i = self.slot(base, self.code_word(fid, ip + 3));
                    match self.index_get(b, i) {
                        Ok(v) => {
                            self.set_slot(base, dst, v);
                            self.thread.frames.last_mut().unwrap().ip = next_ip;
                        }
                        Err(p) => raise!(self, p),
                    }
                }
                Opcode::SetItem => {
                    let b = self.slot(base, self.code_word(fid, ip + 1));
                    let i = self.slot(base, self.code_word(fid, ip + 2));
                    let v = self.slot(base, self.code_word(fid, ip + 3));
                    match self.index_set(b, i, v) {
                        Ok(()) => self.thread.frames.last_mut().unwrap().ip = next_ip,
                        Err(p) => raise!(self, p),
                    }
                }
                Opcode::CallGlobal | Opcode::CallLocal => {
                    let dst = self.code_word(fid, ip + 1);
                    let callee = if op == Opcode::CallGlobal {
                        self.globals[self.code_word(fid, ip + 2) as usize]
                    } else {
                        self.slot(base, self.code_word(fid, ip + 2))
                    };
                    let n = self.code_word(fid, ip + 3);
                    let mut args = Vec::with_capacity(n as usize);
                    for i in 0..n {
                        let s = self.code_word(fid, ip + 4 + i as usize);
                        args.push(self.slot(base, s));
                    }
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                    match self.call_value(callee, &args, dst) {
                        Ok(CallFlow::Pushed) => {}
                        Ok(CallFlow::Completed(v)) => self.set_slot(base, dst, v),
                        Err(p) => {
                            self.thread.frames.last_mut().unwrap().ip = ip;
                            raise!(self, p);
                        }
                    }
                }
                Opcode::CallMethod => {
                    let dst = self.code_word(fid, ip + 1);
                    let obj = self.slot(base, self.code_word(fid, ip + 2));
                    let member = MemberId(self.code_word(fid, ip + 3));
                    let n = self.code_word(fid, ip + 4);
                    let mut args = Vec::with_capacity(n as usize + 1);
                    args.push(obj);
                    for i in 0..n {
                        let s = self.code_word(fid, ip + 5 + i as usize);
                        args.push(self.slot(base, s));
                    }
                    let tid = self.type_of(obj);
                    let site = (fid.0, ip as u32);
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                    let outcome = match self.method_item(tid, member, site) {
                        Some(item) => {
                            let callee = self.globals[item as usize];
                            self.call_value(callee, &args, dst)
                        }
                        None => {
                            // Fall back on a member holding a callable.
                            match self.member_get(obj, member) {
                                Ok(f) => self.call_value(f, &args[1..], dst),
                                Err(p) => Err(p),
                            }
                        }
                    };
                    match outcome {
                        Ok(CallFlow::Pushed) => {}
                        Ok(CallFlow::Completed(v)) => self.set_slot(base, dst, v),
                        Err(p) => {
                            self.thread.frames.last_mut().unwrap().ip = ip;
                            raise!(self, p);
                        }
                    }
                }
                Opcode::CallSuper => {
                    let dst = self.code_word(fid, ip + 1);
                    let owner = TypeId(self.code_word(fid, ip + 2));
                    let member = MemberId(self.code_word(fid, ip + 3));
                    let n = self.code_word(fid, ip + 4);
                    let mut args = Vec::with_capacity(n as usize);
                    for i in 0..n {
                        let s = self.code_word(fid, ip + 5 + i as usize);
                        args.push(self.slot(base, s));
                    }
                    let target = self
                        .program
                        .types
                        .get(owner)
                        .resolved_super()
                        .and_then(|sup| self.lookup_method_entry(sup, member));
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                    let outcome = match target {
                        Some(item) => {
                            let callee = self.globals[item as usize];
                            self.call_value(callee, &args, dst)
                        }
                        None => Err(self.member_error(member.0)),
                    };
                    match outcome {
                        Ok(CallFlow::Pushed) => {}
                        Ok(CallFlow::Completed(v)) => self.set_slot(base, dst, v),
                        Err(p) => {
                            self.thread.frames.last_mut().unwrap().ip = ip;
                            raise!(self, p);
                        }
                    }
                }
                Opcode::RaiseLocal => {
                    let v = self.slot(base, self.code_word(fid, ip + 1));
                    let tid = self.type_of(v);
                    if !self
                        .program
                        .types
                        .is_subtype(tid, self.well_known.exception)
                    {
                        raise!(self, self.type_error("raise expects an exception"));
                    }
                    raise!(self, Pending::Value(v));
                }
                Opcode::RetLocal | Opcode::RetNil => {
                    let v = if op == Opcode::RetLocal {
                        self.slot(base, self.code_word(fid, ip + 1))
                    } else {
                        Value::Nil
                    };
                    if let Some(result) = self.do_return(v, floor) {
                        return Ok(result);
                    }
                }
                Opcode::BeginTry => {
                    let direct = self.code_word(fid, ip + 1);
                    if direct != 0 {
                        self.thread.context_index += 1;
                    }
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::EndTry => {
                    let n = self.code_word(fid, ip + 1);
                    self.thread.context_index = self.thread.context_index.saturating_sub(n);
                    self.thread.frames.last_mut().unwrap().ip = next_ip;
                }
                Opcode::LeaveFinally => {
                    let slot = self.code_word(fid, ip + 1);
                    let pops = self.code_word(fid, ip + 2);
                    let break_target = self.code_word(fid, ip + 3);
                    let disc = match self.slot(base, slot) {
                        Value::Int(d) => d,
                        _ => FINALLY_FALL,
                    };
                    if disc == FINALLY_FALL {
                        self.thread.frames.last_mut().unwrap().ip = next_ip;
                        continue;
                    }
                    self.thread.context_index =
                        self.thread.context_index.saturating_sub(pops);
                    let payload = self.slot(base, slot + 1);
                    match disc {
                        FINALLY_RAISE => {
                            raise!(self, Pending::Value(payload));
                        }
                        FINALLY_RETURN => {
                            // Chain through an enclosing finally before
                            // actually returning.
                            let outer = self
                                .program
                                .function(fid)
                                .exceptions
                                .enclosing_finally(ip as u32, u32::MAX)
                                .map(|e| (e.kind.clone(), e.ctx_depth));
                            match outer {
                                Some((HandlerKind::Finally { slot: os, handler }, _)) => {
                                    self.set_slot(base, os, Value::Int(FINALLY_RETURN));
                                    self.set_slot(base, os + 1, payload);
                                    self.thread.frames.last_mut().unwrap().ip =
                                        handler as usize;
                                }
                                _ => {
                                    if let Some(result) = self.do_return(payload, floor) {
                                        return Ok(result);
                                    }
                                }
                            }
                        }
                        _ => {
                            // A break travelling through this finally.
                            let outer = self
                                .program
                                .function(fid)
                                .exceptions
                                .enclosing_finally(ip as u32, u32::MAX)
                                .map(|e| e.kind.clone());
                            match outer {
                                Some(HandlerKind::Finally { slot: os, handler }) => {
                                    self.set_slot(base, os, Value::Int(FINALLY_BREAK));
                                    self.thread.frames.last_mut().unwrap().ip =
                                        handler as usize;
                                }
                                _ => {
                                    debug_assert_ne!(break_target, NO_TARGET);
                                    self.thread.frames.last_mut().unwrap().ip =
                                        break_target as usize;
                                }
                            }
                        }
                    }
                }
                Opcode::Halt => {
                    return Ok(Value::Nil);
                }
            }
        }
    }

    /// Pop the current frame and deliver `value`; returns it when the
    /// dispatch floor is reached.
    fn do_return(&mut self, value: Value, floor: usize) -> Option<Value> {
        let frame = self.thread.frames.pop().expect("return without a frame");
        self.thread.context_index = frame.ctx_base;
        self.thread.stack.truncate(frame.base);
        if self.thread.frames.len() <= floor {
            return Some(value);
        }
        let caller_base = self.thread.frames.last().unwrap().base;
        self.set_slot(caller_base, frame.ret_dst, value);
        None
    }

    fn super_member_get(
        &mut self,
        this: Value,
        sup: TypeId,
        member: MemberId,
    ) -> Result<Value, Pending> {
        for kind in [MemberTableKind::GetterPublic, MemberTableKind::GetterPrivate] {
            if let Some((_, entry)) = self.program.types.lookup_member(sup, kind, member) {
                if entry.flags.contains(MemberFlags::ACCESSOR) {
                    let callee = self.globals[entry.item as usize];
                    return self.call_sync(callee, &[this]);
                }
                return Ok(self.instance_slot(this, entry.item));
            }
        }
        if let Some(item) = self.lookup_method_entry(sup, member) {
            return Ok(self.alloc_value(HeapObject::BoundMethod {
                receiver: this,
                func_global: item,
            }));
        }
        Err(self.member_error(member.0))
    }
}
