//! The `std` prelude: the module compiled into the runtime.
//!
//! Realized by the compiler through the same two passes as source
//! modules; the `func` indices in the definitions index `NATIVE_TABLE`,
//! which the interpreter consults when a called global holds a native
//! function.

use tern_bytecode::{NativeItemDef, NativeMemberDef, NativeModuleDef};

use crate::exceptions::Pending;
use crate::value::{HeapObject, Value};
use crate::vm::Vm;

pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, Pending>;

pub const N_WRITE: u32 = 0;
pub const N_WRITELN: u32 = 1;
pub const N_READLN: u32 = 2;
pub const N_REPR: u32 = 3;
pub const N_TYPEOF: u32 = 4;
pub const N_EXIT: u32 = 5;
pub const N_COLLECT: u32 = 6;
pub const N_EXC_CREATE: u32 = 7;
pub const N_EXIT_CREATE: u32 = 8;
pub const N_STR_LENGTH: u32 = 9;
pub const N_ARRAY_LENGTH: u32 = 10;
pub const N_ARRAY_APPEND: u32 = 11;
pub const N_ARRAY_ITER: u32 = 12;
pub const N_ARRAY_ITER_HAS_NEXT: u32 = 13;
pub const N_ARRAY_ITER_NEXT: u32 = 14;
pub const N_RANGE_ITER: u32 = 15;
pub const N_RANGE_ITER_HAS_NEXT: u32 = 16;
pub const N_RANGE_ITER_NEXT: u32 = 17;
pub const N_PAIR_LEFT: u32 = 18;
pub const N_PAIR_RIGHT: u32 = 19;

pub const NATIVE_TABLE: &[NativeFn] = &[
    native_write,
    native_write_ln,
    native_read_ln,
    native_repr,
    native_type_of,
    native_exit,
    native_collect_garbage,
    native_exception_create,
    native_exit_exception_create,
    native_str_length,
    native_array_length,
    native_array_append,
    native_array_iterator,
    native_array_iter_has_next,
    native_array_iter_next,
    native_range_iterator,
    native_range_iter_has_next,
    native_range_iter_next,
    native_pair_left,
    native_pair_right,
];

/// The auto-imported prelude.
pub const PRELUDE: NativeModuleDef = NativeModuleDef {
    name: "std",
    auto_import: true,
    items: &[
        NativeItemDef::Def {
            name: "Write",
            min_args: 0,
            max_args: tern_bytecode::VARARG_FLAG,
            func: N_WRITE,
        },
        NativeItemDef::Def {
            name: "WriteLn",
            min_args: 0,
            max_args: tern_bytecode::VARARG_FLAG,
            func: N_WRITELN,
        },
        NativeItemDef::Def {
            name: "ReadLn",
            min_args: 0,
            max_args: 0,
            func: N_READLN,
        },
        NativeItemDef::Def {
            name: "Repr",
            min_args: 1,
            max_args: 1,
            func: N_REPR,
        },
        NativeItemDef::Def {
            name: "TypeOf",
            min_args: 1,
            max_args: 1,
            func: N_TYPEOF,
        },
        NativeItemDef::Def {
            name: "Exit",
            min_args: 0,
            max_args: 1,
            func: N_EXIT,
        },
        NativeItemDef::Def {
            name: "CollectGarbage",
            min_args: 0,
            max_args: 0,
            func: N_COLLECT,
        },
        // The primitive type objects. Instantiating one performs the
        // conversion; the member tables carry the primitive methods.
        NativeItemDef::Class {
            name: "Object",
            supertype: None,
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "Boolean",
            supertype: None,
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "Int",
            supertype: None,
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "Float",
            supertype: None,
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "Str",
            supertype: None,
            has_finalizer: false,
            members: &[NativeMemberDef::Method {
                name: "length",
                min_args: 1,
                max_args: 1,
                func: N_STR_LENGTH,
            }],
        },
        NativeItemDef::Class {
            name: "Array",
            supertype: None,
            has_finalizer: false,
            members: &[
                NativeMemberDef::Method {
                    name: "length",
                    min_args: 1,
                    max_args: 1,
                    func: N_ARRAY_LENGTH,
                },
                NativeMemberDef::Method {
                    name: "append",
                    min_args: 2,
                    max_args: 2,
                    func: N_ARRAY_APPEND,
                },
                NativeMemberDef::Method {
                    name: "iterator",
                    min_args: 1,
                    max_args: 1,
                    func: N_ARRAY_ITER,
                },
            ],
        },
        NativeItemDef::Class {
            name: "Tuple",
            supertype: None,
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "Pair",
            supertype: None,
            has_finalizer: false,
            members: &[
                NativeMemberDef::Getter {
                    name: "left",
                    func: N_PAIR_LEFT,
                },
                NativeMemberDef::Getter {
                    name: "right",
                    func: N_PAIR_RIGHT,
                },
            ],
        },
        NativeItemDef::Class {
            name: "Range",
            supertype: None,
            has_finalizer: false,
            members: &[NativeMemberDef::Method {
                name: "iterator",
                min_args: 1,
                max_args: 1,
                func: N_RANGE_ITER,
            }],
        },
        NativeItemDef::Class {
            name: "Function",
            supertype: None,
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "Type",
            supertype: None,
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "ArrayIterator",
            supertype: None,
            has_finalizer: false,
            members: &[
                NativeMemberDef::Var { name: "items" },
                NativeMemberDef::Var { name: "index" },
                NativeMemberDef::Method {
                    name: "hasNext",
                    min_args: 1,
                    max_args: 1,
                    func: N_ARRAY_ITER_HAS_NEXT,
                },
                NativeMemberDef::Method {
                    name: "next",
                    min_args: 1,
                    max_args: 1,
                    func: N_ARRAY_ITER_NEXT,
                },
            ],
        },
        NativeItemDef::Class {
            name: "RangeIterator",
            supertype: None,
            has_finalizer: false,
            members: &[
                NativeMemberDef::Var { name: "current" },
                NativeMemberDef::Var { name: "stop" },
                NativeMemberDef::Method {
                    name: "hasNext",
                    min_args: 1,
                    max_args: 1,
                    func: N_RANGE_ITER_HAS_NEXT,
                },
                NativeMemberDef::Method {
                    name: "next",
                    min_args: 1,
                    max_args: 1,
                    func: N_RANGE_ITER_NEXT,
                },
            ],
        },
        // The exception hierarchy.
        NativeItemDef::Class {
            name: "Exception",
            supertype: None,
            has_finalizer: false,
            members: &[
                NativeMemberDef::Var { name: "message" },
                NativeMemberDef::Var { name: "traceback" },
                NativeMemberDef::Method {
                    name: "create",
                    min_args: 1,
                    max_args: 2,
                    func: N_EXC_CREATE,
                },
            ],
        },
        NativeItemDef::Class {
            name: "ValueError",
            supertype: Some("Exception"),
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "TypeError",
            supertype: Some("Exception"),
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "MemberError",
            supertype: Some("Exception"),
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "ArithmeticError",
            supertype: Some("Exception"),
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "IndexError",
            supertype: Some("Exception"),
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "KeyError",
            supertype: Some("Exception"),
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "CastError",
            supertype: Some("Exception"),
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "ArgumentError",
            supertype: Some("Exception"),
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "RuntimeError",
            supertype: Some("Exception"),
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "IoError",
            supertype: Some("Exception"),
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "MemoryError",
            supertype: Some("Exception"),
            has_finalizer: false,
            members: &[],
        },
        NativeItemDef::Class {
            name: "ExitException",
            supertype: Some("Exception"),
            has_finalizer: false,
            members: &[
                NativeMemberDef::Var { name: "code" },
                NativeMemberDef::Method {
                    name: "create",
                    min_args: 1,
                    max_args: 2,
                    func: N_EXIT_CREATE,
                },
            ],
        },
    ],
};

// ----- native implementations -----

fn native_write(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    for a in args {
        let text = vm.display_value(*a);
        vm.write_output(&text);
    }
    Ok(Value::Nil)
}

fn native_write_ln(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    native_write(vm, args)?;
    vm.write_output("\n");
    Ok(Value::Nil)
}

fn native_read_ln(vm: &mut Vm, _args: &[Value]) -> Result<Value, Pending> {
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(_) => {
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Ok(vm.alloc_value(HeapObject::Str(line)))
        }
        Err(e) => Err(vm.raise_io_error(&e.to_string())),
    }
}

fn native_repr(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    let text = vm.repr_value(args[0]);
    Ok(vm.alloc_value(HeapObject::Str(text)))
}

fn native_type_of(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    Ok(Value::Type(vm.type_of(args[0])))
}

fn native_exit(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    let code = match args.first() {
        Some(Value::Int(n)) => Value::Int(*n),
        Some(Value::Default) | None => Value::Int(0),
        Some(other) => *other,
    };
    let exc = vm.make_exit_exception(code);
    Err(Pending::Value(exc))
}

fn native_collect_garbage(vm: &mut Vm, _args: &[Value]) -> Result<Value, Pending> {
    vm.collect_full();
    Ok(Value::Nil)
}

fn native_exception_create(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    let this = args[0];
    let message = match args.get(1) {
        Some(Value::Default) | None => Value::Nil,
        Some(v) => *v,
    };
    vm.set_instance_slot(this, 0, message);
    Ok(this)
}

fn native_exit_exception_create(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    let this = args[0];
    let code = match args.get(1) {
        Some(Value::Default) | None => Value::Int(0),
        Some(v) => *v,
    };
    vm.set_instance_slot(this, 2, code);
    Ok(this)
}

fn native_str_length(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    let text = vm.string_value(args[0]).ok_or_else(|| vm.type_error("length expects a string"))?;
    Ok(Value::Int(text.chars().count() as i64))
}

fn native_array_length(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    match args[0].handle().map(|h| vm.heap.get(h)) {
        Some(HeapObject::Array(items)) => Ok(Value::Int(items.len() as i64)),
        Some(HeapObject::Tuple(items)) => Ok(Value::Int(items.len() as i64)),
        _ => Err(vm.type_error("length expects an array")),
    }
}

fn native_array_append(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    let Some(h) = args[0].handle() else {
        return Err(vm.type_error("append expects an array"));
    };
    let value = args[1];
    let field = match vm.heap.get_mut(h) {
        HeapObject::Array(items) => {
            items.push(value);
            items.len() as u32 - 1
        }
        _ => return Err(vm.type_error("append expects an array")),
    };
    vm.heap.record_write(h, field, value);
    Ok(Value::Nil)
}

fn native_array_iterator(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    let tid = vm.well_known.array_iterator;
    let iter = vm.alloc_value(HeapObject::Instance {
        type_id: tid,
        slots: vec![args[0], Value::Int(0)],
    });
    Ok(iter)
}

fn native_array_iter_has_next(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    let (items, index) = array_iter_state(vm, args[0])?;
    Ok(Value::from_bool(index < items))
}

fn native_array_iter_next(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    let this = args[0];
    let h = this.handle().ok_or_else(|| vm.type_error("bad iterator"))?;
    let (array_v, index) = match vm.heap.get(h) {
        HeapObject::Instance { slots, .. } => (slots[0], slots[1]),
        _ => return Err(vm.type_error("bad iterator")),
    };
    let Value::Int(i) = index else {
        return Err(vm.type_error("bad iterator"));
    };
    let ah = array_v.handle().ok_or_else(|| vm.type_error("bad iterator"))?;
    let item = match vm.heap.get(ah) {
        HeapObject::Array(items) | HeapObject::Tuple(items) => {
            items.get(i as usize).copied().ok_or_else(|| vm.raise_index_error("iterator exhausted"))?
        }
        _ => return Err(vm.type_error("bad iterator")),
    };
    vm.set_instance_slot(this, 1, Value::Int(i + 1));
    Ok(item)
}

fn array_iter_state(vm: &mut Vm, this: Value) -> Result<(i64, i64), Pending> {
    let h = this.handle().ok_or_else(|| vm.type_error("bad iterator"))?;
    let (array_v, index) = match vm.heap.get(h) {
        HeapObject::Instance { slots, .. } => (slots[0], slots[1]),
        _ => return Err(vm.type_error("bad iterator")),
    };
    let len = match array_v.handle().map(|ah| vm.heap.get(ah)) {
        Some(HeapObject::Array(items)) | Some(HeapObject::Tuple(items)) => items.len() as i64,
        _ => return Err(vm.type_error("bad iterator")),
    };
    match index {
        Value::Int(i) => Ok((len, i)),
        _ => Err(vm.type_error("bad iterator")),
    }
}

fn native_range_iterator(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    let Some(h) = args[0].handle() else {
        return Err(vm.type_error("iterator expects a range"));
    };
    let (lo, hi) = match vm.heap.get(h) {
        HeapObject::Range(lo, hi) => (*lo, *hi),
        _ => return Err(vm.type_error("iterator expects a range")),
    };
    let tid = vm.well_known.range_iterator;
    Ok(vm.alloc_value(HeapObject::Instance {
        type_id: tid,
        slots: vec![lo, hi],
    }))
}

fn native_range_iter_has_next(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    let h = args[0].handle().ok_or_else(|| vm.type_error("bad iterator"))?;
    match vm.heap.get(h) {
        HeapObject::Instance { slots, .. } => match (slots[0], slots[1]) {
            (Value::Int(cur), Value::Int(stop)) => Ok(Value::from_bool(cur < stop)),
            _ => Err(vm.type_error("bad iterator")),
        },
        _ => Err(vm.type_error("bad iterator")),
    }
}

fn native_range_iter_next(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    let this = args[0];
    let h = this.handle().ok_or_else(|| vm.type_error("bad iterator"))?;
    let cur = match vm.heap.get(h) {
        HeapObject::Instance { slots, .. } => slots[0],
        _ => return Err(vm.type_error("bad iterator")),
    };
    let Value::Int(i) = cur else {
        return Err(vm.type_error("bad iterator"));
    };
    vm.set_instance_slot(this, 0, Value::Int(i + 1));
    Ok(Value::Int(i))
}

fn native_pair_left(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    match args[0].handle().map(|h| vm.heap.get(h)) {
        Some(HeapObject::Pair(a, _)) => Ok(*a),
        _ => Err(vm.type_error("left expects a pair")),
    }
}

fn native_pair_right(vm: &mut Vm, args: &[Value]) -> Result<Value, Pending> {
    match args[0].handle().map(|h| vm.heap.get(h)) {
        Some(HeapObject::Pair(_, b)) => Ok(*b),
        _ => Err(vm.type_error("right expects a pair")),
    }
}
