pub mod exceptions;
pub mod heap;
pub mod interp;
pub mod natives;
pub mod ops;
pub mod value;
pub mod vm;

pub use crate::exceptions::Pending;
pub use crate::heap::{GcPhase, Heap, INCREMENTALITY, MIN_BIG_BLOCK_UNITS};
pub use crate::natives::{NativeFn, NATIVE_TABLE, PRELUDE};
pub use crate::value::{Gen, HeapObject, ObjectHandle, Value};
pub use crate::vm::{Frame, Outcome, ThreadState, Vm, VmModule, WellKnown};
