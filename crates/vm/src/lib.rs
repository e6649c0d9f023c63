//! A small embeddable interpreter for Molt bytecode.
//!
//! The VM exists to *run* code units, instrumented or not: functions carry a
//! swappable code object behind a lock, frames expose their local activation
//! to host callbacks while executing, and host objects let generated bytecode
//! call back into the embedding engine. It executes the union of all bytecode
//! revisions' call conventions, so a unit produced for any supported revision
//! runs unmodified.

mod builder;
mod error;
mod frame;
mod function;
mod value;
mod vm;

pub use builder::CodeBuilder;
pub use error::VmError;
pub use frame::{ExecutionResult, Frame, FrameRef, FrameState};
pub use function::{CallArgs, Function, FunctionRef, GlobalsRef};
pub use value::{Cell, CellRef, Generator, GeneratorRef, SeqIter, Value};
pub use vm::{HostHook, RuntimeVersion, Vm};
