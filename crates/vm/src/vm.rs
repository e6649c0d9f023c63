use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::error::VmError;
use crate::frame::{ExecutingFrame, ExecutionResult, Frame, FrameRef};
use crate::function::{bind_args, CallArgs, FunctionRef, GlobalsRef};
use crate::value::{Generator, GeneratorRef, Value};

/// Bytecode revision of the engine, as `major.minor`. Each revision may
/// change the call convention the compiler emits; the interpreter itself
/// accepts them all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeVersion {
    pub major: u16,
    pub minor: u16,
}

impl RuntimeVersion {
    pub const CURRENT: Self = Self::new(1, 4);

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// An engine-side object callable from bytecode.
///
/// Generated code references one through a `HostRef` constant; calling it (or
/// a method bound on it) re-enters the embedder with the frame that made the
/// call, so the embedder can inspect the live activation.
pub trait HostHook: Send + Sync {
    fn call(&self, vm: &Vm, frame: &FrameRef, args: CallArgs) -> Result<Value, VmError> {
        let _ = (vm, frame, args);
        Err(VmError::type_error("host object is not callable"))
    }

    fn call_method(
        &self,
        vm: &Vm,
        frame: &FrameRef,
        method: &str,
        args: CallArgs,
    ) -> Result<Value, VmError> {
        let _ = (vm, frame, args);
        Err(VmError::type_error(format!(
            "host object has no method {method:?}"
        )))
    }
}

/// The interpreter, plus the registry of host objects bytecode may call back
/// into. Reentrant: host hooks may call into the VM again.
pub struct Vm {
    version: RuntimeVersion,
    hosts: RwLock<Vec<Option<Arc<dyn HostHook>>>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_version(RuntimeVersion::CURRENT)
    }

    pub fn with_version(version: RuntimeVersion) -> Self {
        Self {
            version,
            hosts: RwLock::new(Vec::new()),
        }
    }

    pub fn version(&self) -> RuntimeVersion {
        self.version
    }

    pub fn new_globals() -> GlobalsRef {
        Arc::new(Mutex::new(IndexMap::new()))
    }

    /// Register a host object; the returned id is what `HostRef` constants in
    /// generated code resolve to. Ids are never reused.
    pub fn register_host_object(&self, hook: Arc<dyn HostHook>) -> u32 {
        let mut hosts = self.hosts.write();
        hosts.push(Some(hook));
        (hosts.len() - 1) as u32
    }

    /// Drop a registered host object. Code still holding its `HostRef` gets
    /// an `UnknownHostRef` error when calling it.
    pub fn unregister_host_object(&self, id: u32) {
        if let Some(slot) = self.hosts.write().get_mut(id as usize) {
            *slot = None;
        }
    }

    pub fn host(&self, id: u32) -> Result<Arc<dyn HostHook>, VmError> {
        self.hosts
            .read()
            .get(id as usize)
            .and_then(Clone::clone)
            .ok_or(VmError::UnknownHostRef(id))
    }

    /// Call a function with the given arguments. For generator functions this
    /// returns the (not yet started) generator value.
    pub fn call_function(
        &self,
        func: &FunctionRef,
        args: impl Into<CallArgs>,
    ) -> Result<Value, VmError> {
        let code = func.code();
        let locals = bind_args(&code, func.defaults(), args.into())?;
        let frame = Frame::new(code.clone(), func.globals().clone(), locals, func.closure());
        if code.is_generator() {
            return Ok(Value::Generator(Generator::new(frame)));
        }
        match self.run_frame(&frame)? {
            ExecutionResult::Return(value) => Ok(value),
            ExecutionResult::Yield(_) => {
                Err(VmError::Bytecode("yield outside a generator function"))
            }
        }
    }

    /// Run a frame to its next suspension point or completion.
    pub fn run_frame(&self, frame: &FrameRef) -> Result<ExecutionResult, VmError> {
        let mut exec = ExecutingFrame::new(frame);
        exec.run(self)
    }

    /// Advance a generator; `None` means it is exhausted. A generator that
    /// raises is marked exhausted and the exception propagates.
    pub fn resume_generator(&self, gen: &GeneratorRef) -> Result<Option<Value>, VmError> {
        if gen.is_finished() {
            return Ok(None);
        }
        if gen.frame.lasti() > 0 {
            // resuming a suspended yield expression; it evaluates to None
            gen.frame.push_resume_value(Value::None);
        }
        match self.run_frame(&gen.frame) {
            Ok(ExecutionResult::Yield(value)) => Ok(Some(value)),
            Ok(ExecutionResult::Return(_)) => {
                *gen.finished.lock() = true;
                Ok(None)
            }
            Err(err) => {
                *gen.finished.lock() = true;
                Err(err)
            }
        }
    }
}
