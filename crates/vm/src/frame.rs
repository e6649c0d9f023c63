use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};

use molt_bytecode::{
    BinaryOperator, CodeObject, ComparisonOperator, Instruction, Label, MakeFunctionFlags,
    RaiseKind, UnaryOperator,
};

use crate::error::VmError;
use crate::function::{CallArgs, Function, GlobalsRef};
use crate::value::{Cell, CellRef, SeqIter, Value};
use crate::vm::Vm;

#[derive(Debug)]
pub enum ExecutionResult {
    Return(Value),
    Yield(Value),
}

/// The reason why we might be unwinding a block.
///
/// This could be a raised exception or a request to return from the frame;
/// possibly held by a finally handler until its body has run.
#[derive(Debug, Clone)]
enum UnwindReason {
    Raising { exception: Value },
    Returning { value: Value },
}

#[derive(Debug, Clone)]
enum BlockType {
    TryExcept {
        handler: Label,
    },
    Finally {
        handler: Label,
    },
    /// Active finally sequence, with the unwind to resume at `EndFinally`
    /// (`None` when the finally block was entered in straight-line flow).
    FinallyHandler {
        reason: Option<UnwindReason>,
    },
    /// Active exception handler; holds the handled exception for `Reraise`.
    ExceptHandler,
}

#[derive(Debug, Clone)]
struct Block {
    typ: BlockType,
    /// The value stack depth at the moment the block was entered.
    level: usize,
}

/// The mutable interpreter state of a frame: the value stack and block stack.
#[derive(Debug, Default)]
pub struct FrameState {
    stack: Vec<Value>,
    blocks: Vec<Block>,
    exception: Option<Value>,
}

/// One activation of a code object.
///
/// Locals and the instruction pointer live outside the interpreter lock so
/// host callbacks fired *by* this frame can read the live activation while
/// the frame is mid-execution.
#[derive(Debug)]
pub struct Frame {
    pub code: Arc<CodeObject>,
    pub globals: GlobalsRef,
    /// Cells, cellvars first then freevars, matching the deref name space.
    pub(crate) cells: Box<[CellRef]>,
    locals: Mutex<Vec<Option<Value>>>,
    /// Index of the next instruction to execute.
    lasti: AtomicU32,
    state: Mutex<FrameState>,
}

pub type FrameRef = Arc<Frame>;

impl Frame {
    pub fn new(
        code: Arc<CodeObject>,
        globals: GlobalsRef,
        mut locals: Vec<Option<Value>>,
        closure: &[CellRef],
    ) -> FrameRef {
        let mut cells = Vec::with_capacity(code.cellvars.len() + code.freevars.len());
        for (i, _) in code.cellvars.iter().enumerate() {
            let cell: CellRef = Arc::new(Cell::default());
            if let Some(cell2arg) = &code.cell2arg {
                let arg = cell2arg[i];
                if arg >= 0 {
                    if let Some(value) = locals[arg as usize].take() {
                        cell.set(value);
                    }
                }
            }
            cells.push(cell);
        }
        cells.extend(closure.iter().cloned());
        Arc::new(Self {
            code,
            globals,
            cells: cells.into_boxed_slice(),
            locals: Mutex::new(locals),
            lasti: AtomicU32::new(0),
            state: Mutex::new(FrameState::default()),
        })
    }

    pub fn lasti(&self) -> u32 {
        self.lasti.load(Ordering::Relaxed)
    }

    /// Source line of the instruction currently executing (0 when unknown).
    pub fn line(&self) -> u32 {
        let idx = (self.lasti().max(1) - 1) as usize;
        self.code.lines.get(idx).copied().unwrap_or(0)
    }

    /// Snapshot the named local variables that currently hold a value,
    /// including cell variables. Safe to call from host callbacks while the
    /// frame is running.
    pub fn activation(&self) -> IndexMap<String, Value> {
        let mut out = IndexMap::new();
        {
            let locals = self.locals.lock();
            for (name, slot) in self.code.varnames.iter().zip(locals.iter()) {
                if let Some(value) = slot {
                    out.insert(name.clone(), value.clone());
                }
            }
        }
        let names = self.code.cellvars.iter().chain(self.code.freevars.iter());
        for (name, cell) in names.zip(self.cells.iter()) {
            if let Some(value) = cell.get() {
                out.insert(name.clone(), value.clone());
            }
        }
        out
    }

    pub fn get_local(&self, name: &str) -> Option<Value> {
        let idx = self.code.varnames.iter().position(|n| n == name)?;
        self.locals.lock()[idx].clone()
    }

    /// Push the value a suspended `YieldValue` resumes with.
    pub(crate) fn push_resume_value(&self, value: Value) {
        self.state.lock().stack.push(value);
    }
}

/// A frame being stepped by the interpreter; holds the state lock for the
/// whole run.
pub(crate) struct ExecutingFrame<'a> {
    code: Arc<CodeObject>,
    frame: &'a FrameRef,
    state: MutexGuard<'a, FrameState>,
}

impl<'a> ExecutingFrame<'a> {
    pub(crate) fn new(frame: &'a FrameRef) -> Self {
        Self {
            code: frame.code.clone(),
            frame,
            state: frame.state.lock(),
        }
    }

    pub(crate) fn run(&mut self, vm: &Vm) -> Result<ExecutionResult, VmError> {
        let code = self.code.clone();
        loop {
            let idx = self.frame.lasti() as usize;
            let Some(instruction) = code.instructions.get(idx) else {
                return Err(VmError::Bytecode("execution ran off the end of the code"));
            };
            self.frame.lasti.store(idx as u32 + 1, Ordering::Relaxed);
            log::trace!("{:?} {idx:>5} {instruction:?}", self.frame.code);

            match self.execute_instruction(vm, instruction) {
                Ok(None) => {}
                Ok(Some(result)) => return Ok(result),
                Err(VmError::Raised(exception)) => {
                    if let Some(result) = self.unwind_blocks(UnwindReason::Raising { exception })? {
                        return Ok(result);
                    }
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }

    fn execute_instruction(
        &mut self,
        vm: &Vm,
        instruction: &Instruction,
    ) -> Result<Option<ExecutionResult>, VmError> {
        match instruction {
            Instruction::LoadConst { idx } => {
                let value = Value::from_constant(&self.code.constants[*idx as usize]);
                self.push_value(value);
                Ok(None)
            }
            Instruction::LoadFast(idx) => {
                let value = self.frame.locals.lock()[*idx as usize].clone();
                match value {
                    Some(value) => {
                        self.push_value(value);
                        Ok(None)
                    }
                    None => Err(VmError::UnboundLocal(
                        self.code.varnames[*idx as usize].clone(),
                    )),
                }
            }
            Instruction::StoreFast(idx) => {
                let value = self.pop_value()?;
                self.frame.locals.lock()[*idx as usize] = Some(value);
                Ok(None)
            }
            Instruction::LoadGlobal(idx) => {
                let name = &self.code.names[*idx as usize];
                let value = self.frame.globals.lock().get(name).cloned();
                match value {
                    Some(value) => {
                        self.push_value(value);
                        Ok(None)
                    }
                    None => Err(VmError::NameError(name.clone())),
                }
            }
            Instruction::StoreGlobal(idx) => {
                let name = self.code.names[*idx as usize].clone();
                let value = self.pop_value()?;
                self.frame.globals.lock().insert(name, value);
                Ok(None)
            }
            Instruction::LoadDeref(idx) => match self.frame.cells[*idx as usize].get() {
                Some(value) => {
                    self.push_value(value);
                    Ok(None)
                }
                None => Err(VmError::UnboundLocal(self.deref_name(*idx).to_owned())),
            },
            Instruction::StoreDeref(idx) => {
                let value = self.pop_value()?;
                self.frame.cells[*idx as usize].set(value);
                Ok(None)
            }
            Instruction::LoadClosure(idx) => {
                let cell = self.frame.cells[*idx as usize].clone();
                self.push_value(Value::Cell(cell));
                Ok(None)
            }
            Instruction::LoadAttr { idx, .. } | Instruction::LoadMethod { idx } => {
                let receiver = self.pop_value()?;
                match receiver {
                    Value::Host(object) => {
                        self.push_value(Value::HostBound {
                            object,
                            method: self.code.names[*idx as usize].as_str().into(),
                        });
                        Ok(None)
                    }
                    other => Err(VmError::type_error(format!(
                        "{other:?} has no attribute {:?}",
                        self.code.names[*idx as usize]
                    ))),
                }
            }
            Instruction::Pop => {
                self.pop_value()?;
                Ok(None)
            }
            Instruction::Duplicate => {
                let value = self.top_value()?.clone();
                self.push_value(value);
                Ok(None)
            }
            Instruction::Rotate2 => {
                let len = self.state.stack.len();
                if len < 2 {
                    return Err(VmError::Bytecode("stack underflow in Rotate2"));
                }
                self.state.stack.swap(len - 1, len - 2);
                Ok(None)
            }
            Instruction::PushNull => {
                self.push_value(Value::Null);
                Ok(None)
            }
            Instruction::BinaryOperation { op } => {
                let b = self.pop_value()?;
                let a = self.pop_value()?;
                let result = binary_op(*op, a, b)?;
                self.push_value(result);
                Ok(None)
            }
            Instruction::CompareOperation { op } => {
                let b = self.pop_value()?;
                let a = self.pop_value()?;
                let result = compare_op(*op, &a, &b)?;
                self.push_value(Value::Bool(result));
                Ok(None)
            }
            Instruction::UnaryOperation { op } => {
                let value = self.pop_value()?;
                let result = match op {
                    UnaryOperator::Not => Value::Bool(!value.is_true()),
                    UnaryOperator::Minus => match value {
                        Value::Int(i) => Value::Int(-i),
                        Value::Float(f) => Value::Float(-f),
                        other => {
                            return Err(VmError::type_error(format!("cannot negate {other:?}")))
                        }
                    },
                };
                self.push_value(result);
                Ok(None)
            }
            Instruction::Subscript => {
                let key = self.pop_value()?;
                let container = self.pop_value()?;
                let value = subscript(&container, &key)?;
                self.push_value(value);
                Ok(None)
            }
            Instruction::BuildTuple { size } => {
                let elements = self.pop_multiple(*size as usize)?;
                self.push_value(Value::tuple(elements));
                Ok(None)
            }
            Instruction::BuildList { size } => {
                let elements = self.pop_multiple(*size as usize)?;
                self.push_value(Value::list(elements));
                Ok(None)
            }
            Instruction::BuildMap { size } => {
                let mut map = IndexMap::new();
                let entries = self.pop_multiple(*size as usize * 2)?;
                let mut entries = entries.into_iter();
                while let (Some(key), Some(value)) = (entries.next(), entries.next()) {
                    let Value::Str(key) = key else {
                        return Err(VmError::type_error("map keys must be strings"));
                    };
                    map.insert(key.to_string(), value);
                }
                self.push_value(Value::map(map));
                Ok(None)
            }
            Instruction::DictMerge => {
                let other = self.pop_value()?;
                let target = self.top_value()?.clone();
                match (&target, &other) {
                    (Value::Map(into), Value::Map(from)) => {
                        let from = from.lock().clone();
                        into.lock().extend(from);
                        Ok(None)
                    }
                    _ => Err(VmError::type_error("DictMerge expects two maps")),
                }
            }
            Instruction::Jump { target } | Instruction::JumpBackward { target } => {
                self.jump(*target);
                Ok(None)
            }
            Instruction::JumpIfFalse { target } => {
                let value = self.pop_value()?;
                if !value.is_true() {
                    self.jump(*target);
                }
                Ok(None)
            }
            Instruction::JumpIfTrue { target } => {
                let value = self.pop_value()?;
                if value.is_true() {
                    self.jump(*target);
                }
                Ok(None)
            }
            Instruction::GetIter => {
                let value = self.pop_value()?;
                let iter = match value {
                    gen @ Value::Generator(_) => gen,
                    it @ Value::Iter(_) => it,
                    Value::List(l) => {
                        Value::Iter(Arc::new(Mutex::new(SeqIter::new(l.lock().clone()))))
                    }
                    Value::Tuple(t) => {
                        Value::Iter(Arc::new(Mutex::new(SeqIter::new(t.to_vec()))))
                    }
                    other => {
                        return Err(VmError::type_error(format!("{other:?} is not iterable")))
                    }
                };
                self.push_value(iter);
                Ok(None)
            }
            Instruction::ForIter { target } => {
                let next = match self.top_value()? {
                    Value::Iter(it) => {
                        let it = it.clone();
                        let mut it = it.lock();
                        it.next()
                    }
                    Value::Generator(gen) => {
                        let gen = gen.clone();
                        vm.resume_generator(&gen)?
                    }
                    other => {
                        return Err(VmError::type_error(format!("{other:?} is not an iterator")))
                    }
                };
                match next {
                    Some(value) => self.push_value(value),
                    None => {
                        self.pop_value()?;
                        self.jump(*target);
                    }
                }
                Ok(None)
            }
            Instruction::SetupExcept { handler } => {
                self.push_block(BlockType::TryExcept { handler: *handler });
                Ok(None)
            }
            Instruction::SetupFinally { handler } => {
                self.push_block(BlockType::Finally { handler: *handler });
                Ok(None)
            }
            Instruction::EnterFinally => {
                self.push_block(BlockType::FinallyHandler { reason: None });
                Ok(None)
            }
            Instruction::EndFinally => {
                let block = self.pop_block()?;
                match block.typ {
                    BlockType::FinallyHandler { reason: Some(reason) } => {
                        self.unwind_blocks(reason)
                    }
                    BlockType::FinallyHandler { reason: None } => Ok(None),
                    _ => Err(VmError::Bytecode("EndFinally outside a finally handler")),
                }
            }
            Instruction::PopBlock => {
                self.pop_block()?;
                Ok(None)
            }
            Instruction::PopException => {
                let block = self.pop_block()?;
                match block.typ {
                    BlockType::ExceptHandler => {
                        self.state.exception = None;
                        Ok(None)
                    }
                    _ => Err(VmError::Bytecode("PopException outside an except handler")),
                }
            }
            Instruction::Raise { kind } => {
                let exception = match kind {
                    RaiseKind::Raise => self.pop_value()?,
                    RaiseKind::Reraise => self
                        .state
                        .exception
                        .clone()
                        .ok_or(VmError::Bytecode("Reraise with no active exception"))?,
                };
                Err(VmError::Raised(exception))
            }
            Instruction::MakeFunction(flags) => {
                self.execute_make_function(*flags)?;
                Ok(None)
            }
            Instruction::CallFunctionPositional { nargs } => {
                let args = self.pop_multiple(*nargs as usize)?;
                let callee = self.pop_value()?;
                let value = self.call_value(vm, callee, CallArgs::positional(args))?;
                self.push_value(value);
                Ok(None)
            }
            Instruction::CallMethodPositional { nargs } | Instruction::Call { nargs } => {
                let args = self.pop_multiple(*nargs as usize)?;
                let callee = self.pop_callee()?;
                let value = self.call_value(vm, callee, CallArgs::positional(args))?;
                self.push_value(value);
                Ok(None)
            }
            Instruction::CallFunctionEx { has_kwargs } => {
                let kwargs = if *has_kwargs {
                    match self.pop_value()? {
                        Value::Map(m) => {
                            let m = m.lock();
                            m.clone()
                        }
                        other => {
                            return Err(VmError::type_error(format!(
                                "argument unpacking expects a map, not {other:?}"
                            )))
                        }
                    }
                } else {
                    IndexMap::new()
                };
                let args = match self.pop_value()? {
                    Value::Tuple(t) => t.to_vec(),
                    Value::List(l) => l.lock().clone(),
                    other => {
                        return Err(VmError::type_error(format!(
                            "argument unpacking expects a sequence, not {other:?}"
                        )))
                    }
                };
                let callee = self.pop_callee()?;
                let value = self.call_value(vm, callee, CallArgs { args, kwargs })?;
                self.push_value(value);
                Ok(None)
            }
            Instruction::Precall { .. } => Ok(None),
            Instruction::ReturnValue => {
                let value = self.pop_value()?;
                self.unwind_blocks(UnwindReason::Returning { value })
            }
            Instruction::ReturnConst { idx } => {
                let value = Value::from_constant(&self.code.constants[*idx as usize]);
                self.unwind_blocks(UnwindReason::Returning { value })
            }
            Instruction::YieldValue => {
                let value = self.pop_value()?;
                Ok(Some(ExecutionResult::Yield(value)))
            }
            Instruction::Resume { .. } | Instruction::GenStart | Instruction::Nop => Ok(None),
        }
    }

    /// Unwind the block stack for `reason`. `Ok(None)` means a handler took
    /// over and execution continues; `Ok(Some(..))` means the frame is done.
    fn unwind_blocks(
        &mut self,
        reason: UnwindReason,
    ) -> Result<Option<ExecutionResult>, VmError> {
        while let Some(block) = self.state.blocks.last().cloned() {
            match block.typ {
                BlockType::TryExcept { handler } => {
                    self.pop_block()?;
                    if let UnwindReason::Raising { exception } = &reason {
                        let exception = exception.clone();
                        self.push_block(BlockType::ExceptHandler);
                        self.state.exception = Some(exception.clone());
                        self.push_value(exception);
                        self.jump(handler);
                        return Ok(None);
                    }
                }
                BlockType::Finally { handler } => {
                    self.pop_block()?;
                    self.push_block(BlockType::FinallyHandler {
                        reason: Some(reason),
                    });
                    self.jump(handler);
                    return Ok(None);
                }
                BlockType::FinallyHandler { .. } => {
                    self.pop_block()?;
                }
                BlockType::ExceptHandler => {
                    self.pop_block()?;
                    self.state.exception = None;
                }
            }
        }
        match reason {
            UnwindReason::Returning { value } => Ok(Some(ExecutionResult::Return(value))),
            UnwindReason::Raising { exception } => Err(VmError::Raised(exception)),
        }
    }

    fn execute_make_function(&mut self, flags: MakeFunctionFlags) -> Result<(), VmError> {
        let code = match self.pop_value()? {
            Value::Code(code) => code,
            other => {
                return Err(VmError::type_error(format!(
                    "MakeFunction expects a code object, not {other:?}"
                )))
            }
        };
        let closure = if flags.contains(MakeFunctionFlags::CLOSURE) {
            match self.pop_value()? {
                Value::Tuple(cells) => cells
                    .iter()
                    .map(|v| match v {
                        Value::Cell(cell) => Ok(cell.clone()),
                        other => Err(VmError::type_error(format!(
                            "closure tuple holds {other:?}, expected cells"
                        ))),
                    })
                    .collect::<Result<Box<[CellRef]>, _>>()?,
                other => {
                    return Err(VmError::type_error(format!(
                        "MakeFunction closure expects a tuple, not {other:?}"
                    )))
                }
            }
        } else {
            Box::new([])
        };
        let defaults = if flags.contains(MakeFunctionFlags::DEFAULTS) {
            match self.pop_value()? {
                Value::Tuple(defaults) => defaults.to_vec(),
                other => {
                    return Err(VmError::type_error(format!(
                        "MakeFunction defaults expects a tuple, not {other:?}"
                    )))
                }
            }
        } else {
            Vec::new()
        };
        let func = Function::new(code, self.frame.globals.clone(), defaults, closure);
        self.push_value(Value::Function(func));
        Ok(())
    }

    fn call_value(&mut self, vm: &Vm, callee: Value, args: CallArgs) -> Result<Value, VmError> {
        match callee {
            Value::Function(func) => vm.call_function(&func, args),
            Value::Host(id) => vm.host(id)?.call(vm, self.frame, args),
            Value::HostBound { object, method } => {
                vm.host(object)?.call_method(vm, self.frame, &method, args)
            }
            other => Err(VmError::type_error(format!("{other:?} is not callable"))),
        }
    }

    /// Pop the callee of a `Call`-family instruction, consuming the
    /// call-protocol sentinel when the emitting revision pushed one. Revision
    /// 1.2 pushes the sentinel below the callee, 1.3+ above it; the legacy
    /// instructions push none at all.
    fn pop_callee(&mut self) -> Result<Value, VmError> {
        let mut callee = self.pop_value()?;
        if matches!(callee, Value::Null) {
            callee = self.pop_value()?;
        } else if matches!(self.state.stack.last(), Some(Value::Null)) {
            self.state.stack.pop();
        }
        Ok(callee)
    }

    fn deref_name(&self, idx: u32) -> &str {
        let idx = idx as usize;
        if idx < self.code.cellvars.len() {
            &self.code.cellvars[idx]
        } else {
            &self.code.freevars[idx - self.code.cellvars.len()]
        }
    }

    fn jump(&mut self, label: Label) {
        self.frame.lasti.store(label.0, Ordering::Relaxed);
    }

    fn push_block(&mut self, typ: BlockType) {
        let level = self.state.stack.len();
        self.state.blocks.push(Block { typ, level });
    }

    fn pop_block(&mut self) -> Result<Block, VmError> {
        let block = self
            .state
            .blocks
            .pop()
            .ok_or(VmError::Bytecode("block stack underflow"))?;
        self.state.stack.truncate(block.level);
        Ok(block)
    }

    fn push_value(&mut self, value: Value) {
        self.state.stack.push(value);
    }

    fn pop_value(&mut self) -> Result<Value, VmError> {
        self.state
            .stack
            .pop()
            .ok_or(VmError::Bytecode("value stack underflow"))
    }

    fn pop_multiple(&mut self, count: usize) -> Result<Vec<Value>, VmError> {
        let len = self.state.stack.len();
        if len < count {
            return Err(VmError::Bytecode("value stack underflow"));
        }
        Ok(self.state.stack.split_off(len - count))
    }

    fn top_value(&self) -> Result<&Value, VmError> {
        self.state
            .stack
            .last()
            .ok_or(VmError::Bytecode("value stack underflow"))
    }
}

fn binary_op(op: BinaryOperator, a: Value, b: Value) -> Result<Value, VmError> {
    use BinaryOperator::*;
    let value = match (op, &a, &b) {
        (Add, Value::Int(x), Value::Int(y)) => Value::Int(x + y),
        (Subtract, Value::Int(x), Value::Int(y)) => Value::Int(x - y),
        (Multiply, Value::Int(x), Value::Int(y)) => Value::Int(x * y),
        (FloorDivide, Value::Int(x), Value::Int(y)) => {
            if *y == 0 {
                return Err(VmError::Raised(Value::str("division by zero")));
            }
            Value::Int(x.div_euclid(*y))
        }
        (Modulo, Value::Int(x), Value::Int(y)) => {
            if *y == 0 {
                return Err(VmError::Raised(Value::str("division by zero")));
            }
            Value::Int(x.rem_euclid(*y))
        }
        (Divide, Value::Int(x), Value::Int(y)) => {
            if *y == 0 {
                return Err(VmError::Raised(Value::str("division by zero")));
            }
            Value::Float(*x as f64 / *y as f64)
        }
        (Add, Value::Str(x), Value::Str(y)) => Value::str(format!("{x}{y}")),
        (_, Value::Float(_) | Value::Int(_), Value::Float(_) | Value::Int(_)) => {
            let (x, y) = (as_float(&a), as_float(&b));
            match op {
                Add => Value::Float(x + y),
                Subtract => Value::Float(x - y),
                Multiply => Value::Float(x * y),
                Divide | FloorDivide => {
                    if y == 0.0 {
                        return Err(VmError::Raised(Value::str("division by zero")));
                    }
                    let q = x / y;
                    if matches!(op, FloorDivide) {
                        Value::Float(q.floor())
                    } else {
                        Value::Float(q)
                    }
                }
                Modulo => Value::Float(x.rem_euclid(y)),
            }
        }
        _ => {
            return Err(VmError::type_error(format!(
                "unsupported operand types for {op:?}: {a:?} and {b:?}"
            )))
        }
    };
    Ok(value)
}

fn as_float(v: &Value) -> f64 {
    match v {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => f64::NAN,
    }
}

fn compare_op(op: ComparisonOperator, a: &Value, b: &Value) -> Result<bool, VmError> {
    use ComparisonOperator::*;
    if matches!(op, Equal | NotEqual) {
        let eq = a.try_eq(b).unwrap_or(false);
        return Ok(if matches!(op, Equal) { eq } else { !eq });
    }
    let ordering = match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => x.partial_cmp(y),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            as_float(a).partial_cmp(&as_float(b))
        }
        _ => None,
    };
    let Some(ordering) = ordering else {
        return Err(VmError::type_error(format!(
            "{a:?} and {b:?} are not comparable"
        )));
    };
    Ok(match op {
        Less => ordering.is_lt(),
        LessOrEqual => ordering.is_le(),
        Greater => ordering.is_gt(),
        GreaterOrEqual => ordering.is_ge(),
        Equal | NotEqual => unreachable!(),
    })
}

fn subscript(container: &Value, key: &Value) -> Result<Value, VmError> {
    let index_into = |len: usize, i: i64| -> Option<usize> {
        let i = if i < 0 { i + len as i64 } else { i };
        usize::try_from(i).ok().filter(|i| *i < len)
    };
    match (container, key) {
        (Value::Tuple(t), Value::Int(i)) => index_into(t.len(), *i)
            .map(|i| t[i].clone())
            .ok_or(VmError::Raised(Value::str("sequence index out of range"))),
        (Value::List(l), Value::Int(i)) => {
            let l = l.lock();
            index_into(l.len(), *i)
                .map(|i| l[i].clone())
                .ok_or(VmError::Raised(Value::str("sequence index out of range")))
        }
        (Value::Map(m), Value::Str(k)) => m
            .lock()
            .get(&**k)
            .cloned()
            .ok_or_else(|| VmError::Raised(Value::str(format!("key not found: {k}")))),
        _ => Err(VmError::type_error(format!(
            "{container:?} is not subscriptable by {key:?}"
        ))),
    }
}
