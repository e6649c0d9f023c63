//! End-to-end instrumentation behavior: installing probes on live functions,
//! observable transparency, entry/exit event delivery, and reversibility.

use std::sync::Arc;

use molt_bytecode::{BinaryOperator, ComparisonOperator, ConstantData, Instruction, RaiseKind};
use molt_probe::{
    value_to_json, CapturedEvent, Captures, CodeGenerator, EventTransport, Installation,
    MemoryStores, Probe, ProbeError, ProbeExecutor, ProbePhase, ProbeRuntime, ProbeSpec,
    ProbeStore, Program, StoreProvider,
};
use molt_probe::CallOutcome;
use molt_vm::{CodeBuilder, FrameRef, Function, FunctionRef, Value, Vm};
use parking_lot::Mutex;

/// Captures the full activation, plus the call outcome when present, and
/// counts its firings in the program store.
struct SnapshotExecutor;

impl ProbeExecutor for SnapshotExecutor {
    fn execute(
        &self,
        _program: &Program,
        _probe: &Probe,
        frame: &FrameRef,
        store: Arc<dyn ProbeStore>,
        outcome: Option<&CallOutcome>,
    ) -> Result<Option<Captures>, ProbeError> {
        let mut captures = Captures::new();
        for (name, value) in frame.activation() {
            captures.insert(name, value_to_json(&value));
        }
        if let Some(outcome) = outcome {
            if let Some(retval) = &outcome.retval {
                captures.insert("@return".to_owned(), value_to_json(retval));
            }
            if let Some(exception) = &outcome.exception {
                captures.insert("@exception".to_owned(), value_to_json(exception));
            }
        }
        let fired = store.get("fired").and_then(|v| v.as_i64()).unwrap_or(0);
        store.set("fired", (fired + 1).into());
        Ok(Some(captures))
    }
}

#[derive(Default)]
struct RecordingTransport {
    events: Mutex<Vec<CapturedEvent>>,
}

impl EventTransport for RecordingTransport {
    fn submit(&self, event: CapturedEvent) {
        self.events.lock().push(event);
    }
}

impl RecordingTransport {
    fn entries(&self) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.probe_spec.specifier.ends_with(":entry"))
            .cloned()
            .collect()
    }

    fn exits(&self) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.probe_spec.specifier.ends_with(":exit"))
            .cloned()
            .collect()
    }
}

struct Harness {
    vm: Arc<Vm>,
    gen: CodeGenerator,
    transport: Arc<RecordingTransport>,
    stores: Arc<MemoryStores>,
    runtime: Arc<ProbeRuntime>,
}

fn harness() -> Harness {
    let vm = Arc::new(Vm::new());
    let gen = CodeGenerator::detect(vm.version()).unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let stores = Arc::new(MemoryStores::default());
    let runtime = Arc::new(ProbeRuntime {
        executor: Arc::new(SnapshotExecutor),
        transport: transport.clone(),
        stores: stores.clone(),
        context_id: "ctx-test".to_owned(),
    });
    Harness {
        vm,
        gen,
        transport,
        stores,
        runtime,
    }
}

fn probe_pair(target: &str) -> (Arc<Program>, Arc<Probe>, Arc<Probe>) {
    let entry = Arc::new(Probe {
        id: format!("{target}-entry"),
        spec: ProbeSpec::new(target, ProbePhase::Entry),
        condition: None,
    });
    let exit = Arc::new(Probe {
        id: format!("{target}-exit"),
        spec: ProbeSpec::new(target, ProbePhase::Exit),
        condition: None,
    });
    let program = Arc::new(Program {
        id: "prog-1".to_owned(),
        hash: 1,
        bytecode: Arc::from(&b""[..]),
        probes: vec![entry.clone(), exit.clone()],
    });
    (program, entry, exit)
}

fn install_both(h: &Harness, function: &FunctionRef) -> Arc<Installation> {
    let (program, entry, exit) = probe_pair(function.name());
    Installation::install(
        &h.vm,
        &h.gen,
        function.clone(),
        vec![(program.clone(), entry)],
        vec![(program, exit)],
        h.runtime.clone(),
    )
}

fn func(code: Arc<molt_bytecode::CodeObject>) -> FunctionRef {
    Function::new(code, Vm::new_globals(), vec![], Box::new([]))
}

fn call_int(vm: &Vm, f: &FunctionRef, args: Vec<Value>) -> i64 {
    match vm.call_function(f, args).unwrap() {
        Value::Int(i) => i,
        other => panic!("expected int, got {other:?}"),
    }
}

/// def adder(a, b): return a + b
fn adder() -> FunctionRef {
    let mut b = CodeBuilder::new("adder", &["a", "b"]);
    b.emit(Instruction::Resume { arg: 0 });
    b.set_line(2)
        .emit(Instruction::LoadFast(0))
        .emit(Instruction::LoadFast(1))
        .emit(Instruction::BinaryOperation {
            op: BinaryOperator::Add,
        })
        .emit(Instruction::ReturnValue);
    func(b.finish())
}

/// def early_return(a, b): if a > b: return a; return b
fn early_return() -> FunctionRef {
    let mut b = CodeBuilder::new("early_return", &["a", "b"]);
    let otherwise = b.label();
    b.emit(Instruction::Resume { arg: 0 });
    b.set_line(2)
        .emit(Instruction::LoadFast(0))
        .emit(Instruction::LoadFast(1));
    let t = b.target(otherwise);
    b.emit(Instruction::CompareOperation {
        op: ComparisonOperator::Greater,
    })
    .emit(Instruction::JumpIfFalse { target: t });
    b.set_line(3)
        .emit(Instruction::LoadFast(0))
        .emit(Instruction::ReturnValue);
    b.mark(otherwise);
    b.set_line(4)
        .emit(Instruction::LoadFast(1))
        .emit(Instruction::ReturnValue);
    func(b.finish())
}

/// def thrower(): raise "boom"
fn thrower() -> FunctionRef {
    let mut b = CodeBuilder::new("thrower", &[]);
    b.emit(Instruction::Resume { arg: 0 });
    b.set_line(2).load_const(ConstantData::Str {
        value: "boom".to_owned(),
    });
    b.emit(Instruction::Raise {
        kind: RaiseKind::Raise,
    });
    func(b.finish())
}

/// def fact(n): if n < 2: return 1; return n * fact(n - 1)
///
/// The recursive call goes through the global binding, so once the function
/// is redirected every recursion level re-enters the trampoline.
fn fact() -> FunctionRef {
    let mut b = CodeBuilder::new("fact", &["n"]);
    let recurse = b.label();
    let fact_name = b.name("fact");
    b.emit(Instruction::Resume { arg: 0 });
    b.set_line(2).emit(Instruction::LoadFast(0));
    b.load_const(ConstantData::Integer { value: 2 });
    let t = b.target(recurse);
    b.emit(Instruction::CompareOperation {
        op: ComparisonOperator::Less,
    })
    .emit(Instruction::JumpIfFalse { target: t });
    b.set_line(3).return_const(ConstantData::Integer { value: 1 });
    b.mark(recurse);
    b.set_line(4)
        .emit(Instruction::LoadFast(0))
        .emit(Instruction::LoadGlobal(fact_name))
        .emit(Instruction::LoadFast(0));
    b.load_const(ConstantData::Integer { value: 1 });
    b.emit(Instruction::BinaryOperation {
        op: BinaryOperator::Subtract,
    })
    .emit(Instruction::CallFunctionPositional { nargs: 1 })
    .emit(Instruction::BinaryOperation {
        op: BinaryOperator::Multiply,
    })
    .emit(Instruction::ReturnValue);
    let f = func(b.finish());
    f.globals().lock().insert("fact".to_owned(), Value::Function(f.clone()));
    f
}

#[test]
fn instrumented_calls_return_the_same_results() {
    let h = harness();

    let add = adder();
    install_both(&h, &add);
    assert_eq!(call_int(&h.vm, &add, vec![Value::Int(3), Value::Int(4)]), 7);

    let er = early_return();
    install_both(&h, &er);
    assert_eq!(call_int(&h.vm, &er, vec![Value::Int(9), Value::Int(1)]), 9);
    assert_eq!(call_int(&h.vm, &er, vec![Value::Int(2), Value::Int(8)]), 8);
}

#[test]
fn each_call_produces_one_entry_and_one_exit_event() {
    let h = harness();
    let add = adder();
    install_both(&h, &add);

    for _ in 0..3 {
        call_int(&h.vm, &add, vec![Value::Int(1), Value::Int(2)]);
    }

    let entries = h.transport.entries();
    let exits = h.transport.exits();
    assert_eq!(entries.len(), 3);
    assert_eq!(exits.len(), 3);

    // entry captures see the bound arguments
    assert_eq!(entries[0].captures["a"], serde_json::json!(1));
    assert_eq!(entries[0].captures["b"], serde_json::json!(2));
    // exit captures see the return value
    assert_eq!(exits[0].captures["@return"], serde_json::json!(3));
    assert_eq!(exits[0].program_id, "prog-1");
    assert_eq!(exits[0].context_id, "ctx-test");

    // the store counted every firing under the owning program
    let store = h.stores.for_program("prog-1");
    assert_eq!(store.get("fired"), Some(6.into()));
}

#[test]
fn exit_probe_sees_the_exception_and_it_still_propagates() {
    let h = harness();
    let boom = thrower();
    install_both(&h, &boom);

    let err = h.vm.call_function(&boom, vec![]).unwrap_err();
    assert!(matches!(err, molt_vm::VmError::Raised(Value::Str(ref s)) if &**s == "boom"));

    let exits = h.transport.exits();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].captures["@exception"], serde_json::json!("boom"));
    assert!(exits[0].captures.get("@return").is_none());
}

#[test]
fn uninstall_restores_the_original_body() {
    let h = harness();
    let add = adder();
    let original = add.code();

    let installation = install_both(&h, &add);
    assert!(!Arc::ptr_eq(&add.code(), &original));

    installation.uninstall(&h.vm);
    assert!(Arc::ptr_eq(&add.code(), &original));

    // further calls run clean and report nothing
    call_int(&h.vm, &add, vec![Value::Int(1), Value::Int(1)]);
    assert!(h.transport.events.lock().is_empty());
}

#[test]
fn every_recursion_level_reenters_the_trampoline() {
    let h = harness();
    let f = fact();
    install_both(&h, &f);

    assert_eq!(call_int(&h.vm, &f, vec![Value::Int(5)]), 120);
    assert_eq!(h.transport.entries().len(), 5);
    assert_eq!(h.transport.exits().len(), 5);

    // innermost exit first; the outermost returns the final product
    let returns: Vec<_> = h
        .transport
        .exits()
        .iter()
        .map(|e| e.captures["@return"].clone())
        .collect();
    assert_eq!(
        serde_json::Value::Array(returns),
        serde_json::json!([1, 2, 6, 24, 120])
    );
}

#[test]
fn aliases_observe_install_and_uninstall() {
    let h = harness();
    let add = adder();
    let alias = add.clone();

    let installation = install_both(&h, &add);
    call_int(&h.vm, &alias, vec![Value::Int(2), Value::Int(2)]);
    assert_eq!(h.transport.entries().len(), 1);

    installation.uninstall(&h.vm);
    call_int(&h.vm, &alias, vec![Value::Int(2), Value::Int(2)]);
    assert_eq!(h.transport.entries().len(), 1);
}

/// def pair(): yield 1; yield 2
fn pair_gen() -> FunctionRef {
    let mut b = CodeBuilder::new("pair", &[]);
    b.add_flags(molt_bytecode::CodeFlags::IS_GENERATOR);
    b.emit(Instruction::Resume { arg: 0 });
    b.set_line(2).load_const(ConstantData::Integer { value: 1 });
    b.emit(Instruction::YieldValue).emit(Instruction::Pop);
    b.set_line(3).load_const(ConstantData::Integer { value: 2 });
    b.emit(Instruction::YieldValue).emit(Instruction::Pop);
    b.return_const(ConstantData::None);
    func(b.finish())
}

#[test]
fn instrumented_generator_yields_the_same_values() {
    let h = harness();
    let g = pair_gen();
    install_both(&h, &g);

    let gen = match h.vm.call_function(&g, vec![]).unwrap() {
        Value::Generator(gen) => gen,
        other => panic!("expected generator, got {other:?}"),
    };
    let mut yielded = Vec::new();
    while let Some(value) = h.vm.resume_generator(&gen).unwrap() {
        yielded.push(value);
    }
    assert!(matches!(yielded.as_slice(), [Value::Int(1), Value::Int(2)]));
    // the entry capture runs when the generator body first resumes
    assert_eq!(h.transport.entries().len(), 1);
}

#[test]
fn keyword_and_default_arguments_pass_through_the_trampoline() {
    let h = harness();
    // def add(a, b=10): return a + b
    let mut b = CodeBuilder::new("add", &["a", "b"]);
    b.emit(Instruction::Resume { arg: 0 });
    b.set_line(2)
        .emit(Instruction::LoadFast(0))
        .emit(Instruction::LoadFast(1))
        .emit(Instruction::BinaryOperation {
            op: BinaryOperator::Add,
        })
        .emit(Instruction::ReturnValue);
    let f = Function::new(
        b.finish(),
        Vm::new_globals(),
        vec![Value::Int(10)],
        Box::new([]),
    );
    install_both(&h, &f);

    assert!(matches!(
        h.vm.call_function(&f, vec![Value::Int(1)]).unwrap(),
        Value::Int(11)
    ));

    let mut kwargs = indexmap::IndexMap::new();
    kwargs.insert("b".to_owned(), Value::Int(5));
    let args = molt_vm::CallArgs {
        args: vec![Value::Int(1)],
        kwargs,
    };
    assert!(matches!(
        h.vm.call_function(&f, args).unwrap(),
        Value::Int(6)
    ));
    assert_eq!(h.transport.entries().len(), 2);
    assert_eq!(h.transport.exits().len(), 2);
}

/// def tally(n):
///     total = 0
///     while n > 0:
///         n = n - 1
///         if n == 3: continue
///         total = total + n
///         if total > 10: break
///     return total
fn tally() -> FunctionRef {
    let mut b = CodeBuilder::new("tally", &["n"]);
    let total = b.local("total");
    let top = b.label();
    let done = b.label();
    b.emit(Instruction::Resume { arg: 0 });
    b.set_line(2);
    b.load_const(ConstantData::Integer { value: 0 });
    b.emit(Instruction::StoreFast(total));
    b.mark(top);
    b.set_line(3).emit(Instruction::LoadFast(0));
    b.load_const(ConstantData::Integer { value: 0 });
    let t_done = b.target(done);
    b.emit(Instruction::CompareOperation {
        op: ComparisonOperator::Greater,
    })
    .emit(Instruction::JumpIfFalse { target: t_done });
    b.set_line(4).emit(Instruction::LoadFast(0));
    b.load_const(ConstantData::Integer { value: 1 });
    let t_top = b.target(top);
    b.emit(Instruction::BinaryOperation {
        op: BinaryOperator::Subtract,
    })
    .emit(Instruction::StoreFast(0));
    b.set_line(5).emit(Instruction::LoadFast(0));
    b.load_const(ConstantData::Integer { value: 3 });
    b.emit(Instruction::CompareOperation {
        op: ComparisonOperator::Equal,
    })
    .emit(Instruction::JumpIfTrue { target: t_top });
    b.set_line(6)
        .emit(Instruction::LoadFast(total))
        .emit(Instruction::LoadFast(0))
        .emit(Instruction::BinaryOperation {
            op: BinaryOperator::Add,
        })
        .emit(Instruction::StoreFast(total));
    b.set_line(7).emit(Instruction::LoadFast(total));
    b.load_const(ConstantData::Integer { value: 10 });
    b.emit(Instruction::CompareOperation {
        op: ComparisonOperator::Greater,
    })
    .emit(Instruction::JumpIfTrue { target: t_done })
    .emit(Instruction::JumpBackward { target: t_top });
    b.mark(done);
    b.set_line(8)
        .emit(Instruction::LoadFast(total))
        .emit(Instruction::ReturnValue);
    func(b.finish())
}

#[test]
fn loops_with_continue_and_break_run_transparently() {
    let h = harness();
    let f = tally();
    install_both(&h, &f);

    // n=6 skips 3 via continue and breaks once the total passes 10
    assert_eq!(call_int(&h.vm, &f, vec![Value::Int(6)]), 11);
    // n=2 drains the loop without hitting either edge
    assert_eq!(call_int(&h.vm, &f, vec![Value::Int(2)]), 1);

    assert_eq!(h.transport.entries().len(), 2);
    let returns: Vec<_> = h
        .transport
        .exits()
        .iter()
        .map(|e| e.captures["@return"].clone())
        .collect();
    assert_eq!(
        serde_json::Value::Array(returns),
        serde_json::json!([11, 1])
    );
}

/// def noted(x):
///     try:
///         try:
///             if x: raise "boom"
///             return 1
///         finally:
///             seen = True
///     except:
///         return 2
fn noted() -> FunctionRef {
    let mut b = CodeBuilder::new("noted", &["x"]);
    let handler = b.label();
    let fin = b.label();
    let ok = b.label();
    let seen = b.name("seen");
    b.emit(Instruction::Resume { arg: 0 });
    let h_t = b.target(handler);
    b.set_line(2).emit(Instruction::SetupExcept { handler: h_t });
    let fin_t = b.target(fin);
    b.set_line(3).emit(Instruction::SetupFinally { handler: fin_t });
    b.set_line(4).emit(Instruction::LoadFast(0));
    let ok_t = b.target(ok);
    b.emit(Instruction::JumpIfFalse { target: ok_t });
    b.load_const(ConstantData::Str {
        value: "boom".to_owned(),
    });
    b.emit(Instruction::Raise {
        kind: RaiseKind::Raise,
    });
    b.mark(ok);
    b.set_line(5).return_const(ConstantData::Integer { value: 1 });
    b.mark(fin);
    b.set_line(7);
    b.load_const(ConstantData::Boolean { value: true });
    b.emit(Instruction::StoreGlobal(seen))
        .emit(Instruction::EndFinally);
    b.mark(handler);
    b.set_line(9)
        .emit(Instruction::Pop)
        .emit(Instruction::PopException)
        .return_const(ConstantData::Integer { value: 2 });
    func(b.finish())
}

#[test]
fn nested_try_finally_runs_transparently() {
    let h = harness();
    let f = noted();
    install_both(&h, &f);

    // return path: the finally body runs before the value comes back
    assert_eq!(call_int(&h.vm, &f, vec![Value::Bool(false)]), 1);
    let globals = f.globals().lock().clone();
    assert!(matches!(globals.get("seen"), Some(Value::Bool(true))));

    // raise path: finally, then the outer handler
    assert_eq!(call_int(&h.vm, &f, vec![Value::Bool(true)]), 2);

    assert_eq!(h.transport.entries().len(), 2);
    let returns: Vec<_> = h
        .transport
        .exits()
        .iter()
        .map(|e| e.captures["@return"].clone())
        .collect();
    assert_eq!(serde_json::Value::Array(returns), serde_json::json!([1, 2]));
}

/// def counter(n):
///     def bump(): n = n + 1; return n
///     return bump
fn counter() -> FunctionRef {
    let mut inner = CodeBuilder::new("bump", &[]);
    let n_free = inner.free_var("n");
    inner.emit(Instruction::Resume { arg: 0 });
    inner.set_line(3).emit(Instruction::LoadDeref(n_free));
    inner.load_const(ConstantData::Integer { value: 1 });
    inner
        .emit(Instruction::BinaryOperation {
            op: BinaryOperator::Add,
        })
        .emit(Instruction::StoreDeref(n_free));
    inner
        .set_line(4)
        .emit(Instruction::LoadDeref(n_free))
        .emit(Instruction::ReturnValue);
    let inner_code = inner.finish();

    let mut outer = CodeBuilder::new("counter", &["n"]);
    let n_cell = outer.capture_param("n", 0);
    outer.emit(Instruction::Resume { arg: 0 });
    outer.set_line(2).emit(Instruction::LoadClosure(n_cell));
    outer.emit(Instruction::BuildTuple { size: 1 });
    outer.load_const(ConstantData::Code {
        code: Box::new((*inner_code).clone()),
    });
    outer.emit(Instruction::MakeFunction(
        molt_bytecode::MakeFunctionFlags::CLOSURE,
    ));
    outer.set_line(5).emit(Instruction::ReturnValue);
    func(outer.finish())
}

#[test]
fn closure_cell_mutation_survives_instrumentation() {
    let h = harness();
    let outer = counter();
    install_both(&h, &outer);

    let bump = match h.vm.call_function(&outer, vec![Value::Int(11)]).unwrap() {
        Value::Function(f) => f,
        other => panic!("expected function, got {other:?}"),
    };
    install_both(&h, &bump);

    // the captured cell keeps mutating across instrumented calls
    assert_eq!(call_int(&h.vm, &bump, vec![]), 12);
    assert_eq!(call_int(&h.vm, &bump, vec![]), 13);

    assert_eq!(h.transport.entries().len(), 3);
    assert_eq!(h.transport.exits().len(), 3);
}

/// def deeper(n): return deeper(n, n) if n else 0
///
/// The recursive call passes one argument too many, so the inner invocation
/// fails during binding, before the injected entry capture runs.
fn deeper() -> FunctionRef {
    let mut b = CodeBuilder::new("deeper", &["n"]);
    let done = b.label();
    let name = b.name("deeper");
    b.emit(Instruction::Resume { arg: 0 });
    b.set_line(2).emit(Instruction::LoadFast(0));
    let t = b.target(done);
    b.emit(Instruction::JumpIfFalse { target: t });
    b.set_line(3)
        .emit(Instruction::LoadGlobal(name))
        .emit(Instruction::LoadFast(0))
        .emit(Instruction::LoadFast(0))
        .emit(Instruction::CallFunctionPositional { nargs: 2 })
        .emit(Instruction::ReturnValue);
    b.mark(done);
    b.set_line(4).return_const(ConstantData::Integer { value: 0 });
    let f = func(b.finish());
    f.globals()
        .lock()
        .insert("deeper".to_owned(), Value::Function(f.clone()));
    f
}

#[test]
fn a_binding_failure_leaves_the_outer_capture_in_place() {
    let h = harness();
    let f = deeper();
    install_both(&h, &f);

    let err = h.vm.call_function(&f, vec![Value::Int(1)]).unwrap_err();
    assert!(matches!(err, molt_vm::VmError::TypeError(_)));

    // the inner invocation never captured a frame; its exit pass hands the
    // outer activation back instead of consuming it
    assert_eq!(h.transport.entries().len(), 1);
    let exits = h.transport.exits();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].captures["n"], serde_json::json!(1));
    assert!(exits[0].captures.get("@return").is_none());
    assert!(exits[0].captures.get("@exception").is_none());
}

#[test]
fn concurrent_calls_fire_probes_per_call() {
    let h = harness();
    let fns: Vec<FunctionRef> = (0..4).map(|_| adder()).collect();
    for f in &fns {
        install_both(&h, f);
    }

    std::thread::scope(|s| {
        for (t, f) in fns.iter().enumerate() {
            let vm = h.vm.clone();
            s.spawn(move || {
                for i in 0..8 {
                    assert_eq!(
                        call_int(&vm, f, vec![Value::Int(t as i64), Value::Int(i)]),
                        t as i64 + i
                    );
                }
            });
        }
    });

    assert_eq!(h.transport.entries().len(), 32);
    assert_eq!(h.transport.exits().len(), 32);
}

#[test]
fn entry_only_and_exit_only_installations() {
    let h = harness();
    let add = adder();
    let (program, entry, _) = probe_pair("adder");
    Installation::install(
        &h.vm,
        &h.gen,
        add.clone(),
        vec![(program, entry)],
        vec![],
        h.runtime.clone(),
    );
    call_int(&h.vm, &add, vec![Value::Int(1), Value::Int(2)]);
    assert_eq!(h.transport.entries().len(), 1);
    assert_eq!(h.transport.exits().len(), 0);
}
