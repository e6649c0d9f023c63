//! Whole-function interception. Installing swaps the target's body for a
//! trampoline that forwards every call to the installation object; the
//! installation runs a privately kept copy of the original body, entry-
//! injected to capture its own frame, and fires exit probes from a scoped
//! cleanup so they run on returns and raises alike.

use std::sync::{Arc, OnceLock};

use molt_bytecode::CodeObject;
use molt_vm::{CallArgs, FrameRef, Function, FunctionRef, HostHook, Value, Vm, VmError};
use parking_lot::Mutex;

use crate::codegen::CodeGenerator;
use crate::event::{CapturedEvent, EventTransport};
use crate::inject::inject_entry;
use crate::program::{CallOutcome, Probe, ProbeExecutor, Program};
use crate::store::StoreProvider;

/// The collaborators probe execution needs, shared by every installation of
/// one engine instance.
pub struct ProbeRuntime {
    pub executor: Arc<dyn ProbeExecutor>,
    pub transport: Arc<dyn EventTransport>,
    pub stores: Arc<dyn StoreProvider>,
    /// Context/session id stamped on every captured event.
    pub context_id: String,
}

/// The probes of one phase bound to one target, paired with their owning
/// programs for event attribution.
pub type ProbeSet = Vec<(Arc<Program>, Arc<Probe>)>;

/// The live binding between one function and its instrumented state.
///
/// Holds the pre-instrumentation snapshot for reset, the entry-injected
/// private copy of the body, and the frame stack that carries activations
/// from entry capture to exit probes. Registered as a VM host object; the
/// trampoline and the injected entry call both reach it through its host
/// ref.
pub struct Installation {
    function: FunctionRef,
    snapshot: Arc<CodeObject>,
    entry_probes: ProbeSet,
    exit_probes: ProbeSet,
    runtime: Arc<ProbeRuntime>,
    /// Activations captured at entry, popped at exit. Recursive and
    /// concurrent calls of the one function interleave through this stack.
    frames: Mutex<Vec<FrameRef>>,
    instrumented: OnceLock<FunctionRef>,
    host_id: OnceLock<u32>,
}

impl Installation {
    /// Redirect `function` through a new installation. Every existing
    /// reference to the function observes the instrumentation from here on.
    pub fn install(
        vm: &Vm,
        gen: &CodeGenerator,
        function: FunctionRef,
        entry_probes: ProbeSet,
        exit_probes: ProbeSet,
        runtime: Arc<ProbeRuntime>,
    ) -> Arc<Self> {
        let snapshot = function.code();
        let installation = Arc::new(Self {
            function: function.clone(),
            snapshot: snapshot.clone(),
            entry_probes,
            exit_probes,
            runtime,
            frames: Mutex::new(Vec::new()),
            instrumented: OnceLock::new(),
            host_id: OnceLock::new(),
        });

        let host = vm.register_host_object(installation.clone());
        let _ = installation.host_id.set(host);

        let (body, injected) = inject_entry(gen, &snapshot, host, "capture_entry");
        if !injected {
            log::warn!(
                "entry capture not injected into {}; exit probes will not fire",
                function.name()
            );
        }
        let instrumented = Function::new(
            Arc::new(body),
            function.globals().clone(),
            function.defaults().to_vec(),
            function.closure().to_vec().into_boxed_slice(),
        );
        let _ = installation.instrumented.set(instrumented);

        let trampoline = gen.trampoline(host, &snapshot);
        function.replace_code(Arc::new(trampoline));
        installation
    }

    /// Restore the original body. Holders that captured the trampoline code
    /// object directly keep observing it until they drop it; references to
    /// the function itself are clean immediately.
    pub fn uninstall(&self, vm: &Vm) {
        self.function.replace_code(self.snapshot.clone());
        if let Some(host) = self.host_id.get() {
            vm.unregister_host_object(*host);
        }
    }

    pub fn function(&self) -> &FunctionRef {
        &self.function
    }

    pub fn snapshot(&self) -> &Arc<CodeObject> {
        &self.snapshot
    }

    /// Run a probe set against one activation. Probe and transport failures
    /// stop at this boundary: logged, never propagated into user code.
    fn run_probes(&self, probes: &ProbeSet, frame: &FrameRef, outcome: Option<&CallOutcome>) {
        for (program, probe) in probes {
            let store = self.runtime.stores.for_program(&program.id);
            match self
                .runtime
                .executor
                .execute(program, probe, frame, store, outcome)
            {
                Ok(Some(captures)) => {
                    let event =
                        CapturedEvent::new(program, probe, &self.runtime.context_id, captures);
                    self.runtime.transport.submit(event);
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("probe {} on {} failed: {err}", probe.id, self.function.name());
                }
            }
        }
    }
}

impl HostHook for Installation {
    /// Trampoline invocation: run the instrumented body, then in the scoped
    /// cleanup pop the activation captured at entry and fire exit probes.
    /// The body's result or exception propagates unchanged.
    fn call(&self, vm: &Vm, _frame: &FrameRef, args: CallArgs) -> Result<Value, VmError> {
        let Some(instrumented) = self.instrumented.get() else {
            return Err(VmError::TypeError("installation not initialized".to_owned()));
        };
        // Remembered so a pop returning this exact record can be recognized
        // as a capture that never happened (the call failed before the
        // injected entry ran), not as this call's own frame.
        let previous = self.frames.lock().last().cloned();

        let result = vm.call_function(instrumented, args);

        // pop, desync check, and push-back happen under one guard; a
        // concurrent call must never slide its frame in between
        let captured = {
            let mut frames = self.frames.lock();
            match frames.pop() {
                Some(frame)
                    if previous.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &frame)) =>
                {
                    log::warn!(
                        "entry capture missing for {}; returning frame to the stack",
                        self.function.name()
                    );
                    frames.push(frame);
                    None
                }
                Some(frame) => Some(frame),
                None => {
                    log::warn!("no captured frame for {} at exit", self.function.name());
                    None
                }
            }
        };
        if let Some(frame) = captured {
            let outcome = CallOutcome {
                retval: result.as_ref().ok().cloned(),
                exception: match &result {
                    Err(VmError::Raised(value)) => Some(value.clone()),
                    _ => None,
                },
            };
            self.run_probes(&self.exit_probes, &frame, Some(&outcome));
        }
        result
    }

    /// The entry-injected call: capture the activation and run entry probes.
    /// Nothing here may disturb the user function.
    fn call_method(
        &self,
        _vm: &Vm,
        frame: &FrameRef,
        method: &str,
        _args: CallArgs,
    ) -> Result<Value, VmError> {
        if method != "capture_entry" {
            return Err(VmError::TypeError(format!(
                "installation has no method {method:?}"
            )));
        }
        self.frames.lock().push(frame.clone());
        self.run_probes(&self.entry_probes, frame, None);
        Ok(Value::None)
    }
}
