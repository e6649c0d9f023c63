//! Reconciliation between desired instrumentation and what is installed.
//!
//! [`DebugSession`] owns breakpoints: each accepted snapshot is the complete
//! desired set, applied by full rebuild. [`ProgramHost`] owns probe
//! programs: per-program install/uninstall keyed by program id, with a
//! content-hash skip for no-op updates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use molt_vm::Vm;

use crate::abi::AbiError;
use crate::breakpoint::{Breakpoint, BreakpointHandler, BreakpointRegistry, BreakpointSink};
use crate::codegen::CodeGenerator;
use crate::program::{Probe, ProbePhase, Program};
use crate::redirect::{Installation, ProbeRuntime, ProbeSet};
use crate::resolve::FunctionResolver;

/// Keeps the set of installed breakpoints equal to the last accepted
/// snapshot.
pub struct DebugSession {
    vm: Arc<Vm>,
    registry: Arc<BreakpointRegistry>,
    resolver: Arc<dyn FunctionResolver>,
    gen: CodeGenerator,
    handler_host: u32,
    current: parking_lot::Mutex<HashSet<Breakpoint>>,
}

impl DebugSession {
    pub fn new(
        vm: Arc<Vm>,
        resolver: Arc<dyn FunctionResolver>,
        sink: Arc<dyn BreakpointSink>,
    ) -> Result<Self, AbiError> {
        let gen = CodeGenerator::detect(vm.version())?;
        let registry = Arc::new(BreakpointRegistry::new());
        let handler = Arc::new(BreakpointHandler::new(registry.clone(), sink));
        let handler_host = vm.register_host_object(handler);
        Ok(Self {
            vm,
            registry,
            resolver,
            gen,
            handler_host,
            current: parking_lot::Mutex::new(HashSet::new()),
        })
    }

    pub fn registry(&self) -> &Arc<BreakpointRegistry> {
        &self.registry
    }

    /// Apply a complete desired breakpoint set.
    ///
    /// An unchanged set is a no-op that leaves installed code untouched. Any
    /// change triggers a full rebuild: every touched function is restored to
    /// its snapshot, then the whole new set is installed from scratch.
    /// Breakpoints sharing a line share one injected site; a line that
    /// resolves to no function is skipped with a warning and the rest of the
    /// set still installs.
    pub fn update_breakpoints(&self, desired: Vec<Breakpoint>) {
        let desired_set: HashSet<Breakpoint> = desired.iter().cloned().collect();
        {
            let current = self.current.lock();
            if *current == desired_set {
                return;
            }
        }

        self.registry.uninstall_all();
        self.registry.clear_fanout();

        let mut by_site: IndexMap<(String, u32), Vec<Breakpoint>> = IndexMap::new();
        for breakpoint in desired {
            by_site
                .entry((breakpoint.filename.clone(), breakpoint.line))
                .or_default()
                .push(breakpoint);
        }

        for ((filename, line), group) in by_site {
            let Some(function) = self.resolver.resolve_line(&filename, line) else {
                log::warn!("no function found for {filename}:{line}; breakpoints skipped");
                continue;
            };
            let site = self.registry.site_id(&filename, line);
            if self
                .registry
                .install_site(&self.gen, self.handler_host, &function, site, line)
            {
                self.registry.register_fanout(site, group);
            }
        }

        *self.current.lock() = desired_set;
    }

    /// Remove every breakpoint and restore all touched functions.
    pub fn shutdown(&self) {
        self.registry.uninstall_all();
        self.registry.clear_fanout();
        self.current.lock().clear();
        self.vm.unregister_host_object(self.handler_host);
    }
}

struct InstalledProgram {
    hash: u64,
    installations: Vec<Arc<Installation>>,
}

/// Manages probe programs: installs each program's probes onto their target
/// functions and reverses that on update or removal. At most one
/// installation exists per function identity; a second program targeting an
/// already-instrumented function is skipped rather than stacking a
/// trampoline on a trampoline.
pub struct ProgramHost {
    vm: Arc<Vm>,
    gen: CodeGenerator,
    resolver: Arc<dyn FunctionResolver>,
    runtime: Arc<ProbeRuntime>,
    installed: parking_lot::Mutex<HashMap<String, InstalledProgram>>,
    /// Function identity (Arc address) → owning program id.
    claimed: parking_lot::Mutex<HashMap<usize, String>>,
}

impl ProgramHost {
    pub fn new(
        vm: Arc<Vm>,
        resolver: Arc<dyn FunctionResolver>,
        runtime: Arc<ProbeRuntime>,
    ) -> Result<Self, AbiError> {
        let gen = CodeGenerator::detect(vm.version())?;
        Ok(Self {
            vm,
            gen,
            resolver,
            runtime,
            installed: parking_lot::Mutex::new(HashMap::new()),
            claimed: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Install or refresh one program. A program whose hash matches what is
    /// already installed is left alone; otherwise its previous installations
    /// are removed first, then every probe target is resolved and
    /// instrumented. Unresolvable targets are skipped with a warning.
    pub fn update(&self, program: &Arc<Program>) {
        {
            let installed = self.installed.lock();
            if installed
                .get(&program.id)
                .is_some_and(|prev| prev.hash == program.hash)
            {
                log::debug!("program {} unchanged; skipping reinstall", program.id);
                return;
            }
        }
        self.uninstall(&program.id);

        let mut by_target: IndexMap<String, (ProbeSet, ProbeSet)> = IndexMap::new();
        for probe in &program.probes {
            let Some(phase) = probe.spec.phase() else {
                log::warn!(
                    "probe {} has unrecognized specifier {:?}; skipped",
                    probe.id,
                    probe.spec.specifier
                );
                continue;
            };
            let entry = by_target.entry(probe.spec.target.clone()).or_default();
            let pair: (Arc<Program>, Arc<Probe>) = (program.clone(), probe.clone());
            match phase {
                ProbePhase::Entry => entry.0.push(pair),
                ProbePhase::Exit => entry.1.push(pair),
            }
        }

        let mut installations = Vec::new();
        for (target, (entry_probes, exit_probes)) in by_target {
            let Some(function) = self.resolver.resolve_target(&target) else {
                log::warn!("probe target {target:?} not found; skipped");
                continue;
            };
            let identity = Arc::as_ptr(&function) as usize;
            {
                let mut claimed = self.claimed.lock();
                if let Some(owner) = claimed.get(&identity) {
                    log::warn!(
                        "target {target:?} already instrumented by program {owner}; skipped"
                    );
                    continue;
                }
                claimed.insert(identity, program.id.clone());
            }
            installations.push(Installation::install(
                &self.vm,
                &self.gen,
                function,
                entry_probes,
                exit_probes,
                self.runtime.clone(),
            ));
        }

        self.installed.lock().insert(
            program.id.clone(),
            InstalledProgram {
                hash: program.hash,
                installations,
            },
        );
    }

    /// Remove one program's instrumentation, restoring its targets.
    pub fn uninstall(&self, program_id: &str) {
        let previous = self.installed.lock().remove(program_id);
        if let Some(previous) = previous {
            for installation in previous.installations {
                let identity = Arc::as_ptr(installation.function()) as usize;
                installation.uninstall(&self.vm);
                self.claimed.lock().remove(&identity);
            }
        }
    }

    /// Remove every installed program.
    pub fn shutdown(&self) {
        let programs: Vec<String> = self.installed.lock().keys().cloned().collect();
        for id in programs {
            self.uninstall(&id);
        }
    }
}
