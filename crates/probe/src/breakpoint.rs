//! Line-granularity instrumentation. A breakpoint names a source position;
//! the registry owns the site-id allocation, the per-function code
//! snapshots, and the site-to-breakpoint fan-out the handler consults when a
//! site fires.

use std::collections::HashMap;
use std::sync::Arc;

use molt_bytecode::CodeObject;
use molt_vm::{CallArgs, FrameRef, FunctionRef, HostHook, Value, Vm, VmError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::codegen::CodeGenerator;
use crate::inject::inject_at_line;

/// A request to observe one source line. Identity is the whole record, so
/// two breakpoints on the same line with different uuids are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Breakpoint {
    pub uuid: String,
    pub filename: String,
    pub line: u32,
    pub condition: Option<String>,
}

impl Breakpoint {
    /// Condition evaluation is not wired up yet; a breakpoint that carries a
    /// condition never matches rather than firing unconditionally.
    pub fn condition_matches(&self) -> bool {
        self.condition.is_none()
    }
}

/// Receives the hit notification for each matching breakpoint, with the
/// activation that reached the line.
pub trait BreakpointSink: Send + Sync {
    fn notify(&self, breakpoint: &Breakpoint, frame: &FrameRef);
}

struct SiteTable {
    ids: HashMap<(String, u32), i64>,
    next: i64,
}

struct LineInstallation {
    function: FunctionRef,
    snapshot: Arc<CodeObject>,
}

/// Bookkeeping for every line site currently injected.
///
/// Site ids are allocated once per (filename, line) and never change for the
/// registry's lifetime, so a site keeps its id across rebuilds. Snapshots
/// are taken the first time a function is touched and survive restacking, so
/// uninstalling always restores the pristine body no matter how many lines
/// of the function were instrumented since.
#[derive(Default)]
pub struct BreakpointRegistry {
    sites: Mutex<SiteTable>,
    fanout: Mutex<HashMap<i64, Vec<Breakpoint>>>,
    installs: Mutex<HashMap<usize, LineInstallation>>,
}

impl Default for SiteTable {
    fn default() -> Self {
        Self {
            ids: HashMap::new(),
            next: 1,
        }
    }
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stable id for a (filename, line) site, allocated on first sight.
    pub fn site_id(&self, filename: &str, line: u32) -> i64 {
        let mut sites = self.sites.lock();
        if let Some(id) = sites.ids.get(&(filename.to_owned(), line)) {
            return *id;
        }
        let id = sites.next;
        sites.next += 1;
        sites.ids.insert((filename.to_owned(), line), id);
        id
    }

    pub fn register_fanout(&self, site: i64, breakpoints: Vec<Breakpoint>) {
        self.fanout.lock().insert(site, breakpoints);
    }

    pub fn clear_fanout(&self) {
        self.fanout.lock().clear();
    }

    pub fn breakpoints_for(&self, site: i64) -> Vec<Breakpoint> {
        self.fanout.lock().get(&site).cloned().unwrap_or_default()
    }

    /// Inject a site notification into `function` at `line`. Installs stack:
    /// each new line is injected into the function's current code, while the
    /// snapshot kept for restore is the code before the first install. A
    /// line with no qualifying position is a logged no-op.
    pub fn install_site(
        &self,
        gen: &CodeGenerator,
        handler_host: u32,
        function: &FunctionRef,
        site: i64,
        line: u32,
    ) -> bool {
        let current = function.code();
        let (body, injected) = inject_at_line(gen, &current, handler_host, site, line);
        if !injected {
            log::warn!(
                "no qualifying position for line {line} in {}; site {site} not installed",
                function.name()
            );
            return false;
        }
        self.installs
            .lock()
            .entry(Arc::as_ptr(function) as usize)
            .or_insert_with(|| LineInstallation {
                function: function.clone(),
                snapshot: current,
            });
        function.replace_code(Arc::new(body));
        true
    }

    /// Restore every touched function to its pre-instrumentation body.
    pub fn uninstall_all(&self) {
        for (_, install) in self.installs.lock().drain() {
            install.function.replace_code(install.snapshot);
        }
    }

    pub fn is_instrumented(&self, function: &FunctionRef) -> bool {
        self.installs
            .lock()
            .contains_key(&(Arc::as_ptr(function) as usize))
    }
}

/// The host object line sites call into. Looks up the fan-out for the fired
/// site and notifies the sink for each matching breakpoint; a malformed call
/// or an empty fan-out is silently absorbed so user code never observes it.
pub struct BreakpointHandler {
    registry: Arc<BreakpointRegistry>,
    sink: Arc<dyn BreakpointSink>,
}

impl BreakpointHandler {
    pub fn new(registry: Arc<BreakpointRegistry>, sink: Arc<dyn BreakpointSink>) -> Self {
        Self { registry, sink }
    }
}

impl HostHook for BreakpointHandler {
    fn call(&self, _vm: &Vm, frame: &FrameRef, args: CallArgs) -> Result<Value, VmError> {
        let Some(Value::Int(site)) = args.args.first() else {
            log::warn!("breakpoint site fired without a site id");
            return Ok(Value::None);
        };
        for breakpoint in self.registry.breakpoints_for(*site) {
            if breakpoint.condition_matches() {
                self.sink.notify(&breakpoint, frame);
            }
        }
        Ok(Value::None)
    }
}
