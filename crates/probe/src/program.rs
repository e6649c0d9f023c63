use std::sync::Arc;

use indexmap::IndexMap;
use molt_vm::{FrameRef, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::ProbeStore;

/// What a probe is attached to: a raw specifier of the form
/// `fn:<target>:<entry|exit>`, plus the target it names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub specifier: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    Entry,
    Exit,
}

impl ProbeSpec {
    pub fn new(target: &str, phase: ProbePhase) -> Self {
        let suffix = match phase {
            ProbePhase::Entry => "entry",
            ProbePhase::Exit => "exit",
        };
        Self {
            specifier: format!("fn:{target}:{suffix}"),
            target: target.to_owned(),
        }
    }

    pub fn phase(&self) -> Option<ProbePhase> {
        if self.specifier.ends_with(":entry") {
            Some(ProbePhase::Entry)
        } else if self.specifier.ends_with(":exit") {
            Some(ProbePhase::Exit)
        } else {
            None
        }
    }
}

/// One unit of instrumentation logic. Compiled by an external collaborator;
/// the engine treats it as an opaque identity plus its spec. The condition
/// source, when present, is evaluated by the [`ProbeExecutor`], not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub id: String,
    pub spec: ProbeSpec,
    pub condition: Option<String>,
}

/// A named, content-hashed collection of probes. The hash detects "nothing
/// changed, skip the reinstall".
#[derive(Debug, Clone)]
pub struct Program {
    pub id: String,
    pub hash: u64,
    pub bytecode: Arc<[u8]>,
    pub probes: Vec<Arc<Probe>>,
}

/// Result of the instrumented call, visible to exit probes.
#[derive(Debug, Default)]
pub struct CallOutcome {
    pub retval: Option<Value>,
    pub exception: Option<Value>,
}

pub type Captures = IndexMap<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe evaluation failed: {0}")]
    Execution(String),
    #[error("capture serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Evaluates a probe's condition and capture expression against a live
/// activation. Implemented by the external probe-language VM; `Ok(None)`
/// means the condition did not match (nothing to report).
pub trait ProbeExecutor: Send + Sync {
    fn execute(
        &self,
        program: &Program,
        probe: &Probe,
        frame: &FrameRef,
        store: Arc<dyn ProbeStore>,
        outcome: Option<&CallOutcome>,
    ) -> Result<Option<Captures>, ProbeError>;
}
