use chrono::{DateTime, Utc};
use molt_vm::Value;
use serde::Serialize;

use crate::program::{Captures, Probe, ProbeSpec, Program};

/// One captured observation, handed to the transport. This is the full
/// record the sink needs to attribute the capture: which program and probe
/// fired, in which request context, on which thread, and when.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedEvent {
    pub program_id: String,
    pub probe_id: String,
    pub context_id: String,
    pub probe_spec: ProbeSpec,
    pub captures: Captures,
    pub timestamp: DateTime<Utc>,
    pub thread_id: String,
    pub thread_name: Option<String>,
}

impl CapturedEvent {
    pub fn new(program: &Program, probe: &Probe, context_id: &str, captures: Captures) -> Self {
        let thread = std::thread::current();
        Self {
            program_id: program.id.clone(),
            probe_id: probe.id.clone(),
            context_id: context_id.to_owned(),
            probe_spec: probe.spec.clone(),
            captures,
            timestamp: Utc::now(),
            thread_id: format!("{:?}", thread.id()),
            thread_name: thread.name().map(str::to_owned),
        }
    }
}

/// Where captured events go. Submission is fire-and-forget from the
/// instrumented call's perspective; implementations must not block it.
pub trait EventTransport: Send + Sync {
    fn submit(&self, event: CapturedEvent);
}

/// Serialize a runtime value for a capture record. Identity-only values
/// (functions, generators, host objects) become their debug rendering.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::None | Value::Null => serde_json::Value::Null,
        Value::Bool(b) => (*b).into(),
        Value::Int(i) => (*i).into(),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::String(s.to_string()),
        Value::Tuple(t) => t.iter().map(value_to_json).collect(),
        Value::List(l) => l.lock().iter().map(value_to_json).collect(),
        Value::Map(m) => serde_json::Value::Object(
            m.lock()
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}
