//! Live probe instrumentation for running Molt programs.
//!
//! Attaches and detaches observation logic to already-referenced functions of
//! a running program, without restarts or call-site rewriting. Two
//! granularities: whole-function entry/exit interception (via a trampoline
//! that redirects every existing reference) and injection at a single source
//! line. Instrumentation never changes a function's observable behavior and
//! is fully reversible.
//!
//! Probe compilation, source resolution, and the telemetry sink live outside
//! this crate, behind the [`ProbeExecutor`], [`FunctionResolver`] and
//! [`EventTransport`] traits.

mod abi;
mod breakpoint;
mod codegen;
mod event;
mod inject;
mod program;
mod reconcile;
mod redirect;
mod resolve;
mod store;

pub use abi::{AbiError, AbiVariant};
pub use breakpoint::{Breakpoint, BreakpointHandler, BreakpointRegistry, BreakpointSink};
pub use codegen::CodeGenerator;
pub use event::{value_to_json, CapturedEvent, EventTransport};
pub use inject::{inject_at_line, inject_entry};
pub use program::{
    CallOutcome, Captures, Probe, ProbeError, ProbeExecutor, ProbePhase, ProbeSpec, Program,
};
pub use reconcile::{DebugSession, ProgramHost};
pub use redirect::{Installation, ProbeRuntime, ProbeSet};
pub use resolve::FunctionResolver;
pub use store::{MemoryStores, ProbeStore, StoreProvider};
