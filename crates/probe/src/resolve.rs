use molt_vm::FunctionRef;

/// Maps the engine's two addressing schemes onto live function references.
/// Implemented by the embedder (it knows its module registry); resolution
/// failure makes the corresponding instrumentation request a logged no-op.
pub trait FunctionResolver: Send + Sync {
    /// The function whose body spans `line` of `filename`, if any.
    fn resolve_line(&self, filename: &str, line: u32) -> Option<FunctionRef>;

    /// The function a probe target selector names, if any.
    fn resolve_target(&self, target: &str) -> Option<FunctionRef>;
}
