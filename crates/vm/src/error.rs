use thiserror::Error;

use crate::value::Value;

/// Errors surfaced while executing bytecode.
///
/// `Raised` is the only catchable kind: exception handlers in the running
/// code see it, and if none does it propagates to the embedder. Everything
/// else is a fault in the unit or the embedding and aborts execution
/// outright.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("uncaught exception: {0}")]
    Raised(Value),
    #[error("name {0:?} is not defined")]
    NameError(String),
    #[error("local variable {0:?} referenced before assignment")]
    UnboundLocal(String),
    #[error("{0}")]
    TypeError(String),
    #[error("no host object registered under id {0}")]
    UnknownHostRef(u32),
    #[error("malformed bytecode: {0}")]
    Bytecode(&'static str),
}

impl VmError {
    pub(crate) fn type_error(msg: impl Into<String>) -> Self {
        Self::TypeError(msg.into())
    }
}
