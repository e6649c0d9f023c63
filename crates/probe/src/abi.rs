use molt_vm::RuntimeVersion;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AbiError {
    /// Refusing to generate code for a bytecode revision we do not know:
    /// emitting the wrong calling convention would corrupt program state.
    #[error("unsupported Molt bytecode revision {0}")]
    Unsupported(RuntimeVersion),
}

/// The call-convention dialect of the running engine, detected once and
/// dispatched on everywhere. Revisions 1.0/1.1 use the legacy call
/// instructions, 1.2 introduced `Precall`/`Call` with the stack sentinel
/// below the callee, and 1.3 moved the sentinel above the callee and folded
/// bound-method loads into `LoadAttr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiVariant {
    V1,
    V2,
    V3,
}

impl AbiVariant {
    pub fn detect(version: RuntimeVersion) -> Result<Self, AbiError> {
        match (version.major, version.minor) {
            (1, 0 | 1) => Ok(Self::V1),
            (1, 2) => Ok(Self::V2),
            (1, 3 | 4) => Ok(Self::V3),
            _ => Err(AbiError::Unsupported(version)),
        }
    }
}
