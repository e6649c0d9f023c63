use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Index into one of a code object's name tables (`names`, `varnames` or the
/// cell/free space, depending on the instruction).
pub type NameIdx = u32;

/// A jump target.
///
/// In an assembled [`crate::CodeObject`] a label is the index of the target
/// instruction in the flat instruction array. Inside an
/// [`crate::InstructionSeq`] the same field holds a symbolic label id instead;
/// [`crate::InstructionSeq::assemble`] resolves it back to an index.
// XXX: if you add a new instruction that stores a Label, make sure to add it
// in Instruction::label_arg{,_mut}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The kind of Raise that occurred.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaiseKind {
    Reraise,
    Raise,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    Not,
    Minus,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct MakeFunctionFlags: u8 {
        const CLOSURE = 0x01;
        const DEFAULTS = 0x02;
    }
}

impl Serialize for MakeFunctionFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MakeFunctionFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Self::from_bits_truncate)
    }
}

/// A single bytecode instruction.
///
/// The call family is split by ABI era: revisions 1.0/1.1 emit
/// `CallFunctionPositional`/`CallMethodPositional`, revision 1.2 emits
/// `Precall` + `Call`, and 1.3+ emits `LoadAttr` with the method bit followed
/// by `Call`. The interpreter executes all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    /// Load a constant onto the stack.
    LoadConst {
        /// index into the constants vec
        idx: u32,
    },
    LoadFast(NameIdx),
    StoreFast(NameIdx),
    LoadGlobal(NameIdx),
    StoreGlobal(NameIdx),
    LoadDeref(NameIdx),
    StoreDeref(NameIdx),
    /// Push the current frame's cell `idx` itself (for building closures).
    LoadClosure(NameIdx),
    /// Attribute load; with `method` set this follows the 1.3+ bound-call
    /// protocol and pushes a bound method.
    LoadAttr {
        idx: NameIdx,
        method: bool,
    },
    /// Legacy (pre-1.3) bound-method load.
    LoadMethod {
        idx: NameIdx,
    },

    Pop,
    Duplicate,
    Rotate2,
    /// Push the call-protocol sentinel (1.2+ call sequences).
    PushNull,

    BinaryOperation {
        op: BinaryOperator,
    },
    CompareOperation {
        op: ComparisonOperator,
    },
    UnaryOperation {
        op: UnaryOperator,
    },
    Subscript,

    BuildTuple {
        size: u32,
    },
    BuildList {
        size: u32,
    },
    BuildMap {
        size: u32,
    },
    /// Merge the mapping at TOS into the mapping below it.
    DictMerge,

    Jump {
        target: Label,
    },
    /// Loop re-entry edge. Semantically identical to [`Instruction::Jump`]
    /// but kept distinct: code rewriting classifies it as the control-flow
    /// edge that closes a source line.
    JumpBackward {
        target: Label,
    },
    /// Pop the top of the stack, and jump if this value is false.
    JumpIfFalse {
        target: Label,
    },
    /// Pop the top of the stack, and jump if this value is true.
    JumpIfTrue {
        target: Label,
    },
    GetIter,
    /// Advance the iterator at TOS; push the next value, or pop the iterator
    /// and jump to `target` when it is exhausted.
    ForIter {
        target: Label,
    },

    /// Setup an exception handler; entered with the raised value pushed.
    SetupExcept {
        handler: Label,
    },
    /// Setup a finally handler, which will be called whenever one of this
    /// events occurs:
    /// - the block is popped
    /// - the function returns
    /// - an exception is raised
    SetupFinally {
        handler: Label,
    },
    /// Enter a finally block, without returning or excepting, just because we
    /// are there.
    EnterFinally,
    /// Marker bytecode for the end of a finally sequence: continue, return or
    /// re-raise depending on why the finally handler was entered.
    EndFinally,
    PopBlock,
    PopException,
    Raise {
        kind: RaiseKind,
    },

    MakeFunction(MakeFunctionFlags),
    /// Legacy call (revisions 1.0/1.1): pops `nargs` arguments and the
    /// callee.
    CallFunctionPositional {
        nargs: u32,
    },
    /// Legacy bound-method call: pops `nargs` arguments and the bound method
    /// pushed by [`Instruction::LoadMethod`].
    CallMethodPositional {
        nargs: u32,
    },
    /// Variadic call: pops kwargs mapping (if `has_kwargs`), args tuple and
    /// the callee (plus a trailing call-protocol sentinel when present).
    CallFunctionEx {
        has_kwargs: bool,
    },
    /// Call-setup hint emitted by revision 1.2 code; a no-op at runtime.
    Precall {
        nargs: u32,
    },
    /// 1.2+ call: pops `nargs` arguments, the callee and the trailing
    /// call-protocol sentinel when present.
    Call {
        nargs: u32,
    },

    ReturnValue,
    ReturnConst {
        idx: u32,
    },
    YieldValue,
    /// Function prologue marker emitted since revision 1.2, for ordinary
    /// functions and generators alike. A no-op at runtime.
    Resume {
        arg: u32,
    },
    /// Generator prologue marker of revisions 1.0/1.1; generator bodies begin
    /// with it. A no-op at runtime.
    GenStart,
    Nop,
}

impl Instruction {
    /// Gets the label stored inside this instruction, if it exists.
    pub const fn label_arg(&self) -> Option<&Label> {
        match self {
            Self::Jump { target: l }
            | Self::JumpBackward { target: l }
            | Self::JumpIfFalse { target: l }
            | Self::JumpIfTrue { target: l }
            | Self::ForIter { target: l }
            | Self::SetupExcept { handler: l }
            | Self::SetupFinally { handler: l } => Some(l),
            _ => None,
        }
    }

    pub fn label_arg_mut(&mut self) -> Option<&mut Label> {
        match self {
            Self::Jump { target: l }
            | Self::JumpBackward { target: l }
            | Self::JumpIfFalse { target: l }
            | Self::JumpIfTrue { target: l }
            | Self::ForIter { target: l }
            | Self::SetupExcept { handler: l }
            | Self::SetupFinally { handler: l } => Some(l),
            _ => None,
        }
    }

    /// Whether this is an unconditional branching
    ///
    /// # Examples
    ///
    /// ```
    /// use molt_bytecode::{Instruction, Label};
    /// let jump_inst = Instruction::Jump { target: Label(0) };
    /// assert!(jump_inst.unconditional_branch())
    /// ```
    pub const fn unconditional_branch(&self) -> bool {
        matches!(
            self,
            Self::Jump { .. }
                | Self::JumpBackward { .. }
                | Self::ReturnValue
                | Self::ReturnConst { .. }
                | Self::Raise { .. }
        )
    }

    /// Whether this instruction leaves the function.
    pub const fn is_return(&self) -> bool {
        matches!(self, Self::ReturnValue | Self::ReturnConst { .. })
    }

    /// Whether this instruction is a loop re-entry edge.
    pub const fn is_backward_jump(&self) -> bool {
        matches!(self, Self::JumpBackward { .. })
    }
}
