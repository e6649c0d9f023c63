//! Implement the Molt virtual machine's bytecode structure: code objects,
//! the flat executable instruction form, and the normalized instruction
//! sequence used for code rewriting.

mod code;
mod instruction;
pub mod marshal;
pub mod seq;

pub use code::{CodeFlags, CodeMetadata, CodeObject, ConstantData};
pub use instruction::{
    BinaryOperator, ComparisonOperator, Instruction, Label, MakeFunctionFlags, NameIdx, RaiseKind,
    UnaryOperator,
};
pub use marshal::MarshalError;
pub use seq::{InstructionSeq, SeqItem, SeqLabel};
