//! Emits the literal instruction sequences instrumentation splices into user
//! code, per ABI variant. Three logical operations exist: call a zero-argument
//! method on a host object, notify a handler of a site id, and forward an
//! entire call to a handler (the trampoline body). All dispatch on the
//! variant happens here.

use molt_bytecode::{
    CodeFlags, CodeMetadata, CodeObject, ConstantData, Instruction, InstructionSeq, SeqItem,
};
use molt_vm::RuntimeVersion;

use crate::abi::{AbiError, AbiVariant};

#[derive(Debug, Clone, Copy)]
pub struct CodeGenerator {
    variant: AbiVariant,
}

impl CodeGenerator {
    pub fn new(variant: AbiVariant) -> Self {
        Self { variant }
    }

    pub fn detect(version: RuntimeVersion) -> Result<Self, AbiError> {
        AbiVariant::detect(version).map(Self::new)
    }

    pub fn variant(&self) -> AbiVariant {
        self.variant
    }

    /// Fragment calling zero-argument method `method` on host object `host`
    /// and discarding the result. Constants and names are interned into
    /// `seq`; all emitted instructions carry `line`.
    pub fn host_method_call(
        &self,
        seq: &mut InstructionSeq,
        host: u32,
        method: &str,
        line: u32,
    ) -> Vec<SeqItem> {
        let host_idx = seq.add_const(ConstantData::HostRef { id: host });
        let method_idx = seq.add_name(method);
        let ops = match self.variant {
            AbiVariant::V1 => vec![
                Instruction::LoadConst { idx: host_idx },
                Instruction::LoadMethod { idx: method_idx },
                Instruction::CallMethodPositional { nargs: 0 },
                Instruction::Pop,
            ],
            AbiVariant::V2 => vec![
                Instruction::LoadConst { idx: host_idx },
                Instruction::LoadMethod { idx: method_idx },
                Instruction::Precall { nargs: 0 },
                Instruction::Call { nargs: 0 },
                Instruction::Pop,
            ],
            AbiVariant::V3 => vec![
                Instruction::LoadConst { idx: host_idx },
                Instruction::LoadAttr {
                    idx: method_idx,
                    method: true,
                },
                Instruction::Call { nargs: 0 },
                Instruction::Pop,
            ],
        };
        at_line(ops, line)
    }

    /// Fragment calling handler `host` with a single integer site id and
    /// discarding the result.
    pub fn site_notify(
        &self,
        seq: &mut InstructionSeq,
        host: u32,
        site_id: i64,
        line: u32,
    ) -> Vec<SeqItem> {
        let host_idx = seq.add_const(ConstantData::HostRef { id: host });
        let site_idx = seq.add_const(ConstantData::Integer { value: site_id });
        let ops = match self.variant {
            AbiVariant::V1 => vec![
                Instruction::LoadConst { idx: host_idx },
                Instruction::LoadConst { idx: site_idx },
                Instruction::CallFunctionPositional { nargs: 1 },
                Instruction::Pop,
            ],
            AbiVariant::V2 => vec![
                Instruction::LoadConst { idx: host_idx },
                Instruction::LoadConst { idx: site_idx },
                Instruction::Precall { nargs: 1 },
                Instruction::Call { nargs: 1 },
                Instruction::Pop,
            ],
            AbiVariant::V3 => vec![
                Instruction::LoadConst { idx: host_idx },
                Instruction::PushNull,
                Instruction::LoadConst { idx: site_idx },
                Instruction::Call { nargs: 1 },
                Instruction::Pop,
            ],
        };
        at_line(ops, line)
    }

    /// A standalone unit that forwards every positional and keyword argument
    /// to handler `host` and returns its result. Name, source location and
    /// the cell/free variable lists are taken from `original` so the new
    /// unit can replace its body; everything else is the fixed variadic
    /// forwarding shape.
    pub fn trampoline(&self, host: u32, original: &CodeObject) -> CodeObject {
        let meta = CodeMetadata {
            flags: CodeFlags::NEW_LOCALS | CodeFlags::HAS_VARARGS | CodeFlags::HAS_VARKEYWORDS,
            arg_count: 0,
            varnames: vec!["args".to_owned(), "kwargs".to_owned()],
            cellvars: original.cellvars.to_vec(),
            freevars: original.freevars.to_vec(),
            cell2arg: None,
            source_path: original.source_path.clone(),
            first_line_number: original.first_line_number,
            obj_name: original.obj_name.clone(),
            qualname: original.qualname.clone(),
        };
        let mut seq = InstructionSeq::new(meta);
        let host_idx = seq.add_const(ConstantData::HostRef { id: host });

        let mut ops = Vec::with_capacity(9);
        match self.variant {
            AbiVariant::V1 => {
                ops.push(Instruction::LoadConst { idx: host_idx });
            }
            AbiVariant::V2 => {
                ops.push(Instruction::Resume { arg: 0 });
                ops.push(Instruction::PushNull);
                ops.push(Instruction::LoadConst { idx: host_idx });
            }
            AbiVariant::V3 => {
                ops.push(Instruction::Resume { arg: 0 });
                ops.push(Instruction::LoadConst { idx: host_idx });
                ops.push(Instruction::PushNull);
            }
        }
        ops.extend([
            Instruction::LoadFast(0),
            Instruction::BuildMap { size: 0 },
            Instruction::LoadFast(1),
            Instruction::DictMerge,
            Instruction::CallFunctionEx { has_kwargs: true },
            Instruction::ReturnValue,
        ]);
        seq.items = at_line(ops, original.first_line_number);
        seq.assemble()
    }
}

fn at_line(ops: Vec<Instruction>, line: u32) -> Vec<SeqItem> {
    ops.into_iter()
        .map(|op| SeqItem::Instr { op, line })
        .collect()
}
