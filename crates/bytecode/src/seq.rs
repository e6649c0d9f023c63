//! The normalized instruction sequence: a decoded, rewrite-friendly form of a
//! [`CodeObject`] in which jump targets are symbolic labels placed as items in
//! the stream, so instructions can be spliced in without re-targeting every
//! jump by hand. `from_code` and `assemble` round-trip a code object while
//! copying all non-instruction metadata verbatim.

use std::collections::HashMap;

use crate::code::{CodeMetadata, CodeObject, ConstantData};
use crate::instruction::{Instruction, Label, NameIdx};

/// A symbolic label id, local to one [`InstructionSeq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqLabel(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum SeqItem {
    /// An instruction together with its source line (0 = no line). Any
    /// `Label` field inside `op` holds a [`SeqLabel`] id, not an instruction
    /// index.
    Instr { op: Instruction, line: u32 },
    /// Marks the position the given label resolves to.
    Label(SeqLabel),
}

impl SeqItem {
    pub fn instr(&self) -> Option<(&Instruction, u32)> {
        match self {
            Self::Instr { op, line } => Some((op, *line)),
            Self::Label(_) => None,
        }
    }
}

/// A decoded code object: items plus the mutable constant/name tables a
/// rewrite may append to, plus the verbatim metadata.
#[derive(Debug, Clone)]
pub struct InstructionSeq {
    pub items: Vec<SeqItem>,
    pub constants: Vec<ConstantData>,
    pub names: Vec<String>,
    pub meta: CodeMetadata,
    next_label: u32,
}

impl InstructionSeq {
    /// Build an empty sequence for a unit assembled from scratch.
    pub fn new(meta: CodeMetadata) -> Self {
        Self {
            items: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            meta,
            next_label: 0,
        }
    }

    /// Decode a code object. Every instruction index that is the target of
    /// some jump gets a fresh symbolic label placed immediately before the
    /// instruction at that index.
    pub fn from_code(code: &CodeObject) -> Self {
        let mut targets: Vec<u32> = code
            .instructions
            .iter()
            .filter_map(|i| i.label_arg().map(|l| l.0))
            .collect();
        targets.sort_unstable();
        targets.dedup();

        let mut label_at: HashMap<u32, SeqLabel> = HashMap::with_capacity(targets.len());
        for (n, idx) in targets.iter().enumerate() {
            label_at.insert(*idx, SeqLabel(n as u32));
        }

        let mut items = Vec::with_capacity(code.instructions.len() + targets.len());
        for (idx, (instruction, &line)) in code
            .instructions
            .iter()
            .zip(code.lines.iter())
            .enumerate()
        {
            if let Some(&label) = label_at.get(&(idx as u32)) {
                items.push(SeqItem::Label(label));
            }
            let mut op = instruction.clone();
            if let Some(l) = op.label_arg_mut() {
                *l = Label(label_at[&l.0].0);
            }
            items.push(SeqItem::Instr { op, line });
        }
        // a jump just past the end is legal (e.g. loop exit at the tail)
        if let Some(&label) = label_at.get(&(code.instructions.len() as u32)) {
            items.push(SeqItem::Label(label));
        }

        Self {
            items,
            constants: code.constants.to_vec(),
            names: code.names.to_vec(),
            meta: code.metadata(),
            next_label: targets.len() as u32,
        }
    }

    pub fn new_label(&mut self) -> SeqLabel {
        let label = SeqLabel(self.next_label);
        self.next_label += 1;
        label
    }

    /// Append a constant, reusing an existing equal entry.
    pub fn add_const(&mut self, constant: ConstantData) -> u32 {
        if let Some(idx) = self.constants.iter().position(|c| *c == constant) {
            return idx as u32;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    /// Append a name, reusing an existing equal entry.
    pub fn add_name(&mut self, name: &str) -> NameIdx {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return idx as NameIdx;
        }
        self.names.push(name.to_owned());
        (self.names.len() - 1) as NameIdx
    }

    /// Splice `fragment` into the stream so that it executes immediately
    /// before the item currently at `index`.
    pub fn insert_before(&mut self, index: usize, fragment: Vec<SeqItem>) {
        self.items.splice(index..index, fragment);
    }

    /// Resolve labels back to instruction indices and produce the executable
    /// form. Metadata travels through verbatim.
    pub fn assemble(self) -> CodeObject {
        let mut positions: HashMap<SeqLabel, u32> = HashMap::new();
        let mut pc = 0u32;
        for item in &self.items {
            match item {
                SeqItem::Label(l) => {
                    positions.insert(*l, pc);
                }
                SeqItem::Instr { .. } => pc += 1,
            }
        }

        let mut instructions = Vec::with_capacity(pc as usize);
        let mut lines = Vec::with_capacity(pc as usize);
        for item in self.items {
            if let SeqItem::Instr { mut op, line } = item {
                if let Some(l) = op.label_arg_mut() {
                    *l = Label(positions[&SeqLabel(l.0)]);
                }
                instructions.push(op);
                lines.push(line);
            }
        }

        let meta = self.meta;
        CodeObject {
            instructions: instructions.into_boxed_slice(),
            lines: lines.into_boxed_slice(),
            flags: meta.flags,
            arg_count: meta.arg_count,
            constants: self.constants.into_boxed_slice(),
            names: self.names.into_boxed_slice(),
            varnames: meta.varnames.into_boxed_slice(),
            cellvars: meta.cellvars.into_boxed_slice(),
            freevars: meta.freevars.into_boxed_slice(),
            cell2arg: meta.cell2arg,
            source_path: meta.source_path,
            first_line_number: meta.first_line_number,
            obj_name: meta.obj_name,
            qualname: meta.qualname,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeFlags;

    fn flat(instructions: Vec<Instruction>, lines: Vec<u32>) -> CodeObject {
        CodeObject {
            instructions: instructions.into_boxed_slice(),
            lines: lines.into_boxed_slice(),
            flags: CodeFlags::NEW_LOCALS,
            arg_count: 0,
            constants: Box::new([ConstantData::None]),
            names: Box::new([]),
            varnames: Box::new([]),
            cellvars: Box::new([]),
            freevars: Box::new([]),
            cell2arg: None,
            source_path: "<test>".to_owned(),
            first_line_number: 1,
            obj_name: "roundtrip".to_owned(),
            qualname: "roundtrip".to_owned(),
        }
    }

    #[test]
    fn roundtrip_preserves_jumps_and_lines() {
        let code = flat(
            vec![
                Instruction::LoadConst { idx: 0 },
                Instruction::JumpIfFalse { target: Label(4) },
                Instruction::LoadConst { idx: 0 },
                Instruction::Pop,
                Instruction::LoadConst { idx: 0 },
                Instruction::ReturnValue,
            ],
            vec![1, 1, 2, 2, 3, 3],
        );
        let seq = InstructionSeq::from_code(&code);
        let out = seq.assemble();
        assert_eq!(out.instructions, code.instructions);
        assert_eq!(out.lines, code.lines);
        assert_eq!(out.metadata(), code.metadata());
    }

    #[test]
    fn insertion_shifts_targets() {
        // jump over one instruction; inserting before the jump target must
        // keep the jump pointing at the original target instruction
        let code = flat(
            vec![
                Instruction::Jump { target: Label(2) },
                Instruction::Nop,
                Instruction::LoadConst { idx: 0 },
                Instruction::ReturnValue,
            ],
            vec![1, 1, 2, 2],
        );
        let mut seq = InstructionSeq::from_code(&code);
        // the label item sits between Nop and LoadConst; insert after it so
        // the new Nops run only when the jump is taken
        let at = seq
            .items
            .iter()
            .position(|i| matches!(i, SeqItem::Label(_)))
            .unwrap();
        seq.insert_before(
            at + 1,
            vec![
                SeqItem::Instr {
                    op: Instruction::Nop,
                    line: 0,
                },
                SeqItem::Instr {
                    op: Instruction::Nop,
                    line: 0,
                },
            ],
        );
        let out = seq.assemble();
        assert_eq!(out.instructions.len(), 6);
        assert_eq!(out.instructions[0], Instruction::Jump { target: Label(2) });
        assert_eq!(out.instructions[4], Instruction::LoadConst { idx: 0 });
    }

    #[test]
    fn backward_jump_roundtrip() {
        let code = flat(
            vec![
                Instruction::Nop,
                Instruction::LoadConst { idx: 0 },
                Instruction::JumpIfTrue { target: Label(4) },
                Instruction::JumpBackward { target: Label(0) },
                Instruction::ReturnConst { idx: 0 },
            ],
            vec![1, 2, 2, 2, 3],
        );
        let out = InstructionSeq::from_code(&code).assemble();
        assert_eq!(out.instructions, code.instructions);
    }
}
