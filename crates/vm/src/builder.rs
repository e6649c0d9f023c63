use std::sync::Arc;

use molt_bytecode::{
    CodeFlags, CodeMetadata, CodeObject, ConstantData, Instruction, InstructionSeq, Label, NameIdx,
    SeqItem, SeqLabel,
};

/// Assembles code objects by hand, with symbolic labels and source lines.
/// This is how embedders (and tests) produce units without a compiler.
pub struct CodeBuilder {
    seq: InstructionSeq,
    cell2arg: Vec<i32>,
    current_line: u32,
}

impl CodeBuilder {
    pub fn new(name: &str, params: &[&str]) -> Self {
        let meta = CodeMetadata {
            flags: CodeFlags::NEW_LOCALS,
            arg_count: params.len() as u32,
            varnames: params.iter().map(|p| (*p).to_owned()).collect(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            cell2arg: None,
            source_path: "<builder>".to_owned(),
            first_line_number: 1,
            obj_name: name.to_owned(),
            qualname: name.to_owned(),
        };
        Self {
            seq: InstructionSeq::new(meta),
            cell2arg: Vec::new(),
            current_line: 1,
        }
    }

    pub fn add_flags(&mut self, flags: CodeFlags) -> &mut Self {
        self.seq.meta.flags |= flags;
        self
    }

    /// Declare a non-parameter local slot.
    pub fn local(&mut self, name: &str) -> NameIdx {
        self.seq.meta.varnames.push(name.to_owned());
        (self.seq.meta.varnames.len() - 1) as NameIdx
    }

    /// Declare a cell variable; its index is valid for the deref
    /// instructions. Declare all cell variables before any free variable.
    pub fn cell_var(&mut self, name: &str) -> NameIdx {
        self.seq.meta.cellvars.push(name.to_owned());
        self.cell2arg.push(-1);
        (self.seq.meta.cellvars.len() - 1) as NameIdx
    }

    /// Declare a cell variable initialized from parameter `param`.
    pub fn capture_param(&mut self, name: &str, param: u32) -> NameIdx {
        let idx = self.cell_var(name);
        self.cell2arg[idx as usize] = param as i32;
        idx
    }

    /// Declare a free variable (filled from the closure at call time).
    pub fn free_var(&mut self, name: &str) -> NameIdx {
        self.seq.meta.freevars.push(name.to_owned());
        (self.seq.meta.cellvars.len() + self.seq.meta.freevars.len() - 1) as NameIdx
    }

    pub fn constant(&mut self, constant: ConstantData) -> u32 {
        self.seq.add_const(constant)
    }

    pub fn name(&mut self, name: &str) -> NameIdx {
        self.seq.add_name(name)
    }

    pub fn label(&mut self) -> SeqLabel {
        self.seq.new_label()
    }

    /// The `Label` form of a symbolic label, for jump operands.
    pub fn target(&self, label: SeqLabel) -> Label {
        Label(label.0)
    }

    pub fn set_line(&mut self, line: u32) -> &mut Self {
        self.current_line = line;
        self
    }

    pub fn emit(&mut self, op: Instruction) -> &mut Self {
        self.seq.items.push(SeqItem::Instr {
            op,
            line: self.current_line,
        });
        self
    }

    pub fn mark(&mut self, label: SeqLabel) -> &mut Self {
        self.seq.items.push(SeqItem::Label(label));
        self
    }

    /// Emit `LoadConst` for the given constant.
    pub fn load_const(&mut self, constant: ConstantData) -> &mut Self {
        let idx = self.constant(constant);
        self.emit(Instruction::LoadConst { idx })
    }

    /// Emit `ReturnConst` for the given constant.
    pub fn return_const(&mut self, constant: ConstantData) -> &mut Self {
        let idx = self.constant(constant);
        self.emit(Instruction::ReturnConst { idx })
    }

    pub fn finish(mut self) -> Arc<CodeObject> {
        if self.cell2arg.iter().any(|a| *a >= 0) {
            self.seq.meta.cell2arg = Some(self.cell2arg.into_boxed_slice());
        }
        Arc::new(self.seq.assemble())
    }
}
