use std::fmt;

use bitflags::bitflags;
use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::instruction::Instruction;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct CodeFlags: u16 {
        const NEW_LOCALS = 0x01;
        const IS_GENERATOR = 0x02;
        const HAS_VARARGS = 0x04;
        const HAS_VARKEYWORDS = 0x08;
    }
}

impl Serialize for CodeFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CodeFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u16::deserialize(deserializer).map(Self::from_bits_truncate)
    }
}

/// A constant (which usually encapsulates data within it)
///
/// # Examples
/// ```
/// use molt_bytecode::ConstantData;
/// let a = ConstantData::Float { value: 120f64 };
/// let b = ConstantData::Boolean { value: false };
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstantData {
    None,
    Boolean { value: bool },
    Integer { value: i64 },
    Float { value: f64 },
    Str { value: String },
    Tuple { elements: Vec<ConstantData> },
    Code { code: Box<CodeObject> },
    /// Index into the owning VM's host-object registry. Generated
    /// instrumentation code references live engine objects through this;
    /// the id only means something to the VM that allocated it.
    HostRef { id: u32 },
}

impl fmt::Display for ConstantData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Boolean { value } => write!(f, "{value}"),
            Self::Integer { value } => write!(f, "{value}"),
            Self::Float { value } => write!(f, "{value}"),
            Self::Str { value } => write!(f, "{value:?}"),
            Self::Tuple { elements } => {
                write!(f, "({})", elements.iter().format(", "))
            }
            Self::Code { code } => write!(f, "<code object {}>", code.obj_name),
            Self::HostRef { id } => write!(f, "<host ref #{id}>"),
        }
    }
}

/// Primary container of a single code object. Each molt function has a code
/// object; instrumentation never mutates one in place but derives a new one.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    pub instructions: Box<[Instruction]>,
    /// Source line of each instruction, parallel to `instructions`; 0 means
    /// no line information.
    pub lines: Box<[u32]>,
    pub flags: CodeFlags,
    pub arg_count: u32,
    pub constants: Box<[ConstantData]>,
    pub names: Box<[String]>,
    pub varnames: Box<[String]>,
    pub cellvars: Box<[String]>,
    pub freevars: Box<[String]>,
    /// For each cellvar, the argument index it shadows, or -1.
    pub cell2arg: Option<Box<[i32]>>,
    pub source_path: String,
    pub first_line_number: u32,
    /// Name of the object that created this code object.
    pub obj_name: String,
    pub qualname: String,
}

impl CodeObject {
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::IS_GENERATOR)
    }

    /// The non-instruction metadata of this unit, copied verbatim across
    /// rewrites.
    pub fn metadata(&self) -> CodeMetadata {
        CodeMetadata {
            flags: self.flags,
            arg_count: self.arg_count,
            varnames: self.varnames.to_vec(),
            cellvars: self.cellvars.to_vec(),
            freevars: self.freevars.to_vec(),
            cell2arg: self.cell2arg.clone(),
            source_path: self.source_path.clone(),
            first_line_number: self.first_line_number,
            obj_name: self.obj_name.clone(),
            qualname: self.qualname.clone(),
        }
    }

    /// The source line of the last instruction, i.e. an upper bound of the
    /// line span this unit covers. Used by resolvers; 0 when the unit has no
    /// line information at all.
    pub fn last_line(&self) -> u32 {
        self.lines.iter().copied().max().unwrap_or(0)
    }

    fn display_inner(
        &self,
        f: &mut fmt::Formatter<'_>,
        expand_code_objects: bool,
        level: usize,
    ) -> fmt::Result {
        let indent = "  ".repeat(level);
        let mut last_line = u32::MAX;
        for (offset, (instruction, &line)) in
            self.instructions.iter().zip(self.lines.iter()).enumerate()
        {
            // optional line number
            if line != last_line && line != 0 {
                write!(f, "{line:>3}")?;
                last_line = line;
            } else {
                write!(f, "   ")?;
            }
            write!(f, "{indent}{offset:>5} ")?;
            match instruction {
                Instruction::LoadConst { idx } | Instruction::ReturnConst { idx } => {
                    let op = if matches!(instruction, Instruction::LoadConst { .. }) {
                        "LoadConst"
                    } else {
                        "ReturnConst"
                    };
                    match &self.constants[*idx as usize] {
                        ConstantData::Code { code } if expand_code_objects => {
                            writeln!(f, "{op} ({code:?}):")?;
                            code.display_inner(f, true, level + 1)?;
                        }
                        c => writeln!(f, "{op} ({c})")?,
                    }
                }
                other => writeln!(f, "{other:?}")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.display_inner(f, false, 0)?;
        for constant in &*self.constants {
            if let ConstantData::Code { code } = constant {
                writeln!(f, "\nDisassembly of {code:?}")?;
                code.fmt(f)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<code object {} at ??? file {:?}, line {}>",
            self.obj_name, self.source_path, self.first_line_number
        )
    }
}

/// Everything about a code object that is not its instruction sequence.
///
/// Rewrites thread this through unchanged; building a unit from scratch (the
/// trampoline) fills it in explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeMetadata {
    pub flags: CodeFlags,
    pub arg_count: u32,
    pub varnames: Vec<String>,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
    pub cell2arg: Option<Box<[i32]>>,
    pub source_path: String,
    pub first_line_number: u32,
    pub obj_name: String,
    pub qualname: String,
}
