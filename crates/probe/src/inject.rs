//! Splices generated fragments into existing units: at the function entry
//! point (after the variant's fixed prologue) or at a source line. Both
//! produce a new unit; the input is never touched and all non-instruction
//! metadata travels through verbatim.

use molt_bytecode::{CodeObject, ConstantData, Instruction, InstructionSeq, SeqItem};

use crate::abi::AbiVariant;
use crate::codegen::CodeGenerator;

/// Insert a call of `method` on host object `host` at the entry point of
/// `code`: for legacy (V1) units directly before the first instruction (or,
/// for generator bodies, after the `GenStart` prologue), and for V2/V3 units
/// after the first `Resume` marker. Returns the derived unit and whether the
/// fragment was placed (a V2/V3 unit with no prologue marker is left alone).
pub fn inject_entry(
    gen: &CodeGenerator,
    code: &CodeObject,
    host: u32,
    method: &str,
) -> (CodeObject, bool) {
    let mut seq = InstructionSeq::from_code(code);

    let after_marker = |marker: fn(&Instruction) -> bool| {
        seq.items.iter().position(|item| match item {
            SeqItem::Instr { op, .. } => marker(op),
            SeqItem::Label(_) => false,
        })
    };
    let insert_at = match gen.variant() {
        AbiVariant::V1 if code.is_generator() => {
            after_marker(|op| matches!(op, Instruction::GenStart)).map(|i| i + 1)
        }
        AbiVariant::V1 => Some(0),
        AbiVariant::V2 | AbiVariant::V3 => {
            after_marker(|op| matches!(op, Instruction::Resume { .. })).map(|i| i + 1)
        }
    };

    let Some(at) = insert_at else {
        log::warn!(
            "no entry prologue marker in {}; skipping entry injection",
            code.obj_name
        );
        return (seq.assemble(), false);
    };
    let line = line_at(&seq.items, at).unwrap_or(code.first_line_number);
    let fragment = gen.host_method_call(&mut seq, host, method, line);
    seq.insert_before(at, fragment);
    (seq.assemble(), true)
}

/// Insert a site notification so it fires when execution leaves `line`:
/// before the first instruction after the target line has been passed, or,
/// when the line ends in a return or a loop re-entry jump, before that edge
/// instruction so the line's own evaluation completes first. Nested units
/// embedded as constants are searched first with the same site id, since the
/// line may live inside a closure body. At most one position in the whole
/// tree is instrumented: once a nested unit takes the placement, the
/// enclosing unit and any remaining siblings are left alone.
pub fn inject_at_line(
    gen: &CodeGenerator,
    code: &CodeObject,
    host: u32,
    site_id: i64,
    line: u32,
) -> (CodeObject, bool) {
    let mut seq = InstructionSeq::from_code(code);
    let mut injected = false;

    for constant in &mut seq.constants {
        if injected {
            break;
        }
        if let ConstantData::Code { code: nested } = constant {
            let (new_nested, nested_injected) = inject_at_line(gen, nested, host, site_id, line);
            *nested = Box::new(new_nested);
            injected = nested_injected;
        }
    }

    if !injected {
        let mut last_line = 0u32;
        let mut insert_at = None;
        for (i, item) in seq.items.iter().enumerate() {
            let SeqItem::Instr { op, line: cur } = item else {
                continue;
            };
            // the target line produced no instruction of its own; fire as
            // soon as control has passed it
            if last_line != 0 && last_line >= line && *cur != last_line {
                insert_at = Some(i);
                break;
            }
            // the line's control-flow edge: fire after its evaluation
            if *cur == line && (op.is_return() || op.is_backward_jump()) {
                insert_at = Some(i);
                break;
            }
            if *cur != 0 {
                last_line = *cur;
            }
        }

        if let Some(at) = insert_at {
            let fragment = gen.site_notify(&mut seq, host, site_id, line);
            seq.insert_before(at, fragment);
            injected = true;
        }
    }
    (seq.assemble(), injected)
}

fn line_at(items: &[SeqItem], from: usize) -> Option<u32> {
    items[from..].iter().find_map(|item| match item {
        SeqItem::Instr { line, .. } if *line != 0 => Some(*line),
        _ => None,
    })
}
