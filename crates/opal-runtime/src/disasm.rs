//! Bytecode disassembler
//!
//! Renders a chunk as text for debugging and tests. Offsets are walked with
//! `op_arg_size`, so the variable-length `Closure` instruction and the
//! compile-time placeholder opcodes render faithfully.

use std::fmt::Write;

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;
use crate::value::Value;

/// Disassemble a whole chunk under a heading
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

/// Disassemble one instruction; returns the offset of the next
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let Ok(op) = OpCode::try_from(chunk.code[offset]) else {
        let _ = writeln!(out, "Unknown opcode {}", chunk.code[offset]);
        return offset + 1;
    };

    match op {
        OpCode::Constant => constant_instruction(heap, chunk, "Constant", offset, out),
        OpCode::GetGlobal => constant_instruction(heap, chunk, "GetGlobal", offset, out),
        OpCode::DefineGlobal => constant_instruction(heap, chunk, "DefineGlobal", offset, out),
        OpCode::SetGlobal => constant_instruction(heap, chunk, "SetGlobal", offset, out),
        OpCode::GetProperty => constant_instruction(heap, chunk, "GetProperty", offset, out),
        OpCode::SetProperty => constant_instruction(heap, chunk, "SetProperty", offset, out),
        OpCode::GetSuper => constant_instruction(heap, chunk, "GetSuper", offset, out),
        OpCode::Class => constant_instruction(heap, chunk, "Class", offset, out),
        OpCode::Method => constant_instruction(heap, chunk, "Method", offset, out),

        OpCode::GetLocal => byte_instruction(chunk, "GetLocal", offset, out),
        OpCode::SetLocal => byte_instruction(chunk, "SetLocal", offset, out),
        OpCode::GetUpvalue => byte_instruction(chunk, "GetUpvalue", offset, out),
        OpCode::SetUpvalue => byte_instruction(chunk, "SetUpvalue", offset, out),
        OpCode::Call => byte_instruction(chunk, "Call", offset, out),

        OpCode::Jump => jump_instruction(chunk, "Jump", 1, offset, out),
        OpCode::JumpIfFalse => jump_instruction(chunk, "JumpIfFalse", 1, offset, out),
        OpCode::Loop => jump_instruction(chunk, "Loop", -1, offset, out),
        OpCode::Break => jump_instruction(chunk, "Break (placeholder)", 1, offset, out),
        OpCode::Continue => jump_instruction(chunk, "Continue (placeholder)", 1, offset, out),
        OpCode::CaseFallthrough => {
            jump_instruction(chunk, "CaseFallthrough (placeholder)", 1, offset, out)
        }

        OpCode::Invoke => invoke_instruction(heap, chunk, "Invoke", offset, out),
        OpCode::SuperInvoke => invoke_instruction(heap, chunk, "SuperInvoke", offset, out),

        OpCode::Closure => closure_instruction(heap, chunk, offset, out),

        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::GetIndex
        | OpCode::SetIndex
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Return
        | OpCode::Inherit
        | OpCode::ArrayEmpty
        | OpCode::ArrayPush
        | OpCode::ArrayRange => simple_instruction(op, offset, out),
    }
}

fn simple_instruction(op: OpCode, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{:?}", op);
    offset + 1
}

fn constant_instruction(
    heap: &Heap,
    chunk: &Chunk,
    name: &str,
    offset: usize,
    out: &mut String,
) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    let rendered = render_constant(heap, chunk.constants.get(constant));
    let _ = writeln!(out, "{:<16} {:4} '{}'", name, constant, rendered);
    offset + 2
}

fn byte_instruction(chunk: &Chunk, name: &str, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{:<16} {:4}", name, slot);
    offset + 2
}

fn jump_instruction(
    chunk: &Chunk,
    name: &str,
    sign: i64,
    offset: usize,
    out: &mut String,
) -> usize {
    let jump = i64::from(chunk.read_u16(offset + 1));
    let target = offset as i64 + 3 + sign * jump;
    let _ = writeln!(out, "{:<16} {:4} -> {}", name, offset, target);
    offset + 3
}

fn invoke_instruction(
    heap: &Heap,
    chunk: &Chunk,
    name: &str,
    offset: usize,
    out: &mut String,
) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    let argc = chunk.code[offset + 2];
    let rendered = render_constant(heap, chunk.constants.get(constant));
    let _ = writeln!(out, "{:<16} ({} args) {:4} '{}'", name, argc, constant, rendered);
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    let rendered = render_constant(heap, chunk.constants.get(constant));
    let _ = writeln!(out, "{:<16} {:4} {}", "Closure", constant, rendered);

    let upvalue_count = chunk
        .constants
        .get(constant)
        .and_then(|value| value.as_obj())
        .and_then(|handle| heap.as_function(handle))
        .map(|f| f.upvalue_count)
        .unwrap_or(0);

    let mut cursor = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[cursor] != 0;
        let index = chunk.code[cursor + 1];
        let _ = writeln!(
            out,
            "{:04}    |                     {} {}",
            cursor,
            if is_local { "local" } else { "upvalue" },
            index
        );
        cursor += 2;
    }
    cursor
}

fn render_constant(heap: &Heap, value: Option<&Value>) -> String {
    match value {
        Some(value) => heap.display(*value),
        None => "<missing>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_config::GcConfig;

    #[test]
    fn test_disassembles_constants_and_simple_ops() {
        let heap = Heap::new(GcConfig::default());
        let mut chunk = Chunk::new();
        let index = chunk.add_constant(Value::Number(1.5)).expect("room");
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(index, 1);
        chunk.write_op(OpCode::Negate, 1);
        chunk.write_op(OpCode::Return, 2);

        let text = disassemble_chunk(&heap, &chunk, "test");
        assert!(text.contains("== test =="));
        assert!(text.contains("Constant"));
        assert!(text.contains("'1.5'"));
        assert!(text.contains("Negate"));
        assert!(text.contains("Return"));
        // Same-line instructions render the continuation marker
        assert!(text.contains("   | "));
    }

    #[test]
    fn test_jump_targets() {
        let heap = Heap::new(GcConfig::default());
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0x00, 1);
        chunk.write(0x02, 1);
        let text = disassemble_chunk(&heap, &chunk, "jumps");
        assert!(text.contains("Jump"));
        assert!(text.contains("-> 5"));
    }
}
